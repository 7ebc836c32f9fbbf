use crate::utils::align_up;
use std::collections::BTreeMap;

const APERTURE_PAGE: u64 = 4096;

/// A managed range of virtual address space.
///
/// Every reservation is surrounded by `guard_pages` unmapped pages on each side so that
/// neighbouring windows never touch.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Tracks occupied ranges including guards: Start Address -> Size
    allocations: BTreeMap<u64, u64>,
}

impl Aperture {
    /// `limit` is inclusive.
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align: align.max(1),
            guard_pages,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Reserve `size` bytes anywhere in the aperture.
    pub fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64> {
        self.allocate_va_in(size, align, self.base, self.limit)
    }

    /// Reserve `size` bytes whose every byte lies in `[min, max]`.
    ///
    /// First fit: walks the occupied ranges in address order and takes the first hole.
    pub fn allocate_va_in(&mut self, size: u64, align: u64, min: u64, max: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(self.align);
        let guard = self.guard_pages * APERTURE_PAGE;
        let lo = min.max(self.base);
        let hi = max.min(self.limit);

        let fits = |addr: u64| -> bool { addr.checked_add(size - 1).is_some_and(|end| end <= hi) };

        // Guards may sit below the requested window, never below the aperture.
        let mut cursor = lo.saturating_sub(guard).max(self.base);
        for (&start, &len) in &self.allocations {
            let addr = align_up(cursor.checked_add(guard)?, align);
            if fits(addr) && addr.checked_add(size + guard).is_some_and(|end| end <= start) {
                self.allocations.insert(addr - guard, size + 2 * guard);
                return Some(addr);
            }
            cursor = cursor.max(start + len);
        }

        let addr = align_up(cursor.checked_add(guard)?, align);
        if fits(addr) {
            self.allocations.insert(addr - guard, size + 2 * guard);
            return Some(addr);
        }

        None
    }

    /// Release a reservation. Returns `false` if `addr` was not handed out by this aperture.
    pub fn free_va(&mut self, addr: u64) -> bool {
        let guard = self.guard_pages * APERTURE_PAGE;
        // The tracked start is the address MINUS the guard page we added
        let tracked = addr.wrapping_sub(guard);

        if self.allocations.remove(&tracked).is_none() {
            log::error!("Aperture: tried to free VA 0x{addr:x} which was not tracked");
            return false;
        }
        true
    }
}
