#![allow(clippy::cast_possible_truncation)]

//! Host-backed allocator.
//!
//! Implements [`MemoryAllocator`] over anonymous `mmap` memory. Physical allocations are real
//! host pages, virtual windows come from per-context [`Aperture`]s and physical addresses are
//! synthesized per location. Used to run surfaces without a device and to exercise failure paths
//! through fault injection.

use crate::error::{SurfaceError, SurfaceResult};
use crate::rm::aperture::Aperture;
use crate::rm::attrs::{AddressRange, Location};
use crate::rm::device::{
    DeviceCaps, Handle, MapFlags, MapRequest, MemoryAllocator, PhysicalBlock, PhysicalRequest,
    VirtualBlock, VirtualRequest,
};
use crate::utils::{align_up, is_pow2};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Synthesized physical address bases per location
const FB_PHYS_BASE: u64 = 0x0000_0001_0000_0000;
const SYSMEM_PHYS_BASE: u64 = 0x0000_8000_0000_0000;

const HOST_PAGE: u64 = 4096;
const HOST_GUARD_PAGES: u64 = 1;

/// Configuration of the simulated device behind a [`HostAllocator`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub caps: DeviceCaps,
    pub vidmem_bytes: u64,
    pub sysmem_bytes: u64,
    /// Per-context virtual aperture, `va_limit` inclusive.
    pub va_base: u64,
    pub va_limit: u64,
    /// When set, pitch surfaces get their pitch rounded up to this value.
    pub pitch_align: Option<u64>,
    /// Fail every physical allocation once this many have succeeded.
    pub fail_physical_after: Option<usize>,
    /// Fail every virtual-to-physical map once this many have succeeded.
    pub fail_map_after: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            caps: DeviceCaps::DISCRETE_GPU,
            vidmem_bytes: 256 * 1024 * 1024,
            sysmem_bytes: 256 * 1024 * 1024,
            va_base: 0x0000_0010_0000_0000,
            va_limit: 0x0000_7fff_ffff_ffff,
            pitch_align: None,
            fail_physical_after: None,
            fail_map_after: None,
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_pitch_align(mut self, align: u64) -> Self {
        self.pitch_align = Some(align);
        self
    }

    #[must_use]
    pub const fn fail_physical_after(mut self, count: usize) -> Self {
        self.fail_physical_after = Some(count);
        self
    }

    #[must_use]
    pub const fn fail_map_after(mut self, count: usize) -> Self {
        self.fail_map_after = Some(count);
        self
    }
}

// ===============================================================================================
// Backing Store
// ===============================================================================================

/// Anonymous private mapping standing in for device or system pages.
#[derive(Debug)]
struct Backing {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory owned by this struct; access is serialized by the allocator mutex
// and by the single CPU window rule of the surfaces using it.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    fn new(len: usize) -> io::Result<Self> {
        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(ret.cast::<u8>())
            .map(|ptr| Self { ptr, len })
            .ok_or_else(|| io::Error::other("mmap returned null"))
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            log::error!(
                "HostAllocator: munmap of {} bytes failed: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

// ===============================================================================================
// Bookkeeping
// ===============================================================================================

#[derive(Debug)]
struct PhysEntry {
    backing: Arc<Backing>,
    size: u64,
    location: Location,
    phys_base: u64,
    raw_flags: u32,
    context: u32,
    duplicate_of: Option<Handle>,
}

#[derive(Debug, Clone, Copy)]
struct VirtEntry {
    context: u32,
    address: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct MapEntry {
    phys: Handle,
    size: u64,
    flags: MapFlags,
    peer_link: Option<u32>,
    implicit_va: bool,
}

#[derive(Debug, Default)]
struct State {
    next_handle: Handle,
    phys: HashMap<Handle, PhysEntry>,
    virt: HashMap<Handle, VirtEntry>,
    // (context, address) -> binding
    maps: BTreeMap<(u32, u64), MapEntry>,
    apertures: HashMap<u32, Aperture>,
    cpu_windows: usize,
    vidmem_used: u64,
    sysmem_used: u64,
    next_fb_pa: u64,
    next_sys_pa: u64,
    physical_allocs: usize,
    virtual_allocs: usize,
    map_calls: usize,
}

impl State {
    fn new_handle(&mut self) -> Handle {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Allocator backend running entirely in host memory.
#[derive(Debug)]
pub struct HostAllocator {
    config: HostConfig,
    state: Mutex<State>,
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl HostAllocator {
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        let state = State {
            next_handle: 0x100,
            next_fb_pa: FB_PHYS_BASE,
            next_sys_pa: SYSMEM_PHYS_BASE,
            ..State::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn aperture<'s>(&self, state: &'s mut State, context: u32) -> &'s mut Aperture {
        let (base, limit) = (self.config.va_base, self.config.va_limit);
        state
            .apertures
            .entry(context)
            .or_insert_with(|| Aperture::new(base, limit, HOST_PAGE, HOST_GUARD_PAGES))
    }

    // -------------------------------------------------------------------------------------------
    // Introspection (tests and diagnostics)
    // -------------------------------------------------------------------------------------------

    /// Physical and duplicate handles currently alive.
    #[must_use]
    pub fn live_physical(&self) -> usize {
        self.state().phys.len()
    }

    #[must_use]
    pub fn live_virtual(&self) -> usize {
        self.state().virt.len()
    }

    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.state().maps.len()
    }

    #[must_use]
    pub fn live_cpu_windows(&self) -> usize {
        self.state().cpu_windows
    }

    /// Successful physical allocations since creation.
    #[must_use]
    pub fn physical_allocations(&self) -> usize {
        self.state().physical_allocs
    }

    /// Successful virtual allocations since creation.
    #[must_use]
    pub fn virtual_allocations(&self) -> usize {
        self.state().virtual_allocs
    }

    #[must_use]
    pub fn raw_flags(&self, handle: Handle) -> Option<u32> {
        self.state().phys.get(&handle).map(|p| p.raw_flags)
    }

    #[must_use]
    pub fn location_of(&self, handle: Handle) -> Option<Location> {
        self.state().phys.get(&handle).map(|p| p.location)
    }

    /// Flags and peer link of the binding at `address` in `context`.
    #[must_use]
    pub fn mapping_info(&self, context: u32, address: u64) -> Option<(MapFlags, Option<u32>)> {
        self.state()
            .maps
            .get(&(context, address))
            .map(|m| (m.flags, m.peer_link))
    }

    #[must_use]
    pub fn owner_context(&self, handle: Handle) -> Option<u32> {
        let state = self.state();
        state
            .phys
            .get(&handle)
            .map(|p| p.context)
            .or_else(|| state.virt.get(&handle).map(|v| v.context))
    }

    // -------------------------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------------------------

    fn check_location(&self, location: Location) -> SurfaceResult<()> {
        let caps = self.config.caps;
        let supported = match location {
            Location::Framebuffer => caps.contains(DeviceCaps::VIDMEM),
            Location::Coherent => caps.contains(DeviceCaps::COHERENT_SYSMEM),
            Location::NonCoherent => caps.contains(DeviceCaps::NONCOHERENT_SYSMEM),
            Location::Optimal => {
                return Err(SurfaceError::Configuration(
                    "unresolved location passed to allocator".into(),
                ));
            }
        };
        if supported {
            Ok(())
        } else {
            Err(SurfaceError::Unsupported(format!(
                "location {} not present on this device",
                location.as_str()
            )))
        }
    }

    fn place_physical(
        state: &mut State,
        location: Location,
        size: u64,
        align: u64,
        range: Option<AddressRange>,
    ) -> SurfaceResult<u64> {
        let next = if location.is_device_local() {
            &mut state.next_fb_pa
        } else {
            &mut state.next_sys_pa
        };

        let mut pa = align_up(*next, align);
        if let Some(range) = range {
            pa = align_up(pa.max(range.min), align);
            if !range.contains(pa, size) {
                return Err(SurfaceError::Allocation(format!(
                    "no physical space in [0x{:x}, 0x{:x}] for 0x{size:x} bytes",
                    range.min, range.max
                )));
            }
        }
        *next = pa + size;
        Ok(pa)
    }
}

impl MemoryAllocator for HostAllocator {
    fn capabilities(&self) -> DeviceCaps {
        self.config.caps
    }

    fn allocate_physical(&self, req: &PhysicalRequest) -> SurfaceResult<PhysicalBlock> {
        let location = req.attrs.location;
        self.check_location(location)?;

        if req.size == 0 {
            return Err(SurfaceError::Allocation("zero-sized physical request".into()));
        }
        let align = if req.align == 0 { HOST_PAGE } else { req.align };
        if !is_pow2(align) {
            return Err(SurfaceError::Allocation(format!(
                "alignment 0x{align:x} is not a power of two"
            )));
        }

        let mut state = self.state();

        if let Some(limit) = self.config.fail_physical_after
            && state.physical_allocs >= limit
        {
            return Err(SurfaceError::Allocation("injected physical allocation failure".into()));
        }

        let (used, capacity) = if location.is_device_local() {
            (state.vidmem_used, self.config.vidmem_bytes)
        } else {
            (state.sysmem_used, self.config.sysmem_bytes)
        };
        if used + req.size > capacity {
            return Err(SurfaceError::Allocation(format!(
                "out of {} memory: need 0x{:x}, 0x{:x} free",
                location.as_str(),
                req.size,
                capacity - used
            )));
        }

        let phys_base = Self::place_physical(&mut state, location, req.size, align, req.address_range)?;
        let backing = Backing::new(req.size as usize)?;

        if location.is_device_local() {
            state.vidmem_used += req.size;
        } else {
            state.sysmem_used += req.size;
        }

        let pitch = match self.config.pitch_align {
            Some(a) if req.attrs.pitch > 0 => {
                let adjusted = align_up(req.attrs.pitch, a);
                (adjusted != req.attrs.pitch).then_some(adjusted)
            }
            _ => None,
        };

        let handle = state.new_handle();
        state.phys.insert(
            handle,
            PhysEntry {
                backing: Arc::new(backing),
                size: req.size,
                location,
                phys_base,
                raw_flags: req.attrs.to_raw_flags(),
                context: req.context,
                duplicate_of: None,
            },
        );
        state.physical_allocs += 1;

        log::debug!(
            "HostAllocator: phys 0x{handle:x} {} bytes in {} at PA 0x{phys_base:x}",
            req.size,
            location.as_str()
        );

        Ok(PhysicalBlock {
            handle,
            size: req.size,
            location,
            pitch,
        })
    }

    fn allocate_virtual(&self, req: &VirtualRequest) -> SurfaceResult<VirtualBlock> {
        let align = req.align.max(req.page_size).max(HOST_PAGE);
        let size = align_up(req.size, req.page_size.max(HOST_PAGE));

        let mut state = self.state();
        let aperture = self.aperture(&mut state, req.context);
        let address = match req.address_range {
            Some(r) => aperture.allocate_va_in(size, align, r.min, r.max),
            None => aperture.allocate_va(size, align),
        }
        .ok_or_else(|| {
            SurfaceError::Allocation(format!(
                "out of virtual address space in context {} for 0x{size:x} bytes",
                req.context
            ))
        })?;

        let handle = state.new_handle();
        state.virt.insert(
            handle,
            VirtEntry {
                context: req.context,
                address,
                size,
            },
        );
        state.virtual_allocs += 1;

        log::debug!(
            "HostAllocator: virt 0x{handle:x} ctx {} VA 0x{address:x} size 0x{size:x}",
            req.context
        );

        Ok(VirtualBlock {
            handle,
            context: req.context,
            address,
            size,
        })
    }

    fn map_virtual_to_physical(&self, req: &MapRequest<'_>) -> SurfaceResult<u64> {
        let mut state = self.state();

        if let Some(limit) = self.config.fail_map_after
            && state.map_calls >= limit
        {
            return Err(SurfaceError::Mapping("injected map failure".into()));
        }

        let phys_size = state
            .phys
            .get(&req.phys)
            .map(|p| p.size)
            .ok_or_else(|| SurfaceError::Mapping(format!("unknown physical handle 0x{:x}", req.phys)))?;
        if req.size == 0 || req.offset.checked_add(req.size).is_none_or(|end| end > phys_size) {
            return Err(SurfaceError::Mapping(format!(
                "range 0x{:x}+0x{:x} exceeds physical size 0x{phys_size:x}",
                req.offset, req.size
            )));
        }
        if req.flags.contains(MapFlags::PEER) && !self.config.caps.contains(DeviceCaps::PEER) {
            return Err(SurfaceError::Unsupported("peer mappings".into()));
        }

        let (address, implicit_va) = match req.virt {
            Some(virt) => {
                let entry = state.virt.get(&virt.handle).copied().ok_or_else(|| {
                    SurfaceError::Mapping(format!("unknown virtual handle 0x{:x}", virt.handle))
                })?;
                if entry.context != req.context {
                    return Err(SurfaceError::Mapping(format!(
                        "virtual handle 0x{:x} belongs to context {}, not {}",
                        virt.handle, entry.context, req.context
                    )));
                }
                if req.virt_offset.checked_add(req.size).is_none_or(|end| end > entry.size) {
                    return Err(SurfaceError::Mapping(format!(
                        "binding 0x{:x}+0x{:x} overruns virtual window of 0x{:x}",
                        req.virt_offset, req.size, entry.size
                    )));
                }
                (entry.address + req.virt_offset, false)
            }
            None => {
                let size = align_up(req.size, HOST_PAGE);
                let aperture = self.aperture(&mut state, req.context);
                let address = aperture.allocate_va(size, HOST_PAGE).ok_or_else(|| {
                    SurfaceError::Mapping(format!("context {} has no room for a direct bind", req.context))
                })?;
                (address, true)
            }
        };

        if state.maps.contains_key(&(req.context, address)) {
            return Err(SurfaceError::Mapping(format!(
                "VA 0x{address:x} in context {} is already bound",
                req.context
            )));
        }

        state.maps.insert(
            (req.context, address),
            MapEntry {
                phys: req.phys,
                size: req.size,
                flags: req.flags,
                peer_link: req.peer_link,
                implicit_va,
            },
        );
        state.map_calls += 1;

        log::debug!(
            "HostAllocator: map phys 0x{:x}+0x{:x} -> ctx {} VA 0x{address:x} ({:?})",
            req.phys,
            req.offset,
            req.context,
            req.flags
        );

        Ok(address)
    }

    fn unmap_virtual_to_physical(&self, context: u32, address: u64) -> SurfaceResult<()> {
        let mut state = self.state();
        let entry = state.maps.remove(&(context, address)).ok_or_else(|| {
            SurfaceError::Mapping(format!("no binding at VA 0x{address:x} in context {context}"))
        })?;

        if entry.implicit_va {
            self.aperture(&mut state, context).free_va(address);
        }

        log::debug!(
            "HostAllocator: unmap ctx {context} VA 0x{address:x} (phys 0x{:x}, 0x{:x} bytes)",
            entry.phys,
            entry.size
        );
        Ok(())
    }

    fn map_cpu(&self, phys: Handle, offset: u64, size: u64) -> SurfaceResult<NonNull<u8>> {
        let mut state = self.state();
        let entry = state
            .phys
            .get(&phys)
            .ok_or_else(|| SurfaceError::Mapping(format!("unknown physical handle 0x{phys:x}")))?;

        if size == 0 || offset.checked_add(size).is_none_or(|end| end > entry.size) {
            return Err(SurfaceError::OutOfRange {
                offset: offset.saturating_add(size),
                limit: entry.size,
            });
        }

        // Safety: offset is within the mapping checked above.
        let ptr = unsafe { entry.backing.ptr.add(offset as usize) };
        state.cpu_windows += 1;
        Ok(ptr)
    }

    fn unmap_cpu(&self, phys: Handle, _ptr: NonNull<u8>, _size: u64) -> SurfaceResult<()> {
        let mut state = self.state();
        if !state.phys.contains_key(&phys) {
            return Err(SurfaceError::Mapping(format!("unknown physical handle 0x{phys:x}")));
        }
        state.cpu_windows = state.cpu_windows.saturating_sub(1);
        Ok(())
    }

    fn duplicate_handle(&self, phys: Handle, context: u32) -> SurfaceResult<Handle> {
        let mut state = self.state();
        let (backing, size, location, phys_base, raw_flags) = {
            let entry = state.phys.get(&phys).ok_or_else(|| {
                SurfaceError::Allocation(format!("cannot duplicate unknown handle 0x{phys:x}"))
            })?;
            (entry.backing.clone(), entry.size, entry.location, entry.phys_base, entry.raw_flags)
        };

        let handle = state.new_handle();
        state.phys.insert(
            handle,
            PhysEntry {
                backing,
                size,
                location,
                phys_base,
                raw_flags,
                context,
                duplicate_of: Some(phys),
            },
        );

        log::debug!("HostAllocator: dup 0x{phys:x} into ctx {context} as 0x{handle:x}");
        Ok(handle)
    }

    fn free_handle(&self, handle: Handle) -> SurfaceResult<()> {
        let mut state = self.state();

        if let Some(virt) = state.virt.remove(&handle) {
            self.aperture(&mut state, virt.context).free_va(virt.address);
            return Ok(());
        }

        let entry = state
            .phys
            .remove(&handle)
            .ok_or_else(|| SurfaceError::Allocation(format!("free of unknown handle 0x{handle:x}")))?;

        let stale: Vec<_> = state
            .maps
            .iter()
            .filter(|(_, m)| m.phys == handle)
            .map(|(k, _)| *k)
            .collect();
        if !stale.is_empty() {
            log::warn!(
                "HostAllocator: handle 0x{handle:x} freed with {} live bindings",
                stale.len()
            );
            for key in stale {
                state.maps.remove(&key);
            }
        }

        if entry.duplicate_of.is_none() {
            if entry.location.is_device_local() {
                state.vidmem_used -= entry.size;
            } else {
                state.sysmem_used -= entry.size;
            }
        }
        Ok(())
    }

    fn query_physical_address(&self, phys: Handle, offset: u64) -> SurfaceResult<u64> {
        let state = self.state();
        let entry = state
            .phys
            .get(&phys)
            .ok_or_else(|| SurfaceError::Mapping(format!("unknown physical handle 0x{phys:x}")))?;
        if offset >= entry.size {
            return Err(SurfaceError::OutOfRange {
                offset,
                limit: entry.size,
            });
        }
        Ok(entry.phys_base + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rm::attrs::AllocAttrs;

    fn phys_req(size: u64, location: Location) -> PhysicalRequest {
        PhysicalRequest {
            context: 1,
            size,
            align: 4096,
            attrs: AllocAttrs::new(location),
            address_range: None,
        }
    }

    #[test]
    fn physical_memory_is_writable_through_cpu_window() {
        let host = HostAllocator::default();
        let block = host.allocate_physical(&phys_req(8192, Location::Framebuffer)).unwrap();

        let ptr = host.map_cpu(block.handle, 4096, 4096).unwrap();
        unsafe {
            ptr.as_ptr().write(0xa5);
            assert_eq!(ptr.as_ptr().read(), 0xa5);
        }
        assert_eq!(host.live_cpu_windows(), 1);
        host.unmap_cpu(block.handle, ptr, 4096).unwrap();
        assert_eq!(host.live_cpu_windows(), 0);

        host.free_handle(block.handle).unwrap();
        assert_eq!(host.live_physical(), 0);
    }

    #[test]
    fn missing_location_is_unsupported() {
        let host = HostAllocator::new(HostConfig::new(DeviceCaps::SYSMEM));
        let err = host.allocate_physical(&phys_req(4096, Location::Framebuffer)).unwrap_err();
        assert!(matches!(err, SurfaceError::Unsupported(_)));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut config = HostConfig::default();
        config.vidmem_bytes = 8192;
        let host = HostAllocator::new(config);
        let a = host.allocate_physical(&phys_req(8192, Location::Framebuffer)).unwrap();
        assert!(host.allocate_physical(&phys_req(4096, Location::Framebuffer)).is_err());
        host.free_handle(a.handle).unwrap();
        assert!(host.allocate_physical(&phys_req(4096, Location::Framebuffer)).is_ok());
    }

    #[test]
    fn physical_range_hint_places_block() {
        let host = HostAllocator::default();
        let mut req = phys_req(4096, Location::Coherent);
        req.address_range = Some(AddressRange {
            min: SYSMEM_PHYS_BASE + 0x10_0000,
            max: SYSMEM_PHYS_BASE + 0x1f_ffff,
        });
        let block = host.allocate_physical(&req).unwrap();
        assert_eq!(
            host.query_physical_address(block.handle, 0x10).unwrap(),
            SYSMEM_PHYS_BASE + 0x10_0010
        );
    }

    #[test]
    fn direct_bind_and_explicit_bind() {
        let host = HostAllocator::default();
        let block = host.allocate_physical(&phys_req(8192, Location::Framebuffer)).unwrap();

        let direct = host
            .map_virtual_to_physical(&MapRequest {
                context: 1,
                sub_context: 0,
                virt: None,
                virt_offset: 0,
                phys: block.handle,
                offset: 0,
                size: 8192,
                flags: MapFlags::READ_WRITE,
                peer_link: None,
            })
            .unwrap();

        let virt = host
            .allocate_virtual(&VirtualRequest {
                context: 2,
                size: 8192,
                align: 4096,
                page_size: 4096,
                address_range: None,
            })
            .unwrap();
        let explicit = host
            .map_virtual_to_physical(&MapRequest {
                context: 2,
                sub_context: 0,
                virt: Some(&virt),
                virt_offset: 4096,
                phys: block.handle,
                offset: 4096,
                size: 4096,
                flags: MapFlags::READ_WRITE | MapFlags::PEER,
                peer_link: Some(3),
            })
            .unwrap();

        assert_eq!(explicit, virt.address + 4096);
        assert_eq!(host.mapping_info(2, explicit), Some((MapFlags::READ_WRITE | MapFlags::PEER, Some(3))));
        assert_eq!(host.live_mappings(), 2);

        host.unmap_virtual_to_physical(1, direct).unwrap();
        host.unmap_virtual_to_physical(2, explicit).unwrap();
        assert!(host.unmap_virtual_to_physical(2, explicit).is_err());
        host.free_handle(virt.handle).unwrap();
        host.free_handle(block.handle).unwrap();
        assert_eq!(host.live_virtual(), 0);
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn wrapping_ranges_are_rejected() {
        let host = HostAllocator::default();
        let block = host.allocate_physical(&phys_req(8192, Location::Framebuffer)).unwrap();

        assert!(matches!(
            host.map_cpu(block.handle, 4096, u64::MAX - 1),
            Err(SurfaceError::OutOfRange { .. })
        ));
        assert_eq!(host.live_cpu_windows(), 0);

        let mut bind = MapRequest {
            context: 1,
            sub_context: 0,
            virt: None,
            virt_offset: 0,
            phys: block.handle,
            offset: 4096,
            size: u64::MAX - 1,
            flags: MapFlags::READ_WRITE,
            peer_link: None,
        };
        assert!(matches!(host.map_virtual_to_physical(&bind), Err(SurfaceError::Mapping(_))));

        let virt = host
            .allocate_virtual(&VirtualRequest {
                context: 1,
                size: 8192,
                align: 4096,
                page_size: 4096,
                address_range: None,
            })
            .unwrap();
        bind.virt = Some(&virt);
        bind.offset = 0;
        bind.size = 4096;
        bind.virt_offset = u64::MAX - 1;
        assert!(matches!(host.map_virtual_to_physical(&bind), Err(SurfaceError::Mapping(_))));
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn duplicates_share_backing() {
        let host = HostAllocator::default();
        let block = host.allocate_physical(&phys_req(4096, Location::Coherent)).unwrap();
        let dup = host.duplicate_handle(block.handle, 7).unwrap();

        let a = host.map_cpu(block.handle, 0, 4096).unwrap();
        let b = host.map_cpu(dup, 0, 4096).unwrap();
        unsafe {
            a.as_ptr().write(0x3c);
            assert_eq!(b.as_ptr().read(), 0x3c);
        }
        assert_eq!(host.owner_context(dup), Some(7));

        host.unmap_cpu(dup, b, 4096).unwrap();
        host.unmap_cpu(block.handle, a, 4096).unwrap();
        host.free_handle(dup).unwrap();
        host.free_handle(block.handle).unwrap();
        assert_eq!(host.live_physical(), 0);
    }

    #[test]
    fn fault_injection_trips_after_count() {
        let host = HostAllocator::new(HostConfig::default().fail_physical_after(1));
        assert!(host.allocate_physical(&phys_req(4096, Location::Framebuffer)).is_ok());
        assert!(matches!(
            host.allocate_physical(&phys_req(4096, Location::Framebuffer)),
            Err(SurfaceError::Allocation(_))
        ));
    }

    #[test]
    fn backend_pitch_adjustment_is_reported() {
        let host = HostAllocator::new(HostConfig::default().with_pitch_align(256));
        let mut req = phys_req(4096, Location::Framebuffer);
        req.attrs = req.attrs.layout(crate::rm::attrs::LayoutKind::Pitch, 448);
        assert_eq!(host.allocate_physical(&req).unwrap().pitch, Some(512));
    }
}
