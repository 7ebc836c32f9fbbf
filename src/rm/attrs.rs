//! Typed allocation attributes and the raw flag word handed to allocator backends.

// ===============================================================================================
// Raw Flag Word
// ===============================================================================================

pub const ALLOC_FLAGS_VIDMEM: u32 = 1 << 0;
pub const ALLOC_FLAGS_SYSMEM_COHERENT: u32 = 1 << 1;
pub const ALLOC_FLAGS_SYSMEM_NONCOHERENT: u32 = 1 << 2;
pub const ALLOC_FLAGS_PAGE_BIG: u32 = 1 << 3;
pub const ALLOC_FLAGS_PAGE_HUGE: u32 = 1 << 4;
pub const ALLOC_FLAGS_COMPRESSED: u32 = 1 << 5;
pub const ALLOC_FLAGS_CONTIGUOUS: u32 = 1 << 6;
pub const ALLOC_FLAGS_DISPLAYABLE: u32 = 1 << 7;
pub const ALLOC_FLAGS_PROTECTED: u32 = 1 << 8;
pub const ALLOC_FLAGS_LAYOUT_BLOCK_LINEAR: u32 = 1 << 9;
pub const ALLOC_FLAGS_LAYOUT_TILED: u32 = 1 << 10;
pub const ALLOC_FLAGS_LAYOUT_SWIZZLED: u32 = 1 << 11;
pub const ALLOC_FLAGS_SEGMENTED: u32 = 1 << 12;
pub const ALLOC_FLAGS_FIXED_ADDRESS: u32 = 1 << 13;

// ===============================================================================================
// Attribute Types
// ===============================================================================================

/// Where the backing memory of a surface lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Location {
    /// Device-local video memory.
    Framebuffer,
    /// Host memory, snooped by the device.
    Coherent,
    /// Host memory, not snooped by the device.
    NonCoherent,
    /// Let the planner pick the best supported placement.
    #[default]
    Optimal,
}

impl Location {
    #[must_use]
    pub const fn is_device_local(self) -> bool {
        matches!(self, Self::Framebuffer)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Framebuffer => "framebuffer",
            Self::Coherent => "coherent",
            Self::NonCoherent => "noncoherent",
            Self::Optimal => "optimal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressModel {
    #[default]
    Paged,
    Segmented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageSize {
    #[default]
    Default,
    Small,
    Big,
    Huge,
}

impl PageSize {
    pub const SMALL_BYTES: u64 = 4096;
    pub const BIG_BYTES: u64 = 64 * 1024;
    pub const HUGE_BYTES: u64 = 2 * 1024 * 1024;

    /// Page size in bytes; `Default` reports the small page.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Default | Self::Small => Self::SMALL_BYTES,
            Self::Big => Self::BIG_BYTES,
            Self::Huge => Self::HUGE_BYTES,
        }
    }
}

/// Inclusive address window used for virtual and physical placement hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub min: u64,
    pub max: u64,
}

impl AddressRange {
    #[must_use]
    pub const fn contains(&self, addr: u64, size: u64) -> bool {
        if addr < self.min || size == 0 {
            return false;
        }
        match addr.checked_add(size - 1) {
            Some(end) => end <= self.max,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutKind {
    #[default]
    Pitch,
    Swizzled,
    BlockLinear,
    Tiled,
}

/// Attribute bundle sent with each physical allocation request.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocAttrs {
    pub location: Location,
    pub page_size: PageSize,
    pub layout: LayoutKind,
    pub address_model: AddressModel,
    pub pitch: u64,
    pub compressed: bool,
    pub compression_tags: u32,
    pub contiguous: bool,
    pub displayable: bool,
    pub protected: bool,
    /// Placement is pinned by a physical address window.
    pub fixed_address: bool,
}

impl AllocAttrs {
    #[must_use]
    pub fn new(location: Location) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn layout(mut self, layout: LayoutKind, pitch: u64) -> Self {
        self.layout = layout;
        self.pitch = pitch;
        self
    }

    #[must_use]
    pub const fn address_model(mut self, model: AddressModel) -> Self {
        self.address_model = model;
        self
    }

    #[must_use]
    pub const fn compressed(mut self, tags: u32) -> Self {
        self.compressed = true;
        self.compression_tags = tags;
        self
    }

    #[must_use]
    pub const fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    #[must_use]
    pub const fn displayable(mut self) -> Self {
        self.displayable = true;
        self
    }

    #[must_use]
    pub const fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    #[must_use]
    pub const fn fixed_address(mut self) -> Self {
        self.fixed_address = true;
        self
    }

    /// Converts the typed record into the raw flag word understood by allocator backends.
    #[must_use]
    pub const fn to_raw_flags(self) -> u32 {
        let mut flags = match self.location {
            Location::Framebuffer | Location::Optimal => ALLOC_FLAGS_VIDMEM,
            Location::Coherent => ALLOC_FLAGS_SYSMEM_COHERENT,
            Location::NonCoherent => ALLOC_FLAGS_SYSMEM_NONCOHERENT,
        };

        flags |= match self.page_size {
            PageSize::Default | PageSize::Small => 0,
            PageSize::Big => ALLOC_FLAGS_PAGE_BIG,
            PageSize::Huge => ALLOC_FLAGS_PAGE_HUGE,
        };

        flags |= match self.layout {
            LayoutKind::Pitch => 0,
            LayoutKind::Swizzled => ALLOC_FLAGS_LAYOUT_SWIZZLED,
            LayoutKind::BlockLinear => ALLOC_FLAGS_LAYOUT_BLOCK_LINEAR,
            LayoutKind::Tiled => ALLOC_FLAGS_LAYOUT_TILED,
        };

        if matches!(self.address_model, AddressModel::Segmented) {
            flags |= ALLOC_FLAGS_SEGMENTED;
        }
        // Compression metadata only exists in device memory.
        if self.compressed && self.location.is_device_local() {
            flags |= ALLOC_FLAGS_COMPRESSED;
        }
        if self.contiguous {
            flags |= ALLOC_FLAGS_CONTIGUOUS;
        }
        if self.displayable {
            flags |= ALLOC_FLAGS_DISPLAYABLE;
        }
        if self.protected {
            flags |= ALLOC_FLAGS_PROTECTED;
        }
        if self.fixed_address {
            flags |= ALLOC_FLAGS_FIXED_ADDRESS;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_flags_follow_typed_fields() {
        let attrs = AllocAttrs::new(Location::Framebuffer)
            .page_size(PageSize::Big)
            .layout(LayoutKind::BlockLinear, 256)
            .compressed(4)
            .contiguous();
        let raw = attrs.to_raw_flags();

        assert_ne!(raw & ALLOC_FLAGS_VIDMEM, 0);
        assert_ne!(raw & ALLOC_FLAGS_PAGE_BIG, 0);
        assert_ne!(raw & ALLOC_FLAGS_LAYOUT_BLOCK_LINEAR, 0);
        assert_ne!(raw & ALLOC_FLAGS_COMPRESSED, 0);
        assert_ne!(raw & ALLOC_FLAGS_CONTIGUOUS, 0);
        assert_eq!(raw & ALLOC_FLAGS_SYSMEM_COHERENT, 0);
        assert_eq!(raw & ALLOC_FLAGS_FIXED_ADDRESS, 0);
        assert_ne!(attrs.fixed_address().to_raw_flags() & ALLOC_FLAGS_FIXED_ADDRESS, 0);
    }

    #[test]
    fn sysmem_never_carries_compression_bit() {
        let raw = AllocAttrs::new(Location::Coherent).compressed(1).to_raw_flags();
        assert_eq!(raw & ALLOC_FLAGS_COMPRESSED, 0);
        assert_ne!(raw & ALLOC_FLAGS_SYSMEM_COHERENT, 0);
    }

    #[test]
    fn address_range_contains_is_inclusive() {
        let r = AddressRange {
            min: 0x1000,
            max: 0x1fff,
        };
        assert!(r.contains(0x1000, 0x1000));
        assert!(!r.contains(0x1000, 0x1001));
        assert!(!r.contains(0x0fff, 1));
        assert!(!r.contains(0x1000, 0));
    }
}
