use crate::error::SurfaceResult;
use crate::rm::attrs::{AddressRange, AllocAttrs, Location, PageSize};
use bitflags::bitflags;
use std::ptr::NonNull;

/// Opaque allocator handle (physical or virtual).
pub type Handle = u64;

bitflags! {
    /// Capability bits reported by an allocator backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCaps: u32 {
        const VIDMEM             = 1 << 0;
        const COHERENT_SYSMEM    = 1 << 1;
        const NONCOHERENT_SYSMEM = 1 << 2;
        const COMPRESSION_VIDMEM = 1 << 3;
        const COMPRESSION_SYSMEM = 1 << 4;
        const BLOCK_LINEAR       = 1 << 5;
        const PEER               = 1 << 6;
        const BIG_PAGES          = 1 << 7;
        const HUGE_PAGES         = 1 << 8;
        const PROTECTED_MEMORY   = 1 << 9;

        const SYSMEM = Self::COHERENT_SYSMEM.bits() | Self::NONCOHERENT_SYSMEM.bits();
        const DISCRETE_GPU = Self::VIDMEM.bits()
            | Self::SYSMEM.bits()
            | Self::COMPRESSION_VIDMEM.bits()
            | Self::BLOCK_LINEAR.bits()
            | Self::PEER.bits()
            | Self::BIG_PAGES.bits()
            | Self::HUGE_PAGES.bits();
    }
}

impl DeviceCaps {
    /// Whether surfaces placed at `location` can carry compression metadata.
    #[must_use]
    pub const fn supports_compression(self, location: Location) -> bool {
        if location.is_device_local() {
            self.contains(Self::COMPRESSION_VIDMEM)
        } else {
            self.contains(Self::COMPRESSION_SYSMEM)
        }
    }
}

bitflags! {
    /// Access, cache and page-size attributes of a virtual mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const CACHED    = 1 << 2;
        const PEER      = 1 << 3;
        const LOOPBACK  = 1 << 4;
        const SHARED    = 1 << 5;
        const BIG_PAGE  = 1 << 6;
        const HUGE_PAGE = 1 << 7;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MapFlags {
    #[must_use]
    pub const fn for_page_size(page_size: u64) -> Self {
        if page_size >= PageSize::HUGE_BYTES {
            Self::HUGE_PAGE
        } else if page_size >= PageSize::BIG_BYTES {
            Self::BIG_PAGE
        } else {
            Self::empty()
        }
    }
}

/// An execution context (device client) owning virtual address spaces.
///
/// A context may span several sub-contexts (e.g. linked sub-devices); cross-context mappings are
/// created per local and remote sub-context pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContext {
    pub id: u32,
    pub sub_contexts: u32,
}

impl ExecutionContext {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            sub_contexts: 1,
        }
    }

    #[must_use]
    pub const fn with_sub_contexts(mut self, count: u32) -> Self {
        self.sub_contexts = if count == 0 { 1 } else { count };
        self
    }
}

// ===============================================================================================
// Requests and Results
// ===============================================================================================

#[derive(Debug, Clone, Copy)]
pub struct PhysicalRequest {
    pub context: u32,
    pub size: u64,
    pub align: u64,
    pub attrs: AllocAttrs,
    pub address_range: Option<AddressRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalBlock {
    pub handle: Handle,
    pub size: u64,
    pub location: Location,
    /// Pitch chosen by the backend when it differs from the requested one.
    pub pitch: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct VirtualRequest {
    pub context: u32,
    pub size: u64,
    pub align: u64,
    pub page_size: u64,
    pub address_range: Option<AddressRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBlock {
    pub handle: Handle,
    pub context: u32,
    pub address: u64,
    pub size: u64,
}

/// Binds `size` bytes of `phys` (starting at `offset`) into a virtual window.
///
/// With `virt == None` the backend picks the address itself (direct bind).
#[derive(Debug, Clone, Copy)]
pub struct MapRequest<'a> {
    pub context: u32,
    pub sub_context: u32,
    pub virt: Option<&'a VirtualBlock>,
    pub virt_offset: u64,
    pub phys: Handle,
    pub offset: u64,
    pub size: u64,
    pub flags: MapFlags,
    pub peer_link: Option<u32>,
}

// ===============================================================================================
// Allocator Interface
// ===============================================================================================

/// The external memory allocator the surface engine drives.
///
/// All calls are blocking. A backend is shared by every surface of a run, so implementations
/// synchronize internally.
pub trait MemoryAllocator: Send + Sync {
    /// Capability bits of the device behind this allocator.
    fn capabilities(&self) -> DeviceCaps;

    /// Allocate physical backing memory.
    fn allocate_physical(&self, req: &PhysicalRequest) -> SurfaceResult<PhysicalBlock>;

    /// Reserve a virtual address window in `req.context`.
    fn allocate_virtual(&self, req: &VirtualRequest) -> SurfaceResult<VirtualBlock>;

    /// Bind physical memory into a virtual window and return the resulting device address.
    fn map_virtual_to_physical(&self, req: &MapRequest<'_>) -> SurfaceResult<u64>;

    /// Undo a binding created by `map_virtual_to_physical`.
    fn unmap_virtual_to_physical(&self, context: u32, address: u64) -> SurfaceResult<()>;

    /// Open a CPU-visible window over `size` bytes of `phys` at `offset`.
    fn map_cpu(&self, phys: Handle, offset: u64, size: u64) -> SurfaceResult<NonNull<u8>>;

    /// Close a CPU window opened by `map_cpu`.
    fn unmap_cpu(&self, phys: Handle, ptr: NonNull<u8>, size: u64) -> SurfaceResult<()>;

    /// Make `phys` usable from another execution context.
    fn duplicate_handle(&self, phys: Handle, context: u32) -> SurfaceResult<Handle>;

    /// Release a physical, duplicated or virtual handle.
    fn free_handle(&self, handle: Handle) -> SurfaceResult<()>;

    /// Physical address of byte `offset` within `phys`.
    fn query_physical_address(&self, phys: Handle, offset: u64) -> SurfaceResult<u64>;
}
