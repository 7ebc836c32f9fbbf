//! Resource-manager layer: the allocator seam the surface engine talks to.

pub mod aperture;
pub mod attrs;
pub mod device;
pub mod host;

pub use attrs::{AddressModel, AddressRange, AllocAttrs, LayoutKind, Location, PageSize};
pub use device::{
    DeviceCaps, ExecutionContext, Handle, MapFlags, MapRequest, MemoryAllocator, PhysicalBlock,
    PhysicalRequest, VirtualBlock, VirtualRequest,
};
pub use host::{HostAllocator, HostConfig};
