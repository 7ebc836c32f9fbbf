//! Surface memory layout and address-space engine.
//!
//! [`surface`] computes byte layouts for pitch, swizzled, block-linear and tiled surfaces,
//! allocates them through a [`rm::MemoryAllocator`] and manages their device, CPU and
//! cross-context mappings. [`rm::HostAllocator`] runs the whole engine over host memory.

pub mod error;
pub mod rm;
pub mod surface;
pub mod utils;

pub use error::{SurfaceError, SurfaceResult};
pub use surface::{Surface, SurfaceDescriptor};
