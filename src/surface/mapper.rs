//! Device and CPU address windows over a surface's physical partitions.

use crate::error::{SurfaceError, SurfaceResult};
use crate::rm::attrs::{AddressModel, AddressRange, PageSize};
use crate::rm::device::{Handle, MapFlags, MapRequest, MemoryAllocator, VirtualBlock, VirtualRequest};
use crate::surface::planner::ResolvedPlan;
use crate::utils::{align_down, align_up};
use std::ptr::NonNull;

/// Size argument to [`map_cpu_window`] selecting the rest of the partition.
pub const MAP_ENTIRE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Unallocated,
    Allocated,
    /// A CPU window is open.
    Mapped,
    Freed,
}

impl SurfaceState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unallocated => "unallocated",
            Self::Allocated => "allocated",
            Self::Mapped => "mapped",
            Self::Freed => "freed",
        }
    }

    #[must_use]
    pub const fn is_allocated(self) -> bool {
        matches!(self, Self::Allocated | Self::Mapped)
    }
}

/// A virtual window over one physical partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMapping {
    pub context: u32,
    pub sub_context: u32,
    pub partition: usize,
    pub address: u64,
    /// Offset of the window within its partition.
    pub offset: u64,
    pub size: u64,
    pub flags: MapFlags,
    pub page_size: u64,
}

// ===============================================================================================
// Device Mappings
// ===============================================================================================

/// The device-visible view of a surface in one execution context.
#[derive(Debug)]
pub struct DeviceMapping {
    /// Explicit virtual window; `None` for direct binds and segmented surfaces.
    pub virt: Option<VirtualBlock>,
    /// One window per partition.
    pub windows: Vec<AddressMapping>,
    /// Segmented windows are physical addresses with no allocator binding behind them.
    segmented: bool,
}

impl DeviceMapping {
    /// Device address of surface byte 0.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.windows.first().map_or(0, |w| w.address)
    }

    #[must_use]
    pub const fn is_segmented(&self) -> bool {
        self.segmented
    }

    /// Unbinds every window and releases the virtual reservation, logging failures.
    pub fn release(self, allocator: &dyn MemoryAllocator) {
        if !self.segmented {
            for window in self.windows.iter().rev() {
                if let Err(e) = allocator.unmap_virtual_to_physical(window.context, window.address) {
                    log::error!(
                        "Failed to unmap VA 0x{:x} in context {}: {e}",
                        window.address,
                        window.context
                    );
                }
            }
        }
        if let Some(virt) = self.virt
            && let Err(e) = allocator.free_handle(virt.handle)
        {
            log::error!("Failed to free virtual handle 0x{:x}: {e}", virt.handle);
        }
    }
}

/// Whether the device mapping needs its own virtual reservation instead of a direct bind.
#[must_use]
pub fn needs_virtual_reservation(resolved: &ResolvedPlan, duplicate: bool) -> bool {
    duplicate
        || resolved.plan.is_split()
        || resolved.alignment > resolved.page_bytes()
        || !matches!(resolved.page_size, PageSize::Default | PageSize::Small)
        || resolved.virtual_range.is_some()
}

/// Makes every partition visible to the device in `context`.
///
/// Partial work is undone before an error is returned.
///
/// # Errors
/// Propagates allocator failures from reserving or binding the window.
pub fn establish_device_mapping(
    allocator: &dyn MemoryAllocator,
    resolved: &ResolvedPlan,
    address_model: AddressModel,
    handles: &[Handle],
    context: u32,
    reserve: bool,
) -> SurfaceResult<DeviceMapping> {
    let page_size = resolved.page_bytes();
    let flags = MapFlags::READ_WRITE | MapFlags::for_page_size(page_size);
    let partitions = &resolved.plan.partitions;

    if address_model == AddressModel::Segmented {
        let mut windows = Vec::with_capacity(partitions.len());
        for (index, (&handle, &size)) in handles.iter().zip(partitions).enumerate() {
            windows.push(AddressMapping {
                context,
                sub_context: 0,
                partition: index,
                address: allocator.query_physical_address(handle, 0)?,
                offset: 0,
                size,
                flags,
                page_size,
            });
        }
        return Ok(DeviceMapping {
            virt: None,
            windows,
            segmented: true,
        });
    }

    let virt = if reserve {
        let req = VirtualRequest {
            context,
            size: align_up(resolved.plan.size, page_size),
            align: resolved.alignment,
            page_size,
            address_range: resolved.virtual_range.map(|r| AddressRange {
                min: r.min,
                max: r.max.max(r.min + align_up(resolved.plan.size, page_size) - 1),
            }),
        };
        Some(allocator.allocate_virtual(&req)?)
    } else {
        None
    };

    let mut mapping = DeviceMapping {
        virt,
        windows: Vec::with_capacity(partitions.len()),
        segmented: false,
    };

    for (index, (&handle, &size)) in handles.iter().zip(partitions).enumerate() {
        let req = MapRequest {
            context,
            sub_context: 0,
            virt: mapping.virt.as_ref(),
            virt_offset: resolved.plan.partition_offset(index),
            phys: handle,
            offset: 0,
            size,
            flags,
            peer_link: None,
        };
        match allocator.map_virtual_to_physical(&req) {
            Ok(address) => mapping.windows.push(AddressMapping {
                context,
                sub_context: 0,
                partition: index,
                address,
                offset: 0,
                size,
                flags,
                page_size,
            }),
            Err(e) => {
                log::error!("Device mapping of partition {index} in context {context} failed: {e}");
                mapping.release(allocator);
                return Err(e);
            }
        }
    }

    log::debug!(
        "Device mapping in context {context} at 0x{:x} ({})",
        mapping.address(),
        if reserve { "reserved" } else { "direct" }
    );
    Ok(mapping)
}

// ===============================================================================================
// CPU Window
// ===============================================================================================

/// The single CPU-visible window of a surface.
#[derive(Debug)]
pub struct CpuWindow {
    ptr: NonNull<u8>,
    handle: Handle,
    context: u32,
    partition: usize,
    partition_offset: u64,
    offset: u64,
    size: u64,
}

// The window is exclusively owned by its surface and torn down before the backing memory.
unsafe impl Send for CpuWindow {}

impl CpuWindow {
    #[must_use]
    pub const fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub const fn context(&self) -> u32 {
        self.context
    }

    #[must_use]
    pub const fn partition(&self) -> usize {
        self.partition
    }

    /// Offset of the window within its partition.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Surface byte offset of the first mapped byte.
    #[must_use]
    pub const fn surface_offset(&self) -> u64 {
        self.partition_offset + self.offset
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether `len` bytes at surface offset `offset` lie inside the window.
    #[must_use]
    pub fn covers(&self, offset: u64, len: u64) -> bool {
        let start = self.surface_offset();
        offset >= start && offset.checked_add(len).is_some_and(|end| end <= start + self.size)
    }

    fn window_index(&self, offset: u64, len: usize) -> SurfaceResult<usize> {
        if !self.covers(offset, len as u64) {
            return Err(SurfaceError::OutOfRange {
                offset: offset.saturating_add(len as u64),
                limit: self.surface_offset() + self.size,
            });
        }
        Ok((offset - self.surface_offset()) as usize)
    }

    /// Copies bytes starting at surface offset `offset` into `buf`.
    ///
    /// # Errors
    /// Returns `OutOfRange` if the range is not inside the window.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> SurfaceResult<()> {
        let index = self.window_index(offset, buf.len())?;
        // Safety: the range was bounds-checked against the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(index), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copies `data` to surface offset `offset`.
    ///
    /// # Errors
    /// Returns `OutOfRange` if the range is not inside the window.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> SurfaceResult<()> {
        let index = self.window_index(offset, data.len())?;
        // Safety: the range was bounds-checked against the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(index), data.len());
        }
        Ok(())
    }

    /// The mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the allocator guarantees `size` readable bytes at `ptr` while mapped.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above; `&mut self` makes the access exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size as usize) }
    }

    /// Closes the window.
    ///
    /// # Errors
    /// Propagates the allocator's unmap failure.
    pub fn unmap(self, allocator: &dyn MemoryAllocator) -> SurfaceResult<()> {
        allocator.unmap_cpu(self.handle, self.ptr, self.size)
    }
}

/// Opens a CPU window over `size` bytes at surface offset `offset`.
///
/// The range must stay within a single partition. `size == MAP_ENTIRE` maps to the end of the
/// partition holding `offset`.
///
/// # Errors
/// Returns `OutOfRange` for offsets beyond the surface or ranges crossing a partition end.
pub fn map_cpu_window(
    allocator: &dyn MemoryAllocator,
    resolved: &ResolvedPlan,
    handles: &[Handle],
    context: u32,
    offset: u64,
    size: u64,
) -> SurfaceResult<CpuWindow> {
    let plan = &resolved.plan;
    let (partition, part_offset) = plan.locate(offset).ok_or(SurfaceError::OutOfRange {
        offset,
        limit: plan.size,
    })?;
    let part_size = plan.partitions[partition];
    let partition_start = plan.partition_offset(partition);

    let size = if size == MAP_ENTIRE { part_size - part_offset } else { size };
    if size == 0 || part_offset.checked_add(size).is_none_or(|end| end > part_size) {
        return Err(SurfaceError::OutOfRange {
            offset: offset.saturating_add(size),
            limit: partition_start + part_size,
        });
    }

    let handle = *handles
        .get(partition)
        .ok_or_else(|| SurfaceError::Mapping(format!("no handle for partition {partition}")))?;
    let ptr = allocator.map_cpu(handle, part_offset, size)?;

    log::debug!("CPU window over partition {partition} at +0x{part_offset:x}, 0x{size:x} bytes");
    Ok(CpuWindow {
        ptr,
        handle,
        context,
        partition,
        partition_offset: partition_start,
        offset: part_offset,
        size,
    })
}

/// Page-aligned `(offset, size)` covering rectangle `(x, y, w, h)` of slice 0, clipped to the
/// partition holding its first byte.
///
/// # Errors
/// Returns `OutOfRange` when the rectangle leaves the surface.
pub fn rect_window(resolved: &ResolvedPlan, x: u32, y: u32, w: u32, h: u32) -> SurfaceResult<(u64, u64)> {
    let plan = &resolved.plan;
    let page = resolved.page_bytes();
    let (start, end) = plan.rect_byte_range(x, y, w, h)?;

    let (partition, _) = plan.locate(start).ok_or(SurfaceError::OutOfRange {
        offset: start,
        limit: plan.size,
    })?;
    let part_start = plan.partition_offset(partition);
    let part_end = part_start + plan.partitions[partition];
    if end > part_end {
        return Err(SurfaceError::OutOfRange {
            offset: end,
            limit: part_end,
        });
    }

    let lo = align_down(start, page).max(part_start);
    let hi = align_up(end, page).min(part_end);
    Ok((lo, hi - lo))
}
