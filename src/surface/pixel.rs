#![allow(clippy::cast_possible_truncation)]

//! Pixel and byte access through the active CPU window.

use crate::error::{SurfaceError, SurfaceResult};
use crate::rm::device::MemoryAllocator;
use crate::surface::Surface;
use crate::surface::planner::PhysicalAllocation;

/// Writes the little-endian bytes of `pattern` repeatedly over `buf`, phased so that byte `i`
/// receives pattern byte `(start + i) % 4`.
pub fn fill_pattern(buf: &mut [u8], start: u64, pattern: u32) {
    let bytes = pattern.to_le_bytes();
    for (i, b) in buf.iter_mut().enumerate() {
        *b = bytes[((start + i as u64) % 4) as usize];
    }
}

/// Fills every partition of a fresh allocation through a temporary CPU window.
pub(crate) fn debug_fill(
    allocator: &dyn MemoryAllocator,
    physical: &PhysicalAllocation,
    pattern: u32,
) -> SurfaceResult<()> {
    for part in &physical.partitions {
        let ptr = allocator.map_cpu(part.handle, 0, part.size)?;
        // Safety: the allocator mapped `part.size` writable bytes at `ptr`.
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), part.size as usize) };
        fill_pattern(buf, part.offset, pattern);
        allocator.unmap_cpu(part.handle, ptr, part.size)?;
    }
    log::debug!("Debug fill 0x{pattern:08x} over {} partition(s)", physical.partitions.len());
    Ok(())
}

impl Surface {
    /// Reads the pixel at `(x, y, z, slice)` from the CPU window.
    ///
    /// Pixels narrower than a byte are read from their bit position, least significant bit
    /// first. Wider pixels are little-endian.
    ///
    /// # Errors
    /// * `NotMapped` without a CPU window.
    /// * `OutOfRange` for coordinates outside the surface or bytes outside the window.
    pub fn read_pixel(&self, x: u32, y: u32, z: u32, slice: u32) -> SurfaceResult<u128> {
        let window = self.cpu_window().ok_or(SurfaceError::NotMapped)?;
        let plan = self.allocation_plan().ok_or(SurfaceError::NotMapped)?;
        plan.checked_pixel_offset(x, y, z, slice)?;

        let bits = plan.bits_per_pixel;
        let bit_offset = plan.pixel_bit_offset(x, y, z, slice);

        if bits < 8 {
            let mut byte = [0u8; 1];
            window.read(bit_offset / 8, &mut byte)?;
            let mask = (1u8 << bits) - 1;
            return Ok(u128::from((byte[0] >> (bit_offset % 8)) & mask));
        }

        let mut raw = [0u8; 16];
        let len = (bits / 8) as usize;
        window.read(bit_offset / 8, &mut raw[..len])?;
        Ok(u128::from_le_bytes(raw))
    }

    /// Writes the pixel at `(x, y, z, slice)`; bits above the pixel size are dropped.
    ///
    /// # Errors
    /// Same as [`Self::read_pixel`].
    pub fn write_pixel(&mut self, x: u32, y: u32, z: u32, slice: u32, value: u128) -> SurfaceResult<()> {
        let plan = self.allocation_plan().ok_or(SurfaceError::NotMapped)?;
        plan.checked_pixel_offset(x, y, z, slice)?;

        let bits = plan.bits_per_pixel;
        let bit_offset = plan.pixel_bit_offset(x, y, z, slice);
        let window = self.cpu_window_mut().ok_or(SurfaceError::NotMapped)?;

        if bits < 8 {
            let offset = bit_offset / 8;
            let shift = bit_offset % 8;
            let mask = ((1u8 << bits) - 1) << shift;

            let mut byte = [0u8; 1];
            window.read(offset, &mut byte)?;
            byte[0] = (byte[0] & !mask) | (((value as u8) << shift) & mask);
            return window.write(offset, &byte);
        }

        let len = (bits / 8) as usize;
        window.write(bit_offset / 8, &value.to_le_bytes()[..len])
    }

    /// Copies bytes at surface offset `offset` out of the CPU window.
    ///
    /// # Errors
    /// `NotMapped` without a window, `OutOfRange` outside it.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> SurfaceResult<()> {
        self.cpu_window().ok_or(SurfaceError::NotMapped)?.read(offset, buf)
    }

    /// Copies `data` to surface offset `offset` through the CPU window.
    ///
    /// # Errors
    /// `NotMapped` without a window, `OutOfRange` outside it.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> SurfaceResult<()> {
        self.cpu_window_mut().ok_or(SurfaceError::NotMapped)?.write(offset, data)
    }

    /// Fills the whole CPU window with `pattern`.
    ///
    /// # Errors
    /// `NotMapped` without a window.
    pub fn fill(&mut self, pattern: u32) -> SurfaceResult<()> {
        let window = self.cpu_window_mut().ok_or(SurfaceError::NotMapped)?;
        let start = window.surface_offset();
        fill_pattern(window.as_mut_slice(), start, pattern);
        Ok(())
    }
}
