//! Pixel addressing: `(x, y, z, slice)` to byte offset, one formula per layout.

use crate::error::{SurfaceError, SurfaceResult};
use crate::surface::descriptor::Layout;
use crate::surface::layout::{AllocationPlan, BlockGeometry, GOB_BYTES, GOB_BYTES_WIDE, GOB_HEIGHT};
use crate::utils::log2_floor;

/// Interleaves the low `min(log2 w, log2 h)` bits of `x` and `y` (x in even bits, y in odd
/// bits); the remaining high bits of the longer axis are appended above them.
///
/// `alloc_width` and `alloc_height` must be powers of two. The result is in pixels.
#[must_use]
pub const fn swizzle_index(x: u32, y: u32, alloc_width: u32, alloc_height: u32) -> u64 {
    let log_w = log2_floor(alloc_width);
    let log_h = log2_floor(alloc_height);
    let shared = if log_w < log_h { log_w } else { log_h };

    let mut index: u64 = 0;
    let mut bit = 0;
    while bit < shared {
        index |= (((x >> bit) & 1) as u64) << (2 * bit);
        index |= (((y >> bit) & 1) as u64) << (2 * bit + 1);
        bit += 1;
    }

    if log_w > log_h {
        index |= ((x >> shared) as u64) << (2 * shared);
    } else {
        index |= ((y >> shared) as u64) << (2 * shared);
    }
    index
}

/// Byte offset inside a 64x8 GOB.
#[must_use]
pub const fn gob_swizzle(x_bytes: u64, y: u64) -> u64 {
    ((x_bytes % 64) / 32) * 256
        + ((y % 8) / 2) * 64
        + ((x_bytes % 32) / 16) * 32
        + (y % 2) * 16
        + (x_bytes % 16)
}

/// Block-linear byte offset of byte column `x_bytes`, row `y`, layer `z` within one slice.
///
/// Blocks are ordered x, then y, then z. Inside a block GOBs stack in y, then z, then x.
#[must_use]
pub const fn block_linear_offset(block: &BlockGeometry, x_bytes: u64, y: u64, z: u64) -> u64 {
    let gob_x = x_bytes / GOB_BYTES_WIDE;
    let gob_y = y / GOB_HEIGHT as u64;
    let gob_z = z;

    let block_x = gob_x >> block.log_width;
    let block_y = gob_y >> block.log_height;
    let block_z = gob_z >> block.log_depth;

    let in_x = gob_x & ((1 << block.log_width) - 1);
    let in_y = gob_y & ((1 << block.log_height) - 1);
    let in_z = gob_z & ((1 << block.log_depth) - 1);

    let block_index = block_x + block.blocks_wide * (block_y + block.blocks_high * block_z);
    let gob_index = in_y + (in_z << block.log_height) + (in_x << (block.log_height + block.log_depth));

    block_index * block.block_bytes + gob_index * GOB_BYTES + gob_swizzle(x_bytes, y)
}

impl AllocationPlan {
    /// Offset in bits of pixel `(x, y, z)` of `slice` from the start of the allocation.
    ///
    /// Coordinates are not range checked; see [`Self::checked_pixel_offset`].
    #[must_use]
    pub fn pixel_bit_offset(&self, x: u32, y: u32, z: u32, slice: u32) -> u64 {
        let bpp = u64::from(self.bits_per_pixel);
        let base = self.hidden_size + u64::from(slice) * self.array_pitch;

        let within = match self.layout {
            Layout::Pitch | Layout::Tiled => {
                let row = (u64::from(z) * u64::from(self.alloc_height) + u64::from(y)) * self.pitch;
                return (base + row) * 8 + u64::from(x) * bpp;
            }
            Layout::Swizzled => {
                swizzle_index(x, y, self.alloc_width, self.alloc_height) * (bpp / 8)
            }
            Layout::BlockLinear => match &self.block {
                Some(block) => {
                    block_linear_offset(block, u64::from(x) * (bpp / 8), u64::from(y), u64::from(z))
                }
                None => 0,
            },
        };
        (base + within) * 8
    }

    /// Byte offset of pixel `(x, y, z)` of `slice` from the start of the allocation.
    #[must_use]
    pub fn pixel_offset(&self, x: u32, y: u32, z: u32, slice: u32) -> u64 {
        self.pixel_bit_offset(x, y, z, slice) / 8
    }

    /// [`Self::pixel_offset`] with bounds checking against the logical dimensions.
    ///
    /// # Errors
    /// Returns `OutOfRange` if any coordinate is outside the surface.
    pub fn checked_pixel_offset(&self, x: u32, y: u32, z: u32, slice: u32) -> SurfaceResult<u64> {
        let coords = [(x, self.width), (y, self.height), (z, self.depth), (slice, self.array_size)];
        if let Some(&(value, limit)) = coords.iter().find(|&&(value, limit)| value >= limit) {
            return Err(SurfaceError::OutOfRange {
                offset: u64::from(value),
                limit: u64::from(limit),
            });
        }
        Ok(self.pixel_offset(x, y, z, slice))
    }

    /// Smallest byte range `[start, end)` covering the rectangle `(x, y, w, h)` of layer 0,
    /// slice 0.
    ///
    /// # Errors
    /// Returns `OutOfRange` for an empty rectangle or one reaching outside the surface.
    pub fn rect_byte_range(&self, x: u32, y: u32, w: u32, h: u32) -> SurfaceResult<(u64, u64)> {
        let fits = w > 0
            && h > 0
            && x.checked_add(w).is_some_and(|r| r <= self.width)
            && y.checked_add(h).is_some_and(|b| b <= self.height);
        if !fits {
            return Err(SurfaceError::OutOfRange {
                offset: u64::from(x) + u64::from(w),
                limit: u64::from(self.width),
            });
        }

        let (x1, y1) = (x + w - 1, y + h - 1);
        match (self.layout, &self.block) {
            (Layout::BlockLinear, Some(block)) => Ok(self.block_rect_range(block, x, y, x1, y1)),
            _ => {
                // Row-major and Morton order both grow monotonically along each axis.
                let start = self.pixel_offset(x, y, 0, 0);
                let end = self.pixel_bit_offset(x1, y1, 0, 0) + u64::from(self.bits_per_pixel);
                Ok((start, end.div_ceil(8)))
            }
        }
    }

    /// Enumerates the blocks the rectangle touches and spans their extremes.
    fn block_rect_range(&self, block: &BlockGeometry, x0: u32, y0: u32, x1: u32, y1: u32) -> (u64, u64) {
        let bytes_pp = self.bytes_per_pixel();
        let block_w = GOB_BYTES_WIDE << block.log_width;
        let block_h = u64::from(GOB_HEIGHT) << block.log_height;

        let bx0 = u64::from(x0) * bytes_pp / block_w;
        let bx1 = (u64::from(x1) * bytes_pp + bytes_pp - 1) / block_w;
        let by0 = u64::from(y0) / block_h;
        let by1 = u64::from(y1) / block_h;

        let mut lo = u64::MAX;
        let mut hi = 0;
        for by in by0..=by1 {
            for bx in bx0..=bx1 {
                let start = (bx + block.blocks_wide * by) * block.block_bytes;
                lo = lo.min(start);
                hi = hi.max(start + block.block_bytes);
            }
        }
        (self.hidden_size + lo, self.hidden_size + hi)
    }
}
