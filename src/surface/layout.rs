//! Surface geometry: descriptor in, byte layout out.
//!
//! Everything here is pure. The same descriptor always yields the same [`AllocationPlan`], and the
//! addressing functions in [`crate::surface::addressing`] read back exactly the padding and pitch
//! decisions made here.

use crate::error::{SurfaceError, SurfaceResult};
use crate::rm::attrs::PageSize;
use crate::surface::descriptor::{Layout, SurfaceDescriptor};
use crate::utils::{align_up, bits_to_bytes, checked_align_up, next_pow2};

// ===============================================================================================
// Constants
// ===============================================================================================

/// Bytes per GOB row.
pub const GOB_BYTES_WIDE: u64 = 64;
/// Rows per GOB.
pub const GOB_HEIGHT: u32 = 8;
pub const GOB_DEPTH: u32 = 1;
pub const GOB_BYTES: u64 = GOB_BYTES_WIDE * GOB_HEIGHT as u64;
pub const MAX_LOG_BLOCK: u32 = 5;

pub const PITCH_ALIGN_GENERIC: u64 = 64;
pub const PITCH_ALIGN_DISPLAY: u64 = 256;

pub const SWIZZLE_MAX_DIMENSION: u32 = 4096;

pub const TILED_ROW_ALIGN: u32 = 16;
const TILED_MAX_K: u64 = 15;
const TILED_MAX_N: u32 = 6;
const TILED_PITCH_SHIFT: u32 = 6;

// ===============================================================================================
// Plan Types
// ===============================================================================================

/// Block and GOB counts of a block-linear surface, consumed by the addressing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub log_width: u32,
    pub log_height: u32,
    pub log_depth: u32,
    pub block_bytes: u64,
    pub gobs_wide: u64,
    pub gobs_high: u64,
    pub gobs_deep: u64,
    pub blocks_wide: u64,
    pub blocks_high: u64,
    pub blocks_deep: u64,
}

impl BlockGeometry {
    #[must_use]
    pub const fn gobs_per_block(&self) -> u64 {
        1 << (self.log_width + self.log_height + self.log_depth)
    }

    /// Blocks per slice, `None` when the count overflows.
    #[must_use]
    pub fn block_count(&self) -> Option<u64> {
        self.blocks_wide.checked_mul(self.blocks_high)?.checked_mul(self.blocks_deep)
    }
}

/// The physical byte layout of a surface.
///
/// Byte offsets produced from a plan are relative to the start of the allocation: the hidden
/// region comes first, then `array_size` slices `array_pitch` apart, then the extra region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub layout: Layout,
    pub bits_per_pixel: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub pitch: u64,
    pub alloc_width: u32,
    pub alloc_height: u32,
    pub alloc_depth: u32,
    pub block: Option<BlockGeometry>,
    pub slice_size: u64,
    pub array_pitch: u64,
    pub hidden_size: u64,
    pub extra_size: u64,
    pub size: u64,
    /// Byte size of each physical partition; one entry unless the surface is split.
    pub partitions: Vec<u64>,
    pub compression_tags: u32,
}

impl AllocationPlan {
    #[must_use]
    pub fn is_split(&self) -> bool {
        self.partitions.len() > 1
    }

    /// Surface byte offset at which partition `index` starts.
    #[must_use]
    pub fn partition_offset(&self, index: usize) -> u64 {
        self.partitions.iter().take(index).sum()
    }

    /// Partition holding surface byte `offset`, with the offset relative to that partition.
    #[must_use]
    pub fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        let mut start = 0;
        for (index, &size) in self.partitions.iter().enumerate() {
            if offset < start + size {
                return Some((index, offset - start));
            }
            start += size;
        }
        None
    }

    #[must_use]
    pub const fn bytes_per_pixel(&self) -> u64 {
        (self.bits_per_pixel as u64).div_ceil(8)
    }
}

// ===============================================================================================
// Calculator
// ===============================================================================================

struct SliceGeometry {
    pitch: u64,
    alloc_width: u32,
    alloc_height: u32,
    alloc_depth: u32,
    block: Option<BlockGeometry>,
    slice_size: u64,
}

/// Computes the allocation plan for `desc`.
///
/// # Errors
/// Returns `Configuration` when the descriptor describes no valid layout: bad pixel size, zero
/// dimensions without a manual array pitch, swizzle bound violations, out-of-range block shape,
/// a tiled pitch beyond the legal set, or a size that does not fit in 64 bits.
pub fn compute_plan(desc: &SurfaceDescriptor) -> SurfaceResult<AllocationPlan> {
    let bpp = desc.bits_per_pixel();
    validate_pixel_size(desc.layout, bpp)?;

    if desc.depth == 0 || desc.array_size == 0 {
        return Err(SurfaceError::Configuration(format!(
            "depth ({}) and array size ({}) must be non-zero",
            desc.depth, desc.array_size
        )));
    }
    if (desc.width == 0 || desc.height == 0) && desc.array_pitch.is_none() {
        return Err(SurfaceError::Configuration(format!(
            "{}x{} surface needs a manual array pitch",
            desc.width, desc.height
        )));
    }

    let geometry = match desc.layout {
        Layout::Pitch => pitch_geometry(desc, bpp)?,
        Layout::Swizzled => swizzled_geometry(desc, bpp)?,
        Layout::BlockLinear => block_linear_geometry(desc, bpp)?,
        Layout::Tiled => tiled_geometry(desc, bpp)?,
    };

    let array_pitch = resolve_array_pitch(desc, &geometry)?;
    let size = array_pitch
        .checked_mul(u64::from(desc.array_size))
        .and_then(|s| s.checked_add(desc.hidden_alloc_size))
        .and_then(|s| s.checked_add(desc.extra_alloc_size))
        .ok_or_else(|| too_large(desc))?;
    // Must stay representable once rounded up to the largest page.
    checked_align_up(size, PageSize::HUGE_BYTES).ok_or_else(|| too_large(desc))?;

    Ok(AllocationPlan {
        layout: desc.layout,
        bits_per_pixel: bpp,
        width: desc.width,
        height: desc.height,
        depth: desc.depth,
        array_size: desc.array_size,
        pitch: geometry.pitch,
        alloc_width: geometry.alloc_width,
        alloc_height: geometry.alloc_height,
        alloc_depth: geometry.alloc_depth,
        block: geometry.block,
        slice_size: geometry.slice_size,
        array_pitch,
        hidden_size: desc.hidden_alloc_size,
        extra_size: desc.extra_alloc_size,
        size,
        partitions: vec![size],
        compression_tags: 0,
    })
}

fn validate_pixel_size(layout: Layout, bpp: u32) -> SurfaceResult<()> {
    let valid = match bpp {
        1 | 2 | 4 => matches!(layout, Layout::Pitch | Layout::Tiled),
        8..=128 => bpp % 8 == 0,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SurfaceError::Configuration(format!(
            "{bpp} bits per pixel is not valid for {layout:?} layout"
        )))
    }
}

fn too_large(desc: &SurfaceDescriptor) -> SurfaceError {
    SurfaceError::Configuration(format!(
        "layout of {}x{}x{} [{}] surface '{}' does not fit in 64 bits",
        desc.width, desc.height, desc.depth, desc.array_size, desc.name
    ))
}

/// Multiplies geometry terms, failing with a configuration error on overflow.
fn product(desc: &SurfaceDescriptor, terms: &[u64]) -> SurfaceResult<u64> {
    terms
        .iter()
        .try_fold(1u64, |acc, &t| acc.checked_mul(t))
        .ok_or_else(|| too_large(desc))
}

/// Narrows a padded dimension back to `u32`.
fn padded_dimension(desc: &SurfaceDescriptor, value: u64) -> SurfaceResult<u32> {
    u32::try_from(value).map_err(|_| too_large(desc))
}

/// Widens an under-sized caller pitch to `computed`.
fn widen_pitch(requested: Option<u64>, computed: u64, what: &str) -> u64 {
    match requested {
        Some(p) if p < computed => {
            log::warn!("{what} 0x{p:x} is smaller than required 0x{computed:x}; widening");
            computed
        }
        Some(p) => p,
        None => computed,
    }
}

fn pitch_geometry(desc: &SurfaceDescriptor, bpp: u32) -> SurfaceResult<SliceGeometry> {
    let granularity = if desc.displayable {
        PITCH_ALIGN_DISPLAY
    } else {
        PITCH_ALIGN_GENERIC
    };
    let computed = align_up(bits_to_bytes(u64::from(desc.width), bpp), granularity);
    let pitch = widen_pitch(desc.pitch, computed, "pitch");

    Ok(SliceGeometry {
        pitch,
        alloc_width: desc.width,
        alloc_height: desc.height,
        alloc_depth: desc.depth,
        block: None,
        slice_size: product(desc, &[pitch, u64::from(desc.height), u64::from(desc.depth)])?,
    })
}

fn swizzled_geometry(desc: &SurfaceDescriptor, bpp: u32) -> SurfaceResult<SliceGeometry> {
    if desc.depth != 1 || desc.array_size != 1 {
        return Err(SurfaceError::Configuration(format!(
            "swizzled surfaces must be 2D with one slice (depth {}, array size {})",
            desc.depth, desc.array_size
        )));
    }
    if desc.width > SWIZZLE_MAX_DIMENSION || desc.height > SWIZZLE_MAX_DIMENSION {
        return Err(SurfaceError::Configuration(format!(
            "swizzled surface {}x{} exceeds {SWIZZLE_MAX_DIMENSION}",
            desc.width, desc.height
        )));
    }
    if desc.pitch.is_some() {
        log::warn!("manual pitch ignored for swizzled surface '{}'", desc.name);
    }

    let alloc_width = next_pow2(desc.width);
    let alloc_height = next_pow2(desc.height);
    let bytes_per_pixel = u64::from(bpp / 8);

    Ok(SliceGeometry {
        pitch: u64::from(desc.width) * bytes_per_pixel,
        alloc_width,
        alloc_height,
        alloc_depth: 1,
        block: None,
        slice_size: u64::from(alloc_width) * u64::from(alloc_height) * bytes_per_pixel,
    })
}

fn block_linear_geometry(desc: &SurfaceDescriptor, bpp: u32) -> SurfaceResult<SliceGeometry> {
    let (lbw, lbh, lbd) = (desc.log_block_width, desc.log_block_height, desc.log_block_depth);
    if lbw > MAX_LOG_BLOCK || lbh > MAX_LOG_BLOCK || lbd > MAX_LOG_BLOCK {
        return Err(SurfaceError::Configuration(format!(
            "block shape log2 ({lbw}, {lbh}, {lbd}) exceeds {MAX_LOG_BLOCK}"
        )));
    }

    let block_width_bytes = GOB_BYTES_WIDE << lbw;
    let block_height = GOB_HEIGHT << lbh;
    let block_depth = GOB_DEPTH << lbd;

    let computed = align_up(bits_to_bytes(u64::from(desc.width), bpp), block_width_bytes);
    let pitch = checked_align_up(widen_pitch(desc.pitch, computed, "pitch"), block_width_bytes)
        .ok_or_else(|| too_large(desc))?;
    let alloc_height = padded_dimension(desc, align_up(u64::from(desc.height), u64::from(block_height)))?;
    let alloc_depth = padded_dimension(desc, align_up(u64::from(desc.depth), u64::from(block_depth)))?;

    let gobs_wide = pitch / GOB_BYTES_WIDE;
    let gobs_high = u64::from(alloc_height / GOB_HEIGHT);
    let gobs_deep = u64::from(alloc_depth / GOB_DEPTH);

    let block = BlockGeometry {
        log_width: lbw,
        log_height: lbh,
        log_depth: lbd,
        block_bytes: GOB_BYTES << (lbw + lbh + lbd),
        gobs_wide,
        gobs_high,
        gobs_deep,
        blocks_wide: gobs_wide >> lbw,
        blocks_high: gobs_high >> lbh,
        blocks_deep: gobs_deep >> lbd,
    };

    Ok(SliceGeometry {
        pitch,
        alloc_width: padded_dimension(desc, pitch / u64::from(bpp / 8))?,
        alloc_height,
        alloc_depth,
        block: Some(block),
        slice_size: product(desc, &[block.block_count().ok_or_else(|| too_large(desc))?, block.block_bytes])?,
    })
}

fn tiled_geometry(desc: &SurfaceDescriptor, bpp: u32) -> SurfaceResult<SliceGeometry> {
    let naive = bits_to_bytes(u64::from(desc.width), bpp).max(desc.pitch.unwrap_or(0));
    let pitch = select_tiled_pitch(naive).ok_or_else(|| {
        SurfaceError::Configuration(format!("no legal tiled pitch covers 0x{naive:x} bytes"))
    })?;
    if let Some(requested) = desc.pitch
        && requested != pitch
    {
        log::warn!("tiled pitch 0x{requested:x} is not legal; using 0x{pitch:x}");
    }

    let alloc_height = padded_dimension(desc, align_up(u64::from(desc.height), u64::from(TILED_ROW_ALIGN)))?;

    Ok(SliceGeometry {
        pitch,
        alloc_width: desc.width,
        alloc_height,
        alloc_depth: desc.depth,
        block: None,
        slice_size: product(desc, &[pitch, u64::from(alloc_height), u64::from(desc.depth)])?,
    })
}

/// Smallest pitch of the form `k * 2^(n + 6)` (k odd in 1..=15, n in 0..=6) that is `>= min`.
#[must_use]
pub fn select_tiled_pitch(min: u64) -> Option<u64> {
    (0..=TILED_MAX_N)
        .flat_map(|n| (1..=TILED_MAX_K).step_by(2).map(move |k| k << (n + TILED_PITCH_SHIFT)))
        .filter(|&pitch| pitch >= min)
        .min()
}

fn resolve_array_pitch(desc: &SurfaceDescriptor, geometry: &SliceGeometry) -> SurfaceResult<u64> {
    let array_pitch = widen_pitch(desc.array_pitch, geometry.slice_size, "array pitch");
    match geometry.block {
        Some(block) => checked_align_up(array_pitch, block.block_bytes).ok_or_else(|| too_large(desc)),
        None => Ok(array_pitch),
    }
}
