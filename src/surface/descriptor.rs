//! Caller-facing surface configuration.

use crate::error::{SurfaceError, SurfaceResult};
pub use crate::rm::attrs::LayoutKind as Layout;
use crate::rm::attrs::{AddressModel, AddressRange, Location, PageSize};
use crate::utils::is_pow2;

/// Pixel formats with a known storage size; `Raw` carries an explicit bit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    I1,
    I2,
    I4,
    Y8,
    R5G6B5,
    #[default]
    A8R8G8B8,
    A2B10G10R10,
    Z24S8,
    Z32F,
    R16G16B16A16F,
    Z32FX24S8,
    R32G32B32A32F,
    Raw(u32),
}

impl ColorFormat {
    #[must_use]
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            Self::I1 => 1,
            Self::I2 => 2,
            Self::I4 => 4,
            Self::Y8 => 8,
            Self::R5G6B5 => 16,
            Self::A8R8G8B8 | Self::A2B10G10R10 | Self::Z24S8 | Self::Z32F => 32,
            Self::R16G16B16A16F | Self::Z32FX24S8 => 64,
            Self::R32G32B32A32F => 128,
            Self::Raw(bits) => bits,
        }
    }
}

/// Portion of the surface (in percent of its size) backed by compression metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionCoverage {
    pub min_percent: u32,
    pub max_percent: u32,
}

impl Default for CompressionCoverage {
    fn default() -> Self {
        Self {
            min_percent: 0,
            max_percent: 100,
        }
    }
}

/// Logical description of a surface.
///
/// Freely editable until the surface is allocated; [`crate::surface::Surface`] freezes it after.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    pub name: String,

    // Geometry
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub format: ColorFormat,
    pub layout: Layout,
    pub log_block_width: u32,
    pub log_block_height: u32,
    pub log_block_depth: u32,
    pub pitch: Option<u64>,
    pub array_pitch: Option<u64>,
    pub extra_alloc_size: u64,
    pub hidden_alloc_size: u64,

    // Placement
    pub location: Location,
    pub address_model: AddressModel,
    pub page_size: PageSize,
    pub alignment: Option<u64>,
    pub split: bool,
    pub split_location: Location,
    pub compressed: bool,
    pub compression_coverage: CompressionCoverage,
    pub displayable: bool,
    pub protected: bool,
    pub physically_contiguous: bool,

    // Address hints
    pub virtual_address_hint: Option<u64>,
    pub virtual_address_hint_max: Option<u64>,
    pub physical_address_hint: Option<u64>,
    pub physical_address_hint_max: Option<u64>,
}

impl Default for SurfaceDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            width: 0,
            height: 0,
            depth: 1,
            array_size: 1,
            format: ColorFormat::default(),
            layout: Layout::Pitch,
            log_block_width: 0,
            log_block_height: 4,
            log_block_depth: 0,
            pitch: None,
            array_pitch: None,
            extra_alloc_size: 0,
            hidden_alloc_size: 0,
            location: Location::Optimal,
            address_model: AddressModel::Paged,
            page_size: PageSize::Default,
            alignment: None,
            split: false,
            split_location: Location::NonCoherent,
            compressed: false,
            compression_coverage: CompressionCoverage::default(),
            displayable: false,
            protected: false,
            physically_contiguous: false,
            virtual_address_hint: None,
            virtual_address_hint_max: None,
            physical_address_hint: None,
            physical_address_hint_max: None,
        }
    }
}

impl SurfaceDescriptor {
    #[must_use]
    pub fn new(width: u32, height: u32, format: ColorFormat) -> Self {
        Self {
            width,
            height,
            format,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub const fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub const fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size;
        self
    }

    #[must_use]
    pub const fn with_format(mut self, format: ColorFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub const fn with_bits_per_pixel(mut self, bits: u32) -> Self {
        self.format = ColorFormat::Raw(bits);
        self
    }

    #[must_use]
    pub const fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub const fn with_block_shape(mut self, log_width: u32, log_height: u32, log_depth: u32) -> Self {
        self.log_block_width = log_width;
        self.log_block_height = log_height;
        self.log_block_depth = log_depth;
        self
    }

    #[must_use]
    pub const fn with_pitch(mut self, pitch: u64) -> Self {
        self.pitch = Some(pitch);
        self
    }

    #[must_use]
    pub const fn with_array_pitch(mut self, array_pitch: u64) -> Self {
        self.array_pitch = Some(array_pitch);
        self
    }

    #[must_use]
    pub const fn with_extra_alloc_size(mut self, bytes: u64) -> Self {
        self.extra_alloc_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_hidden_alloc_size(mut self, bytes: u64) -> Self {
        self.hidden_alloc_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    #[must_use]
    pub const fn with_address_model(mut self, model: AddressModel) -> Self {
        self.address_model = model;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    #[must_use]
    pub const fn with_split(mut self, split_location: Location) -> Self {
        self.split = true;
        self.split_location = split_location;
        self
    }

    #[must_use]
    pub const fn with_compression(mut self, coverage: CompressionCoverage) -> Self {
        self.compressed = true;
        self.compression_coverage = coverage;
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
    pub const fn physically_contiguous(mut self) -> Self {
        self.physically_contiguous = true;
        self
    }

    #[must_use]
    pub const fn with_virtual_address_hint(mut self, min: u64, max: Option<u64>) -> Self {
        self.virtual_address_hint = Some(min);
        self.virtual_address_hint_max = max;
        self
    }

    #[must_use]
    pub const fn with_physical_address_hint(mut self, min: u64, max: Option<u64>) -> Self {
        self.physical_address_hint = Some(min);
        self.physical_address_hint_max = max;
        self
    }

    #[must_use]
    pub const fn bits_per_pixel(&self) -> u32 {
        self.format.bits_per_pixel()
    }

    /// Effective virtual placement window for a surface of `size` bytes.
    ///
    /// A lone hint pins the surface at that exact address.
    ///
    /// # Errors
    /// Returns `Configuration` for a max without a min, an inverted range, or an unaligned hint.
    pub fn virtual_range(&self, size: u64, page_size: u64) -> SurfaceResult<Option<AddressRange>> {
        Self::hint_range(
            "virtual",
            self.virtual_address_hint,
            self.virtual_address_hint_max,
            size,
            page_size,
        )
    }

    /// Effective physical placement window for a partition of `size` bytes.
    ///
    /// # Errors
    /// Same rules as [`Self::virtual_range`].
    pub fn physical_range(&self, size: u64, page_size: u64) -> SurfaceResult<Option<AddressRange>> {
        Self::hint_range(
            "physical",
            self.physical_address_hint,
            self.physical_address_hint_max,
            size,
            page_size,
        )
    }

    fn hint_range(
        kind: &str,
        min: Option<u64>,
        max: Option<u64>,
        size: u64,
        page_size: u64,
    ) -> SurfaceResult<Option<AddressRange>> {
        match (min, max) {
            (None, None) => Ok(None),
            (None, Some(max)) => Err(SurfaceError::Configuration(format!(
                "{kind} address hint max 0x{max:x} given without a min"
            ))),
            (Some(min), max) => {
                if is_pow2(page_size) && min % page_size != 0 {
                    return Err(SurfaceError::Configuration(format!(
                        "{kind} address hint 0x{min:x} is not aligned to 0x{page_size:x}"
                    )));
                }
                let max = match max {
                    Some(max) => max,
                    None => min.checked_add(size.max(1) - 1).ok_or_else(|| {
                        SurfaceError::Configuration(format!("{kind} address hint 0x{min:x} overflows"))
                    })?,
                };
                if max < min {
                    return Err(SurfaceError::Configuration(format!(
                        "{kind} address hint range [0x{min:x}, 0x{max:x}] is inverted"
                    )));
                }
                Ok(Some(AddressRange { min, max }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_sizes() {
        assert_eq!(ColorFormat::A8R8G8B8.bits_per_pixel(), 32);
        assert_eq!(ColorFormat::I1.bits_per_pixel(), 1);
        assert_eq!(ColorFormat::R32G32B32A32F.bits_per_pixel(), 128);
        assert_eq!(ColorFormat::Raw(24).bits_per_pixel(), 24);
    }

    #[test]
    fn lone_virtual_hint_pins_address() {
        let desc = SurfaceDescriptor::new(16, 16, ColorFormat::Y8).with_virtual_address_hint(0x20_0000, None);
        let range = desc.virtual_range(0x3000, 4096).unwrap().unwrap();
        assert_eq!(range.min, 0x20_0000);
        assert_eq!(range.max, 0x20_2fff);
    }

    #[test]
    fn malformed_hints_are_rejected() {
        let mut desc = SurfaceDescriptor::new(16, 16, ColorFormat::Y8);
        desc.virtual_address_hint_max = Some(0x1000);
        assert!(desc.virtual_range(4096, 4096).is_err());

        let desc = SurfaceDescriptor::new(16, 16, ColorFormat::Y8)
            .with_virtual_address_hint(0x20_0000, Some(0x10_0000));
        assert!(desc.virtual_range(4096, 4096).is_err());

        let desc = SurfaceDescriptor::new(16, 16, ColorFormat::Y8).with_physical_address_hint(0x20_0800, None);
        assert!(matches!(
            desc.physical_range(4096, 4096),
            Err(SurfaceError::Configuration(_))
        ));
    }

    #[test]
    fn no_hints_means_no_range() {
        let desc = SurfaceDescriptor::new(16, 16, ColorFormat::Y8);
        assert_eq!(desc.virtual_range(4096, 4096).unwrap(), None);
        assert_eq!(desc.physical_range(4096, 4096).unwrap(), None);
    }
}
