#![allow(clippy::cast_possible_truncation)]

//! Allocation planning: placement resolution, capability downgrades, validation and the
//! physical allocation requests sent to the allocator.

use crate::error::{SurfaceError, SurfaceResult};
use crate::rm::attrs::{AddressModel, AddressRange, AllocAttrs, Location, PageSize};
use crate::rm::device::{DeviceCaps, Handle, MemoryAllocator, PhysicalRequest};
use crate::surface::descriptor::{Layout, SurfaceDescriptor};
use crate::surface::layout::{AllocationPlan, compute_plan};
use crate::utils::{align_down, is_pow2};
use std::collections::HashMap;

/// Size of one compression metadata granule.
pub const COMPRESSION_GRANULE: u64 = 64 * 1024;

// ===============================================================================================
// Run-wide Configuration
// ===============================================================================================

/// Process-wide allocation policy, fixed for the lifetime of a run.
#[derive(Debug, Clone, Default)]
pub struct PlannerConfig {
    /// Forces every surface to this location.
    pub location_override: Option<Location>,
    /// Fill pattern written to every freshly allocated surface.
    pub fill_pattern: Option<u32>,
    /// Location overrides keyed by surface name.
    pub name_overrides: HashMap<String, Location>,
    /// Page size used by descriptors that leave it at `PageSize::Default`.
    pub default_page_size: PageSize,
}

impl PlannerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_location_override(mut self, location: Location) -> Self {
        self.location_override = Some(location);
        self
    }

    #[must_use]
    pub const fn with_fill_pattern(mut self, pattern: u32) -> Self {
        self.fill_pattern = Some(pattern);
        self
    }

    #[must_use]
    pub const fn with_default_page_size(mut self, page_size: PageSize) -> Self {
        self.default_page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_name_override(mut self, name: impl Into<String>, location: Location) -> Self {
        self.name_overrides.insert(name.into(), location);
        self
    }
}

// ===============================================================================================
// Planned Surface
// ===============================================================================================

/// Everything decided about a surface before memory is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub location: Location,
    /// Location of partition 1; `Some` only when the surface stays split.
    pub split_location: Option<Location>,
    pub compressed: bool,
    pub page_size: PageSize,
    pub alignment: u64,
    pub virtual_range: Option<AddressRange>,
    pub physical_range: Option<AddressRange>,
    pub plan: AllocationPlan,
}

impl ResolvedPlan {
    #[must_use]
    pub const fn page_bytes(&self) -> u64 {
        self.page_size.bytes()
    }

    #[must_use]
    pub fn partition_location(&self, index: usize) -> Location {
        match (index, self.split_location) {
            (1, Some(location)) => location,
            _ => self.location,
        }
    }
}

/// One allocated physical partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPartition {
    pub handle: Handle,
    pub size: u64,
    pub location: Location,
    /// Surface byte offset where this partition begins.
    pub offset: u64,
}

/// The physical memory owned by a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalAllocation {
    pub partitions: Vec<PhysicalPartition>,
}

impl PhysicalAllocation {
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.partitions.iter().map(|p| p.size).sum()
    }

    #[must_use]
    pub fn handles(&self) -> Vec<Handle> {
        self.partitions.iter().map(|p| p.handle).collect()
    }

    /// Returns every handle to the allocator, logging failures.
    pub fn release(&self, allocator: &dyn MemoryAllocator) {
        for part in self.partitions.iter().rev() {
            if let Err(e) = allocator.free_handle(part.handle) {
                log::error!("Failed to free physical handle 0x{:x}: {e}", part.handle);
            }
        }
    }
}

/// Sizes of the two partitions of a split surface, or `None` if it cannot hold two pages.
#[must_use]
pub const fn split_partitions(total: u64, page_size: u64) -> Option<[u64; 2]> {
    let first = align_down(total / 2, page_size);
    if first == 0 || first >= total {
        return None;
    }
    Some([first, total - first])
}

// ===============================================================================================
// Planner
// ===============================================================================================

pub struct AllocationPlanner<'a> {
    config: &'a PlannerConfig,
    caps: DeviceCaps,
}

impl<'a> AllocationPlanner<'a> {
    #[must_use]
    pub const fn new(config: &'a PlannerConfig, caps: DeviceCaps) -> Self {
        Self { config, caps }
    }

    /// Resolves a requested location against the run overrides and the device capabilities.
    ///
    /// Deterministic and idempotent: feeding the result back yields the same location.
    #[must_use]
    pub fn resolve_location(&self, requested: Location, protected: bool, name: &str) -> Location {
        let mut location = self.config.name_overrides.get(name).copied().unwrap_or(requested);

        if let Some(forced) = self.config.location_override {
            location = forced;
        }

        if protected && self.caps.contains(DeviceCaps::PROTECTED_MEMORY) {
            location = Location::Framebuffer;
        }

        if location == Location::Optimal {
            location = if self.caps.contains(DeviceCaps::VIDMEM) {
                Location::Framebuffer
            } else {
                Location::Coherent
            };
        }

        if location == Location::Framebuffer && !self.caps.contains(DeviceCaps::VIDMEM) {
            location = Location::Coherent;
        }
        if location == Location::Coherent && !self.caps.contains(DeviceCaps::COHERENT_SYSMEM) {
            location = Location::NonCoherent;
        }
        if location == Location::NonCoherent && !self.caps.contains(DeviceCaps::NONCOHERENT_SYSMEM) {
            location = Location::Coherent;
        }

        if location != requested {
            log::debug!(
                "Surface '{name}': location {} resolved to {}",
                requested.as_str(),
                location.as_str()
            );
        }
        location
    }

    fn resolve_page_size(&self, requested: PageSize) -> PageSize {
        let requested = match requested {
            PageSize::Default => self.config.default_page_size,
            other => other,
        };
        let supported = match requested {
            PageSize::Default | PageSize::Small => true,
            PageSize::Big => self.caps.contains(DeviceCaps::BIG_PAGES),
            PageSize::Huge => self.caps.contains(DeviceCaps::HUGE_PAGES),
        };
        if supported {
            requested
        } else {
            log::warn!("{requested:?} pages not supported; falling back to small pages");
            PageSize::Small
        }
    }

    /// Validates `desc`, applies the silent downgrades and computes the layout.
    ///
    /// # Errors
    /// * `Configuration` for invalid option combinations (see [`compute_plan`] for geometry).
    /// * `Unsupported` when block-linear layout is requested on a device without it.
    pub fn plan(&self, desc: &SurfaceDescriptor) -> SurfaceResult<ResolvedPlan> {
        if desc.layout == Layout::BlockLinear && !self.caps.contains(DeviceCaps::BLOCK_LINEAR) {
            return Err(SurfaceError::Unsupported("block-linear layout".into()));
        }

        let location = self.resolve_location(desc.location, desc.protected, &desc.name);
        let page_size = self.resolve_page_size(desc.page_size);
        let page_bytes = page_size.bytes();

        let alignment = match desc.alignment {
            Some(a) if !is_pow2(a) => {
                return Err(SurfaceError::Configuration(format!(
                    "alignment 0x{a:x} is not a power of two"
                )));
            }
            Some(a) => a.max(page_bytes),
            None => page_bytes,
        };

        let mut compressed = desc.compressed;
        if compressed && !self.caps.supports_compression(location) {
            log::warn!(
                "Surface '{}': compression unsupported in {}; disabled",
                desc.name,
                location.as_str()
            );
            compressed = false;
        }
        if compressed {
            let cov = desc.compression_coverage;
            if cov.min_percent > cov.max_percent || cov.max_percent > 100 {
                return Err(SurfaceError::Configuration(format!(
                    "compression coverage {}%..{}% is invalid",
                    cov.min_percent, cov.max_percent
                )));
            }
        }

        if desc.split {
            if desc.hidden_alloc_size > 0 || desc.extra_alloc_size > 0 {
                return Err(SurfaceError::Configuration(
                    "split surfaces cannot carry hidden or extra padding".into(),
                ));
            }
            if compressed {
                return Err(SurfaceError::Configuration(
                    "split surfaces cannot carry compression metadata".into(),
                ));
            }
        }

        let mut plan = compute_plan(desc)?;

        let virtual_range = desc.virtual_range(plan.size, page_bytes)?;
        if virtual_range.is_some() && desc.address_model == AddressModel::Segmented {
            return Err(SurfaceError::Configuration(
                "virtual address hints need the paged address model".into(),
            ));
        }
        let physical_range = desc.physical_range(plan.size, page_bytes)?;

        let mut split_location = None;
        if desc.split {
            match split_partitions(plan.size, page_bytes) {
                Some(parts) => {
                    plan.partitions = parts.to_vec();
                    split_location = Some(self.resolve_location(desc.split_location, false, ""));
                }
                None => log::warn!(
                    "Surface '{}': 0x{:x} bytes is too small to split at 0x{page_bytes:x}; not split",
                    desc.name,
                    plan.size
                ),
            }
        }

        if compressed {
            plan.compression_tags = compression_tags(plan.size, desc);
        }

        log::debug!(
            "Surface '{}': {:?} pitch 0x{:x} size 0x{:x} in {} ({} partition(s))",
            desc.name,
            plan.layout,
            plan.pitch,
            plan.size,
            location.as_str(),
            plan.partitions.len()
        );

        Ok(ResolvedPlan {
            location,
            split_location,
            compressed,
            page_size,
            alignment,
            virtual_range,
            physical_range,
            plan,
        })
    }

    /// Builds one physical request per partition.
    #[must_use]
    pub fn partition_requests(
        &self,
        desc: &SurfaceDescriptor,
        resolved: &ResolvedPlan,
        context: u32,
    ) -> Vec<PhysicalRequest> {
        resolved
            .plan
            .partitions
            .iter()
            .enumerate()
            .map(|(index, &size)| {
                let mut attrs = AllocAttrs::new(resolved.partition_location(index))
                    .page_size(resolved.page_size)
                    .layout(desc.layout, resolved.plan.pitch)
                    .address_model(desc.address_model);
                if resolved.compressed {
                    attrs = attrs.compressed(resolved.plan.compression_tags);
                }
                if desc.physically_contiguous {
                    attrs = attrs.contiguous();
                }
                if desc.displayable {
                    attrs = attrs.displayable();
                }
                if desc.protected {
                    attrs = attrs.protected();
                }
                // The physical window constrains the first partition only.
                let address_range = if index == 0 { resolved.physical_range } else { None };
                if address_range.is_some() {
                    attrs = attrs.fixed_address();
                }

                PhysicalRequest {
                    context,
                    size,
                    align: resolved.alignment,
                    attrs,
                    address_range,
                }
            })
            .collect()
    }

    /// Requests physical memory for every partition.
    ///
    /// On failure every partition allocated so far is released before returning. When the
    /// allocator adjusts the pitch, the layout is re-derived from it and `resolved` updated.
    ///
    /// # Errors
    /// Returns the allocator's error, or `Allocation` if the adjusted layout no longer fits.
    pub fn allocate(
        &self,
        allocator: &dyn MemoryAllocator,
        desc: &SurfaceDescriptor,
        resolved: &mut ResolvedPlan,
        context: u32,
    ) -> SurfaceResult<PhysicalAllocation> {
        let mut allocation = PhysicalAllocation {
            partitions: Vec::with_capacity(resolved.plan.partitions.len()),
        };
        let mut adjusted_pitch = None;
        let mut offset = 0;

        for req in self.partition_requests(desc, resolved, context) {
            let block = match allocator.allocate_physical(&req) {
                Ok(block) => block,
                Err(e) => {
                    log::error!("Surface '{}': physical allocation of 0x{:x} failed: {e}", desc.name, req.size);
                    allocation.release(allocator);
                    return Err(e);
                }
            };
            adjusted_pitch = adjusted_pitch.or(block.pitch);
            allocation.partitions.push(PhysicalPartition {
                handle: block.handle,
                size: req.size,
                location: block.location,
                offset,
            });
            offset += req.size;
        }

        if let Some(pitch) = adjusted_pitch
            && pitch != resolved.plan.pitch
            && matches!(desc.layout, Layout::Pitch | Layout::Tiled)
            && let Err(e) = Self::apply_pitch(desc, resolved, pitch)
        {
            allocation.release(allocator);
            return Err(e);
        }

        Ok(allocation)
    }

    /// Re-derives the layout with the allocator-chosen pitch, keeping the allocated size.
    ///
    /// The extra region absorbs the difference and may shrink.
    fn apply_pitch(desc: &SurfaceDescriptor, resolved: &mut ResolvedPlan, pitch: u64) -> SurfaceResult<()> {
        let adjusted = desc.clone().with_pitch(pitch).with_extra_alloc_size(0);
        let mut plan = compute_plan(&adjusted)?;
        let allocated = resolved.plan.size;

        if plan.size > allocated {
            return Err(SurfaceError::Allocation(format!(
                "allocator pitch 0x{pitch:x} needs 0x{:x} bytes, only 0x{allocated:x} allocated",
                plan.size
            )));
        }

        log::debug!("Surface '{}': allocator adjusted pitch to 0x{pitch:x}", desc.name);
        plan.extra_size = allocated - plan.size;
        plan.size = allocated;
        plan.partitions.clone_from(&resolved.plan.partitions);
        plan.compression_tags = resolved.plan.compression_tags;
        resolved.plan = plan;
        Ok(())
    }
}

/// Number of compression granules needed to cover the configured share of `size`.
fn compression_tags(size: u64, desc: &SurfaceDescriptor) -> u32 {
    let cov = desc.compression_coverage;
    let start = size * u64::from(cov.min_percent) / 100;
    let end = size * u64::from(cov.max_percent) / 100;
    let first = start / COMPRESSION_GRANULE;
    let last = end.div_ceil(COMPRESSION_GRANULE);
    (last - first) as u32
}
