//! Surfaces: planned, allocated and mapped 2D/3D images.

pub mod addressing;
pub mod context;
pub mod descriptor;
pub mod layout;
pub mod mapper;
pub mod peer;
pub mod pixel;
pub mod planner;

pub use context::{ContextMap, ExecutionContext, PerContextState, RunContext};
pub use descriptor::{ColorFormat, CompressionCoverage, Layout, SurfaceDescriptor};
pub use layout::{AllocationPlan, BlockGeometry};
pub use mapper::{AddressMapping, CpuWindow, DeviceMapping, MAP_ENTIRE, SurfaceState};
pub use peer::{NO_PEER_LINK, RemoteKind, RemoteMappingKey};
pub use planner::{PhysicalAllocation, PhysicalPartition, PlannerConfig, ResolvedPlan};

use crate::error::{SurfaceError, SurfaceResult};
use crate::rm::attrs::AddressModel;
use crate::rm::device::{DeviceCaps, MemoryAllocator};
use mapper::needs_virtual_reservation;
use planner::AllocationPlanner;

/// A surface and everything it owns across execution contexts.
///
/// The descriptor is editable until [`Surface::alloc`]. After that the surface holds its physical
/// memory, a device mapping in the owning context, any duplicates and remote mappings, and at most
/// one CPU window. All of it is released by [`Surface::free`] or on drop.
#[derive(Debug)]
pub struct Surface {
    run: RunContext,
    desc: SurfaceDescriptor,
    owner: ExecutionContext,
    state: SurfaceState,
    resolved: Option<ResolvedPlan>,
    physical: Option<PhysicalAllocation>,
    contexts: Option<ContextMap>,
    cpu_window: Option<CpuWindow>,
}

impl Surface {
    #[must_use]
    pub fn new(run: RunContext, owner: ExecutionContext, desc: SurfaceDescriptor) -> Self {
        Self {
            run,
            desc,
            owner,
            state: SurfaceState::Unallocated,
            resolved: None,
            physical: None,
            contexts: None,
            cpu_window: None,
        }
    }

    #[must_use]
    pub const fn descriptor(&self) -> &SurfaceDescriptor {
        &self.desc
    }

    /// Replaces the descriptor.
    ///
    /// # Errors
    /// Returns `InvalidState` once the surface has been allocated.
    pub fn set_descriptor(&mut self, desc: SurfaceDescriptor) -> SurfaceResult<()> {
        if self.state != SurfaceState::Unallocated {
            return Err(self.invalid_state("change the descriptor"));
        }
        self.desc = desc;
        Ok(())
    }

    #[must_use]
    pub const fn state(&self) -> SurfaceState {
        self.state
    }

    #[must_use]
    pub const fn owner(&self) -> ExecutionContext {
        self.owner
    }

    const fn invalid_state(&self, op: &'static str) -> SurfaceError {
        SurfaceError::InvalidState {
            op,
            state: self.state.as_str(),
        }
    }

    fn planner(&self) -> AllocationPlanner<'_> {
        AllocationPlanner::new(self.run.config(), self.run.allocator().capabilities())
    }

    fn live(&self, op: &'static str) -> SurfaceResult<(&ResolvedPlan, &ContextMap)> {
        match (&self.resolved, &self.contexts) {
            (Some(resolved), Some(contexts)) if self.state.is_allocated() => Ok((resolved, contexts)),
            _ => Err(self.invalid_state(op)),
        }
    }

    fn live_mut(&mut self, op: &'static str) -> SurfaceResult<(&ResolvedPlan, &mut ContextMap)> {
        let state = self.state;
        match (&self.resolved, &mut self.contexts) {
            (Some(resolved), Some(contexts)) if state.is_allocated() => Ok((resolved, contexts)),
            _ => Err(SurfaceError::InvalidState {
                op,
                state: state.as_str(),
            }),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Planning
    // -------------------------------------------------------------------------------------------

    /// The resolved plan: the live one once allocated, otherwise a preview of the descriptor.
    ///
    /// # Errors
    /// Returns the planning error for an invalid descriptor.
    pub fn plan(&self) -> SurfaceResult<ResolvedPlan> {
        match &self.resolved {
            Some(resolved) => Ok(resolved.clone()),
            None => self.planner().plan(&self.desc),
        }
    }

    #[must_use]
    pub fn allocation_plan(&self) -> Option<&AllocationPlan> {
        self.resolved.as_ref().map(|r| &r.plan)
    }

    #[must_use]
    pub const fn resolved(&self) -> Option<&ResolvedPlan> {
        self.resolved.as_ref()
    }

    /// # Errors
    /// Returns the planning error for an invalid descriptor.
    pub fn size(&self) -> SurfaceResult<u64> {
        self.plan().map(|r| r.plan.size)
    }

    /// # Errors
    /// Returns the planning error for an invalid descriptor.
    pub fn pitch(&self) -> SurfaceResult<u64> {
        self.plan().map(|r| r.plan.pitch)
    }

    /// Byte offset of a pixel from the start of the allocation.
    ///
    /// # Errors
    /// Returns `OutOfRange` for coordinates outside the surface.
    pub fn pixel_offset(&self, x: u32, y: u32, z: u32, slice: u32) -> SurfaceResult<u64> {
        match &self.resolved {
            Some(resolved) => resolved.plan.checked_pixel_offset(x, y, z, slice),
            None => self.plan()?.plan.checked_pixel_offset(x, y, z, slice),
        }
    }

    #[must_use]
    pub const fn physical(&self) -> Option<&PhysicalAllocation> {
        self.physical.as_ref()
    }

    // -------------------------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------------------------

    /// Plans the surface, allocates its physical memory and maps it in the owning context.
    ///
    /// Nothing is left allocated when this fails.
    ///
    /// # Errors
    /// * `InvalidState` unless the surface is unallocated.
    /// * Planning errors for an invalid descriptor.
    /// * Allocator failures from the physical allocation, the device mapping or the debug fill.
    pub fn alloc(&mut self) -> SurfaceResult<()> {
        if self.state != SurfaceState::Unallocated {
            return Err(self.invalid_state("allocate"));
        }

        let run = self.run.clone();
        let allocator = run.allocator();
        let planner = AllocationPlanner::new(run.config(), allocator.capabilities());

        let mut resolved = planner.plan(&self.desc)?;
        let physical = planner.allocate(allocator, &self.desc, &mut resolved, self.owner.id)?;

        let mut owner = PerContextState::owner(self.owner, physical.handles());
        let reserve = needs_virtual_reservation(&resolved, false);
        match mapper::establish_device_mapping(
            allocator,
            &resolved,
            self.desc.address_model,
            &owner.handles,
            self.owner.id,
            reserve,
        ) {
            Ok(mapping) => owner.device = Some(mapping),
            Err(e) => {
                physical.release(allocator);
                return Err(e);
            }
        }

        if let Some(pattern) = run.config().fill_pattern
            && let Err(e) = pixel::debug_fill(allocator, &physical, pattern)
        {
            owner.teardown(allocator);
            physical.release(allocator);
            return Err(e);
        }

        log::debug!(
            "Surface '{}' allocated: 0x{:x} bytes in {} partition(s), device address 0x{:x}",
            self.desc.name,
            resolved.plan.size,
            physical.partitions.len(),
            owner.device.as_ref().map_or(0, DeviceMapping::address)
        );

        self.resolved = Some(resolved);
        self.physical = Some(physical);
        self.contexts = Some(ContextMap::new(owner));
        self.state = SurfaceState::Allocated;
        Ok(())
    }

    /// Releases everything the surface holds.
    ///
    /// Teardown order: remote mappings, the CPU window, device mappings and duplicate handles,
    /// then the physical memory. Failures are logged and teardown continues. The surface ends in
    /// the terminal `Freed` state; calling this again does nothing.
    pub fn free(&mut self) {
        if self.state == SurfaceState::Freed {
            return;
        }

        let run = self.run.clone();
        let allocator = run.allocator();

        if let Some(contexts) = self.contexts.as_mut() {
            contexts.clear_remote(allocator);
        }
        if let Some(window) = self.cpu_window.take()
            && let Err(e) = window.unmap(allocator)
        {
            log::error!("Surface '{}': failed to unmap CPU window: {e}", self.desc.name);
        }
        if let Some(mut contexts) = self.contexts.take() {
            contexts.teardown(allocator);
        }
        if let Some(physical) = self.physical.take() {
            physical.release(allocator);
        }

        if self.state.is_allocated() {
            log::debug!("Surface '{}' freed", self.desc.name);
        }
        self.resolved = None;
        self.state = SurfaceState::Freed;
    }

    // -------------------------------------------------------------------------------------------
    // Device Mappings
    // -------------------------------------------------------------------------------------------

    /// Maps the surface for the device in `context` and returns its device address.
    ///
    /// Returns the existing address if the context already has a mapping.
    ///
    /// # Errors
    /// `InvalidContext` if the surface is not present in `context`, or the allocator's failure.
    pub fn establish_device_mapping(&mut self, context: u32) -> SurfaceResult<u64> {
        let run = self.run.clone();
        let model = self.desc.address_model;
        let (resolved, contexts) = self.live_mut("establish a device mapping")?;
        let state = contexts.get_mut(context)?;

        if let Some(device) = &state.device {
            return Ok(device.address());
        }

        let reserve = needs_virtual_reservation(resolved, !state.is_owner());
        let mapping =
            mapper::establish_device_mapping(run.allocator(), resolved, model, &state.handles, context, reserve)?;
        let address = mapping.address();
        state.device = Some(mapping);
        Ok(address)
    }

    /// Drops the device mapping in `context`, if any.
    ///
    /// # Errors
    /// `InvalidContext` if the surface is not present in `context`.
    pub fn release_device_mapping(&mut self, context: u32) -> SurfaceResult<()> {
        let run = self.run.clone();
        let (_, contexts) = self.live_mut("release a device mapping")?;
        if let Some(device) = contexts.get_mut(context)?.device.take() {
            device.release(run.allocator());
        }
        Ok(())
    }

    /// Device address of the surface in `context`.
    ///
    /// # Errors
    /// `InvalidContext` for unknown contexts, `Mapping` if the context has no device mapping.
    pub fn device_address(&self, context: u32) -> SurfaceResult<u64> {
        self.device_mapping(context)?
            .map(DeviceMapping::address)
            .ok_or_else(|| SurfaceError::Mapping(format!("no device mapping in context {context}")))
    }

    /// # Errors
    /// `InvalidState` before allocation, `InvalidContext` for unknown contexts.
    pub fn device_mapping(&self, context: u32) -> SurfaceResult<Option<&DeviceMapping>> {
        let (_, contexts) = self.live("query a device mapping")?;
        contexts
            .get(context)
            .map(|s| s.device.as_ref())
            .ok_or(SurfaceError::InvalidContext(context))
    }

    // -------------------------------------------------------------------------------------------
    // CPU Window
    // -------------------------------------------------------------------------------------------

    /// Opens the CPU window in the owning context. See [`Self::map_cpu_window_in`].
    ///
    /// # Errors
    /// Same as [`Self::map_cpu_window_in`].
    pub fn map_cpu_window(&mut self, offset: u64, size: u64) -> SurfaceResult<()> {
        self.map_cpu_window_in(self.owner.id, offset, size)
    }

    /// Opens the CPU window over `size` bytes at surface offset `offset`, through the handle held
    /// in `context`. [`MAP_ENTIRE`] maps the rest of the partition.
    ///
    /// # Errors
    /// * `AlreadyMapped` while a window is open.
    /// * `OutOfRange` for offsets outside the surface or ranges crossing a partition.
    /// * `InvalidContext` if the surface is not present in `context`.
    pub fn map_cpu_window_in(&mut self, context: u32, offset: u64, size: u64) -> SurfaceResult<()> {
        let (resolved, contexts) = self.live("map a CPU window")?;
        if self.cpu_window.is_some() {
            return Err(SurfaceError::AlreadyMapped);
        }
        let state = contexts.get(context).ok_or(SurfaceError::InvalidContext(context))?;
        let window = mapper::map_cpu_window(self.run.allocator(), resolved, &state.handles, context, offset, size)?;

        self.cpu_window = Some(window);
        self.state = SurfaceState::Mapped;
        Ok(())
    }

    /// Maps the smallest page-aligned range covering rectangle `(x, y, w, h)` of slice 0.
    ///
    /// # Errors
    /// `OutOfRange` for rectangles outside the surface, otherwise as [`Self::map_cpu_window`].
    pub fn map_rect_region(&mut self, x: u32, y: u32, w: u32, h: u32) -> SurfaceResult<()> {
        let (resolved, _) = self.live("map a region")?;
        let (offset, size) = mapper::rect_window(resolved, x, y, w, h)?;
        self.map_cpu_window(offset, size)
    }

    /// Closes the CPU window. Does nothing if none is open.
    ///
    /// # Errors
    /// Propagates the allocator's unmap failure; the window is considered closed regardless.
    pub fn unmap_cpu_window(&mut self) -> SurfaceResult<()> {
        let Some(window) = self.cpu_window.take() else {
            return Ok(());
        };
        if self.state == SurfaceState::Mapped {
            self.state = SurfaceState::Allocated;
        }
        window.unmap(self.run.allocator())
    }

    #[must_use]
    pub const fn cpu_window(&self) -> Option<&CpuWindow> {
        self.cpu_window.as_ref()
    }

    pub const fn cpu_window_mut(&mut self) -> Option<&mut CpuWindow> {
        self.cpu_window.as_mut()
    }

    // -------------------------------------------------------------------------------------------
    // Duplicates
    // -------------------------------------------------------------------------------------------

    /// Makes the surface usable from another execution context.
    ///
    /// Duplicates every physical handle into `context`, maps the surface there and replays the
    /// existing remote mappings. Duplicating into a context that already has the surface is a no-op.
    ///
    /// # Errors
    /// `InvalidContext` for the owning context, or the allocator's failure (after rollback).
    pub fn duplicate(&mut self, context: ExecutionContext) -> SurfaceResult<()> {
        let run = self.run.clone();
        let allocator = run.allocator();
        let model = self.desc.address_model;
        let (resolved, contexts) = self.live_mut("duplicate")?;

        if context.id == contexts.primary_id() {
            return Err(SurfaceError::InvalidContext(context.id));
        }
        if contexts.contains(context.id) {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(contexts.primary().handles.len());
        for &handle in &contexts.primary().handles {
            match allocator.duplicate_handle(handle, context.id) {
                Ok(dup) => handles.push(dup),
                Err(e) => {
                    PerContextState::duplicate(context, handles).teardown(allocator);
                    return Err(e);
                }
            }
        }

        let mut state = PerContextState::duplicate(context, handles);
        if let Err(e) = replay_into(allocator, resolved, model, contexts.primary(), &mut state) {
            state.teardown(allocator);
            return Err(e);
        }

        let replayed = state.remote.len();
        contexts.insert_duplicate(state);
        log::debug!(
            "Surface '{}' duplicated into context {} ({replayed} remote mapping(s) replayed)",
            self.desc.name,
            context.id
        );
        Ok(())
    }

    /// Releases everything the surface holds in a duplicate context.
    ///
    /// # Errors
    /// `InvalidContext` for the owning context or a context without a duplicate.
    pub fn remove_duplicate(&mut self, context: u32) -> SurfaceResult<()> {
        {
            let (_, contexts) = self.live("remove a duplicate")?;
            if context == contexts.primary_id() || !contexts.contains(context) {
                return Err(SurfaceError::InvalidContext(context));
            }
        }
        if self.cpu_window.as_ref().is_some_and(|w| w.context() == context) {
            self.unmap_cpu_window()?;
        }

        let run = self.run.clone();
        let (_, contexts) = self.live_mut("remove a duplicate")?;
        contexts.remove_duplicate(context)?.teardown(run.allocator());
        Ok(())
    }

    /// Context ids holding the surface, owner first.
    #[must_use]
    pub fn contexts(&self) -> Vec<u32> {
        self.contexts.as_ref().map_or_else(Vec::new, ContextMap::ids)
    }

    // -------------------------------------------------------------------------------------------
    // Remote Mappings
    // -------------------------------------------------------------------------------------------

    fn peer_kind(&self, resolved: &ResolvedPlan, remote: u32) -> SurfaceResult<RemoteKind> {
        if !resolved.location.is_device_local() {
            return Err(SurfaceError::Configuration(format!(
                "peer mappings need device memory, surface is in {}",
                resolved.location.as_str()
            )));
        }
        if resolved.plan.is_split() {
            return Err(SurfaceError::Configuration("split surfaces cannot be peer mapped".into()));
        }
        if self.desc.address_model != AddressModel::Paged {
            return Err(SurfaceError::Configuration(
                "peer mappings need the paged address model".into(),
            ));
        }

        if remote == self.owner.id {
            if self.owner.sub_contexts != 1 {
                return Err(SurfaceError::Configuration(format!(
                    "loopback mapping needs a single sub-context owner, context {} has {}",
                    self.owner.id, self.owner.sub_contexts
                )));
            }
            Ok(RemoteKind::Loopback)
        } else if self.run.allocator().capabilities().contains(DeviceCaps::PEER) {
            Ok(RemoteKind::Peer)
        } else {
            Err(SurfaceError::Unsupported("peer mappings".into()))
        }
    }

    /// Creates `key` in every context holding the surface.
    ///
    /// Returns whether the owner's mapping was newly created.
    fn create_remote(&mut self, key: RemoteMappingKey, kind: RemoteKind) -> SurfaceResult<bool> {
        let run = self.run.clone();
        let allocator = run.allocator();
        let (resolved, contexts) = self.live_mut("create a remote mapping")?;
        let size = resolved.plan.size;
        let page = resolved.page_bytes();

        let result = contexts.fan_out(|state| {
            let handle = *state
                .handles
                .first()
                .ok_or_else(|| SurfaceError::Mapping("surface has no physical handle".into()))?;
            state.remote.create(allocator, key, kind, handle, size, page)
        });

        match result {
            Ok(done) => Ok(done.first().is_some_and(|&(_, created)| created)),
            Err((done, e)) => {
                for (id, created) in done {
                    if created && let Ok(state) = contexts.get_mut(id) {
                        state.remote.remove(allocator, &key);
                    }
                }
                Err(e)
            }
        }
    }

    fn create_remote_set(&mut self, keys: &[RemoteMappingKey], kind: RemoteKind) -> SurfaceResult<()> {
        let mut created = Vec::new();
        for &key in keys {
            match self.create_remote(key, kind) {
                Ok(true) => created.push(key),
                Ok(false) => {}
                Err(e) => {
                    for key in &created {
                        if let Err(remove_err) = self.remove_mapping(key) {
                            log::error!(
                                "Failed to roll back remote mapping into context {}: {remove_err}",
                                key.remote_context
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Makes the surface visible to `remote` over peer link `peer_link`.
    ///
    /// One mapping is created per local and remote sub-context pair, and replayed into every
    /// duplicate. Mapping into the owning context itself creates loopback mappings. Existing keys
    /// are left untouched.
    ///
    /// # Errors
    /// * `Configuration` for surfaces outside device memory, split or segmented surfaces, or a
    ///   loopback on a multi-sub-context owner.
    /// * `Unsupported` if the device has no peer capability.
    /// * The allocator's failure, after the mappings created by this call are removed.
    pub fn create_peer_mapping(
        &mut self,
        remote: ExecutionContext,
        peer_link: u32,
    ) -> SurfaceResult<Vec<RemoteMappingKey>> {
        let (resolved, _) = self.live("create a peer mapping")?;
        let kind = self.peer_kind(resolved, remote.id)?;

        let keys: Vec<_> = (0..self.owner.sub_contexts)
            .flat_map(|local| {
                (0..remote.sub_contexts).map(move |sub| RemoteMappingKey::new(local, remote.id, sub, peer_link))
            })
            .collect();
        self.create_remote_set(&keys, kind)?;
        Ok(keys)
    }

    /// Creates the peer mapping for a single key and returns the owner's mapping.
    ///
    /// # Errors
    /// As [`Self::create_peer_mapping`]; `InvalidContext` if `key.local_index` names no local
    /// sub-context.
    pub fn create_peer_mapping_for(&mut self, key: RemoteMappingKey) -> SurfaceResult<AddressMapping> {
        let (resolved, _) = self.live("create a peer mapping")?;
        let kind = self.peer_kind(resolved, key.remote_context)?;
        if key.local_index >= self.owner.sub_contexts {
            return Err(SurfaceError::InvalidContext(key.local_index));
        }

        self.create_remote(key, kind)?;
        self.remote_mapping(&key)
            .copied()
            .ok_or_else(|| SurfaceError::Mapping(format!("{key:?} vanished after creation")))
    }

    /// Shares a host-memory surface with `remote`.
    ///
    /// # Errors
    /// * `Configuration` for device-memory or split surfaces.
    /// * `InvalidContext` when `remote` is the owning context.
    /// * The allocator's failure, after the mappings created by this call are removed.
    pub fn create_shared_mapping(&mut self, remote: ExecutionContext) -> SurfaceResult<Vec<RemoteMappingKey>> {
        let (resolved, _) = self.live("create a shared mapping")?;
        if resolved.location.is_device_local() {
            return Err(SurfaceError::Configuration(
                "shared mappings need host memory; use a peer mapping".into(),
            ));
        }
        if resolved.plan.is_split() {
            return Err(SurfaceError::Configuration("split surfaces cannot be shared".into()));
        }
        if remote.id == self.owner.id {
            return Err(SurfaceError::InvalidContext(remote.id));
        }

        let keys: Vec<_> = (0..remote.sub_contexts)
            .map(|sub| RemoteMappingKey::new(0, remote.id, sub, NO_PEER_LINK))
            .collect();
        self.create_remote_set(&keys, RemoteKind::Shared)?;
        Ok(keys)
    }

    /// Removes `key` from every context; returns whether the owner had it.
    ///
    /// # Errors
    /// `InvalidState` unless allocated.
    pub fn remove_mapping(&mut self, key: &RemoteMappingKey) -> SurfaceResult<bool> {
        let run = self.run.clone();
        let (_, contexts) = self.live_mut("remove a remote mapping")?;
        let removed = contexts
            .fan_out(|state| Ok(state.remote.remove(run.allocator(), key)))
            .map_err(|(_, e)| e)?;
        Ok(removed.first().is_some_and(|&(_, r)| r))
    }

    /// Removes every remote mapping into `context` from every context holding the surface.
    ///
    /// Returns the number removed from the owner.
    ///
    /// # Errors
    /// `InvalidState` unless allocated.
    pub fn remove_all_for_context(&mut self, context: u32) -> SurfaceResult<usize> {
        let run = self.run.clone();
        let (_, contexts) = self.live_mut("remove remote mappings")?;
        let removed = contexts
            .fan_out(|state| Ok(state.remote.remove_all_for_context(run.allocator(), context)))
            .map_err(|(_, e)| e)?;
        Ok(removed.first().map_or(0, |&(_, n)| n))
    }

    /// The owner's remote mapping for `key`.
    #[must_use]
    pub fn remote_mapping(&self, key: &RemoteMappingKey) -> Option<&AddressMapping> {
        self.contexts.as_ref()?.primary().remote.get(key)
    }

    /// The remote mapping for `key` made on behalf of `context`.
    #[must_use]
    pub fn remote_mapping_in(&self, context: u32, key: &RemoteMappingKey) -> Option<&AddressMapping> {
        self.contexts.as_ref()?.get(context)?.remote.get(key)
    }

    // -------------------------------------------------------------------------------------------
    // Physical Addresses
    // -------------------------------------------------------------------------------------------

    /// Physical address of surface byte `offset`.
    ///
    /// # Errors
    /// `OutOfRange` for offsets beyond the surface, or the allocator's failure.
    pub fn physical_address(&self, offset: u64) -> SurfaceResult<u64> {
        let (resolved, contexts) = self.live("query a physical address")?;
        let (partition, part_offset) = resolved.plan.locate(offset).ok_or(SurfaceError::OutOfRange {
            offset,
            limit: resolved.plan.size,
        })?;
        let handle = *contexts
            .primary()
            .handles
            .get(partition)
            .ok_or_else(|| SurfaceError::Mapping(format!("no handle for partition {partition}")))?;
        self.run.allocator().query_physical_address(handle, part_offset)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.free();
    }
}

/// Maps a duplicate and replays the owner's remote mappings onto it.
fn replay_into(
    allocator: &dyn MemoryAllocator,
    resolved: &ResolvedPlan,
    model: AddressModel,
    owner: &PerContextState,
    state: &mut PerContextState,
) -> SurfaceResult<()> {
    let reserve = needs_virtual_reservation(resolved, true);
    state.device = Some(mapper::establish_device_mapping(
        allocator,
        resolved,
        model,
        &state.handles,
        state.context.id,
        reserve,
    )?);

    let handle = *state
        .handles
        .first()
        .ok_or_else(|| SurfaceError::Mapping("duplicate has no handle".into()))?;
    for (key, kind, _) in owner.remote.iter() {
        state
            .remote
            .create(allocator, *key, kind, handle, resolved.plan.size, resolved.page_bytes())?;
    }
    Ok(())
}
