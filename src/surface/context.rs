//! Run-wide context and the per-execution-context state of a surface.

use crate::error::{SurfaceError, SurfaceResult};
use crate::rm::device::{Handle, MemoryAllocator};
use crate::surface::mapper::DeviceMapping;
use crate::surface::peer::RemoteRegistry;
use crate::surface::planner::PlannerConfig;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use crate::rm::device::ExecutionContext;

/// The allocator and policy shared by every surface of a run.
#[derive(Clone)]
pub struct RunContext {
    allocator: Arc<dyn MemoryAllocator>,
    config: Arc<PlannerConfig>,
}

impl RunContext {
    #[must_use]
    pub fn new(allocator: Arc<dyn MemoryAllocator>, config: PlannerConfig) -> Self {
        Self {
            allocator,
            config: Arc::new(config),
        }
    }

    /// A run with the default policy.
    #[must_use]
    pub fn with_allocator(allocator: Arc<dyn MemoryAllocator>) -> Self {
        Self::new(allocator, PlannerConfig::default())
    }

    #[must_use]
    pub fn allocator(&self) -> &dyn MemoryAllocator {
        self.allocator.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("caps", &self.allocator.capabilities())
            .field("config", &self.config)
            .finish()
    }
}

// ===============================================================================================
// Per-Context State
// ===============================================================================================

/// What a surface holds in one execution context.
#[derive(Debug)]
pub struct PerContextState {
    pub context: ExecutionContext,
    /// One handle per partition. The primary context holds the physical handles; other contexts
    /// hold duplicates of them.
    pub handles: Vec<Handle>,
    pub device: Option<DeviceMapping>,
    pub remote: RemoteRegistry,
    owner: bool,
}

impl PerContextState {
    #[must_use]
    pub fn owner(context: ExecutionContext, handles: Vec<Handle>) -> Self {
        Self {
            context,
            handles,
            device: None,
            remote: RemoteRegistry::new(),
            owner: true,
        }
    }

    #[must_use]
    pub fn duplicate(context: ExecutionContext, handles: Vec<Handle>) -> Self {
        Self {
            owner: false,
            ..Self::owner(context, handles)
        }
    }

    /// Whether this state owns the physical allocation.
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        self.owner
    }

    /// Releases remote mappings, the device mapping and duplicated handles.
    ///
    /// Physical handles held by the owner are left to the caller.
    pub fn teardown(&mut self, allocator: &dyn MemoryAllocator) {
        self.remote.clear(allocator);
        if let Some(device) = self.device.take() {
            device.release(allocator);
        }
        if !self.owner {
            for handle in self.handles.drain(..) {
                if let Err(e) = allocator.free_handle(handle) {
                    log::error!("Failed to free duplicate handle 0x{handle:x}: {e}");
                }
            }
        }
    }
}

/// Per-context states of a surface: the owner plus its duplicates keyed by context id.
#[derive(Debug)]
pub struct ContextMap {
    owner: PerContextState,
    duplicates: BTreeMap<u32, PerContextState>,
}

impl ContextMap {
    #[must_use]
    pub fn new(owner: PerContextState) -> Self {
        Self {
            owner,
            duplicates: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn primary_id(&self) -> u32 {
        self.owner.context.id
    }

    #[must_use]
    pub const fn primary(&self) -> &PerContextState {
        &self.owner
    }

    pub const fn primary_mut(&mut self) -> &mut PerContextState {
        &mut self.owner
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&PerContextState> {
        if id == self.primary_id() {
            Some(&self.owner)
        } else {
            self.duplicates.get(&id)
        }
    }

    /// # Errors
    /// Returns `InvalidContext` if the surface is not present in `id`.
    pub fn get_mut(&mut self, id: u32) -> SurfaceResult<&mut PerContextState> {
        if id == self.primary_id() {
            Ok(&mut self.owner)
        } else {
            self.duplicates.get_mut(&id).ok_or(SurfaceError::InvalidContext(id))
        }
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        id == self.primary_id() || self.duplicates.contains_key(&id)
    }

    pub fn insert_duplicate(&mut self, state: PerContextState) {
        self.duplicates.insert(state.context.id, state);
    }

    /// Removes a duplicate context.
    ///
    /// # Errors
    /// Returns `InvalidContext` for the owner or an unknown id.
    pub fn remove_duplicate(&mut self, id: u32) -> SurfaceResult<PerContextState> {
        self.duplicates.remove(&id).ok_or(SurfaceError::InvalidContext(id))
    }

    #[must_use]
    pub fn duplicate_count(&self) -> usize {
        self.duplicates.len()
    }

    /// Context ids, owner first.
    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        std::iter::once(self.primary_id())
            .chain(self.duplicates.keys().copied())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PerContextState> {
        std::iter::once(&self.owner).chain(self.duplicates.values())
    }

    /// Runs `f` on every context, owner first.
    ///
    /// Stops at the first failure and returns the ids already visited with the error, so callers
    /// can undo the partial fan-out.
    pub fn fan_out<T>(
        &mut self,
        mut f: impl FnMut(&mut PerContextState) -> SurfaceResult<T>,
    ) -> Result<Vec<(u32, T)>, (Vec<(u32, T)>, SurfaceError)> {
        let mut done = Vec::with_capacity(1 + self.duplicates.len());
        let states = std::iter::once(&mut self.owner).chain(self.duplicates.values_mut());
        for state in states {
            let id = state.context.id;
            match f(state) {
                Ok(value) => done.push((id, value)),
                Err(e) => return Err((done, e)),
            }
        }
        Ok(done)
    }

    /// Releases the remote mappings of every context.
    pub fn clear_remote(&mut self, allocator: &dyn MemoryAllocator) {
        for state in std::iter::once(&mut self.owner).chain(self.duplicates.values_mut()) {
            state.remote.clear(allocator);
        }
    }

    /// Tears down every duplicate, then the owner's mappings.
    ///
    /// The owner's physical handles stay in place for the caller to release.
    pub fn teardown(&mut self, allocator: &dyn MemoryAllocator) {
        for (_, mut state) in std::mem::take(&mut self.duplicates) {
            state.teardown(allocator);
        }
        self.owner.teardown(allocator);
    }
}
