//! Cross-context mappings: peer, loopback and shared windows keyed for idempotent creation.

use crate::error::SurfaceResult;
use crate::rm::device::{Handle, MapFlags, MapRequest, MemoryAllocator, VirtualRequest};
use crate::surface::mapper::AddressMapping;
use crate::utils::align_up;
use std::collections::BTreeMap;

/// Peer-link id recorded for mappings that do not travel over a peer link.
pub const NO_PEER_LINK: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteMappingKey {
    /// Local sub-context whose memory is exposed.
    pub local_index: u32,
    pub remote_context: u32,
    pub remote_sub_context: u32,
    pub peer_link: u32,
}

impl RemoteMappingKey {
    #[must_use]
    pub const fn new(local_index: u32, remote_context: u32, remote_sub_context: u32, peer_link: u32) -> Self {
        Self {
            local_index,
            remote_context,
            remote_sub_context,
            peer_link,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// Device memory seen by another device.
    Peer,
    /// Device memory seen by its own device through the peer path.
    Loopback,
    /// Host memory shared with another context.
    Shared,
}

impl RemoteKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Loopback => "loopback",
            Self::Shared => "shared",
        }
    }

    #[must_use]
    pub fn map_flags(self, page_size: u64) -> MapFlags {
        let kind = match self {
            Self::Peer => MapFlags::PEER,
            Self::Loopback => MapFlags::LOOPBACK,
            Self::Shared => MapFlags::SHARED,
        };
        MapFlags::READ_WRITE | kind | MapFlags::for_page_size(page_size)
    }
}

#[derive(Debug, Clone, Copy)]
struct RemoteEntry {
    kind: RemoteKind,
    mapping: AddressMapping,
    virt_handle: Handle,
}

/// Remote mappings of one execution context's view of a surface.
///
/// At most one mapping exists per key; the registry owns the virtual windows it creates in the
/// remote contexts.
#[derive(Debug, Default)]
pub struct RemoteRegistry {
    entries: BTreeMap<RemoteMappingKey, RemoteEntry>,
}

impl RemoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &RemoteMappingKey) -> Option<&AddressMapping> {
        self.entries.get(key).map(|e| &e.mapping)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RemoteMappingKey, RemoteKind, &AddressMapping)> {
        self.entries.iter().map(|(k, e)| (k, e.kind, &e.mapping))
    }

    /// Maps `size` bytes of `phys` into the remote context named by `key`.
    ///
    /// Returns `Ok(false)` without touching the allocator when the key is already mapped.
    ///
    /// # Errors
    /// Propagates reservation or bind failures; a reservation is released if its bind fails.
    pub fn create(
        &mut self,
        allocator: &dyn MemoryAllocator,
        key: RemoteMappingKey,
        kind: RemoteKind,
        phys: Handle,
        size: u64,
        page_size: u64,
    ) -> SurfaceResult<bool> {
        if self.entries.contains_key(&key) {
            return Ok(false);
        }

        let virt = allocator.allocate_virtual(&VirtualRequest {
            context: key.remote_context,
            size: align_up(size, page_size),
            align: page_size,
            page_size,
            address_range: None,
        })?;

        let flags = kind.map_flags(page_size);
        let req = MapRequest {
            context: key.remote_context,
            sub_context: key.remote_sub_context,
            virt: Some(&virt),
            virt_offset: 0,
            phys,
            offset: 0,
            size,
            flags,
            peer_link: (key.peer_link != NO_PEER_LINK).then_some(key.peer_link),
        };

        let address = allocator.map_virtual_to_physical(&req).inspect_err(|e| {
            log::error!(
                "{} mapping into context {} failed: {e}",
                kind.as_str(),
                key.remote_context
            );
            if let Err(free_err) = allocator.free_handle(virt.handle) {
                log::error!("Failed to free virtual handle 0x{:x}: {free_err}", virt.handle);
            }
        })?;

        log::debug!(
            "{} mapping {key:?} at 0x{address:x} ({size:#x} bytes)",
            kind.as_str()
        );

        self.entries.insert(
            key,
            RemoteEntry {
                kind,
                mapping: AddressMapping {
                    context: key.remote_context,
                    sub_context: key.remote_sub_context,
                    partition: 0,
                    address,
                    offset: 0,
                    size,
                    flags,
                    page_size,
                },
                virt_handle: virt.handle,
            },
        );
        Ok(true)
    }

    /// Tears down the mapping for `key`; returns whether one existed.
    pub fn remove(&mut self, allocator: &dyn MemoryAllocator, key: &RemoteMappingKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                Self::release(allocator, &entry);
                true
            }
            None => false,
        }
    }

    /// Tears down every mapping into `context`; returns how many were removed.
    pub fn remove_all_for_context(&mut self, allocator: &dyn MemoryAllocator, context: u32) -> usize {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|k| k.remote_context == context)
            .copied()
            .collect();
        for key in &keys {
            self.remove(allocator, key);
        }
        keys.len()
    }

    pub fn clear(&mut self, allocator: &dyn MemoryAllocator) {
        for entry in std::mem::take(&mut self.entries).values() {
            Self::release(allocator, entry);
        }
    }

    fn release(allocator: &dyn MemoryAllocator, entry: &RemoteEntry) {
        let m = &entry.mapping;
        if let Err(e) = allocator.unmap_virtual_to_physical(m.context, m.address) {
            log::error!("Failed to unmap remote VA 0x{:x} in context {}: {e}", m.address, m.context);
        }
        if let Err(e) = allocator.free_handle(entry.virt_handle) {
            log::error!("Failed to free virtual handle 0x{:x}: {e}", entry.virt_handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rm::attrs::{AllocAttrs, Location};
    use crate::rm::device::PhysicalRequest;
    use crate::rm::host::{HostAllocator, HostConfig};

    fn phys(host: &HostAllocator, size: u64) -> Handle {
        host.allocate_physical(&PhysicalRequest {
            context: 1,
            size,
            align: 4096,
            attrs: AllocAttrs::new(Location::Framebuffer),
            address_range: None,
        })
        .unwrap()
        .handle
    }

    #[test]
    fn create_is_idempotent() {
        let host = HostAllocator::default();
        let handle = phys(&host, 8192);
        let mut registry = RemoteRegistry::new();
        let key = RemoteMappingKey::new(0, 2, 0, 1);

        assert!(registry.create(&host, key, RemoteKind::Peer, handle, 8192, 4096).unwrap());
        let first = *registry.get(&key).unwrap();
        assert!(!registry.create(&host, key, RemoteKind::Peer, handle, 8192, 4096).unwrap());

        assert_eq!(registry.get(&key), Some(&first));
        assert_eq!(host.virtual_allocations(), 1);
        let (flags, link) = host.mapping_info(2, first.address).unwrap();
        assert!(flags.contains(MapFlags::PEER));
        assert_eq!(link, Some(1));
    }

    #[test]
    fn shared_mapping_carries_no_link() {
        let host = HostAllocator::default();
        let handle = phys(&host, 4096);
        let mut registry = RemoteRegistry::new();
        let key = RemoteMappingKey::new(0, 3, 0, NO_PEER_LINK);

        registry.create(&host, key, RemoteKind::Shared, handle, 4096, 4096).unwrap();
        let mapping = registry.get(&key).unwrap();
        let (flags, link) = host.mapping_info(3, mapping.address).unwrap();
        assert!(flags.contains(MapFlags::SHARED));
        assert_eq!(link, None);
    }

    #[test]
    fn failed_bind_frees_reservation() {
        let host = HostAllocator::new(HostConfig::default().fail_map_after(0));
        let handle = phys(&host, 4096);
        let mut registry = RemoteRegistry::new();

        let key = RemoteMappingKey::new(0, 2, 0, 0);
        assert!(registry.create(&host, key, RemoteKind::Peer, handle, 4096, 4096).is_err());
        assert!(registry.is_empty());
        assert_eq!(host.live_virtual(), 0);
    }

    #[test]
    fn remove_by_context() {
        let host = HostAllocator::default();
        let handle = phys(&host, 4096);
        let mut registry = RemoteRegistry::new();

        for (ctx, sub) in [(2, 0), (2, 1), (3, 0)] {
            let key = RemoteMappingKey::new(0, ctx, sub, 0);
            registry.create(&host, key, RemoteKind::Peer, handle, 4096, 4096).unwrap();
        }
        assert_eq!(registry.remove_all_for_context(&host, 2), 2);
        assert_eq!(registry.len(), 1);
        assert!(!registry.remove(&host, &RemoteMappingKey::new(0, 2, 0, 0)));

        registry.clear(&host);
        assert!(registry.is_empty());
        assert_eq!(host.live_virtual(), 0);
        assert_eq!(host.live_mappings(), 0);
    }
}
