use std::sync::Arc;
use surfmem_rs::rm::{DeviceCaps, HostAllocator, HostConfig, Location, MapFlags};
use surfmem_rs::surface::{
    ColorFormat, ExecutionContext, Layout, MAP_ENTIRE, PlannerConfig, RemoteMappingKey, RunContext, Surface,
    SurfaceDescriptor, SurfaceState,
};
use surfmem_rs::{SurfaceError, rm::AddressModel};

const OWNER: u32 = 1;

fn run_with(config: HostConfig, planner: PlannerConfig) -> (Arc<HostAllocator>, RunContext) {
    let host = Arc::new(HostAllocator::new(config));
    let run = RunContext::new(host.clone(), planner);
    (host, run)
}

fn host_run() -> (Arc<HostAllocator>, RunContext) {
    run_with(HostConfig::default(), PlannerConfig::new())
}

fn surface(run: &RunContext, desc: SurfaceDescriptor) -> Surface {
    Surface::new(run.clone(), ExecutionContext::new(OWNER), desc)
}

fn assert_no_leaks(host: &HostAllocator) {
    assert_eq!(host.live_physical(), 0, "physical handles leaked");
    assert_eq!(host.live_virtual(), 0, "virtual reservations leaked");
    assert_eq!(host.live_mappings(), 0, "bindings leaked");
    assert_eq!(host.live_cpu_windows(), 0, "CPU windows leaked");
}

#[test]
fn full_lifecycle_releases_everything() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(256, 256, ColorFormat::A8R8G8B8).with_name("color"));

    s.alloc().unwrap();
    assert_eq!(s.state(), SurfaceState::Allocated);
    assert_eq!(s.size().unwrap(), 1024 * 256);

    s.map_cpu_window(0, MAP_ENTIRE).unwrap();
    assert_eq!(s.state(), SurfaceState::Mapped);
    s.write_pixel(10, 20, 0, 0, 0xdead_beef).unwrap();
    assert_eq!(s.read_pixel(10, 20, 0, 0).unwrap(), 0xdead_beef);

    s.duplicate(ExecutionContext::new(2)).unwrap();
    s.create_peer_mapping(ExecutionContext::new(3), 0).unwrap();
    assert!(host.live_virtual() > 0);

    s.free();
    assert_eq!(s.state(), SurfaceState::Freed);
    assert_no_leaks(&host);

    s.free();
    assert!(matches!(s.alloc(), Err(SurfaceError::InvalidState { .. })));
}

#[test]
fn drop_frees_the_surface() {
    let (host, run) = host_run();
    {
        let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::Y8));
        s.alloc().unwrap();
        s.map_cpu_window(0, 4096).unwrap();
    }
    assert_no_leaks(&host);
}

#[test]
fn failed_physical_allocation_creates_no_virtual_state() {
    let (host, run) = run_with(HostConfig::default().fail_physical_after(0), PlannerConfig::new());
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));

    assert!(matches!(s.alloc(), Err(SurfaceError::Allocation(_))));
    assert_eq!(s.state(), SurfaceState::Unallocated);
    assert_eq!(host.virtual_allocations(), 0);
    assert_no_leaks(&host);
}

#[test]
fn failed_device_mapping_rolls_back_physical() {
    let (host, run) = run_with(HostConfig::default().fail_map_after(0), PlannerConfig::new());
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));

    assert!(matches!(s.alloc(), Err(SurfaceError::Mapping(_))));
    assert_eq!(s.state(), SurfaceState::Unallocated);
    assert_eq!(host.physical_allocations(), 1);
    assert_no_leaks(&host);
}

#[test]
fn descriptor_frozen_after_allocation() {
    let (_host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.set_descriptor(SurfaceDescriptor::new(32, 32, ColorFormat::Y8)).unwrap();
    assert_eq!(s.size().unwrap(), 64 * 32);

    s.alloc().unwrap();
    assert!(matches!(
        s.set_descriptor(SurfaceDescriptor::new(16, 16, ColorFormat::Y8)),
        Err(SurfaceError::InvalidState { .. })
    ));
}

#[test]
fn unmap_twice_is_a_no_op() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();

    s.unmap_cpu_window().unwrap();
    s.map_cpu_window(0, MAP_ENTIRE).unwrap();
    s.unmap_cpu_window().unwrap();
    s.unmap_cpu_window().unwrap();

    assert_eq!(s.state(), SurfaceState::Allocated);
    assert_eq!(host.live_cpu_windows(), 0);
}

#[test]
fn only_one_cpu_window() {
    let (_host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();

    s.map_cpu_window(0, 4096).unwrap();
    assert!(matches!(s.map_cpu_window(4096, 4096), Err(SurfaceError::AlreadyMapped)));
    assert!(matches!(
        s.map_cpu_window(s.size().unwrap(), 1),
        Err(SurfaceError::AlreadyMapped)
    ));

    s.unmap_cpu_window().unwrap();
    assert!(matches!(
        s.map_cpu_window(s.size().unwrap(), 1),
        Err(SurfaceError::OutOfRange { .. })
    ));
}

#[test]
fn operations_before_alloc_are_rejected() {
    let (_host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));

    assert!(matches!(s.map_cpu_window(0, 16), Err(SurfaceError::InvalidState { .. })));
    assert!(matches!(s.read_pixel(0, 0, 0, 0), Err(SurfaceError::NotMapped)));
    assert!(s.create_peer_mapping(ExecutionContext::new(2), 0).is_err());
    assert!(s.physical_address(0).is_err());
    // The layout can still be previewed.
    assert_eq!(s.pixel_offset(1, 1, 0, 0).unwrap(), 256 + 4);
}

#[test]
fn rect_region_limits_pixel_access() {
    let (_host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(1024, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();

    s.map_rect_region(0, 10, 8, 2).unwrap();
    let window = s.cpu_window().unwrap();
    assert_eq!(window.surface_offset(), 10 * 4096);
    assert_eq!(window.size(), 2 * 4096);

    s.write_pixel(3, 11, 0, 0, 7).unwrap();
    assert_eq!(s.read_pixel(3, 11, 0, 0).unwrap(), 7);
    assert!(matches!(s.read_pixel(0, 0, 0, 0), Err(SurfaceError::OutOfRange { .. })));
}

#[test]
fn fill_and_raw_bytes() {
    let (_host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::Y8));
    s.alloc().unwrap();
    s.map_cpu_window(0, MAP_ENTIRE).unwrap();

    s.fill(0x0403_0201).unwrap();
    let mut buf = [0u8; 6];
    s.read_bytes(2, &mut buf).unwrap();
    assert_eq!(buf, [3, 4, 1, 2, 3, 4]);

    s.write_bytes(64, &[9, 9]).unwrap();
    assert_eq!(s.read_pixel(1, 1, 0, 0).unwrap(), 9);
    assert!(s.write_bytes(s.size().unwrap() - 1, &[0, 0]).is_err());
}

#[test]
fn debug_fill_runs_on_alloc() {
    let (host, run) = run_with(HostConfig::default(), PlannerConfig::new().with_fill_pattern(0xcafe_f00d));
    let mut s = surface(&run, SurfaceDescriptor::new(128, 32, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();
    assert_eq!(host.live_cpu_windows(), 0);

    s.map_cpu_window(0, MAP_ENTIRE).unwrap();
    assert_eq!(s.read_pixel(5, 5, 0, 0).unwrap(), 0xcafe_f00d);
}

#[test]
fn split_surface_spans_two_locations() {
    let (host, run) = host_run();
    let desc = SurfaceDescriptor::new(1024, 256, ColorFormat::A8R8G8B8)
        .with_location(Location::Framebuffer)
        .with_split(Location::NonCoherent);
    let mut s = surface(&run, desc);
    s.alloc().unwrap();

    let plan = s.allocation_plan().unwrap();
    assert_eq!(plan.partitions, vec![524_288, 524_288]);
    assert_eq!(plan.partitions.iter().sum::<u64>(), plan.size);

    let physical = s.physical().unwrap();
    assert_eq!(host.location_of(physical.partitions[0].handle), Some(Location::Framebuffer));
    assert_eq!(host.location_of(physical.partitions[1].handle), Some(Location::NonCoherent));

    let device = s.device_mapping(OWNER).unwrap().unwrap();
    assert!(device.virt.is_some());
    assert_eq!(device.windows[1].address, device.windows[0].address + 524_288);

    // A CPU window cannot straddle the partition boundary.
    assert!(s.map_cpu_window(524_288 - 4096, 8192).is_err());
    s.map_cpu_window(524_288, MAP_ENTIRE).unwrap();
    assert_eq!(s.cpu_window().unwrap().partition(), 1);

    let pa = s.physical_address(524_288 + 0x10).unwrap();
    assert_eq!(pa, s.physical_address(524_288).unwrap() + 0x10);

    assert!(s.create_peer_mapping(ExecutionContext::new(2), 0).is_err());
    assert!(s.create_shared_mapping(ExecutionContext::new(2)).is_err());

    s.free();
    assert_no_leaks(&host);
}

#[test]
fn allocator_pitch_is_adopted() {
    let (_host, run) = run_with(HostConfig::default().with_pitch_align(512), PlannerConfig::new());
    let mut s = surface(&run, SurfaceDescriptor::new(100, 4, ColorFormat::A8R8G8B8).with_extra_alloc_size(4096));
    assert_eq!(s.pitch().unwrap(), 448);

    s.alloc().unwrap();
    assert_eq!(s.pitch().unwrap(), 512);
    assert_eq!(s.size().unwrap(), 448 * 4 + 4096);
    assert_eq!(s.pixel_offset(0, 1, 0, 0).unwrap(), 512);
}

#[test]
fn virtual_hint_pins_device_address() {
    let (_host, run) = host_run();
    let va = 0x40_0000_0000;
    let mut s = surface(
        &run,
        SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8).with_virtual_address_hint(va, None),
    );
    s.alloc().unwrap();
    assert_eq!(s.device_address(OWNER).unwrap(), va);
}

#[test]
fn segmented_surfaces_use_physical_addresses() {
    let (host, run) = host_run();
    let mut s = surface(
        &run,
        SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8).with_address_model(AddressModel::Segmented),
    );
    s.alloc().unwrap();

    assert_eq!(s.device_address(OWNER).unwrap(), s.physical_address(0).unwrap());
    assert_eq!(host.live_mappings(), 0);
    assert!(s.create_peer_mapping(ExecutionContext::new(2), 0).is_err());
}

#[test]
fn device_mapping_can_be_released_and_rebuilt() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();
    assert_eq!(host.live_mappings(), 1);

    s.release_device_mapping(OWNER).unwrap();
    assert_eq!(host.live_mappings(), 0);
    assert!(s.device_address(OWNER).is_err());

    let address = s.establish_device_mapping(OWNER).unwrap();
    assert_eq!(s.establish_device_mapping(OWNER).unwrap(), address);
    assert_eq!(host.live_mappings(), 1);
    assert!(matches!(
        s.establish_device_mapping(42),
        Err(SurfaceError::InvalidContext(42))
    ));
}

// ===============================================================================================
// Duplicates and remote mappings
// ===============================================================================================

#[test]
fn peer_mapping_is_idempotent() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(256, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();

    let keys = s.create_peer_mapping(ExecutionContext::new(2), 5).unwrap();
    assert_eq!(keys, vec![RemoteMappingKey::new(0, 2, 0, 5)]);
    let first = *s.remote_mapping(&keys[0]).unwrap();
    let allocations = host.virtual_allocations();

    let again = s.create_peer_mapping(ExecutionContext::new(2), 5).unwrap();
    assert_eq!(again, keys);
    assert_eq!(host.virtual_allocations(), allocations);
    assert_eq!(s.remote_mapping(&keys[0]), Some(&first));

    let (flags, link) = host.mapping_info(2, first.address).unwrap();
    assert!(flags.contains(MapFlags::PEER));
    assert_eq!(link, Some(5));
}

#[test]
fn peer_mapping_covers_every_sub_context_pair() {
    let (_host, run) = host_run();
    let mut s = Surface::new(
        run,
        ExecutionContext::new(OWNER).with_sub_contexts(2),
        SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8),
    );
    s.alloc().unwrap();

    let keys = s.create_peer_mapping(ExecutionContext::new(2).with_sub_contexts(3), 0).unwrap();
    assert_eq!(keys.len(), 6);
    assert!(keys.iter().all(|k| s.remote_mapping(k).is_some()));

    assert_eq!(s.remove_all_for_context(2).unwrap(), 6);
    assert!(keys.iter().all(|k| s.remote_mapping(k).is_none()));

    // Loopback needs a single sub-context owner.
    assert!(matches!(
        s.create_peer_mapping(ExecutionContext::new(OWNER), 0),
        Err(SurfaceError::Configuration(_))
    ));
}

#[test]
fn loopback_mapping() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();

    let key = RemoteMappingKey::new(0, OWNER, 0, 0);
    let mapping = s.create_peer_mapping_for(key).unwrap();
    let (flags, _) = host.mapping_info(OWNER, mapping.address).unwrap();
    assert!(flags.contains(MapFlags::LOOPBACK));
    assert_ne!(mapping.address, s.device_address(OWNER).unwrap());

    assert!(matches!(
        s.create_peer_mapping_for(RemoteMappingKey::new(1, 2, 0, 0)),
        Err(SurfaceError::InvalidContext(1))
    ));
}

#[test]
fn peer_preconditions() {
    let (_host, run) = host_run();
    let mut sys = surface(
        &run,
        SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8).with_location(Location::Coherent),
    );
    sys.alloc().unwrap();
    assert!(matches!(
        sys.create_peer_mapping(ExecutionContext::new(2), 0),
        Err(SurfaceError::Configuration(_))
    ));

    let (_host, run) = run_with(
        HostConfig::new(DeviceCaps::DISCRETE_GPU - DeviceCaps::PEER),
        PlannerConfig::new(),
    );
    let mut fb = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    fb.alloc().unwrap();
    assert!(matches!(
        fb.create_peer_mapping(ExecutionContext::new(2), 0),
        Err(SurfaceError::Unsupported(_))
    ));
}

#[test]
fn shared_mapping_for_host_memory() {
    let (host, run) = host_run();
    let mut s = surface(
        &run,
        SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8).with_location(Location::NonCoherent),
    );
    s.alloc().unwrap();

    let keys = s.create_shared_mapping(ExecutionContext::new(4)).unwrap();
    let mapping = s.remote_mapping(&keys[0]).unwrap();
    let (flags, link) = host.mapping_info(4, mapping.address).unwrap();
    assert!(flags.contains(MapFlags::SHARED));
    assert_eq!(link, None);

    assert!(matches!(
        s.create_shared_mapping(ExecutionContext::new(OWNER)),
        Err(SurfaceError::InvalidContext(OWNER))
    ));
    assert!(s.remove_mapping(&keys[0]).unwrap());
    assert!(!s.remove_mapping(&keys[0]).unwrap());
}

#[test]
fn remote_mappings_fan_out_to_duplicates() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();

    let early = s.create_peer_mapping(ExecutionContext::new(3), 0).unwrap()[0];
    s.duplicate(ExecutionContext::new(2)).unwrap();
    assert_eq!(s.contexts(), vec![OWNER, 2]);
    assert!(s.remote_mapping_in(2, &early).is_some(), "existing mapping replayed");
    assert_eq!(host.owner_context(s.physical().unwrap().partitions[0].handle), Some(OWNER));

    let late = s.create_peer_mapping(ExecutionContext::new(4), 1).unwrap()[0];
    assert!(s.remote_mapping_in(2, &late).is_some(), "new mapping fanned out");
    assert_ne!(
        s.remote_mapping_in(2, &late).unwrap().address,
        s.remote_mapping(&late).unwrap().address
    );

    assert!(s.remove_mapping(&late).unwrap());
    assert!(s.remote_mapping_in(2, &late).is_none());

    s.duplicate(ExecutionContext::new(2)).unwrap();
    assert!(matches!(
        s.duplicate(ExecutionContext::new(OWNER)),
        Err(SurfaceError::InvalidContext(OWNER))
    ));

    s.remove_duplicate(2).unwrap();
    assert_eq!(s.contexts(), vec![OWNER]);
    assert!(matches!(s.remove_duplicate(2), Err(SurfaceError::InvalidContext(2))));
    assert!(matches!(s.remove_duplicate(OWNER), Err(SurfaceError::InvalidContext(OWNER))));

    s.free();
    assert_no_leaks(&host);
}

fn live_counts(host: &HostAllocator) -> (usize, usize, usize) {
    (host.live_physical(), host.live_virtual(), host.live_mappings())
}

#[test]
fn failed_duplicate_fan_out_rolls_back_owner() {
    // Binds: alloc, duplicate device mapping, owner peer mapping; the duplicate's peer bind fails.
    let (host, run) = run_with(HostConfig::default().fail_map_after(3), PlannerConfig::new());
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();
    s.duplicate(ExecutionContext::new(2)).unwrap();
    let before = live_counts(&host);

    assert!(matches!(
        s.create_peer_mapping(ExecutionContext::new(3), 0),
        Err(SurfaceError::Mapping(_))
    ));
    let key = RemoteMappingKey::new(0, 3, 0, 0);
    assert!(s.remote_mapping(&key).is_none());
    assert!(s.remote_mapping_in(2, &key).is_none());
    assert_eq!(live_counts(&host), before);

    s.free();
    assert_no_leaks(&host);
}

#[test]
fn failed_key_removes_keys_created_earlier() {
    // Binds: alloc, duplicate, first key in owner and duplicate; the second key fails in the owner.
    let (host, run) = run_with(HostConfig::default().fail_map_after(4), PlannerConfig::new());
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();
    s.duplicate(ExecutionContext::new(2)).unwrap();
    let before = live_counts(&host);

    assert!(matches!(
        s.create_peer_mapping(ExecutionContext::new(3).with_sub_contexts(2), 0),
        Err(SurfaceError::Mapping(_))
    ));
    for remote_sub in 0..2 {
        let key = RemoteMappingKey::new(0, 3, remote_sub, 0);
        assert!(s.remote_mapping(&key).is_none());
        assert!(s.remote_mapping_in(2, &key).is_none());
    }
    assert_eq!(live_counts(&host), before);

    s.free();
    assert_no_leaks(&host);
}

#[test]
fn failed_replay_tears_down_the_duplicate() {
    // Binds: alloc, owner peer mapping, duplicate device mapping; replaying the peer mapping fails.
    let (host, run) = run_with(HostConfig::default().fail_map_after(3), PlannerConfig::new());
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();
    let key = s.create_peer_mapping(ExecutionContext::new(3), 0).unwrap()[0];
    let before = live_counts(&host);

    assert!(matches!(s.duplicate(ExecutionContext::new(2)), Err(SurfaceError::Mapping(_))));
    assert_eq!(s.contexts(), vec![OWNER]);
    assert!(s.remote_mapping(&key).is_some(), "owner mapping untouched");
    assert_eq!(live_counts(&host), before);

    s.free();
    assert_no_leaks(&host);
}

#[test]
fn oversized_cpu_window_is_out_of_range() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(1024, 4, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();

    assert!(matches!(
        s.map_cpu_window(4096, u64::MAX - 1),
        Err(SurfaceError::OutOfRange { .. })
    ));
    assert_eq!(s.state(), SurfaceState::Allocated);

    s.free();
    assert_no_leaks(&host);
}

#[test]
fn duplicate_cpu_window_closes_with_its_context() {
    let (host, run) = host_run();
    let mut s = surface(&run, SurfaceDescriptor::new(64, 64, ColorFormat::A8R8G8B8));
    s.alloc().unwrap();
    s.duplicate(ExecutionContext::new(2)).unwrap();

    s.map_cpu_window_in(2, 0, MAP_ENTIRE).unwrap();
    s.write_pixel(1, 0, 0, 0, 0x55).unwrap();
    s.remove_duplicate(2).unwrap();
    assert!(s.cpu_window().is_none());
    assert_eq!(host.live_cpu_windows(), 0);

    // Duplicates share the backing memory.
    s.map_cpu_window(0, MAP_ENTIRE).unwrap();
    assert_eq!(s.read_pixel(1, 0, 0, 0).unwrap(), 0x55);
}

#[test]
fn block_linear_surface_round_trips_pixels() {
    let (_host, run) = host_run();
    let mut s = surface(
        &run,
        SurfaceDescriptor::new(100, 40, ColorFormat::R5G6B5)
            .with_layout(Layout::BlockLinear)
            .with_block_shape(1, 1, 0),
    );
    s.alloc().unwrap();
    s.map_cpu_window(0, MAP_ENTIRE).unwrap();

    for y in 0..40 {
        for x in 0..100 {
            s.write_pixel(x, y, 0, 0, u128::from(x * 40 + y)).unwrap();
        }
    }
    for y in 0..40 {
        for x in 0..100 {
            assert_eq!(s.read_pixel(x, y, 0, 0).unwrap(), u128::from(x * 40 + y));
        }
    }
}
