use std::sync::Arc;
use surfmem_rs::rm::{HostAllocator, HostConfig, Location};
use surfmem_rs::surface::{
    ColorFormat, ExecutionContext, Layout, MAP_ENTIRE, PlannerConfig, RunContext, Surface, SurfaceDescriptor,
};
use surfmem_rs::{SurfaceError, SurfaceResult};

fn print_plan(surface: &Surface) -> SurfaceResult<()> {
    let resolved = surface.plan()?;
    let plan = &resolved.plan;
    let desc = surface.descriptor();

    println!("\n[{}] {}x{} {:?}", desc.name, desc.width, desc.height, plan.layout);
    println!("  Location:          {}", resolved.location.as_str());
    println!("  Bits per pixel:    {}", plan.bits_per_pixel);
    println!("  Pitch:             {} bytes", plan.pitch);
    println!(
        "  Allocated dims:    {}x{}x{}",
        plan.alloc_width, plan.alloc_height, plan.alloc_depth
    );
    if let Some(block) = plan.block {
        println!(
            "  Blocks:            {}x{}x{} of {} bytes",
            block.blocks_wide, block.blocks_high, block.blocks_deep, block.block_bytes
        );
    }
    println!("  Size:              {} bytes", plan.size);
    println!("  Partitions:        {:?}", plan.partitions);
    if resolved.compressed {
        println!("  Compression tags:  {}", plan.compression_tags);
    }
    Ok(())
}

fn main() -> SurfaceResult<()> {
    println!("--- Surface Layout Planner ---");

    let host = Arc::new(HostAllocator::new(HostConfig::default()));
    let run = RunContext::new(host.clone(), PlannerConfig::new().with_fill_pattern(0x5a5a_5a5a));
    let owner = ExecutionContext::new(1);

    let descriptors = [
        SurfaceDescriptor::new(100, 1, ColorFormat::A8R8G8B8).with_name("pitch"),
        SurfaceDescriptor::new(17, 10, ColorFormat::A8R8G8B8)
            .with_name("swizzled")
            .with_layout(Layout::Swizzled),
        SurfaceDescriptor::new(1920, 1080, ColorFormat::A8R8G8B8)
            .with_name("block-linear")
            .with_layout(Layout::BlockLinear),
        SurfaceDescriptor::new(25, 16, ColorFormat::A8R8G8B8)
            .with_name("tiled")
            .with_layout(Layout::Tiled),
        SurfaceDescriptor::new(1024, 256, ColorFormat::A8R8G8B8)
            .with_name("split")
            .with_location(Location::Framebuffer)
            .with_split(Location::NonCoherent),
    ];

    for desc in descriptors {
        let mut surface = Surface::new(run.clone(), owner, desc);
        print_plan(&surface)?;

        if let Err(e) = surface.alloc() {
            eprintln!("  Allocation failed: {e}");
            continue;
        }
        println!("  Device address:    0x{:x}", surface.device_address(owner.id)?);
        println!("  Physical address:  0x{:x}", surface.physical_address(0)?);

        surface.map_cpu_window(0, MAP_ENTIRE)?;
        let first = surface.read_pixel(0, 0, 0, 0)?;
        println!("  Pixel (0,0):       0x{first:08x}");
        surface.unmap_cpu_window()?;
    }

    println!("\n--- Peer Mapping ---");
    let mut shared = Surface::new(
        run,
        owner,
        SurfaceDescriptor::new(256, 256, ColorFormat::Y8).with_name("peer"),
    );
    shared.alloc()?;
    for key in shared.create_peer_mapping(ExecutionContext::new(2).with_sub_contexts(2), 0)? {
        let mapping = shared
            .remote_mapping(&key)
            .ok_or_else(|| SurfaceError::Mapping(format!("{key:?} missing")))?;
        println!(
            "  remote ctx {} sub {} -> 0x{:x}",
            key.remote_context, key.remote_sub_context, mapping.address
        );
    }
    shared.free();

    println!("\nLive physical handles after teardown: {}", host.live_physical());
    Ok(())
}
