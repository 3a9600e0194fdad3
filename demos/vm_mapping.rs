use nvgpu_core::mm::{DmaBuf, MapFlags, MapParams, SpaceFlags, kind};
use nvgpu_core::{DeviceContext, GpuConfig};

const SZ_64K: u64 = 64 << 10;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("               nvgpu-core - Address Space Mapping           ");
    println!("============================================================");

    let dev = DeviceContext::new(GpuConfig::new().with_channels(4))?;
    let vm = dev.alloc_share(false);
    let before = vm.va_snapshot();

    // 1. Plain pitch-linear buffer
    println!("[+] Mapping a 20 KB pitch buffer...");
    let plain = DmaBuf::new(0x5000)?;
    let plain_va = vm.map(&plain, MapParams::new(kind::PITCH))?;
    if let Some(m) = vm.mapping(plain_va) {
        println!("    0x{:x} size 0x{:x} pages {:?}", m.addr, m.size, m.page_size);
    }

    // 2. Compressible buffer with a CPU-visible comptag window
    println!("[+] Mapping 96 KB of a compressible buffer...");
    let comp = DmaBuf::new_aligned(2 * SZ_64K, 2 * SZ_64K)?;
    let comp_va = vm.map(
        &comp,
        MapParams::new(kind::C32_2C)
            .with_flags(MapFlags::MAPPABLE_COMPBITS)
            .with_buffer_range(0, 0x18000),
    )?;
    if let Some(m) = vm.mapping(comp_va) {
        println!(
            "    0x{:x} size 0x{:x} pages {:?}, ctag offset {} lines {}",
            m.addr, m.size, m.page_size, m.ctag_offset, m.ctag_lines
        );
    }
    let window = vm.map_compbits(comp_va, None)?;
    let info = vm.get_compbits_info(comp_va)?;
    println!(
        "    compbits window at 0x{window:x}, {} bytes, ctagline {}",
        info.window_size, info.window_ctagline
    );

    // 3. Reserved range and a fixed mapping inside it
    println!("[+] Reserving 4 big pages and mapping into them...");
    let space = vm.alloc_space(4, SZ_64K, SpaceFlags::empty(), 0)?;
    let fixed = DmaBuf::new_aligned(SZ_64K, SZ_64K)?;
    let fixed_va = vm.map(
        &fixed,
        MapParams::new(kind::PITCH).with_fixed_offset(space + SZ_64K),
    )?;
    println!("    space at 0x{space:x}, fixed mapping at 0x{fixed_va:x}");

    println!();
    print!("{}", vm.dump());

    // 4. Tear everything down and check nothing leaked
    println!("[+] Unmapping...");
    vm.unmap(fixed_va)?;
    vm.free_space(space)?;
    vm.unmap(comp_va)?;
    vm.unmap(plain_va)?;
    let clean = vm.va_snapshot() == before;
    println!("    VA state restored: {clean}");
    if !clean {
        return Err("address space left dirty".into());
    }
    println!("[+] Done.");
    Ok(())
}
