use nvgpu_core::channel::notifier::IDLE_TIMEOUT;
use nvgpu_core::channel::{GpfifoArgs, SubmitFlags};
use nvgpu_core::debug;
use nvgpu_core::hw::GpfifoEntry;
use nvgpu_core::mm::{DmaBuf, MapParams, kind};
use nvgpu_core::{DeviceContext, GpuConfig};
use std::thread;
use std::time::Duration;

const TICK_MS: u64 = 50;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("               nvgpu-core - Watchdog Recovery               ");
    println!("============================================================");

    let cfg = GpuConfig::new()
        .with_channels(8)
        .with_syncpoints(false)
        .with_watchdog(true, 200);
    let dev = DeviceContext::new(cfg)?;
    let vm = dev.alloc_share(false);

    println!("[+] Opening a semaphore-backed channel...");
    let ch = dev.open_channel(0, false)?;
    ch.bind_vm(&vm)?;
    dev.alloc_gpfifo(&ch, GpfifoArgs::new(64))?;
    ch.enable_error_notifier();

    let pushbuf = DmaBuf::new(64)?;
    let va = vm.map(&pushbuf, MapParams::new(kind::PITCH))?;
    let fence = ch
        .channel()
        .submit_gpfifo(&[GpfifoEntry::new(va, 16)], SubmitFlags::FENCE_GET, None)?
        .ok_or("no post-fence returned")?;
    println!("    Channel {} submitted; nothing will run it", ch.chid());

    let waiter = {
        let r = ch.try_clone().ok_or("channel closing")?;
        thread::spawn(move || r.wait_fence(&fence, Duration::from_secs(10)))
    };

    println!("[+] Ticking the watchdog every {TICK_MS} ms...");
    let mut ticks = 0;
    while !ch.has_timedout() {
        thread::sleep(Duration::from_millis(TICK_MS));
        dev.watchdog_tick(TICK_MS);
        ticks += 1;
    }
    println!("    Timed out after {ticks} ticks");

    let woke = waiter.join().map_err(|_| "waiter panicked")?;
    println!("    Waiter returned {woke:?}");
    if let Some(n) = ch.error_notifier() {
        let expected = if n.info32 == IDLE_TIMEOUT { "idle timeout" } else { "unexpected" };
        println!("    Error notifier {} ({expected})", n.info32);
    }

    println!();
    print!("{}", debug::dump_channels(&dev));
    print!("{}", debug::dump_runlist(&dev, 0));

    dev.close_channel(ch);
    println!("[+] Done.");
    Ok(())
}
