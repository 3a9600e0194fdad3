use nvgpu_core::channel::{GpfifoArgs, PreFence, SubmitFlags};
use nvgpu_core::debug;
use nvgpu_core::hw::GpfifoEntry;
use nvgpu_core::mm::{DmaBuf, MapParams, kind};
use nvgpu_core::{DeviceContext, GpuConfig};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("               nvgpu-core - Submission Walkthrough          ");
    println!("============================================================");

    // 1. Device and address space
    println!("[+] Creating device context...");
    let dev = DeviceContext::new(GpuConfig::new().with_channels(16))?;
    let vm = dev.alloc_share(false);
    println!("    VM {} ready", vm.id());

    // 2. Channel with a 128-entry ring tracking 8 jobs
    println!("[+] Opening channel...");
    let ch = dev.open_channel(0, false)?;
    ch.bind_vm(&vm)?;
    dev.alloc_gpfifo(&ch, GpfifoArgs::new(128).with_inflight_jobs(8))?;
    println!(
        "    Channel {} on runlist {}, syncpoint {:?}",
        ch.chid(),
        ch.runlist_id(),
        ch.syncpt_id()
    );

    // 3. A push buffer of no-ops
    let pushbuf = DmaBuf::new(256)?;
    let va = vm.map(&pushbuf, MapParams::new(kind::PITCH))?;
    let entry = GpfifoEntry::new(va, 64);
    println!("[+] Push buffer mapped at 0x{va:x}");

    // 4. An external syncpoint the job must wait for
    let mgr = dev.syncpoints();
    let ext = mgr.alloc("walkthrough")?;
    let thresh = mgr.incr_max(ext, 1);
    let wait = PreFence::Syncpoint { id: ext, thresh };

    println!("[+] Submitting with a pre-fence on syncpoint {ext} >= {thresh}...");
    let fence = ch
        .channel()
        .submit_gpfifo(
            &[entry],
            SubmitFlags::FENCE_WAIT | SubmitFlags::FENCE_GET,
            Some(&wait),
        )?
        .ok_or("no post-fence returned")?;
    println!("    GET {} PUT {}, {} job(s) pending", ch.gp_get(), ch.gp_put(), ch.pending_jobs());

    println!("[+] Running before the wait is satisfied...");
    println!("    -> {:?}", dev.run_channel(&ch, 32));

    println!("[+] Signalling syncpoint {ext}...");
    mgr.hw_incr(ext);
    println!("    -> {:?}", dev.run_channel(&ch, 32));
    fence.wait(Duration::from_millis(100))?;
    println!("    Post-fence expired, {} job(s) pending", ch.pending_jobs());

    println!();
    print!("{}", debug::dump_channels(&dev));
    print!("{}", debug::dump_runlist(&dev, 0));

    dev.close_channel(ch);
    mgr.free(ext);
    println!("[+] Done.");
    Ok(())
}
