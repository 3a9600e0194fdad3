mod common;

use common::{channel, device, nop_entry};
use nvgpu_core::channel::SubmitFlags;
use nvgpu_core::channel::notifier::{IDLE_TIMEOUT, MMU_ERR_FLT};
use nvgpu_core::context::RunStatus;
use nvgpu_core::fifo::RunlistEntry;
use nvgpu_core::fifo::recovery::DeferredReset;
use nvgpu_core::hw::GpfifoEntry;
use nvgpu_core::hw::regs::{ENGINE_GR, EngineStatus, FaultClient, MmuFault, SchedErrorCode};
use nvgpu_core::{GpuConfig, GpuError};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn on_runlist(dev: &nvgpu_core::DeviceContext, chid: u32) -> bool {
    dev.fifo()
        .runlist_entries(0)
        .contains(&RunlistEntry::Channel(chid))
}

#[test]
fn watchdog_expiry_kills_the_channel_and_wakes_waiters() {
    let dev = device(
        GpuConfig::new()
            .with_channels(8)
            .with_syncpoints(false)
            .with_watchdog(true, 100),
    );
    let (ch, vm) = channel(&dev, 64, 4);
    ch.enable_error_notifier();
    let fence = ch
        .channel()
        .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();
    assert!(ch.watchdog_running());
    assert!(on_runlist(&dev, ch.chid()));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let r = ch.try_clone().unwrap();
            let f = Arc::clone(&fence);
            thread::spawn(move || r.wait_fence(&f, Duration::from_secs(5)))
        })
        .collect();

    dev.watchdog_tick(60);
    assert!(!ch.has_timedout());
    dev.watchdog_tick(60);
    assert!(ch.has_timedout());

    for w in waiters {
        assert!(matches!(w.join().unwrap(), Err(GpuError::TimedOut)));
    }
    assert_eq!(ch.error_notifier().unwrap().info32, IDLE_TIMEOUT);
    assert!(fence.is_expired());
    assert_eq!(ch.pending_jobs(), 0);

    // A rebuild must not bring it back.
    assert!(!on_runlist(&dev, ch.chid()));
    dev.fifo().update_runlist(0, None, true, true).unwrap();
    assert!(!on_runlist(&dev, ch.chid()));

    assert!(matches!(
        ch.channel()
            .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::empty(), None),
        Err(GpuError::TimedOut)
    ));
    assert_eq!(dev.run_channel(&ch, 16), RunStatus::NotRunnable);
    dev.close_channel(ch);
}

#[test]
fn progress_keeps_the_watchdog_quiet() {
    let dev = device(GpuConfig::new().with_channels(8).with_watchdog(true, 100));
    let (ch, vm) = channel(&dev, 64, 4);
    let entry = nop_entry(&vm);
    for _ in 0..3 {
        ch.channel()
            .submit_gpfifo(&[entry], SubmitFlags::empty(), None)
            .unwrap();
    }

    for _ in 0..3 {
        dev.watchdog_tick(60);
        dev.run_channel(&ch, 2);
    }
    assert!(!ch.has_timedout());
    assert_eq!(ch.pending_jobs(), 0);
    assert!(!ch.watchdog_running());
    dev.close_channel(ch);
}

#[test]
fn stuck_preempt_times_out_and_recovers() {
    let dev = device(GpuConfig::new().with_channels(8).with_idle_timeout(20));
    let (ch, _vm) = channel(&dev, 64, 4);
    ch.enable_error_notifier();

    dev.hw().set_preempt_stuck(true);
    assert!(matches!(
        dev.fifo().preempt_channel(ch.chid()),
        Err(GpuError::Busy)
    ));
    assert!(ch.has_timedout());
    assert_eq!(ch.error_notifier().unwrap().info32, IDLE_TIMEOUT);
    assert!(!on_runlist(&dev, ch.chid()));

    dev.hw().set_preempt_stuck(false);
    dev.close_channel(ch);
}

#[test]
fn recovery_drops_references_held_by_pending_jobs() {
    let dev = device(GpuConfig::new().with_channels(8).with_idle_timeout(20));
    let (ch, vm) = channel(&dev, 64, 4);
    let raw = Arc::clone(ch.channel());
    let fences: Vec<_> = (0..3)
        .map(|_| {
            ch.channel()
                .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::FENCE_GET, None)
                .unwrap()
                .unwrap()
        })
        .collect();
    assert_eq!(raw.ref_count(), 4);

    dev.hw().set_preempt_stuck(true);
    assert!(matches!(
        dev.fifo().preempt_channel(ch.chid()),
        Err(GpuError::Busy)
    ));
    dev.hw().set_preempt_stuck(false);

    assert!(fences.iter().all(|f| f.is_expired()));
    assert_eq!(raw.pending_jobs(), 0);
    assert_eq!(raw.ref_count(), 1);
    assert_eq!(dev.power().count(), 0);

    dev.close_channel(ch);
    assert_eq!(raw.ref_count(), 0);
    assert_eq!(dev.fifo().used_channels(), 0);
}

#[test]
fn unmapped_push_buffer_raises_mmu_fault() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, _vm) = channel(&dev, 64, 4);
    ch.enable_error_notifier();

    let bogus = GpfifoEntry::new(0x7f_dead_0000, 4);
    let fence = ch
        .channel()
        .submit_gpfifo(&[bogus], SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();

    assert_eq!(dev.run_channel(&ch, 16), RunStatus::Faulted);
    assert!(ch.has_timedout());
    assert_eq!(ch.error_notifier().unwrap().info32, MMU_ERR_FLT);
    assert_eq!(dev.hw().engine_reset_count(ENGINE_GR), 1);
    assert_eq!(dev.hw().engine_status(ENGINE_GR), EngineStatus::default());
    assert!(fence.is_expired());
    assert_eq!(ch.pending_jobs(), 0);
    dev.close_channel(ch);
}

#[test]
fn debugger_defers_gr_reset_until_close() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, _vm) = channel(&dev, 64, 4);
    ch.enable_error_notifier();
    let chid = ch.chid();

    dev.set_debugger_attached(true);
    dev.hw().set_mmu_debug_mode(true);
    dev.hw()
        .set_engine_status(ENGINE_GR, EngineStatus::running(chid, false));
    dev.hw().raise_mmu_fault(MmuFault {
        engine_id: ENGINE_GR,
        chid: Some(chid),
        client: FaultClient::Gpc,
        fault_va: 0x1000,
    });
    dev.isr();

    assert_eq!(
        dev.fifo().deferred_reset(),
        Some(DeferredReset {
            engines: 1 << ENGINE_GR,
            ctx: Some((chid, false)),
        })
    );
    assert_eq!(dev.hw().engine_reset_count(ENGINE_GR), 0);
    assert!(ch.has_timedout());
    // The debugger gets to look before the client is told.
    assert!(!ch.error_notifier_is_set());

    dev.close_channel(ch);
    assert_eq!(dev.hw().engine_reset_count(ENGINE_GR), 1);
    assert_eq!(dev.fifo().deferred_reset(), None);
}

#[test]
fn hub_fault_is_not_deferred() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, _vm) = channel(&dev, 64, 4);
    ch.enable_error_notifier();

    dev.set_debugger_attached(true);
    dev.hw().set_mmu_debug_mode(true);
    dev.hw().raise_mmu_fault(MmuFault {
        engine_id: ENGINE_GR,
        chid: Some(ch.chid()),
        client: FaultClient::Hub,
        fault_va: 0x2000,
    });
    dev.isr();

    assert_eq!(dev.fifo().deferred_reset(), None);
    assert_eq!(dev.hw().engine_reset_count(ENGINE_GR), 1);
    assert_eq!(ch.error_notifier().unwrap().info32, MMU_ERR_FLT);
    dev.close_channel(ch);
}

#[test]
fn ctxsw_timeout_recovers_after_the_limit() {
    let dev = device(GpuConfig::new().with_channels(8).with_idle_timeout(150));
    let (ch, _vm) = channel(&dev, 64, 4);
    ch.enable_error_notifier();
    let chid = ch.chid();
    let hw = dev.hw();

    hw.set_engine_status(ENGINE_GR, EngineStatus::loading((chid + 1, false), (chid, false)));
    hw.raise_sched_error(SchedErrorCode::CtxswTimeout);
    dev.isr();
    assert!(!ch.has_timedout());
    assert_eq!(hw.engine_reset_count(ENGINE_GR), 0);

    hw.raise_sched_error(SchedErrorCode::CtxswTimeout);
    dev.isr();
    assert!(ch.has_timedout());
    assert_eq!(ch.error_notifier().unwrap().info32, IDLE_TIMEOUT);
    assert_eq!(hw.engine_reset_count(ENGINE_GR), 1);
    dev.close_channel(ch);
}

#[test]
fn other_sched_errors_are_only_reported() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, _vm) = channel(&dev, 64, 4);
    let hw = dev.hw();

    hw.set_engine_status(ENGINE_GR, EngineStatus::switching((ch.chid(), false), (0, false)));
    hw.raise_sched_error(SchedErrorCode::Other(3));
    dev.isr();
    assert!(!ch.has_timedout());
    assert_eq!(hw.engine_reset_count(ENGINE_GR), 0);

    hw.set_engine_status(ENGINE_GR, EngineStatus::default());
    dev.close_channel(ch);
}

#[test]
fn suspend_and_resume_round_trip_the_runlist() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, vm) = channel(&dev, 64, 4);
    let chid = ch.chid();
    ch.channel()
        .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::empty(), None)
        .unwrap();
    assert!(ch.watchdog_running());

    dev.channel_suspend().unwrap();
    assert!(dev.fifo().runlist_entries(0).is_empty());
    assert!(!dev.hw().channel_bound(chid));
    assert!(!dev.hw().channel_enabled(chid));
    assert!(!ch.watchdog_running());

    dev.channel_resume().unwrap();
    assert!(on_runlist(&dev, chid));
    assert!(dev.hw().channel_bound(chid));
    assert!(dev.hw().channel_enabled(chid));

    assert_eq!(dev.run_channel(&ch, 16), RunStatus::Idle);
    dev.close_channel(ch);
}
