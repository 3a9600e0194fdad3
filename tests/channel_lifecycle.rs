mod common;

use common::{channel, device, nop_entry};
use nvgpu_core::channel::{GpfifoArgs, RefPhase, SubmitFlags};
use nvgpu_core::{GpuConfig, GpuError};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Closes `ch` on another thread and fails the test if it does not return
/// within `limit`.
fn close_within(dev: &Arc<nvgpu_core::DeviceContext>, ch: nvgpu_core::channel::ChannelRef, limit: Duration) {
    let (tx, rx) = mpsc::channel();
    let dev = Arc::clone(dev);
    thread::spawn(move || {
        dev.close_channel(ch);
        let _ = tx.send(());
    });
    rx.recv_timeout(limit)
        .expect("close_channel did not return");
}

#[test]
fn no_get_succeeds_once_close_begins() {
    let dev = Arc::new(device(GpuConfig::new().with_channels(1)));
    let (ch, _vm) = channel(&dev, 32, 0);
    let raw = Arc::clone(ch.channel());
    let chid = raw.chid();

    let stop = Arc::new(AtomicBool::new(false));
    let after_close = Arc::new(AtomicU32::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let raw = Arc::clone(&raw);
            let stop = Arc::clone(&stop);
            let closed = Arc::clone(&closed);
            let after_close = Arc::clone(&after_close);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let was_closed = closed.load(Ordering::Acquire);
                    if let Some(r) = raw.get() {
                        if was_closed {
                            after_close.fetch_add(1, Ordering::Relaxed);
                        }
                        thread::yield_now();
                        drop(r);
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    dev.close_channel(ch);
    closed.store(true, Ordering::Release);
    thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::Release);
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(after_close.load(Ordering::Relaxed), 0);
    assert_eq!(raw.ref_phase(), RefPhase::Dead);
    assert_eq!(raw.ref_count(), 0);
    assert_eq!(dev.fifo().used_channels(), 0);

    // The id is back in the pool.
    let again = dev.open_channel(0, false).unwrap();
    assert_eq!(again.chid(), chid);
    assert_eq!(again.open_count(), 2);
    dev.close_channel(again);
}

#[test]
fn close_waits_for_outstanding_references() {
    let dev = Arc::new(device(GpuConfig::new().with_channels(4)));
    let (ch, _vm) = channel(&dev, 32, 0);
    let extra = ch.try_clone().unwrap();
    assert_eq!(ch.ref_count(), 2);

    let closer = {
        let dev = Arc::clone(&dev);
        thread::spawn(move || dev.close_channel(ch))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!closer.is_finished());
    assert_eq!(extra.ref_phase(), RefPhase::Draining);
    assert!(extra.channel().get().is_none());

    drop(extra);
    closer.join().unwrap();
    assert_eq!(dev.fifo().used_channels(), 0);
}

#[test]
fn kill_defers_pool_return_to_last_reference() {
    let dev = device(GpuConfig::new().with_channels(4));
    let (ch, _vm) = channel(&dev, 32, 0);
    let extra = ch.try_clone().unwrap();
    let raw = Arc::clone(ch.channel());

    dev.kill_channel(ch);
    assert_eq!(raw.ref_phase(), RefPhase::Draining);
    assert_eq!(dev.fifo().used_channels(), 1);

    drop(extra);
    assert_eq!(raw.ref_phase(), RefPhase::Dead);
    assert_eq!(dev.fifo().used_channels(), 0);
}

#[test]
fn channel_pool_exhaustion() {
    let dev = device(GpuConfig::new().with_channels(2));
    let a = dev.open_channel(0, false).unwrap();
    let b = dev.open_channel(0, false).unwrap();
    assert!(matches!(dev.open_channel(0, false), Err(GpuError::OutOfMemory)));
    assert_eq!(dev.fifo().used_channels_high_water(), 2);
    dev.close_channel(a);
    dev.close_channel(b);
}

#[test]
fn second_vm_bind_is_rejected() {
    let dev = device(GpuConfig::new().with_channels(2));
    let (ch, _vm) = channel(&dev, 32, 0);
    let other = dev.alloc_share(false);
    assert!(matches!(ch.bind_vm(&other), Err(GpuError::AlreadyExists(_))));
    dev.close_channel(ch);
}

#[test]
fn tsg_membership_rules() {
    let dev = device(GpuConfig::new().with_channels(4));
    let fifo = dev.fifo();
    let tsg = fifo.open_tsg().unwrap();

    let (runnable, _vm) = channel(&dev, 32, 0);
    assert!(matches!(
        fifo.bind_channel(tsg, &runnable),
        Err(GpuError::InvalidArgument(_))
    ));

    let vm = dev.alloc_share(false);
    let a = dev.open_channel(0, false).unwrap();
    let b = dev.open_channel(0, false).unwrap();
    fifo.bind_channel(tsg, &a).unwrap();
    assert!(matches!(fifo.bind_channel(tsg, &a), Err(GpuError::InvalidArgument(_))));
    fifo.bind_channel(tsg, &b).unwrap();
    for ch in [&a, &b] {
        ch.bind_vm(&vm).unwrap();
        dev.alloc_gpfifo(ch, nvgpu_core::channel::GpfifoArgs::new(32)).unwrap();
    }
    assert_eq!(fifo.tsg_num_active_channels(tsg), 2);
    assert!(matches!(fifo.release_tsg(tsg), Err(GpuError::Busy)));

    // Closing one member leaves the other scheduled.
    dev.close_channel(a);
    assert_eq!(fifo.tsg_channels(tsg), vec![b.chid()]);
    assert_eq!(fifo.tsg_num_active_channels(tsg), 1);
    assert!(!b.has_timedout());

    dev.close_channel(b);
    fifo.release_tsg(tsg).unwrap();
    dev.close_channel(runnable);
}

#[test]
fn timeslice_and_interleave_validation() {
    let dev = device(GpuConfig::new().with_channels(4));
    let fifo = dev.fifo();
    let (ch, _vm) = channel(&dev, 32, 0);

    assert!(matches!(fifo.set_timeslice(&ch, 500), Err(GpuError::InvalidArgument(_))));
    fifo.set_timeslice(&ch, 2000).unwrap();
    assert_eq!(ch.timeslice_us(), 2000);
    fifo.set_interleave(&ch, nvgpu_core::fifo::InterleaveLevel::High)
        .unwrap();

    let tsg = fifo.open_tsg().unwrap();
    assert!(matches!(
        fifo.set_tsg_timeslice(tsg, 60_000),
        Err(GpuError::InvalidArgument(_))
    ));
    fifo.set_tsg_timeslice(tsg, 1000).unwrap();
    fifo.release_tsg(tsg).unwrap();
    dev.close_channel(ch);
}

#[test]
fn close_aborts_pending_jobs_before_draining() {
    for cfg in [
        GpuConfig::new().with_channels(4),
        GpuConfig::new().with_channels(4).with_syncpoints(false),
    ] {
        let dev = Arc::new(device(cfg));
        let (ch, vm) = channel(&dev, 64, 4);
        let raw = Arc::clone(ch.channel());
        let fences: Vec<_> = (0..2)
            .map(|_| {
                ch.channel()
                    .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::FENCE_GET, None)
                    .unwrap()
                    .unwrap()
            })
            .collect();
        assert_eq!(raw.pending_jobs(), 2);
        assert_eq!(raw.ref_count(), 3);

        close_within(&dev, ch, Duration::from_secs(3));

        assert!(fences.iter().all(|f| f.is_expired()));
        assert_eq!(raw.pending_jobs(), 0);
        assert_eq!(raw.ref_count(), 0);
        assert_eq!(raw.ref_phase(), RefPhase::Dead);
        assert_eq!(dev.power().count(), 0);
        assert_eq!(dev.fifo().used_channels(), 0);
    }
}

#[test]
fn close_with_pending_jobs_still_waits_for_other_holders() {
    let dev = Arc::new(device(GpuConfig::new().with_channels(4)));
    let (ch, vm) = channel(&dev, 64, 4);
    let raw = Arc::clone(ch.channel());
    let fence = ch
        .channel()
        .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();
    let extra = ch.try_clone().unwrap();

    let closer = {
        let dev = Arc::clone(&dev);
        thread::spawn(move || dev.close_channel(ch))
    };

    // The job's reference goes with the abort; only `extra` holds the close.
    let deadline = Instant::now() + Duration::from_secs(3);
    while raw.ref_count() > 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(raw.ref_count(), 2);
    assert!(fence.is_expired());
    assert_eq!(raw.pending_jobs(), 0);
    assert!(!closer.is_finished());
    assert_eq!(raw.ref_phase(), RefPhase::Draining);

    drop(extra);
    closer.join().unwrap();
    assert_eq!(raw.ref_phase(), RefPhase::Dead);
    assert_eq!(dev.fifo().used_channels(), 0);
}

#[test]
fn kill_with_pending_jobs_releases_job_references() {
    let dev = device(GpuConfig::new().with_channels(4));
    let (ch, vm) = channel(&dev, 64, 4);
    let raw = Arc::clone(ch.channel());
    let fence = ch
        .channel()
        .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();
    let extra = ch.try_clone().unwrap();

    dev.kill_channel(ch);
    assert!(fence.is_expired());
    assert_eq!(raw.pending_jobs(), 0);
    assert_eq!(raw.ref_count(), 1);
    assert_eq!(raw.ref_phase(), RefPhase::Draining);

    drop(extra);
    assert_eq!(raw.ref_phase(), RefPhase::Dead);
    assert_eq!(dev.fifo().used_channels(), 0);
}

#[test]
fn closing_a_busy_tsg_member_spares_the_others() {
    let dev = Arc::new(device(GpuConfig::new().with_channels(4)));
    let fifo = dev.fifo();
    let tsg = fifo.open_tsg().unwrap();
    let vm = dev.alloc_share(false);
    let a = dev.open_channel(0, false).unwrap();
    let b = dev.open_channel(0, false).unwrap();
    for ch in [&a, &b] {
        fifo.bind_channel(tsg, ch).unwrap();
        ch.bind_vm(&vm).unwrap();
        dev.alloc_gpfifo(ch, GpfifoArgs::new(32).with_inflight_jobs(4))
            .unwrap();
    }
    let submit = |ch: &nvgpu_core::channel::ChannelRef| {
        ch.channel()
            .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::FENCE_GET, None)
            .unwrap()
            .unwrap()
    };
    let fa = submit(&a);
    let fb = submit(&b);
    let (raw_a, raw_b) = (Arc::clone(a.channel()), Arc::clone(b.channel()));

    close_within(&dev, a, Duration::from_secs(3));
    assert!(fa.is_expired());
    assert_eq!(raw_a.ref_phase(), RefPhase::Dead);
    assert_eq!(fifo.tsg_channels(tsg), vec![raw_b.chid()]);

    assert!(!fb.is_expired());
    assert!(!raw_b.has_timedout());
    assert_eq!(raw_b.pending_jobs(), 1);
    assert_eq!(raw_b.ref_count(), 2);

    close_within(&dev, b, Duration::from_secs(3));
    assert!(fb.is_expired());
    assert_eq!(raw_b.ref_phase(), RefPhase::Dead);
    assert!(fifo.tsg_channels(tsg).is_empty());
    fifo.release_tsg(tsg).unwrap();
}

#[test]
fn failed_gpfifo_setup_unmaps_the_ring() {
    let mut cfg = GpuConfig::new().with_channels(4);
    cfg.num_syncpoints = 2;
    let dev = Arc::new(device(cfg));
    let (first, _vm) = channel(&dev, 32, 0);

    let vm = dev.alloc_share(false);
    let second = dev.open_channel(0, false).unwrap();
    second.bind_vm(&vm).unwrap();
    let before = vm.va_snapshot();
    let err = dev
        .alloc_gpfifo(&second, GpfifoArgs::new(32))
        .unwrap_err();
    assert!(matches!(err, GpuError::OutOfMemory));
    assert_eq!(vm.va_snapshot(), before);

    dev.close_channel(second);
    dev.close_channel(first);
    assert_eq!(dev.fifo().used_channels(), 0);
}
