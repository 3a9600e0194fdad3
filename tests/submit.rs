mod common;

use common::{channel, device, nop_entry};
use nvgpu_core::channel::{GpfifoArgs, PreFence, SubmitFlags};
use nvgpu_core::context::RunStatus;
use nvgpu_core::{GpuConfig, GpuError};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[test]
fn fence_get_submit_appends_only_the_increment() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, vm) = channel(&dev, 1024, 4);
    let entry = nop_entry(&vm);

    let fence = ch
        .channel()
        .submit_gpfifo(&[entry], SubmitFlags::FENCE_GET, None)
        .unwrap()
        .expect("post-fence requested");
    assert!(fence.is_valid());
    assert!(!fence.is_expired());
    assert_eq!(ch.gp_put(), 2);
    assert_eq!(ch.pending_jobs(), 1);

    assert_eq!(dev.run_channel(&ch, 16), RunStatus::Idle);
    assert!(fence.is_expired());
    assert_eq!(ch.pending_jobs(), 0);
    dev.close_channel(ch);
}

#[test]
fn expired_pre_fence_is_elided() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, vm) = channel(&dev, 64, 4);
    let entry = nop_entry(&vm);

    let ext = dev.syncpoints().alloc("external").unwrap();
    let wait = PreFence::Syncpoint { id: ext, thresh: 0 };
    ch.channel()
        .submit_gpfifo(&[entry], SubmitFlags::FENCE_WAIT, Some(&wait))
        .unwrap();
    assert_eq!(ch.gp_put(), 2);

    assert_eq!(dev.run_channel(&ch, 16), RunStatus::Idle);
    dev.close_channel(ch);
}

#[test]
fn pending_pre_fence_stalls_until_signalled() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, vm) = channel(&dev, 64, 4);
    let entry = nop_entry(&vm);

    let mgr = dev.syncpoints();
    let ext = mgr.alloc("external").unwrap();
    let thresh = mgr.incr_max(ext, 1);
    let wait = PreFence::Syncpoint { id: ext, thresh };
    let fence = ch
        .channel()
        .submit_gpfifo(
            &[entry],
            SubmitFlags::FENCE_WAIT | SubmitFlags::FENCE_GET,
            Some(&wait),
        )
        .unwrap()
        .unwrap();
    assert_eq!(ch.gp_put(), 3);

    assert_eq!(dev.run_channel(&ch, 16), RunStatus::Stalled);
    assert_eq!(ch.gp_get(), 0);
    assert!(!fence.is_expired());

    mgr.hw_incr(ext);
    assert_eq!(dev.run_channel(&ch, 16), RunStatus::Idle);
    fence.wait(Duration::from_millis(100)).unwrap();
    assert_eq!(ch.pending_jobs(), 0);
    dev.close_channel(ch);
}

#[test]
fn jobs_complete_in_submission_order() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, vm) = channel(&dev, 64, 4);
    let entry = nop_entry(&vm);

    let first = ch
        .channel()
        .submit_gpfifo(&[entry], SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();
    let second = ch
        .channel()
        .submit_gpfifo(&[entry], SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();

    // One user entry plus one increment per job.
    assert_eq!(dev.run_channel(&ch, 2), RunStatus::BudgetExhausted);
    assert!(first.is_expired());
    assert!(!second.is_expired());
    assert_eq!(ch.pending_jobs(), 1);

    assert_eq!(dev.run_channel(&ch, 16), RunStatus::Idle);
    assert!(second.is_expired());
    assert_eq!(ch.pending_jobs(), 0);
    dev.close_channel(ch);
}

#[test]
fn preallocated_tracking_limits_inflight_jobs() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, vm) = channel(&dev, 64, 2);
    let entry = nop_entry(&vm);

    for _ in 0..2 {
        ch.channel()
            .submit_gpfifo(&[entry], SubmitFlags::FENCE_GET, None)
            .unwrap();
    }
    let put = ch.gp_put();
    assert!(matches!(
        ch.channel()
            .submit_gpfifo(&[entry], SubmitFlags::FENCE_GET, None),
        Err(GpuError::TryAgain)
    ));
    assert_eq!(ch.gp_put(), put);

    dev.run_channel(&ch, 64);
    ch.channel()
        .submit_gpfifo(&[entry], SubmitFlags::FENCE_GET, None)
        .unwrap();
    dev.run_channel(&ch, 64);
    dev.close_channel(ch);
}

#[test]
fn ring_too_small_is_out_of_memory() {
    let dev = device(GpuConfig::new().with_channels(8));
    let (ch, vm) = channel(&dev, 4, 0);
    let entries = vec![nop_entry(&vm); 2];
    assert!(matches!(
        ch.channel().submit_gpfifo(&entries, SubmitFlags::empty(), None),
        Err(GpuError::OutOfMemory)
    ));
    assert_eq!(ch.gp_put(), 0);
    dev.close_channel(ch);
}

#[test]
fn submit_argument_checks() {
    let dev = device(GpuConfig::new().with_channels(8));
    let vm = dev.alloc_share(false);
    let ch = dev.open_channel(0, false).unwrap();
    let entry = nop_entry(&vm);

    // No gpfifo yet.
    assert!(matches!(
        ch.channel().submit_gpfifo(&[entry], SubmitFlags::empty(), None),
        Err(GpuError::InvalidArgument(_))
    ));

    ch.bind_vm(&vm).unwrap();
    assert!(matches!(
        dev.alloc_gpfifo(&ch, GpfifoArgs::new(16).deterministic()),
        Err(GpuError::InvalidArgument(_))
    ));
    dev.alloc_gpfifo(&ch, GpfifoArgs::new(16).with_inflight_jobs(2).deterministic())
        .unwrap();
    assert!(matches!(
        dev.alloc_gpfifo(&ch, GpfifoArgs::new(16)),
        Err(GpuError::AlreadyExists(_))
    ));

    assert!(matches!(
        ch.channel().submit_gpfifo(&[entry], SubmitFlags::FENCE_WAIT, None),
        Err(GpuError::InvalidArgument(_))
    ));
    // Deterministic channels must skip buffer refcounting.
    assert!(matches!(
        ch.channel().submit_gpfifo(&[entry], SubmitFlags::FENCE_GET, None),
        Err(GpuError::InvalidArgument(_))
    ));
    let power = dev.power().count();
    ch.channel()
        .submit_gpfifo(
            &[entry],
            SubmitFlags::FENCE_GET | SubmitFlags::SKIP_BUFFER_REFCOUNTING,
            None,
        )
        .unwrap();
    assert_eq!(dev.power().count(), power);
    dev.run_channel(&ch, 16);
    dev.close_channel(ch);
}

#[test]
fn railgating_holds_power_until_retire() {
    let dev = device(GpuConfig::new().with_channels(8).with_railgate(true));
    let (ch, vm) = channel(&dev, 64, 4);
    let entry = nop_entry(&vm);

    ch.channel()
        .submit_gpfifo(&[entry], SubmitFlags::empty(), None)
        .unwrap();
    assert_eq!(dev.power().count(), 1);
    dev.run_channel(&ch, 16);
    assert_eq!(dev.power().count(), 0);
    dev.close_channel(ch);
}

#[test]
fn completion_callback_runs_after_retire() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    let dev = device(GpuConfig::new().with_channels(8));
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let vm = dev.alloc_share(false);
    let ch = dev
        .open_channel_with_completion_callback(
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        )
        .unwrap();
    ch.bind_vm(&vm).unwrap();
    dev.alloc_gpfifo(&ch, GpfifoArgs::new(32)).unwrap();

    ch.channel()
        .submit_gpfifo(&[nop_entry(&vm)], SubmitFlags::FENCE_GET, None)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    dev.run_channel(&ch, 16);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    dev.close_channel(ch);
}
