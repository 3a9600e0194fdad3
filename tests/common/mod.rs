#![allow(dead_code)]

use nvgpu_core::channel::{ChannelRef, GpfifoArgs};
use nvgpu_core::hw::GpfifoEntry;
use nvgpu_core::mm::{DmaBuf, MapParams, Vm, kind};
use nvgpu_core::{DeviceContext, GpuConfig};
use std::sync::Arc;

pub const PUSHBUF_WORDS: u32 = 16;

pub fn device(cfg: GpuConfig) -> DeviceContext {
    DeviceContext::new(cfg).unwrap()
}

/// A channel bound to its own VM with a gpfifo of `entries` tracking up to
/// `jobs` in-flight jobs.
pub fn channel(dev: &DeviceContext, entries: u32, jobs: u32) -> (ChannelRef, Arc<Vm>) {
    let vm = dev.alloc_share(false);
    let ch = dev.open_channel(0, false).unwrap();
    ch.bind_vm(&vm).unwrap();
    dev.alloc_gpfifo(&ch, GpfifoArgs::new(entries).with_inflight_jobs(jobs))
        .unwrap();
    (ch, vm)
}

/// A gpfifo entry pointing at a zeroed push buffer (all no-ops).
pub fn nop_entry(vm: &Vm) -> GpfifoEntry {
    let buf = DmaBuf::new(u64::from(PUSHBUF_WORDS) * 4).unwrap();
    let va = vm.map(&buf, MapParams::new(kind::PITCH)).unwrap();
    GpfifoEntry::new(va, PUSHBUF_WORDS)
}
