//! Text dumps of channel, semaphore, runlist and VM state.
//!
//! Informational only; nothing in the crate reads these back.

use crate::channel::Channel;
use crate::context::DeviceContext;
use crate::fifo::RunlistEntry;
use std::fmt::Write;

/// One line per channel that has ever been opened, plus pool counters.
#[must_use]
pub fn dump_channels(dev: &DeviceContext) -> String {
    let fifo = dev.fifo();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "channels: {} in use, high water {}",
        fifo.used_channels(),
        fifo.used_channels_high_water()
    );
    for ch in fifo.channels().filter(|c| c.open_count() > 0) {
        out.push_str(&channel_line(ch));
    }
    out
}

fn channel_line(ch: &Channel) -> String {
    let mut line = format!(
        "ch {:3}: {:?} refs {} opens {} GET {} PUT {} jobs {}",
        ch.chid(),
        ch.ref_phase(),
        ch.ref_count(),
        ch.open_count(),
        ch.gp_get(),
        ch.gp_put(),
        ch.pending_jobs()
    );
    if let Some(t) = ch.tsgid() {
        let _ = write!(line, " tsg {t}");
    }
    if let Some(id) = ch.syncpt_id() {
        let _ = write!(line, " syncpt {id}");
    }
    if ch.has_timedout() {
        line.push_str(" TIMEDOUT");
    }
    if ch.error_notifier_is_set()
        && let Some(n) = ch.error_notifier()
    {
        let _ = write!(line, " err {}", n.info32);
    }
    line.push('\n');
    line
}

/// Semaphore values of every VM-owned pool reachable from a live channel.
#[must_use]
pub fn dump_semaphores(dev: &DeviceContext) -> String {
    let mut out = String::new();
    let mut seen = Vec::new();
    for ch in dev.fifo().channels() {
        let Some(r) = ch.get() else { continue };
        let Some(pool) = r.vm().and_then(|vm| vm.allocated_semaphore_pool()) else {
            continue;
        };
        if seen.contains(&pool.page()) {
            continue;
        }
        seen.push(pool.page());
        out.push_str(&pool.dump());
    }
    out
}

/// The runlist as the hardware currently sees it.
#[must_use]
pub fn dump_runlist(dev: &DeviceContext, runlist_id: u32) -> String {
    let mut out = String::new();
    let entries = dev.fifo().runlist_entries(runlist_id);
    let _ = writeln!(out, "runlist {runlist_id}: {} entries", entries.len());
    for e in entries {
        let _ = match e {
            RunlistEntry::Channel(chid) => writeln!(out, "  ch {chid}"),
            RunlistEntry::Tsg {
                tsgid,
                len,
                timeslice_scale,
                timeslice_timeout,
            } => writeln!(
                out,
                "  tsg {tsgid} len {len} timeslice {timeslice_timeout}<<{timeslice_scale}"
            ),
        };
    }
    out
}

/// Mappings and page tables of every VM bound to a live channel.
#[must_use]
pub fn dump_vms(dev: &DeviceContext) -> String {
    let mut out = String::new();
    let mut seen = Vec::new();
    for ch in dev.fifo().channels() {
        let Some(vm) = ch.get().and_then(|r| r.vm()) else {
            continue;
        };
        if seen.contains(&vm.id()) {
            continue;
        }
        seen.push(vm.id());
        out.push_str(&vm.dump());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::GpfifoArgs;
    use crate::config::GpuConfig;

    #[test]
    fn dumps_name_open_channels_and_runlist() {
        let dev = DeviceContext::new(GpuConfig::new().with_channels(4)).unwrap();
        let vm = dev.alloc_share(false);
        let ch = dev.open_channel(0, false).unwrap();
        ch.bind_vm(&vm).unwrap();
        dev.alloc_gpfifo(&ch, GpfifoArgs::new(8)).unwrap();

        let chans = dump_channels(&dev);
        assert!(chans.contains("1 in use"));
        assert!(chans.contains(&format!("ch {:3}: Live", ch.chid())));
        assert!(dump_runlist(&dev, 0).contains(&format!("  ch {}", ch.chid())));
        assert!(dump_vms(&dev).contains(&format!("vm {}", vm.id())));
        dev.close_channel(ch);
    }
}
