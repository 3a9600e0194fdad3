//! The gpfifo ring and its allocation.

#![allow(clippy::cast_possible_truncation)]

use super::Channel;
use super::job::JobSource;
use super::priv_cmd::PrivCmdQueue;
use super::sync::ChannelSync;
use crate::error::{GpuError, GpuResult};
use crate::hw::pbdma::GpfifoEntry;
use crate::mm::DmaBuf;
use crate::mm::page_table::RwFlag;
use crate::utils::roundup_pow_of_two;
use std::mem::size_of;
use std::sync::Arc;

const ENTRY_BYTES: usize = size_of::<GpfifoEntry>();

/// Parameters for [`Fifo::alloc_gpfifo`](crate::fifo::Fifo::alloc_gpfifo).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpfifoArgs {
    pub num_entries: u32,
    /// Non-zero selects preallocated job tracking with this many slots.
    pub num_inflight_jobs: u32,
    pub deterministic: bool,
}

impl GpfifoArgs {
    #[must_use]
    pub const fn new(num_entries: u32) -> Self {
        Self {
            num_entries,
            num_inflight_jobs: 0,
            deterministic: false,
        }
    }

    #[must_use]
    pub const fn with_inflight_jobs(mut self, n: u32) -> Self {
        self.num_inflight_jobs = n;
        self
    }

    #[must_use]
    pub const fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }
}

/// A channel's gpfifo ring, mapped into its VM's kernel range.
#[derive(Debug, Clone)]
pub struct Gpfifo {
    mem: Arc<DmaBuf>,
    gpu_va: u64,
    entry_num: u32,
}

impl Gpfifo {
    #[must_use]
    pub const fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    #[must_use]
    pub const fn entry_num(&self) -> u32 {
        self.entry_num
    }

    /// Free slots between PUT and GET. One slot always stays empty.
    #[must_use]
    pub const fn free_count(&self, put: u32, get: u32) -> u32 {
        (self.entry_num + get - put - 1) % self.entry_num
    }

    #[must_use]
    pub fn entry(&self, idx: u32) -> GpfifoEntry {
        let off = (idx % self.entry_num) as usize * ENTRY_BYTES;
        let m = self.mem.memory();
        GpfifoEntry {
            entry0: m.read_u32(off),
            entry1: m.read_u32(off + 4),
        }
    }

    /// Copies `entries` into the ring starting at `put`, splitting the copy
    /// at the end of the ring. Returns the new PUT.
    pub(crate) fn write(&self, put: u32, entries: &[GpfifoEntry]) -> u32 {
        let start = put as usize;
        let n = self.entry_num as usize;
        let first = entries.len().min(n - start);
        let words = |es: &[GpfifoEntry]| -> Vec<u32> {
            es.iter().flat_map(|e| [e.entry0, e.entry1]).collect()
        };
        let m = self.mem.memory();
        m.write_words(start * ENTRY_BYTES, &words(&entries[..first]));
        if first < entries.len() {
            m.write_words(0, &words(&entries[first..]));
        }
        ((start + entries.len()) % n) as u32
    }
}

impl Channel {
    /// Allocates the gpfifo ring, the private command queue, the sync backend
    /// and job tracking. The channel is not yet on a runlist.
    pub(crate) fn setup_gpfifo(&self, args: GpfifoArgs) -> GpuResult<()> {
        let mut state = self.state.lock();
        let vm = state
            .vm
            .clone()
            .ok_or_else(|| GpuError::invalid(format!("channel {} has no address space", self.chid)))?;
        if state.gpfifo.is_some() {
            return Err(GpuError::AlreadyExists(format!(
                "channel {} gpfifo already allocated",
                self.chid
            )));
        }
        if args.num_entries == 0 {
            return Err(GpuError::invalid("gpfifo needs at least one entry"));
        }
        if args.deterministic && args.num_inflight_jobs == 0 {
            return Err(GpuError::invalid(
                "deterministic channels need preallocated job tracking",
            ));
        }

        let entry_num = roundup_pow_of_two(u64::from(args.num_entries)).max(2) as u32;
        let mem = DmaBuf::new_aligned(u64::from(entry_num) * ENTRY_BYTES as u64, 4096)?;
        let gpu_va = vm.map_kernel(&mem, RwFlag::ReadWrite)?;

        let queue = match PrivCmdQueue::new(&vm, entry_num) {
            Ok(q) => q,
            Err(e) => {
                if let Err(u) = vm.unmap_kernel(gpu_va) {
                    log::warn!("channel {}: gpfifo unmap on rollback failed: {u}", self.chid);
                }
                return Err(e);
            }
        };

        let mut sync = self.sync.lock();
        if sync.is_none() && self.shared.cfg.has_syncpoints {
            match ChannelSync::create(self) {
                Ok(s) => *sync = Some(s),
                Err(e) => {
                    queue.destroy(&vm);
                    if let Err(u) = vm.unmap_kernel(gpu_va) {
                        log::warn!("channel {}: gpfifo unmap on rollback failed: {u}", self.chid);
                    }
                    return Err(e);
                }
            }
        }
        drop(sync);

        *self.priv_cmd.lock() = Some(queue);
        if args.num_inflight_jobs > 0 {
            *self.joblist.lock() = JobSource::preallocated(args.num_inflight_jobs);
        }
        self.gp_get_store(0);
        self.gp_put_store(0);
        state.deterministic = args.deterministic;
        state.gpfifo = Some(Gpfifo {
            mem,
            gpu_va,
            entry_num,
        });
        log::debug!(
            "channel {}: gpfifo {entry_num} entries at 0x{gpu_va:x}, {} inflight jobs",
            self.chid,
            args.num_inflight_jobs
        );
        Ok(())
    }

    pub(crate) fn gpfifo(&self) -> Option<Gpfifo> {
        self.state.lock().gpfifo.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_count_keeps_one_slot() {
        let g = Gpfifo {
            mem: DmaBuf::new(4096).unwrap(),
            gpu_va: 0,
            entry_num: 8,
        };
        assert_eq!(g.free_count(0, 0), 7);
        assert_eq!(g.free_count(5, 1), 3);
        assert_eq!(g.free_count(1, 5), 3);
    }

    #[test]
    fn write_splits_at_ring_end() {
        let g = Gpfifo {
            mem: DmaBuf::new(4096).unwrap(),
            gpu_va: 0,
            entry_num: 4,
        };
        let es: Vec<_> = (0..3).map(|i| GpfifoEntry::new(0x1000 * (i + 1), 2)).collect();
        assert_eq!(g.write(3, &es), 2);
        assert_eq!(g.entry(3).gpu_va(), 0x1000);
        assert_eq!(g.entry(0).gpu_va(), 0x2000);
        assert_eq!(g.entry(1).gpu_va(), 0x3000);
    }
}
