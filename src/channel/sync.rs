//! Per-channel sync backends: builds the wait and increment commands that
//! bracket a job and arms its post-fence.
//!
//! The syncpoint backend waits on and increments a host syncpoint owned by
//! the channel. The semaphore backend acquires on any slot in the sea through
//! the read-only mapping and releases the channel's own slot through its
//! pool's read-write mapping.

#![allow(clippy::cast_possible_truncation)]

use super::Channel;
use super::priv_cmd::{PrivCmdEntry, PrivCmdQueue};
use crate::error::{GpuError, GpuResult};
use crate::hw::pbdma::{
    NON_STALL_INT, SEMAPHORE_A, SEMAPHORE_B, SEMAPHORE_C, SEMAPHORE_D,
    SEMAPHORE_D_ACQUIRE_SWITCH_ENABLED, SEMAPHORE_D_OPERATION_ACQ_GEQ,
    SEMAPHORE_D_OPERATION_RELEASE, SEMAPHORE_D_RELEASE_WFI_DISABLED, SYNCPOINT_A, SYNCPOINT_B,
    SYNCPOINT_B_OPERATION_INCR, SYNCPOINT_B_OPERATION_WAIT, SYNCPOINT_B_WAIT_SWITCH_ENABLED, WFI,
    incr_header, syncpoint_b,
};
use crate::hw::syncpt::SyncpointManager;
use crate::mm::Vm;
use crate::sync::fence::Fence;
use crate::sync::semaphore::{HwSemaphore, Semaphore};
use crate::sync::timeline::{PtSource, SyncFence, SyncTimeline};
use crate::utils::{hi32, lo32};
use std::sync::Arc;

pub const SYNCPT_WAIT_WORDS: u32 = 4;
pub const SYNCPT_INCR_WORDS: u32 = 6;
pub const SYNCPT_INCR_WFI_WORDS: u32 = 8;
pub const SEMA_ACQUIRE_WORDS: u32 = 8;
pub const SEMA_RELEASE_WORDS: u32 = 10;

/// What a submission waits on before its entries run.
#[derive(Debug, Clone)]
pub enum PreFence {
    /// A raw syncpoint threshold.
    Syncpoint { id: u32, thresh: u32 },
    Fence(Arc<Fence>),
    /// A sync-framework fence, possibly spanning several timelines.
    Sync(SyncFence),
}

#[derive(Debug)]
pub(crate) enum ChannelSync {
    Syncpoint {
        mgr: Arc<SyncpointManager>,
        id: u32,
        timeline: Arc<SyncTimeline>,
    },
    Semaphore {
        timeline: Arc<SyncTimeline>,
    },
}

enum WaitOp {
    Syncpoint { id: u32, thresh: u32 },
    Semaphore(Semaphore),
}

impl ChannelSync {
    pub(crate) fn create(ch: &Channel) -> GpuResult<Self> {
        let timeline = SyncTimeline::new(format!("ch{}", ch.chid));
        if ch.shared.cfg.has_syncpoints {
            let mgr = Arc::clone(&ch.shared.syncpts);
            let id = mgr.alloc(&format!("ch{}", ch.chid))?;
            log::debug!("channel {}: syncpoint {id}", ch.chid);
            Ok(Self::Syncpoint { mgr, id, timeline })
        } else {
            Ok(Self::Semaphore { timeline })
        }
    }

    pub(crate) fn timeline(&self) -> &Arc<SyncTimeline> {
        match self {
            Self::Syncpoint { timeline, .. } | Self::Semaphore { timeline } => timeline,
        }
    }

    #[must_use]
    pub(crate) const fn syncpt_id(&self) -> Option<u32> {
        match self {
            Self::Syncpoint { id, .. } => Some(*id),
            Self::Semaphore { .. } => None,
        }
    }

    fn wait_syncpt(&self, id: u32, thresh: u32, ops: &mut Vec<WaitOp>) -> GpuResult<()> {
        let Self::Syncpoint { mgr, .. } = self else {
            return Err(GpuError::NoDevice(
                "semaphore-backed channel cannot wait on a syncpoint".into(),
            ));
        };
        if !mgr.is_allocated(id) {
            log::warn!("invalid syncpoint {id} in wait, elided");
            return Ok(());
        }
        if !mgr.is_expired(id, thresh) {
            ops.push(WaitOp::Syncpoint { id, thresh });
        }
        Ok(())
    }

    fn wait_source(&self, source: PtSource, ops: &mut Vec<WaitOp>) -> GpuResult<()> {
        match source {
            PtSource::Syncpoint { id, thresh, .. } => self.wait_syncpt(id, thresh, ops),
            PtSource::Semaphore(sema) => {
                if let Self::Syncpoint { .. } = self {
                    return Err(GpuError::invalid(
                        "syncpoint-backed channel cannot wait on a semaphore",
                    ));
                }
                if !sema.is_released() {
                    ops.push(WaitOp::Semaphore(sema));
                }
                Ok(())
            }
        }
    }

    /// Builds the wait command for `pre`. Expired or unarmed waits produce
    /// no command.
    ///
    /// # Errors
    /// `NoDevice` for a syncpoint wait on the semaphore backend,
    /// `InvalidArgument` for a semaphore wait on the syncpoint backend and
    /// `OutOfMemory` if the private command queue is full.
    pub(crate) fn wait_cmd(
        &self,
        vm: &Vm,
        pre: &PreFence,
        queue: &mut PrivCmdQueue,
    ) -> GpuResult<Option<PrivCmdEntry>> {
        let mut ops = Vec::new();
        match pre {
            PreFence::Syncpoint { id, thresh } => self.wait_syncpt(*id, *thresh, &mut ops)?,
            PreFence::Fence(f) => {
                if let Some(src) = f.pt_source() {
                    self.wait_source(src, &mut ops)?;
                }
            }
            PreFence::Sync(sf) => {
                for pt in sf.points() {
                    self.wait_source(pt.source().clone(), &mut ops)?;
                }
            }
        }
        if ops.is_empty() {
            return Ok(None);
        }

        let mut words = Vec::with_capacity(ops.len() * SEMA_ACQUIRE_WORDS as usize);
        for op in &ops {
            match op {
                WaitOp::Syncpoint { id, thresh } => words.extend(syncpt_wait_words(*id, *thresh)),
                WaitOp::Semaphore(sema) => {
                    let va = vm.sea_ro_va()? + sema.hw().sea_offset();
                    words.extend(sema_acquire_words(va, sema.value()));
                }
            }
        }
        let entry = queue.alloc(words.len() as u32)?;
        queue.write(&entry, &words);
        Ok(Some(entry))
    }

    /// Builds the increment command and arms `fence` with its target.
    ///
    /// # Errors
    /// `OutOfMemory` if the private command queue or the semaphore pool is
    /// full. Nothing is reserved on failure.
    pub(crate) fn incr_cmd(
        &self,
        ch: &Channel,
        vm: &Vm,
        queue: &mut PrivCmdQueue,
        fence: &Fence,
        wfi: bool,
        need_sync_fence: bool,
    ) -> GpuResult<PrivCmdEntry> {
        match self {
            Self::Syncpoint { mgr, id, timeline } => {
                let words = syncpt_incr_words(*id, wfi);
                let entry = queue.alloc(words.len() as u32)?;
                queue.write(&entry, &words);
                let thresh = mgr.incr_max(*id, 2);
                let sync_fence = need_sync_fence.then(|| {
                    SyncFence::new(timeline.create_pt(PtSource::Syncpoint {
                        mgr: Arc::clone(mgr),
                        id: *id,
                        thresh,
                    }))
                });
                fence.init_syncpoint(Arc::clone(mgr), *id, thresh, sync_fence, wfi);
                Ok(entry)
            }
            Self::Semaphore { timeline } => {
                let hw = ch.hw_semaphore(vm)?;
                let entry = queue.alloc(SEMA_RELEASE_WORDS)?;
                let pool = hw.pool();
                let va = pool
                    .rw_va()
                    .ok_or_else(|| GpuError::fault("semaphore pool is not mapped"))?
                    + hw.page_offset();
                let sema = Semaphore::new(&hw);
                queue.write(&entry, &sema_release_words(va, sema.value(), wfi));
                let sync_fence = need_sync_fence
                    .then(|| SyncFence::new(timeline.create_pt(PtSource::Semaphore(sema.clone()))));
                fence.init_semaphore(sema, Arc::clone(&ch.semaphore_wq), sync_fence, wfi);
                Ok(entry)
            }
        }
    }

    /// Marks every outstanding increment as done.
    pub(crate) fn set_min_eq_max(&self) {
        if let Self::Syncpoint { mgr, id, .. } = self {
            mgr.set_min_eq_max(*id);
        }
    }

    pub(crate) fn signal_timeline(&self) {
        self.timeline().signal();
    }

    pub(crate) fn destroy(self) {
        if let Self::Syncpoint { mgr, id, .. } = self {
            mgr.set_min_eq_max(id);
            mgr.free(id);
        }
    }
}

impl Channel {
    /// The channel's semaphore slot, allocated from its VM's pool on first
    /// use.
    pub(crate) fn hw_semaphore(&self, vm: &Vm) -> GpuResult<Arc<HwSemaphore>> {
        let mut slot = self.hw_sema.lock();
        if let Some(hw) = &*slot {
            return Ok(Arc::clone(hw));
        }
        let pool = vm.semaphore_pool()?;
        let hw = pool.alloc_hw_sema(self.chid)?;
        *slot = Some(Arc::clone(&hw));
        Ok(hw)
    }
}

#[must_use]
pub fn syncpt_wait_words(id: u32, thresh: u32) -> [u32; 4] {
    [
        incr_header(SYNCPOINT_A, 1),
        thresh,
        incr_header(SYNCPOINT_B, 1),
        syncpoint_b(id, SYNCPOINT_B_OPERATION_WAIT | SYNCPOINT_B_WAIT_SWITCH_ENABLED),
    ]
}

/// Two increments: one after the engine goes idle and one from host.
#[must_use]
pub fn syncpt_incr_words(id: u32, wfi: bool) -> Vec<u32> {
    let mut w = Vec::with_capacity(SYNCPT_INCR_WFI_WORDS as usize);
    if wfi {
        w.extend([incr_header(WFI, 1), 0]);
    }
    w.extend([
        incr_header(SYNCPOINT_A, 1),
        0,
        incr_header(SYNCPOINT_B, 1),
        syncpoint_b(id, SYNCPOINT_B_OPERATION_INCR),
        incr_header(SYNCPOINT_B, 1),
        syncpoint_b(id, SYNCPOINT_B_OPERATION_INCR),
    ]);
    w
}

#[must_use]
pub fn sema_acquire_words(va: u64, value: u32) -> [u32; 8] {
    [
        incr_header(SEMAPHORE_A, 1),
        hi32(va) & 0xff,
        incr_header(SEMAPHORE_B, 1),
        lo32(va),
        incr_header(SEMAPHORE_C, 1),
        value,
        incr_header(SEMAPHORE_D, 1),
        SEMAPHORE_D_OPERATION_ACQ_GEQ | SEMAPHORE_D_ACQUIRE_SWITCH_ENABLED,
    ]
}

/// Release followed by a non-stall interrupt so the CPU notices.
#[must_use]
pub fn sema_release_words(va: u64, value: u32, wfi: bool) -> [u32; 10] {
    let wfi_bit = if wfi { 0 } else { SEMAPHORE_D_RELEASE_WFI_DISABLED };
    [
        incr_header(SEMAPHORE_A, 1),
        hi32(va) & 0xff,
        incr_header(SEMAPHORE_B, 1),
        lo32(va),
        incr_header(SEMAPHORE_C, 1),
        value,
        incr_header(SEMAPHORE_D, 1),
        SEMAPHORE_D_OPERATION_RELEASE | wfi_bit,
        incr_header(NON_STALL_INT, 1),
        0,
    ]
}
