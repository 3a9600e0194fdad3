//! Register-level model of the FIFO, GMMU and engine blocks.
//!
//! A real driver polls and pokes MMIO; here the same state lives in memory so
//! that preemption, runlist submission, fault reporting and engine reset can
//! be driven (and observed) by tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub const ENGINE_GR: u32 = 0;
pub const ENGINE_CE: u32 = 1;

/// FECS mailbox value reported while a context switch is restoring after WFI.
pub const FECS_METHOD_WFI_RESTORE: u32 = 0x80000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Gr,
    Ce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub id: u32,
    pub kind: EngineKind,
    pub runlist_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CtxStatus {
    #[default]
    Invalid,
    Valid,
    Load,
    Save,
    Switch,
}

/// Snapshot of `fifo_engine_status_r` for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatus {
    pub busy: bool,
    pub ctx_status: CtxStatus,
    pub id: u32,
    pub id_is_tsg: bool,
    pub next_id: u32,
    pub next_is_tsg: bool,
}

impl EngineStatus {
    #[must_use]
    pub const fn running(id: u32, is_tsg: bool) -> Self {
        Self {
            busy: true,
            ctx_status: CtxStatus::Valid,
            id,
            id_is_tsg: is_tsg,
            next_id: 0,
            next_is_tsg: false,
        }
    }

    #[must_use]
    pub const fn loading(from: (u32, bool), to: (u32, bool)) -> Self {
        Self {
            busy: true,
            ctx_status: CtxStatus::Load,
            id: from.0,
            id_is_tsg: from.1,
            next_id: to.0,
            next_is_tsg: to.1,
        }
    }

    #[must_use]
    pub const fn switching(from: (u32, bool), to: (u32, bool)) -> Self {
        Self {
            ctx_status: CtxStatus::Switch,
            ..Self::loading(from, to)
        }
    }

    /// The context the engine is (or is about to be) working for.
    #[must_use]
    pub const fn resident(&self) -> Option<(u32, bool)> {
        match self.ctx_status {
            CtxStatus::Invalid => None,
            CtxStatus::Load => Some((self.next_id, self.next_is_tsg)),
            _ => Some((self.id, self.id_is_tsg)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClient {
    Gpc,
    Hub,
}

/// One pending MMU fault as latched by the fault status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuFault {
    pub engine_id: u32,
    /// Channel resolved from the faulting instance pointer, if any.
    pub chid: Option<u32>,
    pub client: FaultClient,
    pub fault_va: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedErrorCode {
    CtxswTimeout,
    Other(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChannelHwState {
    bound: bool,
    enabled: bool,
    inst: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunlistSubmit {
    pub addr: u64,
    pub count: u32,
}

#[derive(Debug)]
pub struct GpuHw {
    engines: Vec<EngineInfo>,
    status: Mutex<Vec<EngineStatus>>,
    engine_resets: Vec<AtomicU32>,

    preempt_pending: AtomicBool,
    preempt_stuck: AtomicBool,
    preempts: AtomicU32,
    last_preempt: Mutex<Option<(u32, bool)>>,

    mmu_faults: Mutex<VecDeque<MmuFault>>,
    sched_error: Mutex<Option<SchedErrorCode>>,
    mmu_debug_mode: AtomicBool,
    fecs_mailbox: AtomicU32,

    tlb_invalidates: AtomicU64,
    l2_flushes: AtomicU64,
    nonstall_intrs: AtomicU64,

    runlists: Mutex<Vec<(RunlistSubmit, u32)>>,
    channels: Mutex<Vec<ChannelHwState>>,
}

impl GpuHw {
    #[must_use]
    pub fn new(num_channels: u32, num_runlists: u32) -> Self {
        let engines = vec![
            EngineInfo {
                id: ENGINE_GR,
                kind: EngineKind::Gr,
                runlist_id: 0,
            },
            EngineInfo {
                id: ENGINE_CE,
                kind: EngineKind::Ce,
                runlist_id: 0,
            },
        ];
        Self {
            status: Mutex::new(vec![EngineStatus::default(); engines.len()]),
            engine_resets: engines.iter().map(|_| AtomicU32::new(0)).collect(),
            engines,
            preempt_pending: AtomicBool::new(false),
            preempt_stuck: AtomicBool::new(false),
            preempts: AtomicU32::new(0),
            last_preempt: Mutex::new(None),
            mmu_faults: Mutex::new(VecDeque::new()),
            sched_error: Mutex::new(None),
            mmu_debug_mode: AtomicBool::new(false),
            fecs_mailbox: AtomicU32::new(0),
            tlb_invalidates: AtomicU64::new(0),
            l2_flushes: AtomicU64::new(0),
            nonstall_intrs: AtomicU64::new(0),
            runlists: Mutex::new(vec![(RunlistSubmit::default(), 0); num_runlists as usize]),
            channels: Mutex::new(vec![ChannelHwState::default(); num_channels as usize]),
        }
    }

    // ===========================================================================================
    // Engines
    // ===========================================================================================

    #[must_use]
    pub fn engines(&self) -> &[EngineInfo] {
        &self.engines
    }

    #[must_use]
    pub fn engine(&self, id: u32) -> Option<&EngineInfo> {
        self.engines.iter().find(|e| e.id == id)
    }

    #[must_use]
    pub fn engine_status(&self, id: u32) -> EngineStatus {
        self.status.lock().get(id as usize).copied().unwrap_or_default()
    }

    pub fn set_engine_status(&self, id: u32, status: EngineStatus) {
        if let Some(s) = self.status.lock().get_mut(id as usize) {
            *s = status;
        }
    }

    /// Resets an engine, dropping whatever context it held.
    pub fn reset_engine(&self, id: u32) {
        if let Some(c) = self.engine_resets.get(id as usize) {
            c.fetch_add(1, Ordering::Relaxed);
        }
        self.set_engine_status(id, EngineStatus::default());
        log::info!("engine {id} reset");
    }

    #[must_use]
    pub fn engine_reset_count(&self, id: u32) -> u32 {
        self.engine_resets
            .get(id as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    // ===========================================================================================
    // Preemption
    // ===========================================================================================

    /// Writes the preempt register. Unless the model is told to hang, the
    /// target's context is saved and the request acks immediately.
    pub fn preempt(&self, id: u32, is_tsg: bool) {
        self.preempts.fetch_add(1, Ordering::Relaxed);
        *self.last_preempt.lock() = Some((id, is_tsg));

        if self.preempt_stuck.load(Ordering::Acquire) {
            self.preempt_pending.store(true, Ordering::Release);
            return;
        }
        for s in self.status.lock().iter_mut() {
            if s.resident() == Some((id, is_tsg)) {
                *s = EngineStatus::default();
            }
        }
        self.preempt_pending.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn preempt_pending(&self) -> bool {
        self.preempt_pending.load(Ordering::Acquire)
    }

    /// Makes subsequent preempts never acknowledge.
    pub fn set_preempt_stuck(&self, stuck: bool) {
        self.preempt_stuck.store(stuck, Ordering::Release);
        if !stuck {
            self.preempt_pending.store(false, Ordering::Release);
        }
    }

    #[must_use]
    pub fn preempt_count(&self) -> u32 {
        self.preempts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_preempt(&self) -> Option<(u32, bool)> {
        *self.last_preempt.lock()
    }

    // ===========================================================================================
    // Interrupt sources
    // ===========================================================================================

    pub fn raise_mmu_fault(&self, fault: MmuFault) {
        self.mmu_faults.lock().push_back(fault);
    }

    pub fn take_mmu_faults(&self) -> Vec<MmuFault> {
        self.mmu_faults.lock().drain(..).collect()
    }

    pub fn raise_sched_error(&self, code: SchedErrorCode) {
        *self.sched_error.lock() = Some(code);
    }

    pub fn take_sched_error(&self) -> Option<SchedErrorCode> {
        self.sched_error.lock().take()
    }

    pub fn set_mmu_debug_mode(&self, enabled: bool) {
        self.mmu_debug_mode.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn mmu_debug_mode(&self) -> bool {
        self.mmu_debug_mode.load(Ordering::Acquire)
    }

    pub fn set_fecs_mailbox(&self, value: u32) {
        self.fecs_mailbox.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn fecs_mailbox(&self) -> u32 {
        self.fecs_mailbox.load(Ordering::Acquire)
    }

    pub fn nonstall_interrupt(&self) {
        self.nonstall_intrs.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn nonstall_count(&self) -> u64 {
        self.nonstall_intrs.load(Ordering::Relaxed)
    }

    // ===========================================================================================
    // GMMU / L2
    // ===========================================================================================

    pub fn tlb_invalidate(&self) {
        self.tlb_invalidates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn l2_flush(&self) {
        self.l2_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tlb_invalidate_count(&self) -> u64 {
        self.tlb_invalidates.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn l2_flush_count(&self) -> u64 {
        self.l2_flushes.load(Ordering::Relaxed)
    }

    // ===========================================================================================
    // Runlists and channel RAM
    // ===========================================================================================

    /// Points the runlist engine at a new buffer. The model latches it at once,
    /// so `runlist_pending` reads back clear.
    pub fn runlist_submit(&self, runlist_id: u32, addr: u64, count: u32) {
        if let Some(r) = self.runlists.lock().get_mut(runlist_id as usize) {
            r.0 = RunlistSubmit { addr, count };
            r.1 += 1;
        }
    }

    #[must_use]
    pub fn runlist_pending(&self, _runlist_id: u32) -> bool {
        false
    }

    #[must_use]
    pub fn runlist_current(&self, runlist_id: u32) -> RunlistSubmit {
        self.runlists
            .lock()
            .get(runlist_id as usize)
            .map(|r| r.0)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn runlist_write_count(&self, runlist_id: u32) -> u32 {
        self.runlists.lock().get(runlist_id as usize).map_or(0, |r| r.1)
    }

    pub fn channel_bind(&self, chid: u32, inst: u64) {
        if let Some(c) = self.channels.lock().get_mut(chid as usize) {
            *c = ChannelHwState {
                bound: true,
                enabled: false,
                inst,
            };
        }
    }

    pub fn channel_unbind(&self, chid: u32) {
        if let Some(c) = self.channels.lock().get_mut(chid as usize) {
            *c = ChannelHwState::default();
        }
    }

    pub fn channel_set_enabled(&self, chid: u32, enabled: bool) {
        if let Some(c) = self.channels.lock().get_mut(chid as usize) {
            c.enabled = enabled && c.bound;
        }
    }

    #[must_use]
    pub fn channel_enabled(&self, chid: u32) -> bool {
        self.channels.lock().get(chid as usize).is_some_and(|c| c.enabled)
    }

    #[must_use]
    pub fn channel_bound(&self, chid: u32) -> bool {
        self.channels.lock().get(chid as usize).is_some_and(|c| c.bound)
    }

    /// Resolves an instance block address back to its channel.
    #[must_use]
    pub fn chid_from_inst(&self, inst: u64) -> Option<u32> {
        self.channels
            .lock()
            .iter()
            .position(|c| c.bound && c.inst == inst)
            .map(|p| p as u32)
    }
}
