//! Channels: hardware command submission contexts.
//!
//! Channels live in a fixed table owned by the FIFO and are recycled through
//! a free list. Each one carries a single reference word: the top bits hold
//! the phase ([`RefPhase`]) and the low 32 bits the count, so "get only while
//! live" and "return to the pool when the last reference of a draining
//! channel goes" are each one compare-exchange.

#![allow(clippy::cast_possible_truncation)]

pub mod gpfifo;
pub mod job;
pub mod notifier;
pub mod priv_cmd;
pub mod submit;
pub mod sync;
pub mod watchdog;

pub use gpfifo::{Gpfifo, GpfifoArgs};
pub use notifier::ErrorNotification;
pub use priv_cmd::PrivCmdEntry;
pub use submit::SubmitFlags;
pub use sync::PreFence;

use crate::context::DeviceShared;
use crate::error::{GpuError, GpuResult};
use crate::fifo::runlist::InterleaveLevel;
use crate::hw::memory::HostMemory;
use crate::hw::pbdma::PbdmaState;
use crate::mm::Vm;
use crate::sync::WaitQueue;
use crate::sync::fence::Fence;
use crate::sync::semaphore::HwSemaphore;
use crate::utils::Bitmap;
use job::JobSource;
use notifier::ErrorNotifier;
use parking_lot::Mutex;
use priv_cmd::PrivCmdQueue;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use sync::ChannelSync;
use watchdog::{CtxswTimeout, Watchdog};

const INST_BLOCK_SIZE: usize = 4096;

/// Default timeslice for channels and TSGs, in microseconds.
pub const DEFAULT_TIMESLICE_US: u32 = 128 << 3;

// ===============================================================================================
// Reference word
// ===============================================================================================

const PHASE_SHIFT: u32 = 32;
const COUNT_MASK: u64 = 0xffff_ffff;

/// Where a channel is in its reference lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefPhase {
    /// References may be taken.
    Live,
    /// Teardown has begun; no new references, existing ones drain.
    Draining,
    /// Back in (or on its way to) the free pool.
    Dead,
}

impl RefPhase {
    const fn bits(self) -> u64 {
        let p: u64 = match self {
            Self::Live => 0,
            Self::Draining => 1,
            Self::Dead => 2,
        };
        p << PHASE_SHIFT
    }

    const fn of(word: u64) -> Self {
        match word >> PHASE_SHIFT {
            0 => Self::Live,
            1 => Self::Draining,
            _ => Self::Dead,
        }
    }
}

const fn ref_word(phase: RefPhase, count: u32) -> u64 {
    phase.bits() | count as u64
}

/// Callback run after a clean-up pass retired at least one job.
#[derive(Clone)]
pub struct CompletionCallback(Arc<dyn Fn(&Channel) + Send + Sync>);

impl CompletionCallback {
    pub fn new(f: impl Fn(&Channel) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionCallback")
    }
}

// ===============================================================================================
// Free list
// ===============================================================================================

#[derive(Debug)]
struct FreeListInner {
    free: VecDeque<u32>,
    in_pool: Bitmap,
    high_water: u32,
}

/// Pool of unused hardware channel ids.
#[derive(Debug)]
pub(crate) struct ChannelFreeList {
    total: u32,
    inner: Mutex<FreeListInner>,
}

impl ChannelFreeList {
    pub(crate) fn new(total: u32) -> Self {
        let mut in_pool = Bitmap::new(total as usize);
        in_pool.set_range(0, total as usize);
        Self {
            total,
            inner: Mutex::new(FreeListInner {
                free: (0..total).collect(),
                in_pool,
                high_water: 0,
            }),
        }
    }

    pub(crate) fn pop(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let chid = inner.free.pop_front()?;
        inner.in_pool.clear(chid as usize);
        let used = self.total - inner.free.len() as u32;
        inner.high_water = inner.high_water.max(used);
        Some(chid)
    }

    pub(crate) fn release(&self, chid: u32) {
        let mut inner = self.inner.lock();
        if inner.in_pool.test_and_set(chid as usize) {
            log::error!("channel {chid}: extra free");
            return;
        }
        inner.free.push_back(chid);
    }

    pub(crate) fn used(&self) -> u32 {
        self.total - self.inner.lock().free.len() as u32
    }

    pub(crate) fn high_water(&self) -> u32 {
        self.inner.lock().high_water
    }
}

// ===============================================================================================
// Channel
// ===============================================================================================

#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub(crate) vm: Option<Arc<Vm>>,
    pub(crate) gpfifo: Option<Gpfifo>,
    pub(crate) runlist_id: u32,
    pub(crate) privileged: bool,
    pub(crate) tsgid: Option<u32>,
    pub(crate) deterministic: bool,
    pub(crate) interleave: InterleaveLevel,
    pub(crate) timeslice_us: u32,
}

/// Where the PBDMA model stopped in this channel's gpfifo.
#[derive(Debug, Default)]
pub(crate) struct ExecState {
    pub(crate) pbdma: PbdmaState,
    /// Word offset inside the entry at GET to resume from.
    pub(crate) resume_at: usize,
}

/// A hardware channel.
#[derive(Debug)]
pub struct Channel {
    chid: u32,
    shared: Arc<DeviceShared>,
    free_list: Arc<ChannelFreeList>,
    inst: HostMemory,

    refs: AtomicU64,
    ref_wq: WaitQueue,
    opens: AtomicU64,

    state: Mutex<ChannelState>,
    joblist: Mutex<JobSource>,
    cleanup_lock: Mutex<()>,
    sync: Mutex<Option<ChannelSync>>,
    priv_cmd: Mutex<Option<PrivCmdQueue>>,
    notifier: Mutex<ErrorNotifier>,
    submit_lock: Mutex<()>,
    watchdog: Mutex<Watchdog>,
    ctxsw: Mutex<CtxswTimeout>,
    pub(crate) exec: Mutex<ExecState>,
    hw_sema: Mutex<Option<Arc<HwSemaphore>>>,
    callback: Mutex<Option<CompletionCallback>>,

    has_timedout: AtomicBool,
    gp_get: AtomicU32,
    gp_put: AtomicU32,

    semaphore_wq: Arc<WaitQueue>,
    notifier_wq: WaitQueue,
}

impl Channel {
    pub(crate) fn new(
        chid: u32,
        shared: Arc<DeviceShared>,
        free_list: Arc<ChannelFreeList>,
    ) -> GpuResult<Self> {
        let inst = HostMemory::new(INST_BLOCK_SIZE)?;
        let cfg = &shared.cfg;
        let watchdog = Watchdog::new(cfg.wdt_enabled && cfg.timeouts_enabled, cfg.watchdog_timeout_ms);
        Ok(Self {
            chid,
            inst,
            free_list,
            refs: AtomicU64::new(ref_word(RefPhase::Dead, 0)),
            ref_wq: WaitQueue::new(),
            opens: AtomicU64::new(0),
            state: Mutex::new(ChannelState::default()),
            joblist: Mutex::new(JobSource::default()),
            cleanup_lock: Mutex::new(()),
            sync: Mutex::new(None),
            priv_cmd: Mutex::new(None),
            notifier: Mutex::new(ErrorNotifier::default()),
            submit_lock: Mutex::new(()),
            watchdog: Mutex::new(watchdog),
            ctxsw: Mutex::new(CtxswTimeout::default()),
            exec: Mutex::new(ExecState::default()),
            hw_sema: Mutex::new(None),
            callback: Mutex::new(None),
            has_timedout: AtomicBool::new(false),
            gp_get: AtomicU32::new(0),
            gp_put: AtomicU32::new(0),
            semaphore_wq: Arc::new(WaitQueue::new()),
            notifier_wq: WaitQueue::new(),
            shared,
        })
    }

    #[must_use]
    pub const fn chid(&self) -> u32 {
        self.chid
    }

    /// Instance block address, as latched by the channel RAM.
    #[must_use]
    pub fn inst_addr(&self) -> u64 {
        self.inst.addr()
    }

    // ===========================================================================================
    // References
    // ===========================================================================================

    /// Takes a reference if the channel is live.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> Option<ChannelRef> {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if RefPhase::of(cur) != RefPhase::Live {
                log::trace!("channel {}: get refused ({:?})", self.chid, RefPhase::of(cur));
                return None;
            }
            match self
                .refs
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(ChannelRef { ch: Arc::clone(self) }),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drops one reference. The last reference of a draining channel moves
    /// it to `Dead` and returns its id to the pool.
    fn put(&self) {
        let mut cur = self.refs.load(Ordering::Acquire);
        let released = loop {
            let count = (cur & COUNT_MASK) as u32;
            if count == 0 {
                log::error!("channel {}: extra put", self.chid);
                return;
            }
            let phase = RefPhase::of(cur);
            let release = phase == RefPhase::Draining && count == 1;
            let next = if release {
                ref_word(RefPhase::Dead, 0)
            } else {
                cur - 1
            };
            match self
                .refs
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break release,
                Err(actual) => cur = actual,
            }
        };
        if released {
            log::debug!("channel {}: returned to pool", self.chid);
            self.free_list.release(self.chid);
        }
        self.ref_wq.wake_all();
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        (self.refs.load(Ordering::Acquire) & COUNT_MASK) as u32
    }

    #[must_use]
    pub fn ref_phase(&self) -> RefPhase {
        RefPhase::of(self.refs.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_referenceable(&self) -> bool {
        self.ref_phase() == RefPhase::Live
    }

    /// How many times this hardware channel has been opened.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Live -> Draining. Returns false if the channel was not live.
    pub(crate) fn begin_teardown(&self) -> bool {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if RefPhase::of(cur) != RefPhase::Live {
                return false;
            }
            let next = ref_word(RefPhase::Draining, (cur & COUNT_MASK) as u32);
            match self
                .refs
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Dead -> Live with the opener's reference.
    pub(crate) fn revive(self: &Arc<Self>) -> GpuResult<ChannelRef> {
        self.refs
            .compare_exchange(
                ref_word(RefPhase::Dead, 0),
                ref_word(RefPhase::Live, 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|w| {
                log::error!("channel {}: reopened while in use (refs 0x{w:x})", self.chid);
                GpuError::Busy
            })?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(ChannelRef { ch: Arc::clone(self) })
    }

    /// Blocks until at most `n` references remain, warning every `interval`.
    pub(crate) fn wait_refs(&self, n: u32, interval: Duration) {
        while !self
            .ref_wq
            .wait_event_timeout(|| self.ref_count() <= n, interval)
        {
            log::warn!(
                "channel {}: still {} references after {interval:?}",
                self.chid,
                self.ref_count()
            );
        }
    }

    // ===========================================================================================
    // State
    // ===========================================================================================

    #[must_use]
    pub fn has_timedout(&self) -> bool {
        self.has_timedout.load(Ordering::Acquire)
    }

    /// One way: a timed-out channel can only be closed.
    pub(crate) fn set_timedout(&self) {
        self.has_timedout.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn gp_get(&self) -> u32 {
        self.gp_get.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn gp_put(&self) -> u32 {
        self.gp_put.load(Ordering::Acquire)
    }

    pub(crate) fn gp_get_store(&self, v: u32) {
        self.gp_get.store(v, Ordering::Release);
    }

    pub(crate) fn gp_put_store(&self, v: u32) {
        self.gp_put.store(v, Ordering::Release);
    }

    #[must_use]
    pub fn vm(&self) -> Option<Arc<Vm>> {
        self.state.lock().vm.clone()
    }

    #[must_use]
    pub fn runlist_id(&self) -> u32 {
        self.state.lock().runlist_id
    }

    #[must_use]
    pub fn tsgid(&self) -> Option<u32> {
        self.state.lock().tsgid
    }

    pub(crate) fn set_tsgid(&self, tsgid: Option<u32>) {
        self.state.lock().tsgid = tsgid;
    }

    #[must_use]
    pub fn privileged(&self) -> bool {
        self.state.lock().privileged
    }

    #[must_use]
    pub fn deterministic(&self) -> bool {
        self.state.lock().deterministic
    }

    /// Whether a gpfifo has been allocated.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.state.lock().gpfifo.is_some()
    }

    #[must_use]
    pub fn interleave(&self) -> InterleaveLevel {
        self.state.lock().interleave
    }

    pub(crate) fn set_interleave_level(&self, level: InterleaveLevel) {
        self.state.lock().interleave = level;
    }

    #[must_use]
    pub fn timeslice_us(&self) -> u32 {
        self.state.lock().timeslice_us
    }

    pub(crate) fn set_timeslice_us(&self, us: u32) {
        self.state.lock().timeslice_us = us;
    }

    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.joblist.lock().len()
    }

    /// The hardware syncpoint owned by this channel, if syncpoint-backed.
    #[must_use]
    pub fn syncpt_id(&self) -> Option<u32> {
        self.sync.lock().as_ref().and_then(ChannelSync::syncpt_id)
    }

    #[must_use]
    pub fn semaphore_wq(&self) -> &Arc<WaitQueue> {
        &self.semaphore_wq
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// A fence allocated the same way job post-fences are.
    #[must_use]
    pub fn alloc_fence(&self) -> Arc<Fence> {
        self.joblist.lock().alloc_fence()
    }

    // ===========================================================================================
    // Lifecycle
    // ===========================================================================================

    /// Resets per-open state and binds the instance block.
    pub(crate) fn reset_for_open(
        &self,
        runlist_id: u32,
        privileged: bool,
        callback: Option<CompletionCallback>,
    ) {
        let cfg = &self.shared.cfg;
        *self.state.lock() = ChannelState {
            runlist_id,
            privileged,
            timeslice_us: DEFAULT_TIMESLICE_US,
            ..ChannelState::default()
        };
        *self.joblist.lock() = JobSource::default();
        *self.notifier.lock() = ErrorNotifier::default();
        *self.watchdog.lock() =
            Watchdog::new(cfg.wdt_enabled && cfg.timeouts_enabled, cfg.watchdog_timeout_ms);
        *self.ctxsw.lock() = CtxswTimeout::default();
        *self.exec.lock() = ExecState::default();
        *self.callback.lock() = callback;
        self.has_timedout.store(false, Ordering::Release);
        self.gp_get_store(0);
        self.gp_put_store(0);
        self.shared.hw.channel_bind(self.chid, self.inst.addr());
    }

    /// Binds the channel to an address space and takes a reference on it.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the channel is already bound.
    pub fn bind_vm(&self, vm: &Arc<Vm>) -> GpuResult<()> {
        let mut state = self.state.lock();
        if state.vm.is_some() {
            return Err(GpuError::AlreadyExists(format!(
                "channel {} already bound to a VM",
                self.chid
            )));
        }
        state.vm = Some(Arc::clone(vm));
        log::debug!("channel {}: bound to vm {}", self.chid, vm.id());
        Ok(())
    }

    /// Force-completes every in-flight job, wakes all waiters and runs the
    /// normal clean-up path.
    pub(crate) fn abort_clean_up(&self) {
        {
            let _cleanup = self.cleanup_lock.lock();
            if let Some(sync) = &*self.sync.lock() {
                sync.set_min_eq_max();
            }
            for job in self.joblist.lock().iter() {
                if let Some(sema) = job.post_fence.semaphore() {
                    sema.release(true);
                }
            }
        }
        self.semaphore_wq.wake_all();
        self.notifier_wq.wake_all();
        self.update(true);
    }

    /// Waits out any submission already past its timeout check. Returns
    /// true if jobs are still queued afterwards.
    pub(crate) fn quiesce_submits(&self) -> bool {
        drop(self.submit_lock.lock());
        !self.joblist.lock().is_empty()
    }

    /// Frees everything the channel acquired since it was opened. Jobs must
    /// already have been aborted.
    pub(crate) fn teardown(&self) {
        self.watchdog_stop();
        self.update(true);
        let leftover = self.joblist.lock().len();
        if leftover > 0 {
            log::error!("channel {}: {leftover} jobs left at teardown", self.chid);
        }
        *self.joblist.lock() = JobSource::default();

        let (vm, gpfifo) = {
            let mut state = self.state.lock();
            (state.vm.take(), state.gpfifo.take())
        };
        if let Some(sync) = self.sync.lock().take() {
            sync.destroy();
        }
        self.hw_sema.lock().take();
        let queue = self.priv_cmd.lock().take();
        if let Some(vm) = &vm {
            if let Some(q) = queue {
                q.destroy(vm);
            }
            if let Some(g) = gpfifo
                && let Err(e) = vm.unmap_kernel(g.gpu_va())
            {
                log::warn!("channel {}: gpfifo unmap failed: {e}", self.chid);
            }
        }
        self.notifier.lock().reset();
        self.callback.lock().take();
        self.shared.hw.channel_unbind(self.chid);
        log::debug!("channel {}: torn down", self.chid);
    }
}

// ===============================================================================================
// ChannelRef
// ===============================================================================================

/// A counted reference to a live (or draining) channel.
pub struct ChannelRef {
    ch: Arc<Channel>,
}

impl ChannelRef {
    /// Takes another reference; fails once teardown has begun.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        self.ch.get()
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.ch
    }
}

impl Deref for ChannelRef {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.ch
    }
}

impl Drop for ChannelRef {
    fn drop(&mut self) {
        self.ch.put();
    }
}

impl fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRef").field("chid", &self.ch.chid).finish()
    }
}
