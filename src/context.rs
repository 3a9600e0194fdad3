//! Device-wide state and the entry points used by the layers above the core.
//!
//! Everything a subsystem needs is handed to it from here; there is no
//! process-wide device state.

#![allow(clippy::cast_possible_truncation)]

use crate::channel::{Channel, ChannelRef, CompletionCallback, GpfifoArgs};
use crate::config::GpuConfig;
use crate::error::GpuResult;
use crate::fifo::Fifo;
use crate::hw::pbdma::{PbdmaFault, PbdmaTarget, Progress};
use crate::hw::regs::{ENGINE_GR, EngineStatus, FaultClient, GpuHw, MmuFault};
use crate::hw::syncpt::SyncpointManager;
use crate::mm::{ComptagAllocator, DmaBuf, Vm};
use crate::sync::semaphore::SemaphoreSea;
use crate::utils::div_round_up;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ===============================================================================================
// Power references
// ===============================================================================================

/// Busy/idle reference count keeping the GPU powered.
#[derive(Debug, Default)]
pub struct PowerRefs {
    count: AtomicU32,
}

impl PowerRefs {
    pub fn busy(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn idle(&self) {
        if self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_err()
        {
            log::warn!("power reference underflow");
        }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// A busy reference dropped at the end of the scope.
    #[must_use]
    pub fn busy_guard(&self) -> PowerGuard<'_> {
        self.busy();
        PowerGuard(self)
    }
}

#[derive(Debug)]
pub struct PowerGuard<'a>(&'a PowerRefs);

impl Drop for PowerGuard<'_> {
    fn drop(&mut self) {
        self.0.idle();
    }
}

// ===============================================================================================
// Shared device state
// ===============================================================================================

/// The pieces of device state that channels and VMs hold on to.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    pub(crate) cfg: GpuConfig,
    pub(crate) hw: Arc<GpuHw>,
    pub(crate) syncpts: Arc<SyncpointManager>,
    pub(crate) sea: Arc<SemaphoreSea>,
    pub(crate) comptags: Arc<ComptagAllocator>,
    pub(crate) compbit_store: Arc<DmaBuf>,
    pub(crate) power: PowerRefs,
}

impl DeviceShared {
    pub(crate) fn new(cfg: GpuConfig) -> GpuResult<Arc<Self>> {
        let hw = Arc::new(GpuHw::new(cfg.num_channels, cfg.num_runlists));
        let syncpts = Arc::new(SyncpointManager::new(cfg.num_syncpoints));
        let sea = SemaphoreSea::new(cfg.semaphore_pool_count)?;
        let comptags = Arc::new(ComptagAllocator::new(&cfg));
        let store_size = div_round_up(
            u64::from(cfg.comptag_lines),
            u64::from(cfg.comptags_per_cacheline.max(1)),
        ) * cfg.aggregate_cacheline_size();
        let compbit_store = DmaBuf::new(store_size.max(4096))?;
        log::info!(
            "gpu: {} channels, {} runlists, {} comptag lines, syncpoints {}",
            cfg.num_channels,
            cfg.num_runlists,
            cfg.comptag_lines,
            cfg.has_syncpoints
        );
        Ok(Arc::new(Self {
            cfg,
            hw,
            syncpts,
            sea,
            comptags,
            compbit_store,
            power: PowerRefs::default(),
        }))
    }
}

// ===============================================================================================
// DeviceContext
// ===============================================================================================

/// Outcome of [`DeviceContext::run_channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// GET caught up with PUT.
    Idle,
    /// Blocked on a semaphore acquire or syncpoint wait.
    Stalled,
    /// More entries remain.
    BudgetExhausted,
    /// The channel faulted and recovery ran.
    Faulted,
    /// The channel is disabled or has no gpfifo.
    NotRunnable,
}

/// One GPU: configuration, hardware model, channel pool and schedulers.
#[derive(Debug)]
pub struct DeviceContext {
    shared: Arc<DeviceShared>,
    fifo: Fifo,
    next_vm_id: AtomicU32,
}

impl DeviceContext {
    /// # Errors
    /// Returns an error if device memory (semaphore sea, compbit store,
    /// runlists, instance blocks) cannot be allocated.
    pub fn new(cfg: GpuConfig) -> GpuResult<Self> {
        let shared = DeviceShared::new(cfg)?;
        let fifo = Fifo::new(Arc::clone(&shared))?;
        Ok(Self {
            shared,
            fifo,
            next_vm_id: AtomicU32::new(1),
        })
    }

    #[must_use]
    pub fn config(&self) -> &GpuConfig {
        &self.shared.cfg
    }

    #[must_use]
    pub fn hw(&self) -> &Arc<GpuHw> {
        &self.shared.hw
    }

    #[must_use]
    pub fn syncpoints(&self) -> &Arc<SyncpointManager> {
        &self.shared.syncpts
    }

    #[must_use]
    pub fn semaphore_sea(&self) -> &Arc<SemaphoreSea> {
        &self.shared.sea
    }

    #[must_use]
    pub fn comptags(&self) -> &Arc<ComptagAllocator> {
        &self.shared.comptags
    }

    #[must_use]
    pub const fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    #[must_use]
    pub fn power(&self) -> &PowerRefs {
        &self.shared.power
    }

    pub fn busy(&self) {
        self.shared.power.busy();
    }

    pub fn idle(&self) {
        self.shared.power.idle();
    }

    /// Creates a new address space.
    #[must_use]
    pub fn alloc_share(&self, userspace_managed: bool) -> Arc<Vm> {
        let id = self.next_vm_id.fetch_add(1, Ordering::Relaxed);
        let s = &self.shared;
        Vm::new(
            id,
            &s.cfg,
            Arc::clone(&s.hw),
            Arc::clone(&s.comptags),
            Arc::clone(&s.sea),
            Arc::clone(&s.compbit_store),
            userspace_managed,
        )
    }

    /// # Errors
    /// See [`Fifo::open_channel`].
    pub fn open_channel(&self, runlist_id: u32, privileged: bool) -> GpuResult<ChannelRef> {
        self.fifo.open_channel(runlist_id, privileged, None)
    }

    /// Opens a channel whose `callback` runs after every clean-up pass that
    /// retired at least one job.
    ///
    /// # Errors
    /// See [`Fifo::open_channel`].
    pub fn open_channel_with_completion_callback(
        &self,
        callback: impl Fn(&Channel) + Send + Sync + 'static,
        runlist_id: u32,
        privileged: bool,
    ) -> GpuResult<ChannelRef> {
        self.fifo
            .open_channel(runlist_id, privileged, Some(CompletionCallback::new(callback)))
    }

    /// # Errors
    /// See [`Fifo::alloc_gpfifo`].
    pub fn alloc_gpfifo(&self, ch: &Channel, args: GpfifoArgs) -> GpuResult<()> {
        self.fifo.alloc_gpfifo(ch, args)
    }

    pub fn close_channel(&self, ch: ChannelRef) {
        self.fifo.close_channel(ch);
    }

    pub fn kill_channel(&self, ch: ChannelRef) {
        self.fifo.kill_channel(ch);
    }

    pub fn set_debugger_attached(&self, attached: bool) {
        self.fifo.set_debugger_attached(attached);
    }

    /// Advances every channel watchdog by `elapsed_ms`.
    pub fn watchdog_tick(&self, elapsed_ms: u64) {
        self.fifo.watchdog_tick(elapsed_ms);
    }

    /// Services pending stalling interrupts (MMU faults, scheduler errors).
    pub fn isr(&self) {
        self.fifo.isr();
    }

    /// # Errors
    /// See [`Fifo::suspend`].
    pub fn channel_suspend(&self) -> GpuResult<()> {
        self.fifo.suspend()
    }

    /// # Errors
    /// See [`Fifo::resume`].
    pub fn channel_resume(&self) -> GpuResult<()> {
        self.fifo.resume()
    }

    /// Non-stall interrupt: wakes semaphore waiters on every live channel and
    /// retires whatever finished.
    pub fn semaphore_wakeup(&self) {
        log::trace!("semaphore wakeup");
        for ch in self.fifo.channels() {
            if let Some(r) = ch.get() {
                r.semaphore_wq().wake_all();
                r.update(true);
            }
        }
    }

    // ===========================================================================================
    // Execution model
    // ===========================================================================================

    /// Executes up to `budget` gpfifo entries of `ch` on the graphics engine.
    ///
    /// Stops at the first unsatisfied acquire or wait. Increments land as
    /// they execute; a non-stall interrupt wakes semaphore waiters and a
    /// syncpoint increment runs job clean-up. An unmapped push buffer or
    /// semaphore raises an MMU fault and a malformed push buffer a PBDMA
    /// error; both go through recovery before this returns.
    pub fn run_channel(&self, ch: &Channel, budget: u32) -> RunStatus {
        let hw = &self.shared.hw;
        let chid = ch.chid();
        let (Some(gpfifo), Some(vm)) = (ch.gpfifo(), ch.vm()) else {
            return RunStatus::NotRunnable;
        };
        if !hw.channel_enabled(chid) || ch.has_timedout() {
            return RunStatus::NotRunnable;
        }
        let ctx = ch.tsgid().map_or((chid, false), |t| (t, true));
        hw.set_engine_status(ENGINE_GR, EngineStatus::running(ctx.0, ctx.1));

        let target = ExecTarget {
            shared: &self.shared,
            vm: &vm,
            nonstall: Cell::new(false),
            syncpt_incrs: Cell::new(0),
        };
        let mut steps = 0;
        let mut fault = None;
        let status = {
            let mut exec = ch.exec.lock();
            loop {
                let get = ch.gp_get();
                if get == ch.gp_put() {
                    break RunStatus::Idle;
                }
                if steps >= budget {
                    break RunStatus::BudgetExhausted;
                }
                let entry = gpfifo.entry(get);
                let Some(words) = vm.gpu_read_words(entry.gpu_va(), entry.num_words() as usize)
                else {
                    fault = Some(PbdmaFault::BadSemaphore(entry.gpu_va()));
                    break RunStatus::Faulted;
                };
                let start = exec.resume_at;
                match exec.pbdma.execute(&target, &words, start) {
                    Ok(Progress::Done) => {
                        exec.resume_at = 0;
                        ch.gp_get_store((get + 1) % gpfifo.entry_num());
                        steps += 1;
                    }
                    Ok(Progress::Stalled { at }) => {
                        exec.resume_at = at;
                        break RunStatus::Stalled;
                    }
                    Err(e) => {
                        fault = Some(e);
                        break RunStatus::Faulted;
                    }
                }
            }
        };
        log::trace!("channel {chid}: ran {steps} entries, {status:?}");

        match fault {
            Some(PbdmaFault::BadSemaphore(va)) => {
                log::error!("channel {chid}: GPU access to unmapped VA 0x{va:x}");
                hw.raise_mmu_fault(MmuFault {
                    engine_id: ENGINE_GR,
                    chid: Some(chid),
                    client: FaultClient::Hub,
                    fault_va: va,
                });
                self.fifo.isr();
            }
            Some(e) => {
                log::error!("channel {chid}: pbdma error: {e}");
                self.fifo.handle_pbdma_error(ch);
            }
            None => {}
        }
        if status != RunStatus::Stalled {
            hw.set_engine_status(ENGINE_GR, EngineStatus::default());
        }
        if target.nonstall.get() {
            self.semaphore_wakeup();
        }
        if target.syncpt_incrs.get() > 0 {
            ch.update(true);
        }
        status
    }
}

struct ExecTarget<'a> {
    shared: &'a DeviceShared,
    vm: &'a Vm,
    nonstall: Cell<bool>,
    syncpt_incrs: Cell<u32>,
}

impl PbdmaTarget for ExecTarget<'_> {
    fn syncpt_read(&self, id: u32) -> u32 {
        self.shared.syncpts.read(id)
    }

    fn syncpt_incr(&self, id: u32) {
        self.shared.syncpts.hw_incr(id);
        self.syncpt_incrs.set(self.syncpt_incrs.get() + 1);
    }

    fn sema_read(&self, gpu_va: u64) -> Option<u32> {
        self.vm.gpu_read_u32(gpu_va)
    }

    fn sema_write(&self, gpu_va: u64, value: u32) -> bool {
        self.vm.gpu_write_u32(gpu_va, value)
    }

    fn nonstall_interrupt(&self) {
        self.shared.hw.nonstall_interrupt();
        self.nonstall.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_guard_balances() {
        let p = PowerRefs::default();
        {
            let _g = p.busy_guard();
            assert_eq!(p.count(), 1);
        }
        assert_eq!(p.count(), 0);
        p.idle();
        assert_eq!(p.count(), 0);
    }

    #[test]
    fn vm_ids_are_unique() {
        let dev = DeviceContext::new(GpuConfig::new().with_channels(8)).unwrap();
        let a = dev.alloc_share(false);
        let b = dev.alloc_share(false);
        assert_ne!(a.id(), b.id());
    }
}
