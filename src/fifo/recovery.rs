//! Preemption, fault handling and channel/TSG recovery.

#![allow(clippy::cast_possible_truncation)]

use super::Fifo;
use crate::channel::Channel;
use crate::channel::notifier::{IDLE_TIMEOUT, MMU_ERR_FLT, PBDMA_ERROR};
use crate::error::{GpuError, GpuResult};
use crate::hw::regs::{CtxStatus, EngineKind, FECS_METHOD_WFI_RESTORE, FaultClient, MmuFault, SchedErrorCode};
use std::time::{Duration, Instant};

const PREEMPT_POLL_MIN: Duration = Duration::from_micros(10);
const PREEMPT_POLL_MAX: Duration = Duration::from_micros(200);

/// A scheduling context: `(id, is_tsg)`.
pub type CtxId = (u32, bool);

/// GR reset postponed while a debugger inspects the faulting context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredReset {
    pub engines: u32,
    pub ctx: Option<CtxId>,
}

/// One fault as handled by recovery, real or injected.
#[derive(Debug, Clone, Copy)]
struct FaultRecord {
    engine_id: u32,
    client: FaultClient,
    fault_va: u64,
    chid: Option<u32>,
    /// Context supplied by a software-initiated recovery.
    hint: Option<CtxId>,
    fake: bool,
}

impl Fifo {
    fn ctx_of(&self, ch: &Channel) -> CtxId {
        ch.tsgid().map_or((ch.chid(), false), |t| (t, true))
    }

    fn ctx_members(&self, (id, is_tsg): CtxId) -> Vec<u32> {
        if is_tsg {
            self.tsg_channels(id)
        } else {
            vec![id]
        }
    }

    fn notify_ctx(&self, ctx: CtxId, code: u32) {
        for chid in self.ctx_members(ctx) {
            if let Some(r) = self.channels[chid as usize].get() {
                r.set_error_notifier(code);
            }
        }
    }

    // ===========================================================================================
    // Preemption
    // ===========================================================================================

    /// Preempts `chid`, or its TSG if it has one.
    ///
    /// # Errors
    /// Returns `Busy` if the preempt did not complete in time; the context
    /// has then been recovered.
    pub fn preempt_channel(&self, chid: u32) -> GpuResult<()> {
        let ch = self.channel(chid).ok_or(GpuError::InvalidChannelId(chid))?;
        match ch.tsgid() {
            Some(t) => self.preempt_ctx((t, true)),
            None => self.preempt_ctx((chid, false)),
        }
    }

    /// # Errors
    /// As for [`Self::preempt_channel`].
    pub fn preempt_tsg(&self, tsgid: u32) -> GpuResult<()> {
        self.preempt_ctx((tsgid, true))
    }

    fn preempt_ctx(&self, ctx: CtxId) -> GpuResult<()> {
        let hw = &self.shared.hw;
        hw.preempt(ctx.0, ctx.1);
        let deadline =
            Instant::now() + Duration::from_millis(u64::from(self.shared.cfg.idle_timeout_ms()));
        let mut delay = PREEMPT_POLL_MIN;
        loop {
            if !hw.preempt_pending() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(PREEMPT_POLL_MAX);
        }

        let kind = if ctx.1 { "tsg" } else { "channel" };
        log::error!("preempt {kind} {} timed out", ctx.0);
        self.notify_ctx(ctx, IDLE_TIMEOUT);
        if ctx.1 {
            self.recover_tsg(ctx.0);
        } else {
            self.recover_ch(ctx.0);
        }
        Err(GpuError::Busy)
    }

    // ===========================================================================================
    // Engine lookup
    // ===========================================================================================

    /// Engines working for (or switching to/from) `ctx`, as a bit mask.
    #[must_use]
    pub fn engines_on_id(&self, ctx: CtxId) -> u32 {
        let hw = &self.shared.hw;
        let mut mask = 0;
        for e in hw.engines() {
            let s = hw.engine_status(e.id);
            let cur = (s.id, s.id_is_tsg) == ctx;
            let next = (s.next_id, s.next_is_tsg) == ctx;
            let hit = match s.ctx_status {
                CtxStatus::Valid | CtxStatus::Save => cur,
                CtxStatus::Load => next,
                CtxStatus::Switch => cur || next,
                CtxStatus::Invalid => false,
            };
            if hit {
                mask |= 1 << e.id;
            }
        }
        mask
    }

    /// The busy engine stuck in a context switch and the context to blame.
    #[must_use]
    pub fn failing_engine(&self) -> Option<(u32, CtxId)> {
        let hw = &self.shared.hw;
        hw.engines().iter().find_map(|e| {
            let s = hw.engine_status(e.id);
            if !s.busy {
                return None;
            }
            let cur = (s.id, s.id_is_tsg);
            let next = (s.next_id, s.next_is_tsg);
            let ctx = match s.ctx_status {
                CtxStatus::Load => next,
                CtxStatus::Switch if hw.fecs_mailbox() & FECS_METHOD_WFI_RESTORE != 0 => next,
                CtxStatus::Switch | CtxStatus::Save => cur,
                CtxStatus::Valid | CtxStatus::Invalid => return None,
            };
            Some((e.id, ctx))
        })
    }

    // ===========================================================================================
    // Recovery
    // ===========================================================================================

    /// Resets `engines` and tears down whatever was running on them.
    /// `ctx` names the context when the engine status no longer does.
    pub fn recover(&self, engines: u32, ctx: Option<CtxId>) {
        let _recover = self.recover_lock.lock();
        log::error!("recovering engines 0x{engines:x} (ctx {ctx:?})");
        let faults = self
            .shared
            .hw
            .engines()
            .iter()
            .filter(|e| engines & (1 << e.id) != 0)
            .map(|e| FaultRecord {
                engine_id: e.id,
                client: FaultClient::Hub,
                fault_va: 0,
                chid: None,
                hint: ctx,
                fake: true,
            })
            .collect::<Vec<_>>();
        self.handle_faults(&faults);
    }

    pub fn recover_ch(&self, chid: u32) {
        let engines = self.engines_on_id((chid, false));
        if engines != 0 {
            self.recover(engines, Some((chid, false)));
        } else if let Some(r) = self.channel(chid).and_then(|c| c.get()) {
            self.abort_channel(&r, false);
        }
    }

    pub fn recover_tsg(&self, tsgid: u32) {
        let engines = self.engines_on_id((tsgid, true));
        if engines != 0 {
            self.recover(engines, Some((tsgid, true)));
        } else {
            self.abort_tsg(tsgid, false);
        }
    }

    /// Services latched MMU faults.
    pub fn handle_mmu_faults(&self) {
        let faults = self
            .shared
            .hw
            .take_mmu_faults()
            .into_iter()
            .map(|f: MmuFault| FaultRecord {
                engine_id: f.engine_id,
                client: f.client,
                fault_va: f.fault_va,
                chid: f.chid,
                hint: None,
                fake: false,
            })
            .collect::<Vec<_>>();
        if !faults.is_empty() {
            let _recover = self.recover_lock.lock();
            self.handle_faults(&faults);
        }
    }

    fn handle_faults(&self, faults: &[FaultRecord]) {
        let hw = &self.shared.hw;
        for f in faults {
            if !f.fake {
                log::error!(
                    "mmu fault on engine {}, client {:?}, va 0x{:x}",
                    f.engine_id,
                    f.client,
                    f.fault_va
                );
            }
            let status = hw.engine_status(f.engine_id);
            let ctx = status.resident().or(f.hint).or_else(|| {
                f.chid
                    .and_then(|c| self.channel(c))
                    .map(|c| self.ctx_of(c))
            });

            let is_gr = hw.engine(f.engine_id).is_some_and(|e| e.kind == EngineKind::Gr);
            let defer = !f.fake
                && self.debugger_attached()
                && hw.mmu_debug_mode()
                && is_gr
                && f.client == FaultClient::Gpc;
            if defer {
                let mut d = self.deferred.lock();
                let engines = d.map_or(0, |d| d.engines) | (1 << f.engine_id);
                *d = Some(DeferredReset { engines, ctx });
                log::info!("deferring engine {} reset for debugger", f.engine_id);
            } else if let Some(_reset) = self.gr_reset_lock.try_lock() {
                hw.reset_engine(f.engine_id);
            } else {
                log::warn!("engine {} reset already in progress", f.engine_id);
            }

            let reset_pending = self.deferred.lock().is_some();
            match ctx {
                Some((tsgid, true)) => {
                    if !reset_pending {
                        self.set_mmu_error_members(tsgid);
                    }
                    self.abort_tsg(tsgid, false);
                }
                Some((chid, false)) => {
                    if let Some(r) = self.channel(chid).and_then(|c| c.get()) {
                        if !reset_pending {
                            self.set_mmu_error(&r);
                        }
                        self.abort_channel(&r, false);
                    }
                }
                None => log::error!("couldn't locate channel for mmu fault"),
            }
        }
    }

    fn set_mmu_error(&self, ch: &Channel) {
        if !ch.set_error_notifier_if_empty(MMU_ERR_FLT) {
            log::debug!("channel {}: error notifier already set", ch.chid());
        }
        ch.semaphore_wq().wake_all();
    }

    fn set_mmu_error_members(&self, tsgid: u32) {
        for chid in self.tsg_channels(tsgid) {
            if let Some(r) = self.channels[chid as usize].get() {
                self.set_mmu_error(&r);
            }
        }
    }

    /// Pending deferred GR reset, if any.
    #[must_use]
    pub fn deferred_reset(&self) -> Option<DeferredReset> {
        *self.deferred.lock()
    }

    /// Performs a deferred reset when the context it was deferred for goes
    /// away.
    /// `tsgid` is the group the channel belonged to before it was unbound.
    pub(crate) fn deferred_reset_on_free(&self, ch: &Channel, tsgid: Option<u32>) {
        let mut d = self.deferred.lock();
        let Some(pending) = *d else { return };
        let matches = match pending.ctx {
            Some((id, true)) => tsgid == Some(id),
            Some((id, false)) => ch.chid() == id,
            None => true,
        };
        if !matches {
            return;
        }
        let Some(_reset) = self.gr_reset_lock.try_lock() else {
            return;
        };
        for e in self.shared.hw.engines() {
            if pending.engines & (1 << e.id) != 0 {
                log::info!("performing deferred reset of engine {}", e.id);
                self.shared.hw.reset_engine(e.id);
            }
        }
        *d = None;
    }

    // ===========================================================================================
    // Abort
    // ===========================================================================================

    /// Disables the channel (or its whole TSG), optionally preempts it, and
    /// force-completes its jobs.
    pub fn abort_channel(&self, ch: &Channel, preempt: bool) {
        if let Some(tsgid) = ch.tsgid() {
            self.abort_tsg(tsgid, preempt);
            return;
        }
        log::debug!("aborting channel {}", ch.chid());
        ch.set_timedout();
        self.disable_channel(ch);
        if preempt && let Err(e) = self.preempt_ctx((ch.chid(), false)) {
            log::warn!("channel {}: preempt during abort failed: {e}", ch.chid());
        }
        ch.abort_clean_up();
    }

    pub fn abort_tsg(&self, tsgid: u32, preempt: bool) {
        log::debug!("aborting tsg {tsgid}");
        let members = self.tsg_channels(tsgid);
        for &chid in &members {
            self.disable_channel(&self.channels[chid as usize]);
        }
        if preempt && let Err(e) = self.preempt_ctx((tsgid, true)) {
            log::warn!("tsg {tsgid}: preempt during abort failed: {e}");
        }
        for chid in members {
            if let Some(r) = self.channels[chid as usize].get() {
                r.set_timedout();
                r.abort_clean_up();
            }
        }
    }

    fn disable_channel(&self, ch: &Channel) {
        self.shared.hw.channel_set_enabled(ch.chid(), false);
        if let Err(e) = self.update_runlist(ch.runlist_id(), Some(ch.chid()), false, true) {
            log::warn!("channel {}: runlist remove failed: {e}", ch.chid());
        }
    }

    // ===========================================================================================
    // Interrupt sources
    // ===========================================================================================

    /// Stalling interrupt service.
    pub fn isr(&self) {
        self.handle_mmu_faults();
        self.handle_sched_error();
    }

    pub fn handle_sched_error(&self) {
        let Some(code) = self.shared.hw.take_sched_error() else {
            return;
        };
        let Some((engine, ctx)) = self.failing_engine() else {
            log::error!("sched error {code:?} with no failing engine");
            return;
        };
        if code != SchedErrorCode::CtxswTimeout {
            log::error!("sched error {code:?} on engine {engine}, ctx {ctx:?}");
            return;
        }

        let period = u64::from(self.shared.cfg.ctxsw_timeout_period_ms);
        let recover = if ctx.1 {
            let members: Vec<_> = self
                .tsg_channels(ctx.0)
                .into_iter()
                .filter_map(|c| self.channels[c as usize].get())
                .collect();
            let mut recover = false;
            let mut progress = false;
            for m in &members {
                (recover, progress) = m.ctxsw_update_and_check(period);
                if recover || progress {
                    break;
                }
            }
            if progress {
                for m in &members {
                    m.ctxsw_reset(period);
                }
            }
            if recover {
                for m in &members {
                    m.set_error_notifier(IDLE_TIMEOUT);
                }
            }
            recover
        } else {
            match self.channels.get(ctx.0 as usize).and_then(|c| c.get()) {
                Some(r) => {
                    let (recover, _) = r.ctxsw_update_and_check(period);
                    if recover {
                        r.set_error_notifier(IDLE_TIMEOUT);
                    }
                    recover
                }
                None => false,
            }
        };

        if recover {
            log::error!("ctxsw timeout on engine {engine}, ctx {ctx:?}: recovering");
            self.restart_all_watchdogs();
            self.recover(1 << engine, Some(ctx));
        } else {
            log::debug!("engine {engine}: ctx {ctx:?} still switching, waiting");
        }
    }

    /// A channel's push buffer was malformed.
    pub(crate) fn handle_pbdma_error(&self, ch: &Channel) {
        let ctx = self.ctx_of(ch);
        self.notify_ctx(ctx, PBDMA_ERROR);
        if ctx.1 {
            self.recover_tsg(ctx.0);
        } else {
            self.recover_ch(ctx.0);
        }
    }

    // ===========================================================================================
    // Watchdog
    // ===========================================================================================

    fn restart_all_watchdogs(&self) {
        for ch in &self.channels {
            if let Some(r) = ch.get() {
                r.watchdog_restart();
            }
        }
    }

    /// Advances every running watchdog and handles the ones that expire.
    pub fn watchdog_tick(&self, elapsed_ms: u64) {
        for ch in &self.channels {
            let Some(r) = ch.get() else { continue };
            if r.watchdog_check(elapsed_ms) {
                self.handle_channel_timeout(&r);
            }
        }
    }

    fn handle_channel_timeout(&self, ch: &Channel) {
        let own = self.ctx_of(ch);
        log::error!("job on channel {} timed out", ch.chid());
        self.notify_ctx(own, IDLE_TIMEOUT);

        if let Some((engine, failing)) = self.failing_engine() {
            if failing != own {
                ch.watchdog_start();
            }
            self.recover(1 << engine, Some(failing));
            return;
        }
        if own.1 {
            self.set_mmu_error_members(own.0);
            self.abort_tsg(own.0, false);
        } else {
            self.set_mmu_error(ch);
            self.abort_channel(ch, false);
        }
    }
}
