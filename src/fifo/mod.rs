//! The FIFO: channel table, runlists, TSGs and recovery.

#![allow(clippy::cast_possible_truncation)]

pub mod recovery;
pub mod runlist;
pub mod tsg;

pub use runlist::{InterleaveLevel, RunlistEntry};
pub use tsg::Tsg;

use crate::channel::{Channel, ChannelFreeList, ChannelRef, CompletionCallback, GpfifoArgs};
use crate::context::DeviceShared;
use crate::error::{GpuError, GpuResult};
use parking_lot::Mutex;
use recovery::DeferredReset;
use runlist::{ActiveTsg, BareChannel, Runlist, SchedView};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const REF_DRAIN_WARN_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Fifo {
    shared: Arc<DeviceShared>,
    channels: Vec<Arc<Channel>>,
    free_list: Arc<ChannelFreeList>,
    tsgs: Vec<Tsg>,
    runlists: Vec<Mutex<Runlist>>,
    deferred: Mutex<Option<DeferredReset>>,
    gr_reset_lock: Mutex<()>,
    recover_lock: Mutex<()>,
    debugger_attached: AtomicBool,
}

impl Fifo {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> GpuResult<Self> {
        let cfg = &shared.cfg;
        let free_list = Arc::new(ChannelFreeList::new(cfg.num_channels));
        let channels = (0..cfg.num_channels)
            .map(|chid| {
                Channel::new(chid, Arc::clone(&shared), Arc::clone(&free_list)).map(Arc::new)
            })
            .collect::<GpuResult<Vec<_>>>()?;
        let tsgs = (0..cfg.num_tsgs).map(Tsg::new).collect();
        let runlists = (0..cfg.num_runlists)
            .map(|id| {
                Runlist::new(id, cfg.num_channels, cfg.num_tsgs, cfg.num_runlist_entries)
                    .map(Mutex::new)
            })
            .collect::<GpuResult<Vec<_>>>()?;
        Ok(Self {
            shared,
            channels,
            free_list,
            tsgs,
            runlists,
            deferred: Mutex::new(None),
            gr_reset_lock: Mutex::new(()),
            recover_lock: Mutex::new(()),
            debugger_attached: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn channel(&self, chid: u32) -> Option<&Arc<Channel>> {
        self.channels.get(chid as usize)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.iter()
    }

    /// Channels currently handed out.
    #[must_use]
    pub fn used_channels(&self) -> u32 {
        self.free_list.used()
    }

    /// Most channels ever in use at once.
    #[must_use]
    pub fn used_channels_high_water(&self) -> u32 {
        self.free_list.high_water()
    }

    pub fn set_debugger_attached(&self, attached: bool) {
        self.debugger_attached.store(attached, Ordering::Release);
    }

    #[must_use]
    pub fn debugger_attached(&self) -> bool {
        self.debugger_attached.load(Ordering::Acquire)
    }

    // ===========================================================================================
    // Channel lifecycle
    // ===========================================================================================

    /// Takes a channel from the free pool and returns its first reference.
    ///
    /// # Errors
    /// * `InvalidArgument` for an unknown runlist.
    /// * `OutOfMemory` when no hardware channel id is free.
    pub fn open_channel(
        &self,
        runlist_id: u32,
        privileged: bool,
        callback: Option<CompletionCallback>,
    ) -> GpuResult<ChannelRef> {
        if runlist_id >= self.shared.cfg.num_runlists {
            return Err(GpuError::invalid(format!("no runlist {runlist_id}")));
        }
        let chid = self.free_list.pop().ok_or_else(|| {
            log::error!("out of hw chids");
            GpuError::OutOfMemory
        })?;
        let ch = &self.channels[chid as usize];
        ch.reset_for_open(runlist_id, privileged, callback);
        match ch.revive() {
            Ok(r) => {
                log::debug!("channel {chid} opened on runlist {runlist_id}");
                Ok(r)
            }
            Err(e) => {
                log::error!("channel {chid} from the free list is still referenced");
                self.shared.hw.channel_unbind(chid);
                Err(e)
            }
        }
    }

    /// Allocates the channel's gpfifo, enables it and adds it to its runlist.
    ///
    /// # Errors
    /// See [`Channel::setup_gpfifo`](crate::channel::Channel); also runlist
    /// errors, in which case the channel stays disabled.
    pub fn alloc_gpfifo(&self, ch: &Channel, args: GpfifoArgs) -> GpuResult<()> {
        ch.setup_gpfifo(args)?;
        self.shared.hw.channel_set_enabled(ch.chid(), true);
        if let Err(e) = self.update_runlist(ch.runlist_id(), Some(ch.chid()), true, true) {
            log::error!("channel {}: runlist add failed: {e}", ch.chid());
            self.shared.hw.channel_set_enabled(ch.chid(), false);
            return Err(e);
        }
        Ok(())
    }

    /// Closes a channel: aborts its work, waits for other references to
    /// drain and frees its resources. The channel id returns to the pool when
    /// the last reference goes.
    pub fn close_channel(&self, ch: ChannelRef) {
        self.free_channel(ch, false);
    }

    /// Like [`Self::close_channel`] without waiting for other references.
    pub fn kill_channel(&self, ch: ChannelRef) {
        self.free_channel(ch, true);
    }

    fn free_channel(&self, ch: ChannelRef, force: bool) {
        let chid = ch.chid();
        if !ch.begin_teardown() {
            log::warn!("channel {chid} freed twice");
            return;
        }
        log::debug!("channel {chid}: freeing (force {force})");

        // Jobs hold references, so abort before draining.
        let tsgid = ch.tsgid();
        if tsgid.is_some() {
            self.leave_tsg(&ch);
        } else {
            self.abort_channel(&ch, true);
        }
        if ch.quiesce_submits() {
            log::warn!("channel {chid}: job committed during close, aborting again");
            ch.abort_clean_up();
        }
        if !force {
            ch.wait_refs(1, REF_DRAIN_WARN_INTERVAL);
        }

        self.deferred_reset_on_free(&ch, tsgid);
        ch.teardown();
        drop(ch);
    }

    /// Takes one member out of a TSG at close: the group is disabled and
    /// preempted around the removal, and the survivors keep running.
    fn leave_tsg(&self, ch: &Channel) {
        let Some(tsgid) = ch.tsgid() else { return };
        let members = self.tsg_channels(tsgid);
        let hw = &self.shared.hw;
        for &m in &members {
            hw.channel_set_enabled(m, false);
        }
        if let Err(e) = self.preempt_tsg(tsgid) {
            log::warn!("tsg {tsgid}: preempt on channel {} close failed: {e}", ch.chid());
        }
        ch.set_timedout();
        ch.abort_clean_up();
        if let Err(e) = self.unbind_channel(ch) {
            log::warn!("channel {}: {e}", ch.chid());
        }
        for m in members.into_iter().filter(|&m| m != ch.chid()) {
            if self.channels[m as usize].is_runnable() {
                hw.channel_set_enabled(m, true);
            }
        }
    }

    // ===========================================================================================
    // Scheduling parameters
    // ===========================================================================================

    /// # Errors
    /// Returns `InvalidArgument` for a channel in a TSG, or a runlist error.
    pub fn set_interleave(&self, ch: &Channel, level: InterleaveLevel) -> GpuResult<()> {
        if ch.tsgid().is_some() {
            return Err(GpuError::invalid("set interleave on the TSG instead"));
        }
        ch.set_interleave_level(level);
        log::debug!("channel {}: interleave {level:?}", ch.chid());
        self.update_runlist(ch.runlist_id(), None, true, true)
    }

    /// # Errors
    /// Returns `InvalidArgument` for a channel in a TSG or an out-of-range
    /// timeslice.
    pub fn set_timeslice(&self, ch: &Channel, us: u32) -> GpuResult<()> {
        if ch.tsgid().is_some() {
            return Err(GpuError::invalid("set timeslice on the TSG instead"));
        }
        runlist::timeslice_to_hw(us)?;
        ch.set_timeslice_us(us);
        log::debug!("channel {}: timeslice {us}us", ch.chid());
        Ok(())
    }

    // ===========================================================================================
    // Runlists
    // ===========================================================================================

    /// Adds (`add`) or removes `chid` on a runlist and resubmits it.
    ///
    /// With `chid` of `None`, `add` rebuilds the runlist from the active set
    /// and `!add` submits an empty runlist, leaving the active set as is.
    /// A change that does not alter the active set is a no-op. If the result
    /// does not fit, the change is reverted.
    ///
    /// # Errors
    /// * `InvalidArgument` for an unknown runlist.
    /// * `TooBig` if the entries exceed the runlist size.
    /// * `TimedOut` if `wait` is set and the hardware does not pick it up.
    pub fn update_runlist(
        &self,
        runlist_id: u32,
        chid: Option<u32>,
        add: bool,
        wait: bool,
    ) -> GpuResult<()> {
        let rl_lock = self
            .runlists
            .get(runlist_id as usize)
            .ok_or_else(|| GpuError::invalid(format!("no runlist {runlist_id}")))?;
        let mut rl = rl_lock.lock();

        let changed = match chid {
            Some(chid) => {
                let tsgid = self
                    .channel(chid)
                    .ok_or(GpuError::InvalidChannelId(chid))?
                    .tsgid();
                if !rl.set_active(chid, tsgid, add) {
                    return Ok(());
                }
                Some((chid, tsgid))
            }
            None => None,
        };

        let entries = if chid.is_some() || add {
            let view = self.sched_view(&rl);
            match runlist::construct(&view, self.shared.cfg.runlist_interleave, rl.max_entries()) {
                Ok(e) => e,
                Err(e) => {
                    if let Some((chid, tsgid)) = changed {
                        rl.set_active(chid, tsgid, !add);
                    }
                    log::error!("runlist {runlist_id}: {e}");
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        rl.submit(&self.shared.hw, &entries);
        drop(rl);
        if wait {
            self.wait_runlist(runlist_id)?;
        }
        Ok(())
    }

    /// Applies [`Self::update_runlist`] to every runlist in `mask`,
    /// returning the last error.
    ///
    /// # Errors
    /// See [`Self::update_runlist`].
    pub fn update_runlist_ids(
        &self,
        mask: u32,
        chid: Option<u32>,
        add: bool,
        wait: bool,
    ) -> GpuResult<()> {
        let mut ret = Ok(());
        for id in (0..self.runlists.len() as u32).filter(|id| mask & (1 << id) != 0) {
            if let Err(e) = self.update_runlist(id, chid, add, wait) {
                ret = Err(e);
            }
        }
        ret
    }

    fn wait_runlist(&self, runlist_id: u32) -> GpuResult<()> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(self.shared.cfg.idle_timeout_ms()));
        while self.shared.hw.runlist_pending(runlist_id) {
            if Instant::now() >= deadline {
                log::error!("runlist {runlist_id} update timed out");
                return Err(GpuError::TimedOut);
            }
            std::thread::sleep(Duration::from_micros(10));
        }
        Ok(())
    }

    fn sched_view(&self, rl: &Runlist) -> SchedView {
        let mut view = SchedView::default();
        for chid in rl.active_channels.iter_ones() {
            let ch = &self.channels[chid];
            if ch.tsgid().is_none() {
                view.channels.push(BareChannel {
                    chid: chid as u32,
                    level: ch.interleave(),
                });
            }
        }
        for tsgid in rl.active_tsgs.iter_ones() {
            let st = self.tsgs[tsgid].state.lock();
            view.tsgs.push(ActiveTsg {
                tsgid: tsgid as u32,
                level: st.interleave,
                timeslice: st.timeslice,
                members: st
                    .channels
                    .iter()
                    .copied()
                    .filter(|&c| rl.active_channels.test(c as usize))
                    .collect(),
            });
        }
        view
    }

    /// The entries the hardware is currently scheduling from.
    #[must_use]
    pub fn runlist_entries(&self, runlist_id: u32) -> Vec<RunlistEntry> {
        let Some(rl) = self.runlists.get(runlist_id as usize) else {
            return Vec::new();
        };
        let count = self.shared.hw.runlist_current(runlist_id).count;
        rl.lock().current_entries(count)
    }

    // ===========================================================================================
    // Suspend / resume
    // ===========================================================================================

    /// Disables and preempts every live channel, empties their runlists and
    /// unbinds them from the hardware.
    ///
    /// # Errors
    /// Returns the last runlist error.
    pub fn suspend(&self) -> GpuResult<()> {
        let hw = &self.shared.hw;
        let mut mask = 0u32;
        let mut in_use = Vec::new();
        for ch in &self.channels {
            let Some(r) = ch.get() else { continue };
            log::debug!("suspend channel {}", r.chid());
            hw.channel_set_enabled(r.chid(), false);
            if let Err(e) = self.preempt_channel(r.chid()) {
                log::warn!("channel {}: preempt on suspend failed: {e}", r.chid());
            }
            r.watchdog_stop();
            mask |= 1 << r.runlist_id();
            in_use.push(r);
        }
        if in_use.is_empty() {
            return Ok(());
        }
        self.update_runlist_ids(mask, None, false, true)?;
        for r in &in_use {
            hw.channel_unbind(r.chid());
        }
        log::info!("suspended {} channels", in_use.len());
        Ok(())
    }

    /// Rebinds every live channel and rebuilds the runlists it was on.
    ///
    /// # Errors
    /// Returns the last runlist error.
    pub fn resume(&self) -> GpuResult<()> {
        let hw = &self.shared.hw;
        let mut mask = 0u32;
        let mut count = 0;
        for ch in &self.channels {
            let Some(r) = ch.get() else { continue };
            hw.channel_bind(r.chid(), r.inst_addr());
            if r.is_runnable() && !r.has_timedout() {
                hw.channel_set_enabled(r.chid(), true);
            }
            mask |= 1 << r.runlist_id();
            count += 1;
        }
        if count == 0 {
            return Ok(());
        }
        self.update_runlist_ids(mask, None, true, true)?;
        log::info!("resumed {count} channels");
        Ok(())
    }
}
