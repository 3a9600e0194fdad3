//! Timeslice groups: channels scheduled together as one runlist entry.

use super::Fifo;
use super::runlist::{InterleaveLevel, timeslice_to_hw};
use crate::channel::Channel;
use crate::error::{GpuError, GpuResult};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub(crate) struct TsgState {
    pub(crate) in_use: bool,
    /// Member channels in bind order.
    pub(crate) channels: Vec<u32>,
    pub(crate) runlist_id: Option<u32>,
    pub(crate) interleave: InterleaveLevel,
    /// `(timeout, scale)` once a timeslice has been set.
    pub(crate) timeslice: Option<(u32, u32)>,
}

#[derive(Debug)]
pub struct Tsg {
    id: u32,
    pub(crate) state: Mutex<TsgState>,
}

impl Tsg {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new(TsgState::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn channels(&self) -> Vec<u32> {
        self.state.lock().channels.clone()
    }

    #[must_use]
    pub fn interleave(&self) -> InterleaveLevel {
        self.state.lock().interleave
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        self.state.lock().in_use
    }
}

impl Fifo {
    fn tsg(&self, tsgid: u32) -> GpuResult<&Tsg> {
        self.tsgs
            .get(tsgid as usize)
            .filter(|t| t.in_use())
            .ok_or_else(|| GpuError::invalid(format!("tsg {tsgid} is not open")))
    }

    /// Opens a free TSG.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when every TSG is in use.
    pub fn open_tsg(&self) -> GpuResult<u32> {
        for tsg in &self.tsgs {
            let mut st = tsg.state.lock();
            if !st.in_use {
                *st = TsgState {
                    in_use: true,
                    ..TsgState::default()
                };
                log::debug!("tsg {} opened", tsg.id);
                return Ok(tsg.id);
            }
        }
        log::error!("out of TSGs");
        Err(GpuError::OutOfMemory)
    }

    /// Releases an empty TSG.
    ///
    /// # Errors
    /// Returns `Busy` while channels are still bound.
    pub fn release_tsg(&self, tsgid: u32) -> GpuResult<()> {
        let tsg = self.tsg(tsgid)?;
        let mut st = tsg.state.lock();
        if !st.channels.is_empty() {
            return Err(GpuError::Busy);
        }
        *st = TsgState::default();
        log::debug!("tsg {tsgid} released");
        Ok(())
    }

    /// Adds `ch` to a TSG. The channel must not be in a TSG already and must
    /// not have a gpfifo yet.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if either condition fails, the TSG is not
    /// open, or the TSG's members run on a different runlist.
    pub fn bind_channel(&self, tsgid: u32, ch: &Channel) -> GpuResult<()> {
        if ch.tsgid().is_some() {
            return Err(GpuError::invalid(format!("channel {} already in a tsg", ch.chid())));
        }
        if ch.is_runnable() {
            return Err(GpuError::invalid(format!(
                "channel {} is already active",
                ch.chid()
            )));
        }
        let tsg = self.tsg(tsgid)?;
        let mut st = tsg.state.lock();
        match st.runlist_id {
            Some(rl) if rl != ch.runlist_id() => {
                return Err(GpuError::invalid(format!(
                    "tsg {tsgid} runs on runlist {rl}, channel {} on {}",
                    ch.chid(),
                    ch.runlist_id()
                )));
            }
            _ => st.runlist_id = Some(ch.runlist_id()),
        }
        st.channels.push(ch.chid());
        ch.set_tsgid(Some(tsgid));
        log::debug!("tsg {tsgid}: bound channel {}", ch.chid());
        Ok(())
    }

    /// Removes `ch` from its TSG, taking it off the runlist first.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the channel is not in a TSG.
    pub fn unbind_channel(&self, ch: &Channel) -> GpuResult<()> {
        let tsgid = ch
            .tsgid()
            .ok_or_else(|| GpuError::invalid(format!("channel {} not in a tsg", ch.chid())))?;
        if let Err(e) = self.update_runlist(ch.runlist_id(), Some(ch.chid()), false, true) {
            log::warn!("tsg {tsgid}: runlist update on unbind failed: {e}");
        }
        let tsg = &self.tsgs[tsgid as usize];
        let mut st = tsg.state.lock();
        st.channels.retain(|&c| c != ch.chid());
        if st.channels.is_empty() {
            st.runlist_id = None;
        }
        drop(st);
        ch.set_tsgid(None);
        log::debug!("tsg {tsgid}: unbound channel {}", ch.chid());
        Ok(())
    }

    /// # Errors
    /// Returns `InvalidArgument` if the TSG is not open, or a runlist error.
    pub fn set_tsg_interleave(&self, tsgid: u32, level: InterleaveLevel) -> GpuResult<()> {
        let tsg = self.tsg(tsgid)?;
        let runlist = {
            let mut st = tsg.state.lock();
            st.interleave = level;
            st.runlist_id
        };
        log::debug!("tsg {tsgid}: interleave {level:?}");
        match runlist {
            Some(rl) => self.update_runlist(rl, None, true, true),
            None => Ok(()),
        }
    }

    /// # Errors
    /// Returns `InvalidArgument` for an out-of-range timeslice or a closed
    /// TSG, or a runlist error.
    pub fn set_tsg_timeslice(&self, tsgid: u32, us: u32) -> GpuResult<()> {
        let hw = timeslice_to_hw(us)?;
        let tsg = self.tsg(tsgid)?;
        let runlist = {
            let mut st = tsg.state.lock();
            st.timeslice = Some(hw);
            st.runlist_id
        };
        log::debug!("tsg {tsgid}: timeslice {us}us -> timeout {} scale {}", hw.0, hw.1);
        match runlist {
            Some(rl) => self.update_runlist(rl, None, true, true),
            None => Ok(()),
        }
    }

    /// Members currently marked active on the TSG's runlist.
    #[must_use]
    pub fn tsg_num_active_channels(&self, tsgid: u32) -> u32 {
        let Some(rl) = self
            .tsgs
            .get(tsgid as usize)
            .and_then(|t| t.state.lock().runlist_id)
        else {
            return 0;
        };
        self.runlists
            .get(rl as usize)
            .map_or(0, |r| r.lock().tsg_active[tsgid as usize])
    }

    #[must_use]
    pub fn tsg_channels(&self, tsgid: u32) -> Vec<u32> {
        self.tsgs.get(tsgid as usize).map(Tsg::channels).unwrap_or_default()
    }
}
