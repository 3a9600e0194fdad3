//! No-progress detection on the gpfifo GET pointer.
//!
//! Both the per-channel watchdog and the scheduler's context-switch timeout
//! use per-period accounting: while GET stays put each check adds one period,
//! and any movement restarts the count at one period.

use super::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Watchdog {
    enabled: bool,
    running: bool,
    gp_get: u32,
    accumulated_ms: u64,
    limit_ms: u64,
}

impl Watchdog {
    pub(crate) const fn new(enabled: bool, limit_ms: u32) -> Self {
        Self {
            enabled,
            running: false,
            gp_get: 0,
            accumulated_ms: 0,
            limit_ms: limit_ms as u64,
        }
    }

    pub(crate) const fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) const fn running(&self) -> bool {
        self.running
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.running = false;
        }
    }

    pub(crate) fn set_limit(&mut self, limit_ms: u32) {
        self.limit_ms = u64::from(limit_ms);
    }

    /// Arms the watchdog unless it is already counting.
    pub(crate) fn start(&mut self, gp_get: u32) {
        if !self.enabled || self.running {
            return;
        }
        self.running = true;
        self.gp_get = gp_get;
        self.accumulated_ms = 0;
    }

    pub(crate) fn restart(&mut self, gp_get: u32) {
        if self.running {
            self.gp_get = gp_get;
            self.accumulated_ms = 0;
        }
    }

    /// Returns whether it was running.
    pub(crate) fn stop(&mut self) -> bool {
        std::mem::replace(&mut self.running, false)
    }

    /// One period has elapsed. Returns true once the channel has gone longer
    /// than the limit without GET moving.
    pub(crate) fn check(&mut self, gp_get: u32, period_ms: u64) -> bool {
        if !self.running {
            return false;
        }
        if gp_get == self.gp_get {
            self.accumulated_ms += period_ms;
        } else {
            self.gp_get = gp_get;
            self.accumulated_ms = period_ms;
        }
        self.accumulated_ms > self.limit_ms
    }

    pub(crate) const fn accumulated_ms(&self) -> u64 {
        self.accumulated_ms
    }
}

/// Context-switch timeout accounting for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CtxswTimeout {
    gp_get: u32,
    pub(crate) accumulated_ms: u64,
}

impl CtxswTimeout {
    /// Returns `(recover, progress)`.
    pub(crate) fn update_and_check(
        &mut self,
        gp_get: u32,
        period_ms: u64,
        limit_ms: u64,
        timeouts_enabled: bool,
    ) -> (bool, bool) {
        let progress = gp_get != self.gp_get;
        if progress {
            self.accumulated_ms = period_ms;
        } else {
            self.accumulated_ms += period_ms;
        }
        self.gp_get = gp_get;
        (timeouts_enabled && self.accumulated_ms > limit_ms, progress)
    }
}

impl Channel {
    /// Enables or disables the channel watchdog.
    pub fn set_watchdog(&self, enabled: bool) {
        self.watchdog.lock().set_enabled(enabled);
    }

    /// Overrides the watchdog limit for this channel.
    pub fn set_watchdog_timeout(&self, limit_ms: u32) {
        self.watchdog.lock().set_limit(limit_ms);
    }

    #[must_use]
    pub fn watchdog_running(&self) -> bool {
        self.watchdog.lock().running()
    }

    pub(crate) fn watchdog_start(&self) {
        let gp_get = self.gp_get();
        self.watchdog.lock().start(gp_get);
    }

    pub(crate) fn watchdog_stop(&self) -> bool {
        self.watchdog.lock().stop()
    }

    pub(crate) fn watchdog_restart(&self) {
        let gp_get = self.gp_get();
        self.watchdog.lock().restart(gp_get);
    }

    /// Returns true if the channel has timed out during this period.
    pub(crate) fn watchdog_check(&self, period_ms: u64) -> bool {
        let gp_get = self.gp_get();
        let mut wd = self.watchdog.lock();
        let timed_out = wd.check(gp_get, period_ms);
        if timed_out {
            log::error!(
                "channel {}: no progress for {} ms (GET {gp_get})",
                self.chid,
                wd.accumulated_ms()
            );
            wd.stop();
        }
        timed_out
    }

    pub(crate) fn ctxsw_update_and_check(&self, period_ms: u64) -> (bool, bool) {
        let cfg = &self.shared.cfg;
        self.ctxsw.lock().update_and_check(
            self.gp_get(),
            period_ms,
            u64::from(cfg.gr_idle_timeout_ms),
            cfg.timeouts_enabled,
        )
    }

    pub(crate) fn ctxsw_reset(&self, period_ms: u64) {
        self.ctxsw.lock().accumulated_ms = period_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_resets_to_one_period() {
        let mut wd = Watchdog::new(true, 250);
        wd.start(0);
        assert!(!wd.check(0, 100));
        assert!(!wd.check(0, 100));
        assert!(!wd.check(3, 100));
        assert_eq!(wd.accumulated_ms(), 100);
        assert!(!wd.check(3, 100));
        assert!(wd.check(3, 100));
    }

    #[test]
    fn disabled_watchdog_never_fires() {
        let mut wd = Watchdog::new(false, 0);
        wd.start(0);
        assert!(!wd.running());
        assert!(!wd.check(0, 1000));
    }

    #[test]
    fn ctxsw_reports_progress() {
        let mut t = CtxswTimeout::default();
        assert_eq!(t.update_and_check(1, 100, 150, true), (false, true));
        assert_eq!(t.update_and_check(1, 100, 150, true), (true, false));
        assert_eq!(t.update_and_check(1, 100, 150, false), (false, false));
    }
}
