//! Error notifier and the blocking waits that honour `has_timedout`.

use super::Channel;
use crate::error::{GpuError, GpuResult};
use crate::mm::buffer::DmaBuf;
use crate::sync::fence::Fence;
use crate::sync::timeline::PtSource;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const IDLE_TIMEOUT: u32 = 8;
pub const GR_SW_NOTIFY: u32 = 13;
pub const MMU_ERR_FLT: u32 = 31;
pub const PBDMA_ERROR: u32 = 32;
pub const RESETCHANNEL_VERIF_ERROR: u32 = 43;

/// Status written once an error has been recorded.
pub const NOTIFIER_STATUS_ERROR: u16 = 0xffff;

/// Byte offset of the 16-bit status in a notification record.
const NOTIFICATION_STATUS_OFFSET: usize = 12;

/// What the client sees in its error notifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorNotification {
    pub timestamp_ns: u64,
    pub info32: u32,
    pub status: u16,
}

#[derive(Debug, Default)]
pub(crate) struct ErrorNotifier {
    enabled: bool,
    record: ErrorNotification,
}

impl ErrorNotifier {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Channel {
    /// Starts recording errors for the client.
    pub fn enable_error_notifier(&self) {
        let mut n = self.notifier.lock();
        n.enabled = true;
        n.record = ErrorNotification::default();
    }

    pub fn disable_error_notifier(&self) {
        self.notifier.lock().enabled = false;
    }

    /// The recorded error, if the notifier is enabled.
    #[must_use]
    pub fn error_notifier(&self) -> Option<ErrorNotification> {
        let n = self.notifier.lock();
        n.enabled.then_some(n.record)
    }

    /// Records `code` and wakes notifier waiters.
    pub fn set_error_notifier(&self, code: u32) {
        {
            let mut n = self.notifier.lock();
            if n.enabled {
                let timestamp_ns = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_nanos() as u64);
                n.record = ErrorNotification {
                    timestamp_ns,
                    info32: code,
                    status: NOTIFIER_STATUS_ERROR,
                };
                log::error!("channel {}: error notifier set to {code}", self.chid);
            }
        }
        self.notifier_wq.wake_all();
    }

    /// Records `code` unless an error is already recorded. Returns whether
    /// the notifier was written.
    pub fn set_error_notifier_if_empty(&self, code: u32) -> bool {
        let empty = {
            let n = self.notifier.lock();
            n.enabled && n.record.status != NOTIFIER_STATUS_ERROR
        };
        if empty {
            self.set_error_notifier(code);
        }
        empty
    }

    /// Whether the recorded error should be reported verbosely.
    #[must_use]
    pub fn error_notifier_is_set(&self) -> bool {
        self.notifier.lock().record.status == NOTIFIER_STATUS_ERROR
    }

    /// Waits for the GPU to clear the notification status at `offset` in
    /// `notifier`.
    ///
    /// # Errors
    /// Returns `TimedOut` if the channel has timed out or `timeout` elapses,
    /// and `InvalidArgument` for an offset outside the buffer.
    pub fn wait_notifier(
        &self,
        notifier: &Arc<DmaBuf>,
        offset: usize,
        timeout: Duration,
    ) -> GpuResult<()> {
        let word = offset + NOTIFICATION_STATUS_OFFSET;
        if word % 4 != 0 || word + 4 > notifier.size() as usize {
            return Err(GpuError::invalid(format!("notifier offset 0x{offset:x}")));
        }
        if self.has_timedout() {
            return Err(GpuError::TimedOut);
        }
        let done = self.notifier_wq.wait_event_timeout(
            || notifier.memory().read_u32(word) >> 16 == 0 || self.has_timedout(),
            timeout,
        );
        if !done || self.has_timedout() {
            return Err(GpuError::TimedOut);
        }
        Ok(())
    }

    /// Waits for `fence`, giving up as soon as the channel times out.
    ///
    /// # Errors
    /// Returns `TimedOut` if the channel has timed out or `timeout` elapses.
    pub fn wait_fence(&self, fence: &Fence, timeout: Duration) -> GpuResult<()> {
        if self.has_timedout() {
            return Err(GpuError::TimedOut);
        }
        match fence.pt_source() {
            None => Ok(()),
            Some(PtSource::Syncpoint { mgr, id, thresh }) => mgr.wait_timeout(id, thresh, timeout),
            Some(PtSource::Semaphore(sema)) => {
                let done = self
                    .semaphore_wq
                    .wait_event_timeout(|| sema.is_released() || self.has_timedout(), timeout);
                if !done || self.has_timedout() {
                    return Err(GpuError::TimedOut);
                }
                Ok(())
            }
        }
    }
}
