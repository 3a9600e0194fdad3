//! Completion signalling: hardware semaphores, fences and the sync-framework
//! timeline bridge.

pub mod fence;
pub mod semaphore;
pub mod timeline;

pub use fence::{Fence, FencePool};
pub use semaphore::{HwSemaphore, Semaphore, SemaphorePool, SemaphoreSea};
pub use timeline::{SyncFence, SyncPt, SyncTimeline};

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A condition-variable wait queue in the style of `wait_event_timeout`.
#[derive(Debug, Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cv: Condvar,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    /// Sleeps until `cond` holds or `timeout` elapses. Returns the final value
    /// of `cond`. Wakers must call [`WaitQueue::wake_all`] after changing
    /// anything `cond` reads.
    pub fn wait_event_timeout(&self, mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock.lock();
        loop {
            if cond() {
                return true;
            }
            match deadline {
                Some(d) => {
                    if self.cv.wait_until(&mut guard, d).timed_out() {
                        return cond();
                    }
                }
                None => self.cv.wait(&mut guard),
            }
        }
    }
}
