//! Host1x-style syncpoints.
//!
//! Each syncpoint is a 32-bit counter incremented by the GPU. Software keeps a
//! cached `min` (last value read back) and a reserved `max` (the value that
//! will be reached once every queued increment has executed).

use crate::error::{GpuError, GpuResult};
use crate::utils::{Bitmap, counter_reached};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Syncpoint {
    value: AtomicU32,
    min: AtomicU32,
    max: AtomicU32,
}

#[derive(Debug)]
pub struct SyncpointManager {
    points: Vec<Syncpoint>,
    allocated: Mutex<Bitmap>,
    names: Mutex<Vec<String>>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl SyncpointManager {
    /// Creates `count` syncpoints. Id 0 is reserved as the invalid id.
    #[must_use]
    pub fn new(count: u32) -> Self {
        let count = count.max(1) as usize;
        let mut allocated = Bitmap::new(count);
        allocated.set(0);
        Self {
            points: (0..count).map(|_| Syncpoint::default()).collect(),
            allocated: Mutex::new(allocated),
            names: Mutex::new(vec![String::new(); count]),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    fn point(&self, id: u32) -> Option<&Syncpoint> {
        self.points.get(id as usize)
    }

    /// # Errors
    /// Returns `OutOfMemory` when every syncpoint is taken.
    pub fn alloc(&self, name: &str) -> GpuResult<u32> {
        let mut allocated = self.allocated.lock();
        let id = allocated.find_first_zero().ok_or(GpuError::OutOfMemory)?;
        allocated.set(id);
        drop(allocated);

        let sp = &self.points[id];
        let v = sp.value.load(Ordering::Acquire);
        sp.min.store(v, Ordering::Relaxed);
        sp.max.store(v, Ordering::Relaxed);
        self.names.lock()[id] = name.to_string();
        log::debug!("syncpt {id} allocated for {name}");
        Ok(id as u32)
    }

    pub fn free(&self, id: u32) {
        if id == 0 || !self.allocated.lock().test_and_clear(id as usize) {
            log::warn!("syncpt {id}: extra free");
            return;
        }
        self.names.lock()[id as usize].clear();
    }

    #[must_use]
    pub fn is_allocated(&self, id: u32) -> bool {
        id != 0 && self.allocated.lock().test(id as usize)
    }

    /// Raw hardware value.
    #[must_use]
    pub fn read(&self, id: u32) -> u32 {
        self.point(id).map_or(0, |sp| sp.value.load(Ordering::Acquire))
    }

    /// Refreshes the cached minimum from hardware and returns it.
    pub fn update_min(&self, id: u32) -> u32 {
        let Some(sp) = self.point(id) else { return 0 };
        let v = sp.value.load(Ordering::Acquire);
        sp.min.store(v, Ordering::Release);
        v
    }

    #[must_use]
    pub fn read_min(&self, id: u32) -> u32 {
        self.point(id).map_or(0, |sp| sp.min.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn read_max(&self, id: u32) -> u32 {
        self.point(id).map_or(0, |sp| sp.max.load(Ordering::Acquire))
    }

    /// Reserves `incrs` future increments and returns the resulting threshold.
    pub fn incr_max(&self, id: u32, incrs: u32) -> u32 {
        self.point(id).map_or(0, |sp| {
            sp.max.fetch_add(incrs, Ordering::AcqRel).wrapping_add(incrs)
        })
    }

    /// Checks the cached minimum first and only reads hardware before
    /// answering "not expired".
    #[must_use]
    pub fn is_expired(&self, id: u32, thresh: u32) -> bool {
        if counter_reached(self.read_min(id), thresh) {
            return true;
        }
        counter_reached(self.update_min(id), thresh)
    }

    /// Forces the hardware value up to the reserved maximum. Used when a
    /// channel is aborted and its queued increments will never execute.
    pub fn set_min_eq_max(&self, id: u32) {
        let Some(sp) = self.point(id) else { return };
        let max = sp.max.load(Ordering::Acquire);
        sp.value.store(max, Ordering::Release);
        sp.min.store(max, Ordering::Release);
        self.notify();
    }

    /// One GPU-side increment.
    pub fn hw_incr(&self, id: u32) -> u32 {
        let Some(sp) = self.point(id) else {
            log::warn!("syncpt: increment of bad id {id}");
            return 0;
        };
        let v = sp.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        log::trace!("syncpt {id} -> {v}");
        self.notify();
        v
    }

    fn notify(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }

    /// # Errors
    /// Returns `TimedOut` if `thresh` is not reached within `timeout`.
    pub fn wait_timeout(&self, id: u32, thresh: u32, timeout: Duration) -> GpuResult<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.wait_lock.lock();
        loop {
            if self.is_expired(id, thresh) {
                return Ok(());
            }
            if self.wait_cv.wait_until(&mut guard, deadline).timed_out() {
                return if self.is_expired(id, thresh) {
                    Ok(())
                } else {
                    Err(GpuError::TimedOut)
                };
            }
        }
    }

    #[must_use]
    pub fn name(&self, id: u32) -> String {
        self.names.lock().get(id as usize).cloned().unwrap_or_default()
    }
}
