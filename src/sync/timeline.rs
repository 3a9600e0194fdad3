//! Bridge between fences and a sync-framework style timeline.
//!
//! Every fence exported to other subsystems becomes a [`SyncPt`] on its
//! channel's [`SyncTimeline`]. Duplicating a point shares the record; merging
//! fences collects points and keeps the later one per timeline.

use super::semaphore::Semaphore;
use crate::hw::syncpt::SyncpointManager;
use crate::utils::counter_reached;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// The hardware object a point waits on.
#[derive(Debug, Clone)]
pub enum PtSource {
    Semaphore(Semaphore),
    Syncpoint {
        mgr: Arc<SyncpointManager>,
        id: u32,
        thresh: u32,
    },
}

impl PtSource {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self {
            Self::Semaphore(s) => s.is_released(),
            Self::Syncpoint { mgr, id, thresh } => mgr.is_expired(*id, *thresh),
        }
    }
}

#[derive(Debug)]
pub struct SyncTimeline {
    name: String,
    /// Last value handed to a point.
    max: AtomicU32,
    /// Highest value known to have signalled.
    min: AtomicU32,
    lock: Mutex<()>,
    cv: Condvar,
}

impl SyncTimeline {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            max: AtomicU32::new(0),
            min: AtomicU32::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn min(&self) -> u32 {
        self.min.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max(&self) -> u32 {
        self.max.load(Ordering::Acquire)
    }

    /// Creates a new point backed by `source`.
    #[must_use]
    pub fn create_pt(self: &Arc<Self>, source: PtSource) -> SyncPt {
        let value = self.max.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        SyncPt(Arc::new(PtRecord {
            timeline: Arc::clone(self),
            source,
            value,
            signalled: AtomicBool::new(false),
        }))
    }

    fn advance_min(&self, value: u32) {
        let _ = self
            .min
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (!counter_reached(cur, value)).then_some(value)
            });
    }

    /// Called after job completion: wakes anything waiting on this timeline.
    pub fn signal(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }
}

#[derive(Debug)]
struct PtRecord {
    timeline: Arc<SyncTimeline>,
    source: PtSource,
    value: u32,
    signalled: AtomicBool,
}

/// One point on a timeline. `Clone` is the framework's `dup`: both handles
/// share the same record.
#[derive(Debug, Clone)]
pub struct SyncPt(Arc<PtRecord>);

impl SyncPt {
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0.value
    }

    #[must_use]
    pub fn timeline(&self) -> &Arc<SyncTimeline> {
        &self.0.timeline
    }

    #[must_use]
    pub fn source(&self) -> &PtSource {
        &self.0.source
    }

    #[must_use]
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Handles sharing this point's record.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[must_use]
    pub fn same_record(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn has_signaled(&self) -> bool {
        if self.0.signalled.load(Ordering::Acquire) {
            return true;
        }
        if self.0.source.is_expired() {
            self.0.signalled.store(true, Ordering::Release);
            self.0.timeline.advance_min(self.0.value);
            return true;
        }
        false
    }

    /// Orders two points on the same timeline.
    ///
    /// An expired point precedes a pending one; two expired points compare
    /// equal. Two pending points are normalised against the timeline's last
    /// signalled value, which precedes both, so the order survives 32-bit
    /// wraparound.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CmpOrdering {
        let a_expired = self.has_signaled();
        let b_expired = other.has_signaled();
        match (a_expired, b_expired) {
            (true, false) => CmpOrdering::Less,
            (false, true) => CmpOrdering::Greater,
            (true, true) => CmpOrdering::Equal,
            (false, false) => {
                compare_ref(self.0.timeline.min(), self.0.value, other.0.value)
            }
        }
    }
}

/// Compares `a` and `b` after subtracting `reference` from both.
#[must_use]
pub const fn compare_ref(reference: u32, a: u32, b: u32) -> CmpOrdering {
    let a_n = a.wrapping_sub(reference);
    let b_n = b.wrapping_sub(reference);
    if a_n < b_n {
        CmpOrdering::Less
    } else if a_n > b_n {
        CmpOrdering::Greater
    } else {
        CmpOrdering::Equal
    }
}

/// A set of points that signals once all of them have.
#[derive(Debug, Clone, Default)]
pub struct SyncFence {
    pts: Vec<SyncPt>,
}

impl SyncFence {
    #[must_use]
    pub fn new(pt: SyncPt) -> Self {
        Self { pts: vec![pt] }
    }

    #[must_use]
    pub fn points(&self) -> &[SyncPt] {
        &self.pts
    }

    /// Union of two fences. Points on the same timeline collapse to the later
    /// one; surviving points are dups of the inputs.
    #[must_use]
    pub fn merge(a: &Self, b: &Self) -> Self {
        let mut pts: Vec<SyncPt> = Vec::with_capacity(a.pts.len() + b.pts.len());
        for pt in a.pts.iter().chain(&b.pts) {
            match pts
                .iter_mut()
                .find(|p| Arc::ptr_eq(p.timeline(), pt.timeline()))
            {
                Some(existing) => {
                    if pt.compare(existing) == CmpOrdering::Greater {
                        *existing = pt.dup();
                    }
                }
                None => pts.push(pt.dup()),
            }
        }
        Self { pts }
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.pts.iter().all(SyncPt::has_signaled)
    }

    /// Waits for every point, sleeping on each point's timeline.
    ///
    /// # Errors
    /// Returns `TimedOut` if any point is still pending at the deadline.
    pub fn wait(&self, timeout: Duration) -> crate::error::GpuResult<()> {
        let deadline = Instant::now() + timeout;
        for pt in &self.pts {
            let tl = pt.timeline();
            let mut guard = tl.lock.lock();
            while !pt.has_signaled() {
                if tl.cv.wait_until(&mut guard, deadline).timed_out() && !pt.has_signaled() {
                    return Err(crate::error::GpuError::TimedOut);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syncpt_pt(tl: &Arc<SyncTimeline>, mgr: &Arc<SyncpointManager>, id: u32) -> SyncPt {
        let thresh = mgr.incr_max(id, 1);
        tl.create_pt(PtSource::Syncpoint {
            mgr: Arc::clone(mgr),
            id,
            thresh,
        })
    }

    #[test]
    fn reference_compare_survives_wrap() {
        let r = u32::MAX - 2;
        assert_eq!(compare_ref(r, u32::MAX, 1), CmpOrdering::Less);
        assert_eq!(compare_ref(r, 1, u32::MAX), CmpOrdering::Greater);
        assert_eq!(compare_ref(r, 5, 5), CmpOrdering::Equal);
    }

    #[test]
    fn dup_shares_record() {
        let mgr = Arc::new(SyncpointManager::new(4));
        let id = mgr.alloc("t").unwrap();
        let tl = SyncTimeline::new("ch0");
        let pt = syncpt_pt(&tl, &mgr, id);
        let d = pt.dup();
        assert!(pt.same_record(&d));
        assert_eq!(pt.ref_count(), 2);
    }

    #[test]
    fn expired_precedes_pending() {
        let mgr = Arc::new(SyncpointManager::new(4));
        let id = mgr.alloc("t").unwrap();
        let tl = SyncTimeline::new("ch0");
        let a = syncpt_pt(&tl, &mgr, id);
        let b = syncpt_pt(&tl, &mgr, id);
        assert_eq!(a.compare(&b), CmpOrdering::Less);
        mgr.hw_incr(id);
        assert_eq!(a.compare(&b), CmpOrdering::Less);
        assert_eq!(b.compare(&a), CmpOrdering::Greater);
        assert_eq!(tl.min(), a.value());
    }

    #[test]
    fn merge_keeps_later_point_per_timeline() {
        let mgr = Arc::new(SyncpointManager::new(4));
        let id = mgr.alloc("t").unwrap();
        let tl = SyncTimeline::new("ch0");
        let a = syncpt_pt(&tl, &mgr, id);
        let b = syncpt_pt(&tl, &mgr, id);
        let m = SyncFence::merge(&SyncFence::new(a), &SyncFence::new(b.clone()));
        assert_eq!(m.points().len(), 1);
        assert!(m.points()[0].same_record(&b));
        assert!(m.wait(Duration::from_millis(1)).is_err());
        mgr.hw_incr(id);
        mgr.hw_incr(id);
        tl.signal();
        assert!(m.wait(Duration::from_millis(50)).is_ok());
    }
}
