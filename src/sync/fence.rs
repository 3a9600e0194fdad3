use super::WaitQueue;
use super::semaphore::Semaphore;
use super::timeline::{PtSource, SyncFence};
use crate::error::{GpuError, GpuResult};
use crate::hw::syncpt::SyncpointManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
enum FenceBacking {
    #[default]
    None,
    Semaphore {
        sema: Semaphore,
        wq: Arc<WaitQueue>,
    },
    Syncpoint {
        mgr: Arc<SyncpointManager>,
        id: u32,
        thresh: u32,
    },
}

/// Completion token for one job.
///
/// A fence is allocated empty and armed once with either a semaphore or a
/// syncpoint threshold. Readers only look at the backing after observing
/// `valid`, and an unarmed fence is treated as already signalled.
#[derive(Debug)]
pub struct Fence {
    backing: Mutex<FenceBacking>,
    valid: AtomicBool,
    wfi: AtomicBool,
    sync_fence: Mutex<Option<SyncFence>>,
}

impl Fence {
    fn empty() -> Self {
        Self {
            backing: Mutex::new(FenceBacking::None),
            valid: AtomicBool::new(false),
            wfi: AtomicBool::new(false),
            sync_fence: Mutex::new(None),
        }
    }

    /// A heap-allocated, unarmed fence.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::empty())
    }

    /// Back to the unarmed state. Drops the semaphore and sync object of the
    /// previous arming.
    fn disarm(&self) {
        self.valid.store(false, Ordering::Release);
        *self.backing.lock() = FenceBacking::None;
        *self.sync_fence.lock() = None;
        self.wfi.store(false, Ordering::Relaxed);
    }

    /// Allocates from `pool` when given, otherwise from the heap.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when the pool has no free fences.
    pub fn alloc(pool: Option<&Arc<FencePool>>) -> GpuResult<Arc<Self>> {
        match pool {
            Some(p) => p.alloc(),
            None => Ok(Self::new()),
        }
    }

    fn publish(&self, backing: FenceBacking, sync_fence: Option<SyncFence>, wfi: bool) {
        *self.backing.lock() = backing;
        *self.sync_fence.lock() = sync_fence;
        self.wfi.store(wfi, Ordering::Relaxed);
        atomic::fence(Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Arms the fence with one semaphore target.
    pub fn init_semaphore(
        &self,
        sema: Semaphore,
        wq: Arc<WaitQueue>,
        sync_fence: Option<SyncFence>,
        wfi: bool,
    ) {
        self.publish(FenceBacking::Semaphore { sema, wq }, sync_fence, wfi);
    }

    /// Arms the fence with a syncpoint threshold.
    pub fn init_syncpoint(
        &self,
        mgr: Arc<SyncpointManager>,
        id: u32,
        thresh: u32,
        sync_fence: Option<SyncFence>,
        wfi: bool,
    ) {
        self.publish(FenceBacking::Syncpoint { mgr, id, thresh }, sync_fence, wfi);
    }

    #[must_use]
    pub fn from_semaphore(sema: Semaphore, wq: Arc<WaitQueue>) -> Arc<Self> {
        let f = Self::new();
        f.init_semaphore(sema, wq, None, false);
        f
    }

    #[must_use]
    pub fn from_syncpoint(mgr: Arc<SyncpointManager>, id: u32, thresh: u32) -> Arc<Self> {
        let f = Self::new();
        f.init_syncpoint(mgr, id, thresh, None, false);
        f
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn wfi(&self) -> bool {
        self.wfi.load(Ordering::Relaxed)
    }

    /// For semaphore fences, compares the slot value with the target. For
    /// syncpoint fences, re-reads the hardware value before answering "no".
    #[must_use]
    pub fn is_expired(&self) -> bool {
        if !self.is_valid() {
            return true;
        }
        match &*self.backing.lock() {
            FenceBacking::None => true,
            FenceBacking::Semaphore { sema, .. } => sema.is_released(),
            FenceBacking::Syncpoint { mgr, id, thresh } => mgr.is_expired(*id, *thresh),
        }
    }

    /// Blocks until the fence expires. An unarmed fence returns at once.
    ///
    /// # Errors
    /// Returns `TimedOut` if `timeout` elapses first.
    pub fn wait(&self, timeout: Duration) -> GpuResult<()> {
        if !self.is_valid() {
            return Ok(());
        }
        let source = self.pt_source();
        let wq = match &*self.backing.lock() {
            FenceBacking::Semaphore { wq, .. } => Some(Arc::clone(wq)),
            _ => None,
        };
        match (source, wq) {
            (Some(PtSource::Syncpoint { mgr, id, thresh }), _) => {
                mgr.wait_timeout(id, thresh, timeout)
            }
            (Some(PtSource::Semaphore(sema)), Some(wq)) => {
                if wq.wait_event_timeout(|| sema.is_released(), timeout) {
                    Ok(())
                } else {
                    Err(GpuError::TimedOut)
                }
            }
            _ => Ok(()),
        }
    }

    /// What a sync point or a wait command needs to know about the backing.
    #[must_use]
    pub fn pt_source(&self) -> Option<PtSource> {
        if !self.is_valid() {
            return None;
        }
        match &*self.backing.lock() {
            FenceBacking::None => None,
            FenceBacking::Semaphore { sema, .. } => Some(PtSource::Semaphore(sema.clone())),
            FenceBacking::Syncpoint { mgr, id, thresh } => Some(PtSource::Syncpoint {
                mgr: Arc::clone(mgr),
                id: *id,
                thresh: *thresh,
            }),
        }
    }

    #[must_use]
    pub fn syncpoint(&self) -> Option<(u32, u32)> {
        match self.pt_source()? {
            PtSource::Syncpoint { id, thresh, .. } => Some((id, thresh)),
            PtSource::Semaphore(_) => None,
        }
    }

    #[must_use]
    pub fn semaphore(&self) -> Option<Semaphore> {
        match self.pt_source()? {
            PtSource::Semaphore(s) => Some(s),
            PtSource::Syncpoint { .. } => None,
        }
    }

    /// Exports the sync-framework companion as a waitable handle.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the fence was built without one.
    pub fn install_external_handle(&self) -> GpuResult<SyncFence> {
        self.sync_fence
            .lock()
            .clone()
            .ok_or_else(|| GpuError::invalid("fence has no sync object"))
    }
}

// ===============================================================================================
// FencePool
// ===============================================================================================

/// Fixed set of fences for channels with preallocated job tracking.
///
/// Every fence is allocated up front. A slot is free again once the pool
/// holds the only reference to it, i.e. the job has retired and every
/// client handle is gone. Slots are handed out round robin from `cursor`.
#[derive(Debug)]
pub struct FencePool {
    slots: Box<[Arc<Fence>]>,
    cursor: Mutex<usize>,
}

impl FencePool {
    #[must_use]
    pub fn new(capacity: u32) -> Arc<Self> {
        let slots = (0..capacity).map(|_| Fence::new()).collect();
        Arc::new(Self {
            slots,
            cursor: Mutex::new(0),
        })
    }

    /// Hands out the next free fence, disarmed.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when all fences are in use.
    pub fn alloc(&self) -> GpuResult<Arc<Fence>> {
        // New clones are only made under the cursor lock, so a count of one
        // cannot change underneath us.
        let mut cursor = self.cursor.lock();
        let n = self.slots.len();
        for step in 0..n {
            let idx = (*cursor + step) % n;
            let slot = &self.slots[idx];
            if Arc::strong_count(slot) == 1 {
                slot.disarm();
                *cursor = (idx + 1) % n;
                return Ok(Arc::clone(slot));
            }
        }
        Err(GpuError::OutOfMemory)
    }

    #[must_use]
    pub fn available(&self) -> u32 {
        let _cursor = self.cursor.lock();
        self.slots
            .iter()
            .filter(|f| Arc::strong_count(f) == 1)
            .count() as u32
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Whether `fence` is one of this pool's slots.
    #[must_use]
    pub fn owns(&self, fence: &Arc<Fence>) -> bool {
        self.slots.iter().any(|f| Arc::ptr_eq(f, fence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::semaphore::SemaphoreSea;

    #[test]
    fn unarmed_fence_is_vacuously_done() {
        let f = Fence::new();
        assert!(f.is_expired());
        assert!(f.wait(Duration::ZERO).is_ok());
        assert!(f.install_external_handle().is_err());
    }

    #[test]
    fn semaphore_fence_tracks_slot() {
        let sea = SemaphoreSea::new(1).unwrap();
        let pool = sea.alloc_pool().unwrap();
        let hw = pool.alloc_hw_sema(0).unwrap();
        let sema = Semaphore::new(&hw);
        let wq = Arc::new(WaitQueue::new());
        let f = Fence::from_semaphore(sema.clone(), Arc::clone(&wq));
        assert!(!f.is_expired());
        assert!(matches!(f.wait(Duration::from_millis(5)), Err(GpuError::TimedOut)));
        sema.release(true);
        wq.wake_all();
        assert!(f.is_expired());
        assert!(f.wait(Duration::from_millis(5)).is_ok());
    }

    #[test]
    fn syncpoint_fence_rereads_hardware() {
        let mgr = Arc::new(SyncpointManager::new(4));
        let id = mgr.alloc("t").unwrap();
        let thresh = mgr.incr_max(id, 1);
        let f = Fence::from_syncpoint(Arc::clone(&mgr), id, thresh);
        assert!(!f.is_expired());
        mgr.hw_incr(id);
        assert!(f.is_expired());
        assert_eq!(f.syncpoint(), Some((id, thresh)));
    }

    #[test]
    fn pool_slot_returns_on_drop() {
        let pool = FencePool::new(1);
        let f = Fence::alloc(Some(&pool)).unwrap();
        assert!(matches!(pool.alloc(), Err(GpuError::OutOfMemory)));
        drop(f);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn pool_recycles_the_same_fences() {
        let pool = FencePool::new(2);
        let mgr = Arc::new(SyncpointManager::new(4));
        let id = mgr.alloc("t").unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        a.init_syncpoint(Arc::clone(&mgr), id, mgr.incr_max(id, 1), None, false);
        assert!(a.is_valid());

        let first = Arc::clone(&a);
        drop(a);
        // `first` still pins the slot.
        assert!(matches!(pool.alloc(), Err(GpuError::OutOfMemory)));
        drop(first);

        let again = pool.alloc().unwrap();
        assert!(pool.owns(&again));
        assert!(!again.is_valid());
        assert!(again.syncpoint().is_none());
        assert_eq!(pool.available(), 0);
        drop(b);
        let other = pool.alloc().unwrap();
        assert!(!Arc::ptr_eq(&again, &other));
        assert!(pool.owns(&other));
    }
}
