//! Job tracking: one record per tracked submission, kept in submission
//! order until its post-fence expires.

use super::ChannelRef;
use super::priv_cmd::PrivCmdEntry;
use super::sync::PreFence;
use crate::error::{GpuError, GpuResult};
use crate::mm::{BufferRefs, Vm};
use crate::sync::fence::{Fence, FencePool};
use std::collections::VecDeque;
use std::sync::Arc;

/// A submitted unit of work.
#[derive(Debug)]
pub(crate) struct Job {
    /// Keeps the channel referenceable state alive until the job retires.
    pub(crate) ch_ref: ChannelRef,
    pub(crate) pre_fence: Option<PreFence>,
    pub(crate) post_fence: Arc<Fence>,
    pub(crate) wait_cmd: Option<PrivCmdEntry>,
    pub(crate) incr_cmd: PrivCmdEntry,
    pub(crate) buffers: Option<(Arc<Vm>, BufferRefs)>,
    pub(crate) power_ref: bool,
}

/// Where job records come from.
///
/// `Preallocated` has a fixed number of in-flight slots and a matching fence
/// pool, so the submit path does not grow the heap. `Dynamic` is unbounded.
#[derive(Debug)]
pub(crate) enum JobSource {
    Preallocated {
        ring: VecDeque<Job>,
        capacity: usize,
        fences: Arc<FencePool>,
    },
    Dynamic(VecDeque<Job>),
}

impl Default for JobSource {
    fn default() -> Self {
        Self::Dynamic(VecDeque::new())
    }
}

impl JobSource {
    pub(crate) fn preallocated(capacity: u32) -> Self {
        Self::Preallocated {
            ring: VecDeque::with_capacity(capacity as usize),
            capacity: capacity as usize,
            fences: FencePool::new(capacity),
        }
    }

    pub(crate) const fn is_preallocated(&self) -> bool {
        matches!(self, Self::Preallocated { .. })
    }

    fn queue(&self) -> &VecDeque<Job> {
        match self {
            Self::Preallocated { ring, .. } => ring,
            Self::Dynamic(q) => q,
        }
    }

    fn queue_mut(&mut self) -> &mut VecDeque<Job> {
        match self {
            Self::Preallocated { ring, .. } => ring,
            Self::Dynamic(q) => q,
        }
    }

    /// Checks that one more job fits.
    ///
    /// # Errors
    /// Returns `TryAgain` when every preallocated slot is in flight.
    pub(crate) fn alloc_job(&self) -> GpuResult<()> {
        match self {
            Self::Preallocated { ring, capacity, .. } if ring.len() >= *capacity => {
                Err(GpuError::TryAgain)
            }
            _ => Ok(()),
        }
    }

    /// A post-fence for the next job. A preallocated channel whose pool is
    /// exhausted (clients still hold old fences) falls back to the heap.
    pub(crate) fn alloc_fence(&self) -> Arc<Fence> {
        match self {
            Self::Preallocated { fences, .. } => Fence::alloc(Some(fences)).unwrap_or_else(|_| {
                log::debug!("fence pool exhausted, using heap fence");
                Fence::new()
            }),
            Self::Dynamic(_) => Fence::new(),
        }
    }

    pub(crate) fn commit(&mut self, job: Job) {
        self.queue_mut().push_back(job);
    }

    pub(crate) fn peek(&self) -> Option<&Job> {
        self.queue().front()
    }

    pub(crate) fn free_job(&mut self) -> Option<Job> {
        self.queue_mut().pop_front()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Job> {
        self.queue().iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_pool_falls_back_to_heap() {
        let src = JobSource::preallocated(1);
        let a = src.alloc_fence();
        let b = src.alloc_fence();
        assert!(!a.is_valid() && !b.is_valid());
        if let JobSource::Preallocated { fences, .. } = &src {
            assert_eq!(fences.available(), 0);
            drop(a);
            assert_eq!(fences.available(), 1);
        }
    }

    #[test]
    fn preallocated_source_reuses_retired_fences() {
        let src = JobSource::preallocated(2);
        let first = src.alloc_fence();
        let first_ptr = Arc::as_ptr(&first);
        let kept = Arc::clone(&first);
        drop(first);
        let second = src.alloc_fence();
        assert!(!Arc::ptr_eq(&kept, &second));

        drop(kept);
        let third = src.alloc_fence();
        assert_eq!(Arc::as_ptr(&third), first_ptr);
        drop(second);
        let fourth = src.alloc_fence();
        let JobSource::Preallocated { fences, .. } = &src else {
            unreachable!()
        };
        assert!(fences.owns(&third) && fences.owns(&fourth));
        assert!(!Arc::ptr_eq(&third, &fourth));
        assert_eq!(fences.available(), 0);
    }

    #[test]
    fn dynamic_source_never_fills() {
        let src = JobSource::default();
        assert!(!src.is_preallocated());
        assert!(src.alloc_job().is_ok());
        assert!(src.is_empty());
    }
}
