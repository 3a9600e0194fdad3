//! The gpfifo submission pipeline and job clean-up.

#![allow(clippy::cast_possible_truncation)]

use super::job::Job;
use super::sync::{ChannelSync, PreFence};
use super::Channel;
use crate::error::{GpuError, GpuResult};
use crate::hw::pbdma::GpfifoEntry;
use crate::sync::fence::Fence;
use bitflags::bitflags;
use std::sync::Arc;
use std::sync::atomic::{self, Ordering};

/// Ring entries the kernel may add around a submission: one wait, one
/// increment.
const EXTRA_ENTRIES: u32 = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubmitFlags: u32 {
        /// Wait on the supplied pre-fence first.
        const FENCE_WAIT = 1 << 0;
        /// Return a post-fence.
        const FENCE_GET = 1 << 1;
        /// The pre-fence is a sync-framework fence and the post-fence gets one.
        const SYNC_FENCE = 1 << 3;
        /// Increment without waiting for the engine to idle.
        const SUPPRESS_WFI = 1 << 4;
        /// Do not pin the VM's buffers for the job's lifetime.
        const SKIP_BUFFER_REFCOUNTING = 1 << 5;
    }
}

impl Channel {
    /// Appends `entries` to the ring, bracketed by an optional wait on `wait`
    /// and an increment of the channel's sync object.
    ///
    /// Returns the job's post-fence when `FENCE_GET` is set.
    ///
    /// # Errors
    /// * `TimedOut` if the channel has timed out, checked before and after
    ///   taking the submit lock.
    /// * `InvalidArgument` without a gpfifo or VM, for a `FENCE_WAIT` without
    ///   a fence, or for a deterministic channel that does not skip buffer
    ///   refcounting.
    /// * `OutOfMemory` if the ring can never hold the request, or if the
    ///   private command queue is full.
    /// * `TryAgain` if the ring is currently too full.
    pub fn submit_gpfifo(
        self: &Arc<Self>,
        entries: &[GpfifoEntry],
        flags: SubmitFlags,
        wait: Option<&PreFence>,
    ) -> GpuResult<Option<Arc<Fence>>> {
        if self.has_timedout() {
            return Err(GpuError::TimedOut);
        }

        let (vm, gpfifo, deterministic) = {
            let state = self.state.lock();
            (state.vm.clone(), state.gpfifo.clone(), state.deterministic)
        };
        let gpfifo = gpfifo
            .ok_or_else(|| GpuError::invalid(format!("channel {}: no gpfifo", self.chid)))?;
        let n = entries.len() as u32;
        if gpfifo.entry_num() - 1 < n + EXTRA_ENTRIES {
            log::error!(
                "channel {}: {n} entries never fit a {} entry gpfifo",
                self.chid,
                gpfifo.entry_num()
            );
            return Err(GpuError::OutOfMemory);
        }
        let vm = vm.ok_or_else(|| GpuError::invalid(format!("channel {}: no VM", self.chid)))?;

        let wait = if flags.contains(SubmitFlags::FENCE_WAIT) {
            Some(wait.ok_or_else(|| GpuError::invalid("FENCE_WAIT without a fence"))?)
        } else {
            None
        };
        let skip_refs = flags.contains(SubmitFlags::SKIP_BUFFER_REFCOUNTING);
        if deterministic && !skip_refs {
            return Err(GpuError::invalid(
                "deterministic channels must skip buffer refcounting",
            ));
        }

        let cfg = &self.shared.cfg;
        let need_tracking = wait.is_some()
            || flags.contains(SubmitFlags::FENCE_GET)
            || self.watchdog.lock().enabled()
            || (cfg.can_railgate && !deterministic)
            || !skip_refs;

        let _power = (!deterministic).then(|| self.shared.power.busy_guard());

        let _submit = self.submit_lock.lock();
        if self.has_timedout() {
            return Err(GpuError::TimedOut);
        }

        let put = self.gp_put();
        if gpfifo.free_count(put, self.gp_get()) < n + EXTRA_ENTRIES {
            log::debug!("channel {}: gpfifo full", self.chid);
            return Err(GpuError::TryAgain);
        }

        if !need_tracking {
            let put = gpfifo.write(put, entries);
            atomic::fence(Ordering::Release);
            self.gp_put_store(put);
            log::trace!("channel {}: fast path submit, put {put}", self.chid);
            return Ok(None);
        }

        let ch_ref = self
            .get()
            .ok_or_else(|| GpuError::invalid(format!("channel {} is closing", self.chid)))?;
        let post_fence = {
            let jobs = self.joblist.lock();
            jobs.alloc_job()?;
            jobs.alloc_fence()
        };

        let (wait_cmd, incr_cmd) = {
            let mut sync = self.sync.lock();
            if sync.is_none() {
                *sync = Some(ChannelSync::create(self)?);
            }
            let Some(sync) = sync.as_ref() else {
                return Err(GpuError::invalid("channel sync unavailable"));
            };
            let mut queue = self.priv_cmd.lock();
            let queue = queue
                .as_mut()
                .ok_or_else(|| GpuError::invalid("no private command queue"))?;
            let mark = queue.mark();
            let wait_cmd = match wait {
                Some(pre) => match sync.wait_cmd(&vm, pre, queue) {
                    Ok(w) => w,
                    Err(e) => {
                        queue.rewind(mark);
                        return Err(e);
                    }
                },
                None => None,
            };
            let wfi = !flags.contains(SubmitFlags::SUPPRESS_WFI);
            let need_sync_fence =
                flags.contains(SubmitFlags::FENCE_GET) && flags.contains(SubmitFlags::SYNC_FENCE);
            match sync.incr_cmd(self, &vm, queue, &post_fence, wfi, need_sync_fence) {
                Ok(incr) => (wait_cmd, incr),
                Err(e) => {
                    queue.rewind(mark);
                    return Err(e);
                }
            }
        };

        let mut ring = Vec::with_capacity(entries.len() + 2);
        if let Some(w) = &wait_cmd {
            ring.push(GpfifoEntry::new(w.gpu_va, w.size));
        }
        ring.extend_from_slice(entries);
        ring.push(GpfifoEntry::new(incr_cmd.gpu_va, incr_cmd.size));
        let new_put = gpfifo.write(put, &ring);

        // Everything the GPU may fetch must be visible before PUT moves.
        atomic::fence(Ordering::Release);
        self.gp_put_store(new_put);

        let buffers = (!skip_refs).then(|| {
            let refs = vm.get_buffers();
            (Arc::clone(&vm), refs)
        });
        let power_ref = cfg.can_railgate && !deterministic;
        if power_ref {
            self.shared.power.busy();
        }
        self.joblist.lock().commit(Job {
            ch_ref,
            pre_fence: wait.cloned(),
            post_fence: Arc::clone(&post_fence),
            wait_cmd,
            incr_cmd,
            buffers,
            power_ref,
        });
        self.watchdog_start();

        log::debug!(
            "channel {}: submitted {n} entries, put {put} -> {new_put}, wait {}",
            self.chid,
            wait_cmd.is_some()
        );
        Ok(flags.contains(SubmitFlags::FENCE_GET).then_some(post_fence))
    }

    /// Retires finished jobs in submission order, stopping at the first one
    /// still pending. Without `clean_all` at most one job is retired.
    pub fn update(&self, clean_all: bool) {
        let mut retired = 0usize;
        {
            let _cleanup = self.cleanup_lock.lock();
            loop {
                let job = {
                    let mut jobs = self.joblist.lock();
                    match jobs.peek() {
                        Some(j) if j.post_fence.is_expired() => jobs.free_job(),
                        _ => None,
                    }
                };
                let Some(job) = job else { break };
                self.retire(job);
                retired += 1;
                if !clean_all {
                    break;
                }
            }
        }
        if retired == 0 {
            return;
        }

        if self.joblist.lock().is_empty() {
            self.watchdog_stop();
        } else {
            self.watchdog_restart();
        }
        log::trace!("channel {}: retired {retired} jobs", self.chid);

        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            (cb.0)(self);
        }
    }

    fn retire(&self, job: Job) {
        if let Some(sync) = &*self.sync.lock() {
            sync.signal_timeline();
        }
        if let Some(queue) = self.priv_cmd.lock().as_mut() {
            if let Some(w) = &job.wait_cmd {
                queue.free(w);
            }
            queue.free(&job.incr_cmd);
        }
        let Job {
            ch_ref,
            buffers,
            power_ref,
            ..
        } = job;
        if let Some((vm, refs)) = buffers {
            vm.put_buffers(refs);
        }
        if power_ref {
            self.shared.power.idle();
        }
        drop(ch_ref);
    }
}
