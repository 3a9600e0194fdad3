//! Private command buffer: a ring of kernel-built push buffer fragments
//! (fence waits and increments) that bracket user gpfifo entries.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{GpuError, GpuResult};
use crate::mm::DmaBuf;
use crate::mm::page_table::RwFlag;
use crate::mm::vm::Vm;
use crate::utils::roundup_pow_of_two;
use std::sync::Arc;

/// Worst case words per job: a wait and an increment command, each budgeted
/// at up to 18 words, for two thirds of the gpfifo entries.
const WORDS_PER_ENTRY_X3: u64 = 2 * 18;

/// One allocation in the queue. `off` and `size` are in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivCmdEntry {
    pub off: u32,
    pub size: u32,
    pub gpu_va: u64,
}

#[derive(Debug)]
pub struct PrivCmdQueue {
    mem: Arc<DmaBuf>,
    base_va: u64,
    /// Queue size in words; always a power of two.
    size: u32,
    put: u32,
    get: u32,
}

impl PrivCmdQueue {
    /// Bytes needed for a gpfifo of `entry_num` entries.
    #[must_use]
    pub const fn size_bytes(entry_num: u32) -> u64 {
        roundup_pow_of_two(entry_num as u64 * WORDS_PER_ENTRY_X3 * 4 / 3)
    }

    /// Allocates the queue and maps it into the kernel VMA of `vm`.
    ///
    /// # Errors
    /// Returns an error if memory cannot be allocated or mapped.
    pub fn new(vm: &Vm, entry_num: u32) -> GpuResult<Self> {
        let bytes = Self::size_bytes(entry_num.max(1));
        let mem = DmaBuf::new_aligned(bytes, 4096)?;
        let base_va = vm.map_kernel(&mem, RwFlag::ReadWrite)?;
        log::debug!("priv cmd queue: {bytes} bytes at 0x{base_va:x}");
        Ok(Self {
            size: (bytes / 4) as u32,
            mem,
            base_va,
            put: 0,
            get: 0,
        })
    }

    /// Unmaps the queue from `vm`.
    pub fn destroy(self, vm: &Vm) {
        if let Err(e) = vm.unmap_kernel(self.base_va) {
            log::warn!("priv cmd queue unmap failed: {e}");
        }
    }

    #[must_use]
    pub const fn size_words(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub const fn base_va(&self) -> u64 {
        self.base_va
    }

    fn free_words(&self) -> u32 {
        self.size
            .wrapping_sub(self.put.wrapping_sub(self.get))
            .wrapping_sub(1)
            % self.size
    }

    /// Reserves `words` contiguous words. A request that would straddle the
    /// end of the ring skips the tail and starts at 0.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when the queue cannot fit the request.
    pub fn alloc(&mut self, words: u32) -> GpuResult<PrivCmdEntry> {
        let mut needed = words;
        if self.put + words > self.size {
            needed = words + (self.size - self.put);
        }
        if needed > self.free_words() {
            log::debug!(
                "priv cmd queue full: need {needed} free {} (put {} get {})",
                self.free_words(),
                self.put,
                self.get
            );
            return Err(GpuError::OutOfMemory);
        }

        let off = if self.put + words > self.size { 0 } else { self.put };
        self.put = (off + words) & (self.size - 1);
        Ok(PrivCmdEntry {
            off,
            size: words,
            gpu_va: self.base_va + u64::from(off) * 4,
        })
    }

    /// Writes the command words of an entry.
    pub fn write(&self, entry: &PrivCmdEntry, words: &[u32]) {
        debug_assert_eq!(words.len(), entry.size as usize);
        self.mem.memory().write_words(entry.off as usize * 4, words);
    }

    #[must_use]
    pub fn read(&self, entry: &PrivCmdEntry) -> Vec<u32> {
        self.mem
            .memory()
            .read_words(entry.off as usize * 4, entry.size as usize)
    }

    /// Current PUT, for undoing allocations of a failed submission.
    pub(crate) const fn mark(&self) -> u32 {
        self.put
    }

    pub(crate) fn rewind(&mut self, mark: u32) {
        self.put = mark;
    }

    /// Retires an entry; entries retire in allocation order.
    pub fn free(&mut self, entry: &PrivCmdEntry) {
        self.get = (entry.off + entry.size) & (self.size - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_power_of_two() {
        assert_eq!(PrivCmdQueue::size_bytes(1024), 64 << 10);
        assert_eq!(PrivCmdQueue::size_bytes(4), 256);
    }

    fn queue(words: u32) -> PrivCmdQueue {
        PrivCmdQueue {
            mem: DmaBuf::new(u64::from(words) * 4).unwrap(),
            base_va: 0x10_0000,
            size: words,
            put: 0,
            get: 0,
        }
    }

    #[test]
    fn wraps_to_start_instead_of_straddling() {
        let mut q = queue(64);
        let a = q.alloc(40).unwrap();
        q.free(&a);
        let b = q.alloc(30).unwrap();
        assert_eq!(b.off, 0);
        assert_eq!(b.gpu_va, 0x10_0000);
        assert_eq!(q.put, 30);
    }

    #[test]
    fn full_queue_is_out_of_memory() {
        let mut q = queue(64);
        let _a = q.alloc(40).unwrap();
        assert!(matches!(q.alloc(30), Err(GpuError::OutOfMemory)));
        let _b = q.alloc(23).unwrap();
        assert!(matches!(q.alloc(1), Err(GpuError::OutOfMemory)));
    }
}
