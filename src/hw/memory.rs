#![allow(clippy::cast_ptr_alignment)]

use crate::error::{GpuError, GpuResult};
use crate::utils::align_up;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

const PAGE_SIZE: usize = 4096;

/// Zeroed, page-backed host memory standing in for GPU-visible sysmem.
///
/// The mapping is anonymous and private; it is unmapped on drop. The start
/// address is aligned to the requested power of two so that scatter-list
/// alignment (and therefore page size selection) behaves as on hardware.
#[derive(Debug)]
pub struct HostMemory {
    map_ptr: *mut u8,
    map_size: usize,
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// # Errors
    /// Returns `Io` if the anonymous mapping fails.
    pub fn new(size: usize) -> GpuResult<Self> {
        Self::new_aligned(size, PAGE_SIZE)
    }

    /// # Errors
    /// Returns `InvalidArgument` for a zero size or non power-of-two
    /// alignment and `Io` if the anonymous mapping fails.
    pub fn new_aligned(size: usize, align: usize) -> GpuResult<Self> {
        if size == 0 || !align.is_power_of_two() {
            return Err(GpuError::invalid(format!(
                "host memory size 0x{size:x} align 0x{align:x}"
            )));
        }
        let align = align.max(PAGE_SIZE);
        let size = align_up(size as u64, PAGE_SIZE as u64) as usize;
        let map_size = size + align - PAGE_SIZE;

        let map_ptr = unsafe {
            let ret = libc::mmap(
                ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ret == libc::MAP_FAILED {
                return Err(io::Error::last_os_error().into());
            }
            ret.cast::<u8>()
        };

        let aligned = align_up(map_ptr as u64, align as u64) as usize;
        let ptr = unsafe { map_ptr.add(aligned - map_ptr as usize) };

        Ok(Self {
            map_ptr,
            map_size,
            ptr,
            size,
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Host address of the first byte.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    /// The 32-bit word at byte `offset` as a shared atomic.
    ///
    /// # Panics
    /// Panics if `offset` is unaligned or out of range.
    #[must_use]
    pub fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.size, "word 0x{offset:x} out of range");
        unsafe { &*self.ptr.add(offset).cast::<AtomicU32>() }
    }

    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release);
    }

    pub fn write_words(&self, offset: usize, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.word(offset + i * 4).store(*w, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn read_words(&self, offset: usize, count: usize) -> Vec<u32> {
        (0..count)
            .map(|i| self.word(offset + i * 4).load(Ordering::Relaxed))
            .collect()
    }

    pub fn zero(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.size, "zero 0x{offset:x}+0x{len:x} out of range");
        unsafe { ptr::write_bytes(self.ptr.add(offset), 0, len) };
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.map_ptr.cast(), self.map_size) };
        if ret != 0 {
            log::error!(
                "munmap of host memory at {:p} failed: {}",
                self.map_ptr,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_mapping_is_zeroed_and_writable() {
        let mem = HostMemory::new_aligned(8192, 64 << 10).unwrap();
        assert_eq!(mem.addr() % (64 << 10), 0);
        assert_eq!(mem.read_u32(4096), 0);
        mem.write_words(16, &[1, 2, 3]);
        assert_eq!(mem.read_words(16, 3), vec![1, 2, 3]);
        mem.zero(16, 12);
        assert_eq!(mem.read_u32(20), 0);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(HostMemory::new(0), Err(GpuError::InvalidArgument(_))));
    }
}
