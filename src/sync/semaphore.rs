//! Hardware semaphores.
//!
//! The sea is one block of semaphore pages shared by the device. Each VM owns
//! one pool (a page of the sea) and maps it read-write; every VM maps the
//! whole sea read-only so any channel can acquire on any other channel's
//! semaphore. A channel owns one slot in its VM's pool for its lifetime, and
//! a [`Semaphore`] is a target value on that slot.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{GpuError, GpuResult};
use crate::mm::buffer::DmaBuf;
use crate::utils::{Bitmap, counter_reached};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub const SEMAPHORE_PAGE_SIZE: usize = 4096;
pub const SEMAPHORE_SIZE: usize = 16;
pub const SEMAPHORES_PER_PAGE: usize = SEMAPHORE_PAGE_SIZE / SEMAPHORE_SIZE;

/// How long a non-forced release waits for the previous value to land.
const RELEASE_CATCH_UP: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct SemaphoreSea {
    buf: Arc<DmaBuf>,
    pages: Mutex<Bitmap>,
}

impl SemaphoreSea {
    /// # Errors
    /// Returns an error if the backing pages cannot be allocated.
    pub fn new(page_count: u32) -> GpuResult<Arc<Self>> {
        let page_count = page_count.max(1) as usize;
        let buf = DmaBuf::new((page_count * SEMAPHORE_PAGE_SIZE) as u64)?;
        Ok(Arc::new(Self {
            buf,
            pages: Mutex::new(Bitmap::new(page_count)),
        }))
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<DmaBuf> {
        &self.buf
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.buf.size()
    }

    /// Takes one page of the sea as a new pool.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when every page is in use.
    pub fn alloc_pool(self: &Arc<Self>) -> GpuResult<Arc<SemaphorePool>> {
        let mut pages = self.pages.lock();
        let page = pages.find_first_zero().ok_or(GpuError::OutOfMemory)?;
        pages.set(page);
        drop(pages);

        self.buf
            .memory()
            .zero(page * SEMAPHORE_PAGE_SIZE, SEMAPHORE_PAGE_SIZE);
        log::debug!("semaphore pool allocated at sea page {page}");

        Ok(Arc::new(SemaphorePool {
            sea: Arc::clone(self),
            page: page as u32,
            slots: Mutex::new(Bitmap::new(SEMAPHORES_PER_PAGE)),
            next_values: (0..SEMAPHORES_PER_PAGE).map(|_| AtomicU32::new(0)).collect(),
            rw_va: AtomicU64Opt::default(),
        }))
    }

    fn free_page(&self, page: u32) {
        if !self.pages.lock().test_and_clear(page as usize) {
            log::warn!("semaphore sea page {page}: extra free");
        }
    }

    fn read(&self, offset: usize) -> u32 {
        self.buf.memory().read_u32(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.buf.memory().write_u32(offset, value);
    }
}

/// Lock-free `Option<u64>` with 0 as `None`; GPU VAs are never 0.
#[derive(Debug, Default)]
struct AtomicU64Opt(std::sync::atomic::AtomicU64);

impl AtomicU64Opt {
    fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            v => Some(v),
        }
    }

    fn set(&self, v: u64) {
        self.0.store(v, Ordering::Release);
    }
}

/// One page of the sea owned by a single VM.
#[derive(Debug)]
pub struct SemaphorePool {
    sea: Arc<SemaphoreSea>,
    page: u32,
    slots: Mutex<Bitmap>,
    next_values: Vec<AtomicU32>,
    rw_va: AtomicU64Opt,
}

impl SemaphorePool {
    #[must_use]
    pub const fn page(&self) -> u32 {
        self.page
    }

    /// Byte offset of the pool page inside the sea.
    #[must_use]
    pub const fn sea_offset(&self) -> u64 {
        self.page as u64 * SEMAPHORE_PAGE_SIZE as u64
    }

    #[must_use]
    pub fn sea(&self) -> &Arc<SemaphoreSea> {
        &self.sea
    }

    /// Read-write GPU VA of the page in the owning VM, once mapped.
    #[must_use]
    pub fn rw_va(&self) -> Option<u64> {
        self.rw_va.get()
    }

    pub(crate) fn set_rw_va(&self, va: u64) {
        self.rw_va.set(va);
    }

    #[must_use]
    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().count_ones()
    }

    /// `alloc_hw_sema`: claims one zeroed slot for channel `chid`.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when every slot in the page is taken; existing
    /// slots are not touched.
    pub fn alloc_hw_sema(self: &Arc<Self>, chid: u32) -> GpuResult<Arc<HwSemaphore>> {
        let mut slots = self.slots.lock();
        let Some(idx) = slots.find_first_zero() else {
            log::error!("semaphore pool page {} full (chid {chid})", self.page);
            return Err(GpuError::OutOfMemory);
        };
        slots.set(idx);
        drop(slots);

        self.next_values[idx].store(0, Ordering::Release);
        let hw = HwSemaphore {
            pool: Arc::clone(self),
            idx: idx as u32,
            chid,
        };
        hw.write(0);
        Ok(Arc::new(hw))
    }

    fn free_slot(&self, idx: u32) {
        if !self.slots.lock().test_and_clear(idx as usize) {
            log::warn!("semaphore slot {idx} in page {}: extra free", self.page);
        }
    }

    /// Text dump of every live slot: index, hardware value and next value.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let slots = self.slots.lock();
        let _ = writeln!(out, "semaphore pool page {}", self.page);
        for idx in slots.iter_ones() {
            let off = self.sea_offset() as usize + idx * SEMAPHORE_SIZE;
            let _ = writeln!(
                out,
                "  slot {idx:3}: value {} next {}",
                self.sea.read(off),
                self.next_values[idx].load(Ordering::Acquire)
            );
        }
        out
    }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        self.sea.free_page(self.page);
    }
}

/// A channel's slot in its pool.
#[derive(Debug)]
pub struct HwSemaphore {
    pool: Arc<SemaphorePool>,
    idx: u32,
    chid: u32,
}

impl HwSemaphore {
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.idx
    }

    #[must_use]
    pub const fn chid(&self) -> u32 {
        self.chid
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<SemaphorePool> {
        &self.pool
    }

    /// Offset of the slot inside the whole sea.
    #[must_use]
    pub fn sea_offset(&self) -> u64 {
        self.pool.sea_offset() + self.idx as u64 * SEMAPHORE_SIZE as u64
    }

    /// Offset of the slot inside its pool page.
    #[must_use]
    pub const fn page_offset(&self) -> u64 {
        self.idx as u64 * SEMAPHORE_SIZE as u64
    }

    #[must_use]
    pub fn read(&self) -> u32 {
        self.pool.sea.read(self.sea_offset() as usize)
    }

    fn write(&self, value: u32) {
        self.pool.sea.write(self.sea_offset() as usize, value);
    }

    #[must_use]
    pub fn next_value(&self) -> u32 {
        self.pool.next_values[self.idx as usize].load(Ordering::Acquire)
    }

    fn incr_next(&self) -> u32 {
        self.pool.next_values[self.idx as usize]
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }
}

impl Drop for HwSemaphore {
    fn drop(&mut self) {
        self.pool.free_slot(self.idx);
    }
}

/// A target value on a slot.
#[derive(Debug, Clone)]
pub struct Semaphore {
    hw: Arc<HwSemaphore>,
    value: u32,
}

impl Semaphore {
    /// Reserves the slot's next value as this semaphore's target.
    #[must_use]
    pub fn new(hw: &Arc<HwSemaphore>) -> Self {
        Self {
            hw: Arc::clone(hw),
            value: hw.incr_next(),
        }
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.value
    }

    #[must_use]
    pub fn hw(&self) -> &Arc<HwSemaphore> {
        &self.hw
    }

    #[must_use]
    pub fn read(&self) -> u32 {
        self.hw.read()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        counter_reached(self.hw.read(), self.value)
    }

    #[must_use]
    pub fn is_acquired(&self) -> bool {
        !self.is_released()
    }

    /// CPU-side release. The slot value only moves forward.
    ///
    /// Without `force`, waits briefly for the slot to reach `value - 1` so
    /// that releases land in order. With `force` the target is written
    /// directly; recovery uses this when no GPU writer remains.
    pub fn release(&self, force: bool) {
        if self.is_released() {
            return;
        }
        if !force {
            let start = Instant::now();
            while self.hw.read() != self.value.wrapping_sub(1) {
                if start.elapsed() > RELEASE_CATCH_UP {
                    log::warn!(
                        "semaphore slot {} (chid {}): release of {} before {} landed",
                        self.hw.idx,
                        self.hw.chid,
                        self.value,
                        self.value.wrapping_sub(1)
                    );
                    break;
                }
                std::hint::spin_loop();
            }
        }
        if !self.is_released() {
            self.hw.write(self.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphores_take_increasing_targets() {
        let sea = SemaphoreSea::new(1).unwrap();
        let pool = sea.alloc_pool().unwrap();
        let hw = pool.alloc_hw_sema(0).unwrap();
        let a = Semaphore::new(&hw);
        let b = Semaphore::new(&hw);
        assert_eq!((a.value(), b.value()), (1, 2));
        assert!(a.is_acquired());
        a.release(false);
        assert!(a.is_released());
        assert!(b.is_acquired());
        b.release(true);
        a.release(true);
        assert_eq!(hw.read(), 2);
    }

    #[test]
    fn forced_release_skips_ahead() {
        let sea = SemaphoreSea::new(1).unwrap();
        let pool = sea.alloc_pool().unwrap();
        let hw = pool.alloc_hw_sema(0).unwrap();
        let _first = Semaphore::new(&hw);
        let second = Semaphore::new(&hw);
        second.release(true);
        assert_eq!(hw.read(), 2);
    }

    #[test]
    fn slot_returns_to_pool_on_drop() {
        let sea = SemaphoreSea::new(1).unwrap();
        let pool = sea.alloc_pool().unwrap();
        let hw = pool.alloc_hw_sema(3).unwrap();
        assert_eq!(pool.slots_in_use(), 1);
        let s = Semaphore::new(&hw);
        drop(hw);
        assert_eq!(pool.slots_in_use(), 1);
        drop(s);
        assert_eq!(pool.slots_in_use(), 0);
    }

    #[test]
    fn sea_pages_are_exclusive() {
        let sea = SemaphoreSea::new(2).unwrap();
        let a = sea.alloc_pool().unwrap();
        let b = sea.alloc_pool().unwrap();
        assert_ne!(a.page(), b.page());
        assert!(matches!(sea.alloc_pool(), Err(GpuError::OutOfMemory)));
        drop(a);
        assert!(sea.alloc_pool().is_ok());
    }
}
