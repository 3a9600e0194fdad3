//! Shareable buffers (the dma-buf side of a mapping) and their per-offset
//! compression state.

use super::comptags::{CompbitsWindow, ComptagAllocator, Comptags};
use crate::error::{GpuError, GpuResult};
use crate::hw::memory::HostMemory;
use crate::sync::fence::Fence;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Physical address width carried by a PTE.
const BUS_ADDRESS_BITS: u32 = 40;
const DEFAULT_ALIGN: usize = 128 << 10;

bitflags! {
    /// Which compression bit formats are currently valid for a buffer range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Compbits: u32 {
        const GPU = 1 << 0;
        const CDEH = 1 << 1;
        const CDEV = 1 << 2;
    }
}

impl Compbits {
    pub const NONE: Self = Self::empty();
}

#[derive(Debug, Clone, Default)]
struct BufferState {
    offset: u64,
    valid_compbits: Compbits,
    zbc_color: u32,
    fence: Option<Arc<Fence>>,
}

/// What a reader learns before consuming a compressible buffer.
#[derive(Debug, Clone)]
pub struct CompressibleRead {
    pub fence: Option<Arc<Fence>>,
    pub valid_compbits: Compbits,
    pub zbc_color: u32,
}

#[derive(Debug)]
struct ComptagsPriv {
    tags: Comptags,
    window: Option<CompbitsWindow>,
    allocator: Arc<ComptagAllocator>,
}

/// A pinned-on-demand buffer that can be mapped into one or more VMs.
///
/// `chunks` is the scatter list as `(bus address, length)` pairs laid out
/// back to back over `mem`.
#[derive(Debug)]
pub struct DmaBuf {
    mem: HostMemory,
    chunks: Vec<(u64, u64)>,
    size: u64,
    pins: AtomicU32,
    revoked: AtomicBool,
    comptags: Mutex<Option<ComptagsPriv>>,
    states: Mutex<Vec<BufferState>>,
}

impl DmaBuf {
    /// A physically contiguous buffer aligned to 128K.
    ///
    /// # Errors
    /// Returns an error if host memory cannot be mapped.
    pub fn new(size: u64) -> GpuResult<Arc<Self>> {
        Self::new_aligned(size, DEFAULT_ALIGN as u64)
    }

    /// # Errors
    /// Returns an error if host memory cannot be mapped.
    pub fn new_aligned(size: u64, align: u64) -> GpuResult<Arc<Self>> {
        let mem = HostMemory::new_aligned(size as usize, align as usize)?;
        let size = mem.len() as u64;
        let bus = mem.addr() & ((1 << BUS_ADDRESS_BITS) - 1);
        Ok(Self::build(mem, vec![(bus, size)]))
    }

    /// A buffer described by an explicit scatter list.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty list or chunks that are not
    /// 4K multiples.
    pub fn with_chunks(chunks: &[(u64, u64)]) -> GpuResult<Arc<Self>> {
        if chunks.is_empty() || chunks.iter().any(|&(a, l)| l == 0 || (a | l) & 0xfff != 0) {
            return Err(GpuError::invalid("scatter list chunks must be non-empty 4K multiples"));
        }
        let size: u64 = chunks.iter().map(|c| c.1).sum();
        let mem = HostMemory::new(size as usize)?;
        Ok(Self::build(mem, chunks.to_vec()))
    }

    fn build(mem: HostMemory, chunks: Vec<(u64, u64)>) -> Arc<Self> {
        Arc::new(Self {
            size: chunks.iter().map(|c| c.1).sum(),
            mem,
            chunks,
            pins: AtomicU32::new(0),
            revoked: AtomicBool::new(false),
            comptags: Mutex::new(None),
            states: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn memory(&self) -> &HostMemory {
        &self.mem
    }

    #[must_use]
    pub fn chunks(&self) -> &[(u64, u64)] {
        &self.chunks
    }

    /// Natural alignment of the scatter list: the smallest power of two
    /// dividing every chunk's address and length.
    #[must_use]
    pub fn align(&self) -> u64 {
        self.chunks
            .iter()
            .map(|&(addr, len)| 1u64 << (addr | len).trailing_zeros())
            .min()
            .unwrap_or(0)
    }

    /// Bus address backing byte `offset`.
    #[must_use]
    pub fn phys_at(&self, offset: u64) -> Option<u64> {
        let mut base = 0;
        for &(addr, len) in &self.chunks {
            if offset < base + len {
                return Some(addr + (offset - base));
            }
            base += len;
        }
        None
    }

    /// # Errors
    /// Returns `BadAddress` once the buffer has been revoked.
    pub fn pin(&self) -> GpuResult<()> {
        if self.is_revoked() {
            return Err(GpuError::fault("dmabuf backing revoked"));
        }
        self.pins.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Detaches the backing pages from future users, as when the exporter
    /// goes away. Existing pins stay valid; new pins fail.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub fn unpin(&self) {
        if self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
            .is_err()
        {
            log::warn!("dmabuf: unpin without pin");
        }
    }

    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    // ===========================================================================================
    // Comptags
    // ===========================================================================================

    #[must_use]
    pub fn comptags(&self) -> Comptags {
        self.comptags.lock().as_ref().map(|p| p.tags).unwrap_or_default()
    }

    #[must_use]
    pub fn compbits_window(&self) -> Option<CompbitsWindow> {
        self.comptags.lock().as_ref().and_then(|p| p.window)
    }

    /// Attaches comptags. They are returned to `allocator` when the buffer
    /// is dropped.
    pub(crate) fn set_comptags(
        &self,
        tags: Comptags,
        window: Option<CompbitsWindow>,
        allocator: Arc<ComptagAllocator>,
    ) {
        let mut slot = self.comptags.lock();
        if let Some(old) = slot.take() {
            log::warn!("dmabuf: replacing comptags at line {}", old.tags.offset);
            old.allocator.free_buffer(&old.tags);
        }
        *slot = Some(ComptagsPriv {
            tags,
            window,
            allocator,
        });
    }

    // ===========================================================================================
    // Compression state
    // ===========================================================================================

    fn with_state<R>(&self, offset: u64, f: impl FnOnce(&mut BufferState) -> R) -> R {
        let mut states = self.states.lock();
        let idx = match states.iter().position(|s| s.offset == offset) {
            Some(i) => i,
            None => {
                states.push(BufferState {
                    offset,
                    ..BufferState::default()
                });
                states.len() - 1
            }
        };
        f(&mut states[idx])
    }

    /// Records what the last writer left valid at `offset`.
    pub fn mark_compressible_write(
        &self,
        offset: u64,
        valid_compbits: Compbits,
        zbc_color: u32,
        fence: Option<Arc<Fence>>,
    ) {
        self.with_state(offset, |s| {
            s.valid_compbits = valid_compbits;
            s.zbc_color = zbc_color;
            s.fence = fence;
        });
    }

    /// Reports the compression state a reader needs at `offset`.
    ///
    /// # Errors
    /// - `InvalidArgument` when uncompressed data is requested while
    ///   compbits are valid; decompression on demand is not implemented and
    ///   the stored fence is dropped.
    /// - `Unsupported` when the request needs CDE-format bits that only a
    ///   CDE conversion could produce.
    pub fn prepare_compressible_read(
        &self,
        offset: u64,
        request: Compbits,
    ) -> GpuResult<CompressibleRead> {
        self.with_state(offset, |s| {
            let missing = (s.valid_compbits ^ request) & request;

            if !s.valid_compbits.is_empty() && request == Compbits::NONE {
                s.fence = None;
                return Err(GpuError::invalid("decompression of compressed buffer"));
            }
            if !missing.is_empty()
                && s.valid_compbits.contains(Compbits::GPU)
                && missing.intersects(Compbits::CDEH | Compbits::CDEV)
            {
                return Err(GpuError::Unsupported(format!(
                    "CDE conversion to {missing:?}"
                )));
            }

            Ok(CompressibleRead {
                fence: s.fence.clone(),
                valid_compbits: s.valid_compbits,
                zbc_color: s.zbc_color,
            })
        })
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        if let Some(p) = self.comptags.get_mut().take() {
            p.allocator.free_buffer(&p.tags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuConfig;

    #[test]
    fn alignment_is_min_over_chunks() {
        let b = DmaBuf::with_chunks(&[(0x10_0000, 0x2_0000), (0x40_0000, 0x1_0000)]).unwrap();
        assert_eq!(b.align(), 0x1_0000);
        assert_eq!(b.phys_at(0x2_0100), Some(0x40_0100));
        assert_eq!(b.phys_at(0x3_0000), None);
        let c = DmaBuf::with_chunks(&[(0x10_3000, 0x1000)]).unwrap();
        assert_eq!(c.align(), 0x1000);
    }

    #[test]
    fn revoked_buffer_refuses_new_pins() {
        let b = DmaBuf::new(0x1000).unwrap();
        b.pin().unwrap();
        b.revoke();
        assert!(matches!(b.pin(), Err(GpuError::BadAddress(_))));
        assert_eq!(b.pin_count(), 1);
        b.unpin();
        assert_eq!(b.pin_count(), 0);
    }

    #[test]
    fn comptags_return_on_drop() {
        let alloc = Arc::new(ComptagAllocator::new(&GpuConfig::new().with_comptag_lines(33)));
        let b = DmaBuf::new(0x2_0000).unwrap();
        let (tags, win) = alloc.alloc_for_buffer(4, false).unwrap();
        b.set_comptags(tags, win, Arc::clone(&alloc));
        assert_eq!(alloc.free_lines(), 28);
        drop(b);
        assert_eq!(alloc.free_lines(), 32);
    }

    #[test]
    fn compressible_read_rules() {
        let b = DmaBuf::new(0x1000).unwrap();
        b.mark_compressible_write(0, Compbits::GPU, 7, Some(Fence::new()));

        let r = b.prepare_compressible_read(0, Compbits::GPU).unwrap();
        assert_eq!(r.zbc_color, 7);
        assert!(r.fence.is_some());

        assert!(matches!(
            b.prepare_compressible_read(0, Compbits::GPU | Compbits::CDEH),
            Err(GpuError::Unsupported(_))
        ));
        assert!(matches!(
            b.prepare_compressible_read(0, Compbits::NONE),
            Err(GpuError::InvalidArgument(_))
        ));
        let r = b.prepare_compressible_read(0, Compbits::GPU).unwrap();
        assert!(r.fence.is_none());

        let fresh = b.prepare_compressible_read(0x1000, Compbits::NONE).unwrap();
        assert!(fresh.valid_compbits.is_empty());
    }
}
