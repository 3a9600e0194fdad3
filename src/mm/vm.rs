//! Per-client GPU address spaces.
//!
//! A [`Vm`] owns three VA apertures (small pages, big pages, kernel), the
//! page tables, the tree of mapped buffers keyed by GPU VA and the VM's
//! semaphore pool. Every mutation happens under the one per-VM lock.

#![allow(clippy::cast_possible_truncation)]

use super::ApertureAllocator;
use super::aperture::Aperture;
use super::buffer::DmaBuf;
use super::comptags::ComptagAllocator;
use super::kind;
use super::page_table::{
    self, PTE_INVALID, PTE_SPARSE, PageSizeClass, PageTables, PteAttrs, RwFlag, Translation,
};
use crate::config::{GpuConfig, SZ_4K};
use crate::error::{GpuError, GpuResult};
use crate::hw::regs::GpuHw;
use crate::sync::semaphore::{SEMAPHORE_PAGE_SIZE, SemaphorePool, SemaphoreSea};
use crate::utils::{align_up, div_round_up, roundup};
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        const FIXED_OFFSET = 1 << 0;
        const CACHEABLE = 1 << 2;
        const MAPPABLE_COMPBITS = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpaceFlags: u32 {
        const FIXED_OFFSET = 1 << 0;
        const SPARSE = 1 << 1;
    }
}

/// Arguments of a buffer map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapParams {
    kind: u8,
    offset: u64,
    flags: MapFlags,
    buffer_offset: u64,
    mapping_size: u64,
    rw: RwFlag,
}

impl MapParams {
    /// Maps the whole buffer read-write at a VA of the VM's choosing.
    #[must_use]
    pub const fn new(kind: u8) -> Self {
        Self {
            kind,
            offset: 0,
            flags: MapFlags::empty(),
            buffer_offset: 0,
            mapping_size: 0,
            rw: RwFlag::ReadWrite,
        }
    }

    #[must_use]
    pub const fn with_fixed_offset(mut self, gpu_va: u64) -> Self {
        self.offset = gpu_va;
        self.flags = self.flags.union(MapFlags::FIXED_OFFSET);
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    /// Maps `size` bytes starting at `offset` into the buffer. A zero size
    /// means "to the end of the buffer".
    #[must_use]
    pub const fn with_buffer_range(mut self, offset: u64, size: u64) -> Self {
        self.buffer_offset = offset;
        self.mapping_size = size;
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.rw = RwFlag::ReadOnly;
        self
    }

    const fn fixed(&self) -> bool {
        self.flags.contains(MapFlags::FIXED_OFFSET)
    }
}

/// Collects unmaps so one L2 flush and one TLB invalidate cover them all.
#[derive(Debug, Default)]
#[must_use = "a batch must be passed to Vm::batch_finish"]
pub struct MappingBatch {
    need_tlb_invalidate: bool,
    l2_flushed: bool,
}

/// References taken by [`Vm::get_buffers`]; give them back with
/// [`Vm::put_buffers`].
#[derive(Debug, Default)]
pub struct BufferRefs {
    addrs: Vec<u64>,
}

impl BufferRefs {
    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Read-only view of one mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedBufferInfo {
    pub addr: u64,
    pub size: u64,
    pub page_size: PageSizeClass,
    pub kind: u8,
    pub ctag_offset: u32,
    pub ctag_lines: u32,
    pub refcount: u32,
    pub user_mapped: u32,
    pub fixed: bool,
    pub internal: bool,
    pub compbits_window: Option<u64>,
}

/// Result of [`Vm::get_compbits_info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompbitsInfo {
    pub has_compbits: bool,
    pub mappable: bool,
    pub window_size: u64,
    pub window_ctagline: u32,
    pub mapping_ctagline: u32,
}

/// State of every VA allocator and the mapping tree; two snapshots compare
/// equal when nothing was left behind between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaSnapshot {
    pub vmas: [Aperture; 3],
    pub mapped: Vec<(u64, u64)>,
}

#[derive(Debug)]
struct MappedBuffer {
    addr: u64,
    size: u64,
    pgsz: PageSizeClass,
    buf: Arc<DmaBuf>,
    buffer_offset: u64,
    requested_kind: u8,
    kind: u8,
    flags: MapFlags,
    ctag_offset: u32,
    ctag_lines: u32,
    ctags_mappable: bool,
    va_allocated: bool,
    refcount: u32,
    user_mapped: u32,
    compbits_win: Option<u64>,
    internal: bool,
    reservation: Option<u64>,
}

impl MappedBuffer {
    fn info(&self) -> MappedBufferInfo {
        MappedBufferInfo {
            addr: self.addr,
            size: self.size,
            page_size: self.pgsz,
            kind: self.kind,
            ctag_offset: self.ctag_offset,
            ctag_lines: self.ctag_lines,
            refcount: self.refcount,
            user_mapped: self.user_mapped,
            fixed: self.flags.contains(MapFlags::FIXED_OFFSET),
            internal: self.internal,
            compbits_window: self.compbits_win,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    addr: u64,
    size: u64,
    pgsz: PageSizeClass,
    sparse: bool,
}

/// Where a new mapping goes.
#[derive(Debug, Clone, Copy)]
struct Placement {
    addr: u64,
    size: u64,
    class: PageSizeClass,
    va_allocated: bool,
    reservation: Option<u64>,
}

#[derive(Debug)]
struct VmInner {
    vmas: [Aperture; 3],
    ptes: PageTables,
    mapped: BTreeMap<u64, MappedBuffer>,
    reserved: BTreeMap<u64, Reservation>,
    sema_pool: Option<Arc<SemaphorePool>>,
    sea_ro_va: Option<u64>,
}

impl VmInner {
    fn find_containing(&self, va: u64) -> Option<&MappedBuffer> {
        self.mapped
            .range(..=va)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| va < m.addr + m.size)
    }

    fn resolve(&self, va: u64, write: bool) -> Option<(&Arc<DmaBuf>, usize)> {
        if va % 4 != 0 {
            return None;
        }
        let t = self.ptes.translate(va)?;
        if write && page_table::pte_read_only(t.pte) {
            return None;
        }
        let m = self.find_containing(va)?;
        let off = m.buffer_offset + (va - m.addr);
        (off + 4 <= m.buf.size()).then_some((&m.buf, off as usize))
    }
}

/// A GPU virtual address space.
#[derive(Debug)]
pub struct Vm {
    id: u32,
    hw: Arc<GpuHw>,
    comptags: Arc<ComptagAllocator>,
    sea: Arc<SemaphoreSea>,
    compbit_store: Arc<DmaBuf>,
    big_pages: bool,
    big_page_size: u64,
    compressible_page_size: u64,
    compression_page_size: u64,
    comptags_per_cacheline: u64,
    aggregate_cacheline_size: u64,
    unmap_drain_timeout: Duration,
    userspace_managed: bool,
    inner: Mutex<VmInner>,
}

impl Vm {
    /// Creates an empty address space.
    ///
    /// The small-page VMA runs from the low hole to `small_page_va_limit`,
    /// the big-page VMA from there to the kernel reservation at the top.
    /// Without big pages the small VMA covers the whole user range.
    #[must_use]
    pub fn new(
        id: u32,
        cfg: &GpuConfig,
        hw: Arc<GpuHw>,
        comptags: Arc<ComptagAllocator>,
        sea: Arc<SemaphoreSea>,
        compbit_store: Arc<DmaBuf>,
        userspace_managed: bool,
    ) -> Arc<Self> {
        let kernel_start = cfg.va_limit - cfg.kernel_reserved;
        let (small, big) = if cfg.big_pages {
            (
                Aperture::new(cfg.low_hole, cfg.small_page_va_limit, SZ_4K),
                Aperture::new(cfg.small_page_va_limit, kernel_start, cfg.big_page_size),
            )
        } else {
            (
                Aperture::new(cfg.low_hole, kernel_start, SZ_4K),
                Aperture::new(kernel_start, kernel_start, cfg.big_page_size),
            )
        };
        let kernel = Aperture::new(kernel_start, cfg.va_limit, SZ_4K);
        log::debug!(
            "vm {id}: small [0x{:x}, 0x{:x}) big [0x{:x}, 0x{:x}) kernel [0x{kernel_start:x}, 0x{:x})",
            small.bounds().0,
            small.bounds().1,
            big.bounds().0,
            big.bounds().1,
            cfg.va_limit
        );

        Arc::new(Self {
            id,
            hw,
            comptags,
            sea,
            compbit_store,
            big_pages: cfg.big_pages,
            big_page_size: cfg.big_page_size,
            compressible_page_size: cfg.compressible_page_size,
            compression_page_size: cfg.compression_page_size,
            comptags_per_cacheline: u64::from(cfg.comptags_per_cacheline.max(1)),
            aggregate_cacheline_size: cfg.aggregate_cacheline_size(),
            unmap_drain_timeout: Duration::from_millis(u64::from(cfg.gr_idle_timeout_ms)),
            userspace_managed,
            inner: Mutex::new(VmInner {
                vmas: [small, big, kernel],
                ptes: PageTables::new(cfg.va_limit, cfg.big_page_size),
                mapped: BTreeMap::new(),
                reserved: BTreeMap::new(),
                sema_pool: None,
                sea_ro_va: None,
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn userspace_managed(&self) -> bool {
        self.userspace_managed
    }

    #[must_use]
    pub const fn big_pages(&self) -> bool {
        self.big_pages
    }

    #[must_use]
    pub fn page_size(&self, class: PageSizeClass) -> u64 {
        match class {
            PageSizeClass::Big => self.big_page_size,
            PageSizeClass::Small | PageSizeClass::Kernel => SZ_4K,
        }
    }

    /// Largest page class the buffer's scatter-list alignment allows.
    fn buffer_page_class(&self, align: u64) -> PageSizeClass {
        if self.big_pages && align != 0 && align % self.big_page_size == 0 {
            PageSizeClass::Big
        } else {
            PageSizeClass::Small
        }
    }

    fn region_class(inner: &VmInner, addr: u64) -> GpuResult<PageSizeClass> {
        if inner.vmas[PageSizeClass::Small.index()].contains(addr) {
            Ok(PageSizeClass::Small)
        } else if inner.vmas[PageSizeClass::Big.index()].contains(addr) {
            Ok(PageSizeClass::Big)
        } else {
            Err(GpuError::invalid(format!("va 0x{addr:x} outside user VMAs")))
        }
    }

    fn flush(&self, batch: Option<&mut MappingBatch>, l2: bool) {
        match batch {
            Some(b) => {
                if l2 && !b.l2_flushed {
                    self.hw.l2_flush();
                    b.l2_flushed = true;
                }
                b.need_tlb_invalidate = true;
            }
            None => {
                if l2 {
                    self.hw.l2_flush();
                }
                self.hw.tlb_invalidate();
            }
        }
    }

    // ===========================================================================================
    // Batches
    // ===========================================================================================

    pub fn batch_start(&self) -> MappingBatch {
        MappingBatch::default()
    }

    pub fn batch_finish(&self, batch: MappingBatch) {
        if batch.need_tlb_invalidate {
            self.hw.tlb_invalidate();
        }
    }

    // ===========================================================================================
    // Map
    // ===========================================================================================

    /// Maps `buf` for a user and returns its GPU VA.
    ///
    /// A non-fixed map of a buffer already mapped with the same kind, flags
    /// and range returns the existing VA with its refcount raised.
    ///
    /// # Errors
    /// - `BadAddress` for a non-fixed map on a userspace-managed VM.
    /// - `InvalidArgument` for an unsupported kind, a range past the end of
    ///   the buffer, or a fixed offset that fails validation.
    /// - `OutOfMemory` when the VMA is exhausted.
    ///
    /// No state is left behind on any error.
    pub fn map(&self, buf: &Arc<DmaBuf>, params: MapParams) -> GpuResult<u64> {
        let mut inner = self.inner.lock();
        self.map_locked(&mut inner, buf, &params, None)
    }

    /// Like [`Vm::map`], deferring the TLB invalidate to `batch`.
    ///
    /// # Errors
    /// Same as [`Vm::map`].
    pub fn map_batched(
        &self,
        buf: &Arc<DmaBuf>,
        params: MapParams,
        batch: &mut MappingBatch,
    ) -> GpuResult<u64> {
        let mut inner = self.inner.lock();
        self.map_locked(&mut inner, buf, &params, Some(batch))
    }

    fn map_locked(
        &self,
        inner: &mut VmInner,
        buf: &Arc<DmaBuf>,
        p: &MapParams,
        batch: Option<&mut MappingBatch>,
    ) -> GpuResult<u64> {
        let fixed = p.fixed();
        if self.userspace_managed && !fixed {
            return Err(GpuError::fault("non-fixed map on userspace-managed vm"));
        }
        let kind_info =
            kind::info(p.kind).ok_or_else(|| GpuError::invalid(format!("kind 0x{:x}", p.kind)))?;

        let backed = if p.mapping_size == 0 {
            buf.size().saturating_sub(p.buffer_offset)
        } else {
            p.mapping_size
        };
        if backed == 0
            || p
                .buffer_offset
                .checked_add(backed)
                .is_none_or(|end| end > buf.size())
        {
            return Err(GpuError::invalid(format!(
                "range 0x{:x}+0x{backed:x} outside buffer of 0x{:x}",
                p.buffer_offset,
                buf.size()
            )));
        }

        if !self.userspace_managed
            && let Some(m) = inner.mapped.values_mut().find(|m| {
                !m.internal
                    && Arc::ptr_eq(&m.buf, buf)
                    && m.requested_kind == p.kind
                    && m.flags == p.flags
                    && m.buffer_offset == p.buffer_offset
                    && (!fixed || m.addr == p.offset)
            })
        {
            m.refcount += 1;
            m.user_mapped += 1;
            log::trace!("vm {}: reusing mapping at 0x{:x}", self.id, m.addr);
            return Ok(m.addr);
        }

        buf.pin()?;
        let res = self.map_pinned(inner, buf, p, kind_info, backed, batch);
        if res.is_err() {
            buf.unpin();
        }
        res
    }

    fn map_pinned(
        &self,
        inner: &mut VmInner,
        buf: &Arc<DmaBuf>,
        p: &MapParams,
        kind_info: kind::KindInfo,
        backed: u64,
        batch: Option<&mut MappingBatch>,
    ) -> GpuResult<u64> {
        let mut class = self.buffer_page_class(buf.align());
        if p.fixed() {
            let region = Self::region_class(inner, p.offset)?;
            if region > class {
                return Err(GpuError::invalid(format!(
                    "fixed va 0x{:x} needs {region:?} pages, buffer allows {class:?}",
                    p.offset
                )));
            }
            class = region;
        }
        let page = self.page_size(class);

        let mut kind = kind_info.kind;
        let mut ctag_lines = 0;
        if kind_info.compressible {
            if page < self.compressible_page_size {
                log::debug!(
                    "vm {}: kind 0x{kind:x} needs 0x{:x} pages, using 0x{:x}",
                    self.id,
                    self.compressible_page_size,
                    kind_info.uncompressed
                );
                kind = kind_info.uncompressed;
            } else {
                ctag_lines = div_round_up(buf.size(), self.compression_page_size) as u32;
            }
        }

        if ctag_lines > 0 && buf.comptags().offset == 0 {
            let mappable = p.flags.contains(MapFlags::MAPPABLE_COMPBITS);
            match self.comptags.alloc_for_buffer(ctag_lines, mappable) {
                Ok((tags, window)) => buf.set_comptags(tags, window, Arc::clone(&self.comptags)),
                Err(e) => {
                    log::warn!(
                        "vm {}: no comptags for {ctag_lines} lines ({e}), mapping uncompressed",
                        self.id
                    );
                    kind = kind_info.uncompressed;
                    ctag_lines = 0;
                }
            }
        }
        let tags = buf.comptags();
        let ctag_offset = if ctag_lines > 0 { tags.offset } else { 0 };

        let mut size = backed;
        if ctag_lines > 0 {
            size = roundup(size, self.compression_page_size);
        }

        let placement = if p.fixed() {
            let reservation = self.validate_fixed(inner, p.offset, size, class)?;
            Placement {
                addr: p.offset,
                size,
                class,
                va_allocated: false,
                reservation,
            }
        } else {
            let addr = inner.vmas[class.index()]
                .allocate_va(size, page)
                .ok_or(GpuError::OutOfMemory)?;
            Placement {
                addr,
                size,
                class,
                va_allocated: true,
                reservation: None,
            }
        };

        let attrs = PteAttrs {
            kind,
            rw: p.rw,
            cacheable: p.flags.contains(MapFlags::CACHEABLE),
            ..PteAttrs::default()
        };
        self.write_mapping(inner, buf, &placement, p.buffer_offset, backed, attrs, ctag_offset)?;
        self.flush(batch, false);

        inner.mapped.insert(
            placement.addr,
            MappedBuffer {
                addr: placement.addr,
                size,
                pgsz: class,
                buf: Arc::clone(buf),
                buffer_offset: p.buffer_offset,
                requested_kind: p.kind,
                kind,
                flags: p.flags,
                ctag_offset,
                ctag_lines,
                ctags_mappable: ctag_lines > 0 && tags.user_mappable,
                va_allocated: placement.va_allocated,
                refcount: 1,
                user_mapped: 1,
                compbits_win: None,
                internal: false,
                reservation: placement.reservation,
            },
        );
        log::debug!(
            "vm {}: mapped 0x{:x}+0x{size:x} {class:?} kind 0x{kind:x} ctag {ctag_offset}",
            self.id,
            placement.addr
        );
        Ok(placement.addr)
    }

    /// Writes the PTEs of a new mapping. Pages past the backed range stay
    /// invalid. The VA is released again if the write fails.
    #[allow(clippy::too_many_arguments)]
    fn write_mapping(
        &self,
        inner: &mut VmInner,
        buf: &DmaBuf,
        at: &Placement,
        buffer_offset: u64,
        backed: u64,
        attrs: PteAttrs,
        ctag_offset: u32,
    ) -> GpuResult<()> {
        let page = self.page_size(at.class);
        let ctag_granularity = self.compression_page_size;
        let res = inner
            .ptes
            .update(at.addr, align_up(at.size, page), at.class, |off| {
                if off >= backed {
                    return PTE_INVALID;
                }
                let boff = buffer_offset + off;
                match buf.phys_at(boff) {
                    Some(phys) => {
                        let comptagline = if ctag_offset == 0 {
                            0
                        } else {
                            ctag_offset + (boff / ctag_granularity) as u32
                        };
                        page_table::encode_pte(
                            phys,
                            &PteAttrs {
                                comptagline,
                                ..attrs
                            },
                        )
                    }
                    None => PTE_INVALID,
                }
            });
        if let Err(e) = res {
            if at.va_allocated {
                inner.vmas[at.class.index()].free_va(at.addr);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Checks a fixed-offset request and returns the reservation holding it.
    fn validate_fixed(
        &self,
        inner: &VmInner,
        offset: u64,
        size: u64,
        class: PageSizeClass,
    ) -> GpuResult<Option<u64>> {
        let page = self.page_size(class);
        let end = offset
            .checked_add(size)
            .filter(|&end| end > offset)
            .ok_or_else(|| GpuError::invalid(format!("fixed 0x{offset:x}+0x{size:x} overflows")))?;
        if offset % page != 0 {
            return Err(GpuError::invalid(format!(
                "fixed 0x{offset:x} not aligned to 0x{page:x}"
            )));
        }
        let user_start = inner.vmas[PageSizeClass::Small.index()].bounds().0;
        let user_end = inner.vmas[PageSizeClass::Kernel.index()].bounds().0;
        if offset < user_start || end > user_end {
            return Err(GpuError::invalid(format!(
                "fixed 0x{offset:x}+0x{size:x} outside user VMAs"
            )));
        }

        let reservation = inner
            .reserved
            .range(..=offset)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| offset < r.addr + r.size);
        match reservation {
            None if !self.userspace_managed => {
                return Err(GpuError::invalid(format!(
                    "fixed 0x{offset:x} not in a reserved range"
                )));
            }
            Some(r) if end > r.addr + r.size => {
                return Err(GpuError::invalid(format!(
                    "fixed 0x{offset:x}+0x{size:x} extends past reservation 0x{:x}+0x{:x}",
                    r.addr, r.size
                )));
            }
            _ => {}
        }

        if let Some((_, m)) = inner.mapped.range(..end).next_back()
            && m.addr + m.size > offset
        {
            return Err(GpuError::invalid(format!(
                "fixed 0x{offset:x}+0x{size:x} overlaps mapping at 0x{:x}",
                m.addr
            )));
        }
        Ok(reservation.map(|r| r.addr))
    }

    /// Maps `size` bytes of `buf` at `buffer_offset` as an internal mapping
    /// with refcount 1.
    #[allow(clippy::too_many_arguments)]
    fn map_internal(
        &self,
        inner: &mut VmInner,
        buf: &Arc<DmaBuf>,
        buffer_offset: u64,
        size: u64,
        class: PageSizeClass,
        rw: RwFlag,
        fixed: Option<(u64, Option<u64>)>,
    ) -> GpuResult<u64> {
        buf.pin()?;
        let placement = match fixed {
            Some((addr, reservation)) => Placement {
                addr,
                size,
                class,
                va_allocated: false,
                reservation,
            },
            None => {
                let Some(addr) =
                    inner.vmas[class.index()].allocate_va(size, self.page_size(class))
                else {
                    buf.unpin();
                    return Err(GpuError::OutOfMemory);
                };
                Placement {
                    addr,
                    size,
                    class,
                    va_allocated: true,
                    reservation: None,
                }
            }
        };
        let attrs = PteAttrs {
            kind: kind::PITCH,
            rw,
            privileged: class == PageSizeClass::Kernel,
            ..PteAttrs::default()
        };
        if let Err(e) = self.write_mapping(inner, buf, &placement, buffer_offset, size, attrs, 0) {
            buf.unpin();
            return Err(e);
        }
        self.hw.tlb_invalidate();

        inner.mapped.insert(
            placement.addr,
            MappedBuffer {
                addr: placement.addr,
                size,
                pgsz: class,
                buf: Arc::clone(buf),
                buffer_offset,
                requested_kind: kind::PITCH,
                kind: kind::PITCH,
                flags: if fixed.is_some() {
                    MapFlags::FIXED_OFFSET
                } else {
                    MapFlags::empty()
                },
                ctag_offset: 0,
                ctag_lines: 0,
                ctags_mappable: false,
                va_allocated: placement.va_allocated,
                refcount: 1,
                user_mapped: 0,
                compbits_win: None,
                internal: true,
                reservation: placement.reservation,
            },
        );
        Ok(placement.addr)
    }

    /// Maps a driver-owned buffer (gpfifo, private command buffer) into the
    /// kernel VMA.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when the kernel VMA is exhausted.
    pub fn map_kernel(&self, buf: &Arc<DmaBuf>, rw: RwFlag) -> GpuResult<u64> {
        let mut inner = self.inner.lock();
        self.map_internal(
            &mut inner,
            buf,
            0,
            buf.size(),
            PageSizeClass::Kernel,
            rw,
            None,
        )
    }

    /// Unmaps a buffer mapped with [`Vm::map_kernel`].
    ///
    /// # Errors
    /// * `BadAddress` if `va` is not an internal mapping.
    /// * `InvalidArgument` for mappings the VM manages itself: compbits
    ///   windows and the semaphore sea.
    pub fn unmap_kernel(&self, va: u64) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let pool_rw = inner.sema_pool.as_ref().and_then(|p| p.rw_va());
        match inner.mapped.get(&va) {
            Some(m) if !m.internal => {
                return Err(GpuError::fault(format!("no kernel mapping at 0x{va:x}")));
            }
            Some(m)
                if m.pgsz != PageSizeClass::Kernel
                    || inner.sea_ro_va == Some(va)
                    || pool_rw == Some(va) =>
            {
                return Err(GpuError::invalid(format!(
                    "vm {}: mapping at 0x{va:x} is owned by the vm",
                    self.id
                )));
            }
            Some(_) => {}
            None => return Err(GpuError::fault(format!("no kernel mapping at 0x{va:x}"))),
        }
        self.put_locked(&mut inner, va, None);
        Ok(())
    }

    // ===========================================================================================
    // Unmap
    // ===========================================================================================

    /// Drops the user's mapping at `va`.
    ///
    /// The node stays until every other holder (jobs) has put its
    /// reference. For a fixed mapping the call first waits, bounded by the
    /// idle timeout, for those holders to go away.
    ///
    /// # Errors
    /// Returns `BadAddress` if `va` is not a user mapping.
    pub fn unmap(&self, va: u64) -> GpuResult<()> {
        self.unmap_inner(va, None)
    }

    /// # Errors
    /// Same as [`Vm::unmap`].
    pub fn unmap_batched(&self, va: u64, batch: &mut MappingBatch) -> GpuResult<()> {
        self.unmap_inner(va, Some(batch))
    }

    fn unmap_inner(&self, va: u64, batch: Option<&mut MappingBatch>) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let user_node = |inner: &VmInner| {
            inner
                .mapped
                .get(&va)
                .filter(|m| !m.internal && m.user_mapped > 0)
                .map(|m| (m.refcount, m.flags.contains(MapFlags::FIXED_OFFSET)))
        };
        let Some((_, fixed)) = user_node(&*inner) else {
            log::warn!("vm {}: unmap of unknown va 0x{va:x}", self.id);
            return Err(GpuError::fault(format!("no user mapping at 0x{va:x}")));
        };

        if fixed {
            let deadline = Instant::now() + self.unmap_drain_timeout;
            loop {
                match user_node(&*inner) {
                    None => return Err(GpuError::fault(format!("0x{va:x} unmapped meanwhile"))),
                    Some((1, _)) => break,
                    Some((refs, _)) if Instant::now() >= deadline => {
                        log::warn!(
                            "vm {}: fixed unmap of 0x{va:x} with {refs} refs outstanding",
                            self.id
                        );
                        break;
                    }
                    Some(_) => MutexGuard::unlocked(&mut inner, || {
                        std::thread::sleep(Duration::from_millis(1));
                    }),
                }
            }
        }

        if let Some(m) = inner.mapped.get_mut(&va) {
            m.user_mapped -= 1;
        }
        self.put_locked(&mut inner, va, batch);
        Ok(())
    }

    /// Drops one reference; the mapping is torn down at zero.
    fn put_locked(&self, inner: &mut VmInner, va: u64, batch: Option<&mut MappingBatch>) {
        let Some(m) = inner.mapped.get_mut(&va) else {
            log::error!("vm {}: put of unknown mapping 0x{va:x}", self.id);
            return;
        };
        m.refcount -= 1;
        if m.refcount > 0 {
            return;
        }
        let Some(node) = inner.mapped.remove(&va) else {
            return;
        };
        self.teardown(inner, node, batch);
    }

    fn teardown(&self, inner: &mut VmInner, node: MappedBuffer, mut batch: Option<&mut MappingBatch>) {
        if let Some(win) = node.compbits_win {
            self.put_locked(inner, win, batch.as_deref_mut());
        }

        let sparse = node
            .reservation
            .and_then(|r| inner.reserved.get(&r))
            .is_some_and(|r| r.sparse);
        let fill = if sparse { PTE_SPARSE } else { PTE_INVALID };
        let len = align_up(node.size, self.page_size(node.pgsz));
        if let Err(e) = inner.ptes.update(node.addr, len, node.pgsz, |_| fill) {
            log::error!("vm {}: clearing ptes at 0x{:x}: {e}", self.id, node.addr);
        }
        if node.va_allocated {
            inner.vmas[node.pgsz.index()].free_va(node.addr);
        }
        node.buf.unpin();
        self.flush(batch, true);
        log::debug!("vm {}: unmapped 0x{:x}+0x{:x}", self.id, node.addr, node.size);
    }

    // ===========================================================================================
    // Buffer references for jobs
    // ===========================================================================================

    /// Takes one reference on every mapped buffer.
    pub fn get_buffers(&self) -> BufferRefs {
        let mut inner = self.inner.lock();
        let addrs = inner
            .mapped
            .values_mut()
            .map(|m| {
                m.refcount += 1;
                m.addr
            })
            .collect();
        BufferRefs { addrs }
    }

    /// Returns references taken by [`Vm::get_buffers`] under one batch.
    pub fn put_buffers(&self, refs: BufferRefs) {
        let mut batch = self.batch_start();
        {
            let mut inner = self.inner.lock();
            for va in refs.addrs {
                self.put_locked(&mut inner, va, Some(&mut batch));
            }
        }
        self.batch_finish(batch);
    }

    // ===========================================================================================
    // Compbits window
    // ===========================================================================================

    /// Maps the comptag backing store of the buffer mapped at `mapping_va`
    /// read-only and returns the window's VA. Repeated calls return the same
    /// window.
    ///
    /// # Errors
    /// - `BadAddress` if `mapping_va` is not a user mapping with mappable
    ///   comptags, or the window fixedness does not suit the VM.
    /// - `InvalidArgument` if a fixed window is requested at an address other
    ///   than the existing window, or inside reserved space.
    pub fn map_compbits(&self, mapping_va: u64, fixed: Option<u64>) -> GpuResult<u64> {
        let mut inner = self.inner.lock();
        let m = inner
            .mapped
            .get(&mapping_va)
            .filter(|m| m.user_mapped > 0)
            .ok_or_else(|| GpuError::fault(format!("no user mapping at 0x{mapping_va:x}")))?;
        if !m.ctags_mappable {
            return Err(GpuError::fault(format!("0x{mapping_va:x} has no mappable comptags")));
        }
        if self.userspace_managed != fixed.is_some() {
            return Err(GpuError::fault(if self.userspace_managed {
                "compbits window must be fixed on a userspace-managed vm"
            } else {
                "compbits window must not be fixed"
            }));
        }

        if let Some(win) = m.compbits_win {
            if fixed.is_some_and(|f| f != win) {
                return Err(GpuError::invalid(format!(
                    "compbits window already at 0x{win:x}"
                )));
            }
            return Ok(win);
        }

        let window = m.buf.compbits_window().unwrap_or_default();
        if window.size == 0 {
            return Err(GpuError::fault("compbits window of size 0"));
        }
        let start = u64::from(window.ctagline) / self.comptags_per_cacheline
            * self.aggregate_cacheline_size;

        let fixed = match fixed {
            Some(addr) => {
                if self
                    .validate_fixed(&inner, addr, window.size, PageSizeClass::Small)?
                    .is_some()
                {
                    return Err(GpuError::invalid(format!(
                        "compbits window 0x{addr:x} inside reserved space"
                    )));
                }
                Some((addr, None))
            }
            None => None,
        };
        let store = Arc::clone(&self.compbit_store);
        let win = self.map_internal(
            &mut inner,
            &store,
            start,
            window.size,
            PageSizeClass::Small,
            RwFlag::ReadOnly,
            fixed,
        )?;
        if let Some(m) = inner.mapped.get_mut(&mapping_va) {
            m.compbits_win = Some(win);
        }
        log::debug!("vm {}: compbits window for 0x{mapping_va:x} at 0x{win:x}", self.id);
        Ok(win)
    }

    /// # Errors
    /// Returns `BadAddress` if `mapping_va` is not a user mapping.
    pub fn get_compbits_info(&self, mapping_va: u64) -> GpuResult<CompbitsInfo> {
        let inner = self.inner.lock();
        let m = inner
            .mapped
            .get(&mapping_va)
            .filter(|m| m.user_mapped > 0)
            .ok_or_else(|| GpuError::fault(format!("no user mapping at 0x{mapping_va:x}")))?;

        let mut info = CompbitsInfo {
            has_compbits: m.ctag_offset != 0,
            ..CompbitsInfo::default()
        };
        if m.ctags_mappable {
            let window = m.buf.compbits_window().unwrap_or_default();
            info.mappable = true;
            info.window_size = window.size;
            info.window_ctagline = window.ctagline;
            info.mapping_ctagline = m.ctag_offset;
        }
        Ok(info)
    }

    // ===========================================================================================
    // Reserved space
    // ===========================================================================================

    /// Reserves `pages` pages of `page_size` and returns the start address.
    ///
    /// # Errors
    /// - `InvalidArgument` for a page size other than 4K or the big page
    ///   size, zero pages, or a fixed offset in the wrong VMA.
    /// - `Unsupported` for a sparse reservation of small pages.
    /// - `OutOfMemory` if the range cannot be reserved.
    pub fn alloc_space(
        &self,
        pages: u32,
        page_size: u64,
        flags: SpaceFlags,
        offset: u64,
    ) -> GpuResult<u64> {
        let class = if page_size == SZ_4K {
            PageSizeClass::Small
        } else if self.big_pages && page_size == self.big_page_size {
            PageSizeClass::Big
        } else {
            return Err(GpuError::invalid(format!("space page size 0x{page_size:x}")));
        };
        let sparse = flags.contains(SpaceFlags::SPARSE);
        if sparse && class != PageSizeClass::Big {
            return Err(GpuError::Unsupported("sparse small-page space".into()));
        }
        let size = u64::from(pages) * page_size;
        if size == 0 {
            return Err(GpuError::invalid("empty space reservation"));
        }

        let mut inner = self.inner.lock();
        let addr = if flags.contains(SpaceFlags::FIXED_OFFSET) {
            if Self::region_class(&inner, offset)? != class {
                return Err(GpuError::invalid(format!(
                    "0x{offset:x} is not in the {class:?} VMA"
                )));
            }
            inner.vmas[class.index()]
                .allocate_fixed(offset, size)
                .ok_or(GpuError::OutOfMemory)?
        } else {
            inner.vmas[class.index()]
                .allocate_va(size, page_size)
                .ok_or(GpuError::OutOfMemory)?
        };

        if sparse {
            if let Err(e) = inner.ptes.update(addr, size, class, |_| PTE_SPARSE) {
                inner.vmas[class.index()].free_va(addr);
                return Err(e);
            }
            self.hw.tlb_invalidate();
        }
        inner.reserved.insert(
            addr,
            Reservation {
                addr,
                size,
                pgsz: class,
                sparse,
            },
        );
        log::debug!(
            "vm {}: reserved 0x{addr:x}+0x{size:x} {class:?}{}",
            self.id,
            if sparse { " sparse" } else { "" }
        );
        Ok(addr)
    }

    /// Releases the reservation at `offset`.
    ///
    /// Every buffer mapped inside loses one reference. Buffers that survive
    /// keep their VA as an ordinary allocation.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if no reservation starts at `offset`.
    pub fn free_space(&self, offset: u64) -> GpuResult<()> {
        let mut batch = self.batch_start();
        {
            let mut inner = self.inner.lock();
            let res = *inner
                .reserved
                .get(&offset)
                .ok_or_else(|| GpuError::invalid(format!("no reservation at 0x{offset:x}")))?;
            let end = res.addr + res.size;

            let members: Vec<u64> = inner
                .mapped
                .range(res.addr..end)
                .filter(|(_, m)| m.reservation == Some(offset))
                .map(|(&va, _)| va)
                .collect();
            for va in &members {
                self.put_locked(&mut inner, *va, Some(&mut batch));
            }

            inner.reserved.remove(&offset);
            inner.vmas[res.pgsz.index()].free_va(res.addr);

            let mut survivors = Vec::new();
            for va in members {
                if let Some(m) = inner.mapped.get_mut(&va) {
                    m.reservation = None;
                    m.va_allocated = true;
                    survivors.push((m.addr, align_up(m.size, self.page_size(m.pgsz))));
                }
            }
            for &(addr, len) in &survivors {
                if inner.vmas[res.pgsz.index()].allocate_fixed(addr, len).is_none() {
                    log::error!("vm {}: could not keep va 0x{addr:x} of survivor", self.id);
                }
            }

            if res.sparse {
                let mut cursor = res.addr;
                for (addr, len) in survivors.into_iter().chain([(end, 0)]) {
                    if addr > cursor
                        && let Err(e) =
                            inner.ptes.update(cursor, addr - cursor, res.pgsz, |_| PTE_INVALID)
                    {
                        log::error!("vm {}: clearing sparse 0x{cursor:x}: {e}", self.id);
                    }
                    cursor = cursor.max(addr + len);
                }
                batch.need_tlb_invalidate = true;
            }
            log::debug!("vm {}: freed space 0x{offset:x}", self.id);
        }
        self.batch_finish(batch);
        Ok(())
    }

    // ===========================================================================================
    // Semaphores
    // ===========================================================================================

    fn ensure_sea_mapped(&self, inner: &mut VmInner) -> GpuResult<u64> {
        if let Some(va) = inner.sea_ro_va {
            return Ok(va);
        }
        let sea = Arc::clone(self.sea.buffer());
        let va = self.map_internal(
            inner,
            &sea,
            0,
            sea.size(),
            PageSizeClass::Kernel,
            RwFlag::ReadOnly,
            None,
        )?;
        inner.sea_ro_va = Some(va);
        Ok(va)
    }

    /// Read-only VA of the whole semaphore sea in this VM.
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the kernel VMA is exhausted.
    pub fn sea_ro_va(&self) -> GpuResult<u64> {
        let mut inner = self.inner.lock();
        self.ensure_sea_mapped(&mut inner)
    }

    /// The VM's semaphore pool, allocated and mapped on first use.
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the sea has no free page or the kernel VMA
    /// is exhausted.
    pub fn semaphore_pool(&self) -> GpuResult<Arc<SemaphorePool>> {
        let mut inner = self.inner.lock();
        if let Some(pool) = &inner.sema_pool {
            return Ok(Arc::clone(pool));
        }
        self.ensure_sea_mapped(&mut inner)?;
        let pool = self.sea.alloc_pool()?;
        let sea = Arc::clone(self.sea.buffer());
        let rw = self.map_internal(
            &mut inner,
            &sea,
            pool.sea_offset(),
            SEMAPHORE_PAGE_SIZE as u64,
            PageSizeClass::Kernel,
            RwFlag::ReadWrite,
            None,
        )?;
        pool.set_rw_va(rw);
        inner.sema_pool = Some(Arc::clone(&pool));
        log::debug!("vm {}: semaphore pool page {} rw at 0x{rw:x}", self.id, pool.page());
        Ok(pool)
    }

    #[must_use]
    pub fn allocated_semaphore_pool(&self) -> Option<Arc<SemaphorePool>> {
        self.inner.lock().sema_pool.clone()
    }

    // ===========================================================================================
    // GPU-side access
    // ===========================================================================================

    /// A 32-bit read as the GPU would perform it through this VM's tables.
    #[must_use]
    pub fn gpu_read_u32(&self, va: u64) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .resolve(va, false)
            .map(|(buf, off)| buf.memory().read_u32(off))
    }

    /// A 32-bit write through this VM. Fails on unmapped or read-only pages.
    pub fn gpu_write_u32(&self, va: u64, value: u32) -> bool {
        let inner = self.inner.lock();
        match inner.resolve(va, true) {
            Some((buf, off)) => {
                buf.memory().write_u32(off, value);
                true
            }
            None => false,
        }
    }

    /// Reads `count` words starting at `va`; `None` if any is unmapped.
    #[must_use]
    pub fn gpu_read_words(&self, va: u64, count: usize) -> Option<Vec<u32>> {
        let inner = self.inner.lock();
        (0..count as u64)
            .map(|i| {
                inner
                    .resolve(va + i * 4, false)
                    .map(|(buf, off)| buf.memory().read_u32(off))
            })
            .collect()
    }

    // ===========================================================================================
    // Inspection
    // ===========================================================================================

    #[must_use]
    pub fn mapping(&self, va: u64) -> Option<MappedBufferInfo> {
        self.inner.lock().mapped.get(&va).map(MappedBuffer::info)
    }

    #[must_use]
    pub fn mappings(&self) -> Vec<MappedBufferInfo> {
        self.inner.lock().mapped.values().map(MappedBuffer::info).collect()
    }

    #[must_use]
    pub fn translate(&self, va: u64) -> Option<Translation> {
        self.inner.lock().ptes.translate(va)
    }

    #[must_use]
    pub fn pte(&self, va: u64, class: PageSizeClass) -> Option<[u32; 2]> {
        self.inner.lock().ptes.pte(va, class)
    }

    #[must_use]
    pub fn va_snapshot(&self) -> VaSnapshot {
        let inner = self.inner.lock();
        VaSnapshot {
            vmas: inner.vmas.clone(),
            mapped: inner.mapped.values().map(|m| (m.addr, m.size)).collect(),
        }
    }

    #[must_use]
    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "vm {}{}: {} mappings, {} reservations, {} pte tables",
            self.id,
            if self.userspace_managed { " (userspace managed)" } else { "" },
            inner.mapped.len(),
            inner.reserved.len(),
            inner.ptes.table_count()
        );
        for m in inner.mapped.values() {
            let _ = writeln!(
                out,
                "  0x{:010x}+0x{:08x} {:?} kind 0x{:02x} ctag {:5} refs {} user {}{}",
                m.addr,
                m.size,
                m.pgsz,
                m.kind,
                m.ctag_offset,
                m.refcount,
                m.user_mapped,
                if m.internal { " internal" } else { "" }
            );
        }
        for r in inner.reserved.values() {
            let _ = writeln!(
                out,
                "  reserved 0x{:010x}+0x{:08x} {:?}{}",
                r.addr,
                r.size,
                r.pgsz,
                if r.sparse { " sparse" } else { "" }
            );
        }
        out.push_str(&inner.ptes.dump());
        out
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let leaked = inner.mapped.values().filter(|m| !m.internal).count();
        if leaked > 0 {
            log::warn!("vm {}: dropped with {leaked} user mappings", self.id);
        }
        for m in inner.mapped.values() {
            m.buf.unpin();
        }
        inner.mapped.clear();
        inner.sema_pool = None;
        log::debug!("vm {}: destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SZ_64K;

    fn vm_with(cfg: &GpuConfig, userspace_managed: bool) -> Arc<Vm> {
        let hw = Arc::new(GpuHw::new(cfg.num_channels, cfg.num_runlists));
        let comptags = Arc::new(ComptagAllocator::new(cfg));
        let sea = SemaphoreSea::new(cfg.semaphore_pool_count).unwrap();
        let store = DmaBuf::new(0x10_0000).unwrap();
        Vm::new(1, cfg, hw, comptags, sea, store, userspace_managed)
    }

    fn vm() -> Arc<Vm> {
        vm_with(&GpuConfig::new(), false)
    }

    #[test]
    fn page_size_follows_alignment() {
        let vm = vm();
        let big = DmaBuf::with_chunks(&[(0x100_0000, 0x2_0000)]).unwrap();
        let small = DmaBuf::with_chunks(&[(0x200_1000, 0x2_0000)]).unwrap();

        let a = vm.map(&big, MapParams::new(kind::PITCH)).unwrap();
        let b = vm.map(&small, MapParams::new(kind::PITCH)).unwrap();
        assert_eq!(vm.mapping(a).unwrap().page_size, PageSizeClass::Big);
        assert_eq!(vm.mapping(b).unwrap().page_size, PageSizeClass::Small);
        assert!(a >= GpuConfig::new().small_page_va_limit);

        let t = vm.translate(a + 0x1_0010).unwrap();
        assert_eq!(t.phys, 0x101_0010);
        assert_eq!(t.page_size, SZ_64K);
    }

    #[test]
    fn repeated_map_reuses_node() {
        let vm = vm();
        let buf = DmaBuf::new(0x2_0000).unwrap();
        let a = vm.map(&buf, MapParams::new(kind::PITCH)).unwrap();
        let b = vm.map(&buf, MapParams::new(kind::PITCH)).unwrap();
        assert_eq!(a, b);
        assert_eq!(vm.mapping(a).unwrap().refcount, 2);
        assert_eq!(buf.pin_count(), 1);

        let c = vm.map(&buf, MapParams::new(kind::Z16)).unwrap();
        assert_ne!(a, c);

        vm.unmap(a).unwrap();
        assert!(vm.mapping(a).is_some());
        vm.unmap(a).unwrap();
        assert!(vm.mapping(a).is_none());
        vm.unmap(c).unwrap();
        assert_eq!(buf.pin_count(), 0);
    }

    #[test]
    fn unsupported_kind_leaves_no_state() {
        let vm = vm();
        let buf = DmaBuf::new(0x1_0000).unwrap();
        let before = vm.va_snapshot();
        assert!(matches!(
            vm.map(&buf, MapParams::new(0x42)),
            Err(GpuError::InvalidArgument(_))
        ));
        assert_eq!(vm.va_snapshot(), before);
        assert_eq!(buf.pin_count(), 0);
    }

    #[test]
    fn compressible_kind_falls_back_on_small_pages() {
        let vm = vm();
        let buf = DmaBuf::with_chunks(&[(0x300_1000, 0x4_0000)]).unwrap();
        let va = vm.map(&buf, MapParams::new(kind::C32_2C)).unwrap();
        let m = vm.mapping(va).unwrap();
        assert_eq!(m.kind, kind::GENERIC_16BX2);
        assert_eq!(m.ctag_lines, 0);
        assert_eq!(buf.comptags().offset, 0);
    }

    #[test]
    fn comptag_exhaustion_maps_uncompressed() {
        let cfg = GpuConfig::new().with_comptag_lines(2);
        let vm = vm_with(&cfg, false);
        let buf = DmaBuf::new(0x8_0000).unwrap();
        let va = vm.map(&buf, MapParams::new(kind::Z16_2C)).unwrap();
        let m = vm.mapping(va).unwrap();
        assert_eq!(m.kind, kind::Z16);
        assert_eq!(m.ctag_offset, 0);
        assert_eq!(m.size, 0x8_0000);
    }

    #[test]
    fn compressible_ptes_carry_comptag_lines() {
        let vm = vm();
        let buf = DmaBuf::new(0x4_0000).unwrap();
        let va = vm.map(&buf, MapParams::new(kind::C32_2C)).unwrap();
        let m = vm.mapping(va).unwrap();
        assert_eq!(m.ctag_lines, 2);
        let first = vm.pte(va, PageSizeClass::Big).unwrap();
        let third = vm.pte(va + 0x2_0000, PageSizeClass::Big).unwrap();
        assert_eq!(page_table::pte_kind(first), kind::C32_2C);
        assert_eq!(page_table::pte_comptagline(first), m.ctag_offset);
        assert_eq!(page_table::pte_comptagline(third), m.ctag_offset + 1);
    }

    #[test]
    fn vm_owned_mappings_refuse_kernel_unmap() {
        let vm = vm();
        let buf = DmaBuf::new(0x2_0000).unwrap();
        let va = vm
            .map(
                &buf,
                MapParams::new(kind::C32_2C).with_flags(MapFlags::MAPPABLE_COMPBITS),
            )
            .unwrap();
        let win = vm.map_compbits(va, None).unwrap();

        assert!(matches!(vm.unmap_kernel(win), Err(GpuError::InvalidArgument(_))));
        assert_eq!(vm.mapping(va).unwrap().compbits_window, Some(win));
        assert!(vm.mapping(win).is_some());

        let pool = vm.semaphore_pool().unwrap();
        let ro = vm.sea_ro_va().unwrap();
        assert!(matches!(vm.unmap_kernel(ro), Err(GpuError::InvalidArgument(_))));
        assert!(matches!(
            vm.unmap_kernel(pool.rw_va().unwrap()),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(matches!(vm.unmap_kernel(va), Err(GpuError::BadAddress(_))));

        vm.unmap(va).unwrap();
        assert!(vm.mapping(win).is_none());

        let ring = DmaBuf::new(0x1000).unwrap();
        let kva = vm.map_kernel(&ring, RwFlag::ReadWrite).unwrap();
        vm.unmap_kernel(kva).unwrap();
        assert!(vm.mapping(kva).is_none());
    }

    #[test]
    fn pin_failure_leaves_no_state() {
        let vm = vm();
        let buf = DmaBuf::new(0x4_0000).unwrap();
        buf.revoke();
        let before = vm.va_snapshot();
        let comptags_free = vm.comptags.free_lines();

        for k in [kind::PITCH, kind::C32_2C] {
            assert!(matches!(
                vm.map(&buf, MapParams::new(k)),
                Err(GpuError::BadAddress(_))
            ));
        }
        assert!(matches!(
            vm.map_kernel(&buf, RwFlag::ReadWrite),
            Err(GpuError::BadAddress(_))
        ));
        assert_eq!(vm.va_snapshot(), before);
        assert_eq!(vm.comptags.free_lines(), comptags_free);
        assert_eq!(buf.pin_count(), 0);
    }

    #[test]
    fn fixed_map_needs_reservation() {
        let vm = vm();
        let buf = DmaBuf::new(0x2_0000).unwrap();
        let at = 0x1_0000_0000;
        assert!(matches!(
            vm.map(&buf, MapParams::new(kind::PITCH).with_fixed_offset(at)),
            Err(GpuError::InvalidArgument(_))
        ));

        let space = vm
            .alloc_space(64, SZ_4K, SpaceFlags::FIXED_OFFSET, at)
            .unwrap();
        assert_eq!(space, at);
        let va = vm
            .map(&buf, MapParams::new(kind::PITCH).with_fixed_offset(at))
            .unwrap();
        assert_eq!(va, at);

        let other = DmaBuf::new(0x1_0000).unwrap();
        assert!(matches!(
            vm.map(&other, MapParams::new(kind::PITCH).with_fixed_offset(at + 0x1000)),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(matches!(
            vm.map(&other, MapParams::new(kind::PITCH).with_fixed_offset(at + 0x3_8000)),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn small_buffer_cannot_go_to_big_region() {
        let vm = vm();
        let at = vm
            .alloc_space(4, SZ_64K, SpaceFlags::empty(), 0)
            .unwrap();
        let small = DmaBuf::with_chunks(&[(0x500_1000, 0x1_0000)]).unwrap();
        assert!(matches!(
            vm.map(&small, MapParams::new(kind::PITCH).with_fixed_offset(at)),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn sparse_space_restores_pattern_on_unmap() {
        let vm = vm();
        let at = vm
            .alloc_space(4, SZ_64K, SpaceFlags::SPARSE, 0)
            .unwrap();
        assert!(page_table::pte_is_sparse(vm.pte(at, PageSizeClass::Big).unwrap()));

        let buf = DmaBuf::new(0x1_0000).unwrap();
        let va = vm
            .map(&buf, MapParams::new(kind::PITCH).with_fixed_offset(at))
            .unwrap();
        assert!(page_table::pte_is_valid(vm.pte(va, PageSizeClass::Big).unwrap()));
        vm.unmap(va).unwrap();
        assert!(page_table::pte_is_sparse(vm.pte(at, PageSizeClass::Big).unwrap()));

        vm.free_space(at).unwrap();
        assert_eq!(vm.pte(at, PageSizeClass::Big), Some(PTE_INVALID));
    }

    #[test]
    fn sparse_small_pages_unsupported() {
        let vm = vm();
        assert!(matches!(
            vm.alloc_space(4, SZ_4K, SpaceFlags::SPARSE, 0),
            Err(GpuError::Unsupported(_))
        ));
        assert!(matches!(
            vm.alloc_space(4, 0x2000, SpaceFlags::empty(), 0),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn free_space_drops_member_buffers() {
        let vm = vm();
        let at = vm.alloc_space(64, SZ_4K, SpaceFlags::empty(), 0).unwrap();
        let buf = DmaBuf::new(0x2000).unwrap();
        let va = vm
            .map(&buf, MapParams::new(kind::PITCH).with_fixed_offset(at))
            .unwrap();
        vm.free_space(at).unwrap();
        assert!(vm.mapping(va).is_none());
        assert_eq!(buf.pin_count(), 0);
        assert!(vm.translate(va).is_none());
    }

    #[test]
    fn userspace_managed_rules() {
        let vm = vm_with(&GpuConfig::new(), true);
        let buf = DmaBuf::new(0x1_0000).unwrap();
        assert!(matches!(
            vm.map(&buf, MapParams::new(kind::PITCH)),
            Err(GpuError::BadAddress(_))
        ));
        let va = vm
            .map(&buf, MapParams::new(kind::PITCH).with_fixed_offset(0x4000_0000))
            .unwrap();
        assert_eq!(va, 0x4000_0000);
    }

    #[test]
    fn batch_collapses_invalidates() {
        let cfg = GpuConfig::new();
        let hw = Arc::new(GpuHw::new(cfg.num_channels, cfg.num_runlists));
        let vm = Vm::new(
            2,
            &cfg,
            Arc::clone(&hw),
            Arc::new(ComptagAllocator::new(&cfg)),
            SemaphoreSea::new(1).unwrap(),
            DmaBuf::new(0x1000).unwrap(),
            false,
        );
        let bufs: Vec<_> = (0..3).map(|_| DmaBuf::new(0x1000).unwrap()).collect();
        let vas: Vec<_> = bufs
            .iter()
            .map(|b| vm.map(b, MapParams::new(kind::PITCH)).unwrap())
            .collect();

        let tlb = hw.tlb_invalidate_count();
        let l2 = hw.l2_flush_count();
        let mut batch = vm.batch_start();
        for va in vas {
            vm.unmap_batched(va, &mut batch).unwrap();
        }
        assert_eq!(hw.tlb_invalidate_count(), tlb);
        vm.batch_finish(batch);
        assert_eq!(hw.tlb_invalidate_count(), tlb + 1);
        assert_eq!(hw.l2_flush_count(), l2 + 1);
    }

    #[test]
    fn job_references_outlive_user_unmap() {
        let vm = vm();
        let buf = DmaBuf::new(0x1000).unwrap();
        let va = vm.map(&buf, MapParams::new(kind::PITCH)).unwrap();
        let refs = vm.get_buffers();
        assert_eq!(refs.len(), 1);
        vm.unmap(va).unwrap();
        assert_eq!(vm.mapping(va).unwrap().user_mapped, 0);
        assert!(vm.unmap(va).is_err());
        vm.put_buffers(refs);
        assert!(vm.mapping(va).is_none());
    }

    #[test]
    fn gpu_access_respects_read_only() {
        let vm = vm();
        let buf = DmaBuf::new(0x1000).unwrap();
        buf.memory().write_u32(8, 0xabcd);
        let ro = vm.map(&buf, MapParams::new(kind::PITCH).read_only()).unwrap();
        assert_eq!(vm.gpu_read_u32(ro + 8), Some(0xabcd));
        assert!(!vm.gpu_write_u32(ro + 8, 1));
        assert_eq!(vm.gpu_read_u32(ro + 0x2000), None);
    }

    #[test]
    fn semaphore_pool_is_mapped_twice() {
        let vm = vm();
        let pool = vm.semaphore_pool().unwrap();
        let again = vm.semaphore_pool().unwrap();
        assert!(Arc::ptr_eq(&pool, &again));

        let hw = pool.alloc_hw_sema(3).unwrap();
        let rw = pool.rw_va().unwrap() + hw.page_offset();
        let ro = vm.sea_ro_va().unwrap() + hw.sea_offset();
        assert!(vm.gpu_write_u32(rw, 5));
        assert_eq!(vm.gpu_read_u32(ro), Some(5));
        assert_eq!(hw.read(), 5);
        assert!(!vm.gpu_write_u32(ro, 6));
    }
}
