//! Two-level GMMU page tables.
//!
//! Each PDE covers `1 << pde_shift` bytes and points at up to two PTE tables,
//! one for small (4K) pages and one for big pages. Tables live in an arena
//! owned by the VM and are referenced by index, so nothing outlives the VM.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{GpuError, GpuResult};
use std::fmt::Write as _;

pub const SMALL_PAGE_SHIFT: u32 = 12;

/// Page size index of a mapping. `Kernel` uses small pages in the kernel VMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSizeClass {
    Small = 0,
    Big = 1,
    Kernel = 2,
}

impl PageSizeClass {
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    const fn table(self) -> usize {
        match self {
            Self::Big => 1,
            Self::Small | Self::Kernel => 0,
        }
    }
}

// ===============================================================================================
// PTE encoding
// ===============================================================================================

pub const PTE_VALID: u32 = 1 << 0;
pub const PTE_PRIVILEGE: u32 = 1 << 1;
pub const PTE_READ_ONLY: u32 = 1 << 2;
const PTE_ADDRESS_SHIFT: u32 = 4;

pub const PTE_VOL: u32 = 1 << 0;
const PTE_APERTURE_SHIFT: u32 = 1;
const PTE_KIND_SHIFT: u32 = 4;
const PTE_COMPTAGLINE_SHIFT: u32 = 12;
const PTE_COMPTAGLINE_MASK: u32 = 0x1_ffff;
pub const PTE_READ_DISABLE: u32 = 1 << 30;
pub const PTE_WRITE_DISABLE: u32 = 1 << 31;

pub const PTE_INVALID: [u32; 2] = [0, 0];
/// Invalid but volatile: "intentionally unbacked" rather than never mapped.
pub const PTE_SPARSE: [u32; 2] = [0, PTE_VOL];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemAperture {
    Vidmem = 0,
    #[default]
    SysmemCoherent = 2,
    SysmemNonCoherent = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RwFlag {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PteAttrs {
    pub kind: u8,
    pub comptagline: u32,
    pub rw: RwFlag,
    pub cacheable: bool,
    pub privileged: bool,
    pub aperture: MemAperture,
}

#[must_use]
pub const fn encode_pte(phys: u64, a: &PteAttrs) -> [u32; 2] {
    let mut w0 = PTE_VALID | (((phys >> SMALL_PAGE_SHIFT) as u32) << PTE_ADDRESS_SHIFT);
    if a.privileged {
        w0 |= PTE_PRIVILEGE;
    }
    let mut w1 = ((a.aperture as u32) << PTE_APERTURE_SHIFT)
        | ((a.kind as u32) << PTE_KIND_SHIFT)
        | ((a.comptagline & PTE_COMPTAGLINE_MASK) << PTE_COMPTAGLINE_SHIFT);
    match a.rw {
        RwFlag::ReadOnly => {
            w0 |= PTE_READ_ONLY;
            w1 |= PTE_WRITE_DISABLE;
        }
        RwFlag::WriteOnly => w1 |= PTE_READ_DISABLE,
        RwFlag::ReadWrite => {}
    }
    if !a.cacheable {
        w1 |= PTE_VOL;
    }
    [w0, w1]
}

#[must_use]
pub const fn pte_is_valid(pte: [u32; 2]) -> bool {
    pte[0] & PTE_VALID != 0
}

#[must_use]
pub const fn pte_is_sparse(pte: [u32; 2]) -> bool {
    pte[0] == PTE_SPARSE[0] && pte[1] == PTE_SPARSE[1]
}

#[must_use]
pub const fn pte_phys(pte: [u32; 2]) -> u64 {
    ((pte[0] >> PTE_ADDRESS_SHIFT) as u64) << SMALL_PAGE_SHIFT
}

#[must_use]
pub const fn pte_kind(pte: [u32; 2]) -> u8 {
    (pte[1] >> PTE_KIND_SHIFT) as u8
}

#[must_use]
pub const fn pte_comptagline(pte: [u32; 2]) -> u32 {
    (pte[1] >> PTE_COMPTAGLINE_SHIFT) & PTE_COMPTAGLINE_MASK
}

#[must_use]
pub const fn pte_read_only(pte: [u32; 2]) -> bool {
    pte[0] & PTE_READ_ONLY != 0
}

// ===============================================================================================
// Arena
// ===============================================================================================

#[derive(Debug)]
struct PteTable {
    entries: Vec<[u32; 2]>,
    valid: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct PdeSlot {
    tables: [Option<usize>; 2],
}

/// Result of walking the tables for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub phys: u64,
    pub page_size: u64,
    pub pte: [u32; 2],
}

#[derive(Debug)]
pub struct PageTables {
    pde_shift: u32,
    page_shifts: [u32; 2],
    va_limit: u64,
    pdes: Vec<PdeSlot>,
    arena: Vec<PteTable>,
}

impl PageTables {
    #[must_use]
    pub fn new(va_limit: u64, big_page_size: u64) -> Self {
        let big_shift = big_page_size.trailing_zeros();
        // A PDE spans 1024 big pages.
        let pde_shift = big_shift + 10;
        let count = va_limit.div_ceil(1 << pde_shift) as usize;
        Self {
            pde_shift,
            page_shifts: [SMALL_PAGE_SHIFT, big_shift],
            va_limit,
            pdes: vec![PdeSlot::default(); count],
            arena: Vec::new(),
        }
    }

    #[must_use]
    pub const fn pde_shift(&self) -> u32 {
        self.pde_shift
    }

    #[must_use]
    pub const fn page_size(&self, class: PageSizeClass) -> u64 {
        1 << self.page_shifts[class.table()]
    }

    /// PTE tables allocated so far.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.arena.len()
    }

    fn table_for(&mut self, va: u64, t: usize) -> usize {
        let pde = (va >> self.pde_shift) as usize;
        if let Some(idx) = self.pdes[pde].tables[t] {
            return idx;
        }
        let entries = 1usize << (self.pde_shift - self.page_shifts[t]);
        self.arena.push(PteTable {
            entries: vec![PTE_INVALID; entries],
            valid: 0,
        });
        let idx = self.arena.len() - 1;
        self.pdes[pde].tables[t] = Some(idx);
        log::trace!("pde {pde}: allocated {} table {idx}", if t == 1 { "big" } else { "small" });
        idx
    }

    /// Writes the PTEs covering `[va, va + size)` for pages of `class`.
    /// `entry` receives each page's byte offset from `va`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unaligned or out-of-range request.
    pub fn update(
        &mut self,
        va: u64,
        size: u64,
        class: PageSizeClass,
        mut entry: impl FnMut(u64) -> [u32; 2],
    ) -> GpuResult<()> {
        let t = class.table();
        let shift = self.page_shifts[t];
        let page = 1u64 << shift;
        if va % page != 0 || va.checked_add(size).is_none_or(|end| end > self.va_limit) {
            return Err(GpuError::invalid(format!(
                "pte update 0x{va:x}+0x{size:x} (page 0x{page:x})"
            )));
        }

        let mut off = 0;
        while off < size {
            let addr = va + off;
            let table = self.table_for(addr, t);
            let slot = ((addr & ((1 << self.pde_shift) - 1)) >> shift) as usize;
            let new = entry(off);
            let tbl = &mut self.arena[table];
            let was = pte_is_valid(tbl.entries[slot]);
            tbl.entries[slot] = new;
            match (was, pte_is_valid(new)) {
                (false, true) => tbl.valid += 1,
                (true, false) => tbl.valid -= 1,
                _ => {}
            }
            off += page;
        }
        Ok(())
    }

    /// Raw PTE for `va` in the table of `class`, if that table exists.
    #[must_use]
    pub fn pte(&self, va: u64, class: PageSizeClass) -> Option<[u32; 2]> {
        let t = class.table();
        let pde = self.pdes.get((va >> self.pde_shift) as usize)?;
        let table = &self.arena[pde.tables[t]?];
        let slot = ((va & ((1 << self.pde_shift) - 1)) >> self.page_shifts[t]) as usize;
        Some(table.entries[slot])
    }

    /// Walks both tables of the PDE and returns the valid translation, if any.
    #[must_use]
    pub fn translate(&self, va: u64) -> Option<Translation> {
        [PageSizeClass::Big, PageSizeClass::Small]
            .into_iter()
            .find_map(|class| {
                let pte = self.pte(va, class)?;
                pte_is_valid(pte).then(|| {
                    let page = self.page_size(class);
                    Translation {
                        phys: pte_phys(pte) + (va & (page - 1)),
                        page_size: page,
                        pte,
                    }
                })
            })
    }

    /// Text dump of every PDE with tables and their valid PTE counts.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, pde) in self.pdes.iter().enumerate() {
            if pde.tables.iter().all(Option::is_none) {
                continue;
            }
            let _ = write!(out, "pde {i:4} va 0x{:010x}:", (i as u64) << self.pde_shift);
            for (t, name) in [(0, "small"), (1, "big")] {
                if let Some(idx) = pde.tables[t] {
                    let tbl = &self.arena[idx];
                    let sparse = tbl.entries.iter().filter(|e| pte_is_sparse(**e)).count();
                    let _ = write!(out, " {name}[{} valid, {sparse} sparse]", tbl.valid);
                }
            }
            out.push('\n');
        }
        out
    }
}
