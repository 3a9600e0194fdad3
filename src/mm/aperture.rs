use super::ApertureAllocator;
use crate::utils::align_up;
use std::collections::BTreeMap;

/// A managed range of GPU virtual address space.
///
/// First-fit over a map of occupied ranges; every allocation is rounded to
/// the aperture's page size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aperture {
    base: u64,
    limit: u64,
    page_size: u64,

    // Occupied ranges: start -> size.
    allocations: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64, page_size: u64) -> Self {
        Self {
            base: align_up(base, page_size),
            limit: limit.max(base),
            page_size,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.limit
    }

    #[must_use]
    pub fn is_empty_range(&self) -> bool {
        self.base >= self.limit
    }

    /// Bytes not covered by any allocation.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        let used: u64 = self.allocations.values().sum();
        self.limit.saturating_sub(self.base) - used
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Reserves exactly `[addr, addr + size)` if it is inside the aperture and free.
    pub fn allocate_fixed(&mut self, addr: u64, size: u64) -> Option<u64> {
        let size = align_up(size, self.page_size);
        if addr % self.page_size != 0 || addr < self.base || addr.checked_add(size)? > self.limit {
            return None;
        }
        if let Some((&start, &len)) = self.allocations.range(..addr + size).next_back()
            && start + len > addr
        {
            return None;
        }
        self.allocations.insert(addr, size);
        Some(addr)
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, self.page_size);
        let align = align.max(self.page_size);

        let mut candidate = align_up(self.base, align);

        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = candidate.max(align_up(start + len, align));
        }

        if candidate.checked_add(size)? <= self.limit {
            self.allocations.insert(candidate, size);
            return Some(candidate);
        }
        None
    }

    fn free_va(&mut self, addr: u64) {
        if self.allocations.remove(&addr).is_none() {
            log::error!("VA 0x{addr:x} freed but not tracked in [0x{:x}, 0x{:x})", self.base, self.limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_holes() {
        let mut ap = Aperture::new(0x1000, 0x10000, 0x1000);
        let a = ap.allocate_va(0x2000, 0).unwrap();
        let b = ap.allocate_va(0x1000, 0).unwrap();
        assert_eq!((a, b), (0x1000, 0x3000));
        ap.free_va(a);
        assert_eq!(ap.allocate_va(0x1800, 0), Some(0x1000));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut ap = Aperture::new(0, 0x4000, 0x1000);
        assert!(ap.allocate_va(0x4000, 0).is_some());
        assert!(ap.allocate_va(0x1000, 0).is_none());
    }

    #[test]
    fn fixed_rejects_overlap() {
        let mut ap = Aperture::new(0, 0x10000, 0x1000);
        assert_eq!(ap.allocate_fixed(0x4000, 0x2000), Some(0x4000));
        assert_eq!(ap.allocate_fixed(0x5000, 0x1000), None);
        assert_eq!(ap.allocate_fixed(0x3000, 0x2000), None);
        assert_eq!(ap.allocate_fixed(0x6000, 0x1000), Some(0x6000));
        assert_eq!(ap.allocate_va(0x1000, 0x4000), Some(0));
        assert_eq!(ap.allocate_va(0x1000, 0x4000), Some(0x8000));
    }

    #[test]
    fn free_space_accounting() {
        let mut ap = Aperture::new(0, 0x10000, 0x1000);
        let before = ap.free_bytes();
        let a = ap.allocate_va(0x800, 0).unwrap();
        assert_eq!(ap.free_bytes(), before - 0x1000);
        ap.free_va(a);
        ap.free_va(a);
        assert_eq!(ap.free_bytes(), before);
    }
}
