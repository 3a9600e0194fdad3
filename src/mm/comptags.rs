//! Compression tag line allocation.
//!
//! Comptag lines index the L2's compression backing store. Line 0 is never
//! handed out, so a comptag offset of zero always means "no comptags".

#![allow(clippy::cast_possible_truncation)]

use crate::config::{GpuConfig, SZ_4K};
use crate::error::{GpuError, GpuResult};
use crate::utils::{Bitmap, div_round_up, lcm, roundup};
use parking_lot::Mutex;

/// A buffer's comptag range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Comptags {
    pub offset: u32,
    pub lines: u32,
    pub allocated_lines: u32,
    pub user_mappable: bool,
}

/// Geometry of the user-visible compbits window for a mappable allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompbitsWindow {
    pub size: u64,
    pub ctagline: u32,
}

#[derive(Debug)]
pub struct ComptagAllocator {
    lines: Mutex<Bitmap>,
    comptags_per_cacheline: u32,
    aggregate_cacheline_size: u64,
}

impl ComptagAllocator {
    #[must_use]
    pub fn new(cfg: &GpuConfig) -> Self {
        Self {
            lines: Mutex::new(Bitmap::new(cfg.comptag_lines.saturating_sub(1) as usize)),
            comptags_per_cacheline: cfg.comptags_per_cacheline.max(1),
            aggregate_cacheline_size: cfg.aggregate_cacheline_size().max(1),
        }
    }

    #[must_use]
    pub fn free_lines(&self) -> u32 {
        let lines = self.lines.lock();
        (lines.len() - lines.count_ones()) as u32
    }

    /// Allocates `len` contiguous lines and returns the first line number.
    ///
    /// # Errors
    /// Returns `OutOfMemory` if no run of `len` free lines exists.
    pub fn alloc(&self, len: u32) -> GpuResult<u32> {
        if len == 0 {
            return Err(GpuError::invalid("zero comptag lines"));
        }
        let mut lines = self.lines.lock();
        let pos = lines
            .find_next_zero_area(0, len as usize, 1)
            .ok_or(GpuError::OutOfMemory)?;
        lines.set_range(pos, len as usize);
        Ok(pos as u32 + 1)
    }

    pub fn free(&self, offset: u32, len: u32) {
        if offset == 0 {
            log::warn!("comptags: free of line 0");
            return;
        }
        let mut lines = self.lines.lock();
        let start = offset as usize - 1;
        if (start..start + len as usize).any(|b| !lines.test(b)) {
            log::warn!("comptags: extra free of [{offset}, +{len})");
        }
        lines.clear_range(start, len as usize);
    }

    /// Allocates comptags for a buffer needing `lines` lines.
    ///
    /// User-mappable allocations are aligned so the window starts on a page
    /// boundary of the backing store and padded so it ends on one; the
    /// padding not needed by the window is returned straight away.
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the lines cannot be found.
    pub fn alloc_for_buffer(
        &self,
        lines: u32,
        user_mappable: bool,
    ) -> GpuResult<(Comptags, Option<CompbitsWindow>)> {
        let cpc = u64::from(self.comptags_per_cacheline);
        let agg = self.aggregate_cacheline_size;

        let (allocsize, align) = if user_mappable {
            let align = (lcm(agg, SZ_4K) / agg) * cpc;
            let size = div_round_up(u64::from(lines), cpc) * cpc
                + align
                + div_round_up(SZ_4K, agg) * cpc;
            (size as u32, align as u32)
        } else {
            (lines, 1)
        };

        let offset = self.alloc(allocsize)?;
        let mut tags = Comptags {
            offset,
            lines,
            allocated_lines: allocsize,
            user_mappable,
        };

        if !user_mappable {
            return Ok((tags, None));
        }

        let needed_cachelines = div_round_up(u64::from(lines), cpc);
        let needed_bytes = roundup(needed_cachelines * agg, SZ_4K);
        let first_unneeded_cacheline = div_round_up(needed_bytes, agg);
        let needed_ctaglines = (first_unneeded_cacheline * cpc) as u32;
        let win_size = roundup(div_round_up(u64::from(lines), cpc) * agg, SZ_4K);

        let aligned_offset = roundup(u64::from(offset), u64::from(align)) as u32;
        if aligned_offset > offset {
            let lead = aligned_offset - offset;
            self.free(offset, lead);
            tags.offset = aligned_offset;
            tags.allocated_lines -= lead;
        }
        if needed_ctaglines < tags.allocated_lines {
            let tail = tags.allocated_lines - needed_ctaglines;
            self.free(aligned_offset + needed_ctaglines, tail);
            tags.allocated_lines = needed_ctaglines;
        }

        Ok((
            tags,
            Some(CompbitsWindow {
                size: win_size,
                ctagline: tags.offset,
            }),
        ))
    }

    pub fn free_buffer(&self, tags: &Comptags) {
        if tags.offset != 0 && tags.allocated_lines != 0 {
            self.free(tags.offset, tags.allocated_lines);
        }
    }
}
