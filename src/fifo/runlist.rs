//! Runlist construction.
//!
//! A runlist is the flat list of channel and TSG entries the host scheduler
//! walks. Entries are emitted level by level (low, medium, high) so that
//! with interleaving enabled, higher levels appear once after every entry of
//! a lower level and therefore get proportionally more time.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{GpuError, GpuResult};
use crate::hw::memory::HostMemory;
use crate::hw::regs::GpuHw;
use crate::utils::Bitmap;

pub const RUNLIST_ENTRY_WORDS: usize = 2;
pub const RUNLIST_ENTRY_SIZE: usize = RUNLIST_ENTRY_WORDS * 4;

const ENTRY_TYPE_TSG: u32 = 1 << 13;
const TSG_TIMESLICE_SCALE_SHIFT: u32 = 14;
const TSG_TIMESLICE_TIMEOUT_SHIFT: u32 = 18;
const TSG_LENGTH_SHIFT: u32 = 26;

pub const DEFAULT_TIMESLICE_SCALE: u32 = 3;
pub const DEFAULT_TIMESLICE_TIMEOUT: u32 = 128;

pub const MIN_TIMESLICE_US: u32 = 1000;
pub const MAX_TIMESLICE_US: u32 = 50000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub enum InterleaveLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl InterleaveLevel {
    pub const ALL: [Self; 3] = [Self::Low, Self::Medium, Self::High];

    const fn next(self) -> Option<Self> {
        match self {
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => None,
        }
    }

    /// # Errors
    /// Returns `InvalidArgument` for anything but 0, 1 or 2.
    pub fn from_raw(raw: u32) -> GpuResult<Self> {
        match raw {
            0 => Ok(Self::Low),
            1 => Ok(Self::Medium),
            2 => Ok(Self::High),
            _ => Err(GpuError::invalid(format!("invalid interleave level {raw}"))),
        }
    }
}

/// Converts a timeslice to the hardware's (timeout, scale) pair where
/// `timeout << scale` approximates `us` and `timeout` fits 8 bits.
///
/// # Errors
/// Returns `InvalidArgument` outside `[MIN_TIMESLICE_US, MAX_TIMESLICE_US]`.
pub fn timeslice_to_hw(us: u32) -> GpuResult<(u32, u32)> {
    if !(MIN_TIMESLICE_US..=MAX_TIMESLICE_US).contains(&us) {
        return Err(GpuError::invalid(format!("timeslice {us}us out of range")));
    }
    let mut timeout = us;
    let mut scale = 0;
    while timeout >= 256 {
        timeout >>= 1;
        scale += 1;
    }
    Ok((timeout, scale))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunlistEntry {
    Channel(u32),
    Tsg {
        tsgid: u32,
        len: u32,
        timeslice_scale: u32,
        timeslice_timeout: u32,
    },
}

impl RunlistEntry {
    #[must_use]
    pub const fn encode(&self) -> [u32; 2] {
        match *self {
            Self::Channel(chid) => [chid, 0],
            Self::Tsg {
                tsgid,
                len,
                timeslice_scale,
                timeslice_timeout,
            } => [
                tsgid
                    | ENTRY_TYPE_TSG
                    | (timeslice_scale << TSG_TIMESLICE_SCALE_SHIFT)
                    | (timeslice_timeout << TSG_TIMESLICE_TIMEOUT_SHIFT)
                    | (len << TSG_LENGTH_SHIFT),
                0,
            ],
        }
    }

    #[must_use]
    pub const fn decode(words: [u32; 2]) -> Self {
        let w = words[0];
        if w & ENTRY_TYPE_TSG == 0 {
            Self::Channel(w)
        } else {
            Self::Tsg {
                tsgid: w & 0xfff,
                len: w >> TSG_LENGTH_SHIFT,
                timeslice_scale: (w >> TSG_TIMESLICE_SCALE_SHIFT) & 0xf,
                timeslice_timeout: (w >> TSG_TIMESLICE_TIMEOUT_SHIFT) & 0xff,
            }
        }
    }
}

// ===============================================================================================
// Construction
// ===============================================================================================

/// An active channel outside any TSG.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BareChannel {
    pub(crate) chid: u32,
    pub(crate) level: InterleaveLevel,
}

/// An active TSG and its active members, in bind order.
#[derive(Debug, Clone)]
pub(crate) struct ActiveTsg {
    pub(crate) tsgid: u32,
    pub(crate) level: InterleaveLevel,
    pub(crate) timeslice: Option<(u32, u32)>,
    pub(crate) members: Vec<u32>,
}

/// Snapshot of what the scheduler should see on one runlist.
#[derive(Debug, Default)]
pub(crate) struct SchedView {
    pub(crate) channels: Vec<BareChannel>,
    pub(crate) tsgs: Vec<ActiveTsg>,
}

struct Builder<'a> {
    view: &'a SchedView,
    interleave: bool,
    limit: usize,
    out: Vec<RunlistEntry>,
}

impl Builder<'_> {
    fn push(&mut self, e: RunlistEntry) -> Result<(), ()> {
        if self.out.len() >= self.limit {
            return Err(());
        }
        self.out.push(e);
        Ok(())
    }

    fn level(&mut self, level: InterleaveLevel, prev_empty: bool) -> Result<(), ()> {
        let start = self.out.len();
        let next = level.next();
        let mut skip_next = false;
        let view = self.view;

        for ch in view.channels.iter().filter(|c| c.level == level) {
            if let Some(n) = next
                && !skip_next
            {
                self.level(n, false)?;
                if !self.interleave {
                    skip_next = true;
                }
            }
            self.push(RunlistEntry::Channel(ch.chid))?;
        }

        for tsg in view.tsgs.iter().filter(|t| t.level == level) {
            if let Some(n) = next
                && !skip_next
            {
                self.level(n, false)?;
                if !self.interleave {
                    skip_next = true;
                }
            }
            let (timeslice_timeout, timeslice_scale) = tsg
                .timeslice
                .unwrap_or((DEFAULT_TIMESLICE_TIMEOUT, DEFAULT_TIMESLICE_SCALE));
            self.push(RunlistEntry::Tsg {
                tsgid: tsg.tsgid,
                len: tsg.members.len() as u32,
                timeslice_scale,
                timeslice_timeout,
            })?;
            for &chid in &tsg.members {
                self.push(RunlistEntry::Channel(chid))?;
            }
        }

        let emitted = self.out.len() - start;
        if let Some(n) = next {
            if emitted == 0 {
                self.level(n, true)?;
            } else if self.interleave && !prev_empty {
                self.level(n, false)?;
            }
        }
        Ok(())
    }
}

/// Builds the entry list for `view`.
///
/// # Errors
/// Returns `TooBig` if more than `limit` entries would be emitted.
pub(crate) fn construct(
    view: &SchedView,
    interleave: bool,
    limit: u32,
) -> GpuResult<Vec<RunlistEntry>> {
    let mut b = Builder {
        view,
        interleave,
        limit: limit as usize,
        out: Vec::new(),
    };
    b.level(InterleaveLevel::Low, true)
        .map_err(|()| GpuError::TooBig(limit))?;
    Ok(b.out)
}

// ===============================================================================================
// Runlist state
// ===============================================================================================

#[derive(Debug)]
pub(crate) struct Runlist {
    id: u32,
    pub(crate) active_channels: Bitmap,
    pub(crate) active_tsgs: Bitmap,
    /// Active channels per TSG on this runlist.
    pub(crate) tsg_active: Vec<u32>,
    buffers: [HostMemory; 2],
    cur_buffer: usize,
    max_entries: u32,
}

impl Runlist {
    pub(crate) fn new(id: u32, num_channels: u32, num_tsgs: u32, max_entries: u32) -> GpuResult<Self> {
        let size = max_entries as usize * RUNLIST_ENTRY_SIZE;
        Ok(Self {
            id,
            active_channels: Bitmap::new(num_channels as usize),
            active_tsgs: Bitmap::new(num_tsgs as usize),
            tsg_active: vec![0; num_tsgs as usize],
            buffers: [HostMemory::new(size)?, HostMemory::new(size)?],
            cur_buffer: 0,
            max_entries,
        })
    }

    pub(crate) const fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Marks `chid` active or inactive. Returns `false` if nothing changed.
    pub(crate) fn set_active(&mut self, chid: u32, tsgid: Option<u32>, add: bool) -> bool {
        let bit = chid as usize;
        let changed = if add {
            !self.active_channels.test_and_set(bit)
        } else {
            self.active_channels.test_and_clear(bit)
        };
        if !changed {
            return false;
        }
        if let Some(t) = tsgid {
            let count = &mut self.tsg_active[t as usize];
            if add {
                *count += 1;
                self.active_tsgs.set(t as usize);
            } else {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.active_tsgs.clear(t as usize);
                }
            }
        }
        true
    }

    /// Writes `entries` into the inactive buffer, hands it to the hardware
    /// and makes it current.
    pub(crate) fn submit(&mut self, hw: &GpuHw, entries: &[RunlistEntry]) {
        let next = self.cur_buffer ^ 1;
        let buf = &self.buffers[next];
        for (i, e) in entries.iter().enumerate() {
            buf.write_words(i * RUNLIST_ENTRY_SIZE, &e.encode());
        }
        hw.runlist_submit(self.id, buf.addr(), entries.len() as u32);
        self.cur_buffer = next;
        log::debug!("runlist {}: {} entries submitted", self.id, entries.len());
    }

    /// Decodes the current buffer.
    pub(crate) fn current_entries(&self, count: u32) -> Vec<RunlistEntry> {
        let buf = &self.buffers[self.cur_buffer];
        (0..count as usize)
            .map(|i| {
                let w = buf.read_words(i * RUNLIST_ENTRY_SIZE, RUNLIST_ENTRY_WORDS);
                RunlistEntry::decode([w[0], w[1]])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use InterleaveLevel::{High, Low, Medium};

    fn ch(chid: u32, level: InterleaveLevel) -> BareChannel {
        BareChannel { chid, level }
    }

    fn chids(entries: &[RunlistEntry]) -> Vec<u32> {
        entries
            .iter()
            .map(|e| match e {
                RunlistEntry::Channel(c) => *c,
                RunlistEntry::Tsg { tsgid, .. } => 1000 + tsgid,
            })
            .collect()
    }

    #[test]
    fn timeslice_encoding() {
        assert_eq!(timeslice_to_hw(1000).unwrap(), (250, 2));
        assert_eq!(timeslice_to_hw(50000).unwrap(), (195, 8));
        assert!(timeslice_to_hw(999).is_err());
        assert!(timeslice_to_hw(50001).is_err());
    }

    #[test]
    fn tsg_entry_layout() {
        let e = RunlistEntry::Tsg {
            tsgid: 5,
            len: 2,
            timeslice_scale: 3,
            timeslice_timeout: 128,
        };
        let w = e.encode();
        assert_eq!(w[0], 5 | (1 << 13) | (3 << 14) | (128 << 18) | (2 << 26));
        assert_eq!(RunlistEntry::decode(w), e);
    }

    #[test]
    fn interleaved_levels_repeat_higher_levels() {
        let view = SchedView {
            channels: vec![ch(0, Low), ch(1, Low), ch(2, Medium), ch(3, High)],
            tsgs: vec![],
        };
        let out = construct(&view, true, 64).unwrap();
        // Each low entry is preceded by a full medium pass, which itself
        // inserts a high pass before every medium entry.
        assert_eq!(chids(&out), vec![3, 2, 3, 0, 3, 2, 3, 1]);
    }

    #[test]
    fn without_interleave_each_channel_once() {
        let view = SchedView {
            channels: vec![ch(0, Low), ch(1, Low), ch(2, Medium), ch(3, High)],
            tsgs: vec![],
        };
        let out = construct(&view, false, 64).unwrap();
        assert_eq!(chids(&out), vec![3, 2, 0, 1]);
    }

    #[test]
    fn only_high_level_channels() {
        let view = SchedView {
            channels: vec![ch(4, High), ch(5, High)],
            tsgs: vec![],
        };
        assert_eq!(chids(&construct(&view, true, 64).unwrap()), vec![4, 5]);
    }

    #[test]
    fn tsg_is_followed_by_members() {
        let view = SchedView {
            channels: vec![ch(0, Low)],
            tsgs: vec![ActiveTsg {
                tsgid: 1,
                level: Low,
                timeslice: None,
                members: vec![2, 3],
            }],
        };
        let out = construct(&view, false, 64).unwrap();
        assert_eq!(chids(&out), vec![0, 1001, 2, 3]);
        let RunlistEntry::Tsg { len, .. } = out[1] else { panic!("expected tsg") };
        assert_eq!(len, 2);
    }

    #[test]
    fn overflow_is_too_big() {
        let view = SchedView {
            channels: (0..4).map(|c| ch(c, Low)).collect(),
            tsgs: vec![],
        };
        assert!(matches!(construct(&view, false, 3), Err(GpuError::TooBig(3))));
    }
}
