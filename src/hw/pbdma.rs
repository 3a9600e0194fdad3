//! Push-buffer DMA: gpfifo entry layout, host method encoding and a small
//! executor that runs host methods against a [`PbdmaTarget`].

#![allow(clippy::cast_possible_truncation)]

use crate::utils::{counter_reached, hi32, lo32};
use std::mem::size_of;
use thiserror::Error;

/// One gpfifo ring entry: a push buffer GPU VA and its length in words.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpfifoEntry {
    pub entry0: u32,
    pub entry1: u32,
}

const _: () = assert!(size_of::<GpfifoEntry>() == 8);

impl GpfifoEntry {
    const LENGTH_SHIFT: u32 = 10;
    const LENGTH_MASK: u32 = 0x1f_ffff;

    #[must_use]
    pub const fn new(gpu_va: u64, num_words: u32) -> Self {
        Self {
            entry0: lo32(gpu_va),
            entry1: (hi32(gpu_va) & 0xff) | ((num_words & Self::LENGTH_MASK) << Self::LENGTH_SHIFT),
        }
    }

    #[must_use]
    pub const fn gpu_va(&self) -> u64 {
        (((self.entry1 & 0xff) as u64) << 32) | self.entry0 as u64
    }

    #[must_use]
    pub const fn num_words(&self) -> u32 {
        self.entry1 >> Self::LENGTH_SHIFT
    }
}

// ===============================================================================================
// Host methods
// ===============================================================================================

pub const SEMAPHORE_A: u32 = 0x04;
pub const SEMAPHORE_B: u32 = 0x05;
pub const SEMAPHORE_C: u32 = 0x06;
pub const SEMAPHORE_D: u32 = 0x07;
pub const NON_STALL_INT: u32 = 0x08;
pub const SYNCPOINT_A: u32 = 0x1c;
pub const SYNCPOINT_B: u32 = 0x1d;
pub const WFI: u32 = 0x1e;

pub const SEMAPHORE_D_OPERATION_ACQUIRE: u32 = 0x1;
pub const SEMAPHORE_D_OPERATION_RELEASE: u32 = 0x2;
pub const SEMAPHORE_D_OPERATION_ACQ_GEQ: u32 = 0x4;
pub const SEMAPHORE_D_ACQUIRE_SWITCH_ENABLED: u32 = 1 << 12;
pub const SEMAPHORE_D_RELEASE_WFI_DISABLED: u32 = 1 << 20;

pub const SYNCPOINT_B_OPERATION_WAIT: u32 = 0x0;
pub const SYNCPOINT_B_OPERATION_INCR: u32 = 0x1;
pub const SYNCPOINT_B_WAIT_SWITCH_ENABLED: u32 = 1 << 4;

const SEC_OP_INC_METHOD: u32 = 1;
const SEC_OP_NON_INC_METHOD: u32 = 3;
const SEC_OP_IMMD_DATA_METHOD: u32 = 4;
const SEC_OP_ONE_INC: u32 = 5;

/// Header for `count` incrementing writes starting at `method` on subchannel 0.
#[must_use]
pub const fn incr_header(method: u32, count: u32) -> u32 {
    (SEC_OP_INC_METHOD << 29) | ((count & 0x1fff) << 16) | (method & 0xfff)
}

#[must_use]
pub const fn syncpoint_b(id: u32, op: u32) -> u32 {
    ((id & 0xfff) << 8) | op
}

// ===============================================================================================
// Executor
// ===============================================================================================

/// What the PBDMA touches outside its own registers.
pub trait PbdmaTarget {
    fn syncpt_read(&self, id: u32) -> u32;
    fn syncpt_incr(&self, id: u32);
    /// Reads a semaphore by GPU VA. `None` means the address does not translate.
    fn sema_read(&self, gpu_va: u64) -> Option<u32>;
    /// Writes a semaphore by GPU VA. Returns false if the address does not
    /// translate or is read-only.
    fn sema_write(&self, gpu_va: u64, value: u32) -> bool;
    fn nonstall_interrupt(&self);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PbdmaFault {
    #[error("push buffer truncated at word {0}")]
    Truncated(usize),
    #[error("bad method header 0x{0:08x}")]
    BadHeader(u32),
    #[error("semaphore VA 0x{0:x} does not translate")]
    BadSemaphore(u64),
}

/// Method state that persists across push buffer segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PbdmaState {
    sema_va: u64,
    sema_payload: u32,
    syncpt_payload: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    /// Blocked on an acquire or syncpoint wait; `at` is the word index of the
    /// method group to resume from.
    Stalled { at: usize },
}

enum Step {
    Continue,
    Stall,
}

impl PbdmaState {
    /// Executes `words` from word index `start`.
    ///
    /// # Errors
    /// Returns a `PbdmaFault` for malformed headers, truncated method groups
    /// and semaphore addresses that fail to translate.
    pub fn execute(
        &mut self,
        target: &dyn PbdmaTarget,
        words: &[u32],
        start: usize,
    ) -> Result<Progress, PbdmaFault> {
        let mut pos = start;
        while pos < words.len() {
            let header = words[pos];
            let sec_op = header >> 29;
            let count = ((header >> 16) & 0x1fff) as usize;
            let subch = (header >> 13) & 0x7;
            let method = header & 0xfff;

            if header == 0 {
                pos += 1;
                continue;
            }

            if sec_op == SEC_OP_IMMD_DATA_METHOD {
                if let Step::Stall = self.method(target, subch, method, count as u32)? {
                    return Ok(Progress::Stalled { at: pos });
                }
                pos += 1;
                continue;
            }

            if !matches!(sec_op, SEC_OP_INC_METHOD | SEC_OP_NON_INC_METHOD | SEC_OP_ONE_INC) {
                return Err(PbdmaFault::BadHeader(header));
            }
            if count > 0 && pos + count >= words.len() {
                return Err(PbdmaFault::Truncated(pos));
            }

            for i in 0..count {
                let m = match sec_op {
                    SEC_OP_INC_METHOD => method + i as u32,
                    SEC_OP_ONE_INC => method + u32::from(i > 0),
                    _ => method,
                };
                if let Step::Stall = self.method(target, subch, m, words[pos + 1 + i])? {
                    return Ok(Progress::Stalled { at: pos });
                }
            }
            pos += 1 + count;
        }
        Ok(Progress::Done)
    }

    fn method(
        &mut self,
        target: &dyn PbdmaTarget,
        subch: u32,
        method: u32,
        data: u32,
    ) -> Result<Step, PbdmaFault> {
        // Anything that is not a host method is engine work.
        if subch != 0 || method >= 0x40 {
            return Ok(Step::Continue);
        }

        match method {
            SEMAPHORE_A => {
                self.sema_va = (u64::from(data & 0xff) << 32) | (self.sema_va & 0xffff_ffff);
            }
            SEMAPHORE_B => {
                self.sema_va = (self.sema_va & !0xffff_ffff) | u64::from(data & !0x3);
            }
            SEMAPHORE_C => self.sema_payload = data,
            SEMAPHORE_D => match data & 0x7 {
                SEMAPHORE_D_OPERATION_ACQUIRE | SEMAPHORE_D_OPERATION_ACQ_GEQ => {
                    let cur = target
                        .sema_read(self.sema_va)
                        .ok_or(PbdmaFault::BadSemaphore(self.sema_va))?;
                    let met = if data & 0x7 == SEMAPHORE_D_OPERATION_ACQUIRE {
                        cur == self.sema_payload
                    } else {
                        counter_reached(cur, self.sema_payload)
                    };
                    if !met {
                        return Ok(Step::Stall);
                    }
                }
                SEMAPHORE_D_OPERATION_RELEASE => {
                    if !target.sema_write(self.sema_va, self.sema_payload) {
                        return Err(PbdmaFault::BadSemaphore(self.sema_va));
                    }
                }
                _ => {}
            },
            NON_STALL_INT => target.nonstall_interrupt(),
            SYNCPOINT_A => self.syncpt_payload = data,
            SYNCPOINT_B => {
                let id = (data >> 8) & 0xfff;
                if data & 0x1 == SYNCPOINT_B_OPERATION_INCR {
                    target.syncpt_incr(id);
                } else if !counter_reached(target.syncpt_read(id), self.syncpt_payload) {
                    return Ok(Step::Stall);
                }
            }
            _ => {}
        }
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Fake {
        syncpts: RefCell<HashMap<u32, u32>>,
        semas: RefCell<HashMap<u64, u32>>,
        nonstall: Cell<u32>,
    }

    impl PbdmaTarget for Fake {
        fn syncpt_read(&self, id: u32) -> u32 {
            self.syncpts.borrow().get(&id).copied().unwrap_or(0)
        }
        fn syncpt_incr(&self, id: u32) {
            *self.syncpts.borrow_mut().entry(id).or_default() += 1;
        }
        fn sema_read(&self, gpu_va: u64) -> Option<u32> {
            self.semas.borrow().get(&gpu_va).copied()
        }
        fn sema_write(&self, gpu_va: u64, value: u32) -> bool {
            self.semas.borrow_mut().insert(gpu_va, value);
            true
        }
        fn nonstall_interrupt(&self) {
            self.nonstall.set(self.nonstall.get() + 1);
        }
    }

    #[test]
    fn entry_layout() {
        let e = GpfifoEntry::new(0x12_3456_7000, 6);
        assert_eq!(e.entry0, 0x3456_7000);
        assert_eq!(e.entry1, 0x12 | (6 << 10));
        assert_eq!(e.gpu_va(), 0x12_3456_7000);
        assert_eq!(e.num_words(), 6);
    }

    #[test]
    fn syncpoint_wait_stalls_until_reached() {
        let hw = Fake::default();
        let words = [
            incr_header(SYNCPOINT_A, 1),
            1,
            incr_header(SYNCPOINT_B, 1),
            syncpoint_b(7, SYNCPOINT_B_OPERATION_WAIT | SYNCPOINT_B_WAIT_SWITCH_ENABLED),
        ];
        let mut st = PbdmaState::default();
        assert_eq!(st.execute(&hw, &words, 0), Ok(Progress::Stalled { at: 2 }));
        hw.syncpt_incr(7);
        assert_eq!(st.execute(&hw, &words, 2), Ok(Progress::Done));
    }

    #[test]
    fn semaphore_release_then_interrupt() {
        let hw = Fake::default();
        let words = [
            incr_header(SEMAPHORE_A, 1),
            0x1,
            incr_header(SEMAPHORE_B, 1),
            0x2000,
            incr_header(SEMAPHORE_C, 1),
            9,
            incr_header(SEMAPHORE_D, 1),
            SEMAPHORE_D_OPERATION_RELEASE,
            incr_header(NON_STALL_INT, 1),
            0,
        ];
        let mut st = PbdmaState::default();
        assert_eq!(st.execute(&hw, &words, 0), Ok(Progress::Done));
        assert_eq!(hw.sema_read(0x1_0000_2000), Some(9));
        assert_eq!(hw.nonstall.get(), 1);
    }

    #[test]
    fn truncated_group_faults() {
        let hw = Fake::default();
        let words = [incr_header(SEMAPHORE_A, 3), 0];
        let mut st = PbdmaState::default();
        assert_eq!(st.execute(&hw, &words, 0), Err(PbdmaFault::Truncated(0)));
    }
}
