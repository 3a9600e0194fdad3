#![allow(clippy::cast_possible_truncation)]

/// Rounds `val` up to `align`, which must be a power of two.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

#[must_use]
pub const fn div_round_up(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}

#[must_use]
pub const fn roundup(val: u64, to: u64) -> u64 {
    div_round_up(val, to) * to
}

#[must_use]
pub const fn roundup_pow_of_two(val: u64) -> u64 {
    val.next_power_of_two()
}

#[must_use]
pub const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[must_use]
pub const fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 { 0 } else { a / gcd(a, b) * b }
}

#[must_use]
pub const fn lo32(v: u64) -> u32 {
    v as u32
}

#[must_use]
pub const fn hi32(v: u64) -> u32 {
    (v >> 32) as u32
}

/// Wraparound-safe "has `value` reached `threshold`" for 32-bit hardware counters.
#[must_use]
pub const fn counter_reached(value: u32, threshold: u32) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}

// ===============================================================================================
// Bitmap
// ===============================================================================================

/// Fixed-size bitmap used for slot, comptag and active-channel tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        bit < self.len && self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        if bit < self.len {
            self.words[bit / 64] |= 1 << (bit % 64);
        }
    }

    pub fn clear(&mut self, bit: usize) {
        if bit < self.len {
            self.words[bit / 64] &= !(1 << (bit % 64));
        }
    }

    /// Sets `bit` and returns its previous state.
    pub fn test_and_set(&mut self, bit: usize) -> bool {
        let old = self.test(bit);
        self.set(bit);
        old
    }

    /// Clears `bit` and returns its previous state.
    pub fn test_and_clear(&mut self, bit: usize) -> bool {
        let old = self.test(bit);
        self.clear(bit);
        old
    }

    pub fn set_range(&mut self, start: usize, nr: usize) {
        for bit in start..(start + nr).min(self.len) {
            self.set(bit);
        }
    }

    pub fn clear_range(&mut self, start: usize, nr: usize) {
        for bit in start..(start + nr).min(self.len) {
            self.clear(bit);
        }
    }

    #[must_use]
    pub fn find_first_zero(&self) -> Option<usize> {
        self.find_next_zero_area(0, 1, 1)
    }

    /// Finds `nr` consecutive clear bits at or after `start`, beginning on a
    /// multiple of `align` (a power of two).
    #[must_use]
    pub fn find_next_zero_area(&self, start: usize, nr: usize, align: usize) -> Option<usize> {
        let align = align.max(1);
        let mut idx = start.next_multiple_of(align);
        'outer: while idx + nr <= self.len {
            for bit in idx..idx + nr {
                if self.test(bit) {
                    idx = (bit + 1).next_multiple_of(align);
                    continue 'outer;
                }
            }
            return Some(idx);
        }
        None
    }

    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&b| self.test(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x2000, 0x1000), 0x2000);
        assert_eq!(roundup(5, 3), 6);
        assert_eq!(roundup_pow_of_two(1537), 2048);
        assert_eq!(lcm(2048, 4096), 4096);
        assert_eq!(lcm(3072, 4096), 12288);
    }

    #[test]
    fn counter_compare_handles_wrap() {
        assert!(counter_reached(5, 5));
        assert!(!counter_reached(4, 5));
        assert!(counter_reached(2, u32::MAX - 1));
        assert!(!counter_reached(u32::MAX - 1, 2));
    }

    #[test]
    fn zero_area_skips_set_bits_and_respects_alignment() {
        let mut bm = Bitmap::new(32);
        bm.set_range(0, 3);
        assert_eq!(bm.find_next_zero_area(0, 2, 1), Some(3));
        assert_eq!(bm.find_next_zero_area(0, 2, 4), Some(4));
        bm.set(5);
        assert_eq!(bm.find_next_zero_area(0, 2, 4), Some(8));
        assert_eq!(bm.find_next_zero_area(0, 40, 1), None);
    }

    #[test]
    fn test_and_set_reports_previous_state() {
        let mut bm = Bitmap::new(70);
        assert!(!bm.test_and_set(65));
        assert!(bm.test_and_set(65));
        assert_eq!(bm.count_ones(), 1);
        assert!(bm.test_and_clear(65));
        assert!(!bm.test_and_clear(65));
        assert_eq!(bm.iter_ones().count(), 0);
    }
}
