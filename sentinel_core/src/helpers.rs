//! Helper functions shared by the tables, routes and dispatch

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

/// Length-first label comparison: the longer label is always greater;
/// equal-length labels compare bytewise.
#[inline]
pub fn label_cmp(left: &[u8], right: &[u8]) -> Ordering {
    left.len()
        .cmp(&right.len())
        .then_with(|| left.cmp(right))
}

#[inline(always)]
pub const fn bits_to_bytes(bits: u16) -> usize {
    (bits as usize + 7) >> 3
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

// Packs a slot index and generation into a single u64 node id.
#[inline]
pub fn pack(index: u32, gen: u32) -> u64 {
    ((gen as u64) << 32) | (index as u64)
}

#[inline]
pub fn unpack(id: u64) -> (u32, u32) {
    (id as u32, (id >> 32) as u32)
}

/// CAS loop that sets `set` and clears `clear` in `word`, returning the
/// value before and after. No store happens when nothing would change.
pub fn atomic_update(word: &AtomicU32, set: u32, clear: u32) -> (u32, u32) {
    let mut pre = word.load(AtomicOrdering::Acquire);
    loop {
        let post = (pre | set) & !clear;
        if post == pre {
            return (pre, post);
        }
        match word.compare_exchange_weak(pre, post, AtomicOrdering::AcqRel, AtomicOrdering::Acquire) {
            Ok(_) => return (pre, post),
            Err(actual) => pre = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_cmp_is_length_first() {
        assert_eq!(label_cmp(b"b", b"aa"), Ordering::Less);
        assert_eq!(label_cmp(b"zzz", b"aa"), Ordering::Greater);
        assert_eq!(label_cmp(b"ab", b"ab"), Ordering::Equal);
        assert_eq!(label_cmp(b"ab", b"ac"), Ordering::Less);
    }

    #[test]
    fn pack_roundtrip_keeps_generation() {
        let id = pack(7, 3);
        assert_eq!(unpack(id), (7, 3));
    }

    #[test]
    fn atomic_update_set_and_clear() {
        let w = AtomicU32::new(0b0101);
        assert_eq!(atomic_update(&w, 0b0010, 0b0001), (0b0101, 0b0110));
        assert_eq!(atomic_update(&w, 0b0010, 0), (0b0110, 0b0110));
        assert_eq!(w.load(AtomicOrdering::Relaxed), 0b0110);
    }

    #[test]
    fn bits_round_up() {
        assert_eq!(bits_to_bytes(0), 0);
        assert_eq!(bits_to_bytes(1), 1);
        assert_eq!(bits_to_bytes(32), 4);
        assert_eq!(bits_to_bytes(33), 5);
        assert_eq!(align_up(5, 4), 8);
    }
}
