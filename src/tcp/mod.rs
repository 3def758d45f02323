//! Support for inferring TCP behavior from observed segments.
//!
//! Sequence and acknowledgement numbers live in a 32-bit space which wraps, so every ordering
//! decision in this crate goes through the comparisons below instead of plain integer ordering.

pub mod congestion;
pub mod rtt;
pub mod state;

/// Returns if sequence `a` comes before sequence `b`.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Returns if sequence `a` comes before or equals sequence `b`.
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Returns if sequence `a` comes after sequence `b`.
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// Returns if sequence `a` comes after or equals sequence `b`.
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}

/// Returns the sequence `n` bytes after the given sequence.
pub fn seq_add(sequence: u32, n: u32) -> u32 {
    sequence.wrapping_add(n)
}

#[test]
fn seq_compare() {
    assert!(seq_lt(1, 2));
    assert!(!seq_lt(2, 1));
    assert!(!seq_lt(7, 7));
    assert!(seq_le(7, 7));
    assert!(seq_gt(100, 99));
    assert!(seq_ge(100, 100));
}

#[test]
fn seq_compare_across_wrap() {
    let before = u32::MAX - 10;
    let after = seq_add(before, 20);
    assert_eq!(after, 9);

    assert!(seq_lt(before, after));
    assert!(seq_gt(after, before));
    // A naive integer comparison gets this backwards
    assert!(before > after);
}

#[test]
fn seq_compare_random_pairs() {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let a: u32 = rng.gen();
        let n: u32 = rng.gen_range(1..i32::MAX as u32);
        let b = seq_add(a, n);

        assert!(seq_lt(a, b));
        assert!(seq_gt(b, a));
        assert!(!seq_lt(b, a));
    }
}
