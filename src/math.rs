//! Numeric helpers for sizes and alignments.

/// Round `value` up to the next multiple of `multiple`.
pub(crate) fn round_up(value: u64, multiple: u64) -> u64 {
    debug_assert!(multiple > 0);
    ((value + multiple - 1) / multiple) * multiple
}

/// The smallest power of two greater than or equal to `value`.
pub(crate) fn next_pow2_ge(value: u64) -> u64 {
    value.max(1).next_power_of_two()
}

/// The largest power of two less than or equal to `value`.
pub(crate) fn prev_pow2_le(value: u64) -> u64 {
    debug_assert!(value > 0);
    let ceiling = value.next_power_of_two();
    if ceiling == value {
        value
    } else {
        ceiling >> 1
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Least common multiple of two non-zero values.
pub(crate) fn lcm(a: u64, b: u64) -> u64 {
    debug_assert!(a > 0 && b > 0);
    a / gcd(a, b) * b
}
