#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    if align == 0 {
        return val;
    }
    val.div_ceil(align) * align
}

/// [`align_up`] reporting overflow as `None`.
#[must_use]
pub const fn checked_align_up(val: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(val);
    }
    val.div_ceil(align).checked_mul(align)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    if align == 0 {
        return val;
    }
    (val / align) * align
}

/// Next power of two, keeping zero as zero.
#[must_use]
pub const fn next_pow2(val: u32) -> u32 {
    if val == 0 { 0 } else { val.next_power_of_two() }
}

/// Floor of log2; zero maps to zero.
#[must_use]
pub const fn log2_floor(val: u32) -> u32 {
    if val == 0 { 0 } else { 31 - val.leading_zeros() }
}

#[must_use]
pub const fn is_pow2(val: u64) -> bool {
    val != 0 && (val & (val - 1)) == 0
}

/// Bytes needed to hold `count` elements of `bits` bits each.
#[must_use]
pub const fn bits_to_bytes(count: u64, bits: u32) -> u64 {
    (count * bits as u64).div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(400, 64), 448);
        assert_eq!(align_up(448, 64), 448);
        assert_eq!(align_down(524_290, 4096), 520_192);
        assert_eq!(align_up(17, 0), 17);
        assert_eq!(checked_align_up(400, 64), Some(448));
        assert_eq!(checked_align_up(u64::MAX, 64), None);
        assert_eq!(checked_align_up(u64::MAX, 0), Some(u64::MAX));
    }

    #[test]
    fn pow2_helpers() {
        assert_eq!(next_pow2(17), 32);
        assert_eq!(next_pow2(10), 16);
        assert_eq!(next_pow2(0), 0);
        assert_eq!(log2_floor(32), 5);
        assert_eq!(log2_floor(1), 0);
        assert!(is_pow2(4096));
        assert!(!is_pow2(0));
        assert!(!is_pow2(96));
    }

    #[test]
    fn sub_byte_rows_round_up() {
        assert_eq!(bits_to_bytes(100, 32), 400);
        assert_eq!(bits_to_bytes(3, 1), 1);
        assert_eq!(bits_to_bytes(9, 1), 2);
        assert_eq!(bits_to_bytes(5, 4), 3);
    }
}
