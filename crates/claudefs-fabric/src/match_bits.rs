//! Match bit encoding.
//!
//! Match bits route an inbound fabric operation to the buffer expecting it.
//! The high [`TMID_BITS`] bits carry the transfer machine identifier of the
//! endpoint that owns the buffer; the remaining low bits carry a per-endpoint
//! counter. A counter of zero is reserved for unsolicited message delivery.

/// Number of high-order bits used for the transfer machine identifier.
pub const TMID_BITS: u32 = 12;

/// Largest transfer machine identifier (`2^12 - 1`).
pub const TMID_MAX: u32 = (1 << TMID_BITS) - 1;

/// Number of low-order bits used for the buffer counter.
pub const COUNTER_BITS: u32 = 64 - TMID_BITS;

/// Smallest counter value assigned to a buffer.
pub const COUNTER_MIN: u64 = 1;

/// Largest counter value (`2^52 - 1`).
pub const COUNTER_MAX: u64 = (1 << COUNTER_BITS) - 1;

/// Counter value used for unsolicited messages.
pub const COUNTER_UNSOLICITED: u64 = 0;

/// Packs a transfer machine identifier and a counter into match bits.
#[inline]
pub fn encode(tmid: u32, counter: u64) -> u64 {
    debug_assert!(tmid <= TMID_MAX);
    debug_assert!(counter <= COUNTER_MAX);
    (u64::from(tmid) << COUNTER_BITS) | (counter & COUNTER_MAX)
}

/// Splits match bits into the transfer machine identifier and the counter.
#[inline]
pub fn decode(bits: u64) -> (u32, u64) {
    ((bits >> COUNTER_BITS) as u32, bits & COUNTER_MAX)
}

/// Returns the counter following `counter`, wrapping from [`COUNTER_MAX`] back to [`COUNTER_MIN`].
#[inline]
pub fn next(counter: u64) -> u64 {
    if counter >= COUNTER_MAX {
        COUNTER_MIN
    } else {
        counter + 1
    }
}

/// Returns true if the bits address an endpoint's unsolicited receive buffers.
#[inline]
pub fn is_unsolicited(bits: u64) -> bool {
    decode(bits).1 == COUNTER_UNSOLICITED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reverses_encode_at_bounds() {
        let cases = [
            (0, 0),
            (TMID_MAX, 0),
            (TMID_MAX, COUNTER_MIN),
            (TMID_MAX, COUNTER_MAX),
            (0, COUNTER_MAX),
            (1234, 98765),
        ];
        for (tmid, counter) in cases {
            assert_eq!(decode(encode(tmid, counter)), (tmid, counter));
        }
    }

    #[test]
    fn test_tmid_occupies_high_bits() {
        assert_eq!(encode(1, 0), 1u64 << 52);
        assert_eq!(encode(TMID_MAX, COUNTER_MAX), u64::MAX);
    }

    #[test]
    fn test_next_wraps_to_min() {
        assert_eq!(next(COUNTER_MIN), 2);
        assert_eq!(next(COUNTER_MAX - 1), COUNTER_MAX);
        assert_eq!(next(COUNTER_MAX), COUNTER_MIN);
    }

    #[test]
    fn test_unsolicited_bits() {
        assert!(is_unsolicited(encode(17, COUNTER_UNSOLICITED)));
        assert!(!is_unsolicited(encode(17, COUNTER_MIN)));
    }
}
