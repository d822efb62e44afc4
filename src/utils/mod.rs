use std::time::Instant;

use once_cell::sync::Lazy;

/// Number of hash slots in a Redis cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Compute CRC16 (XMODEM) hash over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Trim a key down to its `{hash-tag}` segment according to the Redis
/// Cluster specification. Keys without a non-empty tag hash whole.
pub fn trim_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(begin) = key.iter().position(|&b| b == b'{') {
        if let Some(offset) = key[begin + 1..].iter().position(|&b| b == b'}') {
            if offset > 0 {
                let start_idx = begin + 1;
                return &key[start_idx..start_idx + offset];
            }
        }
    }
    key
}

/// Hash slot owning `key`.
pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(trim_hash_tag(key)) % SLOT_COUNT
}

/// Fold `next` into an accumulated slot constraint.
///
/// `None` means "no slot yet". Both sides carrying different slots makes
/// the whole message invalid for cluster execution.
pub fn combine_slot(current: Option<u16>, next: u16) -> Result<Option<u16>, SlotConflict> {
    match current {
        None => Ok(Some(next)),
        Some(existing) if existing == next => Ok(Some(existing)),
        Some(existing) => Err(SlotConflict {
            first: existing,
            second: next,
        }),
    }
}

/// Two keys of one message map to different hash slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotConflict {
    pub first: u16,
    pub second: u16,
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on the process-wide monotonic clock. Never returns zero so
/// callers can use zero as the "unset" marker in atomics.
pub fn monotonic_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_hash_tag_extracts_segment() {
        assert_eq!(trim_hash_tag(b"user:{42}:profile"), b"42");
    }

    #[test]
    fn trim_hash_tag_returns_key_when_missing() {
        let key = b"plain-key";
        assert_eq!(trim_hash_tag(key), key);
    }

    #[test]
    fn trim_hash_tag_ignores_empty_tag() {
        let key = b"foo{}bar";
        assert_eq!(trim_hash_tag(key), key);
    }

    #[test]
    fn trim_hash_tag_uses_first_closing_brace() {
        assert_eq!(trim_hash_tag(b"{a}{b}"), b"a");
        assert_eq!(trim_hash_tag(b"x{{y}}"), b"{y");
    }

    #[test]
    fn known_slots_match_redis() {
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"123456789"), 12739);
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn same_tag_hashes_to_same_slot() {
        let a = hash_slot(b"{user1000}.following");
        let b = hash_slot(b"{user1000}.followers");
        assert_eq!(a, b);
        assert_eq!(combine_slot(combine_slot(None, a).unwrap(), b), Ok(Some(a)));
    }

    #[test]
    fn different_slots_conflict() {
        let a = hash_slot(b"foo");
        let b = hash_slot(b"bar");
        assert_ne!(a, b);
        assert!(combine_slot(Some(a), b).is_err());
    }

    #[test]
    fn monotonic_millis_is_never_zero() {
        assert!(monotonic_millis() > 0);
    }
}
