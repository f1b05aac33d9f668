/// Difficulty math on 256-bit values
///
/// `diff1` is the largest 256-bit value. A hash meets difficulty `d` when
/// `diff1 / hash >= d`, with the hash read as a little-endian integer.

use num_bigint::BigUint;
use num_traits::{One, Zero};

/// 2^256 - 1
pub fn diff1() -> BigUint {
    (BigUint::one() << 256u32) - BigUint::one()
}

/// Difficulty a hash actually reaches. An all-zero hash reaches `diff1`.
pub fn hash_difficulty(hash: &[u8; 32]) -> BigUint {
    let value = BigUint::from_bytes_le(hash);
    if value.is_zero() {
        return diff1();
    }
    diff1() / value
}

pub fn meets_difficulty(hash: &[u8; 32], difficulty: u64) -> bool {
    hash_difficulty(hash) >= BigUint::from(difficulty)
}

/// Full 256-bit target for a difficulty, big-endian.
pub fn target_bytes(difficulty: u64) -> [u8; 32] {
    let target = diff1() / BigUint::from(difficulty.max(1));
    let bytes = target.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Compact job target: the four most significant bytes of `diff1 / d`,
/// byte-reversed and hex encoded.
pub fn target_hex(difficulty: u64) -> String {
    let full = target_bytes(difficulty);
    let mut head = [full[0], full[1], full[2], full[3]];
    head.reverse();
    hex::encode(head)
}
