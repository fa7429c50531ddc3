use sha2::{Digest, Sha256};

/// Segment count for rule pass percentages: `hash % 10_000` is compared
/// against `passPercentage * 100`.
pub(crate) const PASS_PERCENTAGE_SEGMENTS: u64 = 10_000;

/// Segment count for `user_bucket` conditions.
pub(crate) const USER_BUCKET_SEGMENTS: u64 = 1_000;

/// Deterministic string-to-u64 mapping shared with the server's bucketing:
/// the first 8 bytes of the SHA-256 digest, interpreted as a big-endian
/// unsigned 64-bit integer. Changing this breaks assignment parity with
/// server-computed buckets.
pub(crate) fn user_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}
