//! Content fingerprints for cache lookups and duplicate detection.
//!
//! The fingerprint is a fuzzy identity, not a digest: payloads above
//! [`FULL_HASH_LIMIT`] are sampled at three fixed windows (head, middle,
//! tail) plus their total length, so hashing a 20 MB photograph costs the
//! same as hashing 48 KiB. Collisions only cause a cache hit that a forced
//! rescan can correct.

use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

/// Size of each sampled window.
pub const SAMPLE_WINDOW: usize = 16 * 1024;

/// Payloads up to this size are hashed in full.
pub const FULL_HASH_LIMIT: usize = 3 * SAMPLE_WINDOW;

/// Fingerprint a raw page payload.
///
/// Deterministic for identical input. Empty input yields a random token so
/// ingestion never fails; such pages simply never hit the cache.
pub fn content_hash(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return format!("rnd-{}", Uuid::new_v4().simple());
    }

    let mut hasher = Xxh3::new();
    hasher.update(&(bytes.len() as u64).to_le_bytes());

    if bytes.len() <= FULL_HASH_LIMIT {
        hasher.update(bytes);
    } else {
        let mid = bytes.len() / 2 - SAMPLE_WINDOW / 2;
        hasher.update(&bytes[..SAMPLE_WINDOW]);
        hasher.update(&bytes[mid..mid + SAMPLE_WINDOW]);
        hasher.update(&bytes[bytes.len() - SAMPLE_WINDOW..]);
    }

    format!("{:032x}", hasher.digest128())
}

/// Fingerprint an extracted text block.
pub fn text_hash(text: &str) -> String {
    content_hash(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_input_identical_hash() {
        let data = vec![7u8; 1000];
        assert_eq!(content_hash(&data), content_hash(&data));
        assert_eq!(content_hash(&data).len(), 32);
    }

    #[test]
    fn different_input_different_hash() {
        assert_ne!(content_hash(b"page one"), content_hash(b"page two"));
    }

    #[test]
    fn empty_input_yields_random_token() {
        let a = content_hash(&[]);
        let b = content_hash(&[]);
        assert!(a.starts_with("rnd-"));
        assert_ne!(a, b);
    }

    #[test]
    fn large_input_is_sampled() {
        let mut a = vec![0u8; FULL_HASH_LIMIT * 4];
        let b = a.clone();
        // A byte outside every sampled window does not change the fingerprint…
        a[SAMPLE_WINDOW + 10] = 1;
        assert_eq!(content_hash(&a), content_hash(&b));
        // …but one inside the head window does.
        a[0] = 1;
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn length_participates_in_hash() {
        let a = vec![0u8; FULL_HASH_LIMIT * 4];
        let b = vec![0u8; FULL_HASH_LIMIT * 4 + 1];
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn text_hash_matches_bytes() {
        assert_eq!(text_hash("abc"), content_hash(b"abc"));
    }
}
