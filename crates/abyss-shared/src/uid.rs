use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use xxhash_rust::xxh3::xxh3_128_with_seed;

use crate::constants::UID_HASH_SEED;

/// Database key for a resource: base64 of the seeded XXH3-128 of the
/// relative path. Fixed width, never the plaintext path; hash collisions
/// are ignored (128-bit space).
pub fn resource_uid(relative_path: &str) -> String {
    let digest = xxh3_128_with_seed(relative_path.as_bytes(), UID_HASH_SEED);
    BASE64.encode(digest.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(resource_uid("Videos/a/b"), resource_uid("Videos/a/b"));
    }

    #[test]
    fn distinct_paths_distinct_uids() {
        assert_ne!(resource_uid("Videos"), resource_uid("Images"));
        assert_ne!(resource_uid("Videos/a"), resource_uid("Videos/a/"));
    }

    #[test]
    fn fixed_width() {
        // 16 bytes -> 24 base64 chars including padding.
        assert_eq!(resource_uid("").len(), 24);
        assert_eq!(resource_uid("Videos/some/long/nested/path/file.mp4").len(), 24);
    }
}
