//! Utility functions for identifiers and hashing

use bech32::Bech32m;
use chrono::Utc;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Human readable project id: creation time plus a monotonic counter, so ids
/// sort by registration order and never collide within one database.
pub fn new_project_id(counter: u64) -> String {
    format!("GB-{}-{:06}", Utc::now().timestamp(), counter)
}

// hex encoded sha256 of arbitrary bytes, used as a content identifier
pub fn content_digest(bytes: &[u8]) -> String {
    sha256::digest(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_embed_counter() {
        let id = new_project_id(42);
        assert!(id.starts_with("GB-"));
        assert!(id.ends_with("-000042"));
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(content_digest(b"report"), content_digest(b"report"));
        assert_ne!(content_digest(b"report"), content_digest(b"report2"));
    }
}
