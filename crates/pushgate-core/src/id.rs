//! ID generation utilities.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a new UUID v4.
pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a SHA256 hash of the input.
pub fn sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a timestamp-based ID (useful for sorting).
///
/// Batch submission IDs use this format so that lexical order follows
/// creation order.
pub fn timestamp_id() -> String {
    use chrono::Utc;
    let now = Utc::now();
    let ts = now.format("%Y%m%d%H%M%S%3f").to_string();
    let random: [u8; 4] = rand::random();
    format!("{}-{}", ts, hex::encode(random))
}

/// Build the per-item provider ID for a batch submission.
pub fn batch_item_id(batch_id: &str, index: usize) -> String {
    format!("{}_{}", batch_id, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid() {
        let id = uuid();
        assert_eq!(id.len(), 36);
        assert!(id.contains('-'));
    }

    #[test]
    fn test_sha256() {
        let hash = sha256("hello");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_timestamp_id() {
        let id1 = timestamp_id();
        let id2 = timestamp_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), id2.len());
    }

    #[test]
    fn test_batch_item_id() {
        assert_eq!(batch_item_id("B100", 0), "B100_0");
        assert_eq!(batch_item_id("B100", 2), "B100_2");
    }
}
