use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `prev_hash` of the first record in every chain.
pub const GENESIS: &str = "GENESIS";

/// One link in a chain. Journal lines are exactly this shape, one per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub hash: String,
    pub prev_hash: String,
    pub timestamp_ns: u64,
    pub content: Value,
    #[serde(default)]
    pub erased: bool,
}

/// Canonical textual form of record content.
///
/// serde_json's default object representation keeps keys in lexicographic
/// order, so compact serialization is stable across append and verify.
/// The same form feeds both the chain digest and the erase marker.
pub fn canonical_json(content: &Value) -> String {
    content.to_string()
}

/// Chained fingerprint: SHA-256 over `prev_hash:canonical(content):timestamp_ns`.
pub fn digest(prev_hash: &str, content: &Value, timestamp_ns: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(content).as_bytes());
    hasher.update(b":");
    hasher.update(timestamp_ns.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Redaction marker carrying the first 16 hex chars of the original
/// content's SHA-256, so an erased record still names what it replaced.
pub fn erased_marker(content: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(content).as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    format!("[ERASED:{}]", &hex[..16])
}
