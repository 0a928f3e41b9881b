use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agentgate_chain::{AppendLog, ChainError, ChainRecord, ListFilter, VerifyReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Fact,
    Observation,
    Inference,
    Commitment,
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::Fact
    }
}

#[derive(Debug, Deserialize)]
pub struct NewEntry {
    pub key: String,
    pub value: Value,
    #[serde(rename = "type", default)]
    pub kind: MemoryType,
    #[serde(default = "default_truth_state")]
    pub truth_state: i8,
}

fn default_truth_state() -> i8 {
    1
}

/// Wire view of one memory record. Erased records keep their chain
/// coordinates but render with the redaction marker as their value and
/// a retracted truth state.
#[derive(Clone, Debug, Serialize)]
pub struct MemoryEntry {
    pub hash: String,
    pub prev_hash: String,
    pub timestamp_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: Value,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryType>,
    pub truth_state: i8,
    pub erased: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryFilter {
    pub key: Option<String>,
    pub kind: Option<MemoryType>,
    pub include_erased: bool,
}

/// Content-addressed memory chain. One [`AppendLog`] per service; the
/// chain is the storage, there is no secondary index.
pub struct MemoryService {
    chain: AppendLog,
}

impl MemoryService {
    pub fn new(chain: AppendLog) -> Self {
        Self { chain }
    }

    pub fn append(&self, entry: NewEntry) -> Result<MemoryEntry, ChainError> {
        let content = json!({
            "key": entry.key,
            "value": entry.value,
            "type": entry.kind,
            "truth_state": entry.truth_state,
        });
        let record = self.chain.append(content)?;
        Ok(render(record))
    }

    pub fn list(
        &self,
        filter: &MemoryFilter,
        limit: usize,
        offset: usize,
    ) -> (Vec<MemoryEntry>, usize) {
        let mut chain_filter = ListFilter::default();
        if let Some(key) = &filter.key {
            chain_filter = chain_filter.field("key", json!(key));
        }
        if let Some(kind) = filter.kind {
            chain_filter = chain_filter.field("type", json!(kind));
        }
        if filter.include_erased {
            chain_filter = chain_filter.with_erased();
        }
        let (records, total) = self.chain.list(&chain_filter, limit, offset);
        (records.into_iter().map(render).collect(), total)
    }

    /// Newest non-erased entry for the key.
    pub fn latest(&self, key: &str) -> Option<MemoryEntry> {
        let filter = ListFilter::default().field("key", json!(key));
        let (records, _) = self.chain.list(&filter, usize::MAX, 0);
        records.into_iter().last().map(render)
    }

    /// Redact the newest non-erased entry for the key. `None` when the
    /// key has no live entry.
    pub fn erase(&self, key: &str) -> Result<Option<MemoryEntry>, ChainError> {
        let filter = ListFilter::default().field("key", json!(key));
        let (records, _) = self.chain.list(&filter, usize::MAX, 0);
        let target = match records.last() {
            Some(record) => record.hash.clone(),
            None => return Ok(None),
        };
        self.chain.erase(&target)?;
        Ok(self.chain.get(&target).map(render))
    }

    pub fn verify(&self) -> VerifyReport {
        self.chain.verify()
    }
}

fn render(record: ChainRecord) -> MemoryEntry {
    if record.erased {
        return MemoryEntry {
            hash: record.hash,
            prev_hash: record.prev_hash,
            timestamp_ns: record.timestamp_ns,
            key: None,
            value: record.content,
            kind: None,
            truth_state: -1,
            erased: true,
        };
    }
    let key = record
        .content
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string);
    let kind = record
        .content
        .get("type")
        .cloned()
        .and_then(|kind| serde_json::from_value(kind).ok());
    let truth_state = record
        .content
        .get("truth_state")
        .and_then(Value::as_i64)
        .unwrap_or(0) as i8;
    let value = record.content.get("value").cloned().unwrap_or(Value::Null);
    MemoryEntry {
        hash: record.hash,
        prev_hash: record.prev_hash,
        timestamp_ns: record.timestamp_ns,
        key,
        value,
        kind,
        truth_state,
        erased: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MemoryService {
        MemoryService::new(AppendLog::in_memory())
    }

    fn entry(key: &str, value: &str, kind: MemoryType) -> NewEntry {
        NewEntry {
            key: key.to_string(),
            value: json!(value),
            kind,
            truth_state: 1,
        }
    }

    #[test]
    fn append_and_list() {
        let service = service();
        service.append(entry("k1", "a", MemoryType::Fact)).unwrap();
        service
            .append(entry("k2", "b", MemoryType::Observation))
            .unwrap();

        let (entries, total) = service.list(&MemoryFilter::default(), 10, 0);
        assert_eq!(total, 2);
        assert_eq!(entries[0].key.as_deref(), Some("k1"));
        assert_eq!(entries[0].kind, Some(MemoryType::Fact));
        assert_eq!(entries[0].truth_state, 1);

        let filter = MemoryFilter {
            kind: Some(MemoryType::Observation),
            ..MemoryFilter::default()
        };
        let (entries, total) = service.list(&filter, 10, 0);
        assert_eq!(total, 1);
        assert_eq!(entries[0].key.as_deref(), Some("k2"));
    }

    #[test]
    fn latest_returns_newest_for_key() {
        let service = service();
        service.append(entry("k", "old", MemoryType::Fact)).unwrap();
        service.append(entry("k", "new", MemoryType::Fact)).unwrap();

        let latest = service.latest("k").expect("entry");
        assert_eq!(latest.value, json!("new"));
        assert!(service.latest("missing").is_none());
    }

    #[test]
    fn erase_redacts_and_keeps_chain_valid() {
        let service = service();
        service.append(entry("a", "first", MemoryType::Fact)).unwrap();
        let victim = service.append(entry("b", "secret", MemoryType::Fact)).unwrap();
        let tail = service.append(entry("c", "third", MemoryType::Fact)).unwrap();

        let erased = service.erase("b").unwrap().expect("erased entry");
        assert!(erased.erased);
        assert_eq!(erased.truth_state, -1);
        assert_eq!(erased.hash, victim.hash);
        let marker = erased.value.as_str().unwrap();
        assert!(marker.starts_with("[ERASED:"));
        assert!(!marker.contains("secret"));

        let report = service.verify();
        assert!(report.valid);
        assert_eq!(report.total, 3);

        // The successor still points at the unchanged hash.
        assert_eq!(tail.prev_hash, victim.hash);
        // The key no longer resolves.
        assert!(service.latest("b").is_none());
        assert!(service.erase("b").unwrap().is_none());
    }

    #[test]
    fn listings_exclude_erased_unless_requested() {
        let service = service();
        service.append(entry("a", "x", MemoryType::Fact)).unwrap();
        service.append(entry("b", "y", MemoryType::Fact)).unwrap();
        service.erase("b").unwrap();

        let (_, total) = service.list(&MemoryFilter::default(), 10, 0);
        assert_eq!(total, 1);

        let filter = MemoryFilter {
            include_erased: true,
            ..MemoryFilter::default()
        };
        let (entries, total) = service.list(&filter, 10, 0);
        assert_eq!(total, 2);
        assert!(entries[1].erased);
    }
}
