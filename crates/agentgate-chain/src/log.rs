use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::record::{digest, erased_marker, ChainRecord, GENESIS};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("journal io: {0}")]
    Journal(#[from] std::io::Error),
    #[error("journal encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of a full chain walk.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct VerifyReport {
    pub valid: bool,
    pub total: usize,
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid: Option<String>,
}

/// Equality filter over top-level content fields. Erased records are
/// excluded from listings unless `include_erased` opts in.
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub fields: Vec<(String, Value)>,
    pub include_erased: bool,
}

impl ListFilter {
    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.push((key.to_string(), value));
        self
    }

    pub fn with_erased(mut self) -> Self {
        self.include_erased = true;
        self
    }

    fn matches(&self, record: &ChainRecord) -> bool {
        if record.erased && !self.include_erased {
            return false;
        }
        self.fields
            .iter()
            .all(|(key, expected)| record.content.get(key) == Some(expected))
    }
}

struct Inner {
    records: Vec<ChainRecord>,
    head: String,
    last_ts: u64,
    trimmed: usize,
    journal: Option<File>,
}

/// Append-only chained record store.
///
/// Appends are serialized under one lock covering head read, timestamp
/// assignment, hash computation, the in-memory push, and the journal
/// line write, so on-disk order always equals in-memory order. Readers
/// take the same lock briefly and copy out; they can never observe a
/// record whose predecessor is absent.
pub struct AppendLog {
    inner: Mutex<Inner>,
    retain: Option<usize>,
}

impl AppendLog {
    /// Unbounded in-memory chain with no journal.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                head: GENESIS.to_string(),
                last_ts: 0,
                trimmed: 0,
                journal: None,
            }),
            retain: None,
        }
    }

    /// In-memory chain keeping only the `retain` most recent records.
    /// The chain head survives trimming, so appends stay linked.
    pub fn bounded(retain: usize) -> Self {
        Self {
            retain: Some(retain.max(1)),
            ..Self::in_memory()
        }
    }

    /// Open a chain backed by a JSON-line journal, replaying any existing
    /// records. Trailing partial or invalid lines are tolerated; the head
    /// is seeded from the last valid line.
    pub fn open(journal: &Path) -> Result<Self, ChainError> {
        let mut records: Vec<ChainRecord> = Vec::new();
        if journal.exists() {
            let reader = BufReader::new(File::open(journal)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: ChainRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(_) => break,
                };
                // An erase re-appends the redacted record under its
                // original hash; replay folds it back in place.
                if let Some(existing) =
                    records.iter_mut().find(|existing| existing.hash == record.hash)
                {
                    *existing = record;
                } else {
                    records.push(record);
                }
            }
        }

        let head = records
            .last()
            .map(|record| record.hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());
        let last_ts = records.last().map(|record| record.timestamp_ns).unwrap_or(0);
        let file = OpenOptions::new().create(true).append(true).open(journal)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                records,
                head,
                last_ts,
                trimmed: 0,
                journal: Some(file),
            }),
            retain: None,
        })
    }

    /// Journal-backed when a path is configured, otherwise an in-memory
    /// buffer bounded to the given retention.
    pub fn open_or_bounded(journal: Option<&PathBuf>, retain: usize) -> Result<Self, ChainError> {
        match journal {
            Some(path) => Self::open(path),
            None => Ok(Self::bounded(retain)),
        }
    }

    pub fn append(&self, content: Value) -> Result<ChainRecord, ChainError> {
        self.append_at(content, now_ns())
    }

    fn append_at(&self, content: Value, now: u64) -> Result<ChainRecord, ChainError> {
        let mut inner = self.inner.lock();
        let timestamp_ns = if now <= inner.last_ts {
            inner.last_ts + 1
        } else {
            now
        };
        let record = ChainRecord {
            hash: digest(&inner.head, &content, timestamp_ns),
            prev_hash: inner.head.clone(),
            timestamp_ns,
            content,
            erased: false,
        };
        if let Some(journal) = inner.journal.as_mut() {
            let line = serde_json::to_string(&record)?;
            writeln!(journal, "{line}")?;
        }
        inner.head = record.hash.clone();
        inner.last_ts = timestamp_ns;
        inner.records.push(record.clone());
        if let Some(retain) = self.retain {
            if inner.records.len() > retain {
                let excess = inner.records.len() - retain;
                inner.records.drain(..excess);
                inner.trimmed += excess;
            }
        }
        Ok(record)
    }

    /// Matching records in chain order, paginated, plus the total match count.
    pub fn list(&self, filter: &ListFilter, limit: usize, offset: usize) -> (Vec<ChainRecord>, usize) {
        let inner = self.inner.lock();
        let matching: Vec<&ChainRecord> = inner
            .records
            .iter()
            .filter(|record| filter.matches(record))
            .collect();
        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    pub fn get(&self, hash: &str) -> Option<ChainRecord> {
        let inner = self.inner.lock();
        inner.records.iter().find(|record| record.hash == hash).cloned()
    }

    /// Redact a record in place. Its content becomes the erase marker and
    /// `erased` is set; `hash` and `prev_hash` are preserved, so later
    /// records still verify. Returns false when the hash is unknown.
    pub fn erase(&self, hash: &str) -> Result<bool, ChainError> {
        let mut inner = self.inner.lock();
        let index = match inner.records.iter().position(|record| record.hash == hash) {
            Some(index) => index,
            None => return Ok(false),
        };
        if inner.records[index].erased {
            return Ok(true);
        }
        let marker = erased_marker(&inner.records[index].content);
        inner.records[index].content = Value::String(marker);
        inner.records[index].erased = true;
        let line = serde_json::to_string(&inner.records[index])?;
        if let Some(journal) = inner.journal.as_mut() {
            writeln!(journal, "{line}")?;
        }
        Ok(true)
    }

    /// Walk the chain: check `prev_hash` linkage for every record and
    /// recompute the hash of every non-erased record. Stops at the first
    /// deviation and reports the offending hash.
    pub fn verify(&self) -> VerifyReport {
        let inner = self.inner.lock();
        let total = inner.records.len();
        let mut checked = 0;
        for (index, record) in inner.records.iter().enumerate() {
            checked += 1;
            let linked = if index == 0 {
                // After trimming, the first retained record's predecessor
                // is no longer in memory; linkage starts at the next one.
                inner.trimmed > 0 || record.prev_hash == GENESIS
            } else {
                record.prev_hash == inner.records[index - 1].hash
            };
            let intact = record.erased
                || digest(&record.prev_hash, &record.content, record.timestamp_ns) == record.hash;
            if !linked || !intact {
                return VerifyReport {
                    valid: false,
                    total,
                    checked,
                    first_invalid: Some(record.hash.clone()),
                };
            }
        }
        VerifyReport {
            valid: true,
            total,
            checked,
            first_invalid: None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_links_and_verifies() {
        let log = AppendLog::in_memory();
        for index in 0..5 {
            log.append(json!({"seq": index})).unwrap();
        }
        let report = log.verify();
        assert!(report.valid);
        assert_eq!(report.total, 5);
        assert_eq!(report.checked, 5);

        let (records, total) = log.list(&ListFilter::default(), 10, 0);
        assert_eq!(total, 5);
        assert_eq!(records[0].prev_hash, GENESIS);
        for pair in records.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }
    }

    #[test]
    fn timestamps_never_regress() {
        let log = AppendLog::in_memory();
        let first = log.append_at(json!("a"), 1_000).unwrap();
        let second = log.append_at(json!("b"), 500).unwrap();
        assert_eq!(first.timestamp_ns, 1_000);
        assert_eq!(second.timestamp_ns, 1_001);
    }

    #[test]
    fn erase_preserves_linkage_and_neighbors() {
        let log = AppendLog::in_memory();
        let _a = log.append(json!("a")).unwrap();
        let b = log.append(json!("b")).unwrap();
        let c = log.append(json!("c")).unwrap();

        assert!(log.erase(&b.hash).unwrap());
        let report = log.verify();
        assert!(report.valid, "erase must not break the chain: {report:?}");

        let erased = log.get(&b.hash).expect("record kept");
        assert!(erased.erased);
        let marker = erased.content.as_str().unwrap();
        assert!(marker.starts_with("[ERASED:") && marker.len() == "[ERASED:]".len() + 16);
        assert_eq!(erased.hash, b.hash);
        assert_eq!(erased.prev_hash, b.prev_hash);

        let third = log.get(&c.hash).unwrap();
        assert_eq!(third.prev_hash, b.hash);
        assert_eq!(third.hash, c.hash);
    }

    #[test]
    fn erase_unknown_hash_reports_false() {
        let log = AppendLog::in_memory();
        log.append(json!("a")).unwrap();
        assert!(!log.erase("deadbeef").unwrap());
    }

    #[test]
    fn listings_exclude_erased_by_default() {
        let log = AppendLog::in_memory();
        log.append(json!({"key": "k1", "value": "v1"})).unwrap();
        let victim = log.append(json!({"key": "k2", "value": "v2"})).unwrap();
        log.erase(&victim.hash).unwrap();

        let (records, total) = log.list(&ListFilter::default(), 10, 0);
        assert_eq!(total, 1);
        assert_eq!(records[0].content["key"], "k1");

        let (records, total) = log.list(&ListFilter::default().with_erased(), 10, 0);
        assert_eq!(total, 2);
        assert!(records[1].erased);
    }

    #[test]
    fn field_filter_and_pagination() {
        let log = AppendLog::in_memory();
        for index in 0..6 {
            let kind = if index % 2 == 0 { "fact" } else { "observation" };
            log.append(json!({"type": kind, "seq": index})).unwrap();
        }
        let filter = ListFilter::default().field("type", json!("fact"));
        let (records, total) = log.list(&filter, 2, 1);
        assert_eq!(total, 3);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content["seq"], 2);
        assert_eq!(records[1].content["seq"], 4);
    }

    #[test]
    fn journal_replay_restores_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.jsonl");

        let head = {
            let log = AppendLog::open(&path).unwrap();
            log.append(json!("a")).unwrap();
            log.append(json!("b")).unwrap();
            log.append(json!("c")).unwrap().hash
        };

        let reopened = AppendLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 3);
        assert!(reopened.verify().valid);

        let appended = reopened.append(json!("d")).unwrap();
        assert_eq!(appended.prev_hash, head);
        assert!(reopened.verify().valid);
    }

    #[test]
    fn journal_tolerates_trailing_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.jsonl");
        {
            let log = AppendLog::open(&path).unwrap();
            log.append(json!("a")).unwrap();
            log.append(json!("b")).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"hash\":\"trunc").unwrap();
        }

        let reopened = AppendLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.verify().valid);
    }

    #[test]
    fn erase_survives_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.jsonl");
        let victim = {
            let log = AppendLog::open(&path).unwrap();
            log.append(json!("a")).unwrap();
            let victim = log.append(json!("b")).unwrap();
            log.append(json!("c")).unwrap();
            log.erase(&victim.hash).unwrap();
            victim
        };

        let reopened = AppendLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 3);
        let record = reopened.get(&victim.hash).unwrap();
        assert!(record.erased);
        assert!(record.content.as_str().unwrap().starts_with("[ERASED:"));
        assert!(reopened.verify().valid);
    }

    #[test]
    fn bounded_buffer_trims_but_stays_linked() {
        let log = AppendLog::bounded(3);
        for index in 0..10 {
            log.append(json!({"seq": index})).unwrap();
        }
        assert_eq!(log.len(), 3);
        let report = log.verify();
        assert!(report.valid);
        assert_eq!(report.total, 3);

        let (records, _) = log.list(&ListFilter::default(), 10, 0);
        assert_eq!(records[0].content["seq"], 7);
        assert_eq!(records[2].content["seq"], 9);
    }
}
