//! In-process [`LedgerClient`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{LedgerClient, LedgerQuery, MakeRecord, QueryResult, RecordMeta, Selector};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    timestamp: u64,
    owner: String,
}

/// Append-only ledger held in memory.
///
/// Every accepted record is appended under its selector set; a pulse with
/// an unchanged value only refreshes the newest entry's timestamp.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<BTreeMap<Vec<Selector>, Vec<Entry>>>,
    offline: AtomicBool,
    submissions: AtomicUsize,
    queries: AtomicUsize,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Entries ever appended, across all selector sets.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    /// Accepted `make_record` calls, pulses included.
    #[must_use]
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Newest value stored under `selectors`.
    #[must_use]
    pub fn latest(&self, selectors: &[Selector]) -> Option<String> {
        self.entries
            .lock()
            .get(selectors)
            .and_then(|e| e.last())
            .map(|e| e.value.clone())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("ledger node unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn make_record(&self, record: &MakeRecord) -> Result<()> {
        self.check_online()?;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        let history = entries.entry(record.selectors.clone()).or_default();
        if record.pulse_if_unchanged {
            if let Some(last) = history.last_mut() {
                if last.value == record.value && last.owner == record.owner_private {
                    last.timestamp = last.timestamp.max(record.timestamp);
                    return Ok(());
                }
            }
        }
        history.push(Entry {
            value: record.value.clone(),
            timestamp: record.timestamp,
            owner: record.owner_private.clone(),
        });
        Ok(())
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<Vec<QueryResult>>> {
        self.check_online()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        let [from, to] = query.time_range;
        let entries = self.entries.lock();
        let results = entries
            .iter()
            .filter(|(selectors, _)| {
                selectors.len() == query.ranges.len()
                    && selectors.iter().zip(&query.ranges).all(|(s, r)| {
                        s.name == r.name && (r.range[0]..=r.range[1]).contains(&s.ordinal)
                    })
            })
            .filter_map(|(_, history)| {
                let candidates: Vec<QueryResult> = history
                    .iter()
                    .rev()
                    .filter(|e| query.owners.is_empty() || query.owners.contains(&e.owner))
                    .filter(|e| (from..=to).contains(&e.timestamp))
                    .map(|e| QueryResult {
                        value: e.value.clone(),
                        record: RecordMeta {
                            timestamp: e.timestamp,
                        },
                    })
                    .collect();
                (!candidates.is_empty()).then_some(candidates)
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ledger::client::SelectorRange;

    fn record(ordinal: u64, value: &str, timestamp: u64, pulse: bool) -> MakeRecord {
        MakeRecord {
            selectors: vec![Selector {
                name: "n".into(),
                ordinal,
            }],
            value: value.into(),
            owner_private: "o".into(),
            masking_key: "m".into(),
            timestamp,
            pulse_if_unchanged: pulse,
        }
    }

    fn query(from: u64, to: u64) -> LedgerQuery {
        LedgerQuery {
            ranges: vec![SelectorRange::all("n")],
            time_range: [from, to],
            masking_key: "m".into(),
            owners: vec!["o".into()],
        }
    }

    #[tokio::test]
    async fn pulse_refreshes_instead_of_appending() {
        let ledger = MemoryLedger::new();
        ledger.make_record(&record(1, "a", 10, true)).await.unwrap();
        ledger.make_record(&record(1, "a", 20, true)).await.unwrap();
        assert_eq!(ledger.entry_count(), 1);
        assert_eq!(ledger.submissions(), 2);
        ledger.make_record(&record(1, "a", 30, false)).await.unwrap();
        assert_eq!(ledger.entry_count(), 2);

        let found = ledger.query(&query(15, 25)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0][0].record.timestamp, 20);
    }

    #[tokio::test]
    async fn query_returns_newest_candidate_first() {
        let ledger = MemoryLedger::new();
        ledger.make_record(&record(1, "old", 10, false)).await.unwrap();
        ledger.make_record(&record(1, "new", 11, false)).await.unwrap();
        ledger.make_record(&record(2, "other", 100, false)).await.unwrap();
        let found = ledger.query(&query(0, 50)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0][0].value, "new");

        ledger.set_offline(true);
        assert!(ledger.query(&query(0, 50)).await.is_err());
    }
}
