//! In-process [`ChangefeedClient`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChangefeedClient, FeedMessage, FeedState, FeedTable};

/// Feed buffer beyond the initial replay. A subscriber that falls this far
/// behind is disconnected, as a real feed would drop a slow consumer.
const FEED_HEADROOM: usize = 1_024;

#[derive(Default)]
struct Table {
    docs: BTreeMap<String, Value>,
    subscribers: Vec<mpsc::Sender<FeedMessage>>,
}

impl Table {
    fn broadcast(&mut self, message: &FeedMessage) {
        self.subscribers
            .retain(|tx| tx.try_send(message.clone()).is_ok());
    }
}

/// Document tables held in memory, with changefeeds.
///
/// Writes are applied and broadcast synchronously; identical rewrites emit
/// nothing. Failure injection, artificial latency and forced disconnects
/// make it usable for exercising the store's retry paths.
#[derive(Default)]
pub struct MemoryChangefeed {
    tables: Mutex<HashMap<FeedTable, Table>>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryChangefeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document without going through a write.
    pub fn seed(&self, table: FeedTable, key: &str, doc: Value) {
        self.tables
            .lock()
            .entry(table)
            .or_default()
            .docs
            .insert(key.to_string(), doc);
    }

    #[must_use]
    pub fn document(&self, table: FeedTable, key: &str) -> Option<Value> {
        self.tables.lock().get(&table)?.docs.get(key).cloned()
    }

    /// Number of documents in `table`.
    #[must_use]
    pub fn len(&self, table: FeedTable) -> usize {
        self.tables.lock().get(&table).map_or(0, |t| t.docs.len())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delays every write acknowledgement by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Closes every open feed.
    pub fn disconnect(&self) {
        for table in self.tables.lock().values_mut() {
            table.subscribers.clear();
        }
    }

    async fn before_write(&self) -> anyhow::Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("write rejected");
        }
        Ok(())
    }
}

#[async_trait]
impl ChangefeedClient for MemoryChangefeed {
    async fn subscribe(&self, table: FeedTable) -> anyhow::Result<mpsc::Receiver<FeedMessage>> {
        let mut tables = self.tables.lock();
        let table = tables.entry(table).or_default();
        let (tx, rx) = mpsc::channel(table.docs.len() + 2 + FEED_HEADROOM);
        tx.try_send(FeedMessage::State(FeedState::Initializing))?;
        for doc in table.docs.values() {
            tx.try_send(FeedMessage::Change {
                old: None,
                new: Some(doc.clone()),
            })?;
        }
        tx.try_send(FeedMessage::State(FeedState::Ready))?;
        table.subscribers.push(tx);
        Ok(rx)
    }

    async fn upsert(&self, table: FeedTable, key: &str, doc: Value) -> anyhow::Result<()> {
        self.before_write().await?;
        let mut tables = self.tables.lock();
        let table = tables.entry(table).or_default();
        let old = table.docs.insert(key.to_string(), doc.clone());
        if old.as_ref() != Some(&doc) {
            table.broadcast(&FeedMessage::Change {
                old,
                new: Some(doc),
            });
        }
        Ok(())
    }

    async fn delete(&self, table: FeedTable, key: &str) -> anyhow::Result<()> {
        self.before_write().await?;
        let mut tables = self.tables.lock();
        let table = tables.entry(table).or_default();
        if let Some(old) = table.docs.remove(key) {
            table.broadcast(&FeedMessage::Change {
                old: Some(old),
                new: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn subscribe_replays_then_streams() {
        let feed = MemoryChangefeed::new();
        feed.seed(FeedTable::Networks, "a", json!({"id": "a"}));
        let mut rx = feed.subscribe(FeedTable::Networks).await.unwrap();
        assert_eq!(rx.recv().await, Some(FeedMessage::State(FeedState::Initializing)));
        assert!(matches!(rx.recv().await, Some(FeedMessage::Change { old: None, .. })));
        assert_eq!(rx.recv().await, Some(FeedMessage::State(FeedState::Ready)));

        feed.upsert(FeedTable::Networks, "a", json!({"id": "a"})).await.unwrap();
        feed.delete(FeedTable::Networks, "a").await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(FeedMessage::Change { new: None, old: Some(_) })
        ));

        feed.disconnect();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn failed_writes_leave_documents_alone() {
        let feed = MemoryChangefeed::new();
        feed.set_fail_writes(true);
        assert!(feed.upsert(FeedTable::Members, "k", json!({})).await.is_err());
        assert_eq!(feed.len(FeedTable::Members), 0);
    }
}
