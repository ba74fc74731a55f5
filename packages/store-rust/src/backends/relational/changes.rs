//! Change capture for the relational backend.
//!
//! Changes arrive either as database notifications (one channel per table,
//! scoped to the controller) or from an external broker queue. Both carry
//! the same envelope: `{"old_val": <record|null>, "new_val": <record|null>}`
//! with records in their canonical JSON form.

use std::time::Duration;

use async_trait::async_trait;
use confdb_core::{MemberRecord, NetworkRecord, Record, RecordKey};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::lifecycle::{Probe, StopSignal};
use crate::store::StoreCore;

/// Table a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTable {
    Network,
    Member,
}

impl ChangeTable {
    /// Notification channel for this table, scoped to one controller.
    #[must_use]
    pub fn channel(self, controller_id: &str) -> String {
        match self {
            Self::Network => format!("network_{controller_id}"),
            Self::Member => format!("member_{controller_id}"),
        }
    }

    /// Maps a notification channel name back to its table.
    #[must_use]
    pub fn from_channel(channel: &str, controller_id: &str) -> Option<Self> {
        [Self::Network, Self::Member]
            .into_iter()
            .find(|table| table.channel(controller_id) == channel)
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    old_val: Option<Value>,
    #[serde(default)]
    new_val: Option<Value>,
}

/// A decoded change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEnvelope {
    Upsert(Record),
    Removal(RecordKey),
}

impl ChangeEnvelope {
    /// Decodes a notification payload. A `new_val` flagged `"deleted": true`
    /// is a soft delete and decodes as a removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not an envelope, or if neither side
    /// carries a usable record.
    pub fn parse(table: ChangeTable, payload: &str) -> anyhow::Result<Self> {
        let raw: RawEnvelope = serde_json::from_str(payload)?;
        let new_val = raw.new_val.filter(|v| !v.is_null());
        let old_val = raw.old_val.filter(|v| !v.is_null());
        match new_val {
            Some(new) if !is_deleted(&new) => Ok(Self::Upsert(decode(table, new)?)),
            Some(new) => Ok(Self::Removal(decode(table, new)?.key())),
            None => {
                let old = old_val.ok_or_else(|| anyhow::anyhow!("envelope carries no record"))?;
                Ok(Self::Removal(decode(table, old)?.key()))
            }
        }
    }

    /// Applies the change to the cache. Returns `true` when it changed.
    pub fn apply(self, core: &StoreCore, notify_listeners: bool) -> bool {
        match self {
            Self::Upsert(record) => core.ingest(record, notify_listeners),
            Self::Removal(key) => core.ingest_removal(key, notify_listeners),
        }
    }
}

fn is_deleted(value: &Value) -> bool {
    value.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

fn decode(table: ChangeTable, value: Value) -> anyhow::Result<Record> {
    Ok(match table {
        ChangeTable::Network => Record::Network(NetworkRecord::from_value(value)?),
        ChangeTable::Member => Record::Member(MemberRecord::from_value(value)?),
    })
}

/// Decodes and applies one notification, logging undecodable payloads.
pub fn ingest_payload(core: &StoreCore, table: ChangeTable, payload: &str) -> bool {
    match ChangeEnvelope::parse(table, payload) {
        Ok(change) => change.apply(core, true),
        Err(err) => {
            warn!(?table, error = %err, "dropping undecodable change notification");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Broker queue
// ---------------------------------------------------------------------------

/// One message consumed from a broker queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedChange {
    pub table: ChangeTable,
    pub payload: String,
}

/// External broker delivering change envelopes.
#[async_trait]
pub trait ChangeQueue: Send + Sync {
    /// Waits up to `timeout` for messages and returns what arrived (possibly
    /// nothing).
    ///
    /// # Errors
    ///
    /// Returns an error when the broker connection fails.
    async fn consume(&self, timeout: Duration) -> anyhow::Result<Vec<QueuedChange>>;
}

/// In-process [`ChangeQueue`] fed through a channel. Bridges any broker
/// client the embedding controller already runs.
pub struct ChannelQueue {
    rx: Mutex<mpsc::Receiver<QueuedChange>>,
}

impl ChannelQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (mpsc::Sender<QueuedChange>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl ChangeQueue for ChannelQueue {
    async fn consume(&self, timeout: Duration) -> anyhow::Result<Vec<QueuedChange>> {
        let mut rx = self.rx.lock().await;
        let first = match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => anyhow::bail!("change queue closed"),
            Ok(Some(first)) => first,
        };
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        Ok(batch)
    }
}

const CONSUME_TIMEOUT: Duration = Duration::from_secs(1);

/// Drains `queue` into `core` until stopped or the retry budget runs out.
/// Consumer failures mark the change-capture probe unhealthy until the next
/// successful consume.
pub async fn drain_queue(
    core: &StoreCore,
    queue: &dyn ChangeQueue,
    mut stop: StopSignal,
    retry: RetryPolicy,
) {
    let mut attempt = 0u32;
    while !stop.is_stopped() {
        let consumed = tokio::select! {
            result = queue.consume(CONSUME_TIMEOUT) => result,
            () = stop.stopped() => break,
        };
        match consumed {
            Ok(batch) => {
                attempt = 0;
                core.lifecycle().report(Probe::ChangeCapture, true);
                for change in batch {
                    ingest_payload(core, change.table, &change.payload);
                }
            }
            Err(err) => {
                attempt += 1;
                core.lifecycle().report(Probe::ChangeCapture, false);
                if retry.exhausted(attempt) {
                    error!(backend = core.kind(), error = %err, "change queue failed, giving up");
                    break;
                }
                warn!(backend = core.kind(), attempt, error = %err, "change queue consume failed");
                if !stop.sleep(retry.backoff(attempt)).await {
                    break;
                }
            }
        }
    }
    debug!(backend = core.kind(), "change queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use confdb_core::{ManualClock, MemberId, NetworkId};
    use serde_json::json;

    use super::*;
    use crate::lifecycle::StoreState;

    fn nwid() -> NetworkId {
        NetworkId::new(0x1234_5678_90ab_cdef).unwrap()
    }

    fn member_doc(revision: u64, authorized: bool) -> Value {
        json!({
            "id": "0102030405",
            "nwid": "1234567890abcdef",
            "authorized": authorized,
            "revision": revision,
        })
    }

    #[test]
    fn channel_names_are_controller_scoped() {
        assert_eq!(ChangeTable::Member.channel("abc"), "member_abc");
        assert_eq!(
            ChangeTable::from_channel("network_abc", "abc"),
            Some(ChangeTable::Network)
        );
        assert_eq!(ChangeTable::from_channel("network_xyz", "abc"), None);
    }

    #[test]
    fn envelope_kinds() {
        let upsert = json!({"old_val": null, "new_val": member_doc(1, true)}).to_string();
        assert!(matches!(
            ChangeEnvelope::parse(ChangeTable::Member, &upsert).unwrap(),
            ChangeEnvelope::Upsert(Record::Member(_))
        ));

        let removed = json!({"old_val": member_doc(1, true), "new_val": null}).to_string();
        let soft = json!({"new_val": {"id": "1234567890abcdef", "deleted": true}}).to_string();
        let key = RecordKey::Member(nwid(), MemberId::new(0x01_0203_0405).unwrap());
        assert_eq!(
            ChangeEnvelope::parse(ChangeTable::Member, &removed).unwrap(),
            ChangeEnvelope::Removal(key)
        );
        assert_eq!(
            ChangeEnvelope::parse(ChangeTable::Network, &soft).unwrap(),
            ChangeEnvelope::Removal(RecordKey::Network(nwid()))
        );

        assert!(ChangeEnvelope::parse(ChangeTable::Member, "{}").is_err());
        assert!(ChangeEnvelope::parse(ChangeTable::Member, "not json").is_err());
    }

    #[test]
    fn stale_notification_is_ignored() {
        let core = StoreCore::new("test", Arc::new(ManualClock::new(0)));
        let newer = json!({"new_val": member_doc(3, true)}).to_string();
        let older = json!({"new_val": member_doc(2, false)}).to_string();
        assert!(ingest_payload(&core, ChangeTable::Member, &newer));
        assert!(!ingest_payload(&core, ChangeTable::Member, &older));
        let m = core
            .index()
            .member(nwid(), MemberId::new(0x01_0203_0405).unwrap())
            .unwrap();
        assert!(m.authorized);
        assert_eq!(m.revision, 3);
    }

    struct FlakyQueue {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChangeQueue for FlakyQueue {
        async fn consume(&self, _timeout: Duration) -> anyhow::Result<Vec<QueuedChange>> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => anyhow::bail!("broker unreachable"),
                1 => Ok(vec![QueuedChange {
                    table: ChangeTable::Member,
                    payload: json!({"new_val": member_doc(1, false)}).to_string(),
                }]),
                _ => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_failures_degrade_until_recovered() {
        let core = Arc::new(StoreCore::new("test", Arc::new(ManualClock::new(0))));
        core.lifecycle().set_ready();
        let queue = Arc::new(FlakyQueue {
            calls: AtomicUsize::new(0),
        });
        let stop = core.lifecycle().stop_signal();
        let task = {
            let core = Arc::clone(&core);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                drain_queue(&core, queue.as_ref(), stop, RetryPolicy::default()).await;
            })
        };

        tokio::task::yield_now().await;
        assert_eq!(core.lifecycle().state(), StoreState::Degraded);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(core.lifecycle().is_ready());
        assert_eq!(core.index().member_count(), 1);

        core.lifecycle().request_stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn channel_queue_batches_and_times_out() {
        let (tx, queue) = ChannelQueue::new(8);
        for _ in 0..3 {
            tx.send(QueuedChange {
                table: ChangeTable::Network,
                payload: String::new(),
            })
            .await
            .unwrap();
        }
        assert_eq!(queue.consume(Duration::from_millis(10)).await.unwrap().len(), 3);
        assert!(queue.consume(Duration::from_millis(10)).await.unwrap().is_empty());
        drop(tx);
        assert!(queue.consume(Duration::from_millis(10)).await.is_err());
    }
}
