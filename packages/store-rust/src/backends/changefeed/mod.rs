//! Document-database backend with native changefeeds.
//!
//! Reads come from the cache, which is fed only by the changefeed: initial
//! documents first, then live changes. `save` does not write through; it
//! enqueues the document on a bounded commit queue drained by a pool of
//! writer tasks and returns immediately. The write becomes visible through
//! `network`/`member` when the feed echoes it back. The queue is sharded by
//! document key so writes to one record commit in order.
//!
//! Writes in flight are tracked per key so that consecutive saves compare
//! against the latest accepted value rather than the (older) cached one,
//! and so the echo of a silent save stays silent.

mod memory;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use confdb_core::{
    ClockSource, MemberId, MemberRecord, NetworkId, NetworkRecord, NetworkSummary, Record,
    RecordKey, SystemClock,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use memory::MemoryChangefeed;

use crate::config::ChangefeedConfig;
use crate::events::{StoreEvent, StoreId};
use crate::lifecycle::{Probe, StopSignal};
use crate::presence::{PresenceBuffer, PresenceUpdate};
use crate::store::{ConfigStore, StoreCore};

/// Document tables the backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedTable {
    Networks,
    Members,
    MemberStatus,
}

/// Changefeed state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Initial documents are being delivered.
    Initializing,
    /// Every initial document has been delivered; live changes follow.
    Ready,
}

/// One changefeed message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    State(FeedState),
    /// A document change. `old: None` is an insert (or an initial document);
    /// `new: None` is a delete.
    Change {
        old: Option<Value>,
        new: Option<Value>,
    },
}

/// Connection to the document database.
#[async_trait]
pub trait ChangefeedClient: Send + Sync {
    /// Opens a changefeed over `table` that first replays every document.
    /// The feed ends (the receiver closes) when the connection drops.
    ///
    /// # Errors
    ///
    /// Returns an error when the feed cannot be opened.
    async fn subscribe(&self, table: FeedTable) -> anyhow::Result<mpsc::Receiver<FeedMessage>>;

    /// Inserts or replaces one document.
    ///
    /// # Errors
    ///
    /// Returns an error when the write is not acknowledged.
    async fn upsert(&self, table: FeedTable, key: &str, doc: Value) -> anyhow::Result<()>;

    /// Deletes one document. Deleting a missing document succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete is not acknowledged.
    async fn delete(&self, table: FeedTable, key: &str) -> anyhow::Result<()>;
}

/// Document key of a record.
#[must_use]
pub fn document_key(key: RecordKey) -> (FeedTable, String) {
    match key {
        RecordKey::Network(network_id) => (FeedTable::Networks, network_id.to_hex()),
        RecordKey::Member(network_id, member_id) => (
            FeedTable::Members,
            format!("{}-{}", network_id.to_hex(), member_id.to_hex()),
        ),
    }
}

/// A write accepted by `save`/`erase` and not yet echoed by the feed.
#[derive(Debug, Clone)]
struct Pending {
    /// `None` for an erase.
    record: Option<Record>,
    notify_listeners: bool,
}

impl Pending {
    fn revision(&self) -> Option<u64> {
        self.record.as_ref().map(Record::revision)
    }
}

/// One queued document write.
#[derive(Debug)]
struct Commit {
    table: FeedTable,
    doc_key: String,
    /// `None` deletes the document.
    doc: Option<Value>,
    /// Record behind the write, for failure bookkeeping. `None` for
    /// presence documents.
    record_key: Option<RecordKey>,
    revision: Option<u64>,
}

/// Bounded commit queue, one shard per writer task.
#[derive(Clone)]
struct CommitQueue {
    shards: Vec<mpsc::Sender<Commit>>,
}

impl CommitQueue {
    fn new(writers: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<Commit>>) {
        let writers = writers.max(1);
        let per_shard = (capacity / writers).max(1);
        let (shards, receivers): (Vec<_>, Vec<_>) =
            (0..writers).map(|_| mpsc::channel(per_shard)).unzip();
        (Self { shards }, receivers)
    }

    fn try_send(&self, commit: Commit) -> Result<(), mpsc::error::TrySendError<Commit>> {
        let hash = commit
            .doc_key
            .bytes()
            .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)));
        self.shards[hash % self.shards.len()].try_send(commit)
    }
}

const NETWORKS_READY: u8 = 1;
const MEMBERS_READY: u8 = 1 << 1;

struct Inner {
    core: StoreCore,
    client: Arc<dyn ChangefeedClient>,
    config: ChangefeedConfig,
    pending: DashMap<RecordKey, Pending>,
    presence: PresenceBuffer,
    feeds_ready: AtomicU8,
}

/// Changefeed-fed backend with an asynchronous commit pool.
pub struct ChangefeedStore {
    inner: Arc<Inner>,
    commits: CommitQueue,
}

impl ChangefeedStore {
    /// Starts the feeds, the writer pool and the presence flusher. The store
    /// becomes ready once both record feeds have replayed their documents.
    #[must_use]
    pub fn open(config: ChangefeedConfig, client: Arc<dyn ChangefeedClient>) -> Self {
        Self::open_with_clock(config, client, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn open_with_clock(
        config: ChangefeedConfig,
        client: Arc<dyn ChangefeedClient>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let (commits, receivers) = CommitQueue::new(config.writer_tasks, config.queue_capacity);
        let inner = Arc::new(Inner {
            core: StoreCore::new("changefeed", clock),
            client,
            config,
            pending: DashMap::new(),
            presence: PresenceBuffer::new(),
            feeds_ready: AtomicU8::new(0),
        });

        let lifecycle = inner.core.lifecycle();
        for table in [FeedTable::Networks, FeedTable::Members] {
            lifecycle.spawn(feed_loop(Arc::clone(&inner), table, lifecycle.stop_signal()));
        }
        for (worker, rx) in receivers.into_iter().enumerate() {
            lifecycle.spawn(commit_worker(
                Arc::clone(&inner),
                worker,
                rx,
                lifecycle.stop_signal(),
            ));
        }
        lifecycle.spawn(presence_loop(
            Arc::clone(&inner),
            commits.clone(),
            lifecycle.stop_signal(),
        ));

        Self { inner, commits }
    }

    /// Number of accepted writes not yet echoed by the feed.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.len()
    }

    fn enqueue(&self, commit: Commit) -> bool {
        match self.commits.try_send(commit) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(commit)) => {
                warn!(doc_key = %commit.doc_key, "commit queue full, write rejected");
                false
            }
            Err(mpsc::error::TrySendError::Closed(commit)) => {
                warn!(doc_key = %commit.doc_key, "commit queue closed, write rejected");
                false
            }
        }
    }

    fn enqueue_erase(&self, key: RecordKey, notify_listeners: bool) {
        let (table, doc_key) = document_key(key);
        self.inner.pending.insert(
            key,
            Pending {
                record: None,
                notify_listeners,
            },
        );
        let queued = self.enqueue(Commit {
            table,
            doc_key,
            doc: None,
            record_key: Some(key),
            revision: None,
        });
        if !queued {
            self.inner.pending.remove_if(&key, |_, p| p.record.is_none());
        }
    }
}

impl Drop for ChangefeedStore {
    fn drop(&mut self) {
        self.inner.core.lifecycle().request_stop();
    }
}

impl Inner {
    /// Applies one feed message. Returns `true` when the table's initial
    /// replay just finished.
    fn handle(&self, table: FeedTable, message: FeedMessage) -> bool {
        match message {
            FeedMessage::State(FeedState::Ready) => return true,
            FeedMessage::State(FeedState::Initializing) => {}
            FeedMessage::Change { old, new } => {
                let new = new.filter(|v| !v.is_null());
                let decoded = match (new, old.filter(|v| !v.is_null())) {
                    (Some(doc), _) => decode(table, doc).map(Ok),
                    (None, Some(doc)) => decode(table, doc).map(|r| Err(r.key())),
                    (None, None) => return false,
                };
                match decoded {
                    Ok(Ok(record)) => self.ingest(record),
                    Ok(Err(key)) => self.ingest_removal(key),
                    Err(err) => warn!(?table, error = %err, "dropping undecodable document"),
                }
            }
        }
        false
    }

    /// Ingests a delivered record. The echo of a pending write takes its
    /// notify flag from the write and retires it.
    fn ingest(&self, record: Record) {
        let key = record.key();
        let mut notify = true;
        if let Some((_, pending)) = self
            .pending
            .remove_if(&key, |_, p| p.revision().is_some_and(|r| r <= record.revision()))
        {
            if pending.revision() == Some(record.revision()) {
                notify = pending.notify_listeners;
            }
        }
        self.core.ingest(record, notify);
    }

    fn ingest_removal(&self, key: RecordKey) {
        let notify = self
            .pending
            .remove_if(&key, |_, p| p.record.is_none())
            .map_or(true, |(_, p)| p.notify_listeners);
        if self.core.ingest_removal(key, notify) && matches!(key, RecordKey::Network(_)) {
            self.core.record_gauges();
        }
    }

    fn mark_feed_ready(&self, table: FeedTable) {
        let bit = match table {
            FeedTable::Networks => NETWORKS_READY,
            FeedTable::Members => MEMBERS_READY,
            FeedTable::MemberStatus => return,
        };
        let ready = self.feeds_ready.fetch_or(bit, Ordering::AcqRel) | bit;
        if ready == NETWORKS_READY | MEMBERS_READY && !self.core.lifecycle().is_ready() {
            info!(
                networks = self.core.index().networks().len(),
                members = self.core.index().member_count(),
                "changefeed store loaded"
            );
            self.core.record_gauges();
            self.core.lifecycle().set_ready();
        }
    }

    /// Performs one queued write, retrying per the write policy.
    async fn execute(&self, commit: Commit, stop: &mut StopSignal) {
        let policy = self.config.write_retry;
        let mut attempt = 0u32;
        loop {
            let result = match &commit.doc {
                Some(doc) => self.client.upsert(commit.table, &commit.doc_key, doc.clone()).await,
                None => self.client.delete(commit.table, &commit.doc_key).await,
            };
            let err = match result {
                Ok(()) => {
                    self.core.lifecycle().report(Probe::Writes, true);
                    return;
                }
                Err(err) => err,
            };
            attempt += 1;
            if policy.exhausted(attempt) || !stop.sleep(policy.backoff(attempt)).await {
                self.abandon(&commit, &err);
                return;
            }
            debug!(doc_key = %commit.doc_key, attempt, error = %err, "retrying document write");
        }
    }

    fn abandon(&self, commit: &Commit, err: &anyhow::Error) {
        self.core.lifecycle().report(Probe::Writes, false);
        match commit.record_key {
            Some(key) => {
                self.pending
                    .remove_if(&key, |_, p| p.revision() == commit.revision);
                self.core.record_failed_save(key, err);
            }
            None => warn!(doc_key = %commit.doc_key, error = %err, "presence write abandoned"),
        }
    }
}

fn decode(table: FeedTable, doc: Value) -> Result<Record, serde_json::Error> {
    match table {
        FeedTable::Networks => NetworkRecord::from_value(doc).map(Record::Network),
        FeedTable::Members | FeedTable::MemberStatus => {
            MemberRecord::from_value(doc).map(Record::Member)
        }
    }
}

fn status_document(update: &PresenceUpdate) -> Value {
    json!({
        "id": format!("{}-{}", update.network_id.to_hex(), update.member_id.to_hex()),
        "nwid": update.network_id.to_hex(),
        "memberId": update.member_id.to_hex(),
        "lastOnlineTime": update.timestamp,
        "lastOnlineAddress": update.address_string(),
    })
}

async fn feed_loop(inner: Arc<Inner>, table: FeedTable, mut stop: StopSignal) {
    let retry = inner.config.reconnect;
    let mut attempt = 0u32;
    while !stop.is_stopped() {
        match inner.client.subscribe(table).await {
            Ok(mut feed) => {
                debug!(?table, "changefeed open");
                loop {
                    let message = tokio::select! {
                        () = stop.stopped() => break,
                        message = feed.recv() => message,
                    };
                    let Some(message) = message else { break };
                    if inner.handle(table, message) {
                        attempt = 0;
                        inner.core.lifecycle().report(Probe::ChangeCapture, true);
                        inner.mark_feed_ready(table);
                    }
                }
                if stop.is_stopped() {
                    break;
                }
                attempt += 1;
                inner.core.lifecycle().report(Probe::ChangeCapture, false);
                warn!(?table, attempt, "changefeed closed, reconnecting");
            }
            Err(err) => {
                attempt += 1;
                inner.core.lifecycle().report(Probe::ChangeCapture, false);
                warn!(?table, attempt, error = %err, "changefeed subscribe failed");
            }
        }
        if retry.exhausted(attempt) {
            error!(?table, "changefeed retries exhausted, giving up");
            break;
        }
        if !stop.sleep(retry.backoff(attempt)).await {
            break;
        }
    }
    debug!(?table, "changefeed reader stopped");
}

async fn commit_worker(
    inner: Arc<Inner>,
    worker: usize,
    mut commits: mpsc::Receiver<Commit>,
    mut stop: StopSignal,
) {
    loop {
        let next = tokio::select! {
            biased;
            commit = commits.recv() => commit,
            () = stop.stopped() => None,
        };
        let Some(commit) = next else { break };
        inner.execute(commit, &mut stop).await;
    }
    debug!(worker, "commit worker stopped");
}

async fn presence_loop(inner: Arc<Inner>, commits: CommitQueue, mut stop: StopSignal) {
    let cadence = inner.config.presence_flush;
    while stop.sleep(cadence.next_delay()).await {
        let updates = inner.presence.drain();
        let mut unsent = Vec::new();
        for update in updates {
            if inner.core.index().member(update.network_id, update.member_id).is_none() {
                continue;
            }
            let commit = Commit {
                table: FeedTable::MemberStatus,
                doc_key: format!("{}-{}", update.network_id.to_hex(), update.member_id.to_hex()),
                doc: Some(status_document(&update)),
                record_key: None,
                revision: None,
            };
            if commits.try_send(commit).is_err() {
                unsent.push(update);
            }
        }
        if !unsent.is_empty() {
            debug!(deferred = unsent.len(), "commit queue full, presence deferred");
            inner.presence.restore(unsent);
        }
        metrics::counter!("confdb_presence_flush_total", "backend" => "changefeed").increment(1);
    }
    debug!("presence flusher stopped");
}

#[async_trait]
impl ConfigStore for ChangefeedStore {
    fn id(&self) -> StoreId {
        self.inner.core.id()
    }

    fn kind(&self) -> &'static str {
        self.inner.core.kind()
    }

    fn network(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        self.inner.core.index().network(network_id)
    }

    fn member(&self, network_id: NetworkId, member_id: MemberId) -> Option<MemberRecord> {
        self.inner.core.index().member(network_id, member_id)
    }

    fn members(&self, network_id: NetworkId) -> Vec<MemberRecord> {
        self.inner.core.index().members(network_id)
    }

    fn summary(&self, network_id: NetworkId) -> Option<NetworkSummary> {
        self.inner.core.index().summary(network_id)
    }

    fn networks(&self) -> Vec<NetworkId> {
        self.inner.core.index().networks()
    }

    /// Enqueues the write and returns without waiting for it. `true` means
    /// accepted for commit, not durable.
    async fn save(&self, record: Record, notify_listeners: bool) -> bool {
        let core = &self.inner.core;
        let key = record.key();
        let latest = match self.inner.pending.get(&key) {
            Some(pending) => pending.record.clone(),
            None => core.current(key),
        };
        let Some(write) = core.prepare_against(latest, record) else {
            return false;
        };
        let doc = match write.new.to_value() {
            Ok(doc) => doc,
            Err(err) => {
                core.record_failed_save(key, &err);
                return false;
            }
        };
        let (table, doc_key) = document_key(key);
        let revision = write.new.revision();
        self.inner.pending.insert(
            key,
            Pending {
                record: Some(write.new),
                notify_listeners,
            },
        );
        let queued = self.enqueue(Commit {
            table,
            doc_key,
            doc: Some(doc),
            record_key: Some(key),
            revision: Some(revision),
        });
        if !queued {
            self.inner
                .pending
                .remove_if(&key, |_, p| p.revision() == Some(revision));
            core.record_failed_save(key, &"commit queue full");
        }
        queued
    }

    /// Tombstones every member of the network, cached or still pending,
    /// then the network itself.
    async fn erase_network(&self, network_id: NetworkId, notify_listeners: bool) {
        let mut member_ids: BTreeSet<MemberId> = self
            .inner
            .core
            .index()
            .members(network_id)
            .into_iter()
            .map(|m| m.id)
            .collect();
        member_ids.extend(self.inner.pending.iter().filter_map(|entry| match *entry.key() {
            RecordKey::Member(nid, mid) if nid == network_id && entry.record.is_some() => Some(mid),
            _ => None,
        }));
        for member_id in member_ids {
            self.enqueue_erase(RecordKey::Member(network_id, member_id), false);
        }
        self.enqueue_erase(RecordKey::Network(network_id), notify_listeners);
    }

    async fn erase_member(&self, network_id: NetworkId, member_id: MemberId, notify_listeners: bool) {
        self.enqueue_erase(RecordKey::Member(network_id, member_id), notify_listeners);
    }

    fn node_is_online(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        address: Option<SocketAddr>,
    ) {
        self.inner
            .presence
            .record(network_id, member_id, self.inner.core.now(), address);
    }

    fn is_ready(&self) -> bool {
        self.inner.core.lifecycle().is_ready()
    }

    async fn wait_for_ready(&self) -> bool {
        self.inner.core.lifecycle().wait_for_ready().await
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.inner.core.events().subscribe()
    }

    async fn shutdown(&self) {
        self.inner.core.lifecycle().shutdown().await;
        let unflushed = self.inner.presence.len();
        if unflushed > 0 {
            debug!(unflushed, "presence not flushed at shutdown");
        }
    }
}
