//! PostgreSQL-backed [`ConfigStore`].
//!
//! Tables (all scoped by `controller_id` through `ztc_network`):
//! `ztc_network`, `ztc_network_assignment_pool`, `ztc_network_route`,
//! `ztc_member`, `ztc_member_ip_assignment`, `ztc_member_status`,
//! `ztc_network_stats`, `ztc_controller` and the one-row `ztc_database`
//! version table. Record erasure is a soft delete (`deleted = true`).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use confdb_core::{
    ClockSource, IpAssignmentPool, MemberId, MemberRecord, NetworkId, NetworkRecord,
    NetworkSummary, Record, RecordKey, Route, SystemClock,
};
use parking_lot::Mutex;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::changes::{drain_queue, ingest_payload, ChangeQueue, ChangeTable};
use super::rows::{self, MemberRow, NetworkRow, PresenceRow, StatsRow};
use crate::config::{ChangeSource, RelationalConfig};
use crate::error::StoreError;
use crate::events::{StoreEvent, StoreId};
use crate::lifecycle::{Probe, StopSignal};
use crate::presence::PresenceBuffer;
use crate::store::{ConfigStore, StoreCore};

/// Reads a nullable column, treating type mismatches as NULL.
fn col<T>(row: &PgRow, name: &str) -> Option<T>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    match row.try_get::<Option<T>, _>(name) {
        Ok(value) => value,
        Err(err) => {
            debug!(column = name, error = %err, "undecodable column, using default");
            None
        }
    }
}

/// Everything one full scan returns.
#[derive(Default)]
struct Snapshot {
    networks: Vec<NetworkRecord>,
    members: Vec<MemberRecord>,
    skipped: usize,
}

struct Inner {
    core: StoreCore,
    pool: PgPool,
    config: RelationalConfig,
    presence: PresenceBuffer,
    /// Last presence timestamp per member, for aggregate online counts.
    last_seen: Mutex<HashMap<NetworkId, HashMap<MemberId, u64>>>,
}

/// Relational backend. Bootstraps with a full scan, then follows changes
/// from the notification channel or a broker queue.
pub struct RelationalStore {
    inner: Arc<Inner>,
}

impl RelationalStore {
    /// Connects, checks the schema version, loads every record and starts
    /// the background loops.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is incomplete, the database is
    /// unreachable, or the schema is older than `min_schema_version`.
    pub async fn open(config: RelationalConfig) -> Result<Self, StoreError> {
        Self::open_with(config, None, Arc::new(SystemClock)).await
    }

    /// Like [`open`](Self::open), following changes from `queue` when the
    /// configured change source is a broker queue.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn open_with_queue(
        config: RelationalConfig,
        queue: Arc<dyn ChangeQueue>,
    ) -> Result<Self, StoreError> {
        Self::open_with(config, Some(queue), Arc::new(SystemClock)).await
    }

    async fn open_with(
        config: RelationalConfig,
        queue: Option<Arc<dyn ChangeQueue>>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, StoreError> {
        if config.url.is_empty() {
            return Err(StoreError::InvalidConfig("relational backend needs a url".into()));
        }
        if config.controller_id.is_empty() {
            return Err(StoreError::InvalidConfig(
                "relational backend needs a controller id".into(),
            ));
        }
        if config.change_source == ChangeSource::Queue && queue.is_none() {
            return Err(StoreError::InvalidConfig(
                "queue change source needs an attached change queue".into(),
            ));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        check_schema(&pool, config.min_schema_version).await?;

        let inner = Arc::new(Inner {
            core: StoreCore::new("relational", clock),
            pool,
            config,
            presence: PresenceBuffer::new(),
            last_seen: Mutex::new(HashMap::new()),
        });

        let snapshot = inner.load_snapshot().await?;
        let skipped = snapshot.skipped;
        inner.apply_snapshot(snapshot, false);
        info!(
            controller_id = %inner.config.controller_id,
            networks = inner.core.index().networks().len(),
            members = inner.core.index().member_count(),
            skipped,
            "relational store loaded"
        );
        inner.core.record_gauges();
        inner.core.lifecycle().set_ready();

        let lifecycle = inner.core.lifecycle();
        match queue {
            Some(queue) => {
                let task_inner = Arc::clone(&inner);
                let stop = lifecycle.stop_signal();
                lifecycle.spawn(async move {
                    let retry = task_inner.config.reconnect;
                    drain_queue(&task_inner.core, queue.as_ref(), stop, retry).await;
                });
            }
            None => {
                lifecycle.spawn(listen_loop(Arc::clone(&inner), lifecycle.stop_signal()));
            }
        }
        lifecycle.spawn(heartbeat_loop(Arc::clone(&inner), lifecycle.stop_signal()));
        lifecycle.spawn(presence_loop(Arc::clone(&inner), lifecycle.stop_signal()));

        Ok(Self { inner })
    }

    /// Writes pending presence now. Returns the number of rows upserted.
    ///
    /// # Errors
    ///
    /// Fails when the upsert fails; the updates stay buffered for the next
    /// flush.
    pub async fn flush_presence(&self) -> Result<usize, StoreError> {
        self.inner.flush_presence().await
    }
}

impl Drop for RelationalStore {
    fn drop(&mut self) {
        self.inner.core.lifecycle().request_stop();
    }
}

async fn check_schema(pool: &PgPool, min_version: i32) -> Result<(), StoreError> {
    let version: Option<i32> = sqlx::query_scalar("SELECT version FROM ztc_database LIMIT 1")
        .fetch_optional(pool)
        .await?;
    match version {
        Some(v) if v >= min_version => Ok(()),
        Some(v) => Err(StoreError::InvalidConfig(format!(
            "schema version {v} is older than required {min_version}"
        ))),
        None => Err(StoreError::InvalidConfig("schema version table is empty".into())),
    }
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

const NETWORKS_SQL: &str = "SELECT id, name, private, enable_broadcast, mtu, multicast_limit, \
     rules, capabilities, tags, v4_assign_mode, v6_assign_mode, dns_domain, dns_servers, \
     revision, creation_time, last_modified, config \
     FROM ztc_network WHERE controller_id = $1 AND deleted = false";

const POOLS_SQL: &str = "SELECT p.network_id, p.ip_range_start, p.ip_range_end \
     FROM ztc_network_assignment_pool p JOIN ztc_network n ON n.id = p.network_id \
     WHERE n.controller_id = $1 AND n.deleted = false";

const ROUTES_SQL: &str = "SELECT r.network_id, r.address AS target, r.via \
     FROM ztc_network_route r JOIN ztc_network n ON n.id = r.network_id \
     WHERE n.controller_id = $1 AND n.deleted = false";

const MEMBERS_SQL: &str = "SELECT m.id, m.network_id, m.authorized, m.active_bridge, \
     m.no_auto_assign_ips, m.identity, m.capabilities, m.tags, m.revision, m.creation_time, \
     m.last_authorized_time, m.last_deauthorized_time, m.v_major, m.v_minor, m.v_rev, \
     m.v_proto, m.config \
     FROM ztc_member m JOIN ztc_network n ON n.id = m.network_id \
     WHERE n.controller_id = $1 AND n.deleted = false AND m.deleted = false";

const MEMBER_IPS_SQL: &str = "SELECT a.network_id, a.member_id, a.address \
     FROM ztc_member_ip_assignment a JOIN ztc_network n ON n.id = a.network_id \
     WHERE n.controller_id = $1 AND n.deleted = false";

fn network_row(row: &PgRow) -> NetworkRow {
    NetworkRow {
        id: col(row, "id"),
        name: col(row, "name"),
        private: col(row, "private"),
        enable_broadcast: col(row, "enable_broadcast"),
        mtu: col(row, "mtu"),
        multicast_limit: col(row, "multicast_limit"),
        rules: col(row, "rules"),
        capabilities: col(row, "capabilities"),
        tags: col(row, "tags"),
        v4_assign_mode: col(row, "v4_assign_mode"),
        v6_assign_mode: col(row, "v6_assign_mode"),
        dns_domain: col(row, "dns_domain"),
        dns_servers: col(row, "dns_servers"),
        revision: col(row, "revision"),
        creation_time: col(row, "creation_time"),
        last_modified: col(row, "last_modified"),
        extra: col(row, "config"),
    }
}

fn member_row(row: &PgRow) -> MemberRow {
    MemberRow {
        id: col(row, "id"),
        network_id: col(row, "network_id"),
        authorized: col(row, "authorized"),
        active_bridge: col(row, "active_bridge"),
        no_auto_assign_ips: col(row, "no_auto_assign_ips"),
        identity: col(row, "identity"),
        capabilities: col(row, "capabilities"),
        tags: col(row, "tags"),
        revision: col(row, "revision"),
        creation_time: col(row, "creation_time"),
        last_authorized_time: col(row, "last_authorized_time"),
        last_deauthorized_time: col(row, "last_deauthorized_time"),
        v_major: col(row, "v_major"),
        v_minor: col(row, "v_minor"),
        v_rev: col(row, "v_rev"),
        v_proto: col(row, "v_proto"),
        extra: col(row, "config"),
    }
}

impl Inner {
    fn controller_id(&self) -> &str {
        &self.config.controller_id
    }

    /// Full scan: networks with their pools and routes, then members with
    /// their IP assignments. Rows with unusable keys are counted and skipped.
    async fn load_snapshot(&self) -> Result<Snapshot, sqlx::Error> {
        let cid = self.controller_id();
        let pools: HashMap<String, Vec<IpAssignmentPool>> = rows::group_children(
            sqlx::query(POOLS_SQL)
                .bind(cid)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|r| {
                    (
                        col::<String>(r, "network_id"),
                        rows::pool(col(r, "ip_range_start"), col(r, "ip_range_end")),
                    )
                }),
        );
        let routes: HashMap<String, Vec<Route>> = rows::group_children(
            sqlx::query(ROUTES_SQL)
                .bind(cid)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|r| (col::<String>(r, "network_id"), rows::route(col(r, "target"), col(r, "via")))),
        );
        let ips: HashMap<(String, String), Vec<String>> = rows::group_children(
            sqlx::query(MEMBER_IPS_SQL)
                .bind(cid)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|r| {
                    let key = col::<String>(r, "network_id").zip(col::<String>(r, "member_id"));
                    (key, col::<String>(r, "address"))
                }),
        );

        let mut snapshot = Snapshot::default();
        let mut pools = pools;
        let mut routes = routes;
        for row in sqlx::query(NETWORKS_SQL).bind(cid).fetch_all(&self.pool).await? {
            let row = network_row(&row);
            let id = row.id.clone().unwrap_or_default();
            let record = row.into_record(
                pools.remove(&id).unwrap_or_default(),
                routes.remove(&id).unwrap_or_default(),
            );
            match record {
                Some(record) => snapshot.networks.push(record),
                None => {
                    warn!(network_id = %id, "skipping network row with unusable id");
                    snapshot.skipped += 1;
                }
            }
        }

        let mut ips = ips;
        for row in sqlx::query(MEMBERS_SQL).bind(cid).fetch_all(&self.pool).await? {
            let row = member_row(&row);
            let key = (
                row.network_id.clone().unwrap_or_default(),
                row.id.clone().unwrap_or_default(),
            );
            match row.into_record(ips.remove(&key).unwrap_or_default()) {
                Some(record) => snapshot.members.push(record),
                None => {
                    warn!(network_id = %key.0, member_id = %key.1, "skipping member row with unusable id");
                    snapshot.skipped += 1;
                }
            }
        }
        Ok(snapshot)
    }

    /// Feeds a scan into the cache. Records cached but absent from the scan
    /// were deleted while change capture was down and are removed.
    fn apply_snapshot(&self, snapshot: Snapshot, notify_listeners: bool) {
        let core = &self.core;
        let seen_networks: HashSet<NetworkId> = snapshot.networks.iter().map(|n| n.id).collect();
        let seen_members: HashSet<(NetworkId, MemberId)> = snapshot
            .members
            .iter()
            .map(|m| (m.network_id, m.id))
            .collect();

        for network_id in core.index().networks() {
            if !seen_networks.contains(&network_id) {
                core.ingest_removal(RecordKey::Network(network_id), notify_listeners);
                continue;
            }
            for member in core.index().members(network_id) {
                if !seen_members.contains(&(network_id, member.id)) {
                    core.ingest_removal(RecordKey::Member(network_id, member.id), notify_listeners);
                }
            }
        }
        for network in snapshot.networks {
            core.ingest(Record::Network(network), notify_listeners);
        }
        for member in snapshot.members {
            core.ingest(Record::Member(member), notify_listeners);
        }
    }

    async fn resync(&self) -> Result<(), sqlx::Error> {
        let snapshot = self.load_snapshot().await?;
        self.apply_snapshot(snapshot, true);
        self.core.record_gauges();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Persists one record in a transaction. Returns `Ok(false)` when a
    /// member is skipped because its network row does not exist.
    async fn persist(&self, record: &Record) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = match record {
            Record::Network(network) => write_network(&mut tx, self.controller_id(), network)
                .await
                .map(|()| true),
            Record::Member(member) => write_member(&mut tx, member).await,
        };
        match result {
            Ok(true) => {
                tx.commit().await?;
                Ok(true)
            }
            Ok(false) => {
                tx.rollback().await?;
                Ok(false)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn soft_delete(&self, key: RecordKey) -> Result<(), sqlx::Error> {
        match key {
            RecordKey::Network(network_id) => {
                sqlx::query("UPDATE ztc_network SET deleted = true WHERE id = $1")
                    .bind(network_id.to_hex())
                    .execute(&self.pool)
                    .await?;
            }
            RecordKey::Member(network_id, member_id) => {
                sqlx::query(
                    "UPDATE ztc_member SET deleted = true, hidden = true \
                     WHERE network_id = $1 AND id = $2",
                )
                .bind(network_id.to_hex())
                .bind(member_id.to_hex())
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    async fn heartbeat(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO ztc_controller (id, cluster_host, last_alive, version, listen_port) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET cluster_host = EXCLUDED.cluster_host, \
             last_alive = EXCLUDED.last_alive, version = EXCLUDED.version, \
             listen_port = EXCLUDED.listen_port",
        )
        .bind(self.controller_id())
        .bind(&self.config.cluster_host)
        .bind(rows::to_i64(self.core.now()))
        .bind(env!("CARGO_PKG_VERSION"))
        .bind(i32::from(self.config.listen_port))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn flush_presence(&self) -> Result<usize, StoreError> {
        let updates = self.presence.drain();
        if updates.is_empty() {
            return Ok(0);
        }
        let status = rows::presence_rows(&updates, self.core.index());
        let mut written = 0;
        for chunk in status.chunks(self.config.presence_batch_size.max(1)) {
            if let Err(err) = self.upsert_status(chunk).await {
                self.presence.restore(updates);
                return Err(err.into());
            }
            written += chunk.len();
        }
        let mut last_seen = self.last_seen.lock();
        for update in &updates {
            if self.core.index().member(update.network_id, update.member_id).is_some() {
                last_seen
                    .entry(update.network_id)
                    .or_default()
                    .insert(update.member_id, update.timestamp);
            }
        }
        drop(last_seen);
        metrics::counter!("confdb_presence_flush_total", "backend" => "relational").increment(1);
        Ok(written)
    }

    async fn upsert_status(&self, chunk: &[PresenceRow]) -> Result<(), sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO ztc_member_status (network_id, member_id, address, last_updated) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.network_id.clone())
                .push_bind(row.member_id.clone())
                .push_bind(row.address.clone())
                .push_bind(row.last_updated);
        });
        qb.push(
            " ON CONFLICT (network_id, member_id) DO UPDATE SET \
             address = EXCLUDED.address, last_updated = EXCLUDED.last_updated",
        );
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Appends one stats row per network and forgets presence older than the
    /// online window.
    async fn append_stats(&self) -> Result<usize, sqlx::Error> {
        let now = self.core.now();
        let window = self.config.online_window_ms;
        let stats: Vec<StatsRow> = {
            let mut last_seen = self.last_seen.lock();
            let cutoff = now.saturating_sub(window);
            last_seen.retain(|_, members| {
                members.retain(|_, t| *t >= cutoff);
                !members.is_empty()
            });
            rows::stats_rows(self.core.index(), &last_seen, now, window)
        };
        if stats.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO ztc_network_stats (network_id, recorded_at, total_member_count, \
             authorized_member_count, online_member_count) ",
        );
        qb.push_values(&stats, |mut b, row| {
            b.push_bind(row.network_id.clone())
                .push_bind(row.recorded_at)
                .push_bind(row.total_member_count)
                .push_bind(row.authorized_member_count)
                .push_bind(row.online_member_count);
        });
        qb.build().execute(&self.pool).await?;
        Ok(stats.len())
    }

    /// One notification session: listen, resync what was missed, then apply
    /// notifications until stopped (`Ok`) or the connection drops (`Err`).
    async fn listen_session(&self, stop: &mut StopSignal, attempt: &mut u32) -> anyhow::Result<()> {
        let channels = [
            ChangeTable::Network.channel(self.controller_id()),
            ChangeTable::Member.channel(self.controller_id()),
        ];
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen_all(channels.iter().map(String::as_str)).await?;
        self.resync().await?;
        self.core.lifecycle().report(Probe::ChangeCapture, true);
        *attempt = 0;
        debug!(controller_id = %self.controller_id(), "listening for change notifications");

        loop {
            let received = tokio::select! {
                () = stop.stopped() => return Ok(()),
                received = listener.try_recv() => received?,
            };
            let Some(notification) = received else {
                anyhow::bail!("notification connection lost");
            };
            match ChangeTable::from_channel(notification.channel(), self.controller_id()) {
                Some(table) => {
                    ingest_payload(&self.core, table, notification.payload());
                }
                None => debug!(channel = notification.channel(), "ignoring unknown channel"),
            }
        }
    }
}

async fn write_network(
    tx: &mut Transaction<'_, Postgres>,
    controller_id: &str,
    network: &NetworkRecord,
) -> Result<(), sqlx::Error> {
    let row = NetworkRow::from_record(network);
    sqlx::query(
        "INSERT INTO ztc_network (id, controller_id, name, private, enable_broadcast, mtu, \
         multicast_limit, rules, capabilities, tags, v4_assign_mode, v6_assign_mode, dns_domain, \
         dns_servers, revision, creation_time, last_modified, config, deleted) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, false) \
         ON CONFLICT (id) DO UPDATE SET controller_id = EXCLUDED.controller_id, \
         name = EXCLUDED.name, private = EXCLUDED.private, \
         enable_broadcast = EXCLUDED.enable_broadcast, mtu = EXCLUDED.mtu, \
         multicast_limit = EXCLUDED.multicast_limit, rules = EXCLUDED.rules, \
         capabilities = EXCLUDED.capabilities, tags = EXCLUDED.tags, \
         v4_assign_mode = EXCLUDED.v4_assign_mode, v6_assign_mode = EXCLUDED.v6_assign_mode, \
         dns_domain = EXCLUDED.dns_domain, dns_servers = EXCLUDED.dns_servers, \
         revision = EXCLUDED.revision, creation_time = EXCLUDED.creation_time, \
         last_modified = EXCLUDED.last_modified, config = EXCLUDED.config, deleted = false",
    )
    .bind(row.id.as_deref())
    .bind(controller_id)
    .bind(row.name)
    .bind(row.private)
    .bind(row.enable_broadcast)
    .bind(row.mtu)
    .bind(row.multicast_limit)
    .bind(row.rules)
    .bind(row.capabilities)
    .bind(row.tags)
    .bind(row.v4_assign_mode)
    .bind(row.v6_assign_mode)
    .bind(row.dns_domain)
    .bind(row.dns_servers)
    .bind(row.revision)
    .bind(row.creation_time)
    .bind(row.last_modified)
    .bind(row.extra)
    .execute(&mut **tx)
    .await?;

    let network_id = network.id.to_hex();
    sqlx::query("DELETE FROM ztc_network_assignment_pool WHERE network_id = $1")
        .bind(&network_id)
        .execute(&mut **tx)
        .await?;
    for pool in &network.ip_assignment_pools {
        sqlx::query(
            "INSERT INTO ztc_network_assignment_pool (network_id, ip_range_start, ip_range_end) \
             VALUES ($1, $2, $3)",
        )
        .bind(&network_id)
        .bind(&pool.ip_range_start)
        .bind(&pool.ip_range_end)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query("DELETE FROM ztc_network_route WHERE network_id = $1")
        .bind(&network_id)
        .execute(&mut **tx)
        .await?;
    for route in &network.routes {
        sqlx::query("INSERT INTO ztc_network_route (network_id, address, via) VALUES ($1, $2, $3)")
            .bind(&network_id)
            .bind(&route.target)
            .bind(route.via.as_deref())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn write_member(
    tx: &mut Transaction<'_, Postgres>,
    member: &MemberRecord,
) -> Result<bool, sqlx::Error> {
    let network_id = member.network_id.to_hex();
    let parent: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM ztc_network WHERE id = $1 AND deleted = false")
            .bind(&network_id)
            .fetch_optional(&mut **tx)
            .await?;
    if parent.is_none() {
        return Ok(false);
    }

    let row = MemberRow::from_record(member);
    sqlx::query(
        "INSERT INTO ztc_member (id, network_id, authorized, active_bridge, no_auto_assign_ips, \
         identity, capabilities, tags, revision, creation_time, last_authorized_time, \
         last_deauthorized_time, v_major, v_minor, v_rev, v_proto, config, deleted, hidden) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, false, false) \
         ON CONFLICT (network_id, id) DO UPDATE SET authorized = EXCLUDED.authorized, \
         active_bridge = EXCLUDED.active_bridge, no_auto_assign_ips = EXCLUDED.no_auto_assign_ips, \
         identity = EXCLUDED.identity, capabilities = EXCLUDED.capabilities, tags = EXCLUDED.tags, \
         revision = EXCLUDED.revision, creation_time = EXCLUDED.creation_time, \
         last_authorized_time = EXCLUDED.last_authorized_time, \
         last_deauthorized_time = EXCLUDED.last_deauthorized_time, v_major = EXCLUDED.v_major, \
         v_minor = EXCLUDED.v_minor, v_rev = EXCLUDED.v_rev, v_proto = EXCLUDED.v_proto, \
         config = EXCLUDED.config, deleted = false, hidden = false",
    )
    .bind(row.id.as_deref())
    .bind(&network_id)
    .bind(row.authorized)
    .bind(row.active_bridge)
    .bind(row.no_auto_assign_ips)
    .bind(row.identity)
    .bind(row.capabilities)
    .bind(row.tags)
    .bind(row.revision)
    .bind(row.creation_time)
    .bind(row.last_authorized_time)
    .bind(row.last_deauthorized_time)
    .bind(row.v_major)
    .bind(row.v_minor)
    .bind(row.v_rev)
    .bind(row.v_proto)
    .bind(row.extra)
    .execute(&mut **tx)
    .await?;

    let member_id = member.id.to_hex();
    sqlx::query("DELETE FROM ztc_member_ip_assignment WHERE network_id = $1 AND member_id = $2")
        .bind(&network_id)
        .bind(&member_id)
        .execute(&mut **tx)
        .await?;
    for address in &member.ip_assignments {
        sqlx::query(
            "INSERT INTO ztc_member_ip_assignment (network_id, member_id, address) \
             VALUES ($1, $2, $3)",
        )
        .bind(&network_id)
        .bind(&member_id)
        .bind(address)
        .execute(&mut **tx)
        .await?;
    }
    Ok(true)
}

async fn listen_loop(inner: Arc<Inner>, mut stop: StopSignal) {
    let retry = inner.config.reconnect;
    let mut attempt = 0u32;
    while !stop.is_stopped() {
        match inner.listen_session(&mut stop, &mut attempt).await {
            Ok(()) => break,
            Err(err) => {
                attempt += 1;
                inner.core.lifecycle().report(Probe::ChangeCapture, false);
                if retry.exhausted(attempt) {
                    error!(error = %err, "change notifications lost, giving up");
                    break;
                }
                warn!(attempt, error = %err, "change notifications interrupted, reconnecting");
                if !stop.sleep(retry.backoff(attempt)).await {
                    break;
                }
            }
        }
    }
    debug!("notification listener stopped");
}

async fn heartbeat_loop(inner: Arc<Inner>, mut stop: StopSignal) {
    let cadence = inner.config.heartbeat;
    loop {
        match inner.heartbeat().await {
            Ok(()) => inner.core.lifecycle().report(Probe::Heartbeat, true),
            Err(err) => {
                warn!(error = %err, "controller heartbeat failed");
                inner.core.lifecycle().report(Probe::Heartbeat, false);
            }
        }
        if !stop.sleep(cadence.next_delay()).await {
            break;
        }
    }
    debug!("heartbeat stopped");
}

async fn presence_loop(inner: Arc<Inner>, mut stop: StopSignal) {
    let cadence = inner.config.presence_flush;
    let every = inner.config.aggregate_every_flushes.max(1);
    let mut flushes = 0u32;
    while stop.sleep(cadence.next_delay()).await {
        match inner.flush_presence().await {
            Ok(rows) => {
                inner.core.lifecycle().report(Probe::Writes, true);
                if rows > 0 {
                    debug!(rows, "presence flushed");
                }
            }
            Err(err) => {
                warn!(error = %err, "presence flush failed");
                inner.core.lifecycle().report(Probe::Writes, false);
            }
        }
        flushes = flushes.wrapping_add(1);
        if flushes % every == 0 {
            if let Err(err) = inner.append_stats().await {
                warn!(error = %err, "network stats append failed");
            }
            inner.core.record_gauges();
        }
    }
    debug!("presence flusher stopped");
}

#[async_trait]
impl ConfigStore for RelationalStore {
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

    async fn save(&self, record: Record, notify_listeners: bool) -> bool {
        let core = &self.inner.core;
        let key = record.key();
        let Some(write) = core.prepare_write(record) else {
            return false;
        };
        match self.inner.persist(&write.new).await {
            Ok(true) => {
                core.lifecycle().report(Probe::Writes, true);
                core.commit(write, notify_listeners);
                true
            }
            Ok(false) => {
                warn!(network_id = %key.network_id(), "member save skipped, network row missing");
                false
            }
            Err(err) => {
                core.lifecycle().report(Probe::Writes, false);
                core.record_failed_save(key, &err);
                false
            }
        }
    }

    async fn erase_network(&self, network_id: NetworkId, notify_listeners: bool) {
        match self.inner.soft_delete(RecordKey::Network(network_id)).await {
            Ok(()) => {
                self.inner.last_seen.lock().remove(&network_id);
                self.inner.core.remove_network(network_id, notify_listeners);
                self.inner.core.record_gauges();
            }
            Err(err) => warn!(%network_id, error = %err, "erase network failed"),
        }
    }

    async fn erase_member(&self, network_id: NetworkId, member_id: MemberId, notify_listeners: bool) {
        match self
            .inner
            .soft_delete(RecordKey::Member(network_id, member_id))
            .await
        {
            Ok(()) => {
                self.inner.core.remove_member(network_id, member_id, notify_listeners);
            }
            Err(err) => warn!(%network_id, %member_id, error = %err, "erase member failed"),
        }
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
        if let Err(err) = self.inner.flush_presence().await {
            warn!(error = %err, "final presence flush failed");
        }
        self.inner.pool.close().await;
    }
}
