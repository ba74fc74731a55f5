//! Backend configuration.
//!
//! Every periodic loop is parameterized by a [`PollingConfig`] and every
//! retrying path by a [`RetryPolicy`], so timing is explicit and tests can
//! shrink it (or run under paused tokio time) instead of waiting on literal
//! sleeps.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Timing primitives
// ---------------------------------------------------------------------------

/// Fixed-interval loop timing with optional random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    /// Upper bound of uniformly random extra delay added to each interval.
    pub jitter_ms: u64,
}

impl PollingConfig {
    #[must_use]
    pub const fn every(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            jitter_ms: 0,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Interval plus a fresh jitter sample.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.interval() + jitter(self.jitter_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::every(1_000)
    }
}

/// Exponential backoff for reconnects and write retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    /// Attempts after the first before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms.max(self.initial_backoff_ms));
        Duration::from_millis(base) + jitter(self.jitter_ms)
    }

    /// Whether `attempt` retries have used up the budget.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt > max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            jitter_ms: 100,
            max_retries: None,
        }
    }
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

// ---------------------------------------------------------------------------
// Per-backend configuration
// ---------------------------------------------------------------------------

/// Directory-tree backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub path: PathBuf,
    /// Online snapshot rewrite cadence.
    pub online_flush: PollingConfig,
    /// Distinct addresses retained per member in the online snapshot.
    pub online_history_limit: usize,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("controller.d"),
            online_flush: PollingConfig::every(10_000),
            online_history_limit: 32,
        }
    }
}

/// Where the relational backend receives change events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    /// Database-native `LISTEN`/`NOTIFY` channels.
    #[default]
    Notify,
    /// An external broker queue injected at construction.
    Queue,
}

/// SQL backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    pub url: String,
    /// Controller identity; scopes rows and notification channel names.
    pub controller_id: String,
    pub max_connections: u32,
    /// Oldest schema version this code can operate against.
    pub min_schema_version: i32,
    pub change_source: ChangeSource,
    pub heartbeat: PollingConfig,
    pub presence_flush: PollingConfig,
    /// Aggregate stats are appended every this many presence flushes.
    pub aggregate_every_flushes: u32,
    /// Members seen within this window count as online in aggregates.
    pub online_window_ms: u64,
    /// Rows per multi-row presence upsert.
    pub presence_batch_size: usize,
    pub cluster_host: String,
    pub listen_port: u16,
    pub reconnect: RetryPolicy,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            controller_id: String::new(),
            max_connections: 10,
            min_schema_version: 1,
            change_source: ChangeSource::Notify,
            heartbeat: PollingConfig::every(1_000),
            presence_flush: PollingConfig::every(10_000),
            aggregate_every_flushes: 6,
            online_window_ms: 300_000,
            presence_batch_size: 1_000,
            cluster_host: String::new(),
            listen_port: 9993,
            reconnect: RetryPolicy::default(),
        }
    }
}

/// Document-database backend with native changefeeds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChangefeedConfig {
    /// Workers draining the commit queue.
    pub writer_tasks: usize,
    /// Commit queue bound. `save` fails fast instead of blocking when full.
    pub queue_capacity: usize,
    pub write_retry: RetryPolicy,
    pub reconnect: RetryPolicy,
    pub presence_flush: PollingConfig,
}

impl Default for ChangefeedConfig {
    fn default() -> Self {
        Self {
            writer_tasks: 4,
            queue_capacity: 1_024,
            write_retry: RetryPolicy {
                max_retries: Some(5),
                ..RetryPolicy::default()
            },
            reconnect: RetryPolicy::default(),
            presence_flush: PollingConfig::every(10_000),
        }
    }
}

/// Append-only ledger reached over HTTP.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base URL of the ledger node, e.g. `http://127.0.0.1:9980`.
    pub url: String,
    /// Owner credential used to sign upserts and filter queries.
    pub owner_key: String,
    /// Key used to mask values at rest. Defaults to the controller id.
    pub masking_key: String,
    pub controller_id: String,
    pub poll: PollingConfig,
    /// How far behind the last query start each window reaches back.
    pub safety_margin_ms: u64,
    pub request_timeout_ms: u64,
    /// Also persist presence (last online time/address) to the ledger.
    pub store_online_state: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            owner_key: String::new(),
            masking_key: String::new(),
            controller_id: String::new(),
            poll: PollingConfig::every(1_000),
            safety_margin_ms: 120_000,
            request_timeout_ms: 10_000,
            store_online_state: false,
        }
    }
}

impl LedgerConfig {
    /// Reads the `settings.controllerDb` block of a service `local.conf`.
    ///
    /// Returns `None` unless the block selects the ledger and names a
    /// usable host, port and owner.
    #[must_use]
    pub fn from_local_conf(local_conf: &Value, controller_id: &str) -> Option<Self> {
        let db = local_conf.get("settings")?.get("controllerDb")?;
        if db.get("type").and_then(Value::as_str) != Some("lf") {
            return None;
        }
        let host = db.get("host").and_then(Value::as_str).filter(|h| !h.is_empty())?;
        let port = db
            .get("port")
            .and_then(Value::as_u64)
            .filter(|p| (1..=65_535).contains(p))?;
        let owner = db.get("owner").and_then(Value::as_str).filter(|o| !o.is_empty())?;
        let store_online_state = db
            .get("storeOnlineState")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self {
            url: format!("http://{host}:{port}"),
            owner_key: owner.to_string(),
            masking_key: controller_id.to_string(),
            controller_id: controller_id.to_string(),
            store_online_state,
            ..Self::default()
        })
    }
}

/// Mirror combinator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Anti-entropy sweep cadence; `None` disables the sweep.
    pub sync: Option<PollingConfig>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sync: Some(PollingConfig::every(5_000)),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level selection
// ---------------------------------------------------------------------------

/// One configured backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Filesystem(FilesystemConfig),
    #[cfg(feature = "postgres")]
    Relational(RelationalConfig),
    Ledger(LedgerConfig),
    Memory,
}

impl BackendConfig {
    /// Selects a backend from a controller database path.
    ///
    /// `postgres:<url>` selects the relational backend; anything else is a
    /// filesystem directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] for an empty path, or for a
    /// `postgres:` path when the crate was built without that backend.
    pub fn from_path(path: &str, controller_id: &str) -> Result<Self, StoreError> {
        if path.is_empty() {
            return Err(StoreError::InvalidConfig("empty database path".into()));
        }
        if let Some(url) = path.strip_prefix("postgres:") {
            return Self::relational(url, controller_id);
        }
        Ok(Self::Filesystem(FilesystemConfig {
            path: PathBuf::from(path),
            ..FilesystemConfig::default()
        }))
    }

    #[cfg(feature = "postgres")]
    #[allow(clippy::unnecessary_wraps)]
    fn relational(url: &str, controller_id: &str) -> Result<Self, StoreError> {
        Ok(Self::Relational(RelationalConfig {
            url: url.to_string(),
            controller_id: controller_id.to_string(),
            ..RelationalConfig::default()
        }))
    }

    #[cfg(not(feature = "postgres"))]
    fn relational(_url: &str, _controller_id: &str) -> Result<Self, StoreError> {
        Err(StoreError::InvalidConfig(
            "postgres backend not compiled in".into(),
        ))
    }
}

/// Full store configuration: one backend, or several mirrored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backends: Vec<BackendConfig>,
    pub mirror: MirrorConfig,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_match_documented_cadences() {
        let fs = FilesystemConfig::default();
        assert_eq!(fs.online_flush.interval_ms, 10_000);
        assert_eq!(fs.online_history_limit, 32);

        let rel = RelationalConfig::default();
        assert_eq!(rel.heartbeat.interval_ms, 1_000);
        assert_eq!(rel.presence_flush.interval_ms, 10_000);
        assert_eq!(rel.change_source, ChangeSource::Notify);

        let ledger = LedgerConfig::default();
        assert_eq!(ledger.safety_margin_ms, 120_000);
        assert!(!ledger.store_online_state);

        let feed = ChangefeedConfig::default();
        assert_eq!(feed.writer_tasks, 4);
        assert_eq!(feed.write_retry.max_retries, Some(5));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter_ms: 0,
            max_retries: Some(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
        assert!(!RetryPolicy::default().exhausted(u32::MAX));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let polling = PollingConfig {
            interval_ms: 50,
            jitter_ms: 10,
        };
        for _ in 0..100 {
            let d = polling.next_delay();
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(60));
        }
    }

    #[test]
    fn path_selects_backend() {
        match BackendConfig::from_path("/var/lib/ctl/controller.d", "abcdef0123").unwrap() {
            BackendConfig::Filesystem(fs) => {
                assert_eq!(fs.path, PathBuf::from("/var/lib/ctl/controller.d"));
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert!(BackendConfig::from_path("", "abcdef0123").is_err());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn postgres_prefix_selects_relational() {
        match BackendConfig::from_path("postgres:host=db user=ctl", "abcdef0123").unwrap() {
            BackendConfig::Relational(rel) => {
                assert_eq!(rel.url, "host=db user=ctl");
                assert_eq!(rel.controller_id, "abcdef0123");
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn local_conf_selects_ledger() {
        let conf = json!({"settings": {"controllerDb": {
            "type": "lf", "host": "10.0.0.5", "port": 9980, "owner": "owner-key",
            "storeOnlineState": true
        }}});
        let ledger = LedgerConfig::from_local_conf(&conf, "abcdef0123").unwrap();
        assert_eq!(ledger.url, "http://10.0.0.5:9980");
        assert_eq!(ledger.masking_key, "abcdef0123");
        assert!(ledger.store_online_state);

        let wrong = json!({"settings": {"controllerDb": {"type": "postgres"}}});
        assert!(LedgerConfig::from_local_conf(&wrong, "abcdef0123").is_none());
        let no_port = json!({"settings": {"controllerDb": {"type": "lf", "host": "h", "owner": "o"}}});
        assert!(LedgerConfig::from_local_conf(&no_port, "abcdef0123").is_none());
    }

    #[test]
    fn store_config_deserializes_tagged_backends() {
        let cfg: StoreConfig = serde_json::from_value(json!({
            "backends": [
                {"type": "filesystem", "path": "/tmp/ctl"},
                {"type": "memory"}
            ],
            "mirror": {"sync": null}
        }))
        .unwrap();
        assert_eq!(cfg.backends.len(), 2);
        assert!(cfg.mirror.sync.is_none());
        assert!(matches!(cfg.backends[1], BackendConfig::Memory));
    }
}
