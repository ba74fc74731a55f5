// Ledger node HTTP client.
//
// Endpoints used:
//
//   POST /makerecord
//     Body: { Selectors: [{ Name, Ordinal }], Value, OwnerPrivate,
//             MaskingKey, Timestamp, PulseIfUnchanged }
//
//   POST /query
//     Body: { Ranges: [{ Name, Range: [lo, hi] }], TimeRange: [lo, hi],
//             MaskingKey, Owners }
//     Response: [[{ Value, Record: { Timestamp } }, ...], ...]
//       one inner list per matching selector set, best candidate first

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One searchable key on a ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Selector {
    pub name: String,
    pub ordinal: u64,
}

/// Upsert request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MakeRecord {
    pub selectors: Vec<Selector>,
    pub value: String,
    pub owner_private: String,
    pub masking_key: String,
    /// Seconds since Unix epoch.
    pub timestamp: u64,
    /// Refresh the existing record instead of appending when the value is
    /// identical to the current one.
    pub pulse_if_unchanged: bool,
}

/// Inclusive ordinal range for one selector name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SelectorRange {
    pub name: String,
    pub range: [u64; 2],
}

impl SelectorRange {
    /// Every ordinal under `name`.
    #[must_use]
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            range: [0, u64::MAX],
        }
    }
}

/// "What changed in this window" query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LedgerQuery {
    pub ranges: Vec<SelectorRange>,
    /// Inclusive, in seconds since Unix epoch.
    pub time_range: [u64; 2],
    pub masking_key: String,
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordMeta {
    #[serde(default)]
    pub timestamp: u64,
}

/// One query candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryResult {
    pub value: String,
    #[serde(default)]
    pub record: RecordMeta,
}

/// Access to the ledger node.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submits one record.
    ///
    /// # Errors
    ///
    /// Returns an error unless the node accepted the record.
    async fn make_record(&self, record: &MakeRecord) -> Result<()>;

    /// Runs a query. Each inner list holds the candidates for one selector
    /// set, best first.
    ///
    /// # Errors
    ///
    /// Returns an error when the node is unreachable or answers badly.
    async fn query(&self, query: &LedgerQuery) -> Result<Vec<Vec<QueryResult>>>;
}

/// [`LedgerClient`] over HTTP.
pub struct HttpLedgerClient {
    base_url: String,
    http: Client,
}

impl HttpLedgerClient {
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn make_record(&self, record: &MakeRecord) -> Result<()> {
        let url = format!("{}/makerecord", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(record)
            .send()
            .await
            .context("failed to reach ledger node")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger rejected record {status}: {body}");
        }
        Ok(())
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<Vec<QueryResult>>> {
        let url = format!("{}/query", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(query)
            .send()
            .await
            .context("failed to reach ledger node")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger query failed {status}: {body}");
        }

        resp.json::<Vec<Vec<QueryResult>>>()
            .await
            .context("failed to parse ledger query response")
    }
}
