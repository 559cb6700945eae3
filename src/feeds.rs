//! Threat Intelligence Feed Management
//!
//! Fetches remote indicator feeds over HTTP, parses CSV/JSON payloads into
//! raw indicator records and drives [`IocIndex::refresh`] per feed. Each
//! feed tracks its own status so one broken feed never blocks the rest.

use crate::ioc::{parse_tlp, IocIndex, RawIndicator, RefreshOutcome, Tlp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const FETCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Csv,
    Json,
    Stix,
    Taxii,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub format: FeedFormat,
    pub enabled: bool,
    /// Sent as a bearer token when present
    #[serde(default)]
    pub api_key: Option<String>,
    /// Canonical indicator field -> source field. Dotted paths for JSON
    /// feeds, column names for CSV.
    #[serde(default)]
    pub field_mapping: HashMap<String, String>,
    /// Indicator type assumed when the payload does not carry one
    #[serde(default)]
    pub default_type: Option<String>,
    /// Confidence assigned to indicators the feed does not score
    #[serde(default = "default_confidence")]
    pub default_confidence: u8,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_confidence() -> u8 {
    50
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct FeedStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub indicators_added: u64,
    pub indicators_updated: u64,
    pub indicators_removed: u64,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed not found: {0}")]
    NotFound(String),
    #[error("feed disabled: {0}")]
    Disabled(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("feed returned HTTP {0}")]
    Http(u16),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Transport boundary, kept narrow so tests can feed canned payloads.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, config: &FeedConfig) -> Result<String, FeedError>;
}

/// Default fetcher over reqwest with a hard request timeout.
pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent("ndr-core/0.1")
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, config: &FeedConfig) -> Result<String, FeedError> {
        let mut request = self.client.get(&config.url);
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FeedError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FeedError::Http(response.status().as_u16()));
        }
        response.text().await.map_err(|e| FeedError::Fetch(e.to_string()))
    }
}

/// Serves a fixed payload; test double for [`FeedFetcher`].
pub struct StaticFetcher {
    pub payload: String,
}

#[async_trait]
impl FeedFetcher for StaticFetcher {
    async fn fetch(&self, _config: &FeedConfig) -> Result<String, FeedError> {
        Ok(self.payload.clone())
    }
}

/// Registry of configured feeds plus the refresh machinery.
pub struct FeedManager {
    feeds: DashMap<String, FeedConfig>,
    status: DashMap<String, FeedStatus>,
    fetcher: Arc<dyn FeedFetcher>,
    index: Arc<IocIndex>,
}

impl FeedManager {
    pub fn new(index: Arc<IocIndex>, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self {
            feeds: DashMap::new(),
            status: DashMap::new(),
            fetcher,
            index,
        }
    }

    pub fn register_feed(&self, config: FeedConfig) {
        self.status.entry(config.id.clone()).or_default();
        self.feeds.insert(config.id.clone(), config);
    }

    pub fn remove_feed(&self, feed_id: &str) -> bool {
        self.status.remove(feed_id);
        self.feeds.remove(feed_id).is_some()
    }

    pub fn get_feed(&self, feed_id: &str) -> Option<FeedConfig> {
        self.feeds.get(feed_id).map(|f| f.clone())
    }

    pub fn list_feeds(&self) -> Vec<FeedConfig> {
        self.feeds.iter().map(|f| f.clone()).collect()
    }

    pub fn feed_status(&self, feed_id: &str) -> Option<FeedStatus> {
        self.status.get(feed_id).map(|s| s.clone())
    }

    /// Fetch, parse and merge a single feed into the IOC index.
    pub async fn refresh_feed(&self, feed_id: &str) -> Result<RefreshOutcome, FeedError> {
        let config = self
            .feeds
            .get(feed_id)
            .map(|f| f.clone())
            .ok_or_else(|| FeedError::NotFound(feed_id.to_string()))?;
        if !config.enabled {
            return Err(FeedError::Disabled(feed_id.to_string()));
        }

        if let Some(mut status) = self.status.get_mut(feed_id) {
            status.last_run = Some(Utc::now());
        }

        let result = self.fetch_and_merge(&config).await;
        match &result {
            Ok(outcome) => {
                if let Some(mut status) = self.status.get_mut(feed_id) {
                    status.last_success = Some(Utc::now());
                    status.last_error = None;
                    status.indicators_added = outcome.added;
                    status.indicators_updated = outcome.updated;
                    status.indicators_removed = outcome.removed;
                }
                info!(
                    feed = %config.name,
                    added = outcome.added,
                    updated = outcome.updated,
                    removed = outcome.removed,
                    "feed refreshed"
                );
            }
            Err(e) => {
                if let Some(mut status) = self.status.get_mut(feed_id) {
                    status.last_error = Some(e.to_string());
                }
                error!(feed = %config.name, error = %e, "feed refresh failed");
            }
        }
        result
    }

    /// Refresh every enabled feed; failures are recorded per feed and do not
    /// abort the pass.
    pub async fn refresh_all(&self) -> Vec<(String, Result<RefreshOutcome, FeedError>)> {
        let ids: Vec<String> = self
            .feeds
            .iter()
            .filter(|f| f.enabled)
            .map(|f| f.id.clone())
            .collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.refresh_feed(&id).await;
            results.push((id, outcome));
        }
        results
    }

    async fn fetch_and_merge(&self, config: &FeedConfig) -> Result<RefreshOutcome, FeedError> {
        let body = self.fetcher.fetch(config).await?;
        let raw = match config.format {
            FeedFormat::Csv => parse_csv(&body, config)?,
            FeedFormat::Json => parse_json(&body, config)?,
            // STIX/TAXII ingestion needs a dedicated client; not wired yet.
            FeedFormat::Stix | FeedFormat::Taxii => {
                warn!(feed = %config.name, format = ?config.format, "format not supported, skipping");
                Vec::new()
            }
        };
        let entries = self.index.entries_from_raw(&config.id, raw);
        Ok(self.index.refresh(&config.id, entries))
    }
}

// =============================================================================
// Payload parsing
// =============================================================================

fn mapped<'a>(config: &'a FeedConfig, canonical: &'a str) -> &'a str {
    config
        .field_mapping
        .get(canonical)
        .map(|s| s.as_str())
        .unwrap_or(canonical)
}

/// Timestamp fields show up in feed configs as either snake_case or
/// camelCase keys; accept both.
fn mapped_either<'a>(config: &'a FeedConfig, canonical: &'a str, alias: &str) -> &'a str {
    config
        .field_mapping
        .get(canonical)
        .or_else(|| config.field_mapping.get(alias))
        .map(|s| s.as_str())
        .unwrap_or(canonical)
}

/// Optional per-row fields pulled out of a feed record.
#[derive(Default)]
struct RowFields {
    indicator_type: Option<String>,
    confidence: Option<u8>,
    tlp: Option<Tlp>,
    description: Option<String>,
    tags: Vec<String>,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

fn indicator(config: &FeedConfig, value: String, row: RowFields) -> RawIndicator {
    let mut tags = config.tags.clone();
    tags.extend(row.tags);
    RawIndicator {
        indicator_type: row
            .indicator_type
            .or_else(|| config.default_type.clone())
            .unwrap_or_default(),
        value,
        confidence: row.confidence.unwrap_or(config.default_confidence),
        tlp: row.tlp,
        description: row.description,
        tags,
        first_seen: row.first_seen,
        last_seen: row.last_seen,
    }
}

/// Feeds carry timestamps as RFC 3339 strings or epoch milliseconds.
fn feed_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
        Value::Number(n) => DateTime::<Utc>::from_timestamp_millis(n.as_i64()?),
        _ => None,
    }
}

/// Header-row CSV with comment lines ignored. Quoting is not handled; the
/// feeds this targets emit plain comma-separated columns.
fn parse_csv(body: &str, config: &FeedConfig) -> Result<Vec<RawIndicator>, FeedError> {
    let mut lines = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));

    let header = lines
        .next()
        .ok_or_else(|| FeedError::Parse("empty CSV payload".to_string()))?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();

    let col = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
    let value_col = col(mapped(config, "value"))
        .ok_or_else(|| FeedError::Parse(format!("missing value column '{}'", mapped(config, "value"))))?;
    let type_col = col(mapped(config, "type"));
    let confidence_col = col(mapped(config, "confidence"));
    let tlp_col = col(mapped(config, "tlp"));
    let description_col = col(mapped(config, "description"));
    let tags_col = col(mapped(config, "tags"));
    let first_seen_col = col(mapped_either(config, "first_seen", "firstSeen"));
    let last_seen_col = col(mapped_either(config, "last_seen", "lastSeen"));

    let mut records = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let Some(value) = fields.get(value_col).filter(|v| !v.is_empty()) else {
            continue;
        };
        let cell = |idx: Option<usize>| idx.and_then(|i| fields.get(i)).copied().filter(|c| !c.is_empty());
        let row = RowFields {
            indicator_type: cell(type_col).map(str::to_string),
            confidence: cell(confidence_col).and_then(|c| c.parse::<u8>().ok()),
            tlp: cell(tlp_col).and_then(parse_tlp),
            description: cell(description_col).map(str::to_string),
            // Tag lists inside a CSV cell are semicolon separated.
            tags: cell(tags_col)
                .map(|t| {
                    t.split(';')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            first_seen: cell(first_seen_col).and_then(|s| s.parse::<DateTime<Utc>>().ok()),
            last_seen: cell(last_seen_col).and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        };
        records.push(indicator(config, value.to_string(), row));
    }
    Ok(records)
}

/// JSON feeds are either a bare array of indicator objects or an object
/// wrapping one under `data` or `indicators`.
fn parse_json(body: &str, config: &FeedConfig) -> Result<Vec<RawIndicator>, FeedError> {
    let parsed: Value = serde_json::from_str(body).map_err(|e| FeedError::Parse(e.to_string()))?;
    let items = match &parsed {
        Value::Array(items) => items.as_slice(),
        Value::Object(_) => parsed
            .get("data")
            .or_else(|| parsed.get("indicators"))
            .and_then(Value::as_array)
            .map(|v| v.as_slice())
            .ok_or_else(|| FeedError::Parse("no indicator array in payload".to_string()))?,
        _ => return Err(FeedError::Parse("unexpected JSON payload shape".to_string())),
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let Some(value) = crate::json_path(item, mapped(config, "value")) else {
            continue;
        };
        let value = crate::json_to_string(value);
        if value.is_empty() {
            continue;
        }
        let field = |canonical: &'static str| crate::json_path(item, mapped(config, canonical));
        let row = RowFields {
            indicator_type: field("type").and_then(Value::as_str).map(|t| t.to_string()),
            confidence: field("confidence").and_then(Value::as_u64).map(|c| c.min(100) as u8),
            tlp: field("tlp").and_then(Value::as_str).and_then(parse_tlp),
            description: field("description").and_then(Value::as_str).map(|d| d.to_string()),
            tags: field("tags")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default(),
            first_seen: crate::json_path(item, mapped_either(config, "first_seen", "firstSeen"))
                .and_then(feed_timestamp),
            last_seen: crate::json_path(item, mapped_either(config, "last_seen", "lastSeen"))
                .and_then(feed_timestamp),
        };
        records.push(indicator(config, value, row));
    }
    Ok(records)
}
