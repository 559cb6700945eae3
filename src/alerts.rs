//! Alert Deduplication & Scoring
//!
//! Merges findings and rule matches into alert records: duplicate
//! suppression on a configurable fingerprint within a time window, severity
//! scoring, an enforced status state machine and retention purge.

use crate::Severity;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    InProgress,
    Resolved,
    FalsePositive,
    Closed,
}

impl AlertStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::FalsePositive | AlertStatus::Closed)
    }

    /// Explicit allowed-transition table. There is deliberately no way back
    /// to `new`.
    fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::New, AlertStatus::InProgress)
                | (AlertStatus::InProgress, AlertStatus::Resolved)
                | (AlertStatus::InProgress, AlertStatus::FalsePositive)
                | (AlertStatus::Resolved, AlertStatus::Closed)
                | (AlertStatus::FalsePositive, AlertStatus::Closed)
        )
    }
}

impl FromStr for AlertStatus {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(AlertStatus::New),
            "in_progress" => Ok(AlertStatus::InProgress),
            "resolved" => Ok(AlertStatus::Resolved),
            "false_positive" => Ok(AlertStatus::FalsePositive),
            "closed" => Ok(AlertStatus::Closed),
            other => Err(AlertError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertComment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: AlertStatus,
    /// Producing subsystem, e.g. `ioc_scanner`, `traffic_anomaly`, `correlation`
    pub source: String,
    /// Reference into the producer (finding id, rule id)
    pub source_ref: Option<String>,
    pub ip_address: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 0-100
    pub score: u8,
    pub comments: Vec<AlertComment>,
    pub metadata: Value,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Alert input from a detector or the rule engine, before dedup/scoring.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub source: String,
    pub source_ref: Option<String>,
    pub ip_address: Option<String>,
    /// Pre-computed score; when absent the scoring algorithm runs
    pub score: Option<u8>,
    pub metadata: Value,
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("invalid alert status: {0}")]
    InvalidStatus(String),
    #[error("illegal status transition {from:?} -> {to:?}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },
    #[error("alert not found: {0}")]
    NotFound(String),
    #[error("alert store error: {0}")]
    Store(String),
}

/// External persistence boundary for alert records.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn persist(&self, alert: Alert) -> Result<Alert, AlertError>;
    /// Most recent non-terminal alert with this fingerprint created at or
    /// after `window_start`.
    async fn find_open_by_fingerprint(
        &self,
        fingerprint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Alert>, AlertError>;
    async fn get(&self, id: &str) -> Result<Option<Alert>, AlertError>;
    async fn update(&self, alert: Alert) -> Result<Alert, AlertError>;
    /// All non-terminal alerts, newest first.
    async fn list_open(&self) -> Result<Vec<Alert>, AlertError>;
    /// Remove terminal alerts older than `cutoff`; returns how many went.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AlertError>;
}

/// In-memory repository used by tests and as a default store.
#[derive(Default)]
pub struct InMemoryAlertStore {
    alerts: DashMap<String, Alert>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[async_trait]
impl AlertRepository for InMemoryAlertStore {
    async fn persist(&self, alert: Alert) -> Result<Alert, AlertError> {
        self.alerts.insert(alert.id.clone(), alert.clone());
        Ok(alert)
    }

    async fn find_open_by_fingerprint(
        &self,
        fingerprint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Alert>, AlertError> {
        let mut best: Option<Alert> = None;
        for alert in self.alerts.iter() {
            if alert.fingerprint == fingerprint
                && !alert.status.is_terminal()
                && alert.created_at >= window_start
                && best.as_ref().map(|b| alert.created_at > b.created_at).unwrap_or(true)
            {
                best = Some(alert.clone());
            }
        }
        Ok(best)
    }

    async fn get(&self, id: &str) -> Result<Option<Alert>, AlertError> {
        Ok(self.alerts.get(id).map(|a| a.clone()))
    }

    async fn update(&self, alert: Alert) -> Result<Alert, AlertError> {
        if !self.alerts.contains_key(&alert.id) {
            return Err(AlertError::NotFound(alert.id));
        }
        self.alerts.insert(alert.id.clone(), alert.clone());
        Ok(alert)
    }

    async fn list_open(&self) -> Result<Vec<Alert>, AlertError> {
        let mut open: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.clone())
            .collect();
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(open)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AlertError> {
        let before = self.alerts.len() as u64;
        self.alerts
            .retain(|_, a| !(a.status.is_terminal() && a.created_at < cutoff));
        Ok(before - self.alerts.len() as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Candidate fields hashed into the dedup fingerprint
    pub fields: Vec<String>,
    pub window_secs: u64,
    pub retention_days: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fields: vec!["source".to_string(), "source_ref".to_string(), "title".to_string()],
            window_secs: 300,
            retention_days: 90,
        }
    }
}

struct ManagerStats {
    created: AtomicU64,
    suppressed: AtomicU64,
    scoring_failures: AtomicU64,
}

/// Alert creation front-end: fingerprinting, duplicate suppression, scoring
/// and lifecycle transitions over an [`AlertRepository`].
pub struct AlertManager {
    repo: Arc<dyn AlertRepository>,
    config: DedupConfig,
    /// Per-fingerprint creation locks; closes the find-then-create race so
    /// two concurrent duplicates cannot both insert.
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    stats: ManagerStats,
}

impl AlertManager {
    pub fn new(repo: Arc<dyn AlertRepository>, config: DedupConfig) -> Self {
        Self {
            repo,
            config,
            creation_locks: DashMap::new(),
            stats: ManagerStats {
                created: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                scoring_failures: AtomicU64::new(0),
            },
        }
    }

    pub fn repository(&self) -> &Arc<dyn AlertRepository> {
        &self.repo
    }

    /// Create an alert, or return the open duplicate it collapses into.
    pub async fn create_alert(&self, candidate: AlertCandidate) -> Result<Alert, AlertError> {
        let fingerprint = self.fingerprint(&candidate);
        let now = Utc::now();

        if self.config.enabled {
            let lock = self
                .creation_locks
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let _guard = lock.lock().await;

            let window_start = now - Duration::seconds(self.config.window_secs as i64);
            if let Some(mut existing) = self
                .repo
                .find_open_by_fingerprint(&fingerprint, window_start)
                .await?
            {
                existing.comments.push(AlertComment {
                    author: "system".to_string(),
                    body: format!("Duplicate alert suppressed at {}", now.to_rfc3339()),
                    created_at: now,
                });
                existing.updated_at = now;
                let updated = self.repo.update(existing).await?;
                self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(alert_id = %updated.id, "duplicate alert suppressed");
                return Ok(updated);
            }

            let alert = self.build_alert(candidate, fingerprint, now);
            let stored = self.repo.persist(alert).await?;
            self.stats.created.fetch_add(1, Ordering::Relaxed);
            return Ok(stored);
        }

        let alert = self.build_alert(candidate, fingerprint, now);
        let stored = self.repo.persist(alert).await?;
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        Ok(stored)
    }

    fn build_alert(&self, candidate: AlertCandidate, fingerprint: String, now: DateTime<Utc>) -> Alert {
        let score = match candidate.score {
            Some(s) => s.min(100),
            None => self.compute_score(&candidate),
        };
        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            title: candidate.title,
            description: candidate.description,
            severity: candidate.severity,
            status: AlertStatus::New,
            source: candidate.source,
            source_ref: candidate.source_ref,
            ip_address: candidate.ip_address,
            timestamp: now,
            score,
            comments: Vec::new(),
            metadata: candidate.metadata,
            fingerprint,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolved_by: None,
            closed_at: None,
        }
    }

    /// Severity base score, source bonus, confidence multiplier, clamped to
    /// 0-100. A scoring failure falls back to 50 rather than blocking alert
    /// creation.
    fn compute_score(&self, candidate: &AlertCandidate) -> u8 {
        match try_score(candidate) {
            Ok(score) => score,
            Err(e) => {
                self.stats.scoring_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "scoring failed, defaulting to 50");
                50
            }
        }
    }

    fn fingerprint(&self, candidate: &AlertCandidate) -> String {
        let mut hasher = Sha256::new();
        for field in &self.config.fields {
            let value = match field.as_str() {
                "source" => candidate.source.clone(),
                "source_ref" | "sourceRef" => candidate.source_ref.clone().unwrap_or_default(),
                "title" => candidate.title.clone(),
                "ip_address" | "ipAddress" => candidate.ip_address.clone().unwrap_or_default(),
                "severity" => format!("{:?}", candidate.severity),
                other => crate::json_path(&candidate.metadata, other)
                    .map(crate::json_to_string)
                    .unwrap_or_default(),
            };
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(&hasher.finalize()[..16])
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Transition an alert's status, enforcing the allowed-transition table.
    pub async fn set_status(
        &self,
        alert_id: &str,
        status: &str,
        actor: Option<&str>,
    ) -> Result<Alert, AlertError> {
        let next = AlertStatus::from_str(status)?;
        let mut alert = self
            .repo
            .get(alert_id)
            .await?
            .ok_or_else(|| AlertError::NotFound(alert_id.to_string()))?;

        if !alert.status.can_transition_to(next) {
            return Err(AlertError::InvalidTransition { from: alert.status, to: next });
        }

        let now = Utc::now();
        alert.status = next;
        alert.updated_at = now;
        match next {
            AlertStatus::Resolved | AlertStatus::FalsePositive => {
                alert.resolved_at = Some(now);
                alert.resolved_by = actor.map(|a| a.to_string());
            }
            AlertStatus::Closed => {
                alert.closed_at = Some(now);
            }
            _ => {}
        }
        self.repo.update(alert).await
    }

    pub async fn add_comment(&self, alert_id: &str, author: &str, body: &str) -> Result<Alert, AlertError> {
        let mut alert = self
            .repo
            .get(alert_id)
            .await?
            .ok_or_else(|| AlertError::NotFound(alert_id.to_string()))?;
        let now = Utc::now();
        alert.comments.push(AlertComment {
            author: author.to_string(),
            body: body.to_string(),
            created_at: now,
        });
        alert.updated_at = now;
        self.repo.update(alert).await
    }

    /// Purge terminal alerts past the retention window.
    pub async fn purge_old_alerts(&self) -> Result<u64, AlertError> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days as i64);
        let purged = self.repo.purge_terminal_before(cutoff).await?;
        // Drop idle creation locks. A strong count above one means some
        // create_alert call still holds a clone, so that entry must survive
        // or two concurrent duplicates could both pass the dedup check.
        self.creation_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(purged)
    }

    pub fn stats(&self) -> AlertManagerStats {
        AlertManagerStats {
            created: self.stats.created.load(Ordering::Relaxed),
            suppressed: self.stats.suppressed.load(Ordering::Relaxed),
            scoring_failures: self.stats.scoring_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertManagerStats {
    pub created: u64,
    pub suppressed: u64,
    pub scoring_failures: u64,
}

const SOURCE_BONUS_IOC: f64 = 10.0;
const SOURCE_BONUS_CORRELATION: f64 = 20.0;

fn try_score(candidate: &AlertCandidate) -> Result<u8, AlertError> {
    let mut score = match candidate.severity {
        Severity::Critical => 100.0,
        Severity::High => 70.0,
        Severity::Medium => 40.0,
        Severity::Low => 10.0,
        Severity::Info => 0.0,
    };

    match candidate.source.as_str() {
        "ioc_scanner" => score += SOURCE_BONUS_IOC,
        "correlation" => score += SOURCE_BONUS_CORRELATION,
        _ => {}
    }

    if let Some(confidence) = candidate.metadata.get("confidence") {
        let confidence = confidence
            .as_f64()
            .ok_or_else(|| AlertError::Store(format!("non-numeric confidence: {}", confidence)))?;
        score *= confidence / 100.0;
    }

    Ok(score.clamp(0.0, 100.0).round() as u8)
}
