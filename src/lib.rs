//! NDR Detection & Correlation Core
//!
//! Event correlation and anomaly/IOC detection engine for a network
//! detection and response platform:
//! - Ingress normalization of flow/DNS/HTTP events
//! - IOC feed aggregation and exact-match indicator lookup
//! - Per-host traffic baselines and statistical anomaly detection
//! - Declarative correlation rules (condition trees, threshold windows)
//! - Alert deduplication, scoring and lifecycle management
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        DETECTION PIPELINE                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  raw events ──► Normalizer ──┬──► Anomaly Detectors ──┐          │
//! │                              │         │   ▲          │          │
//! │                              │         ▼   │          ▼          │
//! │                              │   ┌─────────┴───┐   findings      │
//! │                              │   │ IOC Index / │      │          │
//! │                              │   │  Baselines  │      ▼          │
//! │                              │   └─────────────┘  Dedup/Score    │
//! │                              │                        │          │
//! │                              └──► Rule Engine ────────┤          │
//! │                                                       ▼          │
//! │  feeds/flow history ◄── Scheduler            Alert Store + Bus   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod alerts;
pub mod baseline;
pub mod bus;
pub mod detectors;
pub mod feeds;
pub mod ioc;
pub mod normalize;
pub mod pipeline;
pub mod rules;
pub mod scheduler;

pub use alerts::{Alert, AlertCandidate, AlertManager, AlertRepository, AlertStatus};
pub use baseline::{BaselineProfile, BaselineStore, Direction, FlowHistory, FlowRecord};
pub use bus::{DomainEvent, EventBus};
pub use detectors::{DetectorConfig, DetectorSet, Finding, FindingKind};
pub use feeds::{FeedConfig, FeedFetcher, FeedFormat, FeedManager};
pub use ioc::{IocEntry, IocIndex, IocType, Tlp};
pub use normalize::{normalize, RawEventError};
pub use pipeline::DetectionPipeline;
pub use rules::{CorrelationRule, RuleEngine, RuleKind};
pub use scheduler::{Scheduler, SchedulerConfig};

// =============================================================================
// Core Types
// =============================================================================

/// Kind of network event entering the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Dns,
    Http,
    Flow,
}

/// Alert/finding severity, ordered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

/// Canonical event record produced by the ingress normalizer.
///
/// Immutable once created; every detector and the rule engine consume it
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub destination_ip: Option<String>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub bytes: Option<u64>,
    pub packets: Option<u64>,
    /// Queried domain (DNS) or hostname parsed from the URL (HTTP)
    pub domain: Option<String>,
    pub url: Option<String>,
    /// Original payload, kept for rule-engine field lookups
    pub raw: serde_json::Value,
}

// =============================================================================
// JSON field access
// =============================================================================

/// Resolve a dot-notation path into a JSON value.
///
/// Missing segments yield `None`; rule leaves and feed field mappings both
/// rely on that (a missing field never errors).
pub(crate) fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Render a JSON value as a plain string (no surrounding quotes).
pub(crate) fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
