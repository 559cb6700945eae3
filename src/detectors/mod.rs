//! Anomaly Detectors
//!
//! Independent detection strategies composed by a dispatcher: volume
//! anomaly, connection/port anomaly, new-host anomaly and IOC match. Each
//! strategy is a pure function over a normalized event plus baseline/IOC
//! lookups; the dispatcher owns the bounded flow cache and the finding
//! merge table.

use crate::baseline::{BaselineStore, Direction};
use crate::ioc::{IocEntry, IocIndex};
use crate::{NormalizedEvent, Severity};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;

pub mod connection;
pub mod ioc_match;
pub mod new_host;
pub mod volume;

/// Findings of the same (kind, source, destination) within this window are
/// merged instead of duplicated. Distinct from the alert-level dedup window.
const FINDING_MERGE_WINDOW_SECS: i64 = 3600;

/// How far back the flow cache answers "has this port been seen".
const PORT_RECENCY_WINDOW_SECS: i64 = 24 * 3600;

/// Cap on the per-host recent-port list inside one cache slot.
const RECENT_PORTS_PER_HOST: usize = 512;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Volume,
    Connection,
    NewHost,
    IocMatch,
}

impl FindingKind {
    pub fn tag(&self) -> &'static str {
        match self {
            FindingKind::Volume => "volume",
            FindingKind::Connection => "connection",
            FindingKind::NewHost => "new_host",
            FindingKind::IocMatch => "ioc_match",
        }
    }
}

/// Detection result, possibly merged across repeated occurrences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub kind: FindingKind,
    pub source_ip: String,
    pub destination_ip: Option<String>,
    pub severity: Severity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrences: u32,
    pub source_event_id: String,
    /// Matched indicator, present for IOC findings
    pub indicator: Option<IocEntry>,
}

/// Raw detector output before merge
#[derive(Debug, Clone)]
pub struct FindingCandidate {
    pub kind: FindingKind,
    pub source_ip: String,
    pub destination_ip: Option<String>,
    pub severity: Severity,
    pub description: String,
    pub indicator: Option<IocEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum bytes/avg ratio before a volume finding triggers
    pub volume_ratio_threshold: f64,
    /// Absolute byte floor for volume findings
    pub volume_bytes_floor: u64,
    /// Emit findings for hosts with no baseline at all
    pub new_host_detection: bool,
    /// Hosts tracked by the flow cache (oldest-inserted evicted first)
    pub max_cache_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            volume_ratio_threshold: 10.0,
            volume_bytes_floor: 1_000_000,
            new_host_detection: true,
            max_cache_size: 10_000,
        }
    }
}

/// Bounded per-host cache of recently seen destination ports.
///
/// One list per source IP and per destination IP; updates for the same key
/// are serialized by the cache mutex, so concurrent events touching one
/// host cannot lose entries during eviction.
pub struct FlowCache {
    by_source: parking_lot::Mutex<LruCache<String, VecDeque<(u16, DateTime<Utc>)>>>,
    by_destination: parking_lot::Mutex<LruCache<String, VecDeque<(u16, DateTime<Utc>)>>>,
}

impl FlowCache {
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            by_source: parking_lot::Mutex::new(LruCache::new(cap)),
            by_destination: parking_lot::Mutex::new(LruCache::new(cap)),
        }
    }

    /// True if `port` was seen from `source_ip` within the last 24h.
    pub fn port_seen_from_source(&self, source_ip: &str, port: u16, now: DateTime<Utc>) -> bool {
        let cutoff = now - Duration::seconds(PORT_RECENCY_WINDOW_SECS);
        let mut cache = self.by_source.lock();
        match cache.get(source_ip) {
            Some(ports) => ports.iter().any(|(p, ts)| *p == port && *ts >= cutoff),
            None => false,
        }
    }

    /// Record the event's port on both the source and destination lists.
    pub fn record(&self, event: &NormalizedEvent, now: DateTime<Utc>) {
        let Some(port) = event.destination_port else {
            return;
        };
        Self::push(&self.by_source, &event.source_ip, port, now);
        if let Some(dst) = &event.destination_ip {
            Self::push(&self.by_destination, dst, port, now);
        }
    }

    fn push(
        cache: &parking_lot::Mutex<LruCache<String, VecDeque<(u16, DateTime<Utc>)>>>,
        key: &str,
        port: u16,
        now: DateTime<Utc>,
    ) {
        let cutoff = now - Duration::seconds(PORT_RECENCY_WINDOW_SECS);
        let mut cache = cache.lock();
        if cache.get(key).is_none() {
            cache.put(key.to_string(), VecDeque::new());
        }
        if let Some(ports) = cache.get_mut(key) {
            while ports.front().is_some_and(|(_, ts)| *ts < cutoff) {
                ports.pop_front();
            }
            while ports.len() >= RECENT_PORTS_PER_HOST {
                ports.pop_front();
            }
            ports.push_back((port, now));
        }
    }
}

struct DispatchStats {
    events_seen: std::sync::atomic::AtomicU64,
    findings_created: std::sync::atomic::AtomicU64,
    findings_merged: std::sync::atomic::AtomicU64,
}

/// Detector dispatcher: runs every strategy, merges repeated findings.
pub struct DetectorSet {
    config: DetectorConfig,
    flow_cache: FlowCache,
    open_findings: DashMap<String, Finding>,
    stats: DispatchStats,
}

impl DetectorSet {
    pub fn new(config: DetectorConfig) -> Self {
        let flow_cache = FlowCache::new(config.max_cache_size);
        Self {
            config,
            flow_cache,
            open_findings: DashMap::new(),
            stats: DispatchStats {
                events_seen: std::sync::atomic::AtomicU64::new(0),
                findings_created: std::sync::atomic::AtomicU64::new(0),
                findings_merged: std::sync::atomic::AtomicU64::new(0),
            },
        }
    }

    /// Run all detectors against one event.
    pub fn run(
        &self,
        event: &NormalizedEvent,
        baselines: &BaselineStore,
        ioc_index: &IocIndex,
    ) -> Vec<Finding> {
        use std::sync::atomic::Ordering;

        self.stats.events_seen.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        let src_baseline = baselines.get(&event.source_ip, Direction::Source);
        let dst_baseline = event
            .destination_ip
            .as_deref()
            .and_then(|ip| baselines.get(ip, Direction::Destination));

        let mut candidates: Vec<FindingCandidate> = Vec::new();

        candidates.extend(volume::detect(
            event,
            src_baseline.as_ref(),
            dst_baseline.as_ref(),
            &self.config,
        ));

        // Recency must be checked before the current event lands in the
        // cache, or every port would count as already seen.
        if let Some(port) = event.destination_port {
            let port_recent = self.flow_cache.port_seen_from_source(&event.source_ip, port, now);
            candidates.extend(connection::detect(event, src_baseline.as_ref(), port_recent));
        }

        if self.config.new_host_detection {
            let known = src_baseline.is_some()
                || baselines.get(&event.source_ip, Direction::Destination).is_some();
            candidates.extend(new_host::detect(event, known));
        }

        candidates.extend(ioc_match::detect(event, ioc_index));

        self.flow_cache.record(event, now);

        candidates
            .into_iter()
            .map(|c| self.merge(c, &event.id, now))
            .collect()
    }

    /// Merge a candidate into an open finding of the same
    /// (kind, source, destination) created within the last hour, or open a
    /// fresh one.
    fn merge(&self, candidate: FindingCandidate, event_id: &str, now: DateTime<Utc>) -> Finding {
        use std::sync::atomic::Ordering;

        let key = format!(
            "{}:{}:{}",
            candidate.kind.tag(),
            candidate.source_ip,
            candidate.destination_ip.as_deref().unwrap_or("-")
        );

        match self.open_findings.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let finding = occupied.get_mut();
                if now - finding.detected_at < Duration::seconds(FINDING_MERGE_WINDOW_SECS) {
                    finding.occurrences += 1;
                    finding.last_seen_at = now;
                    finding.severity = finding.severity.max(candidate.severity);
                    self.stats.findings_merged.fetch_add(1, Ordering::Relaxed);
                } else {
                    *finding = new_finding(&candidate, event_id, now);
                    self.stats.findings_created.fetch_add(1, Ordering::Relaxed);
                }
                finding.clone()
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let finding = new_finding(&candidate, event_id, now);
                self.stats.findings_created.fetch_add(1, Ordering::Relaxed);
                vacant.insert(finding.clone());
                finding
            }
        }
    }

    /// Drop merge-table entries past the merge window.
    pub fn prune_findings(&self, now: DateTime<Utc>) -> usize {
        let before = self.open_findings.len();
        self.open_findings
            .retain(|_, f| now - f.detected_at < Duration::seconds(FINDING_MERGE_WINDOW_SECS));
        before - self.open_findings.len()
    }

    pub fn stats(&self) -> DetectorStats {
        use std::sync::atomic::Ordering;
        DetectorStats {
            events_seen: self.stats.events_seen.load(Ordering::Relaxed),
            findings_created: self.stats.findings_created.load(Ordering::Relaxed),
            findings_merged: self.stats.findings_merged.load(Ordering::Relaxed),
            open_findings: self.open_findings.len() as u64,
        }
    }
}

fn new_finding(candidate: &FindingCandidate, event_id: &str, now: DateTime<Utc>) -> Finding {
    Finding {
        id: uuid::Uuid::new_v4().to_string(),
        kind: candidate.kind,
        source_ip: candidate.source_ip.clone(),
        destination_ip: candidate.destination_ip.clone(),
        severity: candidate.severity,
        description: candidate.description.clone(),
        detected_at: now,
        last_seen_at: now,
        occurrences: 1,
        source_event_id: event_id.to_string(),
        indicator: candidate.indicator.clone(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStats {
    pub events_seen: u64,
    pub findings_created: u64,
    pub findings_merged: u64,
    pub open_findings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineStore;
    use crate::ioc::{IocIndex, IocType, Tlp};
    use serde_json::json;

    fn flow_event(src: &str, dst: &str, port: u16, bytes: u64) -> NormalizedEvent {
        crate::normalize(
            &json!({
                "sourceIp": src,
                "destinationIp": dst,
                "destinationPort": port,
                "protocol": "tcp",
                "bytes": bytes,
                "packets": bytes / 100
            }),
            crate::EventKind::Flow,
        )
        .unwrap()
    }

    #[test]
    fn test_finding_merge_within_window() {
        let set = DetectorSet::new(DetectorConfig::default());
        let baselines = BaselineStore::new();
        let index = IocIndex::default();
        index.refresh(
            "feed-1",
            vec![crate::ioc::IocEntry {
                id: "i1".to_string(),
                ioc_type: IocType::Ip,
                value: "8.8.8.8".to_string(),
                feed_id: "feed-1".to_string(),
                confidence: 90,
                tlp: Some(Tlp::Red),
                description: None,
                tags: vec![],
                active: true,
                first_seen: Utc::now(),
                last_seen: Utc::now(),
            }],
        );

        let a = set.run(&flow_event("10.0.0.5", "8.8.8.8", 443, 100), &baselines, &index);
        let b = set.run(&flow_event("10.0.0.5", "8.8.8.8", 443, 100), &baselines, &index);

        let first = a.iter().find(|f| f.kind == FindingKind::IocMatch).unwrap();
        let second = b.iter().find(|f| f.kind == FindingKind::IocMatch).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.occurrences, 2);
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[test]
    fn test_finding_reopens_after_merge_window() {
        let set = DetectorSet::new(DetectorConfig::default());
        let candidate = || FindingCandidate {
            kind: FindingKind::IocMatch,
            source_ip: "10.0.0.5".to_string(),
            destination_ip: Some("8.8.8.8".to_string()),
            severity: Severity::High,
            description: "contact with listed address".to_string(),
            indicator: None,
        };

        let now = Utc::now();
        let first = set.merge(candidate(), "evt-1", now);
        // Same key two hours later: the open finding is stale, so a new
        // finding starts rather than the old one accumulating.
        let second = set.merge(candidate(), "evt-2", now + Duration::hours(2));

        assert_ne!(first.id, second.id);
        assert_eq!(second.occurrences, 1);
        assert_eq!(second.source_event_id, "evt-2");
        assert_eq!(set.stats().findings_created, 2);
        assert_eq!(set.stats().findings_merged, 0);
    }

    #[test]
    fn test_flow_cache_recency() {
        let cache = FlowCache::new(16);
        let now = Utc::now();
        let event = flow_event("10.0.0.5", "1.1.1.1", 8443, 100);

        assert!(!cache.port_seen_from_source("10.0.0.5", 8443, now));
        cache.record(&event, now);
        assert!(cache.port_seen_from_source("10.0.0.5", 8443, now));
        assert!(!cache.port_seen_from_source("10.0.0.5", 9999, now));

        // Entries past the 24h window stop counting.
        let later = now + Duration::hours(25);
        assert!(!cache.port_seen_from_source("10.0.0.5", 8443, later));
    }

    #[test]
    fn test_flow_cache_eviction_bounded() {
        let cache = FlowCache::new(2);
        let now = Utc::now();
        cache.record(&flow_event("h1", "1.1.1.1", 80, 1), now);
        cache.record(&flow_event("h2", "1.1.1.1", 80, 1), now);
        cache.record(&flow_event("h3", "1.1.1.1", 80, 1), now);

        // h1 was evicted to keep the cache at capacity.
        assert!(!cache.port_seen_from_source("h1", 80, now));
        assert!(cache.port_seen_from_source("h3", 80, now));
    }

    #[test]
    fn test_prune_findings() {
        let set = DetectorSet::new(DetectorConfig::default());
        let baselines = BaselineStore::new();
        let index = IocIndex::default();
        set.run(&flow_event("10.0.0.5", "1.1.1.1", 443, 100), &baselines, &index);
        assert!(set.open_findings.len() > 0);

        let removed = set.prune_findings(Utc::now() + Duration::hours(2));
        assert_eq!(removed, set.stats().findings_created as usize);
        assert_eq!(set.open_findings.len(), 0);
    }
}
