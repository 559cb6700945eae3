//! Detection Pipeline
//!
//! Single entry point for raw telemetry: normalize, run anomaly detectors
//! and correlation rules, fold the results into deduplicated alerts and
//! publish domain events. A failing detection stage degrades to fewer
//! findings; only a malformed input event is rejected outright.

use crate::alerts::{Alert, AlertCandidate, AlertManager};
use crate::baseline::BaselineStore;
use crate::bus::{DomainEvent, EventBus};
use crate::detectors::{DetectorSet, Finding, FindingKind};
use crate::ioc::IocIndex;
use crate::normalize::{normalize, RawEventError};
use crate::rules::{RuleEngine, RuleMatch};
use crate::{EventKind, NormalizedEvent};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What one ingested event produced.
#[derive(Debug)]
pub struct IngestOutcome {
    pub event: NormalizedEvent,
    pub findings: Vec<Finding>,
    pub rule_matches: Vec<RuleMatch>,
    pub alerts: Vec<Alert>,
}

struct PipelineStats {
    events_ingested: AtomicU64,
    events_rejected: AtomicU64,
    findings_total: AtomicU64,
    rule_matches_total: AtomicU64,
    alert_failures: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DetectionPipelineStats {
    pub events_ingested: u64,
    pub events_rejected: u64,
    pub findings_total: u64,
    pub rule_matches_total: u64,
    pub alert_failures: u64,
}

pub struct DetectionPipeline {
    detectors: DetectorSet,
    rules: Arc<RuleEngine>,
    baselines: Arc<BaselineStore>,
    ioc_index: Arc<IocIndex>,
    alerts: Arc<AlertManager>,
    bus: EventBus,
    stats: PipelineStats,
}

impl DetectionPipeline {
    pub fn new(
        detectors: DetectorSet,
        rules: Arc<RuleEngine>,
        baselines: Arc<BaselineStore>,
        ioc_index: Arc<IocIndex>,
        alerts: Arc<AlertManager>,
        bus: EventBus,
    ) -> Self {
        Self {
            detectors,
            rules,
            baselines,
            ioc_index,
            alerts,
            bus,
            stats: PipelineStats {
                events_ingested: AtomicU64::new(0),
                events_rejected: AtomicU64::new(0),
                findings_total: AtomicU64::new(0),
                rule_matches_total: AtomicU64::new(0),
                alert_failures: AtomicU64::new(0),
            },
        }
    }

    pub fn detectors(&self) -> &DetectorSet {
        &self.detectors
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn alert_manager(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Run one raw event through the full pipeline.
    ///
    /// Normalization failure is the only hard error; everything downstream
    /// is best-effort and reported through stats and logs.
    pub async fn ingest(&self, raw: &Value, kind: EventKind) -> Result<IngestOutcome, RawEventError> {
        let event = match normalize(raw, kind) {
            Ok(event) => event,
            Err(e) => {
                self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.stats.events_ingested.fetch_add(1, Ordering::Relaxed);

        let findings = self.detectors.run(&event, &self.baselines, &self.ioc_index);
        self.stats
            .findings_total
            .fetch_add(findings.len() as u64, Ordering::Relaxed);

        let payload = rule_payload(raw, &event);
        let rule_matches = self.rules.evaluate_event(&payload, Utc::now());
        self.stats
            .rule_matches_total
            .fetch_add(rule_matches.len() as u64, Ordering::Relaxed);

        let mut alerts = Vec::new();
        for finding in &findings {
            self.bus.publish(DomainEvent::AnomalyDetected { finding: finding.clone() });
            if let Some(indicator) = &finding.indicator {
                self.bus.publish(DomainEvent::IocMatch {
                    event_id: event.id.clone(),
                    indicator: indicator.clone(),
                });
            }
            match self.alerts.create_alert(finding_candidate(finding)).await {
                Ok(alert) => {
                    self.bus.publish(DomainEvent::AlertCreated { alert: alert.clone() });
                    alerts.push(alert);
                }
                Err(e) => {
                    self.stats.alert_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(finding_id = %finding.id, error = %e, "alert creation failed");
                }
            }
        }
        for rule_match in &rule_matches {
            match self.alerts.create_alert(rule_candidate(rule_match, &event)).await {
                Ok(alert) => {
                    self.bus.publish(DomainEvent::AlertCreated { alert: alert.clone() });
                    alerts.push(alert);
                }
                Err(e) => {
                    self.stats.alert_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(rule_id = %rule_match.rule_id, error = %e, "alert creation failed");
                }
            }
        }

        debug!(
            event_id = %event.id,
            findings = findings.len(),
            rule_matches = rule_matches.len(),
            alerts = alerts.len(),
            "event processed"
        );

        Ok(IngestOutcome { event, findings, rule_matches, alerts })
    }

    pub fn stats(&self) -> DetectionPipelineStats {
        DetectionPipelineStats {
            events_ingested: self.stats.events_ingested.load(Ordering::Relaxed),
            events_rejected: self.stats.events_rejected.load(Ordering::Relaxed),
            findings_total: self.stats.findings_total.load(Ordering::Relaxed),
            rule_matches_total: self.stats.rule_matches_total.load(Ordering::Relaxed),
            alert_failures: self.stats.alert_failures.load(Ordering::Relaxed),
        }
    }
}

/// Rule evaluation sees the raw payload overlaid with the canonical fields,
/// so rules can target either form.
fn rule_payload(raw: &Value, event: &NormalizedEvent) -> Value {
    let mut payload = raw.clone();
    if !payload.is_object() {
        payload = json!({});
    }
    let canonical = [
        ("event_kind", json!(event.kind)),
        ("source_ip", json!(event.source_ip)),
        ("destination_ip", json!(event.destination_ip)),
        ("source_port", json!(event.source_port)),
        ("destination_port", json!(event.destination_port)),
        ("protocol", json!(event.protocol)),
        ("bytes", json!(event.bytes)),
        ("packets", json!(event.packets)),
        ("domain", json!(event.domain)),
        ("url", json!(event.url)),
    ];
    if let Some(object) = payload.as_object_mut() {
        for (key, value) in canonical {
            if !value.is_null() {
                object.insert(key.to_string(), value);
            }
        }
    }
    payload
}

fn finding_candidate(finding: &Finding) -> AlertCandidate {
    let source = match finding.kind {
        FindingKind::IocMatch => "ioc_scanner",
        _ => "traffic_anomaly",
    };
    let mut metadata = json!({
        "finding_kind": finding.kind.tag(),
        "occurrences": finding.occurrences,
    });
    if let Some(indicator) = &finding.indicator {
        metadata["confidence"] = json!(indicator.confidence);
        metadata["feed_id"] = json!(indicator.feed_id);
        metadata["indicator"] = json!(indicator.value);
    }
    AlertCandidate {
        title: title_for(finding),
        description: finding.description.clone(),
        severity: finding.severity,
        source: source.to_string(),
        source_ref: Some(finding.id.clone()),
        ip_address: Some(finding.source_ip.clone()),
        score: None,
        metadata,
    }
}

fn title_for(finding: &Finding) -> String {
    match finding.kind {
        FindingKind::Volume => format!("Unusual traffic volume from {}", finding.source_ip),
        FindingKind::Connection => format!("Unusual connection from {}", finding.source_ip),
        FindingKind::NewHost => format!("New host observed: {}", finding.source_ip),
        FindingKind::IocMatch => format!("Threat indicator match from {}", finding.source_ip),
    }
}

fn rule_candidate(rule_match: &RuleMatch, event: &NormalizedEvent) -> AlertCandidate {
    AlertCandidate {
        title: rule_match.title.clone(),
        description: rule_match.description.clone(),
        severity: rule_match.severity,
        source: "correlation".to_string(),
        source_ref: Some(rule_match.rule_id.clone()),
        ip_address: Some(event.source_ip.clone()),
        score: None,
        metadata: json!({
            "rule_name": rule_match.rule_name,
            "tags": rule_match.tags,
            "event_id": event.id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{DedupConfig, InMemoryAlertStore};
    use crate::baseline::{BaselineProfile, Direction};
    use crate::detectors::DetectorConfig;
    use crate::ioc::{FeedDropPolicy, IocEntry, IocType};
    use crate::rules::{
        AlertTemplate, ConditionItem, ConditionOp, CorrelationRule, RuleKind, RuleWindowConfig,
    };
    use crate::Severity;

    fn pipeline() -> (DetectionPipeline, Arc<IocIndex>, Arc<BaselineStore>) {
        let ioc_index = Arc::new(IocIndex::new(FeedDropPolicy::Deactivate));
        let baselines = Arc::new(BaselineStore::new());
        let rules = Arc::new(RuleEngine::new());
        let alerts = Arc::new(AlertManager::new(
            Arc::new(InMemoryAlertStore::new()),
            DedupConfig::default(),
        ));
        // New-host detection off: these tests seed no baselines, and every
        // event would otherwise carry a NewHost finding.
        let config = DetectorConfig { new_host_detection: false, ..DetectorConfig::default() };
        let pipeline = DetectionPipeline::new(
            DetectorSet::new(config),
            rules,
            baselines.clone(),
            ioc_index.clone(),
            alerts,
            EventBus::default(),
        );
        (pipeline, ioc_index, baselines)
    }

    fn seed_indicator(index: &IocIndex, value: &str) {
        let now = Utc::now();
        index.refresh(
            "feed-1",
            vec![IocEntry {
                id: "ioc-1".to_string(),
                ioc_type: IocType::Domain,
                value: value.to_string(),
                feed_id: "feed-1".to_string(),
                confidence: 90,
                tlp: None,
                description: None,
                tags: vec![],
                active: true,
                first_seen: now,
                last_seen: now,
            }],
        );
    }

    #[tokio::test]
    async fn test_malformed_event_rejected() {
        let (pipeline, _ioc, _baselines) = pipeline();
        let raw = json!({"sourceIp": "10.0.0.1"});
        assert!(pipeline.ingest(&raw, EventKind::Flow).await.is_err());
        assert_eq!(pipeline.stats().events_rejected, 1);
        assert_eq!(pipeline.stats().events_ingested, 0);
    }

    #[tokio::test]
    async fn test_dns_ioc_match_creates_alert_and_events() {
        let (pipeline, ioc_index, _baselines) = pipeline();
        seed_indicator(&ioc_index, "evil.example.com");
        let mut rx = pipeline.bus().subscribe();

        let raw = json!({"sourceIp": "10.0.0.5", "query": "EVIL.example.com"});
        let outcome = pipeline.ingest(&raw, EventKind::Dns).await.unwrap();

        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].kind, FindingKind::IocMatch);
        assert_eq!(outcome.alerts.len(), 1);
        let alert = &outcome.alerts[0];
        assert_eq!(alert.source, "ioc_scanner");
        // Unmarked TLP yields a medium finding: base 40, +10 ioc bonus,
        // x0.9 confidence.
        assert_eq!(alert.severity, Severity::Medium);
        assert_eq!(alert.score, 45);

        let mut saw_anomaly = false;
        let mut saw_ioc = false;
        let mut saw_alert = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                DomainEvent::AnomalyDetected { .. } => saw_anomaly = true,
                DomainEvent::IocMatch { .. } => saw_ioc = true,
                DomainEvent::AlertCreated { .. } => saw_alert = true,
            }
        }
        assert!(saw_anomaly && saw_ioc && saw_alert);
    }

    #[tokio::test]
    async fn test_rule_match_creates_correlation_alert() {
        let (pipeline, _ioc, _baselines) = pipeline();
        pipeline
            .rules()
            .create_rule(CorrelationRule {
                id: "rule-1".to_string(),
                name: "Blocked traffic".to_string(),
                kind: RuleKind::Simple,
                severity: Severity::High,
                enabled: true,
                conditions: vec![ConditionItem::Leaf {
                    field: "action".to_string(),
                    operator: ConditionOp::Eq,
                    value: json!("blocked"),
                }],
                config: RuleWindowConfig::default(),
                alert_template: AlertTemplate {
                    title: "Blocked traffic from {source_ip}".to_string(),
                    description: "Firewall blocked traffic".to_string(),
                },
                tags: vec![],
            })
            .unwrap();

        let raw = json!({
            "sourceIp": "10.0.0.9",
            "destinationIp": "203.0.113.10",
            "action": "blocked"
        });
        let outcome = pipeline.ingest(&raw, EventKind::Flow).await.unwrap();

        assert_eq!(outcome.rule_matches.len(), 1);
        let alert = outcome
            .alerts
            .iter()
            .find(|a| a.source == "correlation")
            .expect("correlation alert");
        assert_eq!(alert.title, "Blocked traffic from 10.0.0.9");
        // High base 70 + 20 correlation bonus.
        assert_eq!(alert.score, 90);
    }

    #[tokio::test]
    async fn test_known_quiet_host_produces_no_alerts() {
        let (pipeline, _ioc, baselines) = pipeline();
        baselines.insert(BaselineProfile {
            ip_address: "10.0.0.2".to_string(),
            direction: Direction::Source,
            total_flows: 200,
            total_bytes: 1_000_000,
            total_packets: 20_000,
            avg_bytes_per_flow: 5_000.0,
            avg_packets_per_flow: 100.0,
            common_ports: vec![443],
            common_protocols: vec!["tcp".to_string()],
            common_destinations: vec!["198.51.100.4".to_string()],
            window_start: Utc::now(),
            window_end: Utc::now(),
        });

        let raw = json!({
            "sourceIp": "10.0.0.2",
            "destinationIp": "198.51.100.4",
            "destinationPort": 443,
            "protocol": "tcp",
            "bytes": 4_000
        });
        let outcome = pipeline.ingest(&raw, EventKind::Flow).await.unwrap();
        assert!(outcome.findings.is_empty());
        assert!(outcome.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_findings_collapse_into_one_alert() {
        let (pipeline, ioc_index, _baselines) = pipeline();
        seed_indicator(&ioc_index, "evil.example.com");
        let raw = json!({"sourceIp": "10.0.0.5", "query": "evil.example.com"});

        let first = pipeline.ingest(&raw, EventKind::Dns).await.unwrap();
        let second = pipeline.ingest(&raw, EventKind::Dns).await.unwrap();

        assert_eq!(first.alerts.len(), 1);
        assert_eq!(second.alerts.len(), 1);
        assert_eq!(first.alerts[0].id, second.alerts[0].id);
    }
}
