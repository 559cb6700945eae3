//! Volume anomaly detection
//!
//! Flags flows whose byte count dwarfs the host's baseline average. Checked
//! independently against the source-side and destination-side baselines.

use crate::baseline::BaselineProfile;
use crate::detectors::{DetectorConfig, FindingCandidate, FindingKind};
use crate::{NormalizedEvent, Severity};

const CRITICAL_RATIO: f64 = 100.0;
const CRITICAL_BYTES: u64 = 100_000_000;
const HIGH_RATIO: f64 = 50.0;
const HIGH_BYTES: u64 = 10_000_000;
const MEDIUM_RATIO: f64 = 20.0;

pub fn detect(
    event: &NormalizedEvent,
    src_baseline: Option<&BaselineProfile>,
    dst_baseline: Option<&BaselineProfile>,
    config: &DetectorConfig,
) -> Vec<FindingCandidate> {
    let Some(bytes) = event.bytes else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    for (side, baseline) in [("source", src_baseline), ("destination", dst_baseline)] {
        let Some(baseline) = baseline else { continue };
        if baseline.avg_bytes_per_flow <= 0.0 {
            continue;
        }
        let ratio = bytes as f64 / baseline.avg_bytes_per_flow;
        if ratio <= config.volume_ratio_threshold || bytes <= config.volume_bytes_floor {
            continue;
        }
        candidates.push(FindingCandidate {
            kind: FindingKind::Volume,
            source_ip: event.source_ip.clone(),
            destination_ip: event.destination_ip.clone(),
            severity: severity_for(ratio, bytes),
            description: format!(
                "Traffic volume anomaly: {} bytes against {} baseline avg {:.0} bytes/flow (ratio {:.1})",
                bytes, side, baseline.avg_bytes_per_flow, ratio
            ),
            indicator: None,
        });
    }
    candidates
}

fn severity_for(ratio: f64, bytes: u64) -> Severity {
    if ratio > CRITICAL_RATIO || bytes > CRITICAL_BYTES {
        Severity::Critical
    } else if ratio > HIGH_RATIO || bytes > HIGH_BYTES {
        Severity::High
    } else if ratio > MEDIUM_RATIO {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::Direction;
    use chrono::Utc;
    use serde_json::json;

    fn flow_event(bytes: u64) -> NormalizedEvent {
        crate::normalize(
            &json!({
                "sourceIp": "10.0.0.5",
                "destinationIp": "8.8.8.8",
                "destinationPort": 53,
                "bytes": bytes
            }),
            crate::EventKind::Flow,
        )
        .unwrap()
    }

    fn baseline(avg_bytes: f64) -> BaselineProfile {
        BaselineProfile {
            ip_address: "10.0.0.5".to_string(),
            direction: Direction::Source,
            total_flows: 100,
            total_bytes: (avg_bytes * 100.0) as u64,
            total_packets: 1000,
            avg_bytes_per_flow: avg_bytes,
            avg_packets_per_flow: 10.0,
            common_ports: vec![443, 80],
            common_protocols: vec!["tcp".to_string()],
            common_destinations: vec![],
            window_start: Utc::now(),
            window_end: Utc::now(),
        }
    }

    #[test]
    fn test_high_ratio_is_critical() {
        // 50MB against a 100KB average: ratio 500.
        let event = flow_event(50_000_000);
        let base = baseline(100_000.0);
        let findings = detect(&event, Some(&base), None, &DetectorConfig::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Volume);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_below_floor_never_triggers() {
        // Ratio is enormous but absolute bytes stay under the 1MB floor.
        let event = flow_event(900_000);
        let base = baseline(100.0);
        assert!(detect(&event, Some(&base), None, &DetectorConfig::default()).is_empty());
    }

    #[test]
    fn test_severity_ladder() {
        assert_eq!(severity_for(500.0, 50_000_000), Severity::Critical);
        assert_eq!(severity_for(60.0, 2_000_000), Severity::High);
        assert_eq!(severity_for(25.0, 2_000_000), Severity::Medium);
        assert_eq!(severity_for(15.0, 2_000_000), Severity::Low);
    }

    #[test]
    fn test_both_sides_checked() {
        let event = flow_event(5_000_000);
        let src = baseline(100_000.0);
        let mut dst = baseline(50_000.0);
        dst.direction = Direction::Destination;
        dst.ip_address = "8.8.8.8".to_string();

        let findings = detect(&event, Some(&src), Some(&dst), &DetectorConfig::default());
        assert_eq!(findings.len(), 2);
    }

    #[test]
    fn test_no_baseline_no_finding() {
        let event = flow_event(50_000_000);
        assert!(detect(&event, None, None, &DetectorConfig::default()).is_empty());
    }
}
