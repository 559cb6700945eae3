//! Connection/port anomaly detection
//!
//! Flags destination ports outside the source host's usual set, unless the
//! port was already seen from that source within the last 24h (low ports
//! stay suspicious regardless of recency).

use crate::baseline::BaselineProfile;
use crate::detectors::{FindingCandidate, FindingKind};
use crate::{NormalizedEvent, Severity};

const PRIVILEGED_PORT_MAX: u16 = 1024;

pub fn detect(
    event: &NormalizedEvent,
    src_baseline: Option<&BaselineProfile>,
    port_seen_recently: bool,
) -> Option<FindingCandidate> {
    let port = event.destination_port?;
    let baseline = src_baseline?;

    if baseline.common_ports.contains(&port) {
        return None;
    }
    let privileged = port < PRIVILEGED_PORT_MAX;
    if port_seen_recently && !privileged {
        return None;
    }

    Some(FindingCandidate {
        kind: FindingKind::Connection,
        source_ip: event.source_ip.clone(),
        destination_ip: event.destination_ip.clone(),
        severity: if privileged { Severity::High } else { Severity::Medium },
        description: format!(
            "Unusual destination port {} from {} (not in host's common ports)",
            port, event.source_ip
        ),
        indicator: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::Direction;
    use chrono::Utc;
    use serde_json::json;

    fn event(port: u16) -> NormalizedEvent {
        crate::normalize(
            &json!({
                "sourceIp": "10.0.0.5",
                "destinationIp": "1.1.1.1",
                "destinationPort": port
            }),
            crate::EventKind::Flow,
        )
        .unwrap()
    }

    fn baseline(ports: Vec<u16>) -> BaselineProfile {
        BaselineProfile {
            ip_address: "10.0.0.5".to_string(),
            direction: Direction::Source,
            total_flows: 100,
            total_bytes: 1_000_000,
            total_packets: 10_000,
            avg_bytes_per_flow: 10_000.0,
            avg_packets_per_flow: 100.0,
            common_ports: ports,
            common_protocols: vec!["tcp".to_string()],
            common_destinations: vec![],
            window_start: Utc::now(),
            window_end: Utc::now(),
        }
    }

    #[test]
    fn test_common_port_ignored() {
        let base = baseline(vec![443, 80]);
        assert!(detect(&event(443), Some(&base), false).is_none());
    }

    #[test]
    fn test_uncommon_high_port_medium() {
        let base = baseline(vec![443, 80]);
        let finding = detect(&event(8443), Some(&base), false).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
    }

    #[test]
    fn test_uncommon_privileged_port_high() {
        let base = baseline(vec![443, 80]);
        let finding = detect(&event(23), Some(&base), false).unwrap();
        assert_eq!(finding.severity, Severity::High);
    }

    #[test]
    fn test_recent_high_port_suppressed() {
        let base = baseline(vec![443]);
        assert!(detect(&event(8443), Some(&base), true).is_none());
        // Privileged ports trigger even if recently seen.
        assert!(detect(&event(23), Some(&base), true).is_some());
    }

    #[test]
    fn test_requires_baseline() {
        assert!(detect(&event(8443), None, false).is_none());
    }
}
