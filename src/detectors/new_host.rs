//! New-host anomaly detection
//!
//! Flags traffic from hosts with no baseline profile in either direction.
//! Feature-flagged because the first cycle after deployment would flag the
//! whole network.

use crate::detectors::{FindingCandidate, FindingKind};
use crate::{NormalizedEvent, Severity};

pub fn detect(event: &NormalizedEvent, host_known: bool) -> Option<FindingCandidate> {
    if host_known || event.source_ip.is_empty() {
        return None;
    }

    Some(FindingCandidate {
        kind: FindingKind::NewHost,
        source_ip: event.source_ip.clone(),
        destination_ip: event.destination_ip.clone(),
        severity: Severity::Medium,
        description: format!("Traffic from previously unseen host {}", event.source_ip),
        indicator: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> NormalizedEvent {
        crate::normalize(
            &json!({"sourceIp": "10.0.0.99", "destinationIp": "1.1.1.1"}),
            crate::EventKind::Flow,
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_host_flagged() {
        let finding = detect(&event(), false).unwrap();
        assert_eq!(finding.kind, FindingKind::NewHost);
        assert_eq!(finding.severity, Severity::Medium);
    }

    #[test]
    fn test_known_host_ignored() {
        assert!(detect(&event(), true).is_none());
    }
}
