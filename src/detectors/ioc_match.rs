//! IOC match detection
//!
//! Exact-match lookups of event fields against the IOC index: DNS query
//! against domain indicators, HTTP URL against url and (parsed hostname)
//! domain indicators, flow endpoints against ip indicators.

use crate::detectors::{FindingCandidate, FindingKind};
use crate::ioc::{IocEntry, IocIndex, IocType, Tlp};
use crate::{EventKind, NormalizedEvent, Severity};

pub fn detect(event: &NormalizedEvent, index: &IocIndex) -> Vec<FindingCandidate> {
    let mut hits: Vec<(IocEntry, String)> = Vec::new();

    match event.kind {
        EventKind::Dns => {
            if let Some(domain) = &event.domain {
                if let Some(entry) = index.lookup(IocType::Domain, domain) {
                    hits.push((entry, format!("DNS query for listed domain {}", domain)));
                }
            }
        }
        EventKind::Http => {
            if let Some(url) = &event.url {
                if let Some(entry) = index.lookup(IocType::Url, url) {
                    hits.push((entry, format!("HTTP request to listed URL {}", url.trim())));
                }
            }
            if let Some(domain) = &event.domain {
                if let Some(entry) = index.lookup(IocType::Domain, domain) {
                    hits.push((entry, format!("HTTP request to listed domain {}", domain)));
                }
            }
        }
        EventKind::Flow => {
            if !event.source_ip.is_empty() {
                if let Some(entry) = index.lookup(IocType::Ip, &event.source_ip) {
                    hits.push((entry, format!("Flow from listed IP {}", event.source_ip)));
                }
            }
            if let Some(dst) = &event.destination_ip {
                if let Some(entry) = index.lookup(IocType::Ip, dst) {
                    hits.push((entry, format!("Flow to listed IP {}", dst)));
                }
            }
        }
    }

    hits.into_iter()
        .map(|(entry, description)| FindingCandidate {
            kind: FindingKind::IocMatch,
            source_ip: event.source_ip.clone(),
            destination_ip: event.destination_ip.clone(),
            severity: severity_for_tlp(entry.tlp),
            description: format!("{} (feed {}, confidence {})", description, entry.feed_id, entry.confidence),
            indicator: Some(entry),
        })
        .collect()
}

/// TLP marking decides how loudly an IOC hit fires.
pub fn severity_for_tlp(tlp: Option<Tlp>) -> Severity {
    match tlp {
        Some(Tlp::Red) => Severity::Critical,
        Some(Tlp::Amber) => Severity::High,
        Some(Tlp::Green) => Severity::Medium,
        Some(Tlp::White) => Severity::Low,
        None => Severity::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn index_with(ioc_type: IocType, value: &str, tlp: Option<Tlp>) -> IocIndex {
        let index = IocIndex::default();
        index.refresh(
            "feed-1",
            vec![IocEntry {
                id: "i1".to_string(),
                ioc_type,
                value: value.to_string(),
                feed_id: "feed-1".to_string(),
                confidence: 85,
                tlp,
                description: None,
                tags: vec![],
                active: true,
                first_seen: Utc::now(),
                last_seen: Utc::now(),
            }],
        );
        index
    }

    #[test]
    fn test_dns_domain_match() {
        let index = index_with(IocType::Domain, "evil.example.com", Some(Tlp::Red));
        // Mixed case and trailing space in the query still match.
        let event = crate::normalize(
            &json!({"sourceIp": "10.0.0.5", "query": "EVIL.EXAMPLE.COM "}),
            EventKind::Dns,
        )
        .unwrap();

        let findings = detect(&event, &index);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_http_url_and_hostname() {
        let index = IocIndex::default();
        index.refresh(
            "feed-1",
            vec![
                IocEntry {
                    id: "u1".to_string(),
                    ioc_type: IocType::Url,
                    value: "http://bad.example.com/drop".to_string(),
                    feed_id: "feed-1".to_string(),
                    confidence: 80,
                    tlp: Some(Tlp::Amber),
                    description: None,
                    tags: vec![],
                    active: true,
                    first_seen: Utc::now(),
                    last_seen: Utc::now(),
                },
                IocEntry {
                    id: "d1".to_string(),
                    ioc_type: IocType::Domain,
                    value: "bad.example.com".to_string(),
                    feed_id: "feed-1".to_string(),
                    confidence: 80,
                    tlp: Some(Tlp::Green),
                    description: None,
                    tags: vec![],
                    active: true,
                    first_seen: Utc::now(),
                    last_seen: Utc::now(),
                },
            ],
        );

        let event = crate::normalize(
            &json!({"sourceIp": "10.0.0.5", "url": "http://bad.example.com/drop"}),
            EventKind::Http,
        )
        .unwrap();

        let findings = detect(&event, &index);
        assert_eq!(findings.len(), 2);
    }

    #[test]
    fn test_flow_endpoint_match() {
        let index = index_with(IocType::Ip, "8.8.8.8", Some(Tlp::White));
        let event = crate::normalize(
            &json!({"sourceIp": "10.0.0.5", "destinationIp": "8.8.8.8"}),
            EventKind::Flow,
        )
        .unwrap();

        let findings = detect(&event, &index);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Low);
    }

    #[test]
    fn test_no_match() {
        let index = index_with(IocType::Ip, "9.9.9.9", None);
        let event = crate::normalize(
            &json!({"sourceIp": "10.0.0.5", "destinationIp": "8.8.8.8"}),
            EventKind::Flow,
        )
        .unwrap();
        assert!(detect(&event, &index).is_empty());
    }

    #[test]
    fn test_tlp_severity_mapping() {
        assert_eq!(severity_for_tlp(Some(Tlp::Red)), Severity::Critical);
        assert_eq!(severity_for_tlp(Some(Tlp::Amber)), Severity::High);
        assert_eq!(severity_for_tlp(Some(Tlp::Green)), Severity::Medium);
        assert_eq!(severity_for_tlp(Some(Tlp::White)), Severity::Low);
        assert_eq!(severity_for_tlp(None), Severity::Medium);
    }
}
