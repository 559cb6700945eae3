//! Event Ingress Normalization
//!
//! Convert heterogeneous raw events (DNS query, HTTP request, network flow)
//! into the canonical [`NormalizedEvent`] record. Pure, no I/O.

use crate::{EventKind, NormalizedEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RawEventError {
    #[error("missing required field `{field}` for {kind:?} event")]
    MissingField { kind: EventKind, field: &'static str },
    #[error("raw event must be a JSON object")]
    NotAnObject,
}

/// Normalize a raw event of the given kind.
///
/// Required fields per kind: flow needs `sourceIp` + `destinationIp`, DNS
/// needs the queried domain, HTTP needs the URL. Anything else is optional.
pub fn normalize(raw: &Value, kind: EventKind) -> Result<NormalizedEvent, RawEventError> {
    if !raw.is_object() {
        return Err(RawEventError::NotAnObject);
    }

    let source_ip = get_str(raw, &["sourceIp", "source_ip", "srcIp"]);
    let destination_ip = get_str(raw, &["destinationIp", "destination_ip", "dstIp"]);

    match kind {
        EventKind::Flow => {
            if source_ip.is_none() {
                return Err(RawEventError::MissingField { kind, field: "sourceIp" });
            }
            if destination_ip.is_none() {
                return Err(RawEventError::MissingField { kind, field: "destinationIp" });
            }
        }
        EventKind::Dns => {
            if get_str(raw, &["query", "domain", "queryName"]).is_none() {
                return Err(RawEventError::MissingField { kind, field: "query" });
            }
        }
        EventKind::Http => {
            if get_str(raw, &["url", "uri"]).is_none() {
                return Err(RawEventError::MissingField { kind, field: "url" });
            }
        }
    }

    let url = match kind {
        EventKind::Http => get_str(raw, &["url", "uri"]).map(|u| u.trim().to_string()),
        _ => None,
    };

    // Domain comes from the DNS query directly, or is parsed out of the URL
    // for HTTP. Lowercased and trimmed so IOC lookups match insert-time
    // normalization.
    let domain = match kind {
        EventKind::Dns => get_str(raw, &["query", "domain", "queryName"])
            .map(|d| d.trim().to_lowercase()),
        EventKind::Http => url.as_deref().and_then(hostname_of),
        EventKind::Flow => None,
    };

    Ok(NormalizedEvent {
        id: get_str(raw, &["id", "eventId"]).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        kind,
        timestamp: get_timestamp(raw).unwrap_or_else(Utc::now),
        source_ip: source_ip.unwrap_or_default(),
        destination_ip,
        source_port: get_u64(raw, &["sourcePort", "source_port"]).and_then(|p| u16::try_from(p).ok()),
        destination_port: get_u64(raw, &["destinationPort", "destination_port", "dstPort"])
            .and_then(|p| u16::try_from(p).ok()),
        protocol: get_str(raw, &["protocol", "proto"]).map(|p| p.to_lowercase()),
        bytes: get_u64(raw, &["bytes", "totalBytes"]),
        packets: get_u64(raw, &["packets", "totalPackets"]),
        domain,
        url,
        raw: raw.clone(),
    })
}

/// Extract the lowercased hostname from a URL, tolerating missing schemes
/// and embedded ports.
pub fn hostname_of(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let after_scheme = trimmed.find("://").map(|i| &trimmed[i + 3..]).unwrap_or(trimmed);
    let host_part = after_scheme.split(['/', '?', '#']).next()?;
    let host_part = host_part.rsplit('@').next()?;
    let host = if host_part.starts_with('[') {
        // Bracketed IPv6 literal
        host_part.split(']').next().map(|h| h.trim_start_matches('['))?
    } else {
        host_part.split(':').next()?
    };
    if host.is_empty() {
        return None;
    }
    Some(host.trim().to_lowercase())
}

fn get_str(raw: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(s) = raw.get(name).and_then(|v| v.as_str()) {
            if !s.trim().is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

// Numeric fields arrive as JSON numbers or numeric strings depending on the
// sensor; accept both.
fn get_u64(raw: &Value, names: &[&str]) -> Option<u64> {
    for name in names {
        match raw.get(name) {
            Some(Value::Number(n)) => {
                if let Some(u) = n.as_u64() {
                    return Some(u);
                }
                if let Some(f) = n.as_f64() {
                    if f >= 0.0 {
                        return Some(f as u64);
                    }
                }
            }
            Some(Value::String(s)) => {
                if let Ok(u) = s.trim().parse::<u64>() {
                    return Some(u);
                }
            }
            _ => {}
        }
    }
    None
}

fn get_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    let v = raw.get("timestamp").or_else(|| raw.get("time"))?;
    match v {
        Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
        Value::Number(n) => {
            let millis = n.as_i64()?;
            DateTime::<Utc>::from_timestamp_millis(millis)
        }
        _ => None,
    }
}
