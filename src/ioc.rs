//! IOC Index
//!
//! In-memory indicator-of-compromise index with exact-match lookup keyed by
//! (type, normalized value). Refresh swaps the whole map atomically so
//! readers never observe a partially merged feed.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Canonical indicator types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IocType {
    Ip,
    Domain,
    Url,
    Hash,
    Email,
}

/// Traffic Light Protocol marking
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tlp {
    Red,
    Amber,
    Green,
    White,
}

/// Parse a feed TLP marking; `TLP:RED` style prefixes are accepted.
pub fn parse_tlp(raw: &str) -> Option<Tlp> {
    let marking = raw.trim().to_lowercase();
    let marking = marking.strip_prefix("tlp:").unwrap_or(&marking);
    match marking.trim() {
        "red" => Some(Tlp::Red),
        "amber" => Some(Tlp::Amber),
        "green" => Some(Tlp::Green),
        "white" | "clear" => Some(Tlp::White),
        _ => None,
    }
}

/// Indicator of compromise with feed provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocEntry {
    pub id: String,
    pub ioc_type: IocType,
    /// Normalized: lowercased, trimmed
    pub value: String,
    pub feed_id: String,
    /// 0-100
    pub confidence: u8,
    pub tlp: Option<Tlp>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Result of a per-feed refresh merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

/// What happens to entries that vanish from a refreshed feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedDropPolicy {
    /// Keep the row, flip `active` off
    #[default]
    Deactivate,
    /// Remove the row entirely
    HardDelete,
}

/// Map an input indicator-type string to a canonical [`IocType`].
///
/// Unrecognized types are the caller's signal to skip the entry.
pub fn normalize_ioc_type(raw: &str) -> Option<IocType> {
    match raw.trim().to_lowercase().as_str() {
        "ip" | "ipv4" | "ipv6" | "ip-src" | "ip-dst" | "ip_address" | "ipaddress" => Some(IocType::Ip),
        "domain" | "hostname" | "domain-name" | "fqdn" => Some(IocType::Domain),
        "url" | "uri" => Some(IocType::Url),
        "hash" | "md5" | "sha1" | "sha256" | "file-hash" | "filehash" => Some(IocType::Hash),
        "email" | "email-src" | "email-dst" | "email_address" => Some(IocType::Email),
        _ => None,
    }
}

/// Normalize an indicator value the same way at insert and lookup time.
pub fn normalize_value(value: &str) -> String {
    value.trim().to_lowercase()
}

struct IndexStats {
    lookups_total: AtomicU64,
    lookups_hits: AtomicU64,
    refreshes_total: AtomicU64,
    entries_skipped: AtomicU64,
}

/// Read-mostly IOC index.
///
/// Lookups read an atomically swapped snapshot; `refresh` builds the
/// replacement map off to the side under a single-writer lock and swaps it
/// in, so concurrent lookups never block on a feed merge.
pub struct IocIndex {
    entries: ArcSwap<HashMap<String, IocEntry>>,
    drop_policy: FeedDropPolicy,
    refresh_lock: parking_lot::Mutex<()>,
    stats: IndexStats,
}

impl IocIndex {
    pub fn new(drop_policy: FeedDropPolicy) -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            drop_policy,
            refresh_lock: parking_lot::Mutex::new(()),
            stats: IndexStats {
                lookups_total: AtomicU64::new(0),
                lookups_hits: AtomicU64::new(0),
                refreshes_total: AtomicU64::new(0),
                entries_skipped: AtomicU64::new(0),
            },
        }
    }

    fn key(ioc_type: IocType, normalized_value: &str) -> String {
        let type_tag = match ioc_type {
            IocType::Ip => "ip",
            IocType::Domain => "domain",
            IocType::Url => "url",
            IocType::Hash => "hash",
            IocType::Email => "email",
        };
        format!("{}:{}", type_tag, normalized_value)
    }

    /// Exact-match lookup. Only active entries hit.
    pub fn lookup(&self, ioc_type: IocType, value: &str) -> Option<IocEntry> {
        self.stats.lookups_total.fetch_add(1, Ordering::Relaxed);

        let normalized = normalize_value(value);
        let snapshot = self.entries.load();
        let entry = snapshot.get(&Self::key(ioc_type, &normalized))?;
        if !entry.active {
            return None;
        }
        self.stats.lookups_hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.clone())
    }

    /// Replace all active entries for `feed_id` with `incoming`.
    ///
    /// Entries present in both the old and new sets are updated in place
    /// preserving `first_seen` (and count as `updated`, also on a no-op
    /// re-refresh); entries only in the new set are added; entries only in
    /// the old set are deactivated or hard-deleted per the drop policy and
    /// count as `removed` only on the active→gone transition.
    pub fn refresh(&self, feed_id: &str, incoming: Vec<IocEntry>) -> RefreshOutcome {
        let _guard = self.refresh_lock.lock();
        self.stats.refreshes_total.fetch_add(1, Ordering::Relaxed);

        let mut next: HashMap<String, IocEntry> = self.entries.load().as_ref().clone();
        let mut outcome = RefreshOutcome::default();
        let now = Utc::now();

        let mut seen_keys: HashSet<String> = HashSet::with_capacity(incoming.len());
        for mut entry in incoming {
            entry.value = normalize_value(&entry.value);
            entry.feed_id = feed_id.to_string();
            let key = Self::key(entry.ioc_type, &entry.value);
            // Duplicate (type, value) within one merge: last write wins,
            // counted once.
            let first_time = seen_keys.insert(key.clone());

            match next.get_mut(&key) {
                Some(existing) => {
                    entry.first_seen = existing.first_seen;
                    entry.id = existing.id.clone();
                    entry.active = true;
                    entry.last_seen = now;
                    *existing = entry;
                    if first_time {
                        outcome.updated += 1;
                    }
                }
                None => {
                    entry.active = true;
                    entry.first_seen = now;
                    entry.last_seen = now;
                    next.insert(key, entry);
                    if first_time {
                        outcome.added += 1;
                    }
                }
            }
        }

        // Entries this feed previously carried but no longer does.
        let stale: Vec<String> = next
            .iter()
            .filter(|(key, e)| e.feed_id == feed_id && e.active && !seen_keys.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            match self.drop_policy {
                FeedDropPolicy::Deactivate => {
                    if let Some(e) = next.get_mut(&key) {
                        e.active = false;
                    }
                }
                FeedDropPolicy::HardDelete => {
                    next.remove(&key);
                }
            }
            outcome.removed += 1;
        }

        self.entries.store(Arc::new(next));
        outcome
    }

    /// Build entries from raw (type string, value) tuples, skipping
    /// unrecognized types with a warning.
    pub fn entries_from_raw(&self, feed_id: &str, raw: Vec<RawIndicator>) -> Vec<IocEntry> {
        let now = Utc::now();
        raw.into_iter()
            .filter_map(|r| {
                let Some(ioc_type) = normalize_ioc_type(&r.indicator_type) else {
                    self.stats.entries_skipped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        feed_id,
                        indicator_type = %r.indicator_type,
                        value = %r.value,
                        "skipping indicator with unrecognized type"
                    );
                    return None;
                };
                Some(IocEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    ioc_type,
                    value: normalize_value(&r.value),
                    feed_id: feed_id.to_string(),
                    confidence: r.confidence.min(100),
                    tlp: r.tlp,
                    description: r.description,
                    tags: r.tags,
                    active: true,
                    first_seen: r.first_seen.unwrap_or(now),
                    last_seen: r.last_seen.unwrap_or(now),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.entries.load().values().filter(|e| e.active).count()
    }

    /// Active entry counts broken down by indicator type.
    pub fn counts_by_type(&self) -> HashMap<IocType, u64> {
        let snapshot = self.entries.load();
        let mut counts = HashMap::new();
        for entry in snapshot.values().filter(|e| e.active) {
            *counts.entry(entry.ioc_type).or_insert(0) += 1;
        }
        counts
    }

    pub fn stats(&self) -> IocIndexStats {
        IocIndexStats {
            entries_total: self.len() as u64,
            entries_active: self.active_len() as u64,
            lookups_total: self.stats.lookups_total.load(Ordering::Relaxed),
            lookups_hits: self.stats.lookups_hits.load(Ordering::Relaxed),
            refreshes_total: self.stats.refreshes_total.load(Ordering::Relaxed),
            entries_skipped: self.stats.entries_skipped.load(Ordering::Relaxed),
        }
    }
}

impl Default for IocIndex {
    fn default() -> Self {
        Self::new(FeedDropPolicy::Deactivate)
    }
}

/// Indicator as it comes off a parsed feed, before type normalization.
#[derive(Debug, Clone)]
pub struct RawIndicator {
    pub indicator_type: String,
    pub value: String,
    pub confidence: u8,
    pub tlp: Option<Tlp>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IocIndexStats {
    pub entries_total: u64,
    pub entries_active: u64,
    pub lookups_total: u64,
    pub lookups_hits: u64,
    pub refreshes_total: u64,
    pub entries_skipped: u64,
}
