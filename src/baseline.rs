//! Baseline Statistics Store
//!
//! Per-host rolling traffic profiles (common ports/protocols/destinations,
//! average bytes/packets per flow) used as the anomaly reference. Rebuilt
//! wholesale each refresh cycle; reads always see a complete snapshot.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Which side of the flow a profile describes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Source,
    Destination,
}

const MAX_COMMON_PORTS: usize = 20;
const MAX_COMMON_PROTOCOLS: usize = 10;
const MAX_COMMON_DESTINATIONS: usize = 50;

/// Rolling traffic profile for one host and direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineProfile {
    pub ip_address: String,
    pub direction: Direction,
    pub total_flows: u64,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub avg_bytes_per_flow: f64,
    pub avg_packets_per_flow: f64,
    /// Destination ports by descending frequency, capped at 20
    pub common_ports: Vec<u16>,
    /// Protocols by descending frequency, capped at 10
    pub common_protocols: Vec<String>,
    /// Peer IPs by descending frequency, capped at 50
    pub common_destinations: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Historical flow record used to rebuild baselines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub source_ip: String,
    pub destination_ip: String,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub bytes: u64,
    pub packets: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("flow history query failed: {0}")]
    Query(String),
}

/// External collaborator owning historical flow storage.
#[async_trait]
pub trait FlowHistory: Send + Sync {
    async fn query_flows(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<FlowRecord>, BaselineError>;
}

/// In-memory flow history, used by tests and as a default collaborator.
#[derive(Default)]
pub struct InMemoryFlowHistory {
    flows: parking_lot::RwLock<Vec<FlowRecord>>,
}

impl InMemoryFlowHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, flow: FlowRecord) {
        self.flows.write().push(flow);
    }
}

#[async_trait]
impl FlowHistory for InMemoryFlowHistory {
    async fn query_flows(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<FlowRecord>, BaselineError> {
        Ok(self
            .flows
            .read()
            .iter()
            .filter(|f| f.timestamp >= window_start && f.timestamp <= window_end)
            .cloned()
            .collect())
    }
}

/// Double-buffered baseline store.
///
/// Detection reads the current snapshot lock-free; `rebuild` assembles the
/// replacement map for one direction off to the side and swaps it in, so the
/// read path never sees a partially rebuilt baseline.
pub struct BaselineStore {
    profiles: ArcSwap<HashMap<(String, Direction), BaselineProfile>>,
    rebuild_lock: parking_lot::Mutex<()>,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self {
            profiles: ArcSwap::from_pointee(HashMap::new()),
            rebuild_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn get(&self, ip_address: &str, direction: Direction) -> Option<BaselineProfile> {
        self.profiles
            .load()
            .get(&(ip_address.to_string(), direction))
            .cloned()
    }

    /// Upsert a single profile, copy-on-write. Used for warm-starting a
    /// store from persisted profiles.
    pub fn insert(&self, profile: BaselineProfile) {
        let _guard = self.rebuild_lock.lock();
        let mut next: HashMap<(String, Direction), BaselineProfile> =
            self.profiles.load().as_ref().clone();
        next.insert((profile.ip_address.clone(), profile.direction), profile);
        self.profiles.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.profiles.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.load().is_empty()
    }

    /// Full recompute of one direction from flow history.
    ///
    /// Profiles for the other direction carry over untouched. Hosts with
    /// zero flows in the window are skipped, never divided by.
    pub async fn rebuild(
        &self,
        direction: Direction,
        history: &dyn FlowHistory,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<usize, BaselineError> {
        let flows = history.query_flows(window_start, window_end).await?;
        let computed = compute_profiles(&flows, direction, window_start, window_end);
        let rebuilt = computed.len();

        let _guard = self.rebuild_lock.lock();
        let mut next: HashMap<(String, Direction), BaselineProfile> = self
            .profiles
            .load()
            .iter()
            .filter(|((_, dir), _)| *dir != direction)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for profile in computed {
            next.insert((profile.ip_address.clone(), direction), profile);
        }
        self.profiles.store(Arc::new(next));

        info!(?direction, hosts = rebuilt, "baseline rebuild complete");
        Ok(rebuilt)
    }
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new()
    }
}

struct HostAccumulator {
    total_flows: u64,
    total_bytes: u64,
    total_packets: u64,
    ports: FrequencyCounter<u16>,
    protocols: FrequencyCounter<String>,
    destinations: FrequencyCounter<String>,
}

impl HostAccumulator {
    fn new() -> Self {
        Self {
            total_flows: 0,
            total_bytes: 0,
            total_packets: 0,
            ports: FrequencyCounter::new(),
            protocols: FrequencyCounter::new(),
            destinations: FrequencyCounter::new(),
        }
    }
}

fn compute_profiles(
    flows: &[FlowRecord],
    direction: Direction,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<BaselineProfile> {
    // Grouping preserves first-encounter order so top-N tie-breaks are
    // reproducible across runs.
    let mut hosts: HashMap<String, HostAccumulator> = HashMap::new();
    let mut host_order: Vec<String> = Vec::new();

    for flow in flows {
        let (host, peer) = match direction {
            Direction::Source => (&flow.source_ip, &flow.destination_ip),
            Direction::Destination => (&flow.destination_ip, &flow.source_ip),
        };
        let acc = hosts.entry(host.clone()).or_insert_with(|| {
            host_order.push(host.clone());
            HostAccumulator::new()
        });
        acc.total_flows += 1;
        acc.total_bytes += flow.bytes;
        acc.total_packets += flow.packets;
        if let Some(port) = flow.destination_port {
            acc.ports.observe(port);
        }
        if let Some(protocol) = &flow.protocol {
            acc.protocols.observe(protocol.to_lowercase());
        }
        acc.destinations.observe(peer.clone());
    }

    host_order
        .into_iter()
        .filter_map(|host| {
            let acc = hosts.remove(&host)?;
            if acc.total_flows == 0 {
                return None;
            }
            Some(BaselineProfile {
                ip_address: host,
                direction,
                total_flows: acc.total_flows,
                total_bytes: acc.total_bytes,
                total_packets: acc.total_packets,
                avg_bytes_per_flow: acc.total_bytes as f64 / acc.total_flows as f64,
                avg_packets_per_flow: acc.total_packets as f64 / acc.total_flows as f64,
                common_ports: acc.ports.top_n(MAX_COMMON_PORTS),
                common_protocols: acc.protocols.top_n(MAX_COMMON_PROTOCOLS),
                common_destinations: acc.destinations.top_n(MAX_COMMON_DESTINATIONS),
                window_start,
                window_end,
            })
        })
        .collect()
}

/// Frequency counter with stable first-encountered tie-breaking.
struct FrequencyCounter<T> {
    counts: HashMap<T, (u64, usize)>,
    next_index: usize,
}

impl<T: Clone + Eq + std::hash::Hash> FrequencyCounter<T> {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
            next_index: 0,
        }
    }

    fn observe(&mut self, item: T) {
        if let Some(slot) = self.counts.get_mut(&item) {
            slot.0 += 1;
        } else {
            self.counts.insert(item, (1, self.next_index));
            self.next_index += 1;
        }
    }

    fn top_n(&self, n: usize) -> Vec<T> {
        let mut items: Vec<(&T, u64, usize)> = self
            .counts
            .iter()
            .map(|(item, (count, first))| (item, *count, *first))
            .collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        items.into_iter().take(n).map(|(item, _, _)| item.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn flow(src: &str, dst: &str, port: u16, proto: &str, bytes: u64) -> FlowRecord {
        FlowRecord {
            source_ip: src.to_string(),
            destination_ip: dst.to_string(),
            destination_port: Some(port),
            protocol: Some(proto.to_string()),
            bytes,
            packets: bytes / 100,
            timestamp: Utc::now(),
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (Utc::now() - Duration::hours(24), Utc::now() + Duration::minutes(1))
    }

    #[tokio::test]
    async fn test_rebuild_averages() {
        let history = InMemoryFlowHistory::new();
        history.record(flow("10.0.0.5", "1.1.1.1", 443, "tcp", 1000));
        history.record(flow("10.0.0.5", "1.1.1.2", 443, "tcp", 3000));

        let store = BaselineStore::new();
        let (start, end) = window();
        let rebuilt = store.rebuild(Direction::Source, &history, start, end).await.unwrap();
        assert_eq!(rebuilt, 1);

        let profile = store.get("10.0.0.5", Direction::Source).unwrap();
        assert_eq!(profile.total_flows, 2);
        assert_eq!(profile.total_bytes, 4000);
        assert!((profile.avg_bytes_per_flow - 2000.0).abs() < f64::EPSILON);
        assert!(profile.avg_bytes_per_flow.is_finite());
    }

    #[tokio::test]
    async fn test_rebuild_preserves_other_direction() {
        let history = InMemoryFlowHistory::new();
        history.record(flow("10.0.0.5", "1.1.1.1", 443, "tcp", 1000));

        let store = BaselineStore::new();
        let (start, end) = window();
        store.rebuild(Direction::Source, &history, start, end).await.unwrap();
        store.rebuild(Direction::Destination, &history, start, end).await.unwrap();

        assert!(store.get("10.0.0.5", Direction::Source).is_some());
        assert!(store.get("1.1.1.1", Direction::Destination).is_some());

        // Rebuilding one direction again must not drop the other.
        store.rebuild(Direction::Source, &history, start, end).await.unwrap();
        assert!(store.get("1.1.1.1", Direction::Destination).is_some());
    }

    #[tokio::test]
    async fn test_empty_window_produces_no_profiles() {
        let history = InMemoryFlowHistory::new();
        let store = BaselineStore::new();
        let (start, end) = window();
        let rebuilt = store.rebuild(Direction::Source, &history, start, end).await.unwrap();
        assert_eq!(rebuilt, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_top_n_ordering_and_ties() {
        let mut counter = FrequencyCounter::new();
        for port in [443u16, 80, 443, 22, 80, 443, 8080] {
            counter.observe(port);
        }
        // 443 x3, 80 x2, then 22 and 8080 tied at 1 in first-seen order.
        assert_eq!(counter.top_n(10), vec![443, 80, 22, 8080]);
        assert_eq!(counter.top_n(2), vec![443, 80]);
    }

    #[tokio::test]
    async fn test_common_ports_capped() {
        let history = InMemoryFlowHistory::new();
        for port in 1000..1030u16 {
            history.record(flow("10.0.0.5", "1.1.1.1", port, "tcp", 100));
        }
        let store = BaselineStore::new();
        let (start, end) = window();
        store.rebuild(Direction::Source, &history, start, end).await.unwrap();

        let profile = store.get("10.0.0.5", Direction::Source).unwrap();
        assert_eq!(profile.common_ports.len(), 20);
        // All counts tie at 1, so first-encountered ports win.
        assert_eq!(profile.common_ports[0], 1000);
    }
}
