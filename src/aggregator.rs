//! Merges per-interface flow snapshots into one fingerprint-keyed report.

use itertools::Itertools;
use serde::{Serialize, Serializer};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::accounting::FlowSnapshotSource;
use crate::models::{Flow, FlowFingerprint, Granularity};
use crate::pool::FlowPool;

/// Window used when the configured interval is zero or negative.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(2);

/// Turns a configured interval in seconds into an aggregation window.
pub fn resolve_window(secs: i64) -> Duration {
    match u64::try_from(secs) {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => DEFAULT_WINDOW,
    }
}

pub struct FlowAggregator {
    source: Arc<dyn FlowSnapshotSource>,
    pool: Arc<FlowPool>,
}

impl FlowAggregator {
    pub fn new(source: Arc<dyn FlowSnapshotSource>, pool: Arc<FlowPool>) -> Self {
        Self { source, pool }
    }

    /// Sums every interface's flows over `duration` at `granularity`.
    ///
    /// An interface whose snapshot fails is logged and skipped, so the report
    /// holds whatever the remaining interfaces produced. The merge runs on the
    /// calling thread only; concurrent calls each build their own map and
    /// share nothing but the pool.
    pub fn aggregate(&self, duration: Duration, granularity: Granularity) -> AggregatedReport {
        let duration = if duration.is_zero() {
            DEFAULT_WINDOW
        } else {
            duration
        };

        let mut merged: HashMap<FlowFingerprint, Flow> = HashMap::new();
        for interface in self.source.interfaces() {
            let snapshot = match self.source.aggregation_by_duration(&interface, duration) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("skipping interface {} in flow report: {}", interface, e);
                    continue;
                }
            };

            for (fp, flow) in snapshot.flow_map(granularity) {
                match merged.entry(fp.clone()) {
                    Entry::Occupied(mut existing) => existing.get_mut().add_counters(flow),
                    Entry::Vacant(slot) => {
                        slot.insert(self.pool.acquire_copy(flow));
                    }
                }
            }
        }

        debug!(
            "aggregated {} flows over {:?} at {:?}, {} pooled flows idle",
            merged.len(),
            duration,
            granularity,
            self.pool.idle()
        );

        AggregatedReport {
            flows: merged.into_values().collect(),
            pool: Arc::clone(&self.pool),
        }
    }
}

/// Result of one aggregation pass.
///
/// Owns pooled `Flow` values and hands them back to the pool when dropped,
/// which for the HTTP path is right after the body has been serialized.
pub struct AggregatedReport {
    flows: Vec<Flow>,
    pool: Arc<FlowPool>,
}

impl AggregatedReport {
    #[cfg(test)]
    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// The `n` heaviest flows by total bytes, heaviest first.
    pub fn top_by_bytes(&self, n: usize) -> Vec<&Flow> {
        self.flows
            .iter()
            .sorted_by(|a, b| b.total_bytes().cmp(&a.total_bytes()))
            .take(n)
            .collect()
    }
}

impl Serialize for AggregatedReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.flows.serialize(serializer)
    }
}

impl Drop for AggregatedReport {
    fn drop(&mut self) {
        self.pool.release_all(std::mem::take(&mut self.flows));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::MemoryAccounting;
    use crate::error::FlowVizError;
    use crate::models::fixtures::tcp_flow;
    use crate::models::FlowCollection;

    /// Source with one interface that always fails.
    struct PartlyBroken {
        healthy: MemoryAccounting,
    }

    impl FlowSnapshotSource for PartlyBroken {
        fn interfaces(&self) -> Vec<String> {
            let mut names = self.healthy.interfaces();
            names.push("wlan0".into());
            names
        }

        fn aggregation_by_duration(
            &self,
            interface: &str,
            duration: Duration,
        ) -> Result<FlowCollection, FlowVizError> {
            if interface == "wlan0" {
                return Err(FlowVizError::SnapshotUnavailable {
                    interface: interface.into(),
                    reason: "capture stopped".into(),
                });
            }
            self.healthy.aggregation_by_duration(interface, duration)
        }
    }

    fn setup() -> (Arc<MemoryAccounting>, Arc<FlowPool>, FlowAggregator) {
        let acct = Arc::new(MemoryAccounting::new());
        let pool = Arc::new(FlowPool::default());
        let aggregator = FlowAggregator::new(acct.clone(), pool.clone());
        (acct, pool, aggregator)
    }

    fn find<'a>(report: &'a AggregatedReport, src_port: Option<u16>) -> &'a Flow {
        report
            .flows()
            .iter()
            .find(|f| f.src_port == src_port)
            .unwrap()
    }

    #[test]
    fn test_counters_sum_across_interfaces() {
        let (acct, _pool, aggregator) = setup();
        acct.record(
            "eth0",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (100, 4, 50, 3))]),
        );
        acct.record(
            "eth1",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (20, 1, 5, 2))]),
        );

        let report = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);

        assert_eq!(report.len(), 1);
        let flow = &report.flows()[0];
        assert_eq!(flow.inbound_bytes, 120);
        assert_eq!(flow.inbound_packets, 5);
        assert_eq!(flow.outbound_bytes, 55);
        assert_eq!(flow.outbound_packets, 5);
        assert_eq!(flow.src_port, Some(5000));
    }

    #[test]
    fn test_flow_on_single_interface_is_unchanged() {
        let (acct, _pool, aggregator) = setup();
        let only_eth1 = tcp_flow("10.0.0.3", "1.1.1.1", (6000, 53), (7, 1, 9, 1));
        acct.record(
            "eth0",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (1, 1, 1, 1))]),
        );
        acct.record("eth1", FlowCollection::from_flows([only_eth1.clone()]));

        let report = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);

        assert_eq!(report.len(), 2);
        assert_eq!(find(&report, Some(6000)), &only_eth1);
    }

    #[test]
    fn test_granularity_selects_map() {
        let (acct, _pool, aggregator) = setup();
        acct.record(
            "eth0",
            FlowCollection::from_flows([
                tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (10, 1, 10, 1)),
                tcp_flow("10.0.0.2", "8.8.8.8", (5001, 443), (10, 1, 10, 1)),
            ]),
        );

        let l4 = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);
        assert_eq!(l4.len(), 2);
        drop(l4);

        let l3 = aggregator.aggregate(Duration::from_secs(10), Granularity::L3);
        assert_eq!(l3.len(), 1);
        let flow = find(&l3, None);
        assert_eq!(flow.inbound_bytes, 20);
        assert_eq!(flow.dst_port, None);
    }

    #[test]
    fn test_repeated_passes_do_not_leak_state() {
        let (acct, pool, aggregator) = setup();
        acct.record(
            "eth0",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (100, 1, 50, 1))]),
        );
        acct.record(
            "eth1",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (20, 1, 5, 1))]),
        );

        let first = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);
        assert_eq!(first.flows()[0].inbound_bytes, 120);
        drop(first);
        assert_eq!(pool.idle(), 1);

        let second = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);
        assert_eq!(second.flows()[0].inbound_bytes, 120);
        assert_eq!(second.flows()[0].outbound_bytes, 55);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_failing_interface_is_skipped() {
        let healthy = MemoryAccounting::new();
        healthy.record(
            "eth0",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (100, 1, 50, 1))]),
        );
        let aggregator = FlowAggregator::new(
            Arc::new(PartlyBroken { healthy }),
            Arc::new(FlowPool::default()),
        );

        let report = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);
        assert_eq!(report.len(), 1);
        assert_eq!(report.flows()[0].inbound_bytes, 100);
    }

    #[test]
    fn test_no_interfaces_serializes_empty_array() {
        let (_acct, _pool, aggregator) = setup();
        let report = aggregator.aggregate(Duration::ZERO, Granularity::L3);
        assert!(report.is_empty());
        assert_eq!(serde_json::to_string(&report).unwrap(), "[]");
    }

    #[test]
    fn test_report_serializes_as_array_and_releases() {
        let (acct, pool, aggregator) = setup();
        acct.record(
            "eth0",
            FlowCollection::from_flows([
                tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (100, 1, 50, 1)),
                tcp_flow("10.0.0.2", "9.9.9.9", (5001, 443), (1, 1, 1, 1)),
            ]),
        );

        let report = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);
        let json = serde_json::to_value(&report).unwrap();
        drop(report);

        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_top_by_bytes_orders_heaviest_first() {
        let (acct, _pool, aggregator) = setup();
        acct.record(
            "eth0",
            FlowCollection::from_flows([
                tcp_flow("10.0.0.2", "8.8.8.8", (1, 443), (10, 1, 0, 0)),
                tcp_flow("10.0.0.2", "8.8.8.8", (2, 443), (300, 1, 0, 0)),
                tcp_flow("10.0.0.2", "8.8.8.8", (3, 443), (20, 1, 0, 0)),
            ]),
        );

        let report = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);
        let top: Vec<_> = report.top_by_bytes(2).iter().map(|f| f.src_port).collect();
        assert_eq!(top, vec![Some(2), Some(3)]);
    }

    #[test]
    fn test_counters_saturate_instead_of_overflowing() {
        let (acct, _pool, aggregator) = setup();
        acct.record(
            "eth0",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (u64::MAX, 1, 0, 0))]),
        );
        acct.record(
            "eth1",
            FlowCollection::from_flows([tcp_flow("10.0.0.2", "8.8.8.8", (5000, 443), (1, 1, 0, 0))]),
        );

        let report = aggregator.aggregate(Duration::from_secs(10), Granularity::L4);

        assert_eq!(report.len(), 1);
        let flow = &report.flows()[0];
        assert_eq!(flow.inbound_bytes, u64::MAX);
        assert_eq!(flow.inbound_packets, 2);
        assert_eq!(flow.total_bytes(), u64::MAX);
        assert_eq!(report.top_by_bytes(1).len(), 1);
    }

    #[test]
    fn test_resolve_window() {
        assert_eq!(resolve_window(0), DEFAULT_WINDOW);
        assert_eq!(resolve_window(-5), DEFAULT_WINDOW);
        assert_eq!(resolve_window(10), Duration::from_secs(10));
    }
}
