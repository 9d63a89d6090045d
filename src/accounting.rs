//! Per-interface flow accounting history.
//!
//! `FlowSnapshotSource` is the seam the aggregator reads through. Capture
//! engines push already-classified windows into `MemoryAccounting`, which
//! keeps a bounded history per interface and answers duration queries.

use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::FlowVizError;
use crate::models::FlowCollection;

/// Windows kept per interface regardless of age.
const MAX_WINDOWS_PER_INTERFACE: usize = 1024;

/// Source of time-windowed flow snapshots, one history per interface.
pub trait FlowSnapshotSource: Send + Sync {
    /// Interfaces currently registered, in a stable order.
    fn interfaces(&self) -> Vec<String>;

    /// Merged snapshot of everything `interface` saw during the last `duration`.
    fn aggregation_by_duration(
        &self,
        interface: &str,
        duration: Duration,
    ) -> Result<FlowCollection, FlowVizError>;
}

#[derive(Debug)]
struct Window {
    recorded_at: Instant,
    flows: FlowCollection,
}

/// In-process accounting store fed by a capture engine or a recorded replay.
#[derive(Debug, Default)]
pub struct MemoryAccounting {
    histories: RwLock<HashMap<String, VecDeque<Window>>>,
}

impl MemoryAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `interface` visible to the aggregator even before it records traffic.
    pub fn register(&self, interface: &str) {
        self.histories
            .write()
            .entry(interface.to_string())
            .or_default();
    }

    pub fn record(&self, interface: &str, flows: FlowCollection) {
        self.record_at(interface, Instant::now(), flows);
    }

    pub fn record_at(&self, interface: &str, recorded_at: Instant, flows: FlowCollection) {
        let mut histories = self.histories.write();
        let history = histories.entry(interface.to_string()).or_default();
        if history.len() == MAX_WINDOWS_PER_INTERFACE {
            history.pop_front();
        }
        history.push_back(Window { recorded_at, flows });
    }

    /// Drops windows older than `retention`. Returns how many were removed.
    pub fn prune(&self, retention: Duration) -> usize {
        self.prune_at(Instant::now(), retention)
    }

    fn prune_at(&self, now: Instant, retention: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(retention) else {
            return 0;
        };

        let mut removed = 0;
        let mut histories = self.histories.write();
        for (interface, history) in histories.iter_mut() {
            let before = history.len();
            history.retain(|w| w.recorded_at >= cutoff);
            let pruned = before - history.len();
            if pruned > 0 {
                debug!("pruned {} windows from {}", pruned, interface);
            }
            removed += pruned;
        }
        removed
    }

    pub(crate) fn snapshot_at(
        &self,
        interface: &str,
        now: Instant,
        duration: Duration,
    ) -> Result<FlowCollection, FlowVizError> {
        let histories = self.histories.read();
        let history = histories
            .get(interface)
            .ok_or_else(|| FlowVizError::SnapshotUnavailable {
                interface: interface.to_string(),
                reason: "interface not registered".into(),
            })?;

        let cutoff = now.checked_sub(duration);
        let mut snapshot = FlowCollection::default();
        for window in history
            .iter()
            .filter(|w| cutoff.is_none_or(|c| w.recorded_at >= c))
        {
            snapshot.merge(&window.flows);
        }
        Ok(snapshot)
    }
}

impl FlowSnapshotSource for MemoryAccounting {
    fn interfaces(&self) -> Vec<String> {
        self.histories.read().keys().cloned().sorted().collect()
    }

    fn aggregation_by_duration(
        &self,
        interface: &str,
        duration: Duration,
    ) -> Result<FlowCollection, FlowVizError> {
        self.snapshot_at(interface, Instant::now(), duration)
    }
}
