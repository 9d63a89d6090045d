//! Data loading module - replays recorded flow snapshots from a JSON file.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{info, trace};

use crate::accounting::MemoryAccounting;
use crate::error::FlowVizError;
use crate::models::{Flow, FlowCollection};

/// Flows one interface saw during one recorded window.
#[derive(Debug, Deserialize)]
pub struct InterfaceSnapshot {
    pub interface: String,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// Loads recorded snapshots from `path`.
///
/// # Errors
///
/// Returns `FlowVizError::Io` if the file cannot be read.
/// Returns `FlowVizError::JsonParse` if the JSON is malformed.
pub fn load_flow_snapshots(path: &Path) -> Result<Vec<InterfaceSnapshot>, FlowVizError> {
    let content = fs::read_to_string(path)?;
    let snapshots: Vec<InterfaceSnapshot> = serde_json::from_str(&content)?;
    Ok(snapshots)
}

/// Recorded snapshots played back as if they were captured live.
///
/// Every tick records each interface's flows as a new accounting window, so
/// the replayed counters stand for the traffic of one tick. Reports over a
/// window of several ticks sum them.
#[derive(Debug, Clone)]
pub struct Replay {
    interfaces: Vec<(String, FlowCollection)>,
    flows: usize,
}

impl Replay {
    pub fn new(snapshots: Vec<InterfaceSnapshot>) -> Self {
        let mut flows = 0;
        let interfaces = snapshots
            .into_iter()
            .map(|snapshot| {
                flows += snapshot.flows.len();
                (snapshot.interface, FlowCollection::from_flows(snapshot.flows))
            })
            .collect();
        info!("loaded {} recorded flows for replay", flows);
        Self { interfaces, flows }
    }

    /// Number of raw flow records replayed per tick.
    pub fn flows(&self) -> usize {
        self.flows
    }

    /// Records one window per interface. Interfaces without flows are only
    /// registered.
    pub fn tick(&self, accounting: &MemoryAccounting) {
        self.tick_at(accounting, Instant::now());
    }

    fn tick_at(&self, accounting: &MemoryAccounting, now: Instant) {
        for (interface, collection) in &self.interfaces {
            if collection.is_empty() {
                accounting.register(interface);
            } else {
                accounting.record_at(interface, now, collection.clone());
            }
        }
        trace!("replayed {} flows", self.flows);
    }
}
