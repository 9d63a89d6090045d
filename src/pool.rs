//! Free-list of reusable `Flow` values for the aggregation hot path.
//!
//! The reporting endpoint is polled frequently, and each pass would otherwise
//! allocate one `Flow` (and its protocol string) per distinct fingerprint.
//! Ownership moves out on `acquire_copy` and back on `release_all`, so two
//! holders can never see the same instance.

use parking_lot::Mutex;
use tracing::trace;

use crate::models::Flow;

/// Idle values kept around when no limit is given.
pub const DEFAULT_MAX_IDLE: usize = 4096;

#[derive(Debug)]
pub struct FlowPool {
    free: Mutex<Vec<Flow>>,
    max_idle: usize,
}

impl Default for FlowPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl FlowPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Takes a value from the pool and overwrites every field with `source`.
    pub fn acquire_copy(&self, source: &Flow) -> Flow {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(mut flow) => {
                flow.clone_from(source);
                flow
            }
            None => source.clone(),
        }
    }

    /// Hands values back. Those that do not fit under `max_idle` are dropped.
    pub fn release_all<I>(&self, flows: I)
    where
        I: IntoIterator<Item = Flow>,
    {
        let mut free = self.free.lock();
        let mut dropped = 0usize;
        for flow in flows {
            if free.len() < self.max_idle {
                free.push(flow);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            trace!("flow pool full, dropped {} released flows", dropped);
        }
    }

    /// Number of values waiting to be reused.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}
