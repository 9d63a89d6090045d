//! Data models for flow accounting and geolocation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Which identity a flow is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// Network layer: protocol and addresses, no ports.
    L3,
    /// Transport layer: protocol, addresses and ports.
    L4,
}

impl Granularity {
    pub fn from_decode_l4(decode_l4: bool) -> Self {
        if decode_l4 {
            Granularity::L4
        } else {
            Granularity::L3
        }
    }
}

/// Identity of a flow at a given granularity. Only ever used as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowFingerprint {
    pub protocol: String,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl FlowFingerprint {
    /// Derives the fingerprint of `flow`. L3 drops the ports.
    pub fn of(flow: &Flow, granularity: Granularity) -> Self {
        let (src_port, dst_port) = match granularity {
            Granularity::L3 => (None, None),
            Granularity::L4 => (flow.src_port, flow.dst_port),
        };
        Self {
            protocol: flow.protocol.clone(),
            src_addr: flow.src_addr,
            dst_addr: flow.dst_addr,
            src_port,
            dst_port,
        }
    }
}

/// Traffic accumulated for one flow over a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub protocol: String,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(default)]
    pub inbound_bytes: u64,
    #[serde(default)]
    pub inbound_packets: u64,
    #[serde(default)]
    pub outbound_bytes: u64,
    #[serde(default)]
    pub outbound_packets: u64,
}

impl Flow {
    /// Adds the four traffic counters of `other`. Identity fields are untouched.
    /// Counters saturate at `u64::MAX`.
    pub fn add_counters(&mut self, other: &Flow) {
        self.inbound_bytes = self.inbound_bytes.saturating_add(other.inbound_bytes);
        self.inbound_packets = self.inbound_packets.saturating_add(other.inbound_packets);
        self.outbound_bytes = self.outbound_bytes.saturating_add(other.outbound_bytes);
        self.outbound_packets = self.outbound_packets.saturating_add(other.outbound_packets);
    }

    pub fn total_bytes(&self) -> u64 {
        self.inbound_bytes.saturating_add(self.outbound_bytes)
    }

    /// Same flow reduced to L3 identity.
    fn without_ports(&self) -> Flow {
        Flow {
            src_port: None,
            dst_port: None,
            ..self.clone()
        }
    }
}

/// A point-in-time snapshot of one interface, at both granularities.
#[derive(Debug, Clone, Default)]
pub struct FlowCollection {
    pub l3: HashMap<FlowFingerprint, Flow>,
    pub l4: HashMap<FlowFingerprint, Flow>,
}

impl FlowCollection {
    pub fn flow_map(&self, granularity: Granularity) -> &HashMap<FlowFingerprint, Flow> {
        match granularity {
            Granularity::L3 => &self.l3,
            Granularity::L4 => &self.l4,
        }
    }

    /// Builds both maps from raw per-flow records, merging records that share
    /// a fingerprint.
    pub fn from_flows<I>(flows: I) -> Self
    where
        I: IntoIterator<Item = Flow>,
    {
        let mut collection = FlowCollection::default();
        for flow in flows {
            collection.insert(flow);
        }
        collection
    }

    /// Records `flow` in both maps.
    pub fn insert(&mut self, flow: Flow) {
        let l3_key = FlowFingerprint::of(&flow, Granularity::L3);
        match self.l3.get_mut(&l3_key) {
            Some(existing) => existing.add_counters(&flow),
            None => {
                self.l3.insert(l3_key, flow.without_ports());
            }
        }

        let l4_key = FlowFingerprint::of(&flow, Granularity::L4);
        match self.l4.get_mut(&l4_key) {
            Some(existing) => existing.add_counters(&flow),
            None => {
                self.l4.insert(l4_key, flow);
            }
        }
    }

    /// Folds every flow of `other` into this collection, both granularities.
    pub fn merge(&mut self, other: &FlowCollection) {
        for (fp, flow) in &other.l3 {
            match self.l3.get_mut(fp) {
                Some(existing) => existing.add_counters(flow),
                None => {
                    self.l3.insert(fp.clone(), flow.clone());
                }
            }
        }
        for (fp, flow) in &other.l4 {
            match self.l4.get_mut(fp) {
                Some(existing) => existing.add_counters(flow),
                None => {
                    self.l4.insert(fp.clone(), flow.clone());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.l3.is_empty() && self.l4.is_empty()
    }
}

/// Approximate location of a public address.
///
/// Either field may be empty when the provider omits it; that is still a
/// successful lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
}
