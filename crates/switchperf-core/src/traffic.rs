//! Traffic generator seam.
//!
//! The runner only talks to a generator through [`TrafficDriver`]. A
//! driver keeps its own per-port snapshot history, keyed by a monotonic
//! millisecond timestamp, which the stat pipeline reduces to rates.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::config::FlowType;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("failed to reserve tester port {0}")]
    Reservation(String),
    #[error("tester port {0} is not reserved")]
    NotReserved(String),
    #[error("tester port {0} has no configured stream")]
    NotConfigured(String),
    #[error("traffic generator: {0}")]
    Backend(String),
}

// ── Streams ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficFlowType {
    L2Mac,
    L3Ipv4,
    L3Ipv4Subnet,
    L4Udp,
    VxlanL3Ipv4,
}

impl TrafficFlowType {
    pub fn for_flow_type(flow_type: FlowType, tunnel: bool) -> Self {
        if tunnel {
            return TrafficFlowType::VxlanL3Ipv4;
        }
        match flow_type {
            FlowType::L2 => TrafficFlowType::L2Mac,
            FlowType::L3 => TrafficFlowType::L3Ipv4,
            FlowType::L3Subnet => TrafficFlowType::L3Ipv4Subnet,
            FlowType::L4Udp => TrafficFlowType::L4Udp,
        }
    }
}

/// Stream a driver should generate on one port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSpec {
    pub flow_type: TrafficFlowType,
    pub flows: u32,
    pub packet_size: u32,
    /// Percent of line rate, `(0, 100]`.
    pub rate_percent: f64,
    pub src_mac: u64,
    pub dst_mac: u64,
    /// Outer destination MAC for encapsulated streams.
    pub tunnel_dst_mac: Option<u64>,
    pub random_payload: bool,
}

// ── Snapshots ───────────────────────────────────────────────────────

/// Cumulative packet count and instantaneous rate of one counter group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CounterGroup {
    pub packets: u64,
    pub pps: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GeneratorSnapshot {
    pub tx_total: Option<CounterGroup>,
    pub rx_total: Option<CounterGroup>,
}

/// Snapshot history of one port, keyed by timestamp in milliseconds.
pub type SnapshotSeries = BTreeMap<u64, GeneratorSnapshot>;

/// Cumulative transmit count of the latest snapshot that carries one.
pub fn last_tx_packets(series: &SnapshotSeries) -> Option<u64> {
    series.values().rev().find_map(|s| s.tx_total).map(|g| g.packets)
}

/// Cumulative receive count of the latest snapshot that carries one.
pub fn last_rx_packets(series: &SnapshotSeries) -> Option<u64> {
    series.values().rev().find_map(|s| s.rx_total).map(|g| g.packets)
}

pub fn tx_pps_series(series: &SnapshotSeries) -> Vec<f64> {
    series.values().filter_map(|s| s.tx_total).map(|g| g.pps).collect()
}

pub fn rx_pps_series(series: &SnapshotSeries) -> Vec<f64> {
    series.values().filter_map(|s| s.rx_total).map(|g| g.pps).collect()
}

// ── Driver ──────────────────────────────────────────────────────────

pub trait TrafficDriver {
    fn reserve_port(&mut self, port: &str) -> Result<(), TrafficError>;
    fn configure_stream(&mut self, port: &str, spec: &StreamSpec) -> Result<(), TrafficError>;
    fn unconfigure_stream(&mut self, port: &str) -> Result<(), TrafficError>;
    fn start(&mut self, port: &str) -> Result<(), TrafficError>;
    fn stop(&mut self, port: &str) -> Result<(), TrafficError>;
    /// Reset counters and drop the port's snapshot history.
    fn clear_statistics(&mut self, port: &str) -> Result<(), TrafficError>;
    fn take_tx_statistics_snapshot(&mut self, port: &str) -> Result<(), TrafficError>;
    fn take_rx_statistics_snapshot(&mut self, port: &str) -> Result<(), TrafficError>;
    fn tx_statistics_snapshots(&self, port: &str) -> Result<SnapshotSeries, TrafficError>;
    fn rx_statistics_snapshots(&self, port: &str) -> Result<SnapshotSeries, TrafficError>;

    fn take_statistics_snapshot(&mut self, port: &str) -> Result<(), TrafficError> {
        self.take_tx_statistics_snapshot(port)?;
        self.take_rx_statistics_snapshot(port)
    }
}
