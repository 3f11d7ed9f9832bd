use serde::Serialize;

use crate::stats::{CpuUtilizationSample, PortCounterDelta};
use crate::topology::{HopRole, Topology};

/// Counters of one measured switch port over a run.
#[derive(Debug, Clone, Serialize)]
pub struct HopReport {
    pub role: HopRole,
    pub interface: String,
    pub of_port: String,
    pub delta: PortCounterDelta,
    /// Packets/s the switch received on this port, when enough samples.
    pub rx_pps: Option<f64>,
    /// Packets/s the switch sent out of this port, when enough samples.
    pub tx_pps: Option<f64>,
}

/// Outcome of one measurement iteration.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub topology: Topology,
    pub flows: u32,
    pub packet_size: u32,
    /// Generator rate in percent of line rate.
    pub offered_load: f64,
    pub total_tx_pkts: u64,
    pub total_rx_pkts: u64,
    /// Percent, `[0, 100]`.
    pub loss_percent: f64,
    /// Packets per second at the result source of the topology.
    pub throughput_pps: f64,
    pub cpu: CpuUtilizationSample,
    pub hops: Vec<HopReport>,
    /// Packets per second seen by the VM endpoint, if one took part.
    pub vm_rx_pps: Option<f64>,
    pub warm_up_ticks: u32,
}

impl RunResult {
    pub fn hop(&self, role: HopRole) -> Option<&HopReport> {
        self.hops.iter().find(|h| h.role == role)
    }
}
