//! # Scenario Executor
//!
//! One [`TestRunner`] drives every topology; the [`TopologyPlan`] decides
//! which ports are wired and measured. A single iteration walks:
//!
//! ```text
//!   ConfiguringRules ─▶ [WarmingUp] ─▶ ClearingCounters ─▶ Running ─▶ Sampling
//!                                                                        │
//!   Done | Failed ◀── Restoring ◀── Collecting ◀── Stopping ◀────────────┘
//!                         ▲
//!                     any error
//! ```
//!
//! Restoring always runs: whatever was started on the generator, the VM
//! or the DUT is stopped again before the result (or error) is returned.

mod result;

pub use result::{HopReport, RunResult};

use thiserror::Error;

use crate::config::SuiteConfig;
use crate::flow_table::bridge::{TUNNEL_LOCAL_CIDR, TUNNEL_REMOTE_IP};
use crate::flow_table::{
    discovery, DatapathKind, FlowTableController, FlowTableError, FlowTableSettings, PortMap,
    ProgramSpec,
};
use crate::pace::Pacer;
use crate::remote::{RemoteError, RemoteExecutor};
use crate::stats::{self, PortCounterSnapshot, StatCollector, StatsError, PORT_COUNTER_TRIM};
use crate::topology::{
    Hop, HopRole, ResultSource, RuleEndpoint, Topology, TopologyPlan, VmRole, IN_PORT,
};
use crate::traffic::{
    last_rx_packets, last_tx_packets, StreamSpec, TrafficDriver, TrafficError, TrafficFlowType,
};
use crate::vm::{VmEndpoint, VmError};

/// Ticks of a run spent outside the sampling loop: one after starting
/// the generator, one before and one after stopping it.
pub const SAMPLING_OVERHEAD_TICKS: u64 = 3;

/// MAC the tunnel neighbour entry resolves the far endpoint to.
const TUNNEL_NEIGHBOUR_MAC: &str = "00:00:00:00:00:01";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Traffic(#[from] TrafficError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    FlowTable(#[from] FlowTableError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("warm-up did not reach {expected} datapath flows in {ticks} ticks (have {active})")]
    WarmUpTimeout { expected: u64, active: u64, ticks: u32 },
    #[error("traffic generator returned no {0} statistics")]
    MissingStatistics(&'static str),
    #[error("interface {0} has no OpenFlow port number")]
    UnknownPort(String),
    #[error("topology {0} needs a VM connection")]
    MissingVm(Topology),
}

// ── Inputs ──────────────────────────────────────────────────────────

/// Everything a run talks to. Built once per suite.
pub struct TestBed<'a> {
    pub config: &'a SuiteConfig,
    pub dut: &'a dyn RemoteExecutor,
    pub vm: Option<&'a dyn RemoteExecutor>,
    pub tester: &'a mut dyn TrafficDriver,
    pub pacer: &'a dyn Pacer,
    pub ports: &'a PortMap,
    pub datapath: DatapathKind,
    pub tc_offload: bool,
}

/// One measurement iteration. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestScenario {
    pub topology: Topology,
    pub flows: u32,
    pub packet_size: u32,
    /// Percent of line rate.
    pub offered_load: f64,
    pub warm_up: bool,
}

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    ConfiguringRules,
    /// Generator running until the datapath holds every expected flow.
    WarmingUp,
    ClearingCounters,
    Running,
    /// One port snapshot per tick for the configured run time.
    Sampling,
    Stopping,
    Collecting,
    Restoring,
    Done,
    Failed,
}

/// What must be undone if the run stops early.
#[derive(Debug, Default)]
struct Started {
    stream: bool,
    generator: bool,
    vm: bool,
    monitoring: bool,
    perf: bool,
}

/// A hop with its OpenFlow port number resolved.
#[derive(Debug, Clone)]
struct MeasuredHop {
    hop: Hop,
    of_port: String,
}

// ── Runner ──────────────────────────────────────────────────────────

pub struct TestRunner<'a> {
    config: &'a SuiteConfig,
    dut: &'a dyn RemoteExecutor,
    tester: &'a mut dyn TrafficDriver,
    pacer: &'a dyn Pacer,
    datapath: DatapathKind,
    plan: TopologyPlan,
    rule_src: String,
    rule_dst: String,
    hops: Vec<MeasuredHop>,
    flow_table: FlowTableController<'a>,
    stats: StatCollector<'a>,
    vm: Option<VmEndpoint<'a>>,
    transitions: Vec<RunState>,
}

impl<'a> TestRunner<'a> {
    pub fn new(bed: TestBed<'a>, topology: Topology) -> Result<Self, ScenarioError> {
        let config = bed.config;
        let plan = topology.plan(&config.dut, &config.tester);

        let resolve = |endpoint: &RuleEndpoint| match endpoint {
            RuleEndpoint::InPort => Ok(IN_PORT.to_string()),
            RuleEndpoint::Port(interface) => bed
                .ports
                .get(interface)
                .map(str::to_string)
                .ok_or_else(|| ScenarioError::UnknownPort(interface.clone())),
        };
        let rule_src = resolve(&plan.rule_src)?;
        let rule_dst = resolve(&plan.rule_dst)?;
        let hops = plan
            .hops
            .iter()
            .map(|hop| {
                resolve(&RuleEndpoint::Port(hop.interface.clone())).map(|of_port| MeasuredHop {
                    hop: hop.clone(),
                    of_port,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let vm = match plan.vm_role {
            Some(_) => {
                let executor = bed.vm.ok_or(ScenarioError::MissingVm(topology))?;
                Some(VmEndpoint::new(executor, bed.pacer, &config.vm)?)
            }
            None => None,
        };

        let flow_table = FlowTableController::new(
            bed.dut,
            bed.pacer,
            &config.dut.bridge_name,
            bed.datapath,
            bed.tc_offload,
            FlowTableSettings::from_test_config(&config.test, config.vm.mac_swap),
        );

        Ok(Self {
            config,
            dut: bed.dut,
            tester: bed.tester,
            pacer: bed.pacer,
            datapath: bed.datapath,
            plan,
            rule_src,
            rule_dst,
            hops,
            flow_table,
            stats: StatCollector::new(bed.dut),
            vm,
            transitions: Vec::new(),
        })
    }

    pub fn plan(&self) -> &TopologyPlan {
        &self.plan
    }

    /// States the last run passed through, in order.
    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }

    /// Run one scenario end to end.
    pub fn run(&mut self, scenario: &TestScenario) -> Result<RunResult, ScenarioError> {
        tracing::info!(
            topology = %scenario.topology,
            flows = scenario.flows,
            packet_size = scenario.packet_size,
            offered_load = scenario.offered_load,
            "starting test"
        );
        self.transitions.clear();

        let mut started = Started::default();
        let measured = self.measure(scenario, &mut started);

        self.enter(RunState::Restoring);
        self.restore(&started);

        match measured {
            Ok(result) => {
                self.enter(RunState::Done);
                tracing::info!(
                    tx_packets = result.total_tx_pkts,
                    rx_packets = result.total_rx_pkts,
                    loss_percent = result.loss_percent,
                    throughput_pps = result.throughput_pps,
                    "test complete"
                );
                Ok(result)
            }
            Err(error) => {
                self.enter(RunState::Failed);
                tracing::error!(%error, topology = %scenario.topology, "test failed");
                Err(error)
            }
        }
    }

    fn enter(&mut self, state: RunState) {
        tracing::debug!(state = ?state, "run state");
        self.transitions.push(state);
    }

    fn measure(
        &mut self,
        scenario: &TestScenario,
        started: &mut Started,
    ) -> Result<RunResult, ScenarioError> {
        let tx_port = self.plan.tx_port.clone();
        let rx_port = self.plan.rx_port.clone();

        // rules and stream
        self.enter(RunState::ConfiguringRules);
        self.flow_table.program(&ProgramSpec {
            flows: scenario.flows,
            src_port: self.rule_src.clone(),
            dst_port: self.rule_dst.clone(),
            bidirectional: self.plan.bidirectional,
        })?;
        let stream = self.stream_spec(scenario)?;
        self.tester.configure_stream(&tx_port, &stream)?;
        started.stream = true;

        // warm-up
        let mut warm_up_ticks = 0u32;
        if scenario.warm_up {
            if self.plan.warm_up_supported {
                warm_up_ticks = self.warm_up(scenario, &tx_port, started)?;
            } else {
                tracing::warn!(topology = %scenario.topology, "warm-up not supported, skipping");
            }
        }

        // counters
        self.enter(RunState::ClearingCounters);
        self.tester.clear_statistics(&tx_port)?;
        if let Some(rx) = rx_port.as_deref().filter(|rx| *rx != tx_port) {
            self.tester.clear_statistics(rx)?;
        }
        let mut port_samples = vec![self.snapshot_hops()?];

        if let Some(role) = self.plan.vm_role.filter(|_| !started.vm) {
            self.start_vm(role, started)?;
        }

        // traffic
        self.enter(RunState::Running);
        self.stats.start_cpu_monitoring()?;
        started.monitoring = true;
        if self.config.dut.perf {
            self.stats.start_perf(&format!(
                "{}_{}_{}",
                scenario.topology, scenario.flows, scenario.packet_size
            ))?;
            started.perf = true;
        }
        self.tester.start(&tx_port)?;
        started.generator = true;
        self.pacer.pause(1);

        self.enter(RunState::Sampling);
        let samples = self
            .config
            .test
            .run_time_s
            .saturating_sub(SAMPLING_OVERHEAD_TICKS);
        for _ in 0..samples {
            self.pacer.pause(1);
            if let Some(rx) = rx_port.as_deref() {
                self.tester.take_rx_statistics_snapshot(rx)?;
            }
            port_samples.push(self.snapshot_hops()?);
        }

        self.enter(RunState::Stopping);
        self.pacer.pause(1);
        self.tester.stop(&tx_port)?;
        started.generator = false;
        if started.perf {
            self.stats.stop_perf()?;
            started.perf = false;
        }
        self.stats.stop_cpu_monitoring()?;
        started.monitoring = false;
        self.pacer.pause(1);

        // results
        self.enter(RunState::Collecting);
        self.tester.take_tx_statistics_snapshot(&tx_port)?;
        if let Some(rx) = rx_port.as_deref() {
            self.tester.take_rx_statistics_snapshot(rx)?;
        }
        let tx_series = self.tester.tx_statistics_snapshots(&tx_port)?;
        let rx_series = match rx_port.as_deref() {
            Some(rx) => Some(self.tester.rx_statistics_snapshots(rx)?),
            None => None,
        };
        port_samples.push(self.snapshot_hops()?);
        let hops = self.hop_reports(&port_samples)?;
        let cpu = self.stats.sample_cpu()?;

        let vm_rx_pps = match &self.vm {
            Some(vm) if started.vm => {
                let samples = vm.rx_samples()?;
                vm.stop()?;
                started.vm = false;
                match stats::vm_receive_rate(&samples, warm_up_ticks as usize) {
                    Ok(rate) => Some(rate),
                    Err(error) if self.plan.result_source == ResultSource::VmRx => {
                        return Err(error.into())
                    }
                    Err(error) => {
                        tracing::warn!(%error, "no VM receive rate");
                        None
                    }
                }
            }
            _ => None,
        };

        let total_tx_pkts =
            last_tx_packets(&tx_series).ok_or(ScenarioError::MissingStatistics("transmit"))?;
        let total_rx_pkts = match &rx_series {
            Some(series) => {
                last_rx_packets(series).ok_or(ScenarioError::MissingStatistics("receive"))?
            }
            // packets the switch delivered to the VM
            None => hops
                .iter()
                .find(|h| h.role == HopRole::Virtual)
                .map(|h| h.delta.tx_packets)
                .unwrap_or(0),
        };
        let throughput_pps = match (self.plan.result_source, &rx_series) {
            (ResultSource::GeneratorRx, Some(series)) => stats::generator_rx_rate(series)?,
            (ResultSource::GeneratorRx, None) => {
                return Err(ScenarioError::MissingStatistics("receive"))
            }
            (ResultSource::VmRx, _) => vm_rx_pps.unwrap_or(0.0),
        };
        let loss_percent = stats::loss_percentage(total_tx_pkts, total_rx_pkts);
        if total_rx_pkts > total_tx_pkts {
            tracing::warn!(
                tx_packets = total_tx_pkts,
                rx_packets = total_rx_pkts,
                "received more packets than were sent"
            );
        }
        for hop in &hops {
            tracing::info!(
                hop = ?hop.role,
                interface = %hop.interface,
                rx_packets = hop.delta.rx_packets,
                rx_drop = hop.delta.rx_drop,
                tx_packets = hop.delta.tx_packets,
                tx_drop = hop.delta.tx_drop,
                "port counters"
            );
        }

        Ok(RunResult {
            topology: scenario.topology,
            flows: scenario.flows,
            packet_size: scenario.packet_size,
            offered_load: scenario.offered_load,
            total_tx_pkts,
            total_rx_pkts,
            loss_percent,
            throughput_pps,
            cpu,
            hops,
            vm_rx_pps,
            warm_up_ticks,
        })
    }

    /// Run traffic until the datapath has learned every flow. Returns the
    /// ticks since the VM endpoint was started, which is how many of its
    /// samples predate the measurement.
    fn warm_up(
        &mut self,
        scenario: &TestScenario,
        tx_port: &str,
        started: &mut Started,
    ) -> Result<u32, ScenarioError> {
        self.enter(RunState::WarmingUp);
        let origin = self.pacer.elapsed_ticks();
        if let Some(role) = self.plan.vm_role {
            self.start_vm(role, started)?;
        }

        let expected = self.plan.expected_datapath_flows(scenario.flows);
        let timeout = u32::try_from(self.config.test.warm_up_timeout_s).unwrap_or(u32::MAX);
        tracing::info!(expected, timeout_ticks = timeout, "warming up flow table");

        self.tester.start(tx_port)?;
        started.generator = true;
        let outcome = self.flow_table.wait_for_active_flows(expected, timeout)?;
        self.tester.stop(tx_port)?;
        started.generator = false;

        if !outcome.reached {
            if !self.config.test.warm_up_no_fail {
                return Err(ScenarioError::WarmUpTimeout {
                    expected,
                    active: outcome.active,
                    ticks: outcome.ticks,
                });
            }
            tracing::warn!(
                expected,
                active = outcome.active,
                ticks = outcome.ticks,
                "warm-up incomplete, continuing"
            );
        }
        let elapsed = self.pacer.elapsed_ticks().saturating_sub(origin);
        tracing::debug!(poll_ticks = outcome.ticks, elapsed, "warm-up finished");
        Ok(u32::try_from(elapsed).unwrap_or(u32::MAX))
    }

    fn start_vm(&self, role: VmRole, started: &mut Started) -> Result<(), ScenarioError> {
        if let Some(vm) = &self.vm {
            vm.start(role)?;
            started.vm = true;
        }
        Ok(())
    }

    fn stream_spec(&self, scenario: &TestScenario) -> Result<StreamSpec, ScenarioError> {
        let test = &self.config.test;
        let tunnel_dst_mac = match &self.plan.tunnel_bridge {
            Some(tunnel_bridge) => {
                self.prepare_tunnel(tunnel_bridge)?;
                Some(discovery::bridge_mac(self.dut, tunnel_bridge)?)
            }
            None => None,
        };
        Ok(StreamSpec {
            flow_type: TrafficFlowType::for_flow_type(test.flow_type, tunnel_dst_mac.is_some()),
            flows: scenario.flows,
            packet_size: scenario.packet_size,
            rate_percent: scenario.offered_load,
            src_mac: test.src_mac,
            dst_mac: test.dst_mac,
            tunnel_dst_mac,
            random_payload: test.payload_packet_random,
        })
    }

    /// The userspace datapath resolves the far tunnel endpoint itself and
    /// needs a static neighbour entry and an address on the bridge.
    fn prepare_tunnel(&self, tunnel_bridge: &str) -> Result<(), ScenarioError> {
        if self.datapath != DatapathKind::Netdev {
            return Ok(());
        }
        self.dut.execute_checked(&format!(
            "ovs-appctl tnl/neigh/set {tunnel_bridge} {TUNNEL_REMOTE_IP} {TUNNEL_NEIGHBOUR_MAC}"
        ))?;
        self.dut.execute_checked(&format!(
            "ip addr replace {TUNNEL_LOCAL_CIDR} dev {tunnel_bridge} && ip link set {tunnel_bridge} up"
        ))?;
        Ok(())
    }

    fn snapshot_hops(&self) -> Result<Vec<PortCounterSnapshot>, StatsError> {
        self.hops
            .iter()
            .map(|m| self.stats.snapshot_port_counters(&m.hop.bridge, &m.of_port))
            .collect()
    }

    /// Deltas between the first and last snapshot of each hop, plus the
    /// trimmed per-tick rates in between.
    fn hop_reports(&self, samples: &[Vec<PortCounterSnapshot>]) -> Result<Vec<HopReport>, StatsError> {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Err(StatsError::InsufficientSamples { needed: 2, got: 0 });
        };
        let rate = |series: Vec<u64>| match stats::rate_from_counter_series(&series, PORT_COUNTER_TRIM) {
            Ok(rate) => Ok(Some(rate)),
            Err(StatsError::InsufficientSamples { .. }) => Ok(None),
            Err(error) => Err(error),
        };

        self.hops
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let delta = first[i].delta(&last[i])?;
                let rx = samples.iter().map(|row| row[i].rx_packets).collect();
                let tx = samples.iter().map(|row| row[i].tx_packets).collect();
                Ok(HopReport {
                    role: m.hop.role,
                    interface: m.hop.interface.clone(),
                    of_port: m.of_port.clone(),
                    delta,
                    rx_pps: rate(rx)?,
                    tx_pps: rate(tx)?,
                })
            })
            .collect()
    }

    /// Stop whatever is still running. Failures only warn.
    fn restore(&mut self, started: &Started) {
        let tx_port = self.plan.tx_port.clone();
        if started.generator {
            if let Err(error) = self.tester.stop(&tx_port) {
                tracing::warn!(%error, "failed to stop traffic generator");
            }
        }
        if started.perf {
            if let Err(error) = self.stats.stop_perf() {
                tracing::warn!(%error, "failed to stop perf");
            }
        }
        if started.monitoring {
            if let Err(error) = self.stats.stop_cpu_monitoring() {
                tracing::warn!(%error, "failed to stop CPU monitoring");
            }
        }
        if started.vm {
            if let Some(Err(error)) = self.vm.as_ref().map(VmEndpoint::stop) {
                tracing::warn!(%error, "failed to stop VM endpoint");
            }
        }
        if started.stream {
            if let Err(error) = self.tester.unconfigure_stream(&tx_port) {
                tracing::warn!(%error, "failed to unconfigure stream");
            }
        }
    }
}

/// Generator snapshots one run produces on its receive port.
pub fn expected_generator_samples(run_time_s: u64) -> u64 {
    run_time_s.saturating_sub(SAMPLING_OVERHEAD_TICKS) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_second_run_yields_eighteen_samples() {
        assert_eq!(expected_generator_samples(20), 18);
        assert_eq!(
            expected_generator_samples(20) as usize - 2 * stats::GENERATOR_EXCLUDE_EDGES,
            14
        );
    }
}
