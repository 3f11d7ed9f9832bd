//! Shared state of the simulated testbed and its per-tick packet model.
//!
//! Traffic is moved in whole ticks. Each tick every running generator
//! port offers its stream to the switch, which forwards what its
//! capacity allows along the installed rules. Packets reaching a
//! physical port leave towards the tester port wired to it; packets
//! reaching the virtual port are handed to the VM endpoint, which may
//! send them straight back.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use switchperf_core::config::SuiteConfig;
use switchperf_core::flow_table::DatapathKind;
use switchperf_core::stats::eth_max_pps;
use switchperf_core::topology::VXLAN_PORT;
use switchperf_core::traffic::{SnapshotSeries, StreamSpec, TrafficFlowType};

use crate::profile::{Fault, SimProfile};

/// Simulated milliseconds per tick.
pub const TICK_MS: u64 = 1000;

// ── Ports / Rules ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounters {
    pub rx_packets: u64,
    pub rx_drop: u64,
    pub tx_packets: u64,
    pub tx_drop: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortKind {
    Physical,
    Virtual,
    Vxlan,
    Other,
}

#[derive(Debug, Clone)]
pub(crate) struct SimPort {
    pub interface: String,
    pub bridge: String,
    pub of_port: u32,
    pub kind: PortKind,
    pub counters: PortCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuleAction {
    Port(u32),
    InPort,
    Normal,
    Drop,
}

#[derive(Debug, Clone)]
pub(crate) struct SimRule {
    pub text: String,
    pub in_port: Option<u32>,
    pub action: RuleAction,
    /// Matches header fields beyond the ingress port.
    pub per_flow: bool,
}

impl SimRule {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let text = text.strip_prefix("add ").unwrap_or(text).trim().to_string();
        let mut in_port = None;
        let mut action = RuleAction::Drop;
        let mut per_flow = false;
        for field in text.split(',') {
            let field = field.trim();
            if let Some(port) = field.strip_prefix("in_port=") {
                in_port = port.parse().ok();
            } else if let Some(value) = field
                .strip_prefix("actions=")
                .or_else(|| field.strip_prefix("action="))
            {
                let value = value.strip_prefix("output:").unwrap_or(value);
                action = match value {
                    "NORMAL" | "normal" => RuleAction::Normal,
                    "IN_PORT" | "in_port" => RuleAction::InPort,
                    other => other.parse().map(RuleAction::Port).unwrap_or(RuleAction::Drop),
                };
            } else if !field.is_empty() {
                per_flow = true;
            }
        }
        Self {
            text,
            in_port,
            action,
            per_flow,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SimBridge {
    pub mac: u64,
    pub rules: Vec<SimRule>,
}

// ── Endpoints ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub(crate) struct GeneratorPort {
    pub reserved: bool,
    pub stream: Option<StreamSpec>,
    pub running: bool,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_tick: u64,
    pub rx_tick: u64,
    pub tx_last: u64,
    pub rx_last: u64,
    pub tx_series: SnapshotSeries,
    pub rx_series: SnapshotSeries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VmMode {
    Receive,
    Loopback,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct VmState {
    pub mode: Option<VmMode>,
    /// `Rx-pps` lines printed so far; `None` before the first start.
    pub samples: Option<Vec<u64>>,
    pub rx_tick: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Monitor {
    pub ticks: u64,
    pub busy_ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    Dut,
    Vm,
}

// ── World ───────────────────────────────────────────────────────────

/// Everything the simulated DUT, VM and tester share.
#[derive(Debug)]
pub struct SimWorld {
    pub(crate) profile: SimProfile,
    pub(crate) faults: Vec<Fault>,
    rng: StdRng,
    pub(crate) tick: u64,
    pub(crate) clock_ms: u64,
    pub(crate) datapath: DatapathKind,
    pub(crate) virtual_interface: String,
    pub(crate) physical_interfaces: Vec<String>,
    /// Tester port name to the DUT interface it is cabled to.
    pub(crate) cabling: Vec<(String, String)>,
    pub(crate) bridges: BTreeMap<String, SimBridge>,
    pub(crate) ports: Vec<SimPort>,
    pub(crate) datapath_flows: u64,
    learn_target: u64,
    budget: u64,
    pub(crate) generator: BTreeMap<String, GeneratorPort>,
    pub(crate) vm: VmState,
    pub(crate) monitor: Option<Monitor>,
    pub(crate) thread_report: Option<String>,
    pub(crate) system_report: Option<String>,
    pub(crate) perf_running: bool,
    pub(crate) commands: Vec<(Host, String)>,
}

impl SimWorld {
    pub fn new(config: &SuiteConfig, profile: SimProfile) -> Self {
        let dut = &config.dut;
        let datapath = profile.datapath.unwrap_or(if dut.physical_interface.contains("dpdk") {
            DatapathKind::Netdev
        } else {
            DatapathKind::System
        });

        let mut physical_interfaces = vec![dut.physical_interface.clone()];
        let mut cabling = vec![(config.tester.interface.clone(), dut.physical_interface.clone())];
        if let Some(second) = &dut.second_physical_interface {
            physical_interfaces.push(second.clone());
            if let Some(tester) = &config.tester.second_interface {
                cabling.push((tester.clone(), second.clone()));
            }
        }

        Self {
            rng: StdRng::seed_from_u64(profile.seed),
            profile,
            faults: Vec::new(),
            tick: 0,
            clock_ms: 0,
            datapath,
            virtual_interface: dut.virtual_interface.clone(),
            physical_interfaces,
            cabling,
            bridges: BTreeMap::new(),
            ports: Vec::new(),
            datapath_flows: 0,
            learn_target: 0,
            budget: 0,
            generator: BTreeMap::new(),
            vm: VmState::default(),
            monitor: None,
            thread_report: None,
            system_report: None,
            perf_running: false,
            commands: Vec::new(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn datapath_flows(&self) -> u64 {
        self.datapath_flows
    }

    pub fn rule_count(&self, bridge: &str) -> usize {
        self.bridges.get(bridge).map_or(0, |b| b.rules.len())
    }

    pub fn port_counters(&self, interface: &str) -> Option<PortCounters> {
        self.ports
            .iter()
            .find(|p| p.interface == interface)
            .map(|p| p.counters)
    }

    /// Commands issued so far on `host`, oldest first.
    pub fn commands(&self, host: Host) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|(h, _)| *h == host)
            .map(|(_, c)| c.as_str())
            .collect()
    }

    pub fn generator_running(&self) -> bool {
        self.generator.values().any(|g| g.running)
    }

    pub fn vm_running(&self) -> bool {
        self.vm.mode.is_some()
    }

    pub fn monitoring(&self) -> bool {
        self.monitor.is_some()
    }

    pub(crate) fn log_command(&mut self, host: Host, command: &str) {
        tracing::trace!(?host, command, "simulated command");
        self.commands.push((host, command.to_string()));
    }

    pub(crate) fn has_fault(&self, pred: impl Fn(&Fault) -> bool) -> bool {
        self.faults.iter().any(pred)
    }

    pub(crate) fn port_kind(&self, interface: &str) -> PortKind {
        if interface == VXLAN_PORT {
            PortKind::Vxlan
        } else if !self.virtual_interface.is_empty() && interface == self.virtual_interface {
            PortKind::Virtual
        } else if self.physical_interfaces.iter().any(|p| p == interface) {
            PortKind::Physical
        } else {
            PortKind::Other
        }
    }

    fn port_on(&self, bridge: &str, of_port: u32) -> Option<usize> {
        self.ports
            .iter()
            .position(|p| p.bridge == bridge && p.of_port == of_port)
    }

    fn port_of_kind(&self, kind: PortKind) -> Option<usize> {
        self.ports.iter().position(|p| p.kind == kind)
    }

    fn port_named(&self, interface: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.interface == interface)
    }

    // ── Time ────────────────────────────────────────────────────────

    pub(crate) fn advance(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Monotonic snapshot timestamp, unique per call.
    pub(crate) fn timestamp(&mut self) -> u64 {
        self.clock_ms += 1;
        self.clock_ms
    }

    fn step(&mut self) {
        self.tick += 1;
        self.clock_ms = self.clock_ms.max(self.tick * TICK_MS);
        self.learn_target = 0;
        self.vm.rx_tick = 0;
        for g in self.generator.values_mut() {
            g.tx_tick = 0;
            g.rx_tick = 0;
        }

        let running: Vec<(String, StreamSpec)> = self
            .generator
            .iter()
            .filter(|(_, g)| g.running)
            .filter_map(|(port, g)| g.stream.clone().map(|s| (port.clone(), s)))
            .collect();
        self.budget = running
            .first()
            .map_or(0, |(_, spec)| self.capacity(spec.flows));
        for (port, spec) in &running {
            self.inject(port, spec);
        }

        let target = self.learn_target;
        if self.datapath_flows < target {
            self.datapath_flows = (self.datapath_flows + self.profile.learn_per_tick).min(target);
        } else if self.datapath_flows > target {
            self.datapath_flows = self
                .datapath_flows
                .saturating_sub(self.profile.decay_per_tick)
                .max(target);
        }

        if self.vm.mode.is_some() {
            let rx = self.vm.rx_tick;
            self.vm.samples.get_or_insert_with(Vec::new).push(rx);
        }
        for g in self.generator.values_mut() {
            g.tx_last = g.tx_tick;
            g.rx_last = g.rx_tick;
        }
        if let Some(monitor) = &mut self.monitor {
            monitor.ticks += 1;
            if !running.is_empty() {
                monitor.busy_ticks += 1;
            }
        }

        let resets: Vec<String> = self
            .faults
            .iter()
            .filter_map(|f| match f {
                Fault::CounterReset { interface, at_tick } if *at_tick == self.tick => {
                    Some(interface.clone())
                }
                _ => None,
            })
            .collect();
        for interface in resets {
            if let Some(i) = self.port_named(&interface) {
                tracing::debug!(interface, tick = self.tick, "resetting port counters");
                self.ports[i].counters = PortCounters::default();
            }
        }
    }

    fn capacity(&mut self, flows: u32) -> u64 {
        let base = self.profile.switch_capacity_pps / (1.0 + f64::from(flows) / self.profile.flow_scale);
        let noise = if self.profile.jitter > 0.0 {
            1.0 + (self.rng.random::<f64>() * 2.0 - 1.0) * self.profile.jitter
        } else {
            1.0
        };
        (base * noise).max(0.0) as u64
    }

    fn take_budget(&mut self, packets: u64) -> u64 {
        let accepted = packets.min(self.budget);
        self.budget -= accepted;
        accepted
    }

    // ── Forwarding ──────────────────────────────────────────────────

    fn inject(&mut self, tester_port: &str, spec: &StreamSpec) {
        let offered = eth_max_pps(self.profile.line_bps, spec.packet_size) * spec.rate_percent / 100.0;
        let offered = offered.round() as u64;
        if let Some(g) = self.generator.get_mut(tester_port) {
            g.tx_packets += offered;
            g.tx_tick += offered;
        }

        let Some(ingress) = self
            .cabling
            .iter()
            .find(|(tester, _)| tester == tester_port)
            .and_then(|(_, interface)| self.port_named(interface))
        else {
            return;
        };
        // the PMD polls the VM's queue too when packets come back
        let share = if self.vm.mode == Some(VmMode::Loopback) {
            self.budget / 2
        } else {
            self.budget
        };
        let accepted = offered.min(share);
        self.budget -= accepted;
        let counters = &mut self.ports[ingress].counters;
        counters.rx_packets += accepted;
        counters.rx_drop += offered - accepted;

        let entry = if spec.flow_type == TrafficFlowType::VxlanL3Ipv4 {
            // decapsulated on the termination bridge, seen on vxlan0
            match self.port_of_kind(PortKind::Vxlan) {
                Some(vxlan) => {
                    self.ports[vxlan].counters.rx_packets += accepted;
                    vxlan
                }
                None => return,
            }
        } else {
            ingress
        };
        self.forward(entry, accepted, spec.flows, true);
    }

    /// Switch `packets` that arrived on port index `from`.
    fn forward(&mut self, from: usize, packets: u64, flows: u32, allow_loopback: bool) {
        if packets == 0 {
            return;
        }
        let bridge_name = self.ports[from].bridge.clone();
        let of_port = self.ports[from].of_port;
        let Some(bridge) = self.bridges.get(&bridge_name) else {
            return;
        };
        let matching: Vec<&SimRule> = bridge
            .rules
            .iter()
            .filter(|r| r.in_port.map_or(true, |p| p == of_port))
            .collect();
        let Some(first) = matching.first() else {
            return;
        };
        let action = first.action;

        let stream_flows = u64::from(flows.max(1));
        let (matched, learned) = if first.per_flow {
            let hit = (matching.len() as u64).min(stream_flows);
            (packets * hit / stream_flows, hit)
        } else {
            // one exact-match datapath flow per stream flow
            (packets, stream_flows)
        };
        self.learn_target += learned;

        let out = match action {
            RuleAction::InPort => Some(from),
            RuleAction::Port(n) => self.port_on(&bridge_name, n),
            RuleAction::Normal => self.normal_egress(from),
            RuleAction::Drop => None,
        };
        if let Some(out) = out {
            self.emit(out, matched, flows, allow_loopback);
        }
    }

    /// Where a learning switch would send traffic for the VM endpoint.
    fn normal_egress(&self, from: usize) -> Option<usize> {
        let bridge = &self.ports[from].bridge;
        let on_bridge = |kind| {
            self.ports
                .iter()
                .position(|p| &p.bridge == bridge && p.kind == kind)
        };
        if self.ports[from].kind == PortKind::Virtual {
            on_bridge(PortKind::Vxlan).or_else(|| on_bridge(PortKind::Physical))
        } else {
            on_bridge(PortKind::Virtual)
        }
    }

    fn emit(&mut self, out: usize, packets: u64, flows: u32, allow_loopback: bool) {
        match self.ports[out].kind {
            PortKind::Physical => {
                self.ports[out].counters.tx_packets += packets;
                self.deliver_to_tester(out, packets);
            }
            PortKind::Vxlan => {
                self.ports[out].counters.tx_packets += packets;
                // encapsulated and sent out of the physical port
                let phys = self
                    .physical_interfaces
                    .first()
                    .and_then(|interface| self.port_named(interface));
                if let Some(phys) = phys {
                    self.ports[phys].counters.tx_packets += packets;
                    self.deliver_to_tester(phys, packets);
                }
            }
            PortKind::Virtual => {
                let returned = self.deliver_to_vm(out, packets);
                if allow_loopback && returned > 0 {
                    let accepted = self.take_budget(returned);
                    let counters = &mut self.ports[out].counters;
                    counters.rx_packets += accepted;
                    counters.rx_drop += returned - accepted;
                    self.forward(out, accepted, flows, false);
                }
            }
            PortKind::Other => {
                self.ports[out].counters.tx_packets += packets;
            }
        }
    }

    fn deliver_to_tester(&mut self, port: usize, packets: u64) {
        let interface = &self.ports[port].interface;
        let Some((tester, _)) = self.cabling.iter().find(|(_, i)| i == interface) else {
            return;
        };
        if let Some(g) = self.generator.get_mut(tester) {
            g.rx_packets += packets;
            g.rx_tick += packets;
        }
    }

    /// Hand packets to the VM; returns what it sends back.
    fn deliver_to_vm(&mut self, port: usize, packets: u64) -> u64 {
        let Some(mode) = self.vm.mode else {
            self.ports[port].counters.tx_drop += packets;
            return 0;
        };
        let room = self.profile.vm_capacity_pps.saturating_sub(self.vm.rx_tick);
        let delivered = packets.min(room);
        let counters = &mut self.ports[port].counters;
        counters.tx_packets += delivered;
        counters.tx_drop += packets - delivered;
        self.vm.rx_tick += delivered;
        match mode {
            VmMode::Receive => 0,
            VmMode::Loopback => delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_are_parsed_from_batches_and_single_adds() {
        let rule = SimRule::parse("add in_port=10,ip,nw_src=1.0.0.0,nw_dst=2.0.0.0,action=20");
        assert_eq!(rule.in_port, Some(10));
        assert_eq!(rule.action, RuleAction::Port(20));
        assert!(rule.per_flow);

        let rule = SimRule::parse("in_port=10,action=IN_PORT");
        assert_eq!(rule.action, RuleAction::InPort);
        assert!(!rule.per_flow);

        let rule = SimRule::parse("action=NORMAL");
        assert_eq!(rule.in_port, None);
        assert_eq!(rule.action, RuleAction::Normal);
    }

    #[test]
    fn jitter_is_reproducible_per_seed() {
        let cfg = crate::tests::config();
        let profile = SimProfile {
            jitter: 0.1,
            seed: 42,
            ..SimProfile::default()
        };
        let mut a = SimWorld::new(&cfg, profile.clone());
        let mut b = SimWorld::new(&cfg, profile);
        let xs: Vec<u64> = (0..5).map(|_| a.capacity(10)).collect();
        let ys: Vec<u64> = (0..5).map(|_| b.capacity(10)).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().all(|c| (7_100_000..=8_900_000).contains(c)));
    }
}
