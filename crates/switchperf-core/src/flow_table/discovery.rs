//! Facts read off the switch before any test runs: OpenFlow port
//! numbers, datapath flavour, TC offload, bridge MAC and link speed.

use std::collections::BTreeMap;

use serde::Serialize;

use super::FlowTableError;
use crate::config::{parse_mac, SuiteConfig};
use crate::remote::RemoteExecutor;
use crate::topology::{tunnel_bridge_name, VXLAN_PORT};

/// Assumed line rate when `ethtool` does not report one.
pub const DEFAULT_LINK_SPEED_BPS: u64 = 10_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatapathKind {
    /// Userspace (DPDK) datapath.
    Netdev,
    /// Kernel datapath.
    System,
}

impl DatapathKind {
    pub fn dpctl_name(&self) -> &'static str {
        match self {
            DatapathKind::Netdev => "netdev@ovs-netdev",
            DatapathKind::System => "system@ovs-system",
        }
    }
}

// ── Port Map ────────────────────────────────────────────────────────

/// Interface name to OpenFlow port number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortMap {
    ports: BTreeMap<String, String>,
}

impl PortMap {
    /// Look up every interface in the `ovs-ofctl show` output of `bridges`.
    pub fn discover(
        dut: &dyn RemoteExecutor,
        bridges: &[&str],
        interfaces: &[&str],
    ) -> Result<Self, FlowTableError> {
        let mut show = String::new();
        for bridge in bridges {
            let output = dut.execute_checked(&format!("ovs-ofctl show {bridge}"))?;
            show.push_str(&output.stdout);
        }
        let map = Self::parse(&show, interfaces)?;
        tracing::info!(ports = ?map.ports, "OpenFlow port numbers");
        Ok(map)
    }

    /// Discover every port the configured tests program or measure.
    pub fn for_suite(dut: &dyn RemoteExecutor, cfg: &SuiteConfig) -> Result<Self, FlowTableError> {
        let tests = &cfg.test.tests;
        let tunnel_bridge = tunnel_bridge_name(&cfg.dut.bridge_name);
        let mut bridges = vec![cfg.dut.bridge_name.as_str()];
        let mut interfaces = vec![cfg.dut.physical_interface.as_str()];
        if tests.iter().any(|t| t.topology.is_tunnel()) {
            bridges.push(&tunnel_bridge);
            interfaces.push(VXLAN_PORT);
        }
        if let Some(second) = cfg
            .dut
            .second_physical_interface
            .as_deref()
            .filter(|_| tests.iter().any(|t| t.topology.needs_second_physical()))
        {
            interfaces.push(second);
        }
        if tests.iter().any(|t| t.topology.needs_vm()) {
            interfaces.push(&cfg.dut.virtual_interface);
        }
        Self::discover(dut, &bridges, &interfaces)
    }

    pub fn parse(show: &str, interfaces: &[&str]) -> Result<Self, FlowTableError> {
        let mut ports = BTreeMap::new();
        for interface in interfaces {
            let number = parse_of_port(show, interface).ok_or_else(|| {
                FlowTableError::Discovery(format!(
                    "no OpenFlow port number for interface {interface}"
                ))
            })?;
            ports.insert(interface.to_string(), number);
        }
        Ok(Self { ports })
    }

    pub fn get(&self, interface: &str) -> Option<&str> {
        self.ports.get(interface).map(String::as_str)
    }

    pub fn insert(&mut self, interface: &str, of_port: &str) {
        self.ports.insert(interface.to_string(), of_port.to_string());
    }
}

/// ` 10(dpdk0): addr:...` -> `10`
fn parse_of_port(show: &str, interface: &str) -> Option<String> {
    let needle = format!("({interface}): addr:");
    show.lines().find_map(|line| {
        let (number, _) = line.split_once(&needle)?;
        let number = number.trim();
        (!number.is_empty() && number.chars().all(|c| c.is_ascii_digit()))
            .then(|| number.to_string())
    })
}

// ── Datapath / Offload ──────────────────────────────────────────────

/// Which datapath `bridge` lives on, from `ovs-appctl dpif/show`.
pub fn datapath_kind(dut: &dyn RemoteExecutor, bridge: &str) -> Result<DatapathKind, FlowTableError> {
    let output = dut.execute_checked("ovs-appctl dpif/show")?;
    parse_datapath_kind(&output.stdout, bridge)
}

pub fn parse_datapath_kind(dpif_show: &str, bridge: &str) -> Result<DatapathKind, FlowTableError> {
    let bridge_header = format!("{bridge}:");
    let mut current: Option<&str> = None;

    for line in dpif_show.lines() {
        if !line.starts_with(char::is_whitespace) {
            // "netdev@ovs-netdev: hit:0 missed:0"
            current = line.split_once('@').map(|(kind, _)| kind.trim());
        } else if line.trim() == bridge_header {
            return match current {
                Some("netdev") => Ok(DatapathKind::Netdev),
                Some("system") => Ok(DatapathKind::System),
                other => Err(FlowTableError::Discovery(format!(
                    "unsupported datapath {other:?} for bridge {bridge}"
                ))),
            };
        }
    }
    Err(FlowTableError::Discovery(format!(
        "bridge {bridge} not found in any datapath"
    )))
}

/// Whether hardware offload through TC is switched on.
pub fn tc_offload_enabled(dut: &dyn RemoteExecutor) -> Result<bool, FlowTableError> {
    let output = dut.execute("ovs-vsctl get Open_vSwitch . other_config:hw-offload")?;
    // the key is absent unless offload was ever configured
    Ok(output.success() && output.stdout.trim() == "\"true\"")
}

// ── Bridge MAC / Link Speed ─────────────────────────────────────────

pub fn bridge_mac(dut: &dyn RemoteExecutor, bridge: &str) -> Result<u64, FlowTableError> {
    let output = dut.execute_checked(&format!("ovs-ofctl show {bridge}"))?;
    let mac = parse_bridge_mac(&output.stdout, bridge).ok_or_else(|| {
        FlowTableError::Discovery(format!("no MAC address for bridge {bridge}"))
    })?;
    tracing::debug!(bridge, mac = %crate::config::format_mac(mac), "bridge MAC");
    Ok(mac)
}

fn parse_bridge_mac(show: &str, bridge: &str) -> Option<u64> {
    let needle = format!("LOCAL({bridge}): addr:");
    show.lines().find_map(|line| {
        let (_, mac) = line.split_once(&needle)?;
        parse_mac(mac.trim()).ok()
    })
}

/// Line rate of `interface` in bits/s, falling back to 10 Gbit/s.
pub fn physical_port_speed(dut: &dyn RemoteExecutor, interface: &str) -> Result<u64, FlowTableError> {
    let output = dut.execute(&format!("ethtool {interface}"))?;
    let speed = match parse_link_speed_bps(&output.output) {
        Some(speed) => speed,
        None => {
            tracing::info!(interface, "cannot determine link speed, assuming 10 Gbit/s");
            DEFAULT_LINK_SPEED_BPS
        }
    };
    tracing::info!(interface, speed_bps = speed, "physical port speed");
    Ok(speed)
}

fn parse_link_speed_bps(ethtool: &str) -> Option<u64> {
    ethtool.lines().find_map(|line| {
        let speed = line.trim().strip_prefix("Speed:")?.trim();
        let mbps = speed.strip_suffix("Mb/s")?;
        mbps.parse::<u64>().ok().map(|m| m * 1_000_000)
    })
}

/// `flows: N` from `ovs-appctl dpctl/show`.
pub(crate) fn parse_flow_count(dpctl_show: &str) -> Option<u64> {
    dpctl_show.lines().find_map(|line| {
        line.trim()
            .strip_prefix("flows:")
            .and_then(|n| n.trim().parse().ok())
    })
}
