//! Suite configuration.
//!
//! [`SuiteConfigInput`] mirrors the TOML file (every field optional); the
//! CLI overlays its flags onto it and [`SuiteConfigInput::resolve`]
//! validates the result into an immutable [`SuiteConfig`] that the rest
//! of the crate borrows. All precondition checks happen here, before any
//! command touches the device under test.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::{TestSelection, Topology};

pub const DEFAULT_BRIDGE_NAME: &str = "ovs_pvp_br0";
pub const DEFAULT_TESTS: &str = "p2v,p2v2p,p2p";
pub const DEFAULT_PACKET_LIST: &str = "64, 128, 256, 512, 768, 1024, 1514";
pub const DEFAULT_STREAM_LIST: &str = "10, 1000, 10000, 100000, 1000000";
pub const DEFAULT_RUN_TIME_S: u64 = 20;
pub const DEFAULT_WARM_UP_TIMEOUT_S: u64 = 360;
pub const DEFAULT_SRC_MAC: &str = "00:00:01:00:00:00";
pub const DEFAULT_DST_MAC: &str = "00:00:02:00:00:00";
pub const DEFAULT_VM_NIC_QUEUES: u32 = 2;
pub const DEFAULT_VM_NIC_DESCRIPTORS: u32 = 4096;
pub const DEFAULT_USER: &str = "root";

const MIN_PACKET_SIZE: u64 = 64;
const MAX_PACKET_SIZE: u64 = 9000;
const MIN_TUNNEL_PACKET_SIZE: u64 = 96;
const MAX_FLOWS: u64 = 1_000_000;
const MAX_L4_FLOWS: u64 = 65_535;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid {name} list \"{value}\": {reason}")]
    InvalidList {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{name} {value} is out of range [{min}..{max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("invalid MAC address \"{0}\"")]
    InvalidMac(String),
    #[error("invalid PCI address \"{0}\"")]
    InvalidPci(String),
    #[error("unknown {kind} \"{value}\"")]
    Unknown { kind: &'static str, value: String },
    #[error("{0}")]
    Conflict(String),
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

// ── Enumerations ────────────────────────────────────────────────────

/// Packet header field the per-flow rules and the generator streams vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FlowType {
    #[serde(rename = "L2")]
    L2,
    #[default]
    #[serde(rename = "L3")]
    L3,
    /// One /16 source/destination subnet pair per flow.
    #[serde(rename = "L3-16")]
    L3Subnet,
    #[serde(rename = "L4-UDP")]
    L4Udp,
}

impl FlowType {
    pub fn name(&self) -> &'static str {
        match self {
            FlowType::L2 => "L2",
            FlowType::L3 => "L3",
            FlowType::L3Subnet => "L3-16",
            FlowType::L4Udp => "L4-UDP",
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FlowType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L2" => Ok(FlowType::L2),
            "L3" => Ok(FlowType::L3),
            "L3-16" => Ok(FlowType::L3Subnet),
            "L4-UDP" => Ok(FlowType::L4Udp),
            _ => Err(ConfigError::Unknown {
                kind: "flow type",
                value: s.to_string(),
            }),
        }
    }
}

/// How forwarding rules are installed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// One rule per flow, keyed by the configured [`FlowType`].
    #[default]
    Flows,
    /// A single `action=NORMAL` rule; the switch learns MACs.
    Normal,
    /// A single port-to-port redirect per direction.
    Port,
    /// Leave the flow table alone.
    None,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleType::Flows => "flows",
            RuleType::Normal => "NORMAL",
            RuleType::Port => "port",
            RuleType::None => "none",
        })
    }
}

impl FromStr for RuleType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flows" => Ok(RuleType::Flows),
            "normal" => Ok(RuleType::Normal),
            "port" => Ok(RuleType::Port),
            "none" => Ok(RuleType::None),
            _ => Err(ConfigError::Unknown {
                kind: "flow rule type",
                value: s.to_string(),
            }),
        }
    }
}

// ── Input (TOML / CLI overlay) ──────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SuiteConfigInput {
    pub dut: DutInput,
    pub vm: VmInput,
    pub tester: TesterInput,
    pub test: TestInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DutInput {
    pub address: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub bridge_name: Option<String>,
    pub physical_interface: Option<String>,
    pub physical_interface_pci: Option<String>,
    pub second_physical_interface: Option<String>,
    pub second_physical_interface_pci: Option<String>,
    pub virtual_interface: Option<String>,
    /// Gbit/s; 0 or absent means detect with ethtool.
    pub physical_speed_gbps: Option<u32>,
    pub pmd_rxq_affinity: Option<String>,
    pub create_bridge: Option<bool>,
    pub perf: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmInput {
    pub address: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub nic_pci: Option<String>,
    pub nic_queues: Option<u32>,
    pub nic_rxd: Option<u32>,
    pub nic_txd: Option<u32>,
    /// Seconds to wait after starting testpmd; 0 waits for it to come up.
    pub testpmd_startup_delay_s: Option<u64>,
    pub mac_swap: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TesterInput {
    pub address: Option<String>,
    pub interface: Option<String>,
    pub second_interface: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestInput {
    pub tests: Option<String>,
    pub packet_list: Option<String>,
    pub stream_list: Option<String>,
    pub run_time_s: Option<u64>,
    pub flow_type: Option<String>,
    pub flow_rule_type: Option<String>,
    pub traffic_rate: Option<f64>,
    pub zero_loss_step: Option<f64>,
    pub warm_up: Option<bool>,
    pub warm_up_timeout_s: Option<u64>,
    pub warm_up_no_fail: Option<bool>,
    pub no_cool_down: Option<bool>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub payload_packet_random: Option<bool>,
    pub tick_ms: Option<u64>,
}

// ── Resolved ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DutConfig {
    pub address: String,
    pub user: String,
    pub password: Option<String>,
    pub bridge_name: String,
    pub physical_interface: String,
    pub physical_interface_pci: Option<String>,
    pub second_physical_interface: Option<String>,
    pub second_physical_interface_pci: Option<String>,
    pub virtual_interface: String,
    /// `None` means detect from the NIC.
    pub physical_speed_gbps: Option<u32>,
    pub pmd_rxq_affinity: Option<String>,
    pub create_bridge: bool,
    pub perf: bool,
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub address: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub nic_pci: Option<String>,
    pub nic_queues: u32,
    pub nic_rxd: u32,
    pub nic_txd: u32,
    /// `None` waits for testpmd to settle instead of a fixed delay.
    pub testpmd_startup_delay_s: Option<u64>,
    pub mac_swap: bool,
}

#[derive(Debug, Clone)]
pub struct TesterConfig {
    pub address: Option<String>,
    pub interface: String,
    pub second_interface: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    pub tests: Vec<TestSelection>,
    pub packet_sizes: Vec<u32>,
    pub flow_counts: Vec<u32>,
    pub run_time_s: u64,
    pub flow_type: FlowType,
    pub rule_type: RuleType,
    pub traffic_rate: f64,
    pub zero_loss_step: f64,
    pub warm_up: bool,
    pub warm_up_timeout_s: u64,
    pub warm_up_no_fail: bool,
    pub no_cool_down: bool,
    pub src_mac: u64,
    pub dst_mac: u64,
    pub payload_packet_random: bool,
    pub tick: Duration,
}

#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub dut: DutConfig,
    pub vm: VmConfig,
    pub tester: TesterConfig,
    pub test: TestConfig,
}

impl SuiteConfig {
    pub fn needs_vm(&self) -> bool {
        self.test.tests.iter().any(|t| t.topology.needs_vm())
    }

    pub fn runs(&self, topology: Topology) -> bool {
        self.test.tests.iter().any(|t| t.topology == topology)
    }
}

impl SuiteConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(input)?)
    }

    pub fn resolve(self) -> Result<SuiteConfig, ConfigError> {
        let test = resolve_test(self.test)?;
        let needs_vm = test.tests.iter().any(|t| t.topology.needs_vm());
        let needs_p2p = test.tests.iter().any(|t| t.topology.needs_second_physical());
        let needs_tunnel = test.tests.iter().any(|t| t.topology.is_tunnel());

        // DUT
        let dut_in = self.dut;
        let address = required(dut_in.address, "dut.address")?;
        let physical_interface = required(dut_in.physical_interface, "dut.physical_interface")?;
        let virtual_interface = non_empty(dut_in.virtual_interface);
        if needs_vm && virtual_interface.is_none() {
            return Err(ConfigError::Missing("dut.virtual_interface"));
        }
        let second_physical_interface = non_empty(dut_in.second_physical_interface);
        if needs_p2p && second_physical_interface.is_none() {
            return Err(ConfigError::Missing("dut.second_physical_interface"));
        }
        let physical_speed_gbps = match dut_in.physical_speed_gbps.unwrap_or(0) {
            0 => None,
            speed @ 1..=1000 => Some(speed),
            speed => {
                return Err(ConfigError::OutOfRange {
                    name: "physical speed (Gbit/s)",
                    value: f64::from(speed),
                    min: 0.0,
                    max: 1000.0,
                })
            }
        };
        let physical_interface_pci = non_empty(dut_in.physical_interface_pci)
            .map(check_pci)
            .transpose()?;
        let second_physical_interface_pci = non_empty(dut_in.second_physical_interface_pci)
            .map(check_pci)
            .transpose()?;

        let dut = DutConfig {
            address,
            user: dut_in.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            password: dut_in.password,
            bridge_name: non_empty(dut_in.bridge_name)
                .unwrap_or_else(|| DEFAULT_BRIDGE_NAME.to_string()),
            physical_interface,
            physical_interface_pci,
            second_physical_interface,
            second_physical_interface_pci,
            virtual_interface: virtual_interface.unwrap_or_default(),
            physical_speed_gbps,
            pmd_rxq_affinity: non_empty(dut_in.pmd_rxq_affinity),
            create_bridge: dut_in.create_bridge.unwrap_or(false),
            perf: dut_in.perf.unwrap_or(false),
        };

        // VM
        let vm_in = self.vm;
        let vm_address = non_empty(vm_in.address);
        let nic_pci = non_empty(vm_in.nic_pci).map(check_pci).transpose()?;
        if needs_vm {
            if vm_address.is_none() {
                return Err(ConfigError::Missing("vm.address"));
            }
            if nic_pci.is_none() {
                return Err(ConfigError::Missing("vm.nic_pci"));
            }
        }
        let nic_queues = vm_in.nic_queues.unwrap_or(DEFAULT_VM_NIC_QUEUES);
        check_range("VM NIC queues", f64::from(nic_queues), 1.0, 63.0)?;
        let testpmd_startup_delay_s = match vm_in.testpmd_startup_delay_s.unwrap_or(0) {
            0 => None,
            delay => Some(delay),
        };
        if testpmd_startup_delay_s.is_none() && needs_vm && nic_queues < 2 {
            return Err(ConfigError::Conflict(
                "waiting for testpmd to settle needs at least 2 VM NIC queues; set vm.testpmd_startup_delay_s instead".into(),
            ));
        }
        let mac_swap = vm_in.mac_swap.unwrap_or(false);
        if test.rule_type == RuleType::Normal && !mac_swap {
            return Err(ConfigError::Conflict(
                "the NORMAL flow rule type requires vm.mac_swap".into(),
            ));
        }
        let vm = VmConfig {
            address: vm_address,
            user: vm_in.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            password: vm_in.password,
            nic_pci,
            nic_queues,
            nic_rxd: vm_in.nic_rxd.unwrap_or(DEFAULT_VM_NIC_DESCRIPTORS),
            nic_txd: vm_in.nic_txd.unwrap_or(DEFAULT_VM_NIC_DESCRIPTORS),
            testpmd_startup_delay_s,
            mac_swap,
        };

        // Tester
        let tester_in = self.tester;
        let interface = required(tester_in.interface, "tester.interface")?;
        let second_interface = non_empty(tester_in.second_interface);
        if needs_p2p && second_interface.is_none() {
            return Err(ConfigError::Missing("tester.second_interface"));
        }
        let tester = TesterConfig {
            address: non_empty(tester_in.address),
            interface,
            second_interface,
        };

        // Cross checks
        if dut.create_bridge && dut.physical_interface.contains("dpdk") {
            if dut.physical_interface_pci.is_none() {
                return Err(ConfigError::Missing("dut.physical_interface_pci"));
            }
            if needs_p2p && dut.second_physical_interface_pci.is_none() {
                return Err(ConfigError::Missing("dut.second_physical_interface_pci"));
            }
        }
        if needs_tunnel && test.tests.iter().any(|t| !t.topology.is_tunnel()) {
            // the physical port moves to the tunnel bridge
            return Err(ConfigError::Conflict(
                "tunnel tests cannot be combined with non-tunnel tests".into(),
            ));
        }
        if needs_tunnel {
            if test.flow_type != FlowType::L3 {
                return Err(ConfigError::Conflict(
                    "tunnel tests only support the L3 flow type".into(),
                ));
            }
            if let Some(&size) = test.packet_sizes.first() {
                if u64::from(size) < MIN_TUNNEL_PACKET_SIZE {
                    return Err(ConfigError::Conflict(format!(
                        "tunnel tests need packets of at least {MIN_TUNNEL_PACKET_SIZE} bytes, got {size}"
                    )));
                }
            }
        }

        Ok(SuiteConfig {
            dut,
            vm,
            tester,
            test,
        })
    }
}

fn resolve_test(input: TestInput) -> Result<TestConfig, ConfigError> {
    let tests = input
        .tests
        .as_deref()
        .unwrap_or(DEFAULT_TESTS)
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<TestSelection>, _>>()?;
    if tests.is_empty() {
        return Err(ConfigError::Missing("test.tests"));
    }

    let flow_type = match input.flow_type.as_deref() {
        Some(s) => s.parse()?,
        None => FlowType::default(),
    };
    let rule_type = match input.flow_rule_type.as_deref() {
        Some(s) => s.parse()?,
        None => RuleType::default(),
    };

    let packet_sizes = parse_ascending_list(
        "packet",
        input.packet_list.as_deref().unwrap_or(DEFAULT_PACKET_LIST),
        MIN_PACKET_SIZE,
        MAX_PACKET_SIZE,
    )?;
    let max_flows = match flow_type {
        FlowType::L4Udp => MAX_L4_FLOWS,
        FlowType::L3Subnet => 255,
        _ => MAX_FLOWS,
    };
    let flow_counts = parse_ascending_list(
        "stream",
        input.stream_list.as_deref().unwrap_or(DEFAULT_STREAM_LIST),
        1,
        max_flows,
    )?;

    let run_time_s = input.run_time_s.unwrap_or(DEFAULT_RUN_TIME_S);
    check_range("run time (s)", run_time_s as f64, 20.0, 3600.0)?;

    let traffic_rate = input.traffic_rate.unwrap_or(100.0);
    if !(traffic_rate > 0.001 && traffic_rate <= 100.0) {
        return Err(ConfigError::OutOfRange {
            name: "traffic rate (%)",
            value: traffic_rate,
            min: 0.001,
            max: 100.0,
        });
    }
    let zero_loss_step = input.zero_loss_step.unwrap_or(1.0);
    check_range("zero-loss step (%)", zero_loss_step, 0.001, 25.0)?;

    let warm_up = input.warm_up.unwrap_or(false);
    let warm_up_no_fail = input.warm_up_no_fail.unwrap_or(false);
    if warm_up && rule_type != RuleType::Flows && !warm_up_no_fail {
        return Err(ConfigError::Conflict(format!(
            "warm-up with the {rule_type} rule type cannot be verified; enable warm_up_no_fail"
        )));
    }

    let src_mac = parse_mac(input.src_mac.as_deref().unwrap_or(DEFAULT_SRC_MAC))?;
    let dst_mac = parse_mac(input.dst_mac.as_deref().unwrap_or(DEFAULT_DST_MAC))?;
    if flow_type == FlowType::L2 && (src_mac & 0xff_ffff != 0 || dst_mac & 0xff_ffff != 0) {
        return Err(ConfigError::Conflict(
            "L2 flows need base MAC addresses with the lower 24 bits zero".into(),
        ));
    }

    Ok(TestConfig {
        tests,
        packet_sizes,
        flow_counts,
        run_time_s,
        flow_type,
        rule_type,
        traffic_rate,
        zero_loss_step,
        warm_up,
        warm_up_timeout_s: input.warm_up_timeout_s.unwrap_or(DEFAULT_WARM_UP_TIMEOUT_S),
        warm_up_no_fail,
        no_cool_down: input.no_cool_down.unwrap_or(false),
        src_mac,
        dst_mac,
        payload_packet_random: input.payload_packet_random.unwrap_or(false),
        tick: Duration::from_millis(input.tick_ms.unwrap_or(1000)),
    })
}

// ── Helpers ─────────────────────────────────────────────────────────

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    non_empty(value).ok_or(ConfigError::Missing(name))
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value < min || value > max || value.is_nan() {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Parse a comma-separated list of strictly ascending integers in
/// `min..=max`.
pub fn parse_ascending_list(
    name: &'static str,
    value: &str,
    min: u64,
    max: u64,
) -> Result<Vec<u32>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidList {
        name,
        value: value.to_string(),
        reason,
    };

    let mut items: Vec<u32> = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        let n: u64 = part
            .parse()
            .map_err(|_| invalid(format!("\"{part}\" is not an integer")))?;
        if n < min || n > max {
            return Err(invalid(format!("{n} is outside [{min}..{max}]")));
        }
        if let Some(&last) = items.last() {
            if u64::from(last) >= n {
                return Err(invalid("values must be strictly ascending".into()));
            }
        }
        // max never exceeds u32 range for any list we accept
        items.push(u32::try_from(n).map_err(|_| invalid(format!("{n} is too large")))?);
    }
    Ok(items)
}

/// Parse `aa:bb:cc:dd:ee:ff` into its 48-bit value.
pub fn parse_mac(value: &str) -> Result<u64, ConfigError> {
    let octets: Vec<&str> = value.trim().split(':').collect();
    if octets.len() != 6 {
        return Err(ConfigError::InvalidMac(value.to_string()));
    }
    octets.iter().try_fold(0u64, |acc, octet| {
        if octet.len() != 2 {
            return Err(ConfigError::InvalidMac(value.to_string()));
        }
        u8::from_str_radix(octet, 16)
            .map(|b| (acc << 8) | u64::from(b))
            .map_err(|_| ConfigError::InvalidMac(value.to_string()))
    })
}

pub fn format_mac(mac: u64) -> String {
    let b = mac.to_be_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

/// Accept `DDDD:BB:DD.F`, optionally followed by `,txq_inline=N`.
pub fn check_pci(value: String) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidPci(value.clone());
    let (address, extra) = match value.split_once(',') {
        Some((address, extra)) => (address, Some(extra)),
        None => (value.as_str(), None),
    };

    let is_hex = |s: &str, len: usize| s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit());
    let mut parts = address.split(':');
    let (Some(domain), Some(bus), Some(rest), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let Some((device, function)) = rest.split_once('.') else {
        return Err(invalid());
    };
    if !(is_hex(domain, 4) && is_hex(bus, 2) && is_hex(device, 2) && is_hex(function, 1)) {
        return Err(invalid());
    }

    if let Some(extra) = extra {
        let valid = extra
            .strip_prefix("txq_inline=")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if !valid {
            return Err(invalid());
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> SuiteConfigInput {
        SuiteConfigInput::from_toml_str(
            r#"
            [dut]
            address = "10.0.0.2"
            physical_interface = "dpdk0"
            second_physical_interface = "dpdk1"
            virtual_interface = "vhost0"

            [vm]
            address = "10.0.0.3"
            nic_pci = "0000:00:06.0"

            [tester]
            interface = "3,0"
            second_interface = "3,1"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = minimal().resolve().unwrap();
        assert_eq!(cfg.dut.bridge_name, DEFAULT_BRIDGE_NAME);
        assert_eq!(cfg.test.packet_sizes, vec![64, 128, 256, 512, 768, 1024, 1514]);
        assert_eq!(cfg.test.flow_counts, vec![10, 1000, 10000, 100000, 1000000]);
        assert_eq!(cfg.test.run_time_s, 20);
        assert_eq!(cfg.test.flow_type, FlowType::L3);
        assert_eq!(cfg.test.rule_type, RuleType::Flows);
        assert_eq!(cfg.test.src_mac, 0x0000_0100_0000);
        assert_eq!(cfg.test.dst_mac, 0x0000_0200_0000);
        assert_eq!(cfg.vm.nic_queues, 2);
        assert_eq!(cfg.test.tick, Duration::from_secs(1));
        assert!(cfg.test.tests.iter().all(|t| !t.zero_loss));
    }

    #[test]
    fn empty_toml_is_default_input() {
        let input = SuiteConfigInput::from_toml_str("   \n").unwrap();
        assert!(matches!(
            input.resolve(),
            Err(ConfigError::Missing("dut.address"))
        ));
    }

    #[test]
    fn list_must_be_ascending_and_bounded() {
        assert_eq!(
            parse_ascending_list("packet", "64,128, 1514", 64, 9000).unwrap(),
            vec![64, 128, 1514]
        );
        assert!(parse_ascending_list("packet", "128,64", 64, 9000).is_err());
        assert!(parse_ascending_list("packet", "64,64", 64, 9000).is_err());
        assert!(parse_ascending_list("packet", "32", 64, 9000).is_err());
        assert!(parse_ascending_list("packet", "64,abc", 64, 9000).is_err());
    }

    #[test]
    fn l4_flow_count_is_capped() {
        let mut input = minimal();
        input.test.flow_type = Some("L4-UDP".into());
        input.test.stream_list = Some("10,70000".into());
        assert!(matches!(
            input.resolve(),
            Err(ConfigError::InvalidList { name: "stream", .. })
        ));
    }

    #[test]
    fn vm_topologies_need_vm_settings() {
        let mut input = minimal();
        input.vm.address = None;
        assert!(matches!(input.resolve(), Err(ConfigError::Missing("vm.address"))));

        let mut input = minimal();
        input.test.tests = Some("p".into());
        input.vm.address = None;
        input.dut.virtual_interface = None;
        assert!(input.resolve().is_ok());
    }

    #[test]
    fn p2p_needs_second_ports() {
        let mut input = minimal();
        input.test.tests = Some("p2p".into());
        input.dut.second_physical_interface = None;
        input.tester.second_interface = None;
        assert!(matches!(
            input.clone().resolve(),
            Err(ConfigError::Missing("dut.second_physical_interface"))
        ));
        input.dut.second_physical_interface = Some("dpdk1".into());
        assert!(matches!(
            input.resolve(),
            Err(ConfigError::Missing("tester.second_interface"))
        ));
    }

    #[test]
    fn warm_up_with_normal_rules_needs_no_fail() {
        let mut input = minimal();
        input.test.flow_rule_type = Some("NORMAL".into());
        input.vm.mac_swap = Some(true);
        input.test.warm_up = Some(true);
        assert!(matches!(input.clone().resolve(), Err(ConfigError::Conflict(_))));
        input.test.warm_up_no_fail = Some(true);
        assert!(input.resolve().is_ok());
    }

    #[test]
    fn normal_rules_need_mac_swap() {
        let mut input = minimal();
        input.test.flow_rule_type = Some("normal".into());
        assert!(matches!(input.resolve(), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn l2_base_macs_need_clear_low_bits() {
        let mut input = minimal();
        input.test.flow_type = Some("L2".into());
        input.test.dst_mac = Some("00:00:02:00:00:01".into());
        assert!(matches!(input.resolve(), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn tunnel_tests_need_l3_and_large_packets() {
        let mut input = minimal();
        input.test.tests = Some("vxlan-pv".into());
        assert!(matches!(input.clone().resolve(), Err(ConfigError::Conflict(_))));
        input.test.packet_list = Some("128,256".into());
        assert!(input.clone().resolve().is_ok());
        input.test.flow_type = Some("L2".into());
        assert!(matches!(input.resolve(), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn tunnel_tests_run_alone() {
        let mut input = minimal();
        input.test.tests = Some("vxlan-pvp,p2v".into());
        input.test.packet_list = Some("128".into());
        assert!(matches!(input.resolve(), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn creating_a_dpdk_bridge_needs_pci_addresses() {
        let mut input = minimal();
        input.dut.create_bridge = Some(true);
        assert!(matches!(
            input.clone().resolve(),
            Err(ConfigError::Missing("dut.physical_interface_pci"))
        ));
        input.dut.physical_interface_pci = Some("0000:3b:00.0".into());
        assert!(matches!(
            input.clone().resolve(),
            Err(ConfigError::Missing("dut.second_physical_interface_pci"))
        ));
        input.dut.second_physical_interface_pci = Some("0000:3b:00.1".into());
        assert!(input.resolve().unwrap().dut.create_bridge);
    }

    #[test]
    fn rates_and_run_time_are_bounded() {
        let mut input = minimal();
        input.test.run_time_s = Some(10);
        assert!(matches!(input.resolve(), Err(ConfigError::OutOfRange { .. })));

        let mut input = minimal();
        input.test.traffic_rate = Some(0.0);
        assert!(matches!(input.resolve(), Err(ConfigError::OutOfRange { .. })));

        let mut input = minimal();
        input.test.zero_loss_step = Some(30.0);
        assert!(matches!(input.resolve(), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn mac_round_trips_through_text() {
        let mac = parse_mac("00:00:02:AB:cd:01").unwrap();
        assert_eq!(mac, 0x0000_02ab_cd01);
        assert_eq!(format_mac(mac), "00:00:02:ab:cd:01");
        assert!(parse_mac("00:00:02:00:00").is_err());
        assert!(parse_mac("00:00:02:00:00:zz").is_err());
    }

    #[test]
    fn pci_addresses_are_validated() {
        assert!(check_pci("0000:00:06.0".into()).is_ok());
        assert!(check_pci("0000:3b:00.1,txq_inline=128".into()).is_ok());
        assert!(check_pci("00:06.0".into()).is_err());
        assert!(check_pci("0000:00:06.0,txq_inline=".into()).is_err());
        assert!(check_pci("0000:00:06".into()).is_err());
    }

    #[test]
    fn zero_loss_selection_is_parsed() {
        let mut input = minimal();
        input.test.tests = Some("p2v2p-zero, p".into());
        let cfg = input.resolve().unwrap();
        assert_eq!(cfg.test.tests.len(), 2);
        assert!(cfg.test.tests[0].zero_loss);
        assert!(cfg.runs(Topology::P));
        assert!(cfg.needs_vm());
    }
}
