//! Test topologies and the per-topology wiring plan.
//!
//! A [`Topology`] names the path traffic takes through the switch. Its
//! [`TopologyPlan`] is the table the runner drives: which ports the
//! rules connect, which switch ports are measured as hops, which tester
//! ports transmit and receive, what the VM does, and where the headline
//! rate comes from.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::config::{ConfigError, DutConfig, TesterConfig};

/// OpenFlow pseudo-port that sends a packet back out of its ingress port.
pub const IN_PORT: &str = "IN_PORT";

/// Port name OVS gives the VXLAN tunnel port on the main bridge.
pub const VXLAN_PORT: &str = "vxlan0";

/// Name of the tunnel termination bridge paired with `bridge`.
///
/// Linux interface names are limited to 15 characters.
pub fn tunnel_bridge_name(bridge: &str) -> String {
    format!("{bridge}_tterm").chars().take(15).collect()
}

// ── Topology ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Physical port loopback: in and out of the same physical port.
    P,
    /// Physical to physical.
    P2P,
    /// Physical to virtual, VM receives.
    P2V,
    /// Physical to virtual to physical, VM loops traffic back.
    P2V2P,
    /// VXLAN-encapsulated physical to virtual, VM receives.
    VxlanPV,
    /// VXLAN-encapsulated physical to virtual and back.
    VxlanPVP,
}

impl Topology {
    pub const ALL: [Topology; 6] = [
        Topology::P,
        Topology::P2P,
        Topology::P2V,
        Topology::P2V2P,
        Topology::VxlanPV,
        Topology::VxlanPVP,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Topology::P => "p",
            Topology::P2P => "p2p",
            Topology::P2V => "p2v",
            Topology::P2V2P => "p2v2p",
            Topology::VxlanPV => "vxlan-pv",
            Topology::VxlanPVP => "vxlan-pvp",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Topology::P => "Physical loopback",
            Topology::P2P => "Physical to Physical",
            Topology::P2V => "Physical to Virtual",
            Topology::P2V2P => "Physical to Virtual to Physical",
            Topology::VxlanPV => "VXLAN Physical to Virtual",
            Topology::VxlanPVP => "VXLAN Physical to Virtual to Physical",
        }
    }

    pub fn needs_vm(&self) -> bool {
        matches!(
            self,
            Topology::P2V | Topology::P2V2P | Topology::VxlanPV | Topology::VxlanPVP
        )
    }

    pub fn needs_second_physical(&self) -> bool {
        matches!(self, Topology::P2P)
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self, Topology::VxlanPV | Topology::VxlanPVP)
    }

    /// Build the wiring plan for this topology on the configured ports.
    pub fn plan(&self, dut: &DutConfig, tester: &TesterConfig) -> TopologyPlan {
        let bridge = dut.bridge_name.clone();
        let tunnel_bridge = tunnel_bridge_name(&bridge);
        let phys = dut.physical_interface.clone();
        let virt = dut.virtual_interface.clone();
        let tx = tester.interface.clone();

        let hop = |role, interface: &str, bridge: &str| Hop {
            role,
            interface: interface.to_string(),
            bridge: bridge.to_string(),
        };

        match self {
            Topology::P => TopologyPlan {
                topology: *self,
                rule_src: RuleEndpoint::Port(phys.clone()),
                rule_dst: RuleEndpoint::InPort,
                bidirectional: false,
                hops: vec![hop(HopRole::Physical, &phys, &bridge)],
                tx_port: tx.clone(),
                rx_port: Some(tx),
                vm_role: None,
                result_source: ResultSource::GeneratorRx,
                warm_up_supported: true,
                tunnel_bridge: None,
            },
            Topology::P2P => {
                let second = dut.second_physical_interface.clone().unwrap_or_default();
                TopologyPlan {
                    topology: *self,
                    rule_src: RuleEndpoint::Port(phys.clone()),
                    rule_dst: RuleEndpoint::Port(second.clone()),
                    bidirectional: false,
                    hops: vec![
                        hop(HopRole::Physical, &phys, &bridge),
                        hop(HopRole::SecondPhysical, &second, &bridge),
                    ],
                    tx_port: tx,
                    rx_port: tester.second_interface.clone(),
                    vm_role: None,
                    result_source: ResultSource::GeneratorRx,
                    warm_up_supported: true,
                    tunnel_bridge: None,
                }
            }
            Topology::P2V => TopologyPlan {
                topology: *self,
                rule_src: RuleEndpoint::Port(phys.clone()),
                rule_dst: RuleEndpoint::Port(virt.clone()),
                bidirectional: false,
                hops: vec![
                    hop(HopRole::Physical, &phys, &bridge),
                    hop(HopRole::Virtual, &virt, &bridge),
                ],
                tx_port: tx,
                rx_port: None,
                vm_role: Some(VmRole::Receiver),
                result_source: ResultSource::VmRx,
                warm_up_supported: true,
                tunnel_bridge: None,
            },
            Topology::P2V2P => TopologyPlan {
                topology: *self,
                rule_src: RuleEndpoint::Port(phys.clone()),
                rule_dst: RuleEndpoint::Port(virt.clone()),
                bidirectional: true,
                hops: vec![
                    hop(HopRole::Physical, &phys, &bridge),
                    hop(HopRole::Virtual, &virt, &bridge),
                ],
                tx_port: tx.clone(),
                rx_port: Some(tx),
                vm_role: Some(VmRole::Loopback),
                result_source: ResultSource::GeneratorRx,
                warm_up_supported: true,
                tunnel_bridge: None,
            },
            Topology::VxlanPV | Topology::VxlanPVP => {
                let pvp = *self == Topology::VxlanPVP;
                TopologyPlan {
                    topology: *self,
                    rule_src: RuleEndpoint::Port(VXLAN_PORT.to_string()),
                    rule_dst: RuleEndpoint::Port(virt.clone()),
                    bidirectional: pvp,
                    hops: vec![
                        hop(HopRole::TunnelPhysical, &phys, &tunnel_bridge),
                        hop(HopRole::Virtual, &virt, &bridge),
                    ],
                    tx_port: tx.clone(),
                    rx_port: pvp.then_some(tx),
                    vm_role: Some(if pvp {
                        VmRole::Loopback
                    } else {
                        VmRole::Receiver
                    }),
                    result_source: if pvp {
                        ResultSource::GeneratorRx
                    } else {
                        ResultSource::VmRx
                    },
                    warm_up_supported: false,
                    tunnel_bridge: Some(tunnel_bridge),
                }
            }
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topology::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::Unknown {
                kind: "test",
                value: s.to_string(),
            })
    }
}

/// One entry of the `--tests` list: a topology plus whether to run the
/// zero-loss search instead of a fixed offered load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestSelection {
    pub topology: Topology,
    pub zero_loss: bool,
}

impl fmt::Display for TestSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zero_loss {
            write!(f, "{}-zero", self.topology)
        } else {
            write!(f, "{}", self.topology)
        }
    }
}

impl FromStr for TestSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_suffix("-zero") {
            Some(base) => Ok(Self {
                topology: base.parse()?,
                zero_loss: true,
            }),
            None => Ok(Self {
                topology: s.parse()?,
                zero_loss: false,
            }),
        }
    }
}

// ── Plan ────────────────────────────────────────────────────────────

/// Source or destination of the programmed rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RuleEndpoint {
    /// A named switch interface, resolved to its OpenFlow port number.
    Port(String),
    /// Send back out of the ingress port.
    InPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopRole {
    Physical,
    SecondPhysical,
    Virtual,
    TunnelPhysical,
}

/// A switch port whose counters are measured for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hop {
    pub role: HopRole,
    pub interface: String,
    pub bridge: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmRole {
    /// Counts received packets only.
    Receiver,
    /// Forwards everything back out of the same interface.
    Loopback,
}

/// Where a run's headline throughput comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    GeneratorRx,
    VmRx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub topology: Topology,
    pub rule_src: RuleEndpoint,
    pub rule_dst: RuleEndpoint,
    pub bidirectional: bool,
    pub hops: Vec<Hop>,
    pub tx_port: String,
    pub rx_port: Option<String>,
    pub vm_role: Option<VmRole>,
    pub result_source: ResultSource,
    pub warm_up_supported: bool,
    pub tunnel_bridge: Option<String>,
}

impl TopologyPlan {
    /// Datapath flows expected once every stream has been seen.
    pub fn expected_datapath_flows(&self, flows: u32) -> u64 {
        let flows = u64::from(flows);
        if self.bidirectional {
            flows * 2
        } else {
            flows
        }
    }

    pub fn hop(&self, role: HopRole) -> Option<&Hop> {
        self.hops.iter().find(|h| h.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfigInput;

    fn config() -> crate::config::SuiteConfig {
        let input = SuiteConfigInput::from_toml_str(
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
            interface = "0,0"
            second_interface = "0,1"
            "#,
        )
        .unwrap();
        input.resolve().unwrap()
    }

    #[test]
    fn parses_test_selections() {
        let sel: TestSelection = "p2v2p-zero".parse().unwrap();
        assert_eq!(sel.topology, Topology::P2V2P);
        assert!(sel.zero_loss);

        let sel: TestSelection = "vxlan-pv".parse().unwrap();
        assert_eq!(sel.topology, Topology::VxlanPV);
        assert!(!sel.zero_loss);
        assert_eq!(sel.to_string(), "vxlan-pv");

        assert!("v2v".parse::<TestSelection>().is_err());
    }

    #[test]
    fn tunnel_bridge_name_is_truncated() {
        assert_eq!(tunnel_bridge_name("br0"), "br0_tterm");
        assert_eq!(tunnel_bridge_name("ovs_pvp_br0"), "ovs_pvp_br0_tte");
    }

    #[test]
    fn loopback_sends_back_out_of_ingress() {
        let cfg = config();
        let plan = Topology::P.plan(&cfg.dut, &cfg.tester);
        assert_eq!(plan.rule_dst, RuleEndpoint::InPort);
        assert_eq!(plan.rx_port.as_deref(), Some("0,0"));
        assert_eq!(plan.hops.len(), 1);
        assert_eq!(plan.expected_datapath_flows(100), 100);
    }

    #[test]
    fn p2v2p_is_bidirectional_with_loopback_vm() {
        let cfg = config();
        let plan = Topology::P2V2P.plan(&cfg.dut, &cfg.tester);
        assert!(plan.bidirectional);
        assert_eq!(plan.vm_role, Some(VmRole::Loopback));
        assert_eq!(plan.result_source, ResultSource::GeneratorRx);
        assert_eq!(plan.expected_datapath_flows(100), 200);
    }

    #[test]
    fn p2p_receives_on_second_tester_port() {
        let cfg = config();
        let plan = Topology::P2P.plan(&cfg.dut, &cfg.tester);
        assert_eq!(plan.rule_dst, RuleEndpoint::Port("dpdk1".into()));
        assert_eq!(plan.rx_port.as_deref(), Some("0,1"));
        assert!(plan.vm_role.is_none());
    }

    #[test]
    fn vxlan_measures_physical_port_on_tunnel_bridge() {
        let cfg = config();
        let plan = Topology::VxlanPV.plan(&cfg.dut, &cfg.tester);
        let phys = plan.hop(HopRole::TunnelPhysical).unwrap();
        assert_eq!(phys.bridge, "ovs_pvp_br0_tte");
        assert_eq!(plan.rule_src, RuleEndpoint::Port(VXLAN_PORT.into()));
        assert_eq!(plan.result_source, ResultSource::VmRx);
        assert!(!plan.warm_up_supported);
        assert!(plan.rx_port.is_none());

        let pvp = Topology::VxlanPVP.plan(&cfg.dut, &cfg.tester);
        assert!(pvp.bidirectional);
        assert_eq!(pvp.result_source, ResultSource::GeneratorRx);
    }
}
