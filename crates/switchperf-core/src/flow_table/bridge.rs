//! Test bridge provisioning.
//!
//! The bridge (and, for tunnel topologies, its tunnel termination bridge)
//! is deleted and recreated in one `ovs-vsctl` transaction with fixed
//! OpenFlow port numbers.

use super::FlowTableError;
use crate::config::SuiteConfig;
use crate::remote::RemoteExecutor;
use crate::topology::{tunnel_bridge_name, VXLAN_PORT};

pub const PHYSICAL_OFPORT: u32 = 10;
pub const SECOND_PHYSICAL_OFPORT: u32 = 11;
pub const VIRTUAL_OFPORT: u32 = 20;
pub const VXLAN_OFPORT: u32 = 30;

/// Far tunnel endpoint as seen from the DUT.
pub const TUNNEL_REMOTE_IP: &str = "3.1.1.2";
pub const TUNNEL_LOCAL_CIDR: &str = "3.1.1.1/24";
pub const TUNNEL_KEY: u32 = 69;

#[derive(Debug, Clone)]
struct PortPlan {
    bridge: String,
    interface: String,
    ofport: u32,
    kind: Option<&'static str>,
    options: Vec<String>,
}

/// Everything needed to build the test bridges from scratch.
#[derive(Debug, Clone)]
pub struct BridgePlan {
    bridge: String,
    tunnel_bridge: Option<String>,
    netdev: bool,
    ports: Vec<PortPlan>,
}

impl BridgePlan {
    pub fn from_config(cfg: &SuiteConfig) -> Self {
        let dut = &cfg.dut;
        let netdev = dut.physical_interface.contains("dpdk");
        let tunnel = cfg.test.tests.iter().any(|t| t.topology.is_tunnel());
        let bridge = dut.bridge_name.clone();
        let tunnel_bridge = tunnel.then(|| tunnel_bridge_name(&bridge));

        let affinity = dut.pmd_rxq_affinity.as_ref().map(|affinity| {
            vec![
                format!("options:n_rxq={}", affinity.matches(':').count()),
                format!("other_config:pmd-rxq-affinity={affinity}"),
            ]
        });
        let port = |bridge: &str, interface: &str, ofport, kind, pci: Option<&String>| {
            let mut options = Vec::new();
            if netdev {
                options.extend(affinity.iter().flatten().cloned());
                if let Some(pci) = pci {
                    options.push(format!("options:dpdk-devargs={pci}"));
                }
            }
            PortPlan {
                bridge: bridge.to_string(),
                interface: interface.to_string(),
                ofport,
                kind: netdev.then_some(kind),
                options,
            }
        };

        let mut ports = Vec::new();
        // the physical port sits on the tunnel bridge when tunnelling
        let phys_bridge = tunnel_bridge.as_deref().unwrap_or(&bridge);
        ports.push(port(
            phys_bridge,
            &dut.physical_interface,
            PHYSICAL_OFPORT,
            "dpdk",
            dut.physical_interface_pci.as_ref(),
        ));
        if let Some(second) = dut
            .second_physical_interface
            .as_deref()
            .filter(|_| cfg.test.tests.iter().any(|t| t.topology.needs_second_physical()))
        {
            ports.push(port(
                &bridge,
                second,
                SECOND_PHYSICAL_OFPORT,
                "dpdk",
                dut.second_physical_interface_pci.as_ref(),
            ));
        }
        if !dut.virtual_interface.is_empty() {
            ports.push(port(
                &bridge,
                &dut.virtual_interface,
                VIRTUAL_OFPORT,
                "dpdkvhostuser",
                None,
            ));
        }
        if tunnel {
            ports.push(PortPlan {
                bridge: bridge.clone(),
                interface: VXLAN_PORT.to_string(),
                ofport: VXLAN_OFPORT,
                kind: Some("vxlan"),
                options: vec![
                    format!("options:remote_ip={TUNNEL_REMOTE_IP}"),
                    format!("options:key={TUNNEL_KEY}"),
                ],
            });
        }

        Self {
            bridge,
            tunnel_bridge,
            netdev,
            ports,
        }
    }

    fn bridges(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.bridge.as_str()).chain(self.tunnel_bridge.as_deref())
    }

    /// `ovs-vsctl` command removing any previous incarnation.
    pub fn teardown_command(&self) -> String {
        let mut cmd = String::from("ovs-vsctl");
        for bridge in self.bridges() {
            cmd.push_str(&format!(" -- --if-exists del-br {bridge}"));
        }
        cmd
    }

    /// `ovs-vsctl` transaction creating bridges and ports.
    pub fn create_command(&self) -> String {
        let mut cmd = String::from("ovs-vsctl");
        for bridge in self.bridges() {
            cmd.push_str(&format!(" -- add-br {bridge}"));
            if self.netdev {
                cmd.push_str(&format!(" -- set Bridge {bridge} datapath_type=netdev"));
            }
        }
        for port in &self.ports {
            cmd.push_str(&format!(
                " -- add-port {} {} -- set Interface {} ofport_request={}",
                port.bridge, port.interface, port.interface, port.ofport
            ));
            if let Some(kind) = port.kind {
                cmd.push_str(&format!(" type={kind}"));
            }
            for option in &port.options {
                cmd.push(' ');
                cmd.push_str(option);
            }
        }
        cmd
    }

    pub fn provision(&self, dut: &dyn RemoteExecutor) -> Result<(), FlowTableError> {
        tracing::info!(bridge = %self.bridge, tunnel_bridge = ?self.tunnel_bridge, netdev = self.netdev, "configuring bridge");
        dut.execute_checked(&self.teardown_command())?;
        dut.execute_checked(&self.create_command())?;
        if self.netdev && self.ports.iter().any(|p| p.kind == Some("dpdkvhostuser")) {
            tracing::warn!("bridge recreated with vhost-user ports; the VM may need a restart to reconnect");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfigInput;

    fn config(extra: &str) -> SuiteConfig {
        let toml = format!(
            r#"
            [dut]
            address = "10.0.0.2"
            physical_interface = "dpdk0"
            physical_interface_pci = "0000:3b:00.0"
            second_physical_interface = "dpdk1"
            second_physical_interface_pci = "0000:3b:00.1"
            virtual_interface = "vhost0"
            pmd_rxq_affinity = "0:3,1:4"

            [vm]
            address = "10.0.0.3"
            nic_pci = "0000:00:06.0"

            [tester]
            interface = "0,0"
            second_interface = "0,1"

            [test]
            packet_list = "128"
            {extra}
            "#
        );
        SuiteConfigInput::from_toml_str(&toml).unwrap().resolve().unwrap()
    }

    #[test]
    fn dpdk_bridge_gets_types_affinity_and_devargs() {
        let plan = BridgePlan::from_config(&config(r#"tests = "p2p,p2v""#));
        let cmd = plan.create_command();
        assert!(cmd.contains("add-br ovs_pvp_br0 -- set Bridge ovs_pvp_br0 datapath_type=netdev"));
        assert!(cmd.contains(
            "add-port ovs_pvp_br0 dpdk0 -- set Interface dpdk0 ofport_request=10 type=dpdk options:n_rxq=2 other_config:pmd-rxq-affinity=0:3,1:4 options:dpdk-devargs=0000:3b:00.0"
        ));
        assert!(cmd.contains("set Interface dpdk1 ofport_request=11 type=dpdk"));
        assert!(cmd.contains("set Interface vhost0 ofport_request=20 type=dpdkvhostuser"));
        assert!(!cmd.contains("vxlan0"));
        assert_eq!(
            plan.teardown_command(),
            "ovs-vsctl -- --if-exists del-br ovs_pvp_br0"
        );
    }

    #[test]
    fn tunnel_plan_adds_termination_bridge_and_vxlan_port() {
        let plan = BridgePlan::from_config(&config(r#"tests = "vxlan-pvp""#));
        let cmd = plan.create_command();
        assert!(cmd.contains("add-br ovs_pvp_br0_tte"));
        assert!(cmd.contains("add-port ovs_pvp_br0_tte dpdk0"));
        assert!(cmd.contains(
            "add-port ovs_pvp_br0 vxlan0 -- set Interface vxlan0 ofport_request=30 type=vxlan options:remote_ip=3.1.1.2 options:key=69"
        ));
        // the second physical port is only needed for p2p
        assert!(!cmd.contains("dpdk1"));
        assert!(plan.teardown_command().ends_with("del-br ovs_pvp_br0_tte"));
    }
}
