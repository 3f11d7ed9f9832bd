//! OpenFlow rule text for `ovs-ofctl add-flow <bridge> -`.

use std::net::Ipv4Addr;

use crate::config::{format_mac, FlowType};

const IPV4_SRC_BASE: u32 = 0x0100_0000;
const IPV4_DST_OFFSET: u32 = 0x0100_0000;

/// Header field a per-flow rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMatch {
    /// `dl_dst` counting up from a base MAC.
    MacRange,
    /// `nw_src` from 1.0.0.0 up, `nw_dst` the same address in 2.0.0.0/8.
    Ipv4Range,
    /// `1.i.0.0/16` to `2.i.0.0/16`.
    Ipv4Subnet,
    /// `udp_src = udp_dst = i`.
    UdpPortRange,
}

impl FlowMatch {
    pub fn for_flow_type(flow_type: FlowType) -> Self {
        match flow_type {
            FlowType::L2 => FlowMatch::MacRange,
            FlowType::L3 => FlowMatch::Ipv4Range,
            FlowType::L3Subnet => FlowMatch::Ipv4Subnet,
            FlowType::L4Udp => FlowMatch::UdpPortRange,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowMatch::MacRange => "L2",
            FlowMatch::Ipv4Range => "L3",
            FlowMatch::Ipv4Subnet => "L3 /16",
            FlowMatch::UdpPortRange => "L4",
        }
    }

    pub fn max_flows(&self) -> u32 {
        match self {
            FlowMatch::MacRange => 1 << 24,
            FlowMatch::Ipv4Range | FlowMatch::UdpPortRange => 1_000_000,
            FlowMatch::Ipv4Subnet => 255,
        }
    }
}

/// One direction of per-flow rules between two OpenFlow ports.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub matcher: FlowMatch,
    pub flows: u32,
    pub in_port: String,
    pub out_port: String,
    /// Only used by [`FlowMatch::MacRange`]; the low 24 bits are ignored.
    pub base_mac: u64,
}

impl RuleSet {
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.flows).map(move |i| self.line(i))
    }

    /// All rules as one newline-terminated batch.
    pub fn to_batch(&self) -> String {
        let mut batch = String::new();
        for line in self.lines() {
            batch.push_str(&line);
            batch.push('\n');
        }
        batch
    }

    fn line(&self, i: u32) -> String {
        let (in_port, out_port) = (&self.in_port, &self.out_port);
        match self.matcher {
            FlowMatch::MacRange => {
                let mac = (self.base_mac & 0xffff_ff00_0000) + u64::from(i);
                format!(
                    "add in_port={in_port},dl_dst={},action={out_port}",
                    format_mac(mac)
                )
            }
            FlowMatch::Ipv4Range => {
                let src = IPV4_SRC_BASE.wrapping_add(i);
                let dst = src.wrapping_add(IPV4_DST_OFFSET);
                format!(
                    "add in_port={in_port},ip,nw_src={},nw_dst={},action={out_port}",
                    Ipv4Addr::from(src),
                    Ipv4Addr::from(dst)
                )
            }
            FlowMatch::Ipv4Subnet => format!(
                "add in_port={in_port},ip,nw_src=1.{i}.0.0/16,nw_dst=2.{i}.0.0/16,action={out_port}"
            ),
            FlowMatch::UdpPortRange => {
                format!("add in_port={in_port},udp,udp_src={i},udp_dst={i},action={out_port}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(matcher: FlowMatch, flows: u32) -> RuleSet {
        RuleSet {
            matcher,
            flows,
            in_port: "10".into(),
            out_port: "20".into(),
            base_mac: 0x0000_0200_0000,
        }
    }

    #[test]
    fn mac_rules_count_up_from_base() {
        let lines: Vec<_> = rules(FlowMatch::MacRange, 3).lines().collect();
        assert_eq!(
            lines,
            vec![
                "add in_port=10,dl_dst=00:00:02:00:00:00,action=20",
                "add in_port=10,dl_dst=00:00:02:00:00:01,action=20",
                "add in_port=10,dl_dst=00:00:02:00:00:02,action=20",
            ]
        );
    }

    #[test]
    fn mac_base_ignores_low_bits() {
        let mut set = rules(FlowMatch::MacRange, 1);
        set.base_mac = 0x0000_0200_1234;
        assert_eq!(
            set.lines().next().unwrap(),
            "add in_port=10,dl_dst=00:00:02:00:00:00,action=20"
        );
    }

    #[test]
    fn ipv4_rules_pair_source_and_destination() {
        let set = rules(FlowMatch::Ipv4Range, 300);
        let lines: Vec<_> = set.lines().collect();
        assert_eq!(
            lines[0],
            "add in_port=10,ip,nw_src=1.0.0.0,nw_dst=2.0.0.0,action=20"
        );
        assert_eq!(
            lines[299],
            "add in_port=10,ip,nw_src=1.0.1.43,nw_dst=2.0.1.43,action=20"
        );
    }

    #[test]
    fn subnet_and_udp_rules() {
        let subnet: Vec<_> = rules(FlowMatch::Ipv4Subnet, 2).lines().collect();
        assert_eq!(
            subnet[1],
            "add in_port=10,ip,nw_src=1.1.0.0/16,nw_dst=2.1.0.0/16,action=20"
        );

        let udp: Vec<_> = rules(FlowMatch::UdpPortRange, 2).lines().collect();
        assert_eq!(udp[1], "add in_port=10,udp,udp_src=1,udp_dst=1,action=20");
    }

    #[test]
    fn batch_has_one_line_per_flow() {
        let batch = rules(FlowMatch::UdpPortRange, 100).to_batch();
        assert_eq!(batch.lines().count(), 100);
        assert!(batch.ends_with('\n'));
    }
}
