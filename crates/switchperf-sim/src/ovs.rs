//! Simulated device under test: answers the `ovs-*`, monitoring and
//! tunnel commands the orchestrator issues, backed by [`SimWorld`].

use std::fmt::Write as _;

use switchperf_core::config::format_mac;
use switchperf_core::flow_table::DatapathKind;
use switchperf_core::remote::{CommandOutput, RemoteError, RemoteExecutor};
use switchperf_core::stats::{CPU_SYSTEM_REPORT, CPU_THREAD_REPORT};

use crate::profile::Fault;
use crate::world::{Host, Monitor, PortCounters, SimBridge, SimPort, SimRule, SimWorld};
use crate::{lock, SharedWorld};

/// Exit status of a command the simulated shell does not know.
pub const COMMAND_NOT_FOUND: i32 = 127;

const BRIDGE_MAC_BASE: u64 = 0x001b_21a6_0000;
const CPUS: u32 = 4;

/// Shell on the simulated DUT.
#[derive(Clone)]
pub struct SimDut {
    world: SharedWorld,
}

impl SimDut {
    pub(crate) fn new(world: SharedWorld) -> Self {
        Self { world }
    }
}

impl RemoteExecutor for SimDut {
    fn run(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, RemoteError> {
        let mut world = lock(&self.world);
        world.log_command(Host::Dut, command);
        if let Some(failure) = injected_failure(&world, command) {
            return Ok(failure);
        }
        Ok(interpret(&mut world, command.trim(), input))
    }
}

pub(crate) fn injected_failure(world: &SimWorld, command: &str) -> Option<CommandOutput> {
    world
        .has_fault(|f| matches!(f, Fault::FailCommand(pattern) if command.contains(pattern.as_str())))
        .then(|| CommandOutput::failed(1, "simulated failure"))
}

fn interpret(world: &mut SimWorld, command: &str, input: Option<&str>) -> CommandOutput {
    let words: Vec<&str> = command.split_whitespace().collect();
    match words.as_slice() {
        ["ovs-vsctl", "get", "Open_vSwitch", ".", "other_config:hw-offload"] => {
            if world.profile.tc_offload {
                CommandOutput::ok("\"true\"\n")
            } else {
                CommandOutput::failed(
                    1,
                    "ovs-vsctl: no key \"hw-offload\" in Open_vSwitch record \".\" column other_config",
                )
            }
        }
        ["ovs-vsctl", "--", ..] => vsctl(world, command),
        ["ovs-ofctl", "del-flows", bridge] => with_bridge(world, bridge, |b| {
            b.rules.clear();
            String::new()
        }),
        ["ovs-ofctl", "add-flow", bridge, "-"] => {
            let mut rules: Vec<SimRule> = input
                .unwrap_or("")
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(SimRule::parse)
                .collect();
            if world.has_fault(|f| *f == Fault::DropRule) {
                rules.pop();
            }
            with_bridge(world, bridge, |b| {
                b.rules.extend(rules);
                String::new()
            })
        }
        ["ovs-ofctl", "add-flow", bridge, rule] => {
            let rule = SimRule::parse(rule);
            with_bridge(world, bridge, |b| {
                b.rules.push(rule);
                String::new()
            })
        }
        ["ovs-ofctl", "dump-flows", bridge] => with_bridge(world, bridge, |b| {
            let mut out = String::from("NXST_FLOW reply (xid=0x4):\n");
            for rule in &b.rules {
                let _ = writeln!(out, " cookie=0x0, table=0, n_packets=0, n_bytes=0, {}", rule.text);
            }
            out
        }),
        ["ovs-ofctl", "dump-ports", bridge, of_port] => dump_ports(world, bridge, of_port),
        ["ovs-ofctl", "show", bridge] => show(world, bridge),
        ["ovs-appctl", "fdb/flush", bridge] => with_bridge(world, bridge, |_| {
            "table successfully flushed\n".to_string()
        }),
        ["ovs-appctl", "dpif/show"] => dpif_show(world),
        ["ovs-appctl", "dpctl/show", dp] if *dp == world.datapath.dpctl_name() => {
            CommandOutput::ok(format!(
                "{dp}:\n  lookups: hit:0 missed:0 lost:0\n  flows: {}\n",
                reported_flows(world)
            ))
        }
        ["ovs-appctl", "dpctl/dump-flows", dp] if *dp == world.datapath.dpctl_name() => {
            let mut out = String::new();
            for i in 0..reported_flows(world) {
                let _ = writeln!(
                    out,
                    "ufid:{i:08x}, in_port(1),eth_type(0x0800),ipv4(frag=no), packets:0, bytes:0, used:never, offloaded:yes, dp:tc, actions:2"
                );
            }
            CommandOutput::ok(out)
        }
        ["ovs-appctl", "dpctl/show" | "dpctl/dump-flows", dp] => {
            CommandOutput::failed(2, format!("ovs-vswitchd: no datapath named {dp}"))
        }
        ["ovs-appctl", "tnl/neigh/set", bridge, _, _] => with_bridge(world, bridge, |_| "OK\n".to_string()),
        ["ip", "addr", "replace", _, "dev", bridge, ..] => {
            with_bridge(world, bridge, |_| String::new())
        }
        ["ethtool", interface] => {
            if world.ports.iter().any(|p| p.interface == *interface) {
                let mbps = world.profile.line_bps / 1_000_000;
                CommandOutput::ok(format!(
                    "Settings for {interface}:\n\tSpeed: {mbps}Mb/s\n\tDuplex: Full\n\tLink detected: yes\n"
                ))
            } else {
                CommandOutput::failed(75, format!("netlink error: no device matches name ({interface})"))
            }
        }
        ["kill", "-SIGINT", "$(pidof", "pidstat)", "$(pidof", "mpstat)"] => match world.monitor.take() {
            Some(monitor) => {
                world.thread_report = Some(thread_report(world.datapath, monitor));
                world.system_report = Some(system_report(monitor));
                CommandOutput::ok("")
            }
            None => CommandOutput::failed(1, "kill: usage: kill [-s sigspec | -n signum | -sigspec] pid"),
        },
        ["kill", "-SIGINT", "$(pidof", "perf)"] => {
            if std::mem::take(&mut world.perf_running) {
                CommandOutput::ok("")
            } else {
                CommandOutput::failed(1, "kill: usage: kill [-s sigspec | -n signum | -sigspec] pid")
            }
        }
        ["cat", path] if *path == CPU_THREAD_REPORT => report(world.thread_report.as_deref(), path),
        ["cat", path] if *path == CPU_SYSTEM_REPORT => report(world.system_report.as_deref(), path),
        ["sh", "-c", ..] if command.contains("pidstat") && command.contains("mpstat") => {
            world.monitor = Some(Monitor::default());
            world.thread_report = None;
            world.system_report = None;
            CommandOutput::ok("")
        }
        ["sh", "-c", ..] if command.contains("perf record") => {
            world.perf_running = true;
            CommandOutput::ok("")
        }
        _ => CommandOutput::failed(COMMAND_NOT_FOUND, format!("sh: {command}: command not found")),
    }
}

fn with_bridge(world: &mut SimWorld, bridge: &str, f: impl FnOnce(&mut SimBridge) -> String) -> CommandOutput {
    match world.bridges.get_mut(bridge) {
        Some(b) => CommandOutput::ok(f(b)),
        None => CommandOutput::failed(1, format!("ovs-ofctl: {bridge} is not a bridge or a socket")),
    }
}

fn report(contents: Option<&str>, path: &str) -> CommandOutput {
    match contents {
        Some(contents) => CommandOutput::ok(contents),
        None => CommandOutput::failed(1, format!("cat: {path}: No such file or directory")),
    }
}

fn reported_flows(world: &SimWorld) -> u64 {
    world
        .faults
        .iter()
        .find_map(|f| match f {
            Fault::StuckDatapathFlows(n) => Some(*n),
            _ => None,
        })
        .unwrap_or(world.datapath_flows)
}

// ── ovs-vsctl ───────────────────────────────────────────────────────

/// Apply an `ovs-vsctl -- a -- b ...` transaction. Nothing is applied
/// unless every clause is understood.
pub(crate) fn vsctl(world: &mut SimWorld, command: &str) -> CommandOutput {
    let clauses: Vec<Vec<&str>> = command
        .split(" -- ")
        .skip(1)
        .map(|clause| clause.split_whitespace().collect())
        .collect();

    let mut staged_bridges = world.bridges.clone();
    let mut staged_ports = world.ports.clone();
    for clause in &clauses {
        match clause.as_slice() {
            ["--if-exists", "del-br", bridge] => {
                staged_bridges.remove(*bridge);
                staged_ports.retain(|p| p.bridge != *bridge);
            }
            ["add-br", bridge] => {
                if staged_bridges.contains_key(*bridge) {
                    return CommandOutput::failed(1, format!("ovs-vsctl: cannot create a bridge named {bridge} because a bridge named {bridge} already exists"));
                }
                let mac = BRIDGE_MAC_BASE + staged_bridges.len() as u64 + 1;
                staged_bridges.insert(
                    bridge.to_string(),
                    SimBridge {
                        mac,
                        rules: vec![SimRule::parse("actions=NORMAL")],
                    },
                );
            }
            ["set", "Bridge", _, "datapath_type=netdev"] => {}
            ["add-port", bridge, interface] => {
                if !staged_bridges.contains_key(*bridge) {
                    return CommandOutput::failed(1, format!("ovs-vsctl: no bridge named {bridge}"));
                }
                let next = staged_ports
                    .iter()
                    .filter(|p| p.bridge == *bridge)
                    .map(|p| p.of_port)
                    .max()
                    .unwrap_or(0)
                    + 1;
                staged_ports.push(SimPort {
                    interface: interface.to_string(),
                    bridge: bridge.to_string(),
                    of_port: next,
                    kind: world.port_kind(interface),
                    counters: PortCounters::default(),
                });
            }
            ["set", "Interface", interface, settings @ ..] => {
                let Some(port) = staged_ports.iter_mut().find(|p| p.interface == *interface) else {
                    return CommandOutput::failed(1, format!("ovs-vsctl: no row \"{interface}\" in table Interface"));
                };
                for setting in settings {
                    if let Some(n) = setting.strip_prefix("ofport_request=") {
                        match n.parse() {
                            Ok(n) => port.of_port = n,
                            Err(_) => {
                                return CommandOutput::failed(1, format!("ovs-vsctl: invalid ofport_request {n}"))
                            }
                        }
                    }
                }
            }
            other => {
                return CommandOutput::failed(1, format!("ovs-vsctl: unknown command '{}'", other.join(" ")));
            }
        }
    }

    world.bridges = staged_bridges;
    world.ports = staged_ports;
    tracing::debug!(bridges = world.bridges.len(), ports = world.ports.len(), "bridges reconfigured");
    CommandOutput::ok("")
}

// ── Reports ─────────────────────────────────────────────────────────

fn dump_ports(world: &SimWorld, bridge: &str, of_port: &str) -> CommandOutput {
    if !world.bridges.contains_key(bridge) {
        return CommandOutput::failed(1, format!("ovs-ofctl: {bridge} is not a bridge or a socket"));
    }
    let port = of_port
        .parse::<u32>()
        .ok()
        .and_then(|n| world.ports.iter().find(|p| p.bridge == bridge && p.of_port == n));
    let Some(port) = port else {
        return CommandOutput::failed(1, format!("ovs-ofctl: {of_port}: invalid or unknown port for bridge {bridge}"));
    };
    let c = port.counters;
    CommandOutput::ok(format!(
        "OFPST_PORT reply (xid=0x2): 1 ports\n  port {:>2}: rx pkts={}, bytes=?, drop={}, errs=0, frame=?, over=?, crc=?\n           tx pkts={}, bytes=?, drop={}, errs=0, coll=?\n",
        port.of_port, c.rx_packets, c.rx_drop, c.tx_packets, c.tx_drop
    ))
}

fn show(world: &SimWorld, bridge: &str) -> CommandOutput {
    let Some(b) = world.bridges.get(bridge) else {
        return CommandOutput::failed(1, format!("ovs-ofctl: {bridge} is not a bridge or a socket"));
    };
    let mut out = format!(
        "OFPT_FEATURES_REPLY (xid=0x2): dpid:0000{:012x}\nn_tables:254, n_buffers:0\ncapabilities: FLOW_STATS TABLE_STATS PORT_STATS QUEUE_STATS ARP_MATCH_IP\n",
        b.mac
    );
    let mut ports: Vec<&SimPort> = world.ports.iter().filter(|p| p.bridge == bridge).collect();
    ports.sort_by_key(|p| p.of_port);
    for port in ports {
        let _ = writeln!(
            out,
            " {}({}): addr:{}\n     config:     0\n     state:      0",
            port.of_port,
            port.interface,
            format_mac(0x0200_0000_0000 + u64::from(port.of_port))
        );
    }
    let _ = writeln!(out, " LOCAL({bridge}): addr:{}\n     config:     0", format_mac(b.mac));
    out.push_str("OFPT_GET_CONFIG_REPLY (xid=0x4): frags=normal miss_send_len=0\n");
    CommandOutput::ok(out)
}

fn dpif_show(world: &SimWorld) -> CommandOutput {
    let kind = match world.datapath {
        DatapathKind::Netdev => "netdev",
        DatapathKind::System => "system",
    };
    let mut out = format!("{}: hit:0 missed:0\n", world.datapath.dpctl_name());
    for bridge in world.bridges.keys() {
        let _ = writeln!(out, "  {bridge}:");
        let _ = writeln!(out, "    {bridge} 65534/1: (internal)");
        for (i, port) in world.ports.iter().filter(|p| &p.bridge == bridge).enumerate() {
            let _ = writeln!(out, "    {} {}/{}: ({kind})", port.interface, port.of_port, i + 2);
        }
    }
    CommandOutput::ok(out)
}

/// `pidstat -u -t` averages for the switch threads.
fn thread_report(datapath: DatapathKind, monitor: Monitor) -> String {
    let busy = if monitor.ticks == 0 {
        0.0
    } else {
        monitor.busy_ticks as f64 / monitor.ticks as f64
    };
    let threads: Vec<(&str, f64)> = match datapath {
        // PMD threads poll whether or not traffic flows
        DatapathKind::Netdev => vec![
            ("ovs-vswitchd", 1.0),
            ("pmd-c02/id:9", 100.0),
            ("pmd-c03/id:10", 100.0),
            ("revalidator6", 5.0 * busy),
            ("handler1", 0.5),
            ("urcu3", 0.25),
        ],
        DatapathKind::System => vec![
            ("ovs-vswitchd", 1.0),
            ("handler1", 40.0 * busy),
            ("handler2", 40.0 * busy),
            ("revalidator6", 10.0 * busy),
            ("urcu3", 0.25),
        ],
    };

    let mut out = String::from(
        "Average:      UID      TGID       TID    %usr %system  %guest    %CPU   CPU  Command\n",
    );
    let total: f64 = threads.iter().map(|(_, cpu)| cpu).sum();
    let _ = writeln!(
        out,
        "Average:        0      1000         -  {:>7.2}    0.00    0.00 {:>7.2}     -  ovs-vswitchd",
        total, total
    );
    for (tid, (name, cpu)) in (1000..).zip(threads) {
        let _ = writeln!(
            out,
            "Average:        0         -  {tid:>8} {cpu:>7.2}    0.00    0.00 {cpu:>7.2}     -  |__{name}"
        );
    }
    out
}

/// `mpstat -P ALL` averages.
fn system_report(monitor: Monitor) -> String {
    let busy = if monitor.ticks == 0 {
        0.0
    } else {
        monitor.busy_ticks as f64 / monitor.ticks as f64
    };
    let mut out = String::from(
        "Average:     CPU    %usr   %nice    %sys %iowait    %irq   %soft  %steal  %guest  %gnice   %idle\n",
    );
    let usr = 10.0 + 60.0 * busy;
    let soft = 5.0 * busy;
    let idle = 100.0 - usr - soft - 1.0;
    let _ = writeln!(
        out,
        "Average:     all {usr:>7.2}    0.00    1.00    0.00    0.00 {soft:>7.2}    0.00    0.00    0.00 {idle:>7.2}"
    );
    for cpu in 0..CPUS {
        let _ = writeln!(
            out,
            "Average:     {cpu:>3} {usr:>7.2}    0.00    1.00    0.00    0.00 {soft:>7.2}    0.00    0.00    0.00 {idle:>7.2}"
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchperf_core::stats::{cpu, parse_port_counters};
    use switchperf_core::stats::CpuUtilizationSample;

    #[test]
    fn monitor_reports_parse() {
        let monitor = Monitor {
            ticks: 20,
            busy_ticks: 10,
        };
        let mut sample = CpuUtilizationSample::default();
        assert_eq!(
            cpu::parse_thread_report(&thread_report(DatapathKind::Netdev, monitor), &mut sample),
            6
        );
        assert_eq!(sample.pmd, 200.0);
        assert_eq!(sample.revalidator, 2.5);
        assert_eq!(cpu::parse_system_report(&system_report(monitor), &mut sample), CPUS as usize);
        assert!(sample.idle > 0.0);
    }

    #[test]
    fn port_dump_round_trips_through_the_parser() {
        let mut world = crate::tests::world();
        world.ports[0].counters = PortCounters {
            rx_packets: 10,
            rx_drop: 1,
            tx_packets: 7,
            tx_drop: 2,
        };
        let of_port = world.ports[0].of_port.to_string();
        let bridge = world.ports[0].bridge.clone();
        let output = dump_ports(&world, &bridge, &of_port);
        let snap = parse_port_counters(&output.stdout, &of_port).unwrap();
        assert_eq!((snap.rx_packets, snap.rx_drop, snap.tx_packets, snap.tx_drop), (10, 1, 7, 2));
    }

    #[test]
    fn failed_vsctl_transaction_changes_nothing() {
        let mut world = crate::tests::world();
        let bridges = world.bridges.len();
        let output = vsctl(&mut world, "ovs-vsctl -- --if-exists del-br ovs_pvp_br0 -- frobnicate");
        assert_eq!(output.status, 1);
        assert_eq!(world.bridges.len(), bridges);
    }

    #[test]
    fn unknown_commands_are_not_found() {
        let mut world = crate::tests::world();
        assert_eq!(interpret(&mut world, "reboot", None).status, COMMAND_NOT_FOUND);
    }
}
