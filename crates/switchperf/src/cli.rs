//! Command-line flags, layered over the optional TOML config file.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser};
use switchperf_core::config::{SuiteConfig, SuiteConfigInput};
use switchperf_sim::SimProfile;

/// Forwarding performance suites for Open vSwitch.
#[derive(Parser, Debug)]
#[command(name = "switchperf", about = "Software switch forwarding performance tests")]
pub struct Cli {
    /// TOML file with `[dut]`, `[vm]`, `[tester]` and `[test]` tables.
    /// Flags given on the command line win.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run against the built-in simulated testbed.
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// TOML capacity model for `--simulate`.
    #[arg(long, requires = "simulate")]
    pub sim_profile: Option<PathBuf>,

    /// Print the result series as JSON on stdout.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Force debug logging regardless of `RUST_LOG`.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Mirror log output into this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub dut: DutArgs,

    #[command(flatten)]
    pub vm: VmArgs,

    #[command(flatten)]
    pub tester: TesterArgs,

    #[command(flatten)]
    pub test: TestArgs,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Device under test")]
pub struct DutArgs {
    #[arg(id = "dut-address", long = "dut-address")]
    pub address: Option<String>,
    #[arg(id = "dut-user", long = "dut-user")]
    pub user: Option<String>,
    #[arg(id = "dut-password", long = "dut-password", env = "SWITCHPERF_DUT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long)]
    pub bridge_name: Option<String>,
    #[arg(long)]
    pub physical_interface: Option<String>,
    #[arg(long)]
    pub physical_interface_pci: Option<String>,
    #[arg(long)]
    pub second_physical_interface: Option<String>,
    #[arg(long)]
    pub second_physical_interface_pci: Option<String>,
    #[arg(long)]
    pub virtual_interface: Option<String>,
    /// Link speed in Gbit/s; 0 detects it with ethtool.
    #[arg(long)]
    pub physical_speed: Option<u32>,
    #[arg(long)]
    pub pmd_rxq_affinity: Option<String>,
    /// Delete and recreate the test bridges before the suite.
    #[arg(long, default_value_t = false)]
    pub create_bridge: bool,
    /// Record a perf profile of ovs-vswitchd during every run.
    #[arg(long, default_value_t = false)]
    pub perf: bool,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Virtual machine")]
pub struct VmArgs {
    #[arg(id = "vm-address", long = "vm-address")]
    pub address: Option<String>,
    #[arg(id = "vm-user", long = "vm-user")]
    pub user: Option<String>,
    #[arg(id = "vm-password", long = "vm-password", env = "SWITCHPERF_VM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long = "vm-nic-pci")]
    pub nic_pci: Option<String>,
    #[arg(long = "vm-nic-queues")]
    pub nic_queues: Option<u32>,
    #[arg(long = "vm-nic-rxd")]
    pub nic_rxd: Option<u32>,
    #[arg(long = "vm-nic-txd")]
    pub nic_txd: Option<u32>,
    /// Seconds to wait after starting testpmd.
    #[arg(long)]
    pub testpmd_startup_delay: Option<u64>,
    /// Swap MAC addresses on the VM's return path.
    #[arg(long, default_value_t = false)]
    pub mac_swap: bool,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Traffic generator")]
pub struct TesterArgs {
    #[arg(id = "tester-address", long = "tester-address")]
    pub address: Option<String>,
    #[arg(long = "tester-interface")]
    pub interface: Option<String>,
    #[arg(long = "second-tester-interface")]
    pub second_interface: Option<String>,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Test selection")]
pub struct TestArgs {
    /// Comma-separated topologies, `-zero` suffix for a zero-loss search:
    /// p, p2p, p2v, p2v2p, vxlan-pv, vxlan-pvp.
    #[arg(long)]
    pub tests: Option<String>,
    #[arg(long)]
    pub packet_list: Option<String>,
    #[arg(long)]
    pub stream_list: Option<String>,
    /// Seconds of traffic per run.
    #[arg(long)]
    pub run_time: Option<u64>,
    /// L2, L3, L3-16 or L4-UDP.
    #[arg(long)]
    pub flow_type: Option<String>,
    /// flows, NORMAL, port or none.
    #[arg(long)]
    pub flow_rule_type: Option<String>,
    /// Offered load in percent of line rate.
    #[arg(long)]
    pub traffic_rate: Option<f64>,
    #[arg(long)]
    pub zero_loss_step: Option<f64>,
    #[arg(long, default_value_t = false)]
    pub warm_up: bool,
    #[arg(long)]
    pub warm_up_timeout: Option<u64>,
    #[arg(long, default_value_t = false)]
    pub warm_up_no_fail: bool,
    #[arg(long, default_value_t = false)]
    pub no_cool_down: bool,
    #[arg(long)]
    pub src_mac: Option<String>,
    #[arg(long)]
    pub dst_mac: Option<String>,
    #[arg(long, default_value_t = false)]
    pub payload_packet_random: bool,
    /// Length of one polling tick in milliseconds.
    #[arg(long)]
    pub tick_ms: Option<u64>,
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Switches only ever turn a setting on.
fn enable(slot: &mut Option<bool>, flag: bool) {
    if flag {
        *slot = Some(true);
    }
}

impl Cli {
    /// Read `--config` (if any), lay the flags over it and validate.
    pub fn suite_config(&self) -> anyhow::Result<SuiteConfig> {
        let mut input = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                SuiteConfigInput::from_toml_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => SuiteConfigInput::default(),
        };
        self.overlay(&mut input);
        Ok(input.resolve()?)
    }

    pub fn sim_profile(&self) -> anyhow::Result<SimProfile> {
        let Some(path) = &self.sim_profile else {
            return Ok(SimProfile::default());
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn overlay(&self, input: &mut SuiteConfigInput) {
        let dut = &self.dut;
        let d = &mut input.dut;
        set(&mut d.address, dut.address.clone());
        set(&mut d.user, dut.user.clone());
        set(&mut d.password, dut.password.clone());
        set(&mut d.bridge_name, dut.bridge_name.clone());
        set(&mut d.physical_interface, dut.physical_interface.clone());
        set(&mut d.physical_interface_pci, dut.physical_interface_pci.clone());
        set(&mut d.second_physical_interface, dut.second_physical_interface.clone());
        set(&mut d.second_physical_interface_pci, dut.second_physical_interface_pci.clone());
        set(&mut d.virtual_interface, dut.virtual_interface.clone());
        set(&mut d.physical_speed_gbps, dut.physical_speed);
        set(&mut d.pmd_rxq_affinity, dut.pmd_rxq_affinity.clone());
        enable(&mut d.create_bridge, dut.create_bridge);
        enable(&mut d.perf, dut.perf);

        let vm = &self.vm;
        let v = &mut input.vm;
        set(&mut v.address, vm.address.clone());
        set(&mut v.user, vm.user.clone());
        set(&mut v.password, vm.password.clone());
        set(&mut v.nic_pci, vm.nic_pci.clone());
        set(&mut v.nic_queues, vm.nic_queues);
        set(&mut v.nic_rxd, vm.nic_rxd);
        set(&mut v.nic_txd, vm.nic_txd);
        set(&mut v.testpmd_startup_delay_s, vm.testpmd_startup_delay);
        enable(&mut v.mac_swap, vm.mac_swap);

        let tester = &self.tester;
        let t = &mut input.tester;
        set(&mut t.address, tester.address.clone());
        set(&mut t.interface, tester.interface.clone());
        set(&mut t.second_interface, tester.second_interface.clone());

        let test = &self.test;
        let t = &mut input.test;
        set(&mut t.tests, test.tests.clone());
        set(&mut t.packet_list, test.packet_list.clone());
        set(&mut t.stream_list, test.stream_list.clone());
        set(&mut t.run_time_s, test.run_time);
        set(&mut t.flow_type, test.flow_type.clone());
        set(&mut t.flow_rule_type, test.flow_rule_type.clone());
        set(&mut t.traffic_rate, test.traffic_rate);
        set(&mut t.zero_loss_step, test.zero_loss_step);
        enable(&mut t.warm_up, test.warm_up);
        set(&mut t.warm_up_timeout_s, test.warm_up_timeout);
        enable(&mut t.warm_up_no_fail, test.warm_up_no_fail);
        enable(&mut t.no_cool_down, test.no_cool_down);
        set(&mut t.src_mac, test.src_mac.clone());
        set(&mut t.dst_mac, test.dst_mac.clone());
        enable(&mut t.payload_packet_random, test.payload_packet_random);
        set(&mut t.tick_ms, test.tick_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use switchperf_core::topology::Topology;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("switchperf").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_alone_make_a_valid_suite() {
        let cli = parse(&[
            "--dut-address",
            "10.0.0.2",
            "--physical-interface",
            "dpdk0",
            "--tester-interface",
            "0,0",
            "--tests",
            "p,p-zero",
            "--stream-list",
            "10,100",
        ]);
        let cfg = cli.suite_config().unwrap();
        assert_eq!(cfg.dut.address, "10.0.0.2");
        assert_eq!(cfg.test.flow_counts, vec![10, 100]);
        assert_eq!(cfg.test.tests.len(), 2);
        assert!(cfg.test.tests.iter().all(|t| t.topology == Topology::P));
        assert!(cfg.test.tests[1].zero_loss);
        assert!(!cfg.dut.create_bridge);
    }

    #[test]
    fn flags_override_the_config_file() {
        let path = std::env::temp_dir().join(format!("switchperf-cli-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
            [dut]
            address = "10.0.0.2"
            physical_interface = "dpdk0"
            [tester]
            interface = "0,0"
            [test]
            tests = "p"
            run_time_s = 60
            "#,
        )
        .unwrap();
        let cli = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--run-time",
            "30",
            "--warm-up",
            "--dut-address",
            "192.168.1.1",
        ]);
        let cfg = cli.suite_config();
        std::fs::remove_file(&path).unwrap();
        let cfg = cfg.unwrap();
        assert_eq!(cfg.dut.address, "192.168.1.1");
        assert_eq!(cfg.test.run_time_s, 30);
        assert!(cfg.test.warm_up);
    }

    #[test]
    fn missing_dut_address_is_reported() {
        let cli = parse(&["--physical-interface", "dpdk0", "--tester-interface", "0,0"]);
        let err = cli.suite_config().unwrap_err();
        assert!(err.to_string().contains("dut.address"), "{err}");
    }

    #[test]
    fn sim_profile_needs_simulate() {
        let err = Cli::try_parse_from(["switchperf", "--sim-profile", "sim.toml"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
