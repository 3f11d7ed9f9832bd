//! switchperf
//!
//! Runs forwarding performance suites against an Open vSwitch DUT:
//!
//! - Loads the suite from `--config` and command-line flags
//! - Reserves tester ports and discovers the DUT's bridges and datapath
//! - Runs every selected topology over every flow count and packet size,
//!   optionally searching for the zero-loss load
//! - Logs the result series and, with `--json`, prints them on stdout
//!
//! `--simulate` swaps the DUT, VM and traffic generator for the
//! deterministic model in `switchperf-sim`.

mod cli;
mod suite;

use std::fs::File;
use std::sync::Mutex;

use anyhow::Context as _;
use clap::Parser;
use switchperf_core::remote::{LocalExecutor, RemoteExecutor, SshExecutor};
use switchperf_core::SuiteConfig;
use switchperf_sim::Simulation;
use tracing_subscriber::fmt::writer::MakeWriterExt as _;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::suite::{Environment, SuiteReport};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = cli.suite_config()?;
    tracing::info!(
        dut = %config.dut.address,
        bridge = %config.dut.bridge_name,
        tests = ?config.test.tests.iter().map(ToString::to_string).collect::<Vec<_>>(),
        simulate = cli.simulate,
        "switchperf starting"
    );

    let report = if cli.simulate {
        run_simulated(&config, &cli)?
    } else {
        run_on_hardware(&config)?
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    tracing::info!(tests = report.tests.len(), "suite complete");
    Ok(())
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match &cli.log_file {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run_simulated(config: &SuiteConfig, cli: &Cli) -> anyhow::Result<SuiteReport> {
    let sim = Simulation::new(config, cli.sim_profile()?);
    let dut = sim.dut();
    let vm = sim.vm();
    let mut tester = sim.tester();
    let pacer = sim.pacer();
    execute(Environment {
        config,
        dut: &dut,
        vm: Some(&vm),
        tester: &mut tester,
        pacer: &pacer,
    })
}

/// The DUT is reachable over SSH, but no hardware traffic generator
/// backend ships with this binary. Check the DUT anyway so a broken
/// setup is reported before the missing backend.
fn run_on_hardware(config: &SuiteConfig) -> anyhow::Result<SuiteReport> {
    let dut: Box<dyn RemoteExecutor> = match config.dut.address.as_str() {
        "localhost" | "127.0.0.1" => Box::new(LocalExecutor),
        host => Box::new(SshExecutor::new(host, &config.dut.user, config.dut.password.as_deref())),
    };
    dut.execute_checked("ovs-vsctl --version")
        .with_context(|| format!("checking Open vSwitch on {}", config.dut.address))?;

    anyhow::bail!(
        "no traffic generator backend for {}; run with --simulate or drive \
         switchperf_core::TestRunner with your own TrafficDriver",
        config.tester.address.as_deref().unwrap_or("the tester")
    )
}

fn execute(mut env: Environment<'_>) -> anyhow::Result<SuiteReport> {
    let facts = suite::prepare(&mut env)?;
    suite::run_suite(&mut env, facts)
}
