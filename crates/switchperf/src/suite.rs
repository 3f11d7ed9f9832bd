//! Suite orchestration: prepare the testbed once, then run every selected
//! test over every flow count and packet size.

use anyhow::Context as _;
use serde::Serialize;
use switchperf_core::aggregate::{ResultAggregator, ResultSeries};
use switchperf_core::flow_table::{discovery, BridgePlan, DatapathKind, PortMap};
use switchperf_core::pace::Pacer;
use switchperf_core::runner::{RunResult, TestBed, TestRunner, TestScenario};
use switchperf_core::search::{SearchOutcome, ZeroLossSearch};
use switchperf_core::stats::{eth_utilization, StatCollector};
use switchperf_core::topology::TestSelection;
use switchperf_core::vm::VmEndpoint;
use switchperf_core::{RemoteExecutor, SuiteConfig, TrafficDriver};

/// Zero-loss ladder bounds, percent of line rate.
pub const ZERO_LOSS_MIN_LOAD: f64 = 1.0;
pub const ZERO_LOSS_MAX_LOAD: f64 = 100.0;
/// Highest loss, in percent, still counted as zero loss.
pub const ZERO_LOSS_REQUIRED: f64 = 0.00001;

/// Everything the suite drives.
pub struct Environment<'a> {
    pub config: &'a SuiteConfig,
    pub dut: &'a dyn RemoteExecutor,
    pub vm: Option<&'a dyn RemoteExecutor>,
    pub tester: &'a mut dyn TrafficDriver,
    pub pacer: &'a dyn Pacer,
}

/// What startup learned about the DUT.
#[derive(Debug, Clone, Serialize)]
pub struct DutFacts {
    pub datapath: DatapathKind,
    pub tc_offload: bool,
    pub line_bps: u64,
    pub ports: PortMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub test: String,
    pub title: &'static str,
    pub results: ResultSeries,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub dut: DutFacts,
    pub tests: Vec<TestReport>,
}

// ── Startup ─────────────────────────────────────────────────────────

/// Reserve tester ports, clean up after earlier suites, optionally
/// rebuild the bridges and discover the DUT.
pub fn prepare(env: &mut Environment<'_>) -> anyhow::Result<DutFacts> {
    let cfg = env.config;

    let mut tester_ports = vec![cfg.tester.interface.as_str()];
    if cfg.test.tests.iter().any(|t| t.topology.needs_second_physical()) {
        if let Some(second) = &cfg.tester.second_interface {
            tester_ports.push(second);
        }
    }
    for port in tester_ports {
        env.tester
            .reserve_port(port)
            .with_context(|| format!("reserving tester port {port}"))?;
    }

    stop_leftovers(env)?;

    if cfg.dut.create_bridge {
        BridgePlan::from_config(cfg)
            .provision(env.dut)
            .context("configuring the test bridges")?;
    }

    let ports = PortMap::for_suite(env.dut, cfg).context("discovering OpenFlow port numbers")?;
    let datapath = discovery::datapath_kind(env.dut, &cfg.dut.bridge_name)?;
    let tc_offload = discovery::tc_offload_enabled(env.dut)?;
    let line_bps = match cfg.dut.physical_speed_gbps {
        Some(gbps) => u64::from(gbps) * 1_000_000_000,
        None => discovery::physical_port_speed(env.dut, &cfg.dut.physical_interface)?,
    };

    tracing::info!(?datapath, tc_offload, line_bps, "DUT ready");
    Ok(DutFacts {
        datapath,
        tc_offload,
        line_bps,
        ports,
    })
}

/// An aborted earlier suite can leave testpmd, the CPU monitors or perf
/// running. None of them being there is fine.
fn stop_leftovers(env: &Environment<'_>) -> anyhow::Result<()> {
    if let (true, Some(vm)) = (env.config.needs_vm(), env.vm) {
        VmEndpoint::new(vm, env.pacer, &env.config.vm)?.stop()?;
    }
    let stats = StatCollector::new(env.dut);
    stats.stop_cpu_monitoring()?;
    if env.config.dut.perf {
        stats.stop_perf()?;
    }
    Ok(())
}

// ── Suite ───────────────────────────────────────────────────────────

pub fn run_suite(env: &mut Environment<'_>, dut: DutFacts) -> anyhow::Result<SuiteReport> {
    let config = env.config;
    let mut tests = Vec::with_capacity(config.test.tests.len());
    for &selection in &config.test.tests {
        tests.push(run_test(env, &dut, selection)?);
    }
    Ok(SuiteReport { dut, tests })
}

fn run_test(env: &mut Environment<'_>, dut: &DutFacts, selection: TestSelection) -> anyhow::Result<TestReport> {
    let cfg = env.config;
    let topology = selection.topology;
    tracing::info!(test = %selection, "== {} ==", topology.title());

    let bed = TestBed {
        config: cfg,
        dut: env.dut,
        vm: env.vm,
        tester: &mut *env.tester,
        pacer: env.pacer,
        ports: &dut.ports,
        datapath: dut.datapath,
        tc_offload: dut.tc_offload,
    };
    let mut runner = TestRunner::new(bed, topology).with_context(|| format!("preparing {selection}"))?;
    let search = ZeroLossSearch::new(
        ZERO_LOSS_MIN_LOAD,
        ZERO_LOSS_MAX_LOAD,
        ZERO_LOSS_REQUIRED,
        cfg.test.zero_loss_step,
    )?;

    let mut aggregator = ResultAggregator::new(selection.zero_loss);
    for &flows in &cfg.test.flow_counts {
        for &packet_size in &cfg.test.packet_sizes {
            let base = TestScenario {
                topology,
                flows,
                packet_size,
                offered_load: cfg.test.traffic_rate,
                warm_up: cfg.test.warm_up,
            };
            let context = || format!("{selection} with {flows} flows and {packet_size} byte packets");

            let result = if selection.zero_loss {
                let outcome = search
                    .search(
                        |load| {
                            runner.run(&TestScenario {
                                offered_load: load,
                                ..base
                            })
                        },
                        |r: &RunResult| r.loss_percent,
                    )
                    .with_context(context)?;
                match pick_zero_loss(outcome) {
                    Some((_, result)) => result,
                    None => {
                        tracing::warn!(flows, packet_size, "zero-loss search ran no iteration");
                        continue;
                    }
                }
            } else {
                runner.run(&base).with_context(context)?
            };

            tracing::info!(
                flows,
                packet_size,
                offered_load = result.offered_load,
                throughput_pps = result.throughput_pps,
                loss_percent = result.loss_percent,
                line_utilization = eth_utilization(dut.line_bps, packet_size, result.throughput_pps),
                "result"
            );
            aggregator.insert(flows, packet_size, result);
        }
    }

    let results = aggregator.group_by_flow_count();
    for series in &results.series {
        tracing::info!(
            test = %selection,
            flows = %series.flows,
            packet_sizes = ?series.packet_sizes.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            throughput_pps = ?series.throughput_pps,
            "series"
        );
    }
    Ok(TestReport {
        test: selection.to_string(),
        title: topology.title(),
        results,
    })
}

/// The zero-loss load's result, or the lowest load tried when nothing met
/// the requirement.
pub fn pick_zero_loss<R>(outcome: SearchOutcome<R>) -> Option<(f64, R)> {
    let SearchOutcome { state, chosen } = outcome;
    let mut results = state.into_results();
    results.sort_by(|a, b| a.0.total_cmp(&b.0));
    match chosen {
        Some(load) => results.into_iter().find(|(l, _)| *l == load),
        None => {
            let lowest = results.into_iter().next();
            if let Some((load, _)) = &lowest {
                tracing::warn!(load, "zero loss not reached, reporting the lowest load");
            }
            lowest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use switchperf_core::config::SuiteConfigInput;
    use switchperf_sim::{Host, SimProfile, Simulation};

    fn config(test: &str) -> SuiteConfig {
        let toml = format!(
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

            [test]
            {test}
            "#
        );
        SuiteConfigInput::from_toml_str(&toml).unwrap().resolve().unwrap()
    }

    fn run(cfg: &SuiteConfig, sim: &Simulation) -> SuiteReport {
        let dut = sim.dut();
        let vm = sim.vm();
        let mut tester = sim.tester();
        let pacer = sim.pacer();
        let mut env = Environment {
            config: cfg,
            dut: &dut,
            vm: Some(&vm),
            tester: &mut tester,
            pacer: &pacer,
        };
        let facts = prepare(&mut env).unwrap();
        run_suite(&mut env, facts).unwrap()
    }

    #[test]
    fn zero_loss_pick_prefers_the_chosen_load() {
        let search = ZeroLossSearch::new(1.0, 100.0, ZERO_LOSS_REQUIRED, 1.0).unwrap();
        let outcome = search
            .search(
                |load| Ok::<_, Infallible>(if load > 40.0 { 5.0 } else { 0.0 }),
                |loss| *loss,
            )
            .unwrap();
        assert_eq!(pick_zero_loss(outcome), Some((40.0, 0.0)));
    }

    #[test]
    fn zero_loss_pick_falls_back_to_the_lowest_load() {
        let search = ZeroLossSearch::new(1.0, 100.0, ZERO_LOSS_REQUIRED, 1.0).unwrap();
        let outcome = search
            .search(|load| Ok::<_, Infallible>(load), |loss| *loss)
            .unwrap();
        assert_eq!(outcome.chosen, None);
        assert_eq!(pick_zero_loss(outcome), Some((1.0, 1.0)));
    }

    #[test]
    fn startup_discovers_the_simulated_dut() {
        let cfg = config(r#"tests = "p2p""#);
        let sim = Simulation::new(&cfg, SimProfile::default());
        let dut = sim.dut();
        let mut tester = sim.tester();
        let pacer = sim.pacer();
        let mut env = Environment {
            config: &cfg,
            dut: &dut,
            vm: None,
            tester: &mut tester,
            pacer: &pacer,
        };
        let facts = prepare(&mut env).unwrap();
        assert_eq!(facts.datapath, DatapathKind::Netdev);
        assert!(!facts.tc_offload);
        assert_eq!(facts.line_bps, 10_000_000_000);
        assert_eq!(facts.ports.get("dpdk0"), Some("10"));
        assert_eq!(facts.ports.get("dpdk1"), Some("11"));
        // leftover monitors are stopped before anything else touches the DUT
        let world = sim.inspect();
        let commands = world.commands(Host::Dut);
        assert!(commands[0].contains("pidof pidstat"), "{commands:?}");
    }

    #[test]
    fn bridges_are_rebuilt_on_request() {
        let mut cfg = config(
            r#"tests = "p"
            stream_list = "10"
            packet_list = "1514""#,
        );
        cfg.dut.create_bridge = true;
        let sim = Simulation::new(&cfg, SimProfile::default());
        let report = run(&cfg, &sim);
        assert_eq!(report.tests.len(), 1);
        let world = sim.inspect();
        assert!(world.commands(Host::Dut).iter().any(|c| c.contains("del-br")));
    }

    #[test]
    fn fixed_rate_suite_covers_every_flow_count_and_size() {
        let cfg = config(
            r#"tests = "p,p2v"
            stream_list = "10,1000"
            packet_list = "64,1514""#,
        );
        let sim = Simulation::new(&cfg, SimProfile::default());
        let report = run(&cfg, &sim);

        assert_eq!(report.tests.len(), 2);
        assert_eq!(report.tests[0].test, "p");
        assert_eq!(report.tests[1].test, "p2v");
        for test in &report.tests {
            assert!(!test.results.zero_loss);
            assert_eq!(test.results.series.len(), 2);
            for series in &test.results.series {
                let sizes: Vec<&str> = series.packet_sizes.iter().map(|k| k.as_str()).collect();
                assert_eq!(sizes, ["64", "1514"]);
                assert!(series.throughput_pps.iter().all(|pps| *pps > 0.0));
            }
        }
    }

    #[test]
    fn zero_loss_suite_reports_the_achieved_load() {
        let cfg = config(
            r#"tests = "p2v2p-zero"
            stream_list = "10"
            packet_list = "64""#,
        );
        let sim = Simulation::new(&cfg, SimProfile::default());
        let report = run(&cfg, &sim);

        let results = &report.tests[0].results;
        assert!(results.zero_loss);
        let series = &results.series[0];
        assert_eq!(series.offered_load.as_deref(), Some(&[28.0][..]));
        assert_eq!(series.loss_percent.as_deref(), Some(&[0.0][..]));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tests"][0]["test"], "p2v2p-zero");
        assert_eq!(json["tests"][0]["results"]["series"][0]["flows"], 10);
    }
}
