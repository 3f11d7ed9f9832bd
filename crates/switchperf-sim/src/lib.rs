//! # switchperf-sim
//!
//! A deterministic stand-in for the physical testbed: an Open vSwitch
//! DUT, a testpmd VM and a software traffic generator sharing one
//! packet model. Time only moves when the orchestrator pauses, so a
//! twenty-tick run finishes instantly and reproduces exactly for a given
//! [`SimProfile`] seed.
//!
//! ```text
//!   tester port ──▶ physical port ──▶ rules ──▶ virtual port ──▶ VM
//!        ▲                                                        │
//!        └────────────── physical port ◀── rules ◀── (loopback) ──┘
//! ```

pub mod generator;
pub mod ovs;
pub mod profile;
pub mod vm;
pub mod world;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use switchperf_core::config::SuiteConfig;
use switchperf_core::flow_table::BridgePlan;
use switchperf_core::pace::Pacer;

pub use generator::SimTrafficGenerator;
pub use ovs::SimDut;
pub use profile::{Fault, SimProfile};
pub use vm::SimVm;
pub use world::{Host, PortCounters, SimWorld};

pub(crate) type SharedWorld = Arc<Mutex<SimWorld>>;

pub(crate) fn lock(world: &SharedWorld) -> MutexGuard<'_, SimWorld> {
    world.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Advances the shared model instead of sleeping.
#[derive(Clone)]
pub struct SimPacer {
    world: SharedWorld,
}

impl Pacer for SimPacer {
    fn pause(&self, ticks: u32) {
        lock(&self.world).advance(ticks);
    }

    fn elapsed_ticks(&self) -> u64 {
        lock(&self.world).tick()
    }
}

/// One simulated testbed. Handles are cheap clones onto the same model.
pub struct Simulation {
    world: SharedWorld,
}

impl Simulation {
    /// Build a testbed for `config` whose bridges already exist, as if
    /// an operator had set them up by hand.
    pub fn new(config: &SuiteConfig, profile: SimProfile) -> Self {
        let mut world = SimWorld::new(config, profile);
        let create = BridgePlan::from_config(config).create_command();
        let output = ovs::vsctl(&mut world, &create);
        if !output.success() {
            tracing::warn!(output = %output.output, "simulated bridge setup failed");
        }
        tracing::info!(
            datapath = ?world.datapath,
            bridges = world.bridges.len(),
            ports = world.ports.len(),
            "simulated testbed ready"
        );
        Self {
            world: Arc::new(Mutex::new(world)),
        }
    }

    pub fn dut(&self) -> SimDut {
        SimDut::new(Arc::clone(&self.world))
    }

    pub fn vm(&self) -> SimVm {
        SimVm::new(Arc::clone(&self.world))
    }

    pub fn tester(&self) -> SimTrafficGenerator {
        SimTrafficGenerator::new(Arc::clone(&self.world))
    }

    pub fn pacer(&self) -> SimPacer {
        SimPacer {
            world: Arc::clone(&self.world),
        }
    }

    pub fn inject(&self, fault: Fault) {
        tracing::info!(?fault, "injecting fault");
        lock(&self.world).faults.push(fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.world).faults.clear();
    }

    /// Read-only view of the model; release it before driving the
    /// testbed again.
    pub fn inspect(&self) -> MutexGuard<'_, SimWorld> {
        lock(&self.world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchperf_core::config::SuiteConfigInput;

    pub(crate) fn config() -> SuiteConfig {
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
            interface = "0,0"
            second_interface = "0,1"

            [test]
            tests = "p2p,p2v,p2v2p,p"
            "#,
        )
        .unwrap()
        .resolve()
        .unwrap()
    }

    pub(crate) fn world() -> SimWorld {
        let cfg = config();
        let mut world = SimWorld::new(&cfg, SimProfile::default());
        assert!(ovs::vsctl(&mut world, &BridgePlan::from_config(&cfg).create_command()).success());
        world
    }

    #[test]
    fn bridges_exist_before_the_first_command() {
        let sim = Simulation::new(&config(), SimProfile::default());
        let world = sim.inspect();
        assert_eq!(world.rule_count("ovs_pvp_br0"), 1);
        assert!(world.port_counters("dpdk0").is_some());
        assert!(world.port_counters("dpdk1").is_some());
        assert!(world.port_counters("vhost0").is_some());
        assert!(world.commands(Host::Dut).is_empty());
    }

    #[test]
    fn pacer_moves_time() {
        let sim = Simulation::new(&config(), SimProfile::default());
        let pacer = sim.pacer();
        pacer.pause(3);
        assert_eq!(sim.inspect().tick(), 3);
        assert_eq!(pacer.elapsed_ticks(), 3);
    }
}
