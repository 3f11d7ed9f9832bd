//! # switchperf-core
//!
//! Forwarding performance tests for Open vSwitch style software switches.
//!
//! A test drives a traffic generator through one of several topologies
//! (physical loopback, physical to physical, physical to VM, physical to
//! VM and back, and the VXLAN variants) and reports throughput, loss and
//! CPU cost per flow count and packet size.
//!
//! ## Modules
//!
//! - [`config`] — TOML/CLI input and its validated form
//! - [`remote`] — command execution on the DUT and VM
//! - [`traffic`] — traffic generator seam
//! - [`flow_table`] — OpenFlow rule programming, warm-up, cool-down
//! - [`stats`] — counter parsing and rate reduction
//! - [`vm`] — testpmd endpoint inside the VM
//! - [`topology`] — per-topology wiring plans
//! - [`runner`] — one measurement iteration
//! - [`search`] — zero-loss binary search
//! - [`aggregate`] — result series for reporting
//! - [`pace`] — tick-based waiting

pub mod aggregate;
pub mod config;
pub mod flow_table;
pub mod pace;
pub mod remote;
pub mod runner;
pub mod search;
pub mod stats;
pub mod topology;
pub mod traffic;
pub mod vm;

pub use aggregate::{NaturalKey, ResultAggregator, ResultSeries};
pub use config::{ConfigError, SuiteConfig, SuiteConfigInput};
pub use remote::{CommandOutput, RemoteError, RemoteExecutor};
pub use runner::{RunResult, ScenarioError, TestBed, TestRunner, TestScenario};
pub use search::{SearchOutcome, ZeroLossSearch};
pub use topology::{TestSelection, Topology};
pub use traffic::{TrafficDriver, TrafficError};
