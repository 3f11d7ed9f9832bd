//! OpenFlow rule programming and datapath flow-table management.
//!
//! [`FlowTableController`] owns every mutation of the bridge's flow table:
//! it clears, installs and verifies rules, and polls the datapath's active
//! flow count for warm-up and cool-down. All mutation is clear-then-program
//! and any remote failure is fatal; nothing is retried.

pub mod bridge;
pub mod discovery;
pub mod rules;

use thiserror::Error;

use crate::config::{RuleType, TestConfig};
use crate::pace::Pacer;
use crate::remote::{RemoteError, RemoteExecutor};

pub use bridge::BridgePlan;
pub use discovery::{DatapathKind, PortMap};
pub use rules::{FlowMatch, RuleSet};

/// Active datapath flows at or below which the table counts as drained.
pub const COOL_DOWN_THRESHOLD: u64 = 32;
/// Polls before cool-down gives up.
pub const COOL_DOWN_CEILING_TICKS: u32 = 20;
/// Settle time after clearing rules.
pub const CLEAR_SETTLE_TICKS: u32 = 2;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FlowTableError {
    #[error("expected {expected} OpenFlow rules on bridge {bridge}, found {found}")]
    RuleCountMismatch {
        bridge: String,
        expected: u64,
        found: u64,
    },
    #[error("{matcher} rules support at most {max} flows, {requested} requested")]
    TooManyFlows {
        matcher: &'static str,
        requested: u32,
        max: u32,
    },
    #[error("datapath still has {active} active flows after {ticks} ticks of cool-down")]
    CoolDownTimeout { active: u64, ticks: u32 },
    #[error("cannot parse {what}: \"{output}\"")]
    Parse { what: &'static str, output: String },
    #[error("switch discovery: {0}")]
    Discovery(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

// ── Requests ────────────────────────────────────────────────────────

/// Rules one run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub flows: u32,
    /// OpenFlow port number (or `IN_PORT`) traffic enters on.
    pub src_port: String,
    /// OpenFlow port number (or `IN_PORT`) traffic leaves on.
    pub dst_port: String,
    pub bidirectional: bool,
}

/// Whether an exceeded cool-down aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolDownPolicy {
    Fatal,
    BestEffort,
}

/// Outcome of waiting for the datapath to learn the expected flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmUpOutcome {
    pub reached: bool,
    pub active: u64,
    pub ticks: u32,
}

#[derive(Debug, Clone)]
pub struct FlowTableSettings {
    pub rule_type: RuleType,
    pub matcher: FlowMatch,
    pub warm_up: bool,
    pub no_cool_down: bool,
    pub mac_swap: bool,
    pub src_mac: u64,
    pub dst_mac: u64,
}

impl FlowTableSettings {
    pub fn from_test_config(test: &TestConfig, mac_swap: bool) -> Self {
        Self {
            rule_type: test.rule_type,
            matcher: FlowMatch::for_flow_type(test.flow_type),
            warm_up: test.warm_up,
            no_cool_down: test.no_cool_down,
            mac_swap,
            src_mac: test.src_mac,
            dst_mac: test.dst_mac,
        }
    }
}

// ── Controller ──────────────────────────────────────────────────────

pub struct FlowTableController<'a> {
    dut: &'a dyn RemoteExecutor,
    pacer: &'a dyn Pacer,
    bridge: String,
    datapath: DatapathKind,
    tc_offload: bool,
    settings: FlowTableSettings,
}

impl<'a> FlowTableController<'a> {
    pub fn new(
        dut: &'a dyn RemoteExecutor,
        pacer: &'a dyn Pacer,
        bridge: &str,
        datapath: DatapathKind,
        tc_offload: bool,
        settings: FlowTableSettings,
    ) -> Self {
        Self {
            dut,
            pacer,
            bridge: bridge.to_string(),
            datapath,
            tc_offload,
            settings,
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Install the rules `spec` asks for, clearing the table first.
    ///
    /// A bidirectional request is two unidirectional installs with the
    /// endpoints swapped; the second keeps the first's rules and verifies
    /// the combined total.
    pub fn program(&self, spec: &ProgramSpec) -> Result<(), FlowTableError> {
        tracing::info!(
            bridge = %self.bridge,
            rule_type = %self.settings.rule_type,
            flows = spec.flows,
            src = %spec.src_port,
            dst = %spec.dst_port,
            bidirectional = spec.bidirectional,
            "programming OpenFlow rules"
        );

        match self.settings.rule_type {
            RuleType::None => {
                tracing::debug!("no rules installed for rule type none");
                Ok(())
            }
            RuleType::Normal => {
                self.clear()?;
                self.dut
                    .execute_checked(&format!("ovs-appctl fdb/flush {}", self.bridge))?;
                self.dut
                    .execute_checked(&format!("ovs-ofctl add-flow {} action=NORMAL", self.bridge))?;
                self.verify_rule_count(1)
            }
            RuleType::Port => {
                self.clear()?;
                self.add_port_rule(&spec.src_port, &spec.dst_port)?;
                if spec.bidirectional {
                    self.add_port_rule(&spec.dst_port, &spec.src_port)?;
                    self.verify_rule_count(2)
                } else {
                    self.verify_rule_count(1)
                }
            }
            RuleType::Flows => {
                let matcher = self.settings.matcher;
                if spec.flows > matcher.max_flows() {
                    return Err(FlowTableError::TooManyFlows {
                        matcher: matcher.name(),
                        requested: spec.flows,
                        max: matcher.max_flows(),
                    });
                }
                let forward = RuleSet {
                    matcher,
                    flows: spec.flows,
                    in_port: spec.src_port.clone(),
                    out_port: spec.dst_port.clone(),
                    base_mac: self.settings.dst_mac,
                };
                self.install(&forward, true, u64::from(spec.flows))?;

                if spec.bidirectional {
                    let reverse = RuleSet {
                        in_port: spec.dst_port.clone(),
                        out_port: spec.src_port.clone(),
                        base_mac: if self.settings.mac_swap {
                            self.settings.src_mac
                        } else {
                            self.settings.dst_mac
                        },
                        ..forward
                    };
                    self.install(&reverse, false, 2 * u64::from(spec.flows))?;
                }
                Ok(())
            }
        }
    }

    fn install(&self, rules: &RuleSet, clear: bool, expected_total: u64) -> Result<(), FlowTableError> {
        if clear {
            self.clear()?;
        }
        tracing::info!(
            flows = rules.flows,
            matcher = rules.matcher.name(),
            in_port = %rules.in_port,
            out_port = %rules.out_port,
            "adding OpenFlow rules"
        );
        self.dut
            .execute_with_input(&format!("ovs-ofctl add-flow {} -", self.bridge), &rules.to_batch())?
            .check("ovs-ofctl add-flow")?;
        self.verify_rule_count(expected_total)
    }

    fn add_port_rule(&self, src: &str, dst: &str) -> Result<(), FlowTableError> {
        self.dut.execute_checked(&format!(
            "ovs-ofctl add-flow {} in_port={src},action={dst}",
            self.bridge
        ))?;
        Ok(())
    }

    /// Rules currently installed on the bridge.
    pub fn rule_count(&self) -> Result<u64, FlowTableError> {
        let output = self
            .dut
            .execute_checked(&format!("ovs-ofctl dump-flows {}", self.bridge))?;
        Ok(count_flow_lines(&output.stdout))
    }

    fn verify_rule_count(&self, expected: u64) -> Result<(), FlowTableError> {
        let found = self.rule_count()?;
        if found != expected {
            return Err(FlowTableError::RuleCountMismatch {
                bridge: self.bridge.clone(),
                expected,
                found,
            });
        }
        tracing::debug!(rules = found, "OpenFlow rule count verified");
        Ok(())
    }

    /// Delete all rules, let the datapath drain, then settle.
    pub fn clear(&self) -> Result<(), FlowTableError> {
        tracing::info!(bridge = %self.bridge, "clearing OpenFlow rules");
        self.dut
            .execute_checked(&format!("ovs-ofctl del-flows {}", self.bridge))?;
        self.cool_down(CoolDownPolicy::BestEffort)?;
        self.pacer.pause(CLEAR_SETTLE_TICKS);
        Ok(())
    }

    /// Flows currently cached in the datapath.
    pub fn active_datapath_flows(&self) -> Result<u64, FlowTableError> {
        let dp = self.datapath.dpctl_name();
        match (self.datapath, self.tc_offload) {
            (DatapathKind::System, true) => {
                let output = self
                    .dut
                    .execute_checked(&format!("ovs-appctl dpctl/dump-flows {dp}"))?;
                Ok(output.stdout.lines().filter(|l| !l.trim().is_empty()).count() as u64)
            }
            _ => {
                let output = self
                    .dut
                    .execute_checked(&format!("ovs-appctl dpctl/show {dp}"))?;
                discovery::parse_flow_count(&output.stdout).ok_or_else(|| FlowTableError::Parse {
                    what: "datapath flow count",
                    output: output.stdout.trim().to_string(),
                })
            }
        }
    }

    /// Poll once per tick until at least `expected` datapath flows are
    /// active. A `timeout_ticks` of zero waits indefinitely.
    pub fn wait_for_active_flows(
        &self,
        expected: u64,
        timeout_ticks: u32,
    ) -> Result<WarmUpOutcome, FlowTableError> {
        let mut ticks = 0u32;
        let mut active = 0u64;

        while active < expected {
            ticks += 1;
            if timeout_ticks != 0 && ticks >= timeout_ticks {
                tracing::debug!(expected, active, ticks, "warm-up incomplete");
                return Ok(WarmUpOutcome {
                    reached: false,
                    active,
                    ticks,
                });
            }
            self.pacer.pause(1);
            active = self.active_datapath_flows()?;
        }
        tracing::debug!(expected, active, ticks, "warm-up complete");
        Ok(WarmUpOutcome {
            reached: true,
            active,
            ticks,
        })
    }

    /// Wait for the datapath to drain cached flows between runs.
    ///
    /// Only done when warm-up is on or cool-down was not disabled.
    pub fn cool_down(&self, policy: CoolDownPolicy) -> Result<(), FlowTableError> {
        if !self.settings.warm_up && self.settings.no_cool_down {
            return Ok(());
        }
        tracing::info!("flow table cool-down");

        let mut ticks = 0u32;
        let mut active = self.active_datapath_flows()?;
        while active > COOL_DOWN_THRESHOLD {
            ticks += 1;
            if ticks >= COOL_DOWN_CEILING_TICKS {
                match policy {
                    CoolDownPolicy::Fatal => {
                        return Err(FlowTableError::CoolDownTimeout { active, ticks })
                    }
                    CoolDownPolicy::BestEffort => {
                        tracing::warn!(active, ticks, "cool-down did not complete in time");
                        break;
                    }
                }
            }
            active = self.active_datapath_flows()?;
            self.pacer.pause(1);
        }
        Ok(())
    }
}

/// Rule lines in `ovs-ofctl dump-flows` output, without the reply header.
pub fn count_flow_lines(dump: &str) -> u64 {
    dump.lines()
        .filter(|line| {
            let line = line.trim();
            !line.is_empty() && !line.contains("_FLOW reply")
        })
        .count() as u64
}
