use serde::Deserialize;
use switchperf_core::flow_table::DatapathKind;

/// Capacity model of the simulated testbed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimProfile {
    /// Line rate of every physical link.
    pub line_bps: u64,
    /// Packets per second the switch forwards with a handful of flows.
    pub switch_capacity_pps: f64,
    /// Flow count at which forwarding capacity has halved.
    pub flow_scale: f64,
    /// Packets per second the VM endpoint can receive.
    pub vm_capacity_pps: u64,
    /// Datapath flows learned per tick while traffic hits the rules.
    pub learn_per_tick: u64,
    /// Datapath flows expiring per tick once traffic stops.
    pub decay_per_tick: u64,
    /// Relative capacity noise per tick, `[0, 1)`.
    pub jitter: f64,
    pub seed: u64,
    pub tc_offload: bool,
    /// Forced datapath; derived from the interface names when unset.
    #[serde(skip)]
    pub datapath: Option<DatapathKind>,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            line_bps: 10_000_000_000,
            switch_capacity_pps: 8_000_000.0,
            flow_scale: 100_000.0,
            vm_capacity_pps: 6_000_000,
            learn_per_tick: 200_000,
            decay_per_tick: 500_000,
            jitter: 0.0,
            seed: 0,
            tc_offload: false,
            datapath: None,
        }
    }
}

/// Misbehaviour the simulated testbed can be told to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Every `add-flow` batch loses its last rule.
    DropRule,
    /// The datapath always reports this many active flows.
    StuckDatapathFlows(u64),
    /// The interface's switch counters restart from zero at `at_tick`.
    CounterReset { interface: String, at_tick: u64 },
    /// Any DUT or VM command containing the pattern exits non-zero.
    FailCommand(String),
    /// The traffic generator refuses to remove a configured stream.
    FailUnconfigure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_profile_keeps_defaults() {
        let profile: SimProfile = toml::from_str(
            r#"
            switch_capacity_pps = 2000000.0
            jitter = 0.05
            seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(profile.switch_capacity_pps, 2_000_000.0);
        assert_eq!(profile.seed, 7);
        assert_eq!(profile.vm_capacity_pps, SimProfile::default().vm_capacity_pps);
        assert!(profile.datapath.is_none());
    }
}
