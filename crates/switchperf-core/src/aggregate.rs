//! Reshapes per-run results into series for reporting.
//!
//! Results are keyed by flow count and packet size. Keys may arrive as
//! text, so both are ordered naturally (`64 < 128 < 1514`), never
//! lexically.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::runner::RunResult;
use crate::stats::CpuUtilizationSample;

// ── Natural Key ─────────────────────────────────────────────────────

/// A key compared naturally, with digit runs compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_number(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<u32> for NaturalKey {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for NaturalKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for NaturalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // natord ignores whitespace; fall back to bytes so only equal keys tie
        natord::compare(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for NaturalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for NaturalKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_number() {
            Some(n) => serializer.serialize_u64(n),
            None => serializer.serialize_str(&self.0),
        }
    }
}

// ── Series ──────────────────────────────────────────────────────────

/// Packet-size ordered results for one flow count.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSeries {
    pub flows: NaturalKey,
    pub packet_sizes: Vec<NaturalKey>,
    /// Packets per second.
    pub throughput_pps: Vec<f64>,
    pub cpu: Vec<CpuUtilizationSample>,
    /// Achieved load in percent of line rate, zero-loss searches only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offered_load: Option<Vec<f64>>,
    /// Residual loss in percent, zero-loss searches only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_percent: Option<Vec<f64>>,
}

/// Per flow count series, in ascending flow-count order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSeries {
    pub zero_loss: bool,
    pub series: Vec<FlowSeries>,
}

impl ResultSeries {
    pub fn get(&self, flows: &NaturalKey) -> Option<&FlowSeries> {
        self.series.iter().find(|s| &s.flows == flows)
    }
}

/// Group `(flows, packet_size, result)` triples by flow count.
pub fn group_by_flow_count<'r>(
    results: impl IntoIterator<Item = (NaturalKey, NaturalKey, &'r RunResult)>,
    zero_loss: bool,
) -> ResultSeries {
    let mut grouped: BTreeMap<NaturalKey, BTreeMap<NaturalKey, &RunResult>> = BTreeMap::new();
    for (flows, packet_size, result) in results {
        grouped.entry(flows).or_default().insert(packet_size, result);
    }

    let series = grouped
        .into_iter()
        .map(|(flows, by_size)| {
            let results: Vec<&RunResult> = by_size.values().copied().collect();
            FlowSeries {
                flows,
                packet_sizes: by_size.keys().cloned().collect(),
                throughput_pps: results.iter().map(|r| r.throughput_pps).collect(),
                cpu: results.iter().map(|r| r.cpu).collect(),
                offered_load: zero_loss
                    .then(|| results.iter().map(|r| r.offered_load).collect()),
                loss_percent: zero_loss
                    .then(|| results.iter().map(|r| r.loss_percent).collect()),
            }
        })
        .collect();

    ResultSeries { zero_loss, series }
}

// ── Aggregator ──────────────────────────────────────────────────────

/// Collects the results of one topology's suite.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    zero_loss: bool,
    results: BTreeMap<(NaturalKey, NaturalKey), RunResult>,
}

impl ResultAggregator {
    pub fn new(zero_loss: bool) -> Self {
        Self {
            zero_loss,
            results: BTreeMap::new(),
        }
    }

    /// Record the result for `(flows, packet_size)`, replacing any
    /// earlier one.
    pub fn insert(
        &mut self,
        flows: impl Into<NaturalKey>,
        packet_size: impl Into<NaturalKey>,
        result: RunResult,
    ) {
        self.results
            .insert((flows.into(), packet_size.into()), result);
    }

    pub fn get(&self, flows: impl Into<NaturalKey>, packet_size: impl Into<NaturalKey>) -> Option<&RunResult> {
        self.results.get(&(flows.into(), packet_size.into()))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn group_by_flow_count(&self) -> ResultSeries {
        group_by_flow_count(
            self.results
                .iter()
                .map(|((flows, size), result)| (flows.clone(), size.clone(), result)),
            self.zero_loss,
        )
    }
}
