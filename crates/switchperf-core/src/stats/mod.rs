//! Counter collection and rate reduction.
//!
//! Three sources update independently of each other: the switch's own
//! port counters (`ovs-ofctl dump-ports`), the traffic generator's
//! snapshot history, and the VM endpoint's instantaneous receive rate.
//! This module parses the switch-side reports and turns raw series from
//! all three into rates by trimming the ramp transients at each end.

pub mod cpu;

use serde::Serialize;
use thiserror::Error;

use crate::remote::{RemoteError, RemoteExecutor};
use crate::traffic::{rx_pps_series, tx_pps_series, SnapshotSeries};

pub use cpu::{CpuUtilizationSample, ThreadClass};

/// Edge samples dropped from generator rate series.
pub const GENERATOR_EXCLUDE_EDGES: usize = 2;
/// Edge samples dropped from port counter series.
pub const PORT_COUNTER_TRIM: usize = 2;
/// Edge samples dropped from VM rate series after the warm-up skip.
pub const VM_SAMPLE_TRIM: usize = 5;

/// Inter-frame gap, preamble and CRC added to every frame on the wire.
pub const ETH_FRAME_OVERHEAD_BYTES: u64 = 12 + 8 + 4;

pub const CPU_THREAD_REPORT: &str = "/var/tmp/cpu_ovs.txt";
pub const CPU_SYSTEM_REPORT: &str = "/var/tmp/cpu_mpstat.txt";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("cannot parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },
    #[error("not enough samples to calculate a rate: need {needed}, have {got}")]
    InsufficientSamples { needed: usize, got: usize },
    #[error("{counter} counter of port {port} went backwards ({start} -> {end})")]
    CounterRegression {
        port: String,
        counter: &'static str,
        start: u64,
        end: u64,
    },
    #[error("counter series decreases at sample {index} ({previous} -> {next})")]
    NonMonotonicSeries {
        index: usize,
        previous: u64,
        next: u64,
    },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

fn parse_error(what: &'static str, detail: impl Into<String>) -> StatsError {
    StatsError::Parse {
        what,
        detail: detail.into(),
    }
}

// ── Port Counters ───────────────────────────────────────────────────

/// Counters of one switch port at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortCounterSnapshot {
    pub port: String,
    pub tx_packets: u64,
    pub tx_drop: u64,
    pub rx_packets: u64,
    pub rx_drop: u64,
}

/// Difference between two snapshots of the same port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortCounterDelta {
    pub tx_packets: u64,
    pub tx_drop: u64,
    pub rx_packets: u64,
    pub rx_drop: u64,
}

impl PortCounterSnapshot {
    /// Counters accumulated between `self` and the later snapshot `end`.
    ///
    /// A counter that went backwards means the port was reset mid-run and
    /// the measurement is void.
    pub fn delta(&self, end: &PortCounterSnapshot) -> Result<PortCounterDelta, StatsError> {
        let diff = |counter: &'static str, start: u64, stop: u64| {
            stop.checked_sub(start)
                .ok_or_else(|| StatsError::CounterRegression {
                    port: self.port.clone(),
                    counter,
                    start,
                    end: stop,
                })
        };
        Ok(PortCounterDelta {
            tx_packets: diff("tx_packets", self.tx_packets, end.tx_packets)?,
            tx_drop: diff("tx_drop", self.tx_drop, end.tx_drop)?,
            rx_packets: diff("rx_packets", self.rx_packets, end.rx_packets)?,
            rx_drop: diff("rx_drop", self.rx_drop, end.rx_drop)?,
        })
    }
}

/// Parse the counters of `of_port` from an `ovs-ofctl dump-ports` report.
///
/// The port line carries the `rx` counters and the line right after it
/// the `tx` counters. A value reported as `?` (unsupported by the port)
/// reads as zero; a missing field is an error.
pub fn parse_port_counters(dump: &str, of_port: &str) -> Result<PortCounterSnapshot, StatsError> {
    let mut lines = dump.lines();
    let rx_fields = lines
        .by_ref()
        .find_map(|line| port_rx_fields(line, of_port))
        .ok_or_else(|| parse_error("port counters", format!("no entry for port {of_port}")))?;
    let tx_fields = lines
        .next()
        .and_then(|line| line.trim_start().strip_prefix("tx "))
        .ok_or_else(|| parse_error("port counters", format!("no tx line for port {of_port}")))?;

    Ok(PortCounterSnapshot {
        port: of_port.to_string(),
        rx_packets: counter_field(rx_fields, "pkts", of_port)?,
        rx_drop: counter_field(rx_fields, "drop", of_port)?,
        tx_packets: counter_field(tx_fields, "pkts", of_port)?,
        tx_drop: counter_field(tx_fields, "drop", of_port)?,
    })
}

/// `  port  1: rx pkts=..., ...` -> `pkts=..., ...` when the port matches.
fn port_rx_fields<'a>(line: &'a str, of_port: &str) -> Option<&'a str> {
    let rest = line.trim_start().strip_prefix("port")?;
    let (id, rest) = rest.split_once(':')?;
    if id.trim().trim_matches('"') != of_port {
        return None;
    }
    rest.trim_start().strip_prefix("rx ")
}

fn counter_field(fields: &str, key: &str, of_port: &str) -> Result<u64, StatsError> {
    let value = fields
        .split(',')
        .filter_map(|f| f.trim().split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.trim())
        .ok_or_else(|| {
            parse_error("port counters", format!("port {of_port} has no \"{key}\" field"))
        })?;

    if value == "?" {
        tracing::warn!(port = of_port, field = key, "counter not supported by port, using 0");
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| parse_error("port counters", format!("{key}={value} on port {of_port}")))
}

// ── Rates ───────────────────────────────────────────────────────────

/// Mean of consecutive first differences of a cumulative counter series,
/// after discarding `trim` samples from each end.
pub fn rate_from_counter_series(series: &[u64], trim: usize) -> Result<f64, StatsError> {
    let needed = 2 * trim + 2;
    if series.len() < needed {
        return Err(StatsError::InsufficientSamples {
            needed,
            got: series.len(),
        });
    }

    let window = &series[trim..series.len() - trim];
    let mut total = 0u64;
    for (index, pair) in window.windows(2).enumerate() {
        let step = pair[1]
            .checked_sub(pair[0])
            .ok_or(StatsError::NonMonotonicSeries {
                index: trim + index + 1,
                previous: pair[0],
                next: pair[1],
            })?;
        total += step;
    }
    Ok(total as f64 / (window.len() - 1) as f64)
}

/// Mean of instantaneous rate samples, excluding `exclude_edges` samples
/// at each end.
pub fn rate_from_windowed_pps(series: &[f64], exclude_edges: usize) -> Result<f64, StatsError> {
    let needed = 2 * exclude_edges + 1;
    if series.len() < needed {
        return Err(StatsError::InsufficientSamples {
            needed,
            got: series.len(),
        });
    }
    Ok(mean(&series[exclude_edges..series.len() - exclude_edges]))
}

/// Receive rate reported by a VM endpoint.
///
/// The first `skip` samples were taken during warm-up and are dropped;
/// more than ten must remain, of which the outer five at each end are
/// ramp transients.
pub fn vm_receive_rate(samples: &[f64], skip: usize) -> Result<f64, StatsError> {
    let remaining = samples.get(skip..).unwrap_or(&[]);
    let needed = 2 * VM_SAMPLE_TRIM + 1;
    if remaining.len() < needed {
        return Err(StatsError::InsufficientSamples {
            needed,
            got: remaining.len(),
        });
    }
    Ok(mean(&remaining[VM_SAMPLE_TRIM..remaining.len() - VM_SAMPLE_TRIM]))
}

pub fn generator_rx_rate(series: &SnapshotSeries) -> Result<f64, StatsError> {
    rate_from_windowed_pps(&rx_pps_series(series), GENERATOR_EXCLUDE_EDGES)
}

pub fn generator_tx_rate(series: &SnapshotSeries) -> Result<f64, StatsError> {
    rate_from_windowed_pps(&tx_pps_series(series), GENERATOR_EXCLUDE_EDGES)
}

/// Percentage of transmitted packets that never arrived, in `[0, 100]`.
///
/// Nothing transmitted counts as total loss.
pub fn loss_percentage(tx_packets: u64, rx_packets: u64) -> f64 {
    if tx_packets == 0 {
        return 100.0;
    }
    let loss = 100.0 - (rx_packets as f64 / tx_packets as f64 * 100.0);
    loss.clamp(0.0, 100.0)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

// ── Wire Math ───────────────────────────────────────────────────────

/// Highest frame rate a link of `line_bps` carries at `packet_size`.
pub fn eth_max_pps(line_bps: u64, packet_size: u32) -> f64 {
    let bits = (u64::from(packet_size) + ETH_FRAME_OVERHEAD_BYTES) * 8;
    line_bps as f64 / bits as f64
}

/// Link utilization in percent for `pps` frames of `packet_size`.
pub fn eth_utilization(line_bps: u64, packet_size: u32, pps: f64) -> f64 {
    if line_bps == 0 {
        return 0.0;
    }
    let bits = (u64::from(packet_size) + ETH_FRAME_OVERHEAD_BYTES) * 8;
    (pps * bits as f64 / line_bps as f64 * 100.0).min(100.0)
}

// ── Collector ───────────────────────────────────────────────────────

/// Reads counters and CPU accounting from the device under test.
pub struct StatCollector<'a> {
    dut: &'a dyn RemoteExecutor,
}

impl<'a> StatCollector<'a> {
    pub fn new(dut: &'a dyn RemoteExecutor) -> Self {
        Self { dut }
    }

    pub fn snapshot_port_counters(
        &self,
        bridge: &str,
        of_port: &str,
    ) -> Result<PortCounterSnapshot, StatsError> {
        let output = self
            .dut
            .execute_checked(&format!("ovs-ofctl dump-ports {bridge} {of_port}"))?;
        parse_port_counters(&output.stdout, of_port)
    }

    /// Launch per-thread accounting of the switch daemons and per-CPU
    /// system accounting in the background.
    pub fn start_cpu_monitoring(&self) -> Result<(), StatsError> {
        let command = format!(
            "sh -c \"rm -f {CPU_THREAD_REPORT} {CPU_SYSTEM_REPORT}; \
             nohup pidstat -u -t -p $(pidof ovs-vswitchd),$(pidof ovsdb-server) 1 > {CPU_THREAD_REPORT} 2>&1 & \
             nohup mpstat -P ALL 1 > {CPU_SYSTEM_REPORT} 2>&1 &\""
        );
        self.dut.execute_checked(&command)?;
        Ok(())
    }

    /// Interrupt the monitors so they print their averages. Monitors that
    /// already exited are not an error.
    pub fn stop_cpu_monitoring(&self) -> Result<(), StatsError> {
        let output = self
            .dut
            .execute("kill -SIGINT $(pidof pidstat) $(pidof mpstat)")?;
        if !output.success() {
            tracing::warn!(
                status = output.status,
                output = %output.output.trim(),
                "CPU monitors were not running"
            );
        }
        Ok(())
    }

    pub fn sample_cpu(&self) -> Result<CpuUtilizationSample, StatsError> {
        let threads = self
            .dut
            .execute_checked(&format!("cat {CPU_THREAD_REPORT}"))?;
        let system = self
            .dut
            .execute_checked(&format!("cat {CPU_SYSTEM_REPORT}"))?;

        let mut sample = CpuUtilizationSample::default();
        let thread_count = cpu::parse_thread_report(&threads.stdout, &mut sample);
        let cpu_count = cpu::parse_system_report(&system.stdout, &mut sample);
        if thread_count == 0 {
            tracing::warn!("no per-thread CPU averages reported");
        }
        tracing::debug!(
            threads = thread_count,
            cpus = cpu_count,
            switch_total = sample.switch_total(),
            "CPU sample"
        );
        Ok(sample)
    }

    /// Record a call-graph profile of the switch daemon in the background.
    pub fn start_perf(&self, tag: &str) -> Result<(), StatsError> {
        let command = format!(
            "sh -c \"nohup perf record -g -p $(pidof ovs-vswitchd) \
             -o /var/tmp/perf_{tag}.data > /dev/null 2>&1 &\""
        );
        self.dut.execute_checked(&command)?;
        Ok(())
    }

    pub fn stop_perf(&self) -> Result<(), StatsError> {
        let output = self.dut.execute("kill -SIGINT $(pidof perf)")?;
        if !output.success() {
            tracing::warn!(status = output.status, "perf was not running");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::{CounterGroup, GeneratorSnapshot};

    const DUMP: &str = "\
OFPST_PORT reply (xid=0x2): 2 ports
  port  1: rx pkts=1000, bytes=64000, drop=3, errs=0, frame=0, over=0, crc=0
           tx pkts=990, bytes=63360, drop=0, errs=0, coll=0
  port 10: rx pkts=5, bytes=320, drop=?, errs=0, frame=?, over=?, crc=?
           tx pkts=77, bytes=4928, drop=2, errs=0, coll=?
";

    #[test]
    fn parses_the_requested_port() {
        let snap = parse_port_counters(DUMP, "1").unwrap();
        assert_eq!(snap.rx_packets, 1000);
        assert_eq!(snap.rx_drop, 3);
        assert_eq!(snap.tx_packets, 990);
        assert_eq!(snap.tx_drop, 0);

        let snap = parse_port_counters(DUMP, "10").unwrap();
        assert_eq!(snap.rx_packets, 5);
        assert_eq!(snap.tx_packets, 77);
        assert_eq!(snap.tx_drop, 2);
    }

    #[test]
    fn unknown_counter_reads_as_zero() {
        let snap = parse_port_counters(DUMP, "10").unwrap();
        assert_eq!(snap.rx_drop, 0);
    }

    #[test]
    fn missing_port_or_field_is_a_parse_error() {
        assert!(matches!(
            parse_port_counters(DUMP, "2"),
            Err(StatsError::Parse { .. })
        ));

        let no_drop = "  port  1: rx pkts=1, bytes=64\n           tx pkts=1, bytes=64, drop=0\n";
        assert!(matches!(
            parse_port_counters(no_drop, "1"),
            Err(StatsError::Parse { .. })
        ));

        let no_tx = "  port  1: rx pkts=1, bytes=64, drop=0\n";
        assert!(matches!(
            parse_port_counters(no_tx, "1"),
            Err(StatsError::Parse { .. })
        ));
    }

    #[test]
    fn garbage_counter_value_is_a_parse_error() {
        let dump = "  port  1: rx pkts=lots, drop=0\n           tx pkts=1, drop=0\n";
        assert!(parse_port_counters(dump, "1").is_err());
    }

    #[test]
    fn delta_between_snapshots() {
        let start = PortCounterSnapshot {
            port: "1".into(),
            tx_packets: 100,
            tx_drop: 1,
            rx_packets: 200,
            rx_drop: 0,
        };
        let end = PortCounterSnapshot {
            port: "1".into(),
            tx_packets: 150,
            tx_drop: 1,
            rx_packets: 260,
            rx_drop: 4,
        };
        let delta = start.delta(&end).unwrap();
        assert_eq!(delta.tx_packets, 50);
        assert_eq!(delta.tx_drop, 0);
        assert_eq!(delta.rx_packets, 60);
        assert_eq!(delta.rx_drop, 4);
    }

    #[test]
    fn negative_delta_is_flagged() {
        let start = PortCounterSnapshot {
            port: "20".into(),
            rx_packets: 500,
            ..Default::default()
        };
        let end = PortCounterSnapshot {
            port: "20".into(),
            rx_packets: 10,
            ..Default::default()
        };
        match start.delta(&end) {
            Err(StatsError::CounterRegression {
                port,
                counter,
                start,
                end,
            }) => {
                assert_eq!(port, "20");
                assert_eq!(counter, "rx_packets");
                assert_eq!((start, end), (500, 10));
            }
            other => panic!("expected regression, got {other:?}"),
        }
    }

    #[test]
    fn counter_series_rate() {
        assert_eq!(
            rate_from_counter_series(&[0, 10, 20, 30, 40, 50], 0).unwrap(),
            10.0
        );
        // ramp samples at both ends are discarded
        assert_eq!(
            rate_from_counter_series(&[0, 1, 11, 21, 31, 32], 1).unwrap(),
            10.0
        );
    }

    #[test]
    fn counter_series_needs_enough_samples() {
        assert!(matches!(
            rate_from_counter_series(&[0, 10, 20, 30, 40], 2),
            Err(StatsError::InsufficientSamples { needed: 6, got: 5 })
        ));
        assert!(matches!(
            rate_from_counter_series(&[7], 0),
            Err(StatsError::InsufficientSamples { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn counter_series_must_not_decrease() {
        assert!(matches!(
            rate_from_counter_series(&[0, 10, 5, 20], 0),
            Err(StatsError::NonMonotonicSeries { index: 2, .. })
        ));
    }

    #[test]
    fn windowed_pps_averages_interior_samples() {
        // 18 samples; the 14 interior ones are all 1000
        let mut series = vec![10.0, 500.0];
        series.extend(std::iter::repeat(1000.0).take(14));
        series.extend([700.0, 0.0]);
        assert_eq!(series.len(), 18);
        assert_eq!(rate_from_windowed_pps(&series, 2).unwrap(), 1000.0);

        assert!(matches!(
            rate_from_windowed_pps(&[1.0, 2.0, 3.0, 4.0], 2),
            Err(StatsError::InsufficientSamples { needed: 5, got: 4 })
        ));
    }

    #[test]
    fn vm_rate_skips_warm_up_and_trims() {
        let mut samples = vec![0.0; 3]; // warm-up
        samples.extend([1.0; 5]);
        samples.extend([50.0; 4]);
        samples.extend([1.0; 5]);
        assert_eq!(vm_receive_rate(&samples, 3).unwrap(), 50.0);

        assert!(matches!(
            vm_receive_rate(&[1.0; 10], 0),
            Err(StatsError::InsufficientSamples { needed: 11, got: 10 })
        ));
        assert!(vm_receive_rate(&[1.0; 12], 20).is_err());
    }

    #[test]
    fn generator_rates_come_from_snapshot_groups() {
        let mut series = SnapshotSeries::new();
        for (i, pps) in [0.0, 5.0, 100.0, 100.0, 100.0, 5.0, 0.0].into_iter().enumerate() {
            series.insert(
                i as u64 * 1000,
                GeneratorSnapshot {
                    tx_total: Some(CounterGroup { packets: 0, pps: pps * 2.0 }),
                    rx_total: Some(CounterGroup { packets: 0, pps }),
                },
            );
        }
        assert_eq!(generator_rx_rate(&series).unwrap(), 100.0);
        assert_eq!(generator_tx_rate(&series).unwrap(), 200.0);
    }

    #[test]
    fn loss_is_clamped() {
        assert_eq!(loss_percentage(1000, 1000), 0.0);
        assert_eq!(loss_percentage(1000, 900), 10.0);
        assert_eq!(loss_percentage(1000, 1100), 0.0);
        assert_eq!(loss_percentage(0, 0), 100.0);
    }

    #[test]
    fn wire_math() {
        // 64 byte packets plus CRC, preamble and gap: 704 bits each
        let pps = eth_max_pps(10_000_000_000, 64);
        assert!((pps - 14_204_545.45).abs() < 1.0);
        assert!((eth_utilization(10_000_000_000, 64, pps) - 100.0).abs() < 1e-9);
        assert_eq!(eth_utilization(10_000_000_000, 64, pps * 2.0), 100.0);
        assert!((eth_utilization(10_000_000_000, 64, pps / 2.0) - 50.0).abs() < 1e-9);
    }
}
