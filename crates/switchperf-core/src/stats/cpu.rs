//! CPU accounting reports.
//!
//! Per-thread usage comes from `pidstat -u -t` on the switch daemons and
//! per-CPU system usage from `mpstat -P ALL`; both print an `Average:`
//! block when interrupted, which is all that is read here.

use serde::Serialize;

/// Switch daemon thread groups, matched by thread-name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadClass {
    Pmd,
    Revalidator,
    Handler,
    Urcu,
    Other,
}

impl ThreadClass {
    const PREFIXES: [(&'static str, ThreadClass); 4] = [
        ("pmd", ThreadClass::Pmd),
        ("revalidator", ThreadClass::Revalidator),
        ("handler", ThreadClass::Handler),
        ("urcu", ThreadClass::Urcu),
    ];

    pub fn classify(thread_name: &str) -> Self {
        Self::PREFIXES
            .iter()
            .find(|(prefix, _)| thread_name.starts_with(prefix))
            .map(|(_, class)| *class)
            .unwrap_or(ThreadClass::Other)
    }
}

/// CPU usage in percent, summed over threads or CPUs for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CpuUtilizationSample {
    pub pmd: f64,
    pub revalidator: f64,
    pub handler: f64,
    pub urcu: f64,
    pub other: f64,

    pub usr: f64,
    pub nice: f64,
    pub sys: f64,
    pub iowait: f64,
    pub irq: f64,
    pub soft: f64,
    pub steal: f64,
    pub guest: f64,
    pub gnice: f64,
    pub idle: f64,
}

impl CpuUtilizationSample {
    pub fn add_thread(&mut self, thread_name: &str, percent: f64) {
        let slot = match ThreadClass::classify(thread_name) {
            ThreadClass::Pmd => &mut self.pmd,
            ThreadClass::Revalidator => &mut self.revalidator,
            ThreadClass::Handler => &mut self.handler,
            ThreadClass::Urcu => &mut self.urcu,
            ThreadClass::Other => &mut self.other,
        };
        *slot += percent;
    }

    /// Everything the switch daemons used.
    pub fn switch_total(&self) -> f64 {
        self.pmd + self.revalidator + self.handler + self.urcu + self.other
    }

    /// Everything the system spent outside idle.
    pub fn system_total(&self) -> f64 {
        self.usr
            + self.nice
            + self.sys
            + self.iowait
            + self.irq
            + self.soft
            + self.steal
            + self.guest
            + self.gnice
    }
}

/// Sum the `Average:` thread lines of a `pidstat -u -t` report into
/// `sample`. Returns the number of threads accounted.
///
/// Newer sysstat releases print a `%wait` column before `%CPU`; the layout
/// is taken from the header.
pub fn parse_thread_report(report: &str, sample: &mut CpuUtilizationSample) -> usize {
    let cpu_column = if report.contains("%wait") { 8 } else { 7 };
    let mut threads = 0;

    for line in report.lines() {
        let Some((fields, name)) = line.split_once("|__") else {
            continue;
        };
        let cols: Vec<&str> = fields.split_whitespace().collect();
        // Average: UID - TID %usr %system %guest [%wait] %CPU CPU
        if cols.first() != Some(&"Average:") || cols.get(2) != Some(&"-") {
            continue;
        }
        let Some(percent) = cols.get(cpu_column).and_then(|v| v.parse::<f64>().ok()) else {
            tracing::debug!(line, "skipping unparsable pidstat line");
            continue;
        };
        sample.add_thread(name.trim(), percent);
        threads += 1;
    }
    threads
}

/// Sum the per-CPU `Average:` lines of an `mpstat -P ALL` report into
/// `sample`. The `all` line is skipped. Returns the number of CPUs read.
pub fn parse_system_report(report: &str, sample: &mut CpuUtilizationSample) -> usize {
    let mut cpus = 0;

    for line in report.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let per_cpu = cols.len() >= 2 && cols[0] == "Average:" && cols[1].parse::<u32>().is_ok();
        if !per_cpu {
            continue;
        }
        let values: Option<Vec<f64>> = cols[2..].iter().map(|v| v.parse().ok()).collect();
        let Some(v) = values.filter(|v| v.len() == 10) else {
            tracing::warn!(line, columns = cols.len(), "skipping unrecognised mpstat line");
            continue;
        };
        sample.usr += v[0];
        sample.nice += v[1];
        sample.sys += v[2];
        sample.iowait += v[3];
        sample.irq += v[4];
        sample.soft += v[5];
        sample.steal += v[6];
        sample.guest += v[7];
        sample.gnice += v[8];
        sample.idle += v[9];
        cpus += 1;
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIDSTAT_WAIT: &str = "\
Linux 5.14.0 (dut) \t01/01/2026 \t_x86_64_\t(8 CPU)

Average:      UID      TGID       TID    %usr %system  %guest   %wait    %CPU   CPU  Command
Average:        0      1234         -  150.00   10.00    0.00    0.00  160.00     -  ovs-vswitchd
Average:        0         -      1234    0.50    0.50    0.00    0.00    1.00     -  |__ovs-vswitchd
Average:        0         -      1240   99.00    1.00    0.00    0.00  100.00     -  |__pmd-c05/id:32
Average:        0         -      1241   49.00    1.00    0.00    0.00   50.00     -  |__pmd-c06/id:33
Average:        0         -      1250    2.00    1.00    0.00    0.00    3.00     -  |__revalidator4
Average:        0         -      1251    1.00    1.00    0.00    0.00    2.00     -  |__handler1
Average:        0         -      1252    0.25    0.25    0.00    0.00    0.50     -  |__urcu3
";

    const PIDSTAT_NO_WAIT: &str = "\
Average:      UID      TGID       TID    %usr %system  %guest    %CPU   CPU  Command
Average:        0         -      1240   99.00    1.00    0.00  100.00     -  |__pmd7
Average:        0         -      1241    1.00    1.00    0.00    2.00     -  |__ovsdb-server
";

    const MPSTAT: &str = "\
Average:     CPU    %usr   %nice    %sys %iowait    %irq   %soft  %steal  %guest  %gnice   %idle
Average:     all   25.00    0.00    2.00    0.00    0.00    1.00    0.00    0.00    0.00   72.00
Average:       0   90.00    0.00    5.00    0.00    0.00    2.00    0.00    0.00    0.00    3.00
Average:       1   10.00    1.00    3.00    0.50    0.25    1.00    0.00    2.00    0.00   82.25
";

    #[test]
    fn classifies_by_prefix() {
        assert_eq!(ThreadClass::classify("pmd-c05/id:32"), ThreadClass::Pmd);
        assert_eq!(ThreadClass::classify("revalidator4"), ThreadClass::Revalidator);
        assert_eq!(ThreadClass::classify("handler12"), ThreadClass::Handler);
        assert_eq!(ThreadClass::classify("urcu2"), ThreadClass::Urcu);
        assert_eq!(ThreadClass::classify("ovs-vswitchd"), ThreadClass::Other);
        assert_eq!(ThreadClass::classify("dpdk-watchdog"), ThreadClass::Other);
    }

    #[test]
    fn thread_report_with_wait_column() {
        let mut sample = CpuUtilizationSample::default();
        assert_eq!(parse_thread_report(PIDSTAT_WAIT, &mut sample), 6);
        assert_eq!(sample.pmd, 150.0);
        assert_eq!(sample.revalidator, 3.0);
        assert_eq!(sample.handler, 2.0);
        assert_eq!(sample.urcu, 0.5);
        assert_eq!(sample.other, 1.0);
        assert_eq!(sample.switch_total(), 156.5);
    }

    #[test]
    fn thread_report_without_wait_column() {
        let mut sample = CpuUtilizationSample::default();
        assert_eq!(parse_thread_report(PIDSTAT_NO_WAIT, &mut sample), 2);
        assert_eq!(sample.pmd, 100.0);
        assert_eq!(sample.other, 2.0);
    }

    #[test]
    fn system_report_sums_per_cpu_lines() {
        let mut sample = CpuUtilizationSample::default();
        assert_eq!(parse_system_report(MPSTAT, &mut sample), 2);
        assert_eq!(sample.usr, 100.0);
        assert_eq!(sample.nice, 1.0);
        assert_eq!(sample.sys, 8.0);
        assert_eq!(sample.iowait, 0.5);
        assert_eq!(sample.irq, 0.25);
        assert_eq!(sample.soft, 3.0);
        assert_eq!(sample.guest, 2.0);
        assert_eq!(sample.idle, 85.25);
        assert_eq!(sample.system_total(), 114.75);
    }

    #[test]
    fn system_report_skips_lines_without_gnice() {
        let old_sysstat = "\
Average:     CPU    %usr   %nice    %sys %iowait    %irq   %soft  %steal  %guest   %idle
Average:     all   25.00    0.00    2.00    0.00    0.00    1.00    0.00    0.00   72.00
Average:       0   90.00    0.00    5.00    0.00    0.00    2.00    0.00    0.00    3.00
";
        let mut sample = CpuUtilizationSample::default();
        assert_eq!(parse_system_report(old_sysstat, &mut sample), 0);
        assert_eq!(sample.usr, 0.0);

        let mixed = format!("{MPSTAT}Average:       2   50.00    0.00\n");
        let mut sample = CpuUtilizationSample::default();
        assert_eq!(parse_system_report(&mixed, &mut sample), 2);
        assert_eq!(sample.usr, 100.0);
    }

    #[test]
    fn empty_reports_leave_sample_untouched() {
        let mut sample = CpuUtilizationSample::default();
        assert_eq!(parse_thread_report("", &mut sample), 0);
        assert_eq!(parse_system_report("garbage\n", &mut sample), 0);
        assert_eq!(sample, CpuUtilizationSample::default());
    }
}
