//! Packet receiver / loopback inside the VM (DPDK testpmd).
//!
//! testpmd is launched detached and prints port statistics once a second
//! into `~/results.txt`; the receive rate is read back from there. It is
//! stopped by name, so only one endpoint per VM is supported.

use thiserror::Error;

use crate::config::VmConfig;
use crate::pace::Pacer;
use crate::remote::{RemoteError, RemoteExecutor};
use crate::topology::VmRole;

pub const RESULTS_FILE: &str = "~/results.txt";

/// Shell loop waiting up to 30 s for testpmd to reach 150% CPU, i.e. for
/// its forwarding cores to be busy polling.
const WAIT_FOR_TESTPMD: &str = r#"for i in $(seq 1 30); do LOAD=$(top -b -n 2 -d 1 -p $(pidof testpmd) | tail -1 | awk '{print $9}'); LOAD=${LOAD%%.*}; [ "${LOAD:-0}" -ge 150 ] && break; done"#;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM endpoint is not configured: {0}")]
    NotConfigured(&'static str),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub struct VmEndpoint<'a> {
    vm: &'a dyn RemoteExecutor,
    pacer: &'a dyn Pacer,
    pci: String,
    queues: u32,
    rxd: u32,
    txd: u32,
    startup_delay_s: Option<u64>,
    mac_swap: bool,
}

impl<'a> VmEndpoint<'a> {
    pub fn new(
        vm: &'a dyn RemoteExecutor,
        pacer: &'a dyn Pacer,
        config: &VmConfig,
    ) -> Result<Self, VmError> {
        let pci = config
            .nic_pci
            .clone()
            .ok_or(VmError::NotConfigured("vm.nic_pci"))?;
        Ok(Self {
            vm,
            pacer,
            pci,
            queues: config.nic_queues,
            rxd: config.nic_rxd,
            txd: config.nic_txd,
            startup_delay_s: config.testpmd_startup_delay_s,
            mac_swap: config.mac_swap,
        })
    }

    /// testpmd invocation for `role`.
    pub fn start_command(&self, role: VmRole) -> String {
        // core 0 for the console, one forwarding core per queue
        let cpu_mask = u64::MAX >> (63 - self.queues.min(63));
        let fwd_mask = cpu_mask & !0x1;
        let forward_mode = match role {
            VmRole::Receiver => "rxonly",
            VmRole::Loopback if self.mac_swap => "macswap",
            VmRole::Loopback => "io",
        };
        let wait = if self.startup_delay_s.is_none() {
            format!("; {WAIT_FOR_TESTPMD}")
        } else {
            String::new()
        };
        format!(
            "rm -f {RESULTS_FILE}; nohup sh -c \"(while sleep 1; do echo show port stats 0; done | \
             testpmd -c {cpu_mask:x} -n 4 --socket-mem 2048,0 -a {pci} -- --burst 64 -i \
             --rxq={q} --txq={q} --rxd={rxd} --txd={txd} --auto-start --forward-mode={forward_mode} \
             --port-topology=chained --coremask={fwd_mask:x})\" &> {RESULTS_FILE} &{wait}",
            pci = self.pci,
            q = self.queues,
            rxd = self.rxd,
            txd = self.txd,
        )
    }

    pub fn start(&self, role: VmRole) -> Result<(), VmError> {
        tracing::info!(?role, queues = self.queues, "starting VM endpoint");
        self.vm.execute_checked(&self.start_command(role))?;
        if let Some(delay) = self.startup_delay_s {
            self.pacer.pause(u32::try_from(delay).unwrap_or(u32::MAX));
        }
        Ok(())
    }

    /// Interrupt testpmd and give it a moment to print its totals. Not
    /// running is only a warning.
    pub fn stop(&self) -> Result<(), VmError> {
        let output = self.vm.execute(
            "TESTPMD_PID=$(pidof testpmd); kill -SIGINT $TESTPMD_PID && timeout 4 tail --pid=$TESTPMD_PID -f /dev/null",
        )?;
        if !output.success() {
            tracing::warn!(status = output.status, "testpmd was not running on the VM");
        }
        Ok(())
    }

    /// Every `Rx-pps` value testpmd has printed so far, oldest first.
    pub fn rx_samples(&self) -> Result<Vec<f64>, VmError> {
        let output = self.vm.execute_checked(&format!("cat {RESULTS_FILE}"))?;
        Ok(parse_rx_pps(&output.stdout))
    }
}

pub fn parse_rx_pps(report: &str) -> Vec<f64> {
    report
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Rx-pps:"))
        .filter_map(|rest| rest.split_whitespace().next()?.parse::<f64>().ok())
        .collect()
}
