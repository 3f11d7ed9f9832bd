//! Simulated VM: runs the testpmd endpoint and keeps its statistics log.

use std::fmt::Write as _;

use switchperf_core::remote::{CommandOutput, RemoteError, RemoteExecutor};
use switchperf_core::vm::RESULTS_FILE;

use crate::ovs::{injected_failure, COMMAND_NOT_FOUND};
use crate::world::{Host, SimWorld, VmMode};
use crate::{lock, SharedWorld};

/// Shell on the simulated VM.
#[derive(Clone)]
pub struct SimVm {
    world: SharedWorld,
}

impl SimVm {
    pub(crate) fn new(world: SharedWorld) -> Self {
        Self { world }
    }
}

impl RemoteExecutor for SimVm {
    fn run(&self, command: &str, _input: Option<&str>) -> Result<CommandOutput, RemoteError> {
        let mut world = lock(&self.world);
        world.log_command(Host::Vm, command);
        if let Some(failure) = injected_failure(&world, command) {
            return Ok(failure);
        }
        Ok(interpret(&mut world, command.trim()))
    }
}

fn interpret(world: &mut SimWorld, command: &str) -> CommandOutput {
    if command.starts_with("TESTPMD_PID=$(pidof testpmd)") {
        return match world.vm.mode.take() {
            Some(_) => CommandOutput::ok(""),
            None => CommandOutput::failed(1, "kill: usage: kill [-s sigspec | -n signum | -sigspec] pid"),
        };
    }
    if command.contains("testpmd ") {
        let Some(mode) = command
            .split_whitespace()
            .find_map(|arg| arg.strip_prefix("--forward-mode="))
        else {
            return CommandOutput::failed(1, "testpmd: missing --forward-mode");
        };
        let mode = match mode {
            "rxonly" => VmMode::Receive,
            "io" | "macswap" => VmMode::Loopback,
            other => return CommandOutput::failed(1, format!("testpmd: invalid forward mode {other}")),
        };
        tracing::debug!(?mode, "testpmd started");
        world.vm.mode = Some(mode);
        world.vm.samples = Some(Vec::new());
        return CommandOutput::ok("");
    }
    if command == format!("cat {RESULTS_FILE}") {
        let Some(samples) = &world.vm.samples else {
            return CommandOutput::failed(1, format!("cat: {RESULTS_FILE}: No such file or directory"));
        };
        let mut out = String::from("testpmd> show port stats 0\n");
        for pps in samples {
            let _ = write!(
                out,
                "\n  ######################## NIC statistics for port 0  ########################\n  \
                 Throughput (since last show)\n  Rx-pps:     {pps:>10}          Rx-bps:  {:>12}\n  \
                 Tx-pps:              0          Tx-bps:             0\n  \
                 ############################################################################\n",
                pps * 512
            );
        }
        return CommandOutput::ok(out);
    }
    CommandOutput::failed(COMMAND_NOT_FOUND, format!("sh: {command}: command not found"))
}
