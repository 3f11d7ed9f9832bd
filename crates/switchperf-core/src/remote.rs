//! Command execution on the device under test and the VM.
//!
//! Everything the orchestrator does to a host goes through
//! [`RemoteExecutor`]: a shell command in, exit status plus captured
//! output back. [`SshExecutor`] reaches a remote host, [`LocalExecutor`]
//! runs on the orchestrating machine, and the simulator provides its own
//! implementations for tests.

use std::io::{self, Write as _};
use std::process::{Command, Stdio};

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to run \"{command}\": {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("\"{command}\" exited with status {status}: {output}")]
    NonZeroExit {
        command: String,
        status: i32,
        output: String,
    },
}

// ── Command Output ──────────────────────────────────────────────────

/// Result of one executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    /// Standard output only.
    pub stdout: String,
    /// Standard output followed by standard error.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        let stdout = stdout.into();
        Self {
            status: 0,
            output: stdout.clone(),
            stdout,
        }
    }

    pub fn failed(status: i32, output: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit status into [`RemoteError::NonZeroExit`].
    pub fn check(self, command: &str) -> Result<Self, RemoteError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::NonZeroExit {
                command: command.to_string(),
                status: self.status,
                output: self.output.trim().to_string(),
            })
        }
    }
}

// ── Executor Trait ──────────────────────────────────────────────────

/// Runs shell commands on one host.
pub trait RemoteExecutor {
    /// Run `command`, feeding `input` on stdin when given.
    ///
    /// Only transport failures are errors here; a command that ran and
    /// exited non-zero is reported through [`CommandOutput::status`].
    fn run(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, RemoteError>;

    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.run(command, None)
    }

    fn execute_with_input(&self, command: &str, input: &str) -> Result<CommandOutput, RemoteError> {
        self.run(command, Some(input))
    }

    /// Run `command` and fail unless it exits zero.
    fn execute_checked(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.execute(command)?.check(command)
    }
}

// ── SSH ─────────────────────────────────────────────────────────────

/// Executes commands on a remote host through the system `ssh` client.
///
/// With a password configured the call is wrapped in `sshpass`; without
/// one, key-based auth in batch mode is assumed.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    pub host: String,
    pub user: String,
    pub password: Option<String>,
}

impl SshExecutor {
    pub fn new(host: &str, user: &str, password: Option<&str>) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            password: password.map(str::to_string),
        }
    }

    fn command(&self, remote_command: &str) -> Command {
        let target = format!("{}@{}", self.user, self.host);
        let ssh_args = [
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "LogLevel=ERROR",
        ];

        match &self.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.args(["-p", password, "ssh"])
                    .args(ssh_args)
                    .arg(target)
                    .arg(remote_command);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.args(ssh_args)
                    .args(["-o", "BatchMode=yes"])
                    .arg(target)
                    .arg(remote_command);
                cmd
            }
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn run(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, RemoteError> {
        tracing::trace!(host = %self.host, command, "ssh exec");
        spawn_and_collect(self.command(command), command, input)
    }
}

// ── Local ───────────────────────────────────────────────────────────

/// Executes commands with `sh -c` on the orchestrating host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl RemoteExecutor for LocalExecutor {
    fn run(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, RemoteError> {
        tracing::trace!(command, "local exec");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        spawn_and_collect(cmd, command, input)
    }
}

fn spawn_and_collect(
    mut cmd: Command,
    command: &str,
    input: Option<&str>,
) -> Result<CommandOutput, RemoteError> {
    let io_err = |source| RemoteError::Io {
        command: command.to_string(),
        source,
    };

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn().map_err(io_err)?;
    let stdin = child.stdin.take();
    // feed stdin while the output pipes drain; stdin closes on drop for EOF
    let (written, output) = std::thread::scope(|scope| {
        let writer = scope.spawn(move || match (input, stdin) {
            (Some(data), Some(mut stdin)) => stdin.write_all(data.as_bytes()),
            _ => Ok(()),
        });
        let output = child.wait_with_output();
        (writer.join(), output)
    });
    let output = output.map_err(io_err)?;
    written
        .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")))
        .map_err(io_err)?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let mut combined = stdout.clone();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout,
        output: combined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_through_success() {
        let out = CommandOutput::ok("hello\n");
        let checked = out.clone().check("echo hello").unwrap();
        assert_eq!(checked, out);
    }

    #[test]
    fn check_reports_status_and_output() {
        let err = CommandOutput::failed(2, "no such bridge\n")
            .check("ovs-ofctl dump-flows br0")
            .unwrap_err();
        match err {
            RemoteError::NonZeroExit {
                command,
                status,
                output,
            } => {
                assert_eq!(command, "ovs-ofctl dump-flows br0");
                assert_eq!(status, 2);
                assert_eq!(output, "no such bridge");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn local_executor_captures_streams_and_status() {
        let out = LocalExecutor
            .execute("echo out; echo err >&2; exit 3")
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, "out\n");
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[test]
    fn local_executor_feeds_stdin() {
        let out = LocalExecutor
            .execute_with_input("wc -l", "a\nb\nc\n")
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "3");
    }

    #[test]
    fn local_executor_echoes_large_input() {
        let input = "0123456789abcdef\n".repeat(64 * 1024);
        let out = LocalExecutor.execute_with_input("cat", &input).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.len(), input.len());
    }

    #[test]
    fn ssh_command_uses_sshpass_only_with_password() {
        let with = SshExecutor::new("10.0.0.1", "root", Some("secret"));
        let cmd = with.command("true");
        assert_eq!(cmd.get_program(), "sshpass");

        let without = SshExecutor::new("10.0.0.1", "root", None);
        let cmd = without.command("true");
        assert_eq!(cmd.get_program(), "ssh");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"root@10.0.0.1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("true"));
    }
}
