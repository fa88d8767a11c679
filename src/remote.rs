//! Remote command channel: one shell command on the device over SSH.

use crate::config::SshConfig;
use crate::error::{HarnessError, Result};
use crate::runner::{wait_with_timeout, CommandOutput};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// ssh reserves this status for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

pub trait RemoteChannel {
    /// Run `command` on the device whose sshd is forwarded to `port`.
    ///
    /// A command that ran and exited non-zero is an `Ok` output. Failing to
    /// reach the device at all is [`HarnessError::Connection`].
    fn send(&self, port: u16, command: &str) -> Result<CommandOutput>;
}

/// OpenSSH client against a forwarded local port.
#[derive(Debug, Clone)]
pub struct SshChannel {
    user: String,
    host: String,
    identity: Option<PathBuf>,
    connect_timeout: u64,
    command_timeout: Duration,
    verbose: bool,
}

impl SshChannel {
    pub fn from_config(config: &SshConfig, verbose: bool) -> Self {
        Self {
            user: config.user.clone(),
            host: config.host.clone(),
            identity: config.identity.clone(),
            connect_timeout: config.connect_timeout_secs,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            verbose,
        }
    }

    /// Arguments passed to `ssh`, target and command last.
    pub fn args(&self, port: u16, command: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "-q",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "BatchMode=yes",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout));
        if let Some(key) = &self.identity {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("-p".to_string());
        args.push(port.to_string());
        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());
        args
    }
}

impl RemoteChannel for SshChannel {
    fn send(&self, port: u16, command: &str) -> Result<CommandOutput> {
        if self.verbose {
            eprintln!("  [ssh:{}] {}", port, command);
        }

        let child = Command::new("ssh")
            .args(self.args(port, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| HarnessError::Connection {
                port,
                detail: format!("failed to spawn ssh: {}", e),
            })?;

        let output =
            wait_with_timeout(child, Some(self.command_timeout)).map_err(|e| {
                HarnessError::Connection {
                    port,
                    detail: format!("waiting for ssh: {}", e),
                }
            })?;

        classify(port, command, output, self.command_timeout)
    }
}

fn classify(port: u16, command: &str, output: CommandOutput, timeout: Duration) -> Result<CommandOutput> {
    match output.exit_code {
        SSH_TRANSPORT_FAILURE => Err(HarnessError::Connection {
            port,
            detail: non_empty(output.stderr_str().trim(), "ssh transport failure"),
        }),
        -1 => Err(HarnessError::Connection {
            port,
            detail: format!("'{}' timed out after {}s", command, timeout.as_secs()),
        }),
        _ => Ok(output),
    }
}

fn non_empty(s: &str, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> SshChannel {
        SshChannel::from_config(&SshConfig::default(), false)
    }

    #[test]
    fn builds_batch_mode_ssh_arguments() {
        let args = channel().args(2222, "aktualizr-info");
        let joined = args.join(" ");
        assert!(joined.starts_with("-q -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no"));
        assert!(joined.contains("-o BatchMode=yes -o ConnectTimeout=10"));
        assert!(joined.ends_with("-p 2222 root@localhost aktualizr-info"));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn identity_file_is_passed() {
        let mut config = SshConfig::default();
        config.identity = Some(PathBuf::from("/keys/id_ed25519"));
        let args = SshChannel::from_config(&config, false).args(2222, "true");
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/keys/id_ed25519");
    }

    #[test]
    fn exit_255_is_a_connection_error() {
        let out = CommandOutput {
            stdout: Vec::new(),
            stderr: b"ssh: connect to host localhost port 2222: Connection refused\n".to_vec(),
            exit_code: 255,
        };
        match classify(2222, "hostname", out, Duration::from_secs(60)) {
            Err(HarnessError::Connection { port, detail }) => {
                assert_eq!(port, 2222);
                assert!(detail.contains("Connection refused"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn remote_failure_is_plain_output() {
        let out = CommandOutput {
            stdout: Vec::new(),
            stderr: b"Can't open database\n".to_vec(),
            exit_code: 1,
        };
        let out = classify(2222, "aktualizr-info", out, Duration::from_secs(60)).unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[test]
    fn timeout_is_a_connection_error() {
        let out = CommandOutput {
            exit_code: -1,
            ..CommandOutput::default()
        };
        let err = classify(2222, "aktualizr once", out, Duration::from_secs(60)).unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out after 60s"));
    }
}
