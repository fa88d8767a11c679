//! Local command execution.
//!
//! Every host-side command (bitbake, bitbake-layers, tar, native tools, ssh)
//! goes through here so output capture, timeouts and `ignore_status` behave
//! the same everywhere.

use crate::error::{HarnessError, IoContext, Result};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Captured result of a command, local or remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; -1 when the process was killed or had no code.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_contains(&self, needle: &str) -> bool {
        contains_bytes(&self.stdout, needle.as_bytes())
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        contains_bytes(&self.stderr, needle.as_bytes())
    }

    /// stderr followed by stdout, for failure messages.
    pub fn transcript(&self) -> String {
        let mut out = self.stderr_str();
        out.push_str(&self.stdout_str());
        out
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// A shell command line plus how to run it.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    pub line: String,
    pub ignore_status: bool,
    pub env: Vec<(String, String)>,
    pub native_sysroot: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            ..Self::default()
        }
    }

    pub fn ignore_status(mut self) -> Self {
        self.ignore_status = true;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Prepend `<sysroot>/usr/bin` and `<sysroot>/bin` to `PATH`.
    pub fn native_sysroot(mut self, sysroot: impl Into<PathBuf>) -> Self {
        self.native_sysroot = Some(sysroot.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runs commands on the host.
pub trait CommandRunner {
    fn run(&self, cmd: &ShellCommand) -> Result<CommandOutput>;
}

/// Real runner: `sh -c <line>`, blocking, with captured output.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    /// Echo each command to stderr before running it.
    pub verbose: bool,
}

impl ShellRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &ShellCommand) -> Result<CommandOutput> {
        if self.verbose {
            eprintln!("  $ {}", cmd.line);
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&cmd.line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        for (k, v) in &cmd.env {
            command.env(k, v);
        }
        if let Some(sysroot) = &cmd.native_sysroot {
            command.env("PATH", native_path(sysroot, std::env::var("PATH").ok()));
        }

        let child = command
            .spawn()
            .io_context(|| format!("spawning '{}'", cmd.line))?;
        let output = wait_with_timeout(child, cmd.timeout)
            .io_context(|| format!("waiting for '{}'", cmd.line))?;

        if !output.success() && !cmd.ignore_status {
            return Err(HarnessError::CommandExecution {
                command: cmd.line.clone(),
                status: output.exit_code,
                output: output.transcript(),
            });
        }
        Ok(output)
    }
}

/// Single-quote `arg` for `sh`.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

fn native_path(sysroot: &Path, current: Option<String>) -> String {
    let mut parts = vec![
        sysroot.join("usr/bin").display().to_string(),
        sysroot.join("bin").display().to_string(),
    ];
    if let Some(current) = current.filter(|p| !p.is_empty()) {
        parts.push(current);
    }
    parts.join(":")
}

/// Wait for `child`, reading both pipes on their own threads so neither can
/// fill up and block the process. On timeout the child and its process group
/// are killed and the exit code is -1.
///
/// Spawn the child with `process_group(0)` so that whatever it started dies
/// with it; otherwise a surviving grandchild keeps the pipes open.
pub fn wait_with_timeout(
    mut child: Child,
    timeout: Option<Duration>,
) -> std::io::Result<CommandOutput> {
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if timeout.is_some_and(|t| start.elapsed() > t) {
            kill_process_group(&mut child);
            break None;
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    Ok(CommandOutput {
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
    })
}

fn kill_process_group(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: the child has not been reaped, so no other group can carry its
    // pid. If it does not lead a group this fails with ESRCH.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
