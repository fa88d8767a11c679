//! Shared state for one harness run.

use super::Suite;
use crate::build::{ensure_included, Bitbake, BuildSystem, ConfigOverrides};
use crate::config::HarnessConfig;
use crate::emulator::{EmulatorHost, QemuHost};
use crate::error::Result;
use crate::remote::{RemoteChannel, SshChannel};
use crate::runner::{CommandRunner, ShellRunner};
use colored::Colorize;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

/// How the harness waits. Swapped out in tests.
pub type Sleeper = Rc<dyn Fn(Duration)>;

/// Everything a scenario touches, owned in one place and passed explicitly.
pub struct RunContext {
    pub(crate) config: HarnessConfig,
    pub(crate) build: Box<dyn BuildSystem>,
    pub(crate) host: Box<dyn EmulatorHost>,
    pub(crate) remote: Box<dyn RemoteChannel>,
    pub(crate) local: Box<dyn CommandRunner>,
    pub(crate) sleeper: Sleeper,
    /// SSH ports of sessions that are still running.
    pub(crate) live_ports: BTreeSet<u16>,
    /// Suites whose one-time targets have been built.
    pub(crate) prepared: BTreeSet<Suite>,
}

impl RunContext {
    pub fn new(
        config: HarnessConfig,
        build: Box<dyn BuildSystem>,
        host: Box<dyn EmulatorHost>,
        remote: Box<dyn RemoteChannel>,
        local: Box<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            build,
            host,
            remote,
            local,
            sleeper: Rc::new(std::thread::sleep),
            live_ports: BTreeSet::new(),
            prepared: BTreeSet::new(),
        }
    }

    /// Real bitbake, QEMU and ssh, configured from `config`.
    pub fn from_config(config: HarnessConfig, verbose: bool) -> Result<Self> {
        let local_conf = config.build_dir.join("conf").join("local.conf");
        if ensure_included(&local_conf, &config.include_file)? {
            println!("  Added 'include {}' to {}", config.include_file, local_conf.display());
        }
        let overrides = ConfigOverrides::open(config.include_path())?;
        if overrides.stale_lines() > 0 {
            eprintln!(
                "  {} dropped {} override line(s) left in {} by an earlier run",
                "WARN:".yellow(),
                overrides.stale_lines(),
                config.include_path().display()
            );
        }
        let build = Bitbake::new(ShellRunner::new(verbose), config.build_dir.clone(), overrides);
        let host = QemuHost::from_config(&config);
        let remote = SshChannel::from_config(&config.ssh, verbose);
        Ok(Self::new(
            config,
            Box::new(build),
            Box::new(host),
            Box::new(remote),
            Box::new(ShellRunner::new(verbose)),
        ))
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn live_ports(&self) -> &BTreeSet<u16> {
        &self.live_ports
    }
}
