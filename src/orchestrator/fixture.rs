//! Per-scenario resources and their guaranteed release.

use super::context::RunContext;
use crate::build::{layer_present, BuildVars, Layer};
use crate::config::HarnessConfig;
use crate::emulator::{kvm_for_machine, EmulatorSession, LaunchRequest};
use crate::error::{HarnessError, Result};
use crate::retry::{self, Check, Polled, RetrySchedule};
use crate::runner::{CommandOutput, ShellCommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// How far a scenario got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    LayerRegistered,
    Configured,
    Built,
    Booted,
    Verifying,
    TornDown,
}

impl Phase {
    pub fn description(&self) -> &'static str {
        match self {
            Phase::Init => "initialization",
            Phase::LayerRegistered => "layer registration",
            Phase::Configured => "configuration",
            Phase::Built => "build",
            Phase::Booted => "boot",
            Phase::Verifying => "verification",
            Phase::TornDown => "teardown",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Which configured polling schedule to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Provisioning,
    HsmInit,
    ResourceKill,
}

/// Resources one scenario acquired. Everything recorded here is released by
/// [`Fixture::teardown`], which also runs on drop.
pub struct Fixture<'a> {
    ctx: &'a mut RunContext,
    phase: Phase,
    added_layer: Option<PathBuf>,
    config_mark: Option<usize>,
    session: Option<EmulatorSession>,
    torn_down: bool,
    warnings: Vec<String>,
}

impl<'a> Fixture<'a> {
    pub fn new(ctx: &'a mut RunContext) -> Self {
        Self {
            ctx,
            phase: Phase::Init,
            added_layer: None,
            config_mark: None,
            session: None,
            torn_down: false,
            warnings: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn reach(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    pub(crate) fn begin_verification(&mut self) {
        self.reach(Phase::Verifying);
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.ctx.config
    }

    // --- setup ---

    /// Add `layer` unless a layer of that name is already registered. Only a
    /// layer added here is removed again at teardown.
    pub fn register_layer(&mut self, layer: &Layer) -> Result<()> {
        let layers = self.ctx.build.list_layers()?;
        if !layer_present(&layers, &layer.name) {
            self.ctx.build.add_layer(&layer.path)?;
            self.added_layer = Some(layer.path.clone());
        }
        self.reach(Phase::LayerRegistered);
        Ok(())
    }

    /// Push override lines. They are popped again at teardown.
    pub fn configure<S: AsRef<str>>(&mut self, lines: &[S]) -> Result<()> {
        if self.config_mark.is_none() {
            self.config_mark = Some(self.ctx.build.config_mark());
        }
        for line in lines {
            self.ctx.build.append_config(line.as_ref())?;
        }
        self.reach(Phase::Configured);
        Ok(())
    }

    pub fn clean_all(&mut self, recipes: &[&str]) -> Result<()> {
        self.ctx.build.clean_all(recipes)
    }

    pub fn build(&mut self, targets: &[&str]) -> Result<()> {
        self.ctx.build.build(targets)?;
        self.reach(Phase::Built);
        Ok(())
    }

    /// Build the image and boot it. Returns the forwarded SSH port.
    pub fn boot(&mut self, mut request: LaunchRequest) -> Result<u16> {
        if self.session.is_some() {
            return Err(HarnessError::Emulator(
                "a VM is already running for this scenario".to_string(),
            ));
        }

        self.build(&[request.image.as_str()])?;

        if request.kvm.is_none() {
            request.kvm = match self.ctx.config.qemu.kvm {
                Some(kvm) => Some(kvm),
                None => {
                    let value = self.ctx.build.get_var("QEMU_USE_KVM", None)?;
                    kvm_for_machine(value.as_deref(), &request.machine)
                }
            };
        }

        let mut session = self.ctx.host.launch(&request)?;
        let port = session.ssh_port();
        if !self.ctx.live_ports.insert(port) {
            if let Err(e) = session.terminate() {
                self.warnings
                    .push(format!("stopping VM on conflicting port {}: {}", port, e));
            }
            return Err(HarnessError::Emulator(format!(
                "SSH port {} is already held by a running VM",
                port
            )));
        }
        self.session = Some(session);
        self.reach(Phase::Booted);
        Ok(port)
    }

    // --- verification helpers ---

    fn session(&self) -> Result<&EmulatorSession> {
        self.session
            .as_ref()
            .ok_or_else(|| HarnessError::Emulator("no VM booted for this scenario".to_string()))
    }

    pub fn ssh_port(&self) -> Result<u16> {
        Ok(self.session()?.ssh_port())
    }

    /// Machine of the booted VM, or the configured machine before boot.
    pub fn machine(&self) -> &str {
        match &self.session {
            Some(s) => s.machine(),
            None => &self.ctx.config.machine,
        }
    }

    /// Run `command` on the device.
    pub fn remote(&mut self, command: &str) -> Result<CommandOutput> {
        let port = self.ssh_port()?;
        self.ctx.remote.send(port, command)
    }

    /// Run `command` on the device and require exit 0.
    pub fn remote_ok(&mut self, command: &str) -> Result<CommandOutput> {
        let out = self.remote(command)?;
        crate::verify!(
            out.success(),
            "'{}' exited {} on the device: {}",
            command,
            out.exit_code,
            out.transcript()
        );
        Ok(out)
    }

    pub fn vars(&mut self, names: &[&str], recipe: Option<&str>) -> Result<BuildVars> {
        self.ctx.build.get_vars(names, recipe)
    }

    pub fn var(&mut self, name: &str, recipe: Option<&str>) -> Result<Option<String>> {
        self.ctx.build.get_var(name, recipe)
    }

    pub fn run_local(&mut self, cmd: &ShellCommand) -> Result<CommandOutput> {
        self.ctx.local.run(cmd)
    }

    pub fn sleep(&self, duration: Duration) {
        (self.ctx.sleeper)(duration)
    }

    pub fn schedule(&self, kind: ScheduleKind) -> RetrySchedule {
        let schedules = &self.ctx.config.schedules;
        match kind {
            ScheduleKind::Provisioning => schedules.provisioning.schedule(),
            ScheduleKind::HsmInit => schedules.hsm_init.schedule(),
            ScheduleKind::ResourceKill => schedules.resource_kill.schedule(),
        }
    }

    /// [`retry::poll`] with this fixture's sleeper, handing the fixture to
    /// each probe.
    pub fn poll<T, P>(&mut self, kind: ScheduleKind, mut probe: P) -> Result<Polled<T>>
    where
        P: FnMut(&mut Self, usize) -> Result<Check<T>>,
    {
        let schedule = self.schedule(kind);
        let sleeper = self.ctx.sleeper.clone();
        retry::poll(&schedule, |d| sleeper(d), |attempt| probe(&mut *self, attempt))
    }

    // --- teardown ---

    /// Release everything this fixture acquired. Runs once; later calls
    /// return no warnings. Every step runs even if an earlier one failed.
    pub fn teardown(&mut self) -> Vec<String> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;

        if let Some(mut session) = self.session.take() {
            let port = session.ssh_port();
            if let Err(e) = session.terminate() {
                self.warnings.push(format!("stopping VM on port {}: {}", port, e));
            }
            self.ctx.live_ports.remove(&port);
        }

        if let Some(mark) = self.config_mark.take() {
            if let Err(e) = self.ctx.build.truncate_config(mark) {
                self.warnings.push(format!("restoring config overrides: {}", e));
            }
        }

        if let Some(path) = self.added_layer.take() {
            if let Err(e) = self.ctx.build.remove_layer(&path) {
                self.warnings
                    .push(format!("removing layer {}: {}", path.display(), e));
            }
        }

        self.phase = Phase::TornDown;
        std::mem::take(&mut self.warnings)
    }
}

impl Drop for Fixture<'_> {
    fn drop(&mut self) {
        for warning in self.teardown() {
            eprintln!("  {} {}", "WARN:".yellow(), warning);
        }
    }
}
