//! Host-side integration tests for the aktualizr OTA client.
//!
//! This library provides the harness the scenarios run on:
//! - Build driver over bitbake / bitbake-layers, with scoped config overrides
//! - QEMU emulator sessions with a forwarded SSH port
//! - Remote commands over SSH and bounded polling of device state
//! - Fixtures that release layers, overrides and VMs however a scenario ends
//!
//! Scenarios are plain values implementing [`Scenario`]; the binary only
//! selects and runs them.

pub mod build;
pub mod checks;
pub mod config;
pub mod emulator;
pub mod error;
pub mod orchestrator;
pub mod remote;
pub mod report;
pub mod retry;
pub mod runner;
pub mod scenarios;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use build::{Bitbake, BuildSystem, BuildVars, ConfigOverrides, Layer};
pub use config::{HarnessConfig, DEFAULT_CONFIG_FILE};
pub use emulator::{EmulatorHost, EmulatorSession, LaunchRequest, QemuBuilder, QemuHost};
pub use error::{HarnessError, Result};
pub use orchestrator::{run_all, run_scenario, Fixture, Phase, RunContext, Scenario, Setup, Suite};
pub use remote::{RemoteChannel, SshChannel};
pub use report::{Outcome, RunReport, ScenarioRecord};
pub use retry::{poll, Check, Polled, RetrySchedule};
pub use runner::{CommandOutput, CommandRunner, ShellCommand, ShellRunner};
pub use scenarios::{all_scenarios, select};
