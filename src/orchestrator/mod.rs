//! Test case orchestrator.
//!
//! Each scenario runs through the same phases:
//!
//! ```text
//! Init -> LayerRegistered -> Configured -> Built -> Booted -> Verifying -> TornDown
//! ```
//!
//! Steps a scenario does not need are skipped. Whatever was acquired is
//! released by the fixture, however the scenario ended.

mod context;
mod fixture;

pub use context::{RunContext, Sleeper};
pub use fixture::{Fixture, Phase, ScheduleKind};

use crate::build::Layer;
use crate::config::HarnessConfig;
use crate::emulator::LaunchRequest;
use crate::error::{HarnessError, Result};
use crate::report::{Outcome, RunReport, ScenarioRecord};
use colored::Colorize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Scenario groups. Scenarios of one suite share one-time preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Suite {
    General,
    Tools,
    AutoProv,
    ManualControl,
    ImplicitProv,
    Hsm,
    Secondary,
    Primary,
    ResourceControl,
}

impl Suite {
    pub const ALL: [Suite; 9] = [
        Suite::General,
        Suite::Tools,
        Suite::AutoProv,
        Suite::ManualControl,
        Suite::ImplicitProv,
        Suite::Hsm,
        Suite::Secondary,
        Suite::Primary,
        Suite::ResourceControl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Suite::General => "general",
            Suite::Tools => "tools",
            Suite::AutoProv => "auto-prov",
            Suite::ManualControl => "manual-control",
            Suite::ImplicitProv => "implicit-prov",
            Suite::Hsm => "hsm",
            Suite::Secondary => "secondary",
            Suite::Primary => "primary",
            Suite::ResourceControl => "resource-control",
        }
    }

    /// Targets built once, before the first scenario of the suite.
    pub fn prepare_targets(&self) -> &'static [&'static str] {
        match self {
            Suite::Tools => &["aktualizr-native"],
            _ => &[],
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Suite {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Suite::ALL
            .into_iter()
            .find(|suite| suite.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Suite::ALL.iter().map(Suite::name).collect();
                HarnessError::Config(format!(
                    "unknown suite '{}' (expected one of: {})",
                    s,
                    names.join(", ")
                ))
            })
    }
}

/// What a scenario needs before verification starts.
#[derive(Debug, Clone, Default)]
pub struct Setup {
    pub layer: Option<Layer>,
    pub config: Vec<String>,
    pub clean: Vec<String>,
    pub build: Vec<String>,
    pub launch: Option<LaunchRequest>,
}

impl Setup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boot `image` on the configured machine, registering the machine
    /// layer if it is missing and pinning `MACHINE`.
    pub fn qemu(config: &HarnessConfig, image: &str) -> Self {
        let mut launch = LaunchRequest::new(&config.machine).image(image);
        launch.efi = config.qemu.efi;
        launch.gui = config.qemu.gui;
        Self {
            layer: Some(Layer {
                name: config.layer.name.clone(),
                path: config.layer_path(),
                priority: None,
            }),
            config: vec![format!("MACHINE = \"{}\"", config.machine)],
            launch: Some(launch),
            ..Self::default()
        }
    }

    pub fn config(mut self, line: impl Into<String>) -> Self {
        self.config.push(line.into());
        self
    }

    pub fn clean(mut self, recipes: &[&str]) -> Self {
        self.clean.extend(recipes.iter().map(|r| r.to_string()));
        self
    }

    pub fn build(mut self, targets: &[&str]) -> Self {
        self.build.extend(targets.iter().map(|t| t.to_string()));
        self
    }
}

pub trait Scenario {
    fn suite(&self) -> Suite;
    fn name(&self) -> &'static str;
    fn describe(&self) -> &'static str;
    fn setup(&self, config: &HarnessConfig) -> Setup;
    fn verify(&self, fx: &mut Fixture) -> Result<()>;

    fn id(&self) -> String {
        format!("{}/{}", self.suite(), self.name())
    }
}

type PhaseResult = std::result::Result<(), (Phase, HarnessError)>;

fn drive(fx: &mut Fixture, scenario: &dyn Scenario, setup: &Setup, prepare: &[&str]) -> PhaseResult {
    let at = |phase: Phase| move |e: HarnessError| (phase, e);

    if let Some(layer) = &setup.layer {
        fx.register_layer(layer).map_err(at(Phase::LayerRegistered))?;
    }
    if !setup.config.is_empty() {
        fx.configure(&setup.config).map_err(at(Phase::Configured))?;
    }
    if !setup.clean.is_empty() {
        let recipes: Vec<&str> = setup.clean.iter().map(String::as_str).collect();
        fx.clean_all(&recipes).map_err(at(Phase::Built))?;
    }
    let targets: Vec<&str> = prepare
        .iter()
        .copied()
        .chain(setup.build.iter().map(String::as_str))
        .collect();
    if !targets.is_empty() {
        fx.build(&targets).map_err(at(Phase::Built))?;
    }
    if let Some(request) = &setup.launch {
        fx.boot(request.clone()).map_err(at(Phase::Booted))?;
    }

    fx.begin_verification();
    scenario.verify(fx).map_err(at(Phase::Verifying))
}

/// Run one scenario start to finish. Never panics on scenario failure and
/// always tears down.
pub fn run_scenario(ctx: &mut RunContext, scenario: &dyn Scenario) -> ScenarioRecord {
    println!(
        "{} {}: {}",
        ">>".cyan(),
        scenario.id().bold(),
        scenario.describe()
    );
    let start = Instant::now();

    let suite = scenario.suite();
    let setup = scenario.setup(&ctx.config);
    let prepare: Vec<&str> = if ctx.prepared.contains(&suite) {
        Vec::new()
    } else {
        suite.prepare_targets().to_vec()
    };

    let mut fx = Fixture::new(ctx);
    let result = drive(&mut fx, scenario, &setup, &prepare);
    let reached = fx.phase();
    let warnings = fx.teardown();
    drop(fx);

    if !prepare.is_empty() && reached >= Phase::Built {
        ctx.prepared.insert(suite);
    }

    let (outcome, phase, detail) = match result {
        Ok(()) => (Outcome::Passed, reached, None),
        Err((phase, e)) if e.is_skip() => (Outcome::Skipped, phase, Some(e.to_string())),
        Err((phase, e)) => (Outcome::Failed, phase, Some(e.to_string())),
    };

    let record = ScenarioRecord {
        suite: suite.to_string(),
        name: scenario.name().to_string(),
        outcome,
        phase,
        detail,
        duration_secs: start.elapsed().as_secs_f64(),
        warnings,
    };
    record.print();
    record
}

/// Run `scenarios` in order. With `fail_fast`, stop after the first failure.
pub fn run_all(ctx: &mut RunContext, scenarios: &[&dyn Scenario], fail_fast: bool) -> RunReport {
    let mut report = RunReport::start();
    for scenario in scenarios {
        let record = run_scenario(ctx, *scenario);
        let failed = record.outcome == Outcome::Failed;
        report.results.push(record);
        if failed && fail_fast {
            println!("{}", "Stopping after first failure (--fail-fast)".yellow());
            break;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fakes;
    use std::cell::Cell;

    struct Probe {
        suite: Suite,
        setup: Setup,
        result: fn() -> Result<()>,
        verified: Cell<usize>,
    }

    impl Probe {
        fn new(suite: Suite, setup: Setup, result: fn() -> Result<()>) -> Self {
            Self {
                suite,
                setup,
                result,
                verified: Cell::new(0),
            }
        }
    }

    impl Scenario for Probe {
        fn suite(&self) -> Suite {
            self.suite
        }
        fn name(&self) -> &'static str {
            "probe"
        }
        fn describe(&self) -> &'static str {
            "test probe"
        }
        fn setup(&self, _config: &HarnessConfig) -> Setup {
            self.setup.clone()
        }
        fn verify(&self, fx: &mut Fixture) -> Result<()> {
            self.verified.set(self.verified.get() + 1);
            assert_eq!(fx.phase(), Phase::Verifying);
            (self.result)()
        }
    }

    fn pass() -> Result<()> {
        Ok(())
    }

    fn fail() -> Result<()> {
        Err(HarnessError::Assertion("device ID missing".to_string()))
    }

    fn skip() -> Result<()> {
        Err(HarnessError::MissingConfiguration("SOTA_PACKED_CREDENTIALS".to_string()))
    }

    #[test]
    fn passing_scenario_tears_down_everything() {
        let fakes = Fakes::new();
        let mut ctx = fakes.context();
        let probe = Probe::new(
            Suite::AutoProv,
            Setup::qemu(ctx.config(), "core-image-minimal").config("A = \"1\""),
            pass,
        );

        let record = run_scenario(&mut ctx, &probe);
        assert_eq!(record.outcome, Outcome::Passed);
        assert_eq!(record.phase, Phase::Verifying);
        assert_eq!(fakes.host.launches(), 1);
        assert_eq!(fakes.host.terminations(), 1);
        assert_eq!(fakes.build.added().len(), 1);
        assert_eq!(fakes.build.removed().len(), 1);
        assert!(fakes.build.config().is_empty());
    }

    #[test]
    fn build_failure_is_attributed_and_torn_down() {
        let fakes = Fakes::new();
        fakes.build.fail_build("core-image-minimal");
        let mut ctx = fakes.context();
        let probe = Probe::new(
            Suite::AutoProv,
            Setup::qemu(ctx.config(), "core-image-minimal"),
            pass,
        );

        let record = run_scenario(&mut ctx, &probe);
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.phase, Phase::Booted);
        assert_eq!(probe.verified.get(), 0);
        assert_eq!(fakes.host.launches(), 0);
        assert_eq!(fakes.build.removed().len(), 1);
        assert!(fakes.build.config().is_empty());
    }

    #[test]
    fn verify_failure_terminates_vm_once() {
        let fakes = Fakes::new();
        let mut ctx = fakes.context();
        let probe = Probe::new(
            Suite::Hsm,
            Setup::qemu(ctx.config(), "core-image-minimal"),
            fail,
        );

        let record = run_scenario(&mut ctx, &probe);
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.phase, Phase::Verifying);
        assert_eq!(record.detail.as_deref(), Some("device ID missing"));
        assert_eq!(fakes.host.terminations(), 1);
        assert!(ctx.live_ports().is_empty());
    }

    #[test]
    fn missing_configuration_is_a_skip() {
        let fakes = Fakes::new();
        let mut ctx = fakes.context();
        let probe = Probe::new(Suite::General, Setup::new(), skip);
        let record = run_scenario(&mut ctx, &probe);
        assert_eq!(record.outcome, Outcome::Skipped);
        assert!(record.detail.unwrap().contains("SOTA_PACKED_CREDENTIALS"));
    }

    #[test]
    fn suite_preparation_runs_once() {
        let fakes = Fakes::new();
        let mut ctx = fakes.context();
        let a = Probe::new(Suite::Tools, Setup::new(), pass);
        let b = Probe::new(Suite::Tools, Setup::new().build(&["aktualizr-ca-implicit-prov"]), pass);

        let report = run_all(&mut ctx, &[&a, &b], false);
        assert!(report.success());
        assert_eq!(
            fakes.build.builds(),
            vec![
                vec!["aktualizr-native".to_string()],
                vec!["aktualizr-ca-implicit-prov".to_string()],
            ]
        );
    }

    #[test]
    fn fail_fast_stops_the_run() {
        let fakes = Fakes::new();
        let mut ctx = fakes.context();
        let a = Probe::new(Suite::General, Setup::new(), fail);
        let b = Probe::new(Suite::General, Setup::new(), pass);

        let report = run_all(&mut ctx, &[&a, &b], true);
        assert_eq!(report.results.len(), 1);
        assert_eq!(b.verified.get(), 0);

        let report = run_all(&mut ctx, &[&a, &b], false);
        assert_eq!(report.results.len(), 2);
        assert!(!report.success());
    }

    #[test]
    fn suite_names_round_trip_and_reject_unknown() {
        for suite in Suite::ALL {
            assert_eq!(suite.name().parse::<Suite>().unwrap(), suite);
        }
        assert!(matches!("nope".parse::<Suite>(), Err(HarnessError::Config(_))));
    }
}
