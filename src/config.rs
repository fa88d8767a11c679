//! Harness configuration.
//!
//! Loaded from `updater-tests.toml` when present. Every field has a default
//! matching the qemux86-64 selftest setup, so an empty file (or no file) is
//! a valid configuration. CLI flags override what is loaded here.

use crate::emulator::DEFAULT_IMAGE;
use crate::error::{HarnessError, IoContext, Result};
use crate::retry::{PollMode, RetrySchedule};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "updater-tests.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Initialized bitbake build directory (contains `conf/local.conf`).
    pub build_dir: PathBuf,
    /// Include file under `<build_dir>/conf/` that receives overrides.
    pub include_file: String,
    pub layer: LayerConfig,
    pub machine: String,
    /// Image for scenarios that do not need a dedicated one.
    pub image: String,
    /// Where images land, relative to `build_dir` unless absolute.
    pub deploy_dir: PathBuf,
    pub qemu: QemuConfig,
    pub ssh: SshConfig,
    pub timing: TimingConfig,
    pub schedules: Schedules,
    pub resource_limits: ResourceLimits,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("."),
            include_file: "selftest.inc".to_string(),
            layer: LayerConfig::default(),
            machine: "qemux86-64".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            deploy_dir: PathBuf::from("tmp/deploy/images"),
            qemu: QemuConfig::default(),
            ssh: SshConfig::default(),
            timing: TimingConfig::default(),
            schedules: Schedules::default(),
            resource_limits: ResourceLimits::default(),
        }
    }
}

impl HarnessConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| HarnessError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .io_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&text).map_err(|e| match e {
            HarnessError::Config(msg) => HarnessError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Load `path` if given, else the default file if it exists, else
    /// defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn include_path(&self) -> PathBuf {
        self.build_dir.join("conf").join(&self.include_file)
    }

    pub fn deploy_path(&self) -> PathBuf {
        if self.deploy_dir.is_absolute() {
            self.deploy_dir.clone()
        } else {
            self.build_dir.join(&self.deploy_dir)
        }
    }

    pub fn layer_path(&self) -> PathBuf {
        if self.layer.path.is_absolute() {
            self.layer.path.clone()
        } else {
            self.build_dir.join(&self.layer.path)
        }
    }
}

/// The machine layer that QEMU scenarios register when it is missing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerConfig {
    pub name: String,
    /// Relative paths resolve against `build_dir`.
    pub path: PathBuf,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            name: "meta-updater-qemux86-64".to_string(),
            path: PathBuf::from("../meta-updater-qemux86-64"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QemuConfig {
    pub binary: String,
    pub memory: String,
    pub efi: bool,
    pub gui: bool,
    /// Force KVM on or off; unset means decide from `QEMU_USE_KVM`.
    pub kvm: Option<bool>,
    pub image_suffix: String,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            memory: "1G".to_string(),
            efi: false,
            gui: false,
            kvm: None,
            image_suffix: "otaimg".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub identity: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            host: "localhost".to_string(),
            identity: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Pause after spawning QEMU before handing out the session.
    pub boot_settle_secs: u64,
    /// Pause before checking that a disabled client has not run yet.
    pub manual_settle_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on teardown.
    pub terminate_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            boot_settle_secs: 10,
            manual_settle_secs: 20,
            terminate_grace_secs: 5,
        }
    }
}

impl TimingConfig {
    pub fn boot_settle(&self) -> Duration {
        Duration::from_secs(self.boot_settle_secs)
    }

    pub fn manual_settle(&self) -> Duration {
        Duration::from_secs(self.manual_settle_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    pub delays: Vec<u64>,
    pub mode: PollMode,
}

impl ScheduleConfig {
    fn new(delays: &[u64], mode: PollMode) -> Self {
        Self {
            delays: delays.to_vec(),
            mode,
        }
    }

    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule {
            delays: self.delays.iter().copied().map(Duration::from_secs).collect(),
            mode: self.mode,
        }
    }
}

/// Polling schedules, tuned by observation and therefore configurable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Schedules {
    pub provisioning: ScheduleConfig,
    pub hsm_init: ScheduleConfig,
    pub resource_kill: ScheduleConfig,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            provisioning: ScheduleConfig::new(&[5, 5, 5, 5, 10, 10, 10, 10], PollMode::CheckFirst),
            hsm_init: ScheduleConfig::new(&[5, 5, 5, 5, 10], PollMode::SleepFirst),
            resource_kill: ScheduleConfig::new(&[5, 5, 5, 5], PollMode::SleepFirst),
        }
    }
}

/// Limits applied to the aktualizr service in the resource-control scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub cpu_weight: String,
    pub memory_high: String,
    pub memory_max: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_weight: "1000".to_string(),
            memory_high: "50M".to_string(),
            memory_max: "1M".to_string(),
        }
    }
}
