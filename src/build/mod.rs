//! Build driver.
//!
//! Wraps the bitbake tooling the scenarios need: building targets, resolving
//! variables from `bitbake -e`, managing layers and appending config
//! overrides for the duration of one scenario.

mod bitbake;
mod overrides;

pub use bitbake::Bitbake;
pub use overrides::{ensure_included, ConfigOverrides, OWNED_MARKER};

use crate::error::{HarnessError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Everything the orchestrator asks of the build system.
pub trait BuildSystem {
    /// Build `targets` in one invocation, blocking until done.
    fn build(&mut self, targets: &[&str]) -> Result<()>;

    /// `bitbake -c cleanall` for `recipes`.
    fn clean_all(&mut self, recipes: &[&str]) -> Result<()>;

    /// Resolve several variables with one environment dump. Variables that
    /// are not set are absent from the result.
    fn get_vars(&mut self, names: &[&str], recipe: Option<&str>) -> Result<BuildVars>;

    fn get_var(&mut self, name: &str, recipe: Option<&str>) -> Result<Option<String>> {
        let vars = self.get_vars(&[name], recipe)?;
        Ok(vars.get(name).map(str::to_string))
    }

    fn list_layers(&mut self) -> Result<Vec<Layer>>;
    fn add_layer(&mut self, path: &Path) -> Result<()>;
    fn remove_layer(&mut self, path: &Path) -> Result<()>;

    /// Append one `KEY = "value"` line to the override include file.
    fn append_config(&mut self, line: &str) -> Result<()>;

    /// Number of override lines currently applied.
    fn config_mark(&self) -> usize;

    /// Drop override lines past `mark`.
    fn truncate_config(&mut self, mark: usize) -> Result<()>;
}

/// Variables resolved from one `bitbake -e` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildVars {
    values: BTreeMap<String, String>,
}

impl BuildVars {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// A variable the caller cannot proceed without. Absence means the
    /// feature is not configured, which the orchestrator reports as a skip.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| HarnessError::MissingConfiguration(name.to_string()))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One row of `bitbake-layers show-layers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub path: PathBuf,
    pub priority: Option<i32>,
}

/// Is a layer called `name` in `layers`?
pub fn layer_present(layers: &[Layer], name: &str) -> bool {
    layers
        .iter()
        .any(|l| l.name == name || l.path.file_name().is_some_and(|f| f == name))
}

/// Pick `names` out of `bitbake -e` output.
///
/// Matches `NAME="value"` and `export NAME="value"` lines. Comments and
/// `unset NAME` lines are ignored.
pub fn parse_env_dump(dump: &str, names: &[&str]) -> BuildVars {
    let mut vars = BuildVars::default();
    for line in dump.lines() {
        let line = line.strip_prefix("export ").unwrap_or(line);
        if line.starts_with('#') {
            continue;
        }
        let Some((name, rest)) = line.split_once("=\"") else {
            continue;
        };
        if !names.contains(&name) {
            continue;
        }
        if let Some(value) = rest.strip_suffix('"') {
            vars.insert(name, value);
        }
    }
    vars
}

/// Parse `bitbake-layers show-layers` output.
pub fn parse_layer_listing(listing: &str) -> Vec<Layer> {
    let mut layers = Vec::new();
    let mut in_table = false;
    for line in listing.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("====") {
            in_table = true;
            continue;
        }
        if !in_table || trimmed.is_empty() || trimmed.starts_with("NOTE:") {
            continue;
        }
        let mut cols = trimmed.split_whitespace();
        let (Some(name), Some(path)) = (cols.next(), cols.next()) else {
            continue;
        };
        layers.push(Layer {
            name: name.to_string(),
            path: PathBuf::from(path),
            priority: cols.next().and_then(|p| p.parse().ok()),
        });
    }
    layers
}
