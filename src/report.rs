//! Per-scenario outcomes, console output and the JSON report file.

use crate::error::{IoContext, Result};
use crate::orchestrator::Phase;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRecord {
    pub suite: String,
    pub name: String,
    pub outcome: Outcome,
    /// Where a failure happened, or the last phase reached otherwise.
    pub phase: Phase,
    /// Failure message or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ScenarioRecord {
    pub fn id(&self) -> String {
        format!("{}/{}", self.suite, self.name)
    }

    /// One status line, then the detail indented below it.
    pub fn print(&self) {
        match self.outcome {
            Outcome::Passed => println!(
                "{} {} ({:.1}s)",
                "[PASS]".green().bold(),
                self.id(),
                self.duration_secs
            ),
            Outcome::Skipped => println!(
                "{} {}: {}",
                "[SKIP]".yellow(),
                self.id(),
                self.detail.as_deref().unwrap_or("")
            ),
            Outcome::Failed => {
                println!(
                    "{} {} during {} ({:.1}s)",
                    "[FAIL]".red().bold(),
                    self.id(),
                    self.phase,
                    self.duration_secs
                );
                if let Some(detail) = &self.detail {
                    for line in detail.lines() {
                        println!("       {}", line);
                    }
                }
            }
        }
        for warning in &self.warnings {
            println!("  {} {}", "WARN:".yellow(), warning);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at_secs: u64,
    pub results: Vec<ScenarioRecord>,
}

impl RunReport {
    pub fn start() -> Self {
        let started_at_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            started_at_secs,
            results: Vec::new(),
        }
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Outcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    /// Skips do not fail a run.
    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::HarnessError::io("serializing run report", e.into())
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, json).io_context(|| format!("writing {}", path.display()))
    }

    pub fn print_summary(&self) {
        println!();
        println!("{}", "=".repeat(60));
        for record in self.results.iter().filter(|r| r.outcome == Outcome::Failed) {
            println!("  {} {} ({})", "FAILED".red(), record.id(), record.phase);
        }
        let line = format!(
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        );
        if self.success() {
            println!("{}", line.green().bold());
        } else {
            println!("{}", line.red().bold());
        }
    }
}
