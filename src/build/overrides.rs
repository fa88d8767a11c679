//! Override include file (`conf/selftest.inc`).
//!
//! Lines already in the file when the run starts are the base and are never
//! touched. Overrides are a stack on top of the base, written below
//! [`OWNED_MARKER`]; every change rewrites the whole file.
//!
//! Anything below the marker when the file is opened was left behind by an
//! interrupted run and is dropped.

use crate::error::{IoContext, Result};
use std::path::{Path, PathBuf};

/// Separates the base from lines this harness owns.
pub const OWNED_MARKER: &str = "# updater-tests overrides below; removed after each scenario";

#[derive(Debug)]
pub struct ConfigOverrides {
    path: PathBuf,
    base: Vec<String>,
    overrides: Vec<String>,
    stale: usize,
}

impl ConfigOverrides {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = if path.is_file() {
            std::fs::read_to_string(&path).io_context(|| format!("reading {}", path.display()))?
        } else {
            String::new()
        };

        let mut lines = text.lines();
        let base: Vec<String> = lines
            .by_ref()
            .take_while(|l| *l != OWNED_MARKER)
            .map(str::to_string)
            .collect();
        let stale = lines.count();

        let overrides = Self {
            path,
            base,
            overrides: Vec::new(),
            stale,
        };
        if text.lines().any(|l| l == OWNED_MARKER) {
            overrides.write()?;
        }
        Ok(overrides)
    }

    /// Leftover override lines dropped by [`ConfigOverrides::open`].
    pub fn stale_lines(&self) -> usize {
        self.stale
    }

    pub fn push(&mut self, line: &str) -> Result<()> {
        self.overrides.push(line.to_string());
        self.write()
    }

    pub fn mark(&self) -> usize {
        self.overrides.len()
    }

    pub fn truncate(&mut self, mark: usize) -> Result<()> {
        if mark >= self.overrides.len() {
            return Ok(());
        }
        self.overrides.truncate(mark);
        self.write()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.base.iter().chain(&self.overrides).map(String::as_str)
    }

    fn file_lines(&self) -> Vec<&str> {
        let mut lines: Vec<&str> = self.base.iter().map(String::as_str).collect();
        if !self.overrides.is_empty() {
            lines.push(OWNED_MARKER);
            lines.extend(self.overrides.iter().map(String::as_str));
        }
        lines
    }

    fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        let mut text = self.file_lines().join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(&self.path, text).io_context(|| format!("writing {}", self.path.display()))
    }
}

/// Make `local_conf` include `include_file` so overrides take effect.
/// Returns whether the line had to be added.
pub fn ensure_included(local_conf: &Path, include_file: &str) -> Result<bool> {
    let text = std::fs::read_to_string(local_conf)
        .io_context(|| format!("reading {}", local_conf.display()))?;
    let directive = format!("include {}", include_file);
    if text.lines().any(|l| l.trim() == directive) {
        return Ok(false);
    }
    let mut updated = text;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&directive);
    updated.push('\n');
    std::fs::write(local_conf, updated)
        .io_context(|| format!("writing {}", local_conf.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_truncate_preserve_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/selftest.inc");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "INHERIT += \"rm_work\"\n").unwrap();

        let mut overrides = ConfigOverrides::open(&path).unwrap();
        let start = overrides.mark();
        overrides.push("MACHINE = \"qemux86-64\"").unwrap();
        overrides.push("SOTA_CLIENT_PROV = \" aktualizr-auto-prov \"").unwrap();
        assert_eq!(overrides.mark(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            format!(
                "INHERIT += \"rm_work\"\n{}\nMACHINE = \"qemux86-64\"\nSOTA_CLIENT_PROV = \" aktualizr-auto-prov \"\n",
                OWNED_MARKER
            )
        );

        overrides.truncate(start).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "INHERIT += \"rm_work\"\n");
    }

    #[test]
    fn creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/selftest.inc");
        let mut overrides = ConfigOverrides::open(&path).unwrap();
        overrides.push("A = \"1\"").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\nA = \"1\"\n", OWNED_MARKER)
        );
        overrides.truncate(0).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn interrupted_run_leaves_nothing_for_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selftest.inc");
        std::fs::write(&path, "INHERIT += \"rm_work\"\n").unwrap();

        let mut first = ConfigOverrides::open(&path).unwrap();
        first.push("SOTA_CLIENT_FEATURES = \"hsm\"").unwrap();
        drop(first);

        let mut second = ConfigOverrides::open(&path).unwrap();
        assert_eq!(second.stale_lines(), 1);
        assert_eq!(second.lines().collect::<Vec<_>>(), vec!["INHERIT += \"rm_work\""]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "INHERIT += \"rm_work\"\n");

        let mark = second.mark();
        second.push("MACHINE = \"qemux86-64\"").unwrap();
        second.truncate(mark).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "INHERIT += \"rm_work\"\n");
    }

    #[test]
    fn truncate_past_end_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selftest.inc");
        let mut overrides = ConfigOverrides::open(&path).unwrap();
        overrides.truncate(3).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn include_directive_added_once() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.conf");
        std::fs::write(&local, "MACHINE ??= \"qemux86-64\"").unwrap();

        assert!(ensure_included(&local, "selftest.inc").unwrap());
        assert!(!ensure_included(&local, "selftest.inc").unwrap());
        assert_eq!(
            std::fs::read_to_string(&local).unwrap(),
            "MACHINE ??= \"qemux86-64\"\ninclude selftest.inc\n"
        );
    }

    #[test]
    fn missing_local_conf_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_included(&dir.path().join("local.conf"), "selftest.inc").is_err());
    }
}
