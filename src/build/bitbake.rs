//! `BuildSystem` backed by bitbake and bitbake-layers.

use super::{parse_env_dump, parse_layer_listing, BuildSystem, BuildVars, ConfigOverrides, Layer};
use crate::error::{HarnessError, Result};
use crate::runner::{shell_quote, CommandRunner, ShellCommand, ShellRunner};
use std::path::{Path, PathBuf};

/// Runs bitbake in an initialized build directory.
pub struct Bitbake<R: CommandRunner = ShellRunner> {
    runner: R,
    build_dir: PathBuf,
    overrides: ConfigOverrides,
}

impl<R: CommandRunner> Bitbake<R> {
    pub fn new(runner: R, build_dir: impl Into<PathBuf>, overrides: ConfigOverrides) -> Self {
        Self {
            runner,
            build_dir: build_dir.into(),
            overrides,
        }
    }

    fn command(&self, line: String) -> ShellCommand {
        ShellCommand::new(line).cwd(&self.build_dir)
    }
}

impl<R: CommandRunner> BuildSystem for Bitbake<R> {
    fn build(&mut self, targets: &[&str]) -> Result<()> {
        let line = format!("bitbake {}", targets.join(" "));
        let out = self.runner.run(&self.command(line).ignore_status())?;
        if !out.success() {
            return Err(HarnessError::Build {
                target: targets.join(" "),
                output: out.transcript(),
            });
        }
        Ok(())
    }

    fn clean_all(&mut self, recipes: &[&str]) -> Result<()> {
        let line = format!("bitbake -c cleanall {}", recipes.join(" "));
        let out = self.runner.run(&self.command(line).ignore_status())?;
        if !out.success() {
            return Err(HarnessError::Build {
                target: format!("cleanall {}", recipes.join(" ")),
                output: out.transcript(),
            });
        }
        Ok(())
    }

    fn get_vars(&mut self, names: &[&str], recipe: Option<&str>) -> Result<BuildVars> {
        let line = match recipe {
            Some(r) => format!("bitbake -e {}", r),
            None => "bitbake -e".to_string(),
        };
        let out = self.runner.run(&self.command(line))?;
        Ok(parse_env_dump(&out.stdout_str(), names))
    }

    fn list_layers(&mut self) -> Result<Vec<Layer>> {
        let out = self
            .runner
            .run(&self.command("bitbake-layers show-layers".to_string()))?;
        Ok(parse_layer_listing(&out.stdout_str()))
    }

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        let line = format!("bitbake-layers add-layer {}", shell_quote(&path.to_string_lossy()));
        self.runner.run(&self.command(line))?;
        Ok(())
    }

    fn remove_layer(&mut self, path: &Path) -> Result<()> {
        let line = format!(
            "bitbake-layers remove-layer {}",
            shell_quote(&path.to_string_lossy())
        );
        self.runner.run(&self.command(line))?;
        Ok(())
    }

    fn append_config(&mut self, line: &str) -> Result<()> {
        self.overrides.push(line)
    }

    fn config_mark(&self) -> usize {
        self.overrides.mark()
    }

    fn truncate_config(&mut self, mark: usize) -> Result<()> {
        self.overrides.truncate(mark)
    }
}
