//! Updater integration test CLI.
//!
//! Usage:
//!   updater-tests list
//!   updater-tests run --suite hsm --report out/report.json
//!   updater-tests run --scenario auto-prov/provisioning --fail-fast
//!   updater-tests vars SOTA_PACKED_CREDENTIALS T --recipe aktualizr-native
//!   updater-tests ssh --port 2222 aktualizr-info

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use updater_tests::remote::RemoteChannel;
use updater_tests::{
    all_scenarios, run_all, select, Bitbake, BuildSystem, ConfigOverrides, HarnessConfig,
    RunContext, ShellRunner, SshChannel, Suite,
};

#[derive(Parser)]
#[command(name = "updater-tests")]
#[command(about = "Build, boot and verify aktualizr images under QEMU")]
struct Cli {
    /// Config file (default: updater-tests.toml if present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialized bitbake build directory (overrides the config file)
    #[arg(long, global = true, value_name = "DIR")]
    build_dir: Option<PathBuf>,

    /// Echo every local and remote command
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios (all of them unless filtered)
    Run {
        /// Only scenarios of this suite (repeatable)
        #[arg(long = "suite", value_name = "SUITE")]
        suites: Vec<String>,

        /// Only this scenario, as NAME or SUITE/NAME (repeatable)
        #[arg(long = "scenario", value_name = "NAME")]
        scenarios: Vec<String>,

        /// Stop after the first failed scenario
        #[arg(long)]
        fail_fast: bool,

        /// Write a JSON report here
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// List scenarios grouped by suite
    List,

    /// Print build variables as resolved by `bitbake -e`
    Vars {
        #[arg(required = true)]
        names: Vec<String>,

        /// Resolve in the context of this recipe
        #[arg(long)]
        recipe: Option<String>,
    },

    /// Run one command on a booted device
    Ssh {
        /// Forwarded SSH port of the VM
        #[arg(long)]
        port: u16,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = &cli.build_dir {
        config.build_dir = dir.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Run {
            suites,
            scenarios,
            fail_fast,
            report,
        } => {
            let suites = suites
                .iter()
                .map(|s| s.parse::<Suite>())
                .collect::<updater_tests::Result<Vec<_>>>()?;
            let all = all_scenarios();
            let selected = select(&all, &suites, scenarios)?;
            if selected.is_empty() {
                bail!("No scenarios match the given --suite/--scenario filters");
            }

            if !config.build_dir.join("conf").is_dir() {
                bail!(
                    "{} is not an initialized build directory (no conf/). Pass --build-dir.",
                    config.build_dir.display()
                );
            }

            let mut ctx = RunContext::from_config(config, cli.verbose)?;
            let results = run_all(&mut ctx, &selected, *fail_fast);
            results.print_summary();

            if let Some(path) = report {
                results
                    .save(path)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                println!("Report written to {}", path.display());
            }

            std::process::exit(if results.success() { 0 } else { 1 });
        }

        Commands::List => {
            list_scenarios();
            Ok(())
        }

        Commands::Vars { names, recipe } => {
            let overrides = ConfigOverrides::open(config.include_path())?;
            let mut bitbake = Bitbake::new(
                ShellRunner::new(cli.verbose),
                config.build_dir.clone(),
                overrides,
            );
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let vars = bitbake.get_vars(&names, recipe.as_deref())?;
            for name in names {
                match vars.get(name) {
                    Some(value) => println!("{}=\"{}\"", name, value),
                    None => println!("{} {}", name, "(not set)".yellow()),
                }
            }
            Ok(())
        }

        Commands::Ssh { port, command } => {
            let channel = SshChannel::from_config(&config.ssh, cli.verbose);
            let out = channel.send(*port, &command.join(" "))?;
            print!("{}", out.stdout_str());
            eprint!("{}", out.stderr_str());
            std::process::exit(out.exit_code);
        }
    }
}

fn list_scenarios() {
    println!("{}", "Updater Test Scenarios".bold());
    println!();

    let all = all_scenarios();
    for suite in Suite::ALL {
        let in_suite: Vec<_> = all.iter().filter(|s| s.suite() == suite).collect();
        if in_suite.is_empty() {
            continue;
        }
        println!("{}", suite.name().blue().bold());
        let prepare = suite.prepare_targets();
        if !prepare.is_empty() {
            println!("  (builds {} once per run)", prepare.join(", "));
        }
        for scenario in in_suite {
            println!("  {:28} {}", scenario.name(), scenario.describe());
        }
        println!();
    }
}
