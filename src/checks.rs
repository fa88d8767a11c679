//! Reusable device and host checks shared by the scenarios.

use crate::error::{HarnessError, IoContext, Result};
use crate::orchestrator::{Fixture, ScheduleKind};
use crate::retry::{Check, Polled};
use crate::runner::{CommandOutput, ShellCommand};
use crate::verify;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

pub const NATIVE_RECIPE: &str = "aktualizr-native";

/// Turn an exhausted poll into an assertion naming what never settled.
pub fn settled<T>(polled: Polled<T>, what: &str, show: impl Fn(&T) -> String) -> Result<T> {
    match polled {
        Polled::Ready { value, .. } => Ok(value),
        Polled::Exhausted { last_error: Some(e), .. } => Err(HarnessError::Assertion(format!(
            "{} (last attempt: {})",
            what, e
        ))),
        Polled::Exhausted { last: Some(last), .. } => Err(HarnessError::Assertion(format!(
            "{}: {}",
            what,
            show(&last)
        ))),
        Polled::Exhausted { .. } => Err(HarnessError::Assertion(what.to_string())),
    }
}

/// Drop one trailing `\n` or `\r\n`.
fn strip_line_terminator(s: &str) -> &str {
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}

/// The device's hostname must equal the image's `MACHINE`.
pub fn hostname_matches(fx: &mut Fixture) -> Result<String> {
    let out = fx.remote("hostname")?;
    verify!(
        out.success(),
        "Unable to check hostname. Is an ssh daemon (such as dropbear or openssh) installed on the device?\n{}",
        out.transcript()
    );
    verify!(out.stderr.is_empty(), "Error: {}", out.stderr_str());

    let machine = fx
        .vars(&["MACHINE"], Some("core-image-minimal"))?
        .require("MACHINE")?
        .to_string();
    let stdout = out.stdout_str();
    let hostname = strip_line_terminator(&stdout);
    verify!(
        hostname == machine,
        "MACHINE does not match hostname: {}, {}",
        machine,
        hostname
    );
    println!("  hostname: {}", hostname);
    Ok(machine)
}

fn clean_run(out: &CommandOutput) -> bool {
    out.success() && out.stderr.is_empty()
}

fn poll_aktualizr_info(
    fx: &mut Fixture,
    ready: impl Fn(&CommandOutput) -> bool,
    what: &str,
) -> Result<CommandOutput> {
    let polled = fx.poll(ScheduleKind::Provisioning, |fx, _| {
        let out = fx.remote("aktualizr-info")?;
        Ok(if ready(&out) {
            Check::Ready(out)
        } else {
            Check::NotYet(out)
        })
    })?;
    settled(polled, what, CommandOutput::transcript)
}

/// `aktualizr-info` runs cleanly and reports a device with no credentials.
pub fn verify_not_provisioned(fx: &mut Fixture) -> Result<()> {
    let out = poll_aktualizr_info(fx, clean_run, "aktualizr-info failed")?;
    let text = out.transcript();
    verify!(
        out.stdout_contains("Couldn't load device ID"),
        "Device already provisioned!? {}",
        text
    );
    verify!(
        out.stdout_contains("Couldn't load ECU serials"),
        "Device already provisioned!? {}",
        text
    );
    verify!(
        out.stdout_contains("Provisioned on server: no"),
        "Device already provisioned!? {}",
        text
    );
    verify!(
        out.stdout_contains("Fetched metadata: no"),
        "Device already provisioned!? {}",
        text
    );
    Ok(())
}

/// The device provisioned and fetched metadata. Returns the device ID.
pub fn verify_provisioned(fx: &mut Fixture, machine: &str) -> Result<String> {
    let out = poll_aktualizr_info(
        fx,
        |out| clean_run(out) && out.stdout_contains("Fetched metadata: yes"),
        "aktualizr-info failed",
    )?;
    let text = out.transcript();
    verify!(out.stdout_contains("Device ID: "), "Provisioning failed: {}", text);
    verify!(
        out.stdout_contains(&format!("Primary ecu hardware ID: {}", machine)),
        "Provisioning failed: {}",
        text
    );
    verify!(
        out.stdout_contains("Fetched metadata: yes"),
        "Failed to fetch metadata: {}",
        text
    );

    let id = device_id(&out.stdout_str())
        .ok_or_else(|| HarnessError::Assertion(format!("Device ID could not be read: {}", text)))?;
    println!("  Device ID: {}", id);
    Ok(id)
}

/// Pull the device ID out of `aktualizr-info` output.
pub fn device_id(info: &str) -> Option<String> {
    let re = Regex::new(r"Device ID: ([a-z0-9-]*)\n").ok()?;
    re.captures(info)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `path` exists and is not empty.
pub fn ensure_nonempty_file(path: &Path, label: &str) -> Result<()> {
    verify!(path.is_file(), "{} not found at {}.", label, path.display());
    let len = std::fs::metadata(path)
        .io_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    verify!(len > 0, "{} at {} is empty.", label, path.display());
    Ok(())
}

/// Run a tool installed by `aktualizr-native` from its sysroot. The
/// program must exist and exit 0.
pub fn native_run(fx: &mut Fixture, command: &str) -> Result<CommandOutput> {
    let vars = fx.vars(
        &["SYSROOT_DESTDIR", "base_prefix", "libdir", "bindir"],
        Some(NATIVE_RECIPE),
    )?;
    let destdir = vars.require("SYSROOT_DESTDIR")?;
    let sysroot = format!("{}{}", destdir, vars.require("base_prefix")?);
    let bindir = format!("{}{}", destdir, vars.require("bindir")?);
    let libdir = vars.require("libdir")?;

    let program = command.split(' ').next().unwrap_or(command);
    let binary = Path::new(&bindir).join(program);
    verify!(
        binary.is_file(),
        "No {} found ({})",
        program,
        binary.display()
    );

    let out = fx.run_local(
        &ShellCommand::new(command)
            .env("LD_LIBRARY_PATH", libdir)
            .native_sysroot(sysroot)
            .ignore_status(),
    )?;
    verify!(
        out.success(),
        "Status not equal to 0. output: {}",
        out.transcript()
    );
    Ok(out)
}

/// Slot identifier reported by pkcs11-tool (stderr) and softhsm2-util
/// (stdout). Both must be present and equal.
pub fn hsm_slot_ids(p11_stderr: &str, hsm_stdout: &str) -> Result<String> {
    let p11 = capture(
        r"Using slot [0-9] with a present token \((0x[0-9a-f]*)\)\s",
        p11_stderr,
    )
    .ok_or_else(|| {
        HarnessError::Assertion(format!("Slot number not found with pkcs11-tool: {}", p11_stderr))
    })?;
    let hsm = capture(r"Description:\s*SoftHSM slot ID (0x[0-9a-f]*)\s", hsm_stdout).ok_or_else(|| {
        HarnessError::Assertion(format!("Slot number not found with softhsm2-tool: {}", hsm_stdout))
    })?;
    verify!(
        p11 == hsm,
        "Slot number does not match: {} vs {}",
        p11,
        hsm
    );
    Ok(p11)
}

fn capture(pattern: &str, text: &str) -> Option<String> {
    Regex::new(pattern)
        .ok()?
        .captures(text)?
        .get(1)
        .map(|m| m.as_str().to_string())
}

/// `Key=Value` lines of `systemctl show`.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// systemd-style size with an optional binary suffix (`K`, `M`, `G`, `T`).
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, shift) = match value.chars().last()? {
        'K' => (&value[..value.len() - 1], 10),
        'M' => (&value[..value.len() - 1], 20),
        'G' => (&value[..value.len() - 1], 30),
        'T' => (&value[..value.len() - 1], 40),
        _ => (value, 0),
    };
    let n: u64 = digits.parse().ok()?;
    n.checked_mul(1u64 << shift)
}
