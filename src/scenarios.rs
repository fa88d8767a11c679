//! Scenario catalogue.
//!
//! Each scenario names its setup declaratively; the orchestrator acquires
//! and releases it. `verify` only talks to the fixture.

use crate::checks::{
    ensure_nonempty_file, hostname_matches, hsm_slot_ids, native_run, parse_properties,
    parse_size, settled, verify_not_provisioned, verify_provisioned, NATIVE_RECIPE,
};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::orchestrator::{Fixture, ScheduleKind, Scenario, Setup, Suite};
use crate::retry::Check;
use crate::runner::{shell_quote, CommandOutput, ShellCommand};
use crate::verify;
use std::path::Path;

const CERT_PROVIDER: &str = "aktualizr-cert-provider";
const PKCS11_COMMAND: &str = "pkcs11-tool --module=/usr/lib/softhsm/libsofthsm2.so -O";
const SOFTHSM2_COMMAND: &str = "softhsm2-util --show-slots";

/// Every scenario, in run order.
pub fn all_scenarios() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(Credentials),
        Box::new(CertProviderHelp),
        Box::new(CertProviderLocalOutput),
        Box::new(AutoProvisioning),
        Box::new(ManualRunOnce),
        Box::new(ImplicitProvisioning),
        Box::new(HsmProvisioning),
        Box::new(SecondaryPresent),
        Box::new(PrimaryPresent),
        Box::new(ResourceControlOomKill),
    ]
}

/// Pick scenarios by suite and/or name. Empty filters select everything.
/// Unknown names are an error so typos do not silently run nothing.
pub fn select<'a>(
    scenarios: &'a [Box<dyn Scenario>],
    suites: &[Suite],
    names: &[String],
) -> Result<Vec<&'a dyn Scenario>> {
    for name in names {
        let known = scenarios
            .iter()
            .any(|s| s.name() == name || s.id() == *name);
        if !known {
            return Err(HarnessError::Config(format!("unknown scenario '{}'", name)));
        }
    }
    Ok(scenarios
        .iter()
        .map(|s| s.as_ref())
        .filter(|s| suites.is_empty() || suites.contains(&s.suite()))
        .filter(|s| names.is_empty() || names.iter().any(|n| s.name() == n || s.id() == *n))
        .collect())
}

/// `SOTA_PACKED_CREDENTIALS` from the native recipe. Unset means the
/// build has no credentials, which skips the scenario.
fn packed_credentials(fx: &mut Fixture) -> Result<String> {
    let vars = fx.vars(&["SOTA_PACKED_CREDENTIALS"], Some(NATIVE_RECIPE))?;
    Ok(vars.require("SOTA_PACKED_CREDENTIALS")?.to_string())
}

/// `<dir var><libdir>/sota/<file>` for `recipe`.
fn sota_config(fx: &mut Fixture, recipe: &str, dir_var: &str, file: &str) -> Result<String> {
    let vars = fx.vars(&[dir_var, "libdir"], Some(recipe))?;
    Ok(format!(
        "{}{}/sota/{}",
        vars.require(dir_var)?,
        vars.require("libdir")?,
        file
    ))
}

/// Provision the running device over SSH with the cert provider.
fn provision_remote(fx: &mut Fixture, config: &str) -> Result<()> {
    let creds = packed_credentials(fx)?;
    let port = fx.ssh_port()?;
    println!("  Provisioning at root@localhost:{}", port);
    native_run(
        fx,
        &format!(
            "{} -c {} -t root@localhost -p {} -s -u -r -g {}",
            CERT_PROVIDER,
            shell_quote(&creds),
            port,
            shell_quote(config)
        ),
    )?;
    Ok(())
}

fn help_runs_cleanly(fx: &mut Fixture, command: &str) -> Result<()> {
    let out = fx.remote(command)?;
    verify!(
        out.success(),
        "'{}' exited {}: {}",
        command,
        out.exit_code,
        out.transcript()
    );
    verify!(out.stderr.is_empty(), "Error: {}", out.stderr_str());
    Ok(())
}

// --- general ---

pub struct Credentials;

impl Scenario for Credentials {
    fn suite(&self) -> Suite {
        Suite::General
    }
    fn name(&self) -> &'static str {
        "credentials"
    }
    fn describe(&self) -> &'static str {
        "Packed credentials are shipped inside the image"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        Setup::new()
            .config("SOTA_CLIENT_PROV = \"aktualizr-auto-prov\"")
            .build(&[config.image.as_str()])
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        let credentials = fx.var("SOTA_PACKED_CREDENTIALS", None)?.ok_or_else(|| {
            HarnessError::Skip("Variable 'SOTA_PACKED_CREDENTIALS' not set.".to_string())
        })?;
        verify!(
            Path::new(&credentials).is_file(),
            "File {} does not exist",
            credentials
        );

        let deploy = fx
            .vars(&["DEPLOY_DIR_IMAGE"], None)?
            .require("DEPLOY_DIR_IMAGE")?
            .to_string();
        let recipe = fx.config().image.clone();
        let image = fx
            .vars(&["IMAGE_LINK_NAME"], Some(&recipe))?
            .require("IMAGE_LINK_NAME")?
            .to_string();
        let tarball = format!("{}/{}.tar.bz2", deploy, image);
        let out = fx.run_local(
            &ShellCommand::new(format!(
                "tar -jtvf {} | grep sota_provisioning_credentials.zip",
                shell_quote(&tarball)
            ))
            .ignore_status(),
        )?;
        verify!(
            out.success(),
            "Status not equal to 0. output: {}",
            out.transcript()
        );
        Ok(())
    }
}

// --- native tools ---

pub struct CertProviderHelp;

impl Scenario for CertProviderHelp {
    fn suite(&self) -> Suite {
        Suite::Tools
    }
    fn name(&self) -> &'static str {
        "cert-provider-help"
    }
    fn describe(&self) -> &'static str {
        "aktualizr-cert-provider runs from the native sysroot"
    }
    fn setup(&self, _config: &HarnessConfig) -> Setup {
        Setup::new()
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        native_run(fx, &format!("{} --help", CERT_PROVIDER))?;
        Ok(())
    }
}

pub struct CertProviderLocalOutput;

impl Scenario for CertProviderLocalOutput {
    fn suite(&self) -> Suite {
        Suite::Tools
    }
    fn name(&self) -> &'static str {
        "cert-provider-local-output"
    }
    fn describe(&self) -> &'static str {
        "aktualizr-cert-provider writes credentials to a local directory"
    }
    fn setup(&self, _config: &HarnessConfig) -> Setup {
        Setup::new().build(&["aktualizr-ca-implicit-prov"])
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        let vars = fx.vars(&["SOTA_PACKED_CREDENTIALS", "T"], Some(NATIVE_RECIPE))?;
        let creds = vars.require("SOTA_PACKED_CREDENTIALS")?;
        let temp_dir = vars.require("T")?;
        let config = sota_config(
            fx,
            "aktualizr-ca-implicit-prov",
            "STAGING_DIR_HOST",
            "sota_implicit_prov_ca.toml",
        )?;

        native_run(
            fx,
            &format!(
                "{} -c {} -r -l {} -g {}",
                CERT_PROVIDER,
                shell_quote(creds),
                shell_quote(temp_dir),
                shell_quote(&config)
            ),
        )?;

        let import = Path::new(temp_dir).join("var/sota/import");
        ensure_nonempty_file(&import.join("client.pem"), "Client certificate")?;
        ensure_nonempty_file(&import.join("pkey.pem"), "Private key")?;
        ensure_nonempty_file(&import.join("root.crt"), "Root CA certificate")?;
        Ok(())
    }
}

// --- provisioning on a booted device ---

pub struct AutoProvisioning;

impl Scenario for AutoProvisioning {
    fn suite(&self) -> Suite {
        Suite::AutoProv
    }
    fn name(&self) -> &'static str {
        "provisioning"
    }
    fn describe(&self) -> &'static str {
        "Device provisions itself with shared credentials"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        Setup::qemu(config, &config.image).config("SOTA_CLIENT_PROV = \" aktualizr-auto-prov \"")
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        let machine = hostname_matches(fx)?;
        verify_provisioned(fx, &machine)?;
        Ok(())
    }
}

pub struct ManualRunOnce;

impl Scenario for ManualRunOnce {
    fn suite(&self) -> Suite {
        Suite::ManualControl
    }
    fn name(&self) -> &'static str {
        "run-once"
    }
    fn describe(&self) -> &'static str {
        "Disabled client stays idle until 'aktualizr once' is run"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        Setup::qemu(config, &config.image)
            .config("SOTA_CLIENT_PROV = \" aktualizr-auto-prov \"")
            .config("SYSTEMD_AUTO_ENABLE_aktualizr = \"disable\"")
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        let settle = fx.config().timing.manual_settle();
        fx.sleep(settle);

        let out = fx.remote("aktualizr-info")?;
        verify!(
            out.stderr_contains("Can't open database"),
            "Aktualizr should not be running yet: {}",
            out.transcript()
        );

        // Only its effect is checked; a slow run may outlive the ssh timeout.
        if let Err(e) = fx.remote("aktualizr once") {
            if !e.is_transient() {
                return Err(e);
            }
            println!("  'aktualizr once' did not return cleanly: {}", e);
        }

        let out = fx.remote("aktualizr-info")?;
        verify!(
            out.stdout_contains("Fetched metadata: yes"),
            "Aktualizr should have run: {}",
            out.transcript()
        );
        Ok(())
    }
}

pub struct ImplicitProvisioning;

impl Scenario for ImplicitProvisioning {
    fn suite(&self) -> Suite {
        Suite::ImplicitProv
    }
    fn name(&self) -> &'static str {
        "provisioning"
    }
    fn describe(&self) -> &'static str {
        "Device is provisioned from the host with aktualizr-cert-provider"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        Setup::qemu(config, &config.image)
            .config("SOTA_CLIENT_PROV = \" aktualizr-ca-implicit-prov \"")
            .config("SOTA_DEPLOY_CREDENTIALS = \"0\"")
            .clean(&["aktualizr", "aktualizr-ca-implicit-prov"])
            .build(&[NATIVE_RECIPE, "aktualizr-ca-implicit-prov"])
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        let machine = hostname_matches(fx)?;
        verify_not_provisioned(fx)?;

        let config = sota_config(
            fx,
            "aktualizr-ca-implicit-prov",
            "STAGING_DIR_HOST",
            "sota_implicit_prov_ca.toml",
        )?;
        provision_remote(fx, &config)?;

        verify_provisioned(fx, &machine)?;
        Ok(())
    }
}

pub struct HsmProvisioning;

impl HsmProvisioning {
    /// Both HSM tools must fail before the cert provider ran.
    fn verify_uninitialized(fx: &mut Fixture) -> Result<()> {
        let out = fx.remote(PKCS11_COMMAND)?;
        verify!(
            !out.success(),
            "pkcs11-tool succeeded before initialization: {}",
            out.transcript()
        );
        let out = fx.remote(SOFTHSM2_COMMAND)?;
        verify!(
            !out.success(),
            "softhsm2-tool succeeded before initialization: {}",
            out.transcript()
        );
        Ok(())
    }

    fn wait_initialized(fx: &mut Fixture) -> Result<(CommandOutput, CommandOutput)> {
        let polled = fx.poll(ScheduleKind::HsmInit, |fx, _| {
            let p11 = fx.remote(PKCS11_COMMAND)?;
            let hsm = fx.remote(SOFTHSM2_COMMAND)?;
            let ready = p11.success() && hsm.success() && hsm.stderr.is_empty();
            Ok(if ready {
                Check::Ready((p11, hsm))
            } else {
                Check::NotYet((p11, hsm))
            })
        })?;
        settled(polled, "pkcs11-tool or softhsm2-tool failed", |(p11, hsm)| {
            format!("{}{}", p11.transcript(), hsm.transcript())
        })
    }
}

impl Scenario for HsmProvisioning {
    fn suite(&self) -> Suite {
        Suite::Hsm
    }
    fn name(&self) -> &'static str {
        "provisioning"
    }
    fn describe(&self) -> &'static str {
        "Credentials are provisioned into a SoftHSM token"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        Setup::qemu(config, &config.image)
            .config("SOTA_CLIENT_PROV = \"aktualizr-hsm-prov\"")
            .config("SOTA_DEPLOY_CREDENTIALS = \"0\"")
            .config("SOTA_CLIENT_FEATURES = \"hsm\"")
            .config("IMAGE_INSTALL_append = \" softhsm-testtoken\"")
            .clean(&["aktualizr", "aktualizr-hsm-prov"])
            .build(&[NATIVE_RECIPE, "aktualizr-hsm-prov"])
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        let machine = hostname_matches(fx)?;
        verify_not_provisioned(fx)?;
        Self::verify_uninitialized(fx)?;

        let config = sota_config(fx, "aktualizr-hsm-prov", "STAGING_DIR_NATIVE", "sota_hsm_prov.toml")?;
        provision_remote(fx, &config)?;

        let (p11, hsm) = Self::wait_initialized(fx)?;
        let both = format!("{}{}", p11.transcript(), hsm.transcript());
        verify!(p11.stderr_contains("present token"), "pkcs11-tool failed: {}", both);
        verify!(p11.stdout_contains("X.509 cert"), "pkcs11-tool failed: {}", both);
        verify!(
            hsm.stdout_contains("Initialized:      yes"),
            "softhsm2-tool failed: {}",
            both
        );
        verify!(
            hsm.stdout_contains("User PIN init.:   yes"),
            "softhsm2-tool failed: {}",
            both
        );
        hsm_slot_ids(&p11.stderr_str(), &hsm.stdout_str())?;

        verify_provisioned(fx, &machine)?;
        Ok(())
    }
}

// --- multi-ECU images ---

pub struct SecondaryPresent;

impl Scenario for SecondaryPresent {
    fn suite(&self) -> Suite {
        Suite::Secondary
    }
    fn name(&self) -> &'static str {
        "secondary-present"
    }
    fn describe(&self) -> &'static str {
        "Secondary image ships aktualizr-secondary"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        Setup::qemu(config, "secondary-image")
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        help_runs_cleanly(fx, "aktualizr-secondary --help")
    }
}

pub struct PrimaryPresent;

impl Scenario for PrimaryPresent {
    fn suite(&self) -> Suite {
        Suite::Primary
    }
    fn name(&self) -> &'static str {
        "aktualizr-present"
    }
    fn describe(&self) -> &'static str {
        "Primary image ships aktualizr with secondary networking"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        Setup::qemu(config, "primary-image").config("SOTA_CLIENT_FEATURES = \"secondary-network\"")
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        help_runs_cleanly(fx, "aktualizr --help")
    }
}

// --- resource control ---

pub struct ResourceControlOomKill;

impl Scenario for ResourceControlOomKill {
    fn suite(&self) -> Suite {
        Suite::ResourceControl
    }
    fn name(&self) -> &'static str {
        "oom-kill"
    }
    fn describe(&self) -> &'static str {
        "systemd memory limit kills aktualizr until lifted"
    }
    fn setup(&self, config: &HarnessConfig) -> Setup {
        let limits = &config.resource_limits;
        Setup::qemu(config, &config.image)
            .config("IMAGE_INSTALL_append += \" aktualizr-resource-control \"")
            .config(format!("RESOURCE_CPU_WEIGHT_pn-aktualizr = \"{}\"", limits.cpu_weight))
            .config(format!("RESOURCE_MEMORY_HIGH_pn-aktualizr = \"{}\"", limits.memory_high))
            .config(format!("RESOURCE_MEMORY_MAX_pn-aktualizr = \"{}\"", limits.memory_max))
    }
    fn verify(&self, fx: &mut Fixture) -> Result<()> {
        let limits = fx.config().resource_limits.clone();

        println!("  Checking aktualizr was killed");
        let polled = fx.poll(ScheduleKind::ResourceKill, |fx, _| {
            let out = fx.remote("systemctl --no-pager show aktualizr")?;
            Ok(if out.success() && out.stdout_contains("ExecMainStatus=9") {
                Check::Ready(out)
            } else {
                Check::NotYet(out)
            })
        })?;
        let out = settled(polled, "Aktualizr was not killed", CommandOutput::transcript)?;

        let props = parse_properties(&out.stdout_str());
        let expect = |key: &str, want: Option<u64>| -> Result<()> {
            let got = props.get(key).and_then(|v| v.parse::<u64>().ok());
            verify!(
                want.is_some() && got == want,
                "{} was not set correctly: expected {:?}, got {:?}",
                key,
                want,
                props.get(key)
            );
            Ok(())
        };
        expect("CPUWeight", limits.cpu_weight.parse().ok())?;
        expect("MemoryHigh", parse_size(&limits.memory_high))?;
        expect("MemoryMax", parse_size(&limits.memory_max))?;

        fx.remote("systemctl --runtime set-property aktualizr MemoryMax=")?;
        fx.remote("systemctl restart aktualizr")?;

        let out = fx.remote("systemctl --no-pager show --property=ExecMainStatus aktualizr")?;
        verify!(
            out.stdout_contains("ExecMainStatus=0"),
            "Aktualizr did not restart: {}",
            out.transcript()
        );
        Ok(())
    }
}
