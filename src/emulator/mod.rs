//! Emulator controller.
//!
//! A booted image is an [`EmulatorSession`]: it owns the VM process and the
//! forwarded SSH port, and it stops the VM when terminated or dropped.

mod qemu;

pub use qemu::{allocate_local_port, find_ovmf, QemuBuilder, QemuHost, QemuProcess};

use crate::error::Result;

pub const DEFAULT_IMAGE: &str = "core-image-minimal";

/// What to boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub machine: String,
    pub image: String,
    pub efi: bool,
    /// `None` leaves the decision to the host (autodetect).
    pub kvm: Option<bool>,
    pub gui: bool,
}

impl LaunchRequest {
    pub fn new(machine: &str) -> Self {
        Self {
            machine: machine.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            efi: false,
            kvm: None,
            gui: false,
        }
    }

    pub fn image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }
}

/// Something that can boot images.
pub trait EmulatorHost {
    /// Boot `request` and return a live session. The device may still be
    /// coming up when this returns.
    fn launch(&mut self, request: &LaunchRequest) -> Result<EmulatorSession>;
}

/// The OS-level VM process behind a session.
pub trait VmProcess {
    /// Stop the process. Must tolerate a process that already exited.
    fn terminate(&mut self) -> Result<()>;
    fn is_running(&mut self) -> bool;
}

/// A live VM. Terminated at most once; dropping an unterminated session
/// terminates it.
pub struct EmulatorSession {
    machine: String,
    image: String,
    ssh_port: u16,
    process: Box<dyn VmProcess>,
    terminated: bool,
}

impl EmulatorSession {
    pub fn new(request: &LaunchRequest, ssh_port: u16, process: Box<dyn VmProcess>) -> Self {
        Self {
            machine: request.machine.clone(),
            image: request.image.clone(),
            ssh_port,
            process,
            terminated: false,
        }
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn is_running(&mut self) -> bool {
        !self.terminated && self.process.is_running()
    }

    /// Stop the VM. Calling this again is a no-op, even if the first call
    /// reported an error.
    pub fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.process.terminate()
    }
}

impl Drop for EmulatorSession {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            eprintln!("  WARN: failed to stop VM on port {}: {}", self.ssh_port, e);
        }
    }
}

impl std::fmt::Debug for EmulatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorSession")
            .field("machine", &self.machine)
            .field("image", &self.image)
            .field("ssh_port", &self.ssh_port)
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Decide KVM from the build's `QEMU_USE_KVM`.
///
/// `"True"` enables it for x86 machines; otherwise it is a list of machine
/// names. `None` means "let the host autodetect".
pub fn kvm_for_machine(qemu_use_kvm: Option<&str>, machine: &str) -> Option<bool> {
    let value = qemu_use_kvm.map(str::trim).filter(|v| !v.is_empty())?;
    if value == "True" && machine.contains("x86") {
        return Some(true);
    }
    if value.split_whitespace().any(|m| m == machine) {
        return Some(true);
    }
    None
}
