//! QEMU backend for the emulator controller.

use super::{EmulatorHost, EmulatorSession, LaunchRequest, VmProcess};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, IoContext, Result};
use std::fs::File;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Builder for QEMU command lines.
#[derive(Default)]
pub struct QemuBuilder {
    binary: Option<String>,
    memory: Option<String>,
    bios: Option<PathBuf>,
    drive: Option<PathBuf>,
    ssh_forward: Option<u16>,
    mac: Option<String>,
    kvm: bool,
    nographic: bool,
}

impl QemuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// QEMU binary (default: qemu-system-x86_64)
    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = Some(binary.to_string());
        self
    }

    /// Set memory size (e.g., "512M", "1G")
    pub fn memory(mut self, mem: &str) -> Self {
        self.memory = Some(mem.to_string());
        self
    }

    /// Firmware image (U-Boot ROM or OVMF)
    pub fn bios(mut self, path: PathBuf) -> Self {
        self.bios = Some(path);
        self
    }

    /// Raw disk image, booted in snapshot mode so the deploy dir stays clean
    pub fn drive(mut self, path: PathBuf) -> Self {
        self.drive = Some(path);
        self
    }

    /// User networking with host port forwarded to guest tcp/22
    pub fn ssh_forward(mut self, host_port: u16) -> Self {
        self.ssh_forward = Some(host_port);
        self
    }

    pub fn mac(mut self, mac: &str) -> Self {
        self.mac = Some(mac.to_string());
        self
    }

    pub fn kvm(mut self, enabled: bool) -> Self {
        self.kvm = enabled;
        self
    }

    /// Disable graphics, serial console on stdio
    pub fn nographic(mut self) -> Self {
        self.nographic = true;
        self
    }

    /// Arguments after the binary name.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        if let Some(bios) = &self.bios {
            push(&["-bios", &bios.display().to_string()]);
        }

        push(&["-m", self.memory.as_deref().unwrap_or("1G")]);

        if let Some(drive) = &self.drive {
            push(&[
                "-drive",
                &format!("file={},if=ide,format=raw,snapshot=on", drive.display()),
            ]);
        }

        if let Some(port) = self.ssh_forward {
            push(&[
                "-net",
                &format!("user,hostfwd=tcp:127.0.0.1:{}-:22,restrict=off", port),
            ]);
            let mac = self.mac.clone().unwrap_or_else(generate_mac);
            push(&["-net", &format!("nic,macaddr={}", mac)]);
        }

        if self.kvm {
            push(&["-enable-kvm", "-cpu", "host"]);
        } else {
            push(&["-cpu", "Haswell"]);
        }

        if self.nographic {
            push(&["-nographic"]);
        } else {
            push(&["-usb", "-device", "usb-tablet", "-show-cursor", "-vga", "std"]);
        }

        args
    }

    pub fn build(self) -> Command {
        let mut cmd = Command::new(self.binary.as_deref().unwrap_or("qemu-system-x86_64"));
        cmd.args(self.args());
        cmd
    }
}

/// Locally administered unicast MAC, unique enough for one host.
fn generate_mac() -> String {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
        ^ u128::from(std::process::id()) << 20;
    let b = seed.to_le_bytes();
    format!("ca:fe:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3])
}

/// Find OVMF firmware for UEFI boot
pub fn find_ovmf() -> Option<PathBuf> {
    let candidates = [
        // Fedora/RHEL
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_CODE.fd",
        // Debian/Ubuntu
        "/usr/share/ovmf/OVMF.fd",
        "/usr/share/qemu/OVMF.fd",
        // Arch
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
    ];
    candidates.into_iter().map(PathBuf::from).find(|p| p.exists())
}

/// Ask the kernel for a free local port.
pub fn allocate_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .io_context(|| "allocating local tcp port for SSH forward")?;
    let port = listener
        .local_addr()
        .io_context(|| "reading allocated local tcp port")?
        .port();
    drop(listener);
    Ok(port)
}

/// A spawned QEMU.
pub struct QemuProcess {
    child: Child,
    grace: Duration,
}

impl QemuProcess {
    pub fn new(child: Child, grace: Duration) -> Self {
        Self { child, grace }
    }
}

impl VmProcess for QemuProcess {
    fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait().ok().flatten().is_some() {
            return Ok(());
        }

        let pid = self.child.id() as libc::pid_t;
        // SAFETY: the child has not been reaped, so the pid still names it.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            let start = Instant::now();
            while start.elapsed() < self.grace {
                if self.child.try_wait().ok().flatten().is_some() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        // Still running (or SIGTERM failed): hard kill.
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(HarnessError::io(format!("killing QEMU pid {}", pid), e)),
        }
        self.child
            .wait()
            .io_context(|| format!("reaping QEMU pid {}", pid))?;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Boots `<deploy>/<machine>/<image>-<machine>.<suffix>` with QEMU.
pub struct QemuHost {
    deploy_dir: PathBuf,
    binary: String,
    memory: String,
    image_suffix: String,
    boot_settle: Duration,
    terminate_grace: Duration,
    log_dir: PathBuf,
}

impl QemuHost {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            deploy_dir: config.deploy_path(),
            binary: config.qemu.binary.clone(),
            memory: config.qemu.memory.clone(),
            image_suffix: config.qemu.image_suffix.clone(),
            boot_settle: config.timing.boot_settle(),
            terminate_grace: config.timing.terminate_grace(),
            log_dir: std::env::temp_dir(),
        }
    }

    pub fn image_path(&self, request: &LaunchRequest) -> PathBuf {
        self.deploy_dir.join(&request.machine).join(format!(
            "{}-{}.{}",
            request.image, request.machine, self.image_suffix
        ))
    }

    pub fn firmware_path(&self, request: &LaunchRequest) -> Result<PathBuf> {
        if request.efi {
            return find_ovmf().ok_or_else(|| {
                HarnessError::Emulator("OVMF not found - required for EFI boot".to_string())
            });
        }
        let rom = self
            .deploy_dir
            .join(&request.machine)
            .join(format!("u-boot-{}.rom", request.machine));
        require_file(&rom, &request.image)?;
        Ok(rom)
    }

    fn log_path(&self, port: u16) -> PathBuf {
        self.log_dir.join(format!("updater-tests-qemu-{}.log", port))
    }
}

fn require_file(path: &Path, image: &str) -> Result<()> {
    if !path.is_file() {
        return Err(HarnessError::Emulator(format!(
            "{} not found. Build {} first.",
            path.display(),
            image
        )));
    }
    Ok(())
}

impl EmulatorHost for QemuHost {
    fn launch(&mut self, request: &LaunchRequest) -> Result<EmulatorSession> {
        let image = self.image_path(request);
        require_file(&image, &request.image)?;
        let bios = self.firmware_path(request)?;
        let ssh_port = allocate_local_port()?;
        let kvm = request.kvm.unwrap_or_else(|| Path::new("/dev/kvm").exists());

        let mut builder = QemuBuilder::new()
            .binary(&self.binary)
            .memory(&self.memory)
            .bios(bios)
            .drive(image)
            .ssh_forward(ssh_port)
            .kvm(kvm);
        if !request.gui {
            builder = builder.nographic();
        }
        let mut cmd = builder.build();

        let log_path = self.log_path(ssh_port);
        let log = File::create(&log_path).io_context(|| format!("creating {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .io_context(|| format!("duplicating {}", log_path.display()))?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let child = cmd.spawn().io_context(|| format!("spawning {}", self.binary))?;
        let mut session = EmulatorSession::new(
            request,
            ssh_port,
            Box::new(QemuProcess::new(child, self.terminate_grace)),
        );

        std::thread::sleep(self.boot_settle);
        if !session.is_running() {
            return Err(HarnessError::Emulator(format!(
                "QEMU exited during boot, see {}",
                log_path.display()
            )));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_command_line() {
        let args = QemuBuilder::new()
            .bios(PathBuf::from("/deploy/qemux86-64/u-boot-qemux86-64.rom"))
            .drive(PathBuf::from("/deploy/qemux86-64/core-image-minimal-qemux86-64.otaimg"))
            .ssh_forward(2222)
            .mac("ca:fe:00:00:00:01")
            .kvm(true)
            .nographic()
            .args();

        let joined = args.join(" ");
        assert!(joined.starts_with("-bios /deploy/qemux86-64/u-boot-qemux86-64.rom -m 1G"));
        assert!(joined.contains(
            "-drive file=/deploy/qemux86-64/core-image-minimal-qemux86-64.otaimg,if=ide,format=raw,snapshot=on"
        ));
        assert!(joined.contains("-net user,hostfwd=tcp:127.0.0.1:2222-:22,restrict=off"));
        assert!(joined.contains("-net nic,macaddr=ca:fe:00:00:00:01"));
        assert!(joined.contains("-enable-kvm -cpu host"));
        assert!(joined.ends_with("-nographic"));
    }

    #[test]
    fn graphic_command_line_without_kvm() {
        let args = QemuBuilder::new().memory("2G").args();
        let joined = args.join(" ");
        assert!(joined.contains("-m 2G"));
        assert!(joined.contains("-cpu Haswell"));
        assert!(joined.contains("-vga std"));
        assert!(!joined.contains("-nographic"));
        assert!(!joined.contains("-net"));
    }

    #[test]
    fn generated_mac_is_locally_administered() {
        let mac = generate_mac();
        assert!(mac.starts_with("ca:fe:"));
        assert_eq!(mac.split(':').count(), 6);
    }

    #[test]
    fn resolves_image_and_firmware_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.deploy_dir = dir.path().to_path_buf();
        let host = QemuHost::from_config(&config);
        let request = LaunchRequest::new("qemux86-64").image("secondary-image");

        assert_eq!(
            host.image_path(&request),
            dir.path().join("qemux86-64/secondary-image-qemux86-64.otaimg")
        );
        assert!(matches!(
            host.firmware_path(&request),
            Err(HarnessError::Emulator(_))
        ));

        std::fs::create_dir_all(dir.path().join("qemux86-64")).unwrap();
        std::fs::write(dir.path().join("qemux86-64/u-boot-qemux86-64.rom"), b"rom").unwrap();
        assert_eq!(
            host.firmware_path(&request).unwrap(),
            dir.path().join("qemux86-64/u-boot-qemux86-64.rom")
        );
    }

    #[test]
    fn launch_without_image_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.deploy_dir = dir.path().to_path_buf();
        let mut host = QemuHost::from_config(&config);
        let err = host.launch(&LaunchRequest::new("qemux86-64")).unwrap_err();
        assert!(err.to_string().contains("Build core-image-minimal first"));
    }

    #[test]
    fn terminates_real_process_once() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut process = QemuProcess::new(child, Duration::from_secs(2));
        assert!(process.is_running());
        process.terminate().unwrap();
        assert!(!process.is_running());
        process.terminate().unwrap();
    }

    #[test]
    fn allocates_a_local_port() {
        let a = allocate_local_port().unwrap();
        assert!(a > 0);
    }
}
