//! Emulator command line for booting a built image.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::EmulatorConfig;
use crate::error::{CiError, Result};
use crate::process::CommandLine;

/// Target architectures the boot test knows how to emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    I386,
    Arm,
    Arm64,
    Mipsel,
    Riscv64,
}

impl Arch {
    pub const ALL: [Arch; 6] = [
        Arch::Amd64,
        Arch::I386,
        Arch::Arm,
        Arch::Arm64,
        Arch::Mipsel,
        Arch::Riscv64,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::I386 => "i386",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::Mipsel => "mipsel",
            Arch::Riscv64 => "riscv64",
        }
    }

    pub fn qemu_binary(self) -> &'static str {
        match self {
            Arch::Amd64 => "qemu-system-x86_64",
            Arch::I386 => "qemu-system-i386",
            Arch::Arm => "qemu-system-arm",
            Arch::Arm64 => "qemu-system-aarch64",
            Arch::Mipsel => "qemu-system-mipsel",
            Arch::Riscv64 => "qemu-system-riscv64",
        }
    }

    fn default_machine(self) -> &'static str {
        match self {
            Arch::Amd64 => "q35",
            Arch::I386 => "pc",
            Arch::Arm | Arch::Arm64 | Arch::Riscv64 => "virt",
            Arch::Mipsel => "malta",
        }
    }

    fn default_cpu(self) -> Option<&'static str> {
        match self {
            Arch::Amd64 => Some("qemu64"),
            Arch::Arm => Some("cortex-a15"),
            Arch::Arm64 => Some("cortex-a57"),
            Arch::I386 | Arch::Mipsel | Arch::Riscv64 => None,
        }
    }

    /// Only these boot through UEFI firmware by default.
    fn uses_uefi(self) -> bool {
        matches!(self, Arch::Amd64 | Arch::Arm64)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Arch::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Arch::ALL.iter().map(|a| a.as_str()).collect();
                format!("unknown architecture '{s}' (known: {})", known.join(", "))
            })
    }
}

/// Builder for emulator command lines.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    arch: Arch,
    binary: Option<String>,
    machine: Option<String>,
    cpu: Option<String>,
    memory: String,
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    append: Option<String>,
    disk: Option<PathBuf>,
    disk_format: String,
    disk_interface: String,
    firmware: Option<PathBuf>,
    pcbios: bool,
    hostfwd: Option<(u16, u16)>,
    extra: Vec<String>,
}

impl QemuBuilder {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            binary: None,
            machine: None,
            cpu: None,
            memory: "1024M".to_string(),
            kernel: None,
            initrd: None,
            append: None,
            disk: None,
            disk_format: "raw".to_string(),
            disk_interface: "virtio".to_string(),
            firmware: None,
            pcbios: false,
            hostfwd: None,
            extra: Vec::new(),
        }
    }

    /// Builder from `[emulator]`; relative paths resolve against `build_dir`.
    pub fn from_config(arch: Arch, config: &EmulatorConfig, build_dir: &Path) -> Self {
        let resolve = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                build_dir.join(p)
            }
        };
        let mut qemu = Self::new(arch)
            .memory(&config.memory)
            .disk_format(&config.image_format, &config.drive_interface)
            .hostfwd(config.ssh_port, config.guest_ssh_port)
            .extra_args(config.extra_args.iter().cloned());
        if let Some(binary) = &config.binary {
            qemu = qemu.binary(binary);
        }
        if let Some(machine) = &config.machine {
            qemu = qemu.machine(machine);
        }
        if let Some(cpu) = &config.cpu {
            qemu = qemu.cpu(cpu);
        }
        if let Some(kernel) = &config.kernel {
            qemu = qemu.kernel(resolve(kernel));
        }
        if let Some(initrd) = &config.initrd {
            qemu = qemu.initrd(resolve(initrd));
        }
        if let Some(append) = &config.append {
            qemu = qemu.append(append);
        }
        if let Some(image) = &config.image {
            qemu = qemu.disk(resolve(image));
        }
        if let Some(firmware) = &config.firmware {
            qemu = qemu.firmware(resolve(firmware));
        }
        qemu
    }

    /// Emulator executable instead of the per-architecture default.
    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = Some(binary.to_string());
        self
    }

    pub fn machine(mut self, machine: &str) -> Self {
        self.machine = Some(machine.to_string());
        self
    }

    pub fn memory(mut self, mem: &str) -> Self {
        self.memory = mem.to_string();
        self
    }

    pub fn cpu(mut self, cpu: &str) -> Self {
        self.cpu = Some(cpu.to_string());
        self
    }

    pub fn kernel(mut self, path: PathBuf) -> Self {
        self.kernel = Some(path);
        self
    }

    pub fn initrd(mut self, path: PathBuf) -> Self {
        self.initrd = Some(path);
        self
    }

    /// Kernel command line
    pub fn append(mut self, args: &str) -> Self {
        self.append = Some(args.to_string());
        self
    }

    pub fn disk(mut self, path: PathBuf) -> Self {
        self.disk = Some(path);
        self
    }

    pub fn disk_format(mut self, format: &str, interface: &str) -> Self {
        self.disk_format = format.to_string();
        self.disk_interface = interface.to_string();
        self
    }

    pub fn firmware(mut self, path: PathBuf) -> Self {
        self.firmware = Some(path);
        self
    }

    /// Boot through legacy BIOS even where UEFI is the default.
    pub fn pcbios(mut self, enforce: bool) -> Self {
        self.pcbios = enforce;
        self
    }

    /// Forward host port `host` to guest port `guest` over user networking.
    pub fn hostfwd(mut self, host: u16, guest: u16) -> Self {
        self.hostfwd = Some((host, guest));
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra.extend(args);
        self
    }

    pub fn build(self) -> Result<CommandLine> {
        if self.disk.is_none() && self.kernel.is_none() {
            return Err(CiError::Config(format!(
                "emulator for {} needs emulator.image or emulator.kernel",
                self.arch
            )));
        }

        let binary = self
            .binary
            .clone()
            .unwrap_or_else(|| self.arch.qemu_binary().to_string());
        let mut cmd = CommandLine::new(binary).arg("-nographic");

        let machine = self
            .machine
            .clone()
            .unwrap_or_else(|| self.arch.default_machine().to_string());
        cmd = cmd.args(["-machine".to_string(), machine]);
        if let Some(cpu) = self.cpu.as_deref().or(self.arch.default_cpu()) {
            cmd = cmd.args(["-cpu", cpu]);
        }
        cmd = cmd.args(["-m", self.memory.as_str()]);

        if let Some(kernel) = &self.kernel {
            cmd = cmd.args(["-kernel".to_string(), kernel.display().to_string()]);
        }
        if let Some(initrd) = &self.initrd {
            cmd = cmd.args(["-initrd".to_string(), initrd.display().to_string()]);
        }
        if let Some(append) = &self.append {
            cmd = cmd.args(["-append", append.as_str()]);
        }

        if let Some(disk) = &self.disk {
            cmd = cmd.args([
                "-drive".to_string(),
                format!(
                    "file={},format={},if={}",
                    disk.display(),
                    self.disk_format,
                    self.disk_interface
                ),
            ]);
        }

        if !self.pcbios && self.arch.uses_uefi() {
            let firmware = self.firmware.clone().or_else(|| find_firmware(self.arch));
            if let Some(fw) = firmware {
                cmd = cmd.args(["-bios".to_string(), fw.display().to_string()]);
            }
        }

        let mut netdev = "user,id=net0".to_string();
        if let Some((host, guest)) = self.hostfwd {
            netdev.push_str(&format!(",hostfwd=tcp::{host}-:{guest}"));
        }
        cmd = cmd.args(["-netdev".to_string(), netdev]);
        cmd = cmd.args(["-device", "virtio-net-pci,netdev=net0"]);

        Ok(cmd.args(self.extra))
    }
}

/// UEFI firmware from the usual distro locations.
pub fn find_firmware(arch: Arch) -> Option<PathBuf> {
    let candidates: &[&str] = match arch {
        Arch::Amd64 => &[
            "/usr/share/OVMF/OVMF_CODE.fd",
            "/usr/share/OVMF/OVMF_CODE_4M.fd",
            "/usr/share/edk2/ovmf/OVMF_CODE.fd",
            "/usr/share/qemu/OVMF.fd",
        ],
        Arch::Arm64 => &[
            "/usr/share/AAVMF/AAVMF_CODE.fd",
            "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
            "/usr/share/edk2/aarch64/QEMU_EFI.fd",
        ],
        _ => &[],
    };
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}
