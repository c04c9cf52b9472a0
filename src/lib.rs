//! Build-then-boot verification for embedded Linux images.
//!
//! A run goes through up to three phases, each with its own child process
//! and deadline:
//! - build: the build tool against one or more targets ([`build`])
//! - boot: the image in an emulator until the login prompt, then marker
//!   verification of the captured console ([`boot`])
//! - remote (optional): wait for a stable remote shell, run one command or
//!   script inside the guest ([`remote`])
//!
//! [`process`] holds the supervision and stream draining all phases share.

pub mod boot;
pub mod build;
pub mod build_dir;
pub mod capture;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod process;
pub mod qemu;
pub mod remote;
pub mod snapshot;
pub mod vm;

pub use boot::{BootMilestoneSet, BootReport, BootState, BootStateDetector};
pub use build::{BuildReport, BuildRunner};
pub use build_dir::BuildDir;
pub use capture::OutputCapture;
pub use config::{BootConfig, BuildOptions, CiConfig, EmulatorConfig, RemoteConfig};
pub use error::{CiError, Result};
pub use image::ImageMetadata;
pub use process::{CommandLine, Deadline};
pub use qemu::{Arch, QemuBuilder};
pub use remote::{
    ReadinessPoller, RemoteChannel, RemoteEndpoint, RemoteExecutor, RemoteRequest, SshChannel,
};
pub use vm::{run_boot_test, BootTest, VmReport};
