//! One boot test of a built image: emulator up, boot verified, and
//! optionally one remote request run inside the guest.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::boot::{BootMilestoneSet, BootReport, BootState, BootStateDetector};
use crate::capture::{capture_dir, OutputCapture};
use crate::config::CiConfig;
use crate::error::{CiError, Result};
use crate::image::ImageMetadata;
use crate::process::CommandLine;
use crate::qemu::Arch;
use crate::remote::{
    stage_identity, Readiness, ReadinessPoller, RemoteChannel, RemoteEndpoint, RemoteExecutor,
    RemoteRequest,
};

/// Machine name the build uses for an emulated architecture.
pub fn machine_name(arch: Arch) -> String {
    format!("qemu{arch}")
}

/// `mc:<machine>-<distro>:<image>`
pub fn multiconfig_target(arch: Arch, distro: &str, image: &str) -> String {
    format!("mc:{}-{distro}:{image}", machine_name(arch))
}

/// Deployed image for `image` when `[emulator].image` is not set:
/// `tmp/deploy/images/<machine>/<image>-<DISTRO>-<machine>.<first fstype>`.
pub fn default_image_path(arch: Arch, distro: &str, image: &str, meta: &ImageMetadata) -> PathBuf {
    let machine = machine_name(arch);
    let distro = meta.distro.as_deref().unwrap_or(distro);
    let ext = meta.fstypes.first().map(String::as_str).unwrap_or("wic");
    PathBuf::from("tmp/deploy/images")
        .join(&machine)
        .join(format!("{image}-{distro}-{machine}.{ext}"))
}

/// Everything that identifies one boot test.
#[derive(Debug, Clone)]
pub struct BootTest {
    pub arch: Arch,
    pub distro: String,
    pub emulator: CommandLine,
    pub milestones: BootMilestoneSet,
    pub remote: Option<RemoteRequest>,
}

impl BootTest {
    /// `<distro>_<arch>`, used in capture file names.
    pub fn label(&self) -> String {
        format!("{}_{}", self.distro, self.arch)
    }
}

/// Outcome of the remote request.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteReport {
    pub request: String,
    pub probes: u32,
    pub exit_code: i32,
}

/// A passed boot test.
#[derive(Debug, Clone, Serialize)]
pub struct VmReport {
    pub boot: BootReport,
    pub remote: Option<RemoteReport>,
}

/// Run `test` from `build_dir`. The emulator is gone by the time this
/// returns, whatever the outcome.
pub fn run_boot_test(
    test: &BootTest,
    config: &CiConfig,
    build_dir: &Path,
    channel: &mut dyn RemoteChannel,
) -> Result<VmReport> {
    info!(
        distro = %test.distro,
        arch = %test.arch,
        remote = ?test.remote.as_ref().map(ToString::to_string),
        build_dir = %build_dir.display(),
        "boot test"
    );
    let detector = BootStateDetector::new(config.boot.clone(), test.milestones.clone());
    let capture = OutputCapture::create(&capture_dir(build_dir), &test.label())?;

    match &test.remote {
        None => {
            let boot = detector.run(&test.emulator, build_dir, capture)?;
            Ok(VmReport { boot, remote: None })
        }
        Some(request) => {
            boot_and_execute(&detector, test, request, config, build_dir, capture, channel)
        }
    }
}

fn boot_and_execute(
    detector: &BootStateDetector,
    test: &BootTest,
    request: &RemoteRequest,
    config: &CiConfig,
    build_dir: &Path,
    capture: OutputCapture,
    channel: &mut dyn RemoteChannel,
) -> Result<VmReport> {
    let identity = stage_identity(build_dir, config.remote.identity.as_deref())?;
    let endpoint =
        RemoteEndpoint::from_emulator_args(test.emulator.argv(), &config.remote, identity);
    debug!(prefix = %endpoint.command_prefix(), "remote endpoint");

    let mut session = detector.start(&test.emulator, build_dir, capture)?;
    let deadline = session.deadline();
    if session.watch_login()? != BootState::LoginSeen {
        // verification of a session without login always fails
        return detector.verify(session.finish()?).map(|boot| VmReport { boot, remote: None });
    }

    let poller = ReadinessPoller::from_config(&config.remote);
    match poller.wait_ready(channel, &endpoint, deadline, &mut session)? {
        Readiness::Ready { probes } => {
            let result = RemoteExecutor::new(channel).execute(request, &endpoint, &mut session);
            let finished = session.finish()?;
            let exit_code = result?;
            Ok(VmReport {
                boot: finished.report(vec![detector.milestones().login.name]),
                remote: Some(RemoteReport {
                    request: request.to_string(),
                    probes,
                    exit_code,
                }),
            })
        }
        Readiness::TimedOut { probes, last_exit }
        | Readiness::GuestExited { probes, last_exit } => {
            let finished = session.finish()?;
            Err(CiError::ReadinessTimeout {
                probes,
                last_exit,
                capture: finished.capture,
            })
        }
    }
}
