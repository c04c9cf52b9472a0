//! Build-then-boot verification runner for embedded images.
//!
//! Builds image targets, boots the result in an emulator, checks the boot
//! milestones and optionally runs a command inside the guest.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};

use image_ci::build::BuildReport;
use image_ci::build_dir::ScopedConf;
use image_ci::image::{layer_dir, query_env};
use image_ci::logging::{init_logging, LogLevel};
use image_ci::vm::{default_image_path, multiconfig_target, VmReport};
use image_ci::{
    run_boot_test, Arch, BootMilestoneSet, BootTest, BuildDir, BuildRunner, CiConfig, CiError,
    ImageMetadata, QemuBuilder, RemoteRequest, SshChannel,
};

#[derive(Parser)]
#[command(name = "image-ci")]
#[command(about = "Build embedded images and verify that they boot")]
struct Cli {
    /// Configuration file (default: image-ci.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Initialized build directory
    #[arg(long, global = true, default_value = "build")]
    build_dir: PathBuf,

    /// Log level (overrides IMAGE_CI_LOG)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Print a JSON report instead of the summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build one or more targets
    Build {
        /// Build target (repeatable)
        #[arg(long = "target", required = true)]
        targets: Vec<String>,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Boot a built image and verify it
    Boot(BootArgs),

    /// Build the image for one architecture/distro, then boot it
    Run {
        #[command(flatten)]
        boot: BootArgs,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Empty the CI configuration fragment
    Unconfigure,

    /// Print the directory of a configured layer
    LayerDir {
        /// Layer name as it appears in LAYERDIR_<name>
        name: String,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Run this task instead of the default one
    #[arg(long)]
    task: Option<String>,

    /// Put local.conf and the CI fragment back the way they were afterwards
    #[arg(long)]
    restore_conf: bool,
}

#[derive(Args)]
struct BootArgs {
    /// Target architecture (amd64, i386, arm, arm64, mipsel, riscv64)
    #[arg(long)]
    arch: Arch,

    /// Distro codename, e.g. bookworm
    #[arg(long)]
    distro: String,

    #[arg(long, default_value = "isar-image-base")]
    image: String,

    /// Command to run in the guest once it is reachable
    #[arg(long, conflicts_with = "script")]
    cmd: Option<String>,

    /// Script to run in the guest once it is reachable
    #[arg(long)]
    script: Option<PathBuf>,

    /// Do not require the example feature marker
    #[arg(long)]
    skip_feature_check: bool,

    /// Boot through legacy BIOS instead of UEFI
    #[arg(long)]
    pcbios: bool,

    /// Boot deadline in seconds
    #[arg(long)]
    time_to_wait: Option<u64>,
}

/// Everything `--json` prints.
#[derive(Debug, Default, Serialize)]
struct RunReport {
    success: bool,
    build: Option<BuildReport>,
    vm: Option<VmReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    layer_dir: Option<PathBuf>,
    error: Option<FailureReport>,
}

#[derive(Debug, Serialize)]
struct FailureReport {
    kind: &'static str,
    message: String,
    capture: Option<PathBuf>,
    exit_code: Option<i32>,
}

impl From<&CiError> for FailureReport {
    fn from(err: &CiError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            capture: err.capture_path().map(Path::to_path_buf),
            exit_code: err.remote_exit_code(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let mut report = RunReport::default();
    match execute(&cli, &mut report) {
        Ok(()) => report.success = true,
        Err(e) => report.error = Some(FailureReport::from(&e)),
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
        println!("{json}");
    } else {
        print_summary(&report);
    }

    if let Some(err) = report.error {
        bail!("{}", err.message);
    }
    Ok(())
}

fn execute(cli: &Cli, report: &mut RunReport) -> image_ci::Result<()> {
    let mut config = CiConfig::discover(cli.config.as_deref())?;
    let build_dir = BuildDir::open(&cli.build_dir)?;

    match &cli.command {
        Commands::Build { targets, build } => {
            report.build = Some(run_build(&config, &build_dir, targets, build)?);
        }
        Commands::Boot(boot) => {
            report.vm = Some(run_boot(&mut config, &build_dir, boot)?);
        }
        Commands::Run { boot, build } => {
            let target = multiconfig_target(boot.arch, &boot.distro, &boot.image);
            report.build = Some(run_build(&config, &build_dir, &[target], build)?);
            report.vm = Some(run_boot(&mut config, &build_dir, boot)?);
        }
        Commands::Unconfigure => build_dir.unconfigure()?,
        Commands::LayerDir { name } => {
            let dump = query_env(&config.tool.base()?, None, build_dir.path())?;
            let dir = layer_dir(&dump, name)
                .ok_or_else(|| CiError::Config(format!("layer `{name}` is not configured")))?;
            report.layer_dir = Some(dir);
        }
    }
    Ok(())
}

fn run_build(
    config: &CiConfig,
    build_dir: &BuildDir,
    targets: &[String],
    args: &BuildArgs,
) -> image_ci::Result<BuildReport> {
    let guard = if args.restore_conf {
        Some(build_dir.configure_scoped(&config.build)?)
    } else {
        build_dir.configure(&config.build)?;
        None
    };
    let result = config.tool.base().and_then(|tool| {
        BuildRunner::new(tool).run(
            targets,
            &config.build.tool_flags(),
            args.task.as_deref(),
            build_dir.path(),
        )
    });
    let restored = guard.map_or(Ok(()), ScopedConf::restore);
    let report = result?;
    restored?;
    Ok(report)
}

fn run_boot(
    config: &mut CiConfig,
    build_dir: &BuildDir,
    args: &BootArgs,
) -> image_ci::Result<VmReport> {
    if let Some(secs) = args.time_to_wait {
        config.boot.time_to_wait = secs;
        config.boot.validate()?;
    }

    let meta = match &config.boot.metadata {
        Some(meta) => meta.clone(),
        None => {
            let target = multiconfig_target(args.arch, &args.distro, &args.image);
            let dump = query_env(&config.tool.base()?, Some(&target), build_dir.path())?;
            ImageMetadata::from_env_dump(&dump)
        }
    };

    let mut qemu = QemuBuilder::from_config(args.arch, &config.emulator, build_dir.path())
        .pcbios(args.pcbios);
    if config.emulator.image.is_none() && config.emulator.kernel.is_none() {
        let image = default_image_path(args.arch, &args.distro, &args.image, &meta);
        qemu = qemu.disk(build_dir.path().join(image));
    }

    let remote = match (&args.cmd, &args.script) {
        (Some(cmd), _) => Some(RemoteRequest::Command(cmd.clone())),
        (None, Some(script)) => Some(RemoteRequest::Script(resolve_script(
            script,
            config.remote.script_dir.as_deref(),
        ))),
        (None, None) => None,
    };

    let test = BootTest {
        arch: args.arch,
        distro: args.distro.clone(),
        emulator: qemu.build()?,
        milestones: BootMilestoneSet::for_image(&config.boot, &meta, args.skip_feature_check),
        remote,
    };
    let mut channel = SshChannel::new(build_dir.path());
    run_boot_test(&test, config, build_dir.path(), &mut channel)
}

fn resolve_script(script: &Path, script_dir: Option<&Path>) -> PathBuf {
    match script_dir {
        Some(dir) if script.is_relative() => dir.join(script),
        _ => script.to_path_buf(),
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("{}", "━".repeat(60));
    println!();

    if let Some(build) = &report.build {
        println!(
            "  {:<8}{} ({:.1}s) {}",
            "Build",
            "PASS".green().bold(),
            build.elapsed_secs,
            build.targets.join(" ")
        );
    }
    if let Some(vm) = &report.vm {
        println!(
            "  {:<8}{} ({:.1}s) markers: {}",
            "Boot",
            "PASS".green().bold(),
            vm.boot.elapsed_secs,
            vm.boot.markers.join(", ")
        );
        println!("  {:<8}{}", "", vm.boot.capture.display());
        if let Some(remote) = &vm.remote {
            println!(
                "  {:<8}{} `{}` exit {} after {} probe(s)",
                "Remote",
                "PASS".green().bold(),
                remote.request,
                remote.exit_code,
                remote.probes
            );
        }
    }
    if let Some(err) = &report.error {
        println!("  {:<8}{} {}", "Error", "FAIL".red().bold(), err.kind);
        println!("    {}", err.message);
        if let Some(capture) = &err.capture {
            println!("    {} {}", "Log:".yellow(), capture.display());
        }
    }

    if let Some(dir) = &report.layer_dir {
        println!("  {:<8}{}", "Layer", dir.display());
    }

    println!();
    if report.success {
        println!("{} All phases passed", "✓".green().bold());
    } else {
        println!("{} Run failed", "✗".red().bold());
    }
}
