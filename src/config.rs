//! Run configuration.
//!
//! Everything a run needs is an explicit value loaded once from TOML (or
//! defaulted) and passed down; nothing is read from ambient globals later.
//! The only environment fallback, `DISTRO_APT_PREMIRRORS`, is applied once
//! in [`CiConfig::discover`].
//!
//! ```toml
//! [build]
//! quiet = false
//! ccache = true
//! ccache_dir = "/var/cache/ccache"
//!
//! [boot]
//! time_to_wait = 900
//!
//! [remote]
//! identity = "testsuite/keys/ssh/id_rsa"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CiError, Result};
use crate::image::ImageMetadata;
use crate::process::{CommandLine, Granularity};
use crate::remote::DEFAULT_THRESHOLD;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "image-ci.toml";

/// Environment variable used when `build.apt_premirrors` is not set.
pub const APT_PREMIRRORS_ENV: &str = "DISTRO_APT_PREMIRRORS";

/// Default boot deadline in seconds.
pub const DEFAULT_TIME_TO_WAIT: u64 = 600;

/// Complete run configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CiConfig {
    pub build: BuildOptions,
    pub tool: ToolConfig,
    pub boot: BootConfig,
    pub emulator: EmulatorConfig,
    pub remote: RemoteConfig,
}

impl CiConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: CiConfig =
            toml::from_str(text).map_err(|e| CiError::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CiError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
            .map_err(|e| CiError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `path` if given, else `image-ci.toml` if present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.build.fill_from_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.build.validate()?;
        self.tool.validate()?;
        self.boot.validate()?;
        self.remote.validate()?;
        Ok(())
    }
}

/// Every recognized build option, with its effect on the tool arguments or
/// on the generated `ci_build.conf`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    /// `false` adds `-v` to the tool arguments.
    pub quiet: bool,
    /// `false` adds `--no-setscene` (do not restore from shared state).
    pub sstate: bool,
    /// Enable the compat architecture and swap in the compat hello package.
    pub compat_arch: bool,
    /// `ISAR_CROSS_COMPILE = "1"`.
    pub cross: bool,
    /// Cache Debian source packages in the base repository.
    pub debsrc_cache: bool,
    /// Build container SDK formats and drop kernel-module packages.
    pub container: bool,
    /// `USE_CCACHE = "1"` with `CCACHE_TOP_DIR = ccache_dir`.
    pub ccache: bool,
    /// Use the cached base repository and forbid network access.
    pub offline: bool,
    /// `WIC_DEPLOY_PARTITIONS = "1"`.
    pub wic_deploy_parts: bool,
    /// Absolute path of the key used to sign the base repository.
    pub gpg_pub_key: Option<PathBuf>,
    /// `DL_DIR`; unset or empty keeps the tool's `${TOPDIR}/downloads`.
    pub dl_dir: Option<String>,
    /// `SSTATE_DIR`; unset or empty keeps the tool's `${TOPDIR}/sstate-cache`.
    pub sstate_dir: Option<String>,
    pub ccache_dir: String,
    pub source_date_epoch: Option<u64>,
    /// Replaces `IMAGE_INSTALL` entirely when set.
    pub image_install: Option<String>,
    /// `DISTRO_APT_PREMIRRORS`.
    pub apt_premirrors: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            quiet: true,
            sstate: false,
            compat_arch: true,
            cross: true,
            debsrc_cache: false,
            container: false,
            ccache: false,
            offline: false,
            wic_deploy_parts: false,
            gpg_pub_key: None,
            dl_dir: None,
            sstate_dir: None,
            ccache_dir: "${TOPDIR}/ccache".to_string(),
            source_date_epoch: None,
            image_install: None,
            apt_premirrors: None,
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.gpg_pub_key {
            if !key.is_absolute() {
                return Err(CiError::Config(format!(
                    "build.gpg_pub_key must be an absolute path, got {}",
                    key.display()
                )));
            }
        }
        if self.ccache && self.ccache_dir.trim().is_empty() {
            return Err(CiError::Config(
                "build.ccache requires a non-empty build.ccache_dir".to_string(),
            ));
        }
        Ok(())
    }

    /// Take unset values from the environment through `lookup`. Empty
    /// values count as unset.
    pub fn fill_from_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.apt_premirrors.is_none() {
            self.apt_premirrors = lookup(APT_PREMIRRORS_ENV).filter(|v| !v.trim().is_empty());
        }
    }

    /// Flags passed to the build tool, in order.
    pub fn tool_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if !self.quiet {
            flags.push("-v".to_string());
        }
        if !self.sstate {
            flags.push("--no-setscene".to_string());
        }
        flags
    }

    /// Contents of `conf/ci_build.conf` for these options.
    pub fn render_conf(&self) -> String {
        let mut out = String::new();
        let mut set = |line: String| {
            out.push_str(&line);
            out.push('\n');
        };

        if self.compat_arch {
            for arch in ["amd64", "arm64"] {
                set(format!("ISAR_ENABLE_COMPAT_ARCH:{arch} = \"1\""));
                set(format!("IMAGE_INSTALL:remove:{arch} = \"hello-isar\""));
                set(format!("IMAGE_INSTALL:append:{arch} = \" hello-isar-compat\""));
            }
            set("IMAGE_INSTALL += \"kselftest\"".to_string());
        }
        if self.cross {
            set("ISAR_CROSS_COMPILE = \"1\"".to_string());
        }
        if self.debsrc_cache {
            set("BASE_REPO_FEATURES = \"cache-deb-src\"".to_string());
        }
        if self.offline {
            set("ISAR_USE_CACHED_BASE_REPO = \"1\"".to_string());
            set("BB_NO_NETWORK = \"1\"".to_string());
        }
        if self.container {
            set("SDK_FORMATS = \"docker-archive\"".to_string());
            set("IMAGE_INSTALL:remove = \"example-module-${KERNEL_NAME} enable-fsck\"".to_string());
        }
        if let Some(key) = &self.gpg_pub_key {
            set(format!("BASE_REPO_KEY=\"file://{}\"", key.display()));
        }
        if self.wic_deploy_parts {
            set("WIC_DEPLOY_PARTITIONS = \"1\"".to_string());
        }
        if let Some(mirrors) = &self.apt_premirrors {
            set(format!("DISTRO_APT_PREMIRRORS = \"{mirrors}\""));
        }
        if self.ccache {
            set("USE_CCACHE = \"1\"".to_string());
            set(format!("CCACHE_TOP_DIR = \"{}\"", self.ccache_dir));
        }
        if let Some(epoch) = self.source_date_epoch {
            set(format!("SOURCE_DATE_EPOCH = \"{epoch}\""));
        }
        if let Some(dir) = self.dl_dir.as_deref().filter(|d| !d.is_empty()) {
            set(format!("DL_DIR = \"{dir}\""));
        }
        if let Some(dir) = self.sstate_dir.as_deref().filter(|d| !d.is_empty()) {
            set(format!("SSTATE_DIR = \"{dir}\""));
        }
        if let Some(install) = &self.image_install {
            set(format!("IMAGE_INSTALL = \"{install}\""));
        }
        out
    }
}

/// The build tool's base command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub command: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: vec!["bitbake".to_string()],
        }
    }
}

impl ToolConfig {
    pub fn validate(&self) -> Result<()> {
        self.base().map(|_| ())
    }

    pub fn base(&self) -> Result<CommandLine> {
        CommandLine::from_argv(self.command.iter().cloned())
            .ok_or_else(|| CiError::Config("tool.command must not be empty".to_string()))
    }
}

/// Boot phase timing and marker text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootConfig {
    /// Boot deadline in seconds.
    pub time_to_wait: u64,
    /// How long to keep capturing after the login prompt for late markers.
    pub post_login_grace: u64,
    pub chunk_size: usize,
    pub settle_ms: u64,
    pub login_marker: String,
    pub feature_marker: String,
    pub resize_ext4_marker: String,
    pub resize_btrfs_marker: String,
    /// Skip querying the build tool and use these values instead.
    pub metadata: Option<ImageMetadata>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            time_to_wait: DEFAULT_TIME_TO_WAIT,
            post_login_grace: 10,
            chunk_size: 1024,
            settle_ms: 10,
            login_marker: "isar login:".to_string(),
            // printk of the example kernel module
            feature_marker: "Just an example".to_string(),
            resize_ext4_marker: "resized filesystem to".to_string(),
            resize_btrfs_marker: ": resize device ".to_string(),
            metadata: None,
        }
    }
}

impl BootConfig {
    pub fn validate(&self) -> Result<()> {
        if self.time_to_wait == 0 {
            return Err(CiError::Config("boot.time_to_wait must be > 0".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(CiError::Config("boot.chunk_size must be > 0".to_string()));
        }
        let markers = [
            ("login_marker", &self.login_marker),
            ("feature_marker", &self.feature_marker),
            ("resize_ext4_marker", &self.resize_ext4_marker),
            ("resize_btrfs_marker", &self.resize_btrfs_marker),
        ];
        // an empty marker would match any capture
        if let Some((name, _)) = markers.iter().find(|(_, text)| text.is_empty()) {
            return Err(CiError::Config(format!("boot.{name} must not be empty")));
        }
        Ok(())
    }

    pub fn deadline_duration(&self) -> Duration {
        Duration::from_secs(self.time_to_wait)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.post_login_grace)
    }

    pub fn granularity(&self) -> Granularity {
        Granularity::Chunks {
            size: self.chunk_size,
            settle: Duration::from_millis(self.settle_ms),
        }
    }
}

/// Fields for the emulator command line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    /// Overrides the per-architecture `qemu-system-*` binary.
    pub binary: Option<String>,
    pub machine: Option<String>,
    pub cpu: Option<String>,
    pub memory: String,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub append: Option<String>,
    /// Disk image; relative paths resolve against the build directory.
    pub image: Option<PathBuf>,
    pub image_format: String,
    pub drive_interface: String,
    /// UEFI firmware, ignored when PC-BIOS boot is enforced.
    pub firmware: Option<PathBuf>,
    /// Host side of the SSH port forward.
    pub ssh_port: u16,
    pub guest_ssh_port: u16,
    pub extra_args: Vec<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: None,
            machine: None,
            cpu: None,
            memory: "1024M".to_string(),
            kernel: None,
            initrd: None,
            append: None,
            image: None,
            image_format: "raw".to_string(),
            drive_interface: "virtio".to_string(),
            firmware: None,
            ssh_port: 22222,
            guest_ssh_port: 22,
            extra_args: Vec::new(),
        }
    }
}

/// Remote shell access to the booted guest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub ssh: String,
    pub user: String,
    pub host: String,
    pub connect_timeout: u32,
    /// Private key copied into the build directory before the first use.
    pub identity: Option<PathBuf>,
    pub probe_command: String,
    pub probe_interval_ms: u64,
    pub stability_threshold: u32,
    /// Directory relative script names resolve against.
    pub script_dir: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh: "ssh".to_string(),
            user: "ci".to_string(),
            host: "localhost".to_string(),
            connect_timeout: 5,
            identity: None,
            probe_command: "/bin/true".to_string(),
            probe_interval_ms: 1000,
            stability_threshold: DEFAULT_THRESHOLD,
            script_dir: None,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stability_threshold == 0 {
            return Err(CiError::Config(
                "remote.stability_threshold must be > 0".to_string(),
            ));
        }
        if self.ssh.is_empty() || self.user.is_empty() || self.host.is_empty() {
            return Err(CiError::Config(
                "remote.ssh, remote.user and remote.host must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_quiet_build_without_sstate() {
        let opts = BuildOptions::default();
        assert_eq!(opts.tool_flags(), vec!["--no-setscene"]);
        let verbose = BuildOptions {
            quiet: false,
            sstate: true,
            ..BuildOptions::default()
        };
        assert_eq!(verbose.tool_flags(), vec!["-v"]);
    }

    #[test]
    fn renders_conf_for_enabled_options_only() {
        let opts = BuildOptions {
            compat_arch: false,
            cross: false,
            offline: true,
            ccache: true,
            source_date_epoch: Some(1_700_000_000),
            dl_dir: Some(String::new()),
            ..BuildOptions::default()
        };
        let conf = opts.render_conf();
        assert!(conf.contains("BB_NO_NETWORK = \"1\"\n"));
        assert!(conf.contains("USE_CCACHE = \"1\"\nCCACHE_TOP_DIR = \"${TOPDIR}/ccache\"\n"));
        assert!(conf.contains("SOURCE_DATE_EPOCH = \"1700000000\""));
        assert!(!conf.contains("ISAR_CROSS_COMPILE"));
        assert!(!conf.contains("ISAR_ENABLE_COMPAT_ARCH"));
        // empty string means "leave the tool's default"
        assert!(!conf.contains("DL_DIR"));
    }

    #[test]
    fn premirrors_fall_back_to_the_environment() {
        let env = |key: &str| {
            (key == APT_PREMIRRORS_ENV).then(|| "deb.debian.org http://mirror/debian".to_string())
        };

        let mut opts = BuildOptions::default();
        opts.fill_from_env(env);
        assert!(opts
            .render_conf()
            .contains("DISTRO_APT_PREMIRRORS = \"deb.debian.org http://mirror/debian\"\n"));

        let mut configured = BuildOptions {
            apt_premirrors: Some("from-config".to_string()),
            ..BuildOptions::default()
        };
        configured.fill_from_env(env);
        assert_eq!(configured.apt_premirrors.as_deref(), Some("from-config"));

        let mut blank = BuildOptions::default();
        blank.fill_from_env(|_| Some("  ".to_string()));
        assert_eq!(blank.apt_premirrors, None);
        assert!(!blank.render_conf().contains("DISTRO_APT_PREMIRRORS"));
    }

    #[test]
    fn relative_gpg_key_is_rejected() {
        let opts = BuildOptions {
            gpg_pub_key: Some(PathBuf::from("keys/test_pub.key")),
            ..BuildOptions::default()
        };
        assert!(matches!(opts.validate(), Err(CiError::Config(_))));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = CiConfig::from_toml(
            r#"
            [build]
            quiet = false

            [boot]
            time_to_wait = 30
            [boot.metadata]
            fstypes = ["wic"]
            wks_file = "sdimage-efi-sd"
            distro = "debian-bookworm"

            [remote]
            user = "root"
            "#,
        )
        .unwrap();
        assert!(!cfg.build.quiet);
        assert!(cfg.build.cross);
        assert_eq!(cfg.boot.deadline_duration(), Duration::from_secs(30));
        assert_eq!(cfg.boot.login_marker, "isar login:");
        assert_eq!(cfg.remote.user, "root");
        assert_eq!(cfg.remote.stability_threshold, 3);
        assert_eq!(cfg.tool.base().unwrap().program(), "bitbake");
        let meta = cfg.boot.metadata.unwrap();
        assert_eq!(meta.wks_file.as_deref(), Some("sdimage-efi-sd"));
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(CiConfig::from_toml("[build]\nqiet = true\n").is_err());
        assert!(CiConfig::from_toml("[boot]\nchunk_size = 0\n").is_err());
        assert!(CiConfig::from_toml("[tool]\ncommand = []\n").is_err());
        assert!(CiConfig::from_toml("[remote]\nstability_threshold = 0\n").is_err());
    }

    #[test]
    fn every_boot_marker_must_be_non_empty() {
        for key in [
            "login_marker",
            "feature_marker",
            "resize_ext4_marker",
            "resize_btrfs_marker",
        ] {
            let err = CiConfig::from_toml(&format!("[boot]\n{key} = \"\"\n")).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
        let boot = BootConfig {
            feature_marker: String::new(),
            ..BootConfig::default()
        };
        assert!(boot.validate().is_err());
    }
}
