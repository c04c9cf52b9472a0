//! Where and how to reach the booted guest.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{CiError, IoContext, Result};
use crate::process::CommandLine;

/// File name of the staged private key inside the build directory.
pub const STAGED_KEY: &str = "ci_priv_key";

fn hostfwd_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"hostfwd=tcp::(\d*)").ok()).as_ref()
}

/// Host port of the first `hostfwd=tcp::<port>-:<guest>` clause, if any.
pub fn forwarded_port<S: AsRef<str>>(args: &[S]) -> Option<u16> {
    let re = hostfwd_re()?;
    args.iter()
        .find_map(|arg| re.captures(arg.as_ref()))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Remote shell target; built once per boot and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub ssh: String,
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub identity: PathBuf,
    pub connect_timeout: u32,
}

impl RemoteEndpoint {
    /// Endpoint for an emulator started with `emulator_args`.
    pub fn from_emulator_args<S: AsRef<str>>(
        emulator_args: &[S],
        remote: &RemoteConfig,
        identity: PathBuf,
    ) -> Self {
        let port = forwarded_port(emulator_args);
        if port.is_none() {
            debug!("no hostfwd clause in emulator arguments, using the default ssh port");
        }
        Self {
            ssh: remote.ssh.clone(),
            user: remote.user.clone(),
            host: remote.host.clone(),
            port,
            identity,
            connect_timeout: remote.connect_timeout,
        }
    }

    /// `ssh [-p <port>] -o ConnectTimeout=<n> -o IdentityFile=<key>
    /// -o StrictHostKeyChecking=no <user>@<host>`
    pub fn command_prefix(&self) -> CommandLine {
        let mut cmd = CommandLine::new(&self.ssh);
        if let Some(port) = self.port {
            cmd = cmd.args(["-p".to_string(), port.to_string()]);
        }
        cmd.args([
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-o".to_string(),
            format!("IdentityFile={}", self.identity.display()),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            format!("{}@{}", self.user, self.host),
        ])
    }

    /// The prefix followed by `remote_command` as a single argument.
    pub fn command(&self, remote_command: &str) -> CommandLine {
        self.command_prefix().arg(remote_command)
    }
}

/// Copy `source` to `<build_dir>/ci_priv_key` (mode 0400) unless it is
/// already there, and return the staged path.
///
/// ssh refuses keys readable by others, hence the copy.
pub fn stage_identity(build_dir: &Path, source: Option<&Path>) -> Result<PathBuf> {
    let staged = build_dir.join(STAGED_KEY);
    if staged.exists() {
        return Ok(staged);
    }
    let source = source.ok_or_else(|| {
        CiError::Config(format!(
            "remote.identity is not set and {} does not exist",
            staged.display()
        ))
    })?;
    fs::copy(source, &staged)
        .io_context(|| format!("copying {} to {}", source.display(), staged.display()))?;
    fs::set_permissions(&staged, fs::Permissions::from_mode(0o400))
        .io_context(|| format!("setting mode of {}", staged.display()))?;
    debug!(key = %staged.display(), "staged private key");
    Ok(staged)
}
