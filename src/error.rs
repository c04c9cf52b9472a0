//! Error taxonomy for build, boot and remote phases.
//!
//! Every phase ends in exactly one of these (or success). Teardown of the
//! child process has already happened by the time a caller sees one.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = CiError> = std::result::Result<T, E>;

/// Terminal failure of a phase, with diagnostic context attached.
#[derive(Debug, Error)]
pub enum CiError {
    /// The child executable could not be started.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The build tool exited with a nonzero status.
    #[error("build failed (exit {status}) for targets: {}", targets.join(" "))]
    BuildFailure {
        status: i32,
        targets: Vec<String>,
    },

    /// Required boot markers are missing or login was never observed.
    #[error("boot verification failed ({reason}); log {}", capture.display())]
    BootFailure { reason: String, capture: PathBuf },

    /// The remote endpoint never produced enough consecutive good probes.
    #[error(
        "remote endpoint not ready after {probes} probes (last probe exit: {}); log {}",
        last_exit.map_or_else(|| "none".to_string(), |c| c.to_string()),
        capture.display()
    )]
    ReadinessTimeout {
        probes: u32,
        last_exit: Option<i32>,
        capture: PathBuf,
    },

    /// The user command or script ran and exited nonzero.
    #[error("remote command `{command}` exited with {exit_code}; log {}", capture.display())]
    RemoteCommandFailure {
        command: String,
        exit_code: i32,
        capture: PathBuf,
    },

    /// Invalid configuration, rejected before anything runs.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem or pipe error, with the path or operation it concerns.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CiError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CiError::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable snake_case name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            CiError::Spawn { .. } => "spawn",
            CiError::BuildFailure { .. } => "build_failure",
            CiError::BootFailure { .. } => "boot_failure",
            CiError::ReadinessTimeout { .. } => "readiness_timeout",
            CiError::RemoteCommandFailure { .. } => "remote_command_failure",
            CiError::Config(_) => "config",
            CiError::Io { .. } => "io",
        }
    }

    /// Exit code of the remote command, if this is a remote failure.
    pub fn remote_exit_code(&self) -> Option<i32> {
        match self {
            CiError::RemoteCommandFailure { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Capture file associated with this failure, if any.
    pub fn capture_path(&self) -> Option<&std::path::Path> {
        match self {
            CiError::BootFailure { capture, .. }
            | CiError::ReadinessTimeout { capture, .. }
            | CiError::RemoteCommandFailure { capture, .. } => Some(capture),
            _ => None,
        }
    }
}

/// Extension for attaching context to raw I/O results.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| CiError::io(f(), e))
    }
}
