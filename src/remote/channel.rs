//! Running one request on the guest through the remote shell.

use std::fmt;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Guest, RemoteEndpoint};
use crate::error::{IoContext, Result};
use crate::process::{
    spawn_with, CommandLine, Deadline, Granularity, Input, OutputSink, StreamMultiplexer,
    Supervised,
};

/// Longest wait on ssh output before giving the guest's console a turn.
const SLICE: Duration = Duration::from_millis(50);

/// What to run on the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    /// A command line, passed as one argument after the prefix.
    Command(String),
    /// A local script whose content is fed to the remote shell's stdin.
    Script(PathBuf),
}

impl fmt::Display for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteRequest::Command(cmd) => f.write_str(cmd),
            RemoteRequest::Script(path) => write!(f, "{}", path.display()),
        }
    }
}

/// How a remote request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteExit {
    /// The shell exited with this code (signals map to 128 + signo).
    Code(i32),
    /// Abandoned: deadline passed or the guest went away.
    Aborted,
}

impl RemoteExit {
    pub fn success(self) -> bool {
        self == RemoteExit::Code(0)
    }

    pub fn code(self) -> Option<i32> {
        match self {
            RemoteExit::Code(code) => Some(code),
            RemoteExit::Aborted => None,
        }
    }
}

/// Runs requests against an endpoint. `SshChannel` is the real one; tests
/// substitute scripted fakes.
pub trait RemoteChannel {
    /// Run `request` once. `guest` gets a turn whenever the request is
    /// waiting, so its console keeps draining.
    fn run(
        &mut self,
        endpoint: &RemoteEndpoint,
        request: &RemoteRequest,
        deadline: Deadline,
        guest: &mut dyn Guest,
    ) -> Result<RemoteExit>;
}

/// Remote shell via the ssh client.
#[derive(Debug, Clone)]
pub struct SshChannel {
    cwd: PathBuf,
}

impl SshChannel {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    fn spawn_request(
        &self,
        endpoint: &RemoteEndpoint,
        request: &RemoteRequest,
    ) -> Result<(CommandLine, Supervised)> {
        match request {
            RemoteRequest::Command(cmd) => {
                let line = endpoint.command(cmd);
                let child = spawn_with(&line, &self.cwd, Input::Null)?;
                Ok((line, child))
            }
            RemoteRequest::Script(path) => {
                let script = open_script(path)?;
                let line = endpoint.command_prefix();
                let child = spawn_with(&line, &self.cwd, Input::File(script))?;
                Ok((line, child))
            }
        }
    }
}

impl RemoteChannel for SshChannel {
    fn run(
        &mut self,
        endpoint: &RemoteEndpoint,
        request: &RemoteRequest,
        deadline: Deadline,
        guest: &mut dyn Guest,
    ) -> Result<RemoteExit> {
        let (line, mut child) = self.spawn_request(endpoint, request)?;
        debug!(cmd = %line, "remote request started");
        let mut mux = StreamMultiplexer::for_child(&mut child, Granularity::Lines)?;
        let mut sink = RemoteLog;

        loop {
            if let Some(status) = child.try_exit()? {
                mux.drain_remaining(Deadline::after(SLICE), &mut sink)?;
                child.terminate_and_wait()?;
                return Ok(RemoteExit::Code(exit_code(status)));
            }
            if deadline.expired() || !guest.is_running() {
                warn!(request = %request, "abandoning remote request");
                child.terminate_and_wait()?;
                return Ok(RemoteExit::Aborted);
            }
            mux.tick(deadline.cap(SLICE), &mut sink)?;
            guest.idle(Duration::ZERO)?;
        }
    }
}

fn open_script(path: &Path) -> Result<File> {
    File::open(path).io_context(|| format!("opening script {}", path.display()))
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Remote output goes to the log, nothing else.
struct RemoteLog;

impl OutputSink for RemoteLog {
    fn info(&mut self, line: &[u8]) -> Result<()> {
        info!(target: "remote", "{}", String::from_utf8_lossy(line));
        Ok(())
    }

    fn error(&mut self, line: &[u8]) -> Result<()> {
        warn!(target: "remote", "{}", String::from_utf8_lossy(line));
        Ok(())
    }
}
