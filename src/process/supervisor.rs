//! Scoped ownership of a single child process.
//!
//! A `Supervised` is the only handle to its child. Whatever path the owning
//! phase takes out (success, failure, deadline, `?` on an unrelated error),
//! the child is killed and reaped: explicitly via `terminate_and_wait`, or by
//! `Drop` if the phase never got that far.

use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::{CommandLine, Deadline};
use crate::error::{CiError, IoContext, Result};

/// How long the group gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Where a child's stdin comes from.
#[derive(Debug)]
pub enum Input {
    /// A pipe held open (never written) for the child's whole life.
    Held,
    /// `/dev/null`: reads see EOF at once.
    Null,
    /// Streamed from an open file.
    File(File),
}

/// Spawn `cmd` in `cwd` with piped output and a held-open stdin, in its own
/// process group.
pub fn spawn(cmd: &CommandLine, cwd: &Path) -> Result<Supervised> {
    spawn_with(cmd, cwd, Input::Held)
}

/// Like [`spawn`], with an explicit stdin source.
pub fn spawn_with(cmd: &CommandLine, cwd: &Path, input: Input) -> Result<Supervised> {
    let stdin = match input {
        Input::Held => Stdio::piped(),
        Input::Null => Stdio::null(),
        Input::File(file) => Stdio::from(file),
    };
    let mut command = Command::new(cmd.program());
    command
        .args(cmd.arguments())
        .current_dir(cwd)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = command.spawn().map_err(|source| CiError::Spawn {
        program: cmd.program().to_string(),
        source,
    })?;
    debug!(pid = child.id(), cmd = %cmd, cwd = %cwd.display(), "spawned child");

    Ok(Supervised {
        _stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        program: cmd.program().to_string(),
        child,
        exit: None,
        torn_down: false,
    })
}

/// A running (or exited but not yet torn down) child process.
pub struct Supervised {
    child: Child,
    program: String,
    /// Held open so the child never sees EOF on stdin.
    _stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: Option<ExitStatus>,
    torn_down: bool,
}

impl Supervised {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Hand the output pipes to a multiplexer. Only succeeds once.
    pub fn take_output(&mut self) -> Option<(ChildStdout, ChildStderr)> {
        match (self.stdout.take(), self.stderr.take()) {
            (Some(out), Some(err)) => Some((out, err)),
            (out, err) => {
                self.stdout = out;
                self.stderr = err;
                None
            }
        }
    }

    /// Non-blocking exit check. Once observed, the status is remembered.
    ///
    /// An exited leader is reaped only after the rest of its group has been
    /// killed, so the group id cannot be recycled while it is signalled.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit.is_none() && self.leader_exited(false)? {
            self.reap()?;
        }
        Ok(self.exit)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_exit(), Ok(None))
    }

    /// Block until the child exits on its own.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        self.leader_exited(true)?;
        self.reap()
    }

    /// SIGTERM the child's process group, SIGKILL whatever is left after
    /// a short grace, then reap.
    ///
    /// Idempotent: later calls return the remembered status.
    pub fn terminate_and_wait(&mut self) -> Result<ExitStatus> {
        let status = match self.exit {
            Some(status) => status,
            None => {
                if !self.leader_exited(false)? {
                    self.signal_group(Signal::SIGTERM);
                    let grace = Deadline::after(TERM_GRACE);
                    while !grace.expired() && !self.leader_exited(false)? {
                        std::thread::sleep(EXIT_POLL);
                    }
                }
                self.reap()?
            }
        };

        self.torn_down = true;
        self._stdin = None;
        Ok(status)
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Whether the leader has exited, without reaping it.
    fn leader_exited(&self, block: bool) -> Result<bool> {
        let mut flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
        if !block {
            flags |= WaitPidFlag::WNOHANG;
        }
        loop {
            match waitid(Id::Pid(self.pgid()), flags) {
                Ok(WaitStatus::StillAlive) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(CiError::io(
                        format!("checking status of `{}`", self.program),
                        errno.into(),
                    ))
                }
            }
        }
    }

    /// Kill what is left of the group, then collect the leader's status.
    fn reap(&mut self) -> Result<ExitStatus> {
        self.signal_group(Signal::SIGKILL);
        let program = &self.program;
        let status = self
            .child
            .wait()
            .io_context(|| format!("reaping `{program}`"))?;
        self.exit = Some(status);
        Ok(status)
    }

    fn signal_group(&self, signal: Signal) {
        match killpg(self.pgid(), signal) {
            Ok(()) => debug!(
                pgid = %self.pgid(),
                %signal,
                program = %self.program,
                "signalled process group"
            ),
            // nobody left in the group
            Err(Errno::ESRCH) => {}
            Err(errno) => warn!(pgid = %self.pgid(), %signal, error = %errno, "killpg failed"),
        }
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(err) = self.terminate_and_wait() {
                warn!(program = %self.program, error = %err, "teardown on drop failed");
            }
        }
    }
}
