//! Remote-verification phase: wait for a stable remote shell on the booted
//! guest, then run one request through it.

mod channel;
mod endpoint;
mod executor;
mod readiness;

pub use channel::{RemoteChannel, RemoteExit, RemoteRequest, SshChannel};
pub use endpoint::{forwarded_port, stage_identity, RemoteEndpoint, STAGED_KEY};
pub use executor::{RemoteExecutor, ABORTED_EXIT};
pub use readiness::{Readiness, ReadinessPoller, StabilityCounter, DEFAULT_THRESHOLD};

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// The machine remote requests run on, as seen from the host.
pub trait Guest {
    /// False once the emulator process has exited.
    fn is_running(&mut self) -> bool;

    /// Spend up to `period` keeping the guest's output flowing.
    fn idle(&mut self, period: Duration) -> Result<()>;

    /// Console capture referenced by failure reports.
    fn log_path(&self) -> PathBuf;
}
