//! The single user command or script, run once the guest is ready.

use tracing::{error, info};

use super::{Guest, RemoteChannel, RemoteEndpoint, RemoteExit, RemoteRequest};
use crate::error::{CiError, Result};
use crate::process::Deadline;

/// Reported when a request is abandoned before the shell exits.
pub const ABORTED_EXIT: i32 = -1;

/// Runs exactly one request through a channel. No retry.
pub struct RemoteExecutor<'a> {
    channel: &'a mut dyn RemoteChannel,
}

impl<'a> RemoteExecutor<'a> {
    pub fn new(channel: &'a mut dyn RemoteChannel) -> Self {
        Self { channel }
    }

    /// Run `request` and return its exit code, which is always 0: any other
    /// code comes back verbatim as `RemoteCommandFailure`.
    pub fn execute(
        &mut self,
        request: &RemoteRequest,
        endpoint: &RemoteEndpoint,
        guest: &mut dyn Guest,
    ) -> Result<i32> {
        info!(request = %request, "running remote request");
        let exit = self
            .channel
            .run(endpoint, request, Deadline::unbounded(), guest)?;

        match exit {
            RemoteExit::Code(0) => {
                info!(request = %request, "remote request succeeded");
                Ok(0)
            }
            other => {
                let exit_code = other.code().unwrap_or(ABORTED_EXIT);
                error!(request = %request, exit_code, "remote request failed");
                Err(CiError::RemoteCommandFailure {
                    command: request.to_string(),
                    exit_code,
                    capture: guest.log_path(),
                })
            }
        }
    }
}
