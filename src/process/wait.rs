//! Readiness primitive behind the multiplexer.
//!
//! The draining algorithm only needs "which of these descriptors can be
//! read without blocking". `PollWait` answers that with poll(2).

use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Blocks until at least one descriptor is readable or `budget` elapses.
///
/// Returns one flag per descriptor, in input order. A hung-up or errored
/// descriptor counts as readable: the following read returns EOF/error
/// immediately instead of blocking.
pub trait ReadinessWait {
    fn wait(&mut self, fds: &[BorrowedFd<'_>], budget: Duration) -> io::Result<Vec<bool>>;
}

/// poll(2)-based readiness for Unix pipes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollWait;

impl ReadinessWait for PollWait {
    fn wait(&mut self, fds: &[BorrowedFd<'_>], budget: Duration) -> io::Result<Vec<bool>> {
        let mut pfds: Vec<PollFd<'_>> = fds
            .iter()
            .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
            .collect();

        // Round up so a sub-millisecond budget does not turn into a spin.
        let millis = i32::try_from(budget.as_micros().div_ceil(1000)).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);

        loop {
            match poll(&mut pfds, timeout) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
        let mask = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(pfds
            .iter()
            .map(|p| p.revents().is_some_and(|r| r.intersects(mask)))
            .collect())
    }
}
