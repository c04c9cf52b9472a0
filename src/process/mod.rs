//! Child process supervision and non-blocking output draining.
//!
//! - `Supervised` - scoped ownership of one child, killed and reaped on drop
//! - `StreamMultiplexer` - drains stdout/stderr without blocking either one
//! - `ReadinessWait` - platform seam for "which fd is readable"
//!
//! Nothing here spawns threads. The only concurrency is the child itself.

mod multiplexer;
mod supervisor;
mod wait;

pub use multiplexer::{DrainEnd, Granularity, OutputSink, Source, StreamMultiplexer, Tick};
pub use supervisor::{spawn, spawn_with, Input, Supervised};
pub use wait::{PollWait, ReadinessWait};

use std::fmt;
use std::time::{Duration, Instant};

/// Argument vector for a child process: program first, then its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
        }
    }

    /// Build from a full argument vector. Returns `None` if it is empty.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        if argv.is_empty() || argv[0].is_empty() {
            return None;
        }
        Some(Self { argv })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Arguments after the program name.
    pub fn arguments(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// Instant after which a phase stops waiting. Fixed at phase start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(duration),
        }
    }

    /// A deadline that never expires (the build phase waits for exit).
    pub fn unbounded() -> Self {
        Self { at: None }
    }

    pub fn remaining(&self) -> Duration {
        match self.at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Clamp a wait to what is left of this deadline.
    pub fn cap(&self, wait: Duration) -> Duration {
        wait.min(self.remaining())
    }

    /// Whichever of the two deadlines comes first.
    pub fn earlier(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline { at: Some(a.min(b)) },
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_keeps_argument_order() {
        let cmd = CommandLine::new("bitbake")
            .arg("-v")
            .args(["-c", "do_populate_sdk"])
            .arg("mc:qemuamd64-bookworm:isar-image-base");
        assert_eq!(cmd.program(), "bitbake");
        assert_eq!(
            cmd.to_string(),
            "bitbake -v -c do_populate_sdk mc:qemuamd64-bookworm:isar-image-base"
        );
        assert_eq!(cmd.arguments().len(), 4);
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(CommandLine::from_argv(Vec::<String>::new()).is_none());
        assert!(CommandLine::from_argv([""]).is_none());
        assert!(CommandLine::from_argv(["sh", "-c", "true"]).is_some());
    }

    #[test]
    fn unbounded_deadline_never_expires() {
        let d = Deadline::unbounded();
        assert!(!d.expired());
        assert_eq!(d.cap(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn earlier_picks_the_first_deadline() {
        let near = Deadline::after(Duration::from_millis(10));
        let far = Deadline::after(Duration::from_secs(60));
        assert_eq!(near.earlier(far), near);
        assert_eq!(far.earlier(near), near);
        assert_eq!(Deadline::unbounded().earlier(near), near);
    }

    #[test]
    fn zero_deadline_is_expired() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.expired());
        assert_eq!(d.cap(Duration::from_secs(5)), Duration::ZERO);
    }
}
