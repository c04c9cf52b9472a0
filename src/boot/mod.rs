//! Boot phase: run the emulator and decide whether the guest came up.
//!
//! ```text
//! Starting -> LiveWatch -> LoginSeen -> (post-login grace) -> verify
//!                       \-> Timeout  --------------------------> verify (fails)
//! ```
//!
//! The live watch only has to notice the login prompt, which ends the wait
//! early on fast boots. Verification then re-reads the finalized capture
//! and requires every applicable marker. A short post-login grace keeps
//! capturing while some marker has not shown up yet, for messages that the
//! guest prints just after the prompt.

mod diagnose;
mod milestones;

pub use diagnose::{boot_error_hints, strip_ansi, BOOT_ERROR_PATTERNS};
pub use milestones::{BootMilestoneSet, Marker};

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capture::OutputCapture;
use crate::config::BootConfig;
use crate::error::{CiError, IoContext, Result};
use crate::process::{
    spawn, CommandLine, Deadline, DrainEnd, OutputSink, StreamMultiplexer, Supervised,
};
use crate::remote::Guest;

/// Output read after the kill is picked up for at most this long.
const FLUSH_WINDOW: Duration = Duration::from_secs(1);
/// Longest single wait while pumping console output between probes.
const PUMP_SLICE: Duration = Duration::from_millis(100);

/// Where the boot state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    Starting,
    LiveWatch,
    LoginSeen,
    /// Deadline passed, or the emulator exited, without a login prompt.
    Timeout,
}

/// Result of scanning the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Pending,
    Detected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
    Login,
    AllMarkers,
    /// Capture only; never satisfied.
    Drain,
}

/// Capture writer plus live marker scan over a rolling tail.
struct ConsoleScan {
    capture: OutputCapture,
    /// Login first.
    markers: Vec<Marker>,
    seen: Vec<bool>,
    tail: Vec<u8>,
    keep: usize,
    watch: Watch,
}

impl ConsoleScan {
    fn new(capture: OutputCapture, milestones: &BootMilestoneSet) -> Self {
        let markers: Vec<Marker> = milestones.required().cloned().collect();
        Self {
            capture,
            seen: vec![false; markers.len()],
            markers,
            tail: Vec::new(),
            // enough to complete a marker split across two reads
            keep: milestones.longest().saturating_sub(1),
            watch: Watch::Login,
        }
    }

    fn feed(&mut self, data: &[u8]) -> ScanState {
        self.tail.extend_from_slice(data);
        for (marker, seen) in self.markers.iter().zip(self.seen.iter_mut()) {
            if !*seen && marker.found_in(&self.tail) {
                *seen = true;
                debug!(marker = marker.name, "marker seen on console");
            }
        }
        let cut = self.tail.len().saturating_sub(self.keep);
        self.tail.drain(..cut);

        if self.login_seen() {
            ScanState::Detected
        } else {
            ScanState::Pending
        }
    }

    fn login_seen(&self) -> bool {
        self.seen.first().copied().unwrap_or(false)
    }

    fn all_seen(&self) -> bool {
        self.seen.iter().all(|s| *s)
    }

    fn unseen(&self) -> Vec<&'static str> {
        self.markers
            .iter()
            .zip(&self.seen)
            .filter(|(_, seen)| !**seen)
            .map(|(m, _)| m.name)
            .collect()
    }
}

impl OutputSink for ConsoleScan {
    fn info(&mut self, data: &[u8]) -> Result<()> {
        self.capture.append(data)?;
        self.feed(data);
        Ok(())
    }

    fn error(&mut self, line: &[u8]) -> Result<()> {
        error!(target: "emulator", "{}", String::from_utf8_lossy(line));
        Ok(())
    }

    fn satisfied(&self) -> bool {
        match self.watch {
            Watch::Login => self.login_seen(),
            Watch::AllMarkers => self.all_seen(),
            Watch::Drain => false,
        }
    }
}

/// A running emulator whose console is being captured.
pub struct BootSession {
    child: Supervised,
    mux: StreamMultiplexer,
    scan: ConsoleScan,
    deadline: Deadline,
    state: BootState,
    early_exit: Option<ExitStatus>,
    started: Instant,
}

impl BootSession {
    /// Spawn the emulator. The phase deadline starts now.
    pub fn start(
        emulator: &CommandLine,
        cwd: &Path,
        capture: OutputCapture,
        milestones: &BootMilestoneSet,
        config: &BootConfig,
    ) -> Result<Self> {
        let deadline = Deadline::after(config.deadline_duration());
        info!(cmd = %emulator, capture = %capture.path().display(), "starting emulator");
        let mut child = spawn(emulator, cwd)?;
        let mux = StreamMultiplexer::for_child(&mut child, config.granularity())?;
        Ok(Self {
            child,
            mux,
            scan: ConsoleScan::new(capture, milestones),
            deadline,
            state: BootState::Starting,
            early_exit: None,
            started: Instant::now(),
        })
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn capture_path(&self) -> &Path {
        self.scan.capture.path()
    }

    /// Drain the console until the login prompt shows up, the emulator
    /// exits, or the deadline passes.
    pub fn watch_login(&mut self) -> Result<BootState> {
        self.state = BootState::LiveWatch;
        self.scan.watch = Watch::Login;

        let scan = match self
            .mux
            .drain_until(&mut self.child, self.deadline, &mut self.scan)?
        {
            DrainEnd::Satisfied => ScanState::Detected,
            DrainEnd::ChildExited(status) => {
                warn!(%status, "emulator exited before the login prompt");
                self.early_exit = Some(status);
                ScanState::Expired
            }
            DrainEnd::Expired => ScanState::Expired,
        };

        self.state = match scan {
            ScanState::Detected => {
                info!(elapsed = ?self.started.elapsed(), "login prompt seen");
                BootState::LoginSeen
            }
            ScanState::Pending | ScanState::Expired => BootState::Timeout,
        };
        Ok(self.state)
    }

    /// Keep capturing for up to `grace` (never past the deadline) while some
    /// marker is still unseen. No-op unless the login prompt was seen.
    pub fn linger(&mut self, grace: Duration) -> Result<()> {
        if self.state != BootState::LoginSeen || grace.is_zero() || self.scan.all_seen() {
            return Ok(());
        }
        debug!(unseen = ?self.scan.unseen(), ?grace, "waiting for markers after login");
        self.scan.watch = Watch::AllMarkers;
        let until = Deadline::after(grace).earlier(self.deadline);
        if let DrainEnd::ChildExited(status) =
            self.mux.drain_until(&mut self.child, until, &mut self.scan)?
        {
            debug!(%status, "emulator exited during post-login grace");
        }
        Ok(())
    }

    /// Capture console output for `period` without waiting on anything.
    pub fn pump(&mut self, period: Duration) -> Result<()> {
        self.scan.watch = Watch::Drain;
        let until = Deadline::after(period);
        loop {
            self.mux.tick(until.cap(PUMP_SLICE), &mut self.scan)?;
            if until.expired() {
                return Ok(());
            }
        }
    }

    /// Kill and reap the emulator, then finalize the capture.
    pub fn finish(mut self) -> Result<FinishedBoot> {
        let status = self.child.terminate_and_wait()?;
        self.scan.watch = Watch::Drain;
        self.mux
            .drain_remaining(Deadline::after(FLUSH_WINDOW), &mut self.scan)?;
        let capture = self.scan.capture.finalize()?.to_path_buf();
        debug!(
            %status,
            capture = %capture.display(),
            bytes = self.scan.capture.bytes_written(),
            "emulator torn down"
        );

        Ok(FinishedBoot {
            state: self.state,
            latest: self.scan.capture.latest_path().to_path_buf(),
            bytes: self.scan.capture.bytes_written(),
            capture,
            early_exit: self.early_exit,
            elapsed: self.started.elapsed(),
        })
    }
}

impl Guest for BootSession {
    fn is_running(&mut self) -> bool {
        self.child.is_running()
    }

    fn idle(&mut self, period: Duration) -> Result<()> {
        self.pump(period)
    }

    fn log_path(&self) -> PathBuf {
        self.capture_path().to_path_buf()
    }
}

/// A boot session after teardown, ready for verification.
#[derive(Debug, Clone)]
pub struct FinishedBoot {
    pub state: BootState,
    pub capture: PathBuf,
    pub latest: PathBuf,
    pub bytes: u64,
    /// Set when the emulator exited on its own before the login prompt.
    pub early_exit: Option<ExitStatus>,
    pub elapsed: Duration,
}

impl FinishedBoot {
    /// Report for a boot whose `markers` have been confirmed.
    pub fn report(self, markers: Vec<&'static str>) -> BootReport {
        BootReport {
            state: self.state,
            capture: self.capture,
            latest: self.latest,
            markers,
            bytes: self.bytes,
            elapsed_secs: self.elapsed.as_secs_f64(),
        }
    }
}

/// A verified boot.
#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    pub state: BootState,
    pub capture: PathBuf,
    pub latest: PathBuf,
    pub markers: Vec<&'static str>,
    pub bytes: u64,
    pub elapsed_secs: f64,
}

/// Runs one boot and checks its milestones.
#[derive(Debug, Clone)]
pub struct BootStateDetector {
    config: BootConfig,
    milestones: BootMilestoneSet,
}

impl BootStateDetector {
    pub fn new(config: BootConfig, milestones: BootMilestoneSet) -> Self {
        Self { config, milestones }
    }

    pub fn milestones(&self) -> &BootMilestoneSet {
        &self.milestones
    }

    /// Spawn the emulator and hand back the live session.
    pub fn start(
        &self,
        emulator: &CommandLine,
        cwd: &Path,
        capture: OutputCapture,
    ) -> Result<BootSession> {
        BootSession::start(emulator, cwd, capture, &self.milestones, &self.config)
    }

    /// Boot, watch for login, tear down, verify.
    pub fn run(
        &self,
        emulator: &CommandLine,
        cwd: &Path,
        capture: OutputCapture,
    ) -> Result<BootReport> {
        let mut session = self.start(emulator, cwd, capture)?;
        if session.watch_login()? == BootState::LoginSeen {
            session.linger(self.config.grace())?;
        }
        let finished = session.finish()?;
        self.verify(finished)
    }

    /// Post-mortem check of the finalized capture.
    pub fn verify(&self, finished: FinishedBoot) -> Result<BootReport> {
        let data = std::fs::read(&finished.capture)
            .io_context(|| format!("reading {}", finished.capture.display()))?;
        let missing = self.milestones.missing_in(&data);

        let reason = if finished.state != BootState::LoginSeen {
            Some(match finished.early_exit {
                Some(status) => format!("emulator exited ({status}) before the login prompt"),
                None => format!(
                    "login prompt not seen within {}s",
                    self.config.time_to_wait
                ),
            })
        } else if !missing.is_empty() {
            Some(format!("missing boot markers: {}", missing.join(", ")))
        } else {
            None
        };

        match reason {
            None => {
                info!(
                    capture = %finished.capture.display(),
                    elapsed = ?finished.elapsed,
                    "boot verified"
                );
                Ok(finished.report(self.milestones.required().map(|m| m.name).collect()))
            }
            Some(mut reason) => {
                let hints = boot_error_hints(&data);
                for hint in &hints {
                    error!(target: "emulator", "{hint}");
                }
                if !hints.is_empty() {
                    reason = format!("{reason}; console: {}", hints.join(" | "));
                }
                Err(CiError::BootFailure {
                    reason,
                    capture: finished.capture,
                })
            }
        }
    }
}
