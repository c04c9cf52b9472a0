//! Waiting until the guest's remote shell is stable enough to use.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Guest, RemoteChannel, RemoteEndpoint, RemoteExit, RemoteRequest};
use crate::config::RemoteConfig;
use crate::error::Result;
use crate::process::Deadline;

/// Consecutive good probes needed by default.
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Run length of consecutive successful probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityCounter {
    streak: u32,
    threshold: u32,
}

impl StabilityCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            streak: 0,
            threshold: threshold.max(1),
        }
    }

    /// Count one probe. Any failure resets the streak. Returns true once the
    /// streak reaches the threshold.
    pub fn record(&mut self, ok: bool) -> bool {
        if ok {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        self.is_stable()
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    fn is_stable(&self) -> bool {
        self.streak >= self.threshold
    }
}

/// How the wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { probes: u32 },
    TimedOut { probes: u32, last_exit: Option<i32> },
    /// The emulator died; probing further is pointless.
    GuestExited { probes: u32, last_exit: Option<i32> },
}

/// Probes the endpoint at a fixed cadence until it answers reliably.
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    probe: RemoteRequest,
    interval: Duration,
    threshold: u32,
}

impl ReadinessPoller {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            probe: RemoteRequest::Command(config.probe_command.clone()),
            interval: config.probe_interval(),
            threshold: config.stability_threshold,
        }
    }

    pub fn wait_ready(
        &self,
        channel: &mut dyn RemoteChannel,
        endpoint: &RemoteEndpoint,
        deadline: Deadline,
        guest: &mut dyn Guest,
    ) -> Result<Readiness> {
        debug!(threshold = self.threshold, "waiting for the remote shell");
        let mut counter = StabilityCounter::new(self.threshold);
        let mut probes = 0;
        let mut last_exit = None;

        while !deadline.expired() {
            if !guest.is_running() {
                warn!(probes, "guest is not running");
                return Ok(Readiness::GuestExited { probes, last_exit });
            }

            let exit = channel.run(endpoint, &self.probe, deadline, guest)?;
            probes += 1;
            if let RemoteExit::Code(code) = exit {
                last_exit = Some(code);
            }
            let stable = counter.record(exit.success());
            debug!(
                probe = probes,
                result = ?exit,
                streak = counter.streak(),
                left = ?deadline.remaining(),
                "remote probe"
            );
            if stable {
                info!(probes, "remote shell is ready");
                return Ok(Readiness::Ready { probes });
            }

            guest.idle(deadline.cap(self.interval))?;
        }

        warn!(probes, ?last_exit, "remote shell not ready before the deadline");
        Ok(Readiness::TimedOut { probes, last_exit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn fail_then_three_ok_is_stable_on_the_fourth() {
        let mut c = StabilityCounter::new(3);
        let seq = [false, true, true, true, true];
        let stable_at = seq.iter().position(|&ok| c.record(ok));
        assert_eq!(stable_at, Some(3));
    }

    #[test]
    fn one_failure_resets_any_streak() {
        let mut c = StabilityCounter::new(3);
        c.record(true);
        c.record(true);
        assert!(!c.record(false));
        assert_eq!(c.streak(), 0);
        assert!(!c.record(true));
    }

    /// Replays probe exit codes; every probe past the end fails.
    struct Scripted {
        results: Vec<i32>,
        calls: usize,
    }

    impl RemoteChannel for Scripted {
        fn run(
            &mut self,
            _endpoint: &RemoteEndpoint,
            _request: &RemoteRequest,
            _deadline: Deadline,
            _guest: &mut dyn Guest,
        ) -> Result<RemoteExit> {
            let code = self.results.get(self.calls).copied().unwrap_or(255);
            self.calls += 1;
            Ok(RemoteExit::Code(code))
        }
    }

    struct FakeGuest {
        alive_for: u32,
        idles: u32,
    }

    impl Guest for FakeGuest {
        fn is_running(&mut self) -> bool {
            self.idles < self.alive_for
        }
        fn idle(&mut self, _period: Duration) -> Result<()> {
            self.idles += 1;
            Ok(())
        }
        fn log_path(&self) -> PathBuf {
            PathBuf::from("console.log")
        }
    }

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint {
            ssh: "ssh".into(),
            user: "ci".into(),
            host: "localhost".into(),
            port: Some(22222),
            identity: PathBuf::from("/b/ci_priv_key"),
            connect_timeout: 5,
        }
    }

    fn poller() -> ReadinessPoller {
        ReadinessPoller::from_config(&RemoteConfig {
            probe_interval_ms: 0,
            ..RemoteConfig::default()
        })
    }

    #[test]
    fn ready_exactly_at_the_fourth_probe() {
        let mut ch = Scripted {
            results: vec![255, 0, 0, 0, 0],
            calls: 0,
        };
        let mut guest = FakeGuest {
            alive_for: u32::MAX,
            idles: 0,
        };
        let r = poller()
            .wait_ready(&mut ch, &endpoint(), Deadline::after(Duration::from_secs(5)), &mut guest)
            .unwrap();
        assert_eq!(r, Readiness::Ready { probes: 4 });
        assert_eq!(ch.calls, 4);
    }

    #[test]
    fn never_stable_times_out_with_last_exit() {
        let mut ch = Scripted {
            results: [0, 0, 255].repeat(1000),
            calls: 0,
        };
        let mut guest = FakeGuest {
            alive_for: u32::MAX,
            idles: 0,
        };
        let r = poller()
            .wait_ready(
                &mut ch,
                &endpoint(),
                Deadline::after(Duration::from_millis(50)),
                &mut guest,
            )
            .unwrap();
        match r {
            Readiness::TimedOut { probes, last_exit } => {
                assert!(probes > 0);
                assert!(last_exit.is_some());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn dead_guest_stops_probing() {
        let mut ch = Scripted {
            results: vec![255; 10],
            calls: 0,
        };
        let mut guest = FakeGuest {
            alive_for: 2,
            idles: 0,
        };
        let r = poller()
            .wait_ready(&mut ch, &endpoint(), Deadline::after(Duration::from_secs(30)), &mut guest)
            .unwrap();
        assert_eq!(
            r,
            Readiness::GuestExited {
                probes: 2,
                last_exit: Some(255)
            }
        );
    }
}
