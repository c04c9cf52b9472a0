//! Subscriber setup for the `image-ci` binary.
//!
//! Child output is logged under its own targets so it can be filtered
//! apart from the runner's events:
//! - `build`: build tool stdout/stderr
//! - `emulator`: emulator stderr and console diagnostics
//! - `remote`: output of commands run in the guest
//!
//! Filtering starts from `info`, then applies `IMAGE_CI_LOG` (`EnvFilter`
//! syntax, e.g. `warn,emulator=debug`), then `--log-level` as the global
//! level. Events go to stderr so `--json` output on stdout stays clean.

use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "IMAGE_CI_LOG";

/// Targets that carry child process output.
pub const CHILD_TARGETS: [&str; 3] = ["build", "emulator", "remote"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Install the global subscriber. Call once, from `main`.
pub fn init_logging(cli_level: Option<LogLevel>) {
    let env = std::env::var(LOG_ENV).ok();
    fmt()
        .with_env_filter(log_filter(cli_level, env.as_deref()))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

pub fn log_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> EnvFilter {
    EnvFilter::builder().parse_lossy(directives(cli_level, env))
}

/// Later directives for the same target replace earlier ones.
fn directives(cli_level: Option<LogLevel>, env: Option<&str>) -> String {
    let mut parts = vec![LogLevel::Info.as_str().to_string()];
    parts.extend(
        env.unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
    );
    if let Some(level) = cli_level {
        parts.push(level.as_str().to_string());
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn cli_level_comes_last() {
        assert_eq!(directives(None, None), "info");
        assert_eq!(
            directives(Some(LogLevel::Warn), Some(" emulator=debug, ,build=error")),
            "info,emulator=debug,build=error,warn"
        );
    }

    #[test]
    fn per_target_directives_raise_the_hint() {
        let filter = log_filter(None, Some("warn,emulator=trace"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn child_targets_survive_a_quieter_cli_level() {
        for target in CHILD_TARGETS {
            let env = format!("{target}=debug");
            let filter = log_filter(Some(LogLevel::Error), Some(&env));
            assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG), "{target}");
        }
    }
}
