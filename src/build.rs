//! Build phase: run the build tool against one or more targets.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use crate::error::{CiError, Result};
use crate::process::{
    spawn_with, CommandLine, Deadline, Granularity, Input, OutputSink, StreamMultiplexer,
};

/// A successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub command: String,
    pub targets: Vec<String>,
    pub elapsed_secs: f64,
}

/// Build output goes to the log: stdout at info, stderr at error.
#[derive(Debug, Default)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn info(&mut self, line: &[u8]) -> Result<()> {
        info!(target: "build", "{}", String::from_utf8_lossy(line));
        Ok(())
    }

    fn error(&mut self, line: &[u8]) -> Result<()> {
        error!(target: "build", "{}", String::from_utf8_lossy(line));
        Ok(())
    }
}

/// Runs the build tool. Success is exit status 0, nothing else.
#[derive(Debug, Clone)]
pub struct BuildRunner {
    tool: CommandLine,
}

impl BuildRunner {
    pub fn new(tool: CommandLine) -> Self {
        Self { tool }
    }

    /// `<tool> <flags> [-c <task>] <targets>`
    pub fn command(&self, targets: &[String], flags: &[String], task: Option<&str>) -> CommandLine {
        let mut cmd = self.tool.clone().args(flags.iter().cloned());
        if let Some(task) = task {
            cmd = cmd.arg("-c").arg(task);
        }
        cmd.args(targets.iter().cloned())
    }

    pub fn run(
        &self,
        targets: &[String],
        flags: &[String],
        task: Option<&str>,
        build_dir: &Path,
    ) -> Result<BuildReport> {
        self.run_with_sink(targets, flags, task, build_dir, &mut LogSink)
    }

    /// As [`run`](Self::run), with output delivered to `sink`.
    pub fn run_with_sink(
        &self,
        targets: &[String],
        flags: &[String],
        task: Option<&str>,
        build_dir: &Path,
        sink: &mut dyn OutputSink,
    ) -> Result<BuildReport> {
        if targets.is_empty() {
            return Err(CiError::Config("no build targets given".to_string()));
        }
        let cmd = self.command(targets, flags, task);
        info!(cmd = %cmd, dir = %build_dir.display(), "starting build");
        let started = Instant::now();

        let mut child = spawn_with(&cmd, build_dir, Input::Null)?;
        let mut mux = StreamMultiplexer::for_child(&mut child, Granularity::Lines)?;
        // No deadline and a sink that is never satisfied: only exit ends this.
        mux.drain_until(&mut child, Deadline::unbounded(), sink)?;
        let status = child.terminate_and_wait()?;

        let code = status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(-1);
        if code != 0 {
            error!(code, targets = %targets.join(" "), "build failed");
            return Err(CiError::BuildFailure {
                status: code,
                targets: targets.to_vec(),
            });
        }

        info!(elapsed = ?started.elapsed(), "build succeeded");
        Ok(BuildReport {
            command: cmd.to_string(),
            targets: targets.to_vec(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }
}
