//! Persisted record of everything a child wrote during a phase.
//!
//! Layout under the log directory:
//!
//! ```text
//! 20240131-142501-vm_start_bookworm_arm64_k3J9x0aQ_log.txt
//! vm_start_bookworm_arm64_latest.txt -> 20240131-142501-vm_start_bookworm_arm64_k3J9x0aQ_log.txt
//! ```
//!
//! Writes go straight to the file (no userspace buffer) so a crashed run
//! still leaves everything that was read. The latest alias is swapped in
//! with a rename, so readers never see it missing.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{IoContext, Result};

/// Subdirectory of the build directory that holds boot captures.
pub const CAPTURE_SUBDIR: &str = "vm_start";

/// Directory for boot captures of `build_dir`.
pub fn capture_dir(build_dir: &Path) -> PathBuf {
    build_dir.join(CAPTURE_SUBDIR)
}

/// Append-only capture file for one phase run.
#[derive(Debug)]
pub struct OutputCapture {
    path: PathBuf,
    latest: PathBuf,
    file: Option<File>,
    written: u64,
}

impl OutputCapture {
    /// Create a fresh, uniquely named capture in `dir` for scenario `label`
    /// (e.g. `bookworm_arm64`).
    pub fn create(dir: &Path, label: &str) -> Result<Self> {
        fs::create_dir_all(dir).io_context(|| format!("creating {}", dir.display()))?;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let prefix = format!("{stamp}-vm_start_{label}_");
        let (file, path) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix("_log.txt")
            .tempfile_in(dir)
            .io_context(|| format!("creating capture file in {}", dir.display()))?
            .keep()
            .map_err(|e| e.error)
            .io_context(|| format!("keeping capture file in {}", dir.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
            .io_context(|| format!("setting mode of {}", path.display()))?;

        debug!(path = %path.display(), "capture created");
        Ok(Self {
            latest: dir.join(format!("vm_start_{label}_latest.txt")),
            path,
            file: Some(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The fixed-name alias that points at the newest capture.
    pub fn latest_path(&self) -> &Path {
        &self.latest
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    fn is_finalized(&self) -> bool {
        self.file.is_none()
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let path = &self.path;
        file.write_all(data)
            .io_context(|| format!("writing {}", path.display()))?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Close the file and point the latest alias at it. Idempotent.
    pub fn finalize(&mut self) -> Result<&Path> {
        if let Some(file) = self.file.take() {
            let path = &self.path;
            file.sync_all()
                .io_context(|| format!("flushing {}", path.display()))?;
            replace_alias(&self.latest, &self.path)?;
        }
        Ok(&self.path)
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        if !self.is_finalized() {
            if let Err(err) = self.finalize() {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "finalizing capture on drop failed"
                );
            }
        }
    }
}

/// Atomically make `alias` a relative symlink to `target`'s file name.
fn replace_alias(alias: &Path, target: &Path) -> Result<()> {
    let name = target.file_name().map(PathBuf::from).unwrap_or_else(|| target.to_path_buf());
    let staging = alias.with_file_name(format!(
        ".{}.{}",
        alias.file_name().and_then(|n| n.to_str()).unwrap_or("latest"),
        std::process::id()
    ));

    // A stale staging link from a crashed run would make symlink() fail.
    let _ = fs::remove_file(&staging);
    std::os::unix::fs::symlink(&name, &staging)
        .io_context(|| format!("linking {}", staging.display()))?;
    fs::rename(&staging, alias).io_context(|| format!("replacing {}", alias.display()))?;
    Ok(())
}
