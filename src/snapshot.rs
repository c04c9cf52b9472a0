//! Scoped file backup: whatever happens to the file while the guard lives
//! is undone when it drops.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{IoContext, Result};

/// Original state of one file, restored on drop.
#[derive(Debug)]
pub struct FileSnapshot {
    path: PathBuf,
    /// `None`: the file did not exist.
    original: Option<Vec<u8>>,
    armed: bool,
}

impl FileSnapshot {
    /// Record the current content of `path` (or its absence).
    pub fn take(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let original = match fs::read(&path) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e).io_context(|| format!("backing up {}", path.display())),
        };
        Ok(Self {
            path,
            original,
            armed: true,
        })
    }

    /// Put the original back now, reporting failure instead of logging it.
    pub fn restore(mut self) -> Result<()> {
        self.armed = false;
        self.put_back()
    }

    fn put_back(&self) -> Result<()> {
        match &self.original {
            Some(data) => fs::write(&self.path, data)
                .io_context(|| format!("restoring {}", self.path.display()))?,
            None => match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).io_context(|| format!("removing {}", self.path.display()))
                }
            },
        }
        debug!(path = %self.path.display(), "restored");
        Ok(())
    }
}

impl Drop for FileSnapshot {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.put_back() {
                warn!(error = %err, "restoring snapshot failed");
            }
        }
    }
}
