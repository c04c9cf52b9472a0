//! An initialized build directory and the CI fragment included from its
//! `local.conf`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::capture::capture_dir;
use crate::config::BuildOptions;
use crate::error::{CiError, IoContext, Result};
use crate::snapshot::FileSnapshot;

/// Fragment written by [`BuildDir::configure`].
pub const CI_CONF: &str = "ci_build.conf";
const INCLUDE_LINE: &str = "include ci_build.conf";

/// A build directory that has been through the build tool's init script.
#[derive(Debug, Clone)]
pub struct BuildDir {
    root: PathBuf,
}

impl BuildDir {
    /// Open `path`, which must already contain `conf/`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        if !root.join("conf").is_dir() {
            return Err(CiError::Config(format!(
                "{} is not an initialized build directory (no conf/)",
                root.display()
            )));
        }
        let root = root
            .canonicalize()
            .io_context(|| format!("resolving {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn ci_conf(&self) -> PathBuf {
        self.conf_dir().join(CI_CONF)
    }

    pub fn local_conf(&self) -> PathBuf {
        self.conf_dir().join("local.conf")
    }

    /// Where boot captures go.
    pub fn capture_dir(&self) -> PathBuf {
        capture_dir(&self.root)
    }

    /// Write the CI fragment for `options` and make sure `local.conf`
    /// includes it.
    pub fn configure(&self, options: &BuildOptions) -> Result<()> {
        options.validate()?;
        let conf = self.ci_conf();
        fs::write(&conf, options.render_conf())
            .io_context(|| format!("writing {}", conf.display()))?;

        let local = self.local_conf();
        let current = match fs::read_to_string(&local) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).io_context(|| format!("reading {}", local.display())),
        };
        if !current.lines().any(|l| l.trim() == INCLUDE_LINE) {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&local)
                .io_context(|| format!("opening {}", local.display()))?;
            let sep = if current.is_empty() || current.ends_with('\n') { "" } else { "\n" };
            write!(file, "{sep}\n#\n# Added by image-ci\n#\n{INCLUDE_LINE}\n")
                .io_context(|| format!("appending to {}", local.display()))?;
        }
        info!(conf = %conf.display(), "build directory configured");
        Ok(())
    }

    /// Like [`configure`](Self::configure), undone when the guard drops.
    pub fn configure_scoped(&self, options: &BuildOptions) -> Result<ScopedConf> {
        let guard = ScopedConf {
            ci_conf: FileSnapshot::take(self.ci_conf())?,
            local_conf: FileSnapshot::take(self.local_conf())?,
        };
        self.configure(options)?;
        Ok(guard)
    }

    /// Empty the CI fragment; the include line stays.
    pub fn unconfigure(&self) -> Result<()> {
        let conf = self.ci_conf();
        fs::write(&conf, "").io_context(|| format!("truncating {}", conf.display()))
    }
}

/// Restores `local.conf` and the CI fragment on drop.
#[derive(Debug)]
pub struct ScopedConf {
    ci_conf: FileSnapshot,
    local_conf: FileSnapshot,
}

impl ScopedConf {
    /// Restore both files now. Whatever is not restored here is still
    /// restored on drop.
    pub fn restore(self) -> Result<()> {
        self.ci_conf.restore()?;
        self.local_conf.restore()
    }
}
