//! Image metadata the boot check depends on, read from the build tool's
//! environment dump (`bitbake -e`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{CiError, IoContext, Result};
use crate::process::CommandLine;

/// wks layout whose first-boot ext4 grow prints `resized filesystem to`.
pub const WKS_EXT4_RESIZE: &str = "sdimage-efi-sd";
/// wks layout whose first-boot btrfs grow prints `: resize device `.
pub const WKS_BTRFS_RESIZE: &str = "sdimage-efi-btrfs";

/// Which first-boot resize message a layout produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeKind {
    Ext4,
    Btrfs,
}

/// The three variables that decide the required boot markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageMetadata {
    pub fstypes: Vec<String>,
    pub wks_file: Option<String>,
    pub distro: Option<String>,
}

impl ImageMetadata {
    /// Extract from a `NAME="value"` environment dump.
    pub fn from_env_dump(dump: &str) -> Self {
        let vars = parse_env_dump(dump);
        let non_empty = |name: &str| vars.get(name).filter(|v| !v.is_empty()).cloned();
        Self {
            fstypes: vars
                .get("IMAGE_FSTYPES")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            wks_file: non_empty("WKS_FILE"),
            distro: non_empty("DISTRO"),
        }
    }

    /// Resize message the first boot prints, if any.
    ///
    /// Only the first fstype is booted. Ubuntu keeps the kernel quiet on the
    /// console, so its resize message never shows.
    pub fn resize_kind(&self) -> Option<ResizeKind> {
        if self.fstypes.first().map(String::as_str) != Some("wic") {
            return None;
        }
        let wks = self.wks_file.as_deref()?;
        let distro = self.distro.as_deref()?;
        if distro.contains("ubuntu") {
            return None;
        }
        if wks.contains(WKS_BTRFS_RESIZE) {
            Some(ResizeKind::Btrfs)
        } else if wks.contains(WKS_EXT4_RESIZE) {
            Some(ResizeKind::Ext4)
        } else {
            None
        }
    }
}

/// `NAME="value"` (or unquoted) assignments; comments and exports skipped.
pub fn parse_env_dump(dump: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in dump.lines() {
        if line.starts_with('#') || line.starts_with(char::is_whitespace) {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let valid = |c: char| c.is_ascii_alphanumeric() || "_:-".contains(c);
        if name.is_empty() || !name.chars().all(valid) {
            continue;
        }
        vars.insert(name.to_string(), value.trim().trim_matches('"').to_string());
    }
    vars
}

/// Path of layer `name` from its `LAYERDIR_<name>` entry.
pub fn layer_dir(dump: &str, name: &str) -> Option<PathBuf> {
    parse_env_dump(dump)
        .remove(&format!("LAYERDIR_{name}"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Run `<tool> -e [target]` in `build_dir` and return its stdout.
///
/// One-shot query whose whole output is needed, so it is collected rather
/// than streamed.
pub fn query_env(tool: &CommandLine, target: Option<&str>, build_dir: &Path) -> Result<String> {
    let mut cmd = std::process::Command::new(tool.program());
    cmd.args(tool.arguments()).arg("-e").current_dir(build_dir);
    if let Some(target) = target {
        cmd.arg(target);
    }
    debug!(tool = %tool, target = ?target, "querying build environment");
    let output = cmd.output().map_err(|source| CiError::Spawn {
        program: tool.program().to_string(),
        source,
    })?;
    if !output.status.success() {
        return Err(CiError::BuildFailure {
            status: output.status.code().unwrap_or(-1),
            targets: target.map(|t| vec![t.to_string()]).unwrap_or_default(),
        });
    }
    String::from_utf8(output.stdout)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        .io_context(|| format!("decoding `{tool} -e` output"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"#
# $IMAGE_FSTYPES [2 operations]
IMAGE_FSTYPES="wic ext4"
WKS_FILE="sdimage-efi-sd"
DISTRO="debian-bookworm"
LAYERDIR_isar="/work/isar/meta"
LAYERDIR_cip-core=""
export PATH="/usr/bin"
do_build() {
    echo DISTRO="not-this"
}
"#;

    #[test]
    fn parses_the_variables_that_matter() {
        let meta = ImageMetadata::from_env_dump(DUMP);
        assert_eq!(meta.fstypes, vec!["wic", "ext4"]);
        assert_eq!(meta.wks_file.as_deref(), Some("sdimage-efi-sd"));
        assert_eq!(meta.distro.as_deref(), Some("debian-bookworm"));
        assert_eq!(meta.resize_kind(), Some(ResizeKind::Ext4));
    }

    #[test]
    fn layer_dir_lookup() {
        assert_eq!(layer_dir(DUMP, "isar"), Some(PathBuf::from("/work/isar/meta")));
        assert_eq!(layer_dir(DUMP, "cip-core"), None);
        assert_eq!(layer_dir(DUMP, "missing"), None);
    }

    #[test]
    fn resize_requires_wic_first_and_a_verbose_distro() {
        let base = ImageMetadata {
            fstypes: vec!["wic".into()],
            wks_file: Some("sdimage-efi-btrfs".into()),
            distro: Some("debian-trixie".into()),
        };
        assert_eq!(base.resize_kind(), Some(ResizeKind::Btrfs));

        let ext4_first = ImageMetadata {
            fstypes: vec!["ext4".into(), "wic".into()],
            ..base.clone()
        };
        assert_eq!(ext4_first.resize_kind(), None);

        let ubuntu = ImageMetadata {
            distro: Some("ubuntu-noble".into()),
            ..base.clone()
        };
        assert_eq!(ubuntu.resize_kind(), None);

        let no_wks = ImageMetadata {
            wks_file: None,
            ..base.clone()
        };
        assert_eq!(no_wks.resize_kind(), None);

        let other_layout = ImageMetadata {
            wks_file: Some("directdisk-isar".into()),
            ..base
        };
        assert_eq!(other_layout.resize_kind(), None);
    }

    #[test]
    fn empty_dump_means_nothing_resizable() {
        assert_eq!(ImageMetadata::from_env_dump("").resize_kind(), None);
    }
}
