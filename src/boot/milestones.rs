//! Marker sets a boot must show before it counts as a success.

use crate::config::BootConfig;
use crate::image::{ImageMetadata, ResizeKind};

/// A fixed substring whose presence in the console output signals a milestone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub name: &'static str,
    pub text: Vec<u8>,
}

impl Marker {
    pub fn new(name: &'static str, text: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            text: text.into(),
        }
    }

    pub fn found_in(&self, haystack: &[u8]) -> bool {
        contains(haystack, &self.text)
    }
}

/// Required markers for one boot scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMilestoneSet {
    pub login: Marker,
    pub feature: Option<Marker>,
    pub resize: Option<Marker>,
}

impl BootMilestoneSet {
    /// Markers for `meta` with the texts from `config`.
    ///
    /// `skip_feature` drops the feature marker. Non-resizable layouts get no
    /// resize marker.
    pub fn for_image(config: &BootConfig, meta: &ImageMetadata, skip_feature: bool) -> Self {
        let feature =
            (!skip_feature).then(|| Marker::new("feature", config.feature_marker.as_bytes()));
        let resize = meta.resize_kind().map(|kind| match kind {
            ResizeKind::Ext4 => Marker::new("resize", config.resize_ext4_marker.as_bytes()),
            ResizeKind::Btrfs => Marker::new("resize", config.resize_btrfs_marker.as_bytes()),
        });
        Self {
            login: Marker::new("login", config.login_marker.as_bytes()),
            feature,
            resize,
        }
    }

    /// Every applicable marker, login first.
    pub fn required(&self) -> impl Iterator<Item = &Marker> {
        std::iter::once(&self.login)
            .chain(self.feature.as_ref())
            .chain(self.resize.as_ref())
    }

    /// Required markers absent from `capture`.
    pub fn missing_in(&self, capture: &[u8]) -> Vec<&'static str> {
        self.required()
            .filter(|m| !m.found_in(capture))
            .map(|m| m.name)
            .collect()
    }

    /// Longest marker text, which bounds the rolling tail.
    pub fn longest(&self) -> usize {
        self.required().map(|m| m.text.len()).max().unwrap_or(0)
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
