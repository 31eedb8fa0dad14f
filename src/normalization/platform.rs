use serde::{Deserialize, Serialize};

/// Desktop platforms a review can be flagged for.
///
/// The set is fixed; `platforms.name` stores the canonical label returned by
/// [`DesktopPlatform::name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesktopPlatform {
    Windows,
    Mac,
    Linux,
}

impl DesktopPlatform {
    pub const ALL: [DesktopPlatform; 3] = [Self::Windows, Self::Mac, Self::Linux];

    pub fn name(self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::Mac => "Mac",
            Self::Linux => "Linux",
        }
    }
}

/// Per-platform availability flags as supplied by a seed document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFlags {
    #[serde(default)]
    pub windows: bool,
    #[serde(default)]
    pub mac: bool,
    #[serde(default)]
    pub linux: bool,
}

impl PlatformFlags {
    pub fn is_set(&self, platform: DesktopPlatform) -> bool {
        match platform {
            DesktopPlatform::Windows => self.windows,
            DesktopPlatform::Mac => self.mac,
            DesktopPlatform::Linux => self.linux,
        }
    }

    /// Enabled platforms in canonical order (Windows, Mac, Linux).
    pub fn enabled(&self) -> Vec<DesktopPlatform> {
        DesktopPlatform::ALL
            .into_iter()
            .filter(|p| self.is_set(*p))
            .collect()
    }
}
