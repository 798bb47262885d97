//! Supported build targets and their container images.
//!
//! Image selection is a static table: an unrecognized distro never reaches
//! the container runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Distro used when a build request does not name one.
pub const DEFAULT_DISTRO: Distro = Distro::Arch;

/// Dependency channel used when a build request does not name one.
pub const DEFAULT_DEPENDENCY_CHANNEL: DependencyChannel = DependencyChannel::Stable;

/// A distribution the builder images exist for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    Arch,
    Artix,
}

impl Distro {
    pub const ALL: &'static [Distro] = &[Distro::Arch, Distro::Artix];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arch => "arch",
            Self::Artix => "artix",
        }
    }

    /// Container image reference the build runs in.
    pub fn image(self) -> &'static str {
        match self {
            Self::Arch => "corysanin/archery:arch",
            Self::Artix => "corysanin/archery:artix",
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distro {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown distro '{s}'")))
    }
}

/// Which repositories the builder resolves dependencies from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyChannel {
    Stable,
    Testing,
    Staging,
}

impl DependencyChannel {
    pub const ALL: &'static [DependencyChannel] = &[
        DependencyChannel::Stable,
        DependencyChannel::Testing,
        DependencyChannel::Staging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Testing => "testing",
            Self::Staging => "staging",
        }
    }
}

impl fmt::Display for DependencyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyChannel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown dependency channel '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn known_distros_map_to_images() {
        assert_eq!("arch".parse::<Distro>().unwrap().image(), "corysanin/archery:arch");
        assert_eq!("artix".parse::<Distro>().unwrap().image(), "corysanin/archery:artix");
    }

    #[test]
    fn unknown_distro_is_rejected() {
        assert_matches!("debian".parse::<Distro>(), Err(CoreError::Validation(msg)) if msg.contains("debian"));
        assert!("".parse::<Distro>().is_err());
        assert!("Arch".parse::<Distro>().is_err());
    }

    #[test]
    fn default_distro_is_arch() {
        assert_eq!(DEFAULT_DISTRO, Distro::Arch);
    }

    #[test]
    fn dependency_channels_parse() {
        for channel in DependencyChannel::ALL {
            assert_eq!(channel.as_str().parse::<DependencyChannel>().unwrap(), *channel);
        }
        assert!("nightly".parse::<DependencyChannel>().is_err());
    }
}
