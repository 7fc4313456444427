//! Release version parsing and comparison

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::UpdateError;

/// A `major.minor.patch` release version, ordered lexicographically on the triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string, accepting one optional leading `v` (release tags)
    ///
    /// Anything other than exactly three non-negative integers is rejected,
    /// including pre-release or build suffixes.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let mut parts = bare.split('.');
        let major = parse_component(parts.next()?)?;
        let minor = parse_component(parts.next()?)?;
        let patch = parse_component(parts.next()?)?;

        if parts.next().is_some() {
            return None;
        }

        Some(Self::new(major, minor, patch))
    }

    /// The tag this version is published under (`v1.0.5`)
    pub fn tag(&self) -> String {
        format!("v{}", self)
    }
}

fn parse_component(part: &str) -> Option<u64> {
    // `u64::from_str` accepts a leading '+', which is not a valid component
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s).ok_or_else(|| UpdateError::Parse(format!("invalid version '{}'", s)))
    }
}

/// Whether `remote` should replace `local`
///
/// An absent local version (first run, corrupted store) makes any remote
/// version newer. Equal versions are never newer.
pub fn is_newer(remote: Version, local: Option<Version>) -> bool {
    match local {
        None => true,
        Some(local) => remote > local,
    }
}

/// Compare two raw version strings, failing closed on anything unparseable
pub fn is_newer_str(remote: &str, local: &str) -> bool {
    match Version::parse(remote) {
        Some(remote) => is_newer(remote, Version::parse(local)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_tagged() {
        assert_eq!(Version::parse("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(Version::parse("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(Version::parse("  1.0.5\n"), Some(Version::new(1, 0, 5)));
        assert_eq!(Version::parse("v10.20.30"), Some(Version::new(10, 20, 30)));
    }

    #[test]
    fn test_parse_fails_closed() {
        for raw in [
            "", "v", "1", "1.2", "1.2.3.4", "vv1.2.3", "1.2.x", "1.-2.3", "1.+2.3", "1.2.3-rc1",
            "latest", "1..3",
        ] {
            assert_eq!(Version::parse(raw), None, "{:?} should not parse", raw);
        }
    }

    #[test]
    fn test_version_comparison() {
        assert!(is_newer_str("1.0.1", "1.0.0"));
        assert!(is_newer_str("1.1.0", "1.0.9"));
        assert!(is_newer_str("2.0.0", "1.99.99"));
        assert!(is_newer_str("v1.0.0", "0.1.0"));
        assert!(!is_newer_str("1.0.0", "1.0.0"));
        assert!(!is_newer_str("0.9.0", "1.0.0"));
        assert!(is_newer_str("1.10.0", "1.9.0"));
    }

    #[test]
    fn test_unparseable_remote_is_never_newer() {
        assert!(!is_newer_str("garbage", "1.0.0"));
        assert!(!is_newer_str("garbage", "garbage"));
    }

    #[test]
    fn test_absent_local_means_newer() {
        assert!(is_newer(Version::new(0, 0, 1), None));
        assert!(is_newer_str("0.0.1", "not-a-version"));
    }

    #[test]
    fn test_is_newer_matches_ordering() {
        let versions = [
            Version::new(0, 0, 0),
            Version::new(0, 0, 1),
            Version::new(0, 1, 0),
            Version::new(1, 0, 0),
            Version::new(1, 0, 5),
            Version::new(1, 2, 0),
        ];
        for a in versions {
            assert!(!is_newer(a, Some(a)));
            for b in versions {
                assert_eq!(is_newer(a, Some(b)), a.cmp(&b).is_gt());
            }
        }
    }

    #[test]
    fn test_display_and_tag() {
        let v = Version::new(1, 0, 5);
        assert_eq!(v.to_string(), "1.0.5");
        assert_eq!(v.tag(), "v1.0.5");
        assert_eq!("v1.0.5".parse::<Version>(), Ok(v));
        assert!("nope".parse::<Version>().is_err());
    }
}
