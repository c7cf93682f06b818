//! Three-part server versions and the compatibility thresholds built on them.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use thiserror::Error;

/// Oldest server release the supervisor will talk to.
pub const MINIMUM_SUPPORTED: &str = "0.20.0";

/// First release that sends `enableToggleButton` / `showErrorStatus`.
pub const SIGNALS_SINCE: &str = "0.21.8";

/// First release that reacts to changes of `.rbs` files.
pub const SECONDARY_FILES_SINCE: &str = "0.30.1";

static VERSION_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn version_regex() -> &'static regex::Regex {
    VERSION_REGEX.get_or_init(|| {
        regex::Regex::new(r"^(\d+)\.(\d+)\.(\d+)$")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// A version string did not look like `major.minor.patch`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("the format of version {0:?} is invalid")]
pub struct MalformedVersion(pub String);

/// A `major.minor.patch` version, ordered component by component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTriple {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl VersionTriple {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for VersionTriple {
    type Err = MalformedVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedVersion(s.to_string());
        let caps = version_regex().captures(s).ok_or_else(malformed)?;
        let component = |i: usize| caps[i].parse::<u64>().map_err(|_| malformed());

        Ok(Self::new(component(1)?, component(2)?, component(3)?))
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compare two version strings numerically.
///
/// Both strings are validated before anything is compared, so
/// `compare("x", "x")` is an error rather than `Equal`.
pub fn compare(v1: &str, v2: &str) -> Result<Ordering, MalformedVersion> {
    let left: VersionTriple = v1.parse()?;
    let right: VersionTriple = v2.parse()?;
    if v1 == v2 {
        return Ok(Ordering::Equal);
    }
    Ok(left.cmp(&right))
}

/// Whether `version` is at or above `threshold`.
pub fn at_least(version: &str, threshold: &str) -> Result<bool, MalformedVersion> {
    Ok(compare(version, threshold)? != Ordering::Less)
}
