//! Library version.

use std::fmt;

/// Library version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Patch level.
    pub patch: u16,
}

impl Version {
    /// Pack into a single integer (`major << 32 | minor << 16 | patch`).
    pub fn to_code(self) -> u64 {
        (u64::from(self.major) << 32) | (u64::from(self.minor) << 16) | u64::from(self.patch)
    }

    /// Unpack from the integer produced by [`Version::to_code`].
    pub fn from_code(code: u64) -> Self {
        Self {
            major: ((code >> 32) & 0xFFFF) as u16,
            minor: ((code >> 16) & 0xFFFF) as u16,
            patch: (code & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn parse_component(s: &str) -> u16 {
    s.parse().unwrap_or(0)
}

/// Version of this library.
pub fn version() -> Version {
    Version {
        major: parse_component(env!("CARGO_PKG_VERSION_MAJOR")),
        minor: parse_component(env!("CARGO_PKG_VERSION_MINOR")),
        patch: parse_component(env!("CARGO_PKG_VERSION_PATCH")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_package() {
        assert_eq!(version().to_string(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_version_code() {
        let v = Version { major: 1, minor: 2, patch: 3 };
        assert_eq!(v.to_code(), 0x0001_0002_0003);
        assert_eq!(Version::from_code(v.to_code()), v);
    }
}
