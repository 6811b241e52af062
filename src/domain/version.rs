//! Semantic `major.minor` versions used for compatibility gating

use std::fmt;
use std::str::FromStr;

use crate::error::BrokerError;

/// A `major.minor` version
///
/// Ordering is lexicographic on (major, minor), so `1.10 > 1.9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// True when this version is at least `minimum`
    pub fn satisfies(&self, minimum: &Version) -> bool {
        self >= minimum
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = BrokerError;

    /// Accepts `"2"`, `"2.1"` and tolerates a trailing patch (`"2.1.7"`), which is ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::Config(format!("Invalid version '{}'", s));
        let mut parts = s.trim().split('.');

        let major = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(invalid)?
            .parse::<u32>()
            .map_err(|_| invalid())?;
        let minor = match parts.next() {
            Some(p) => p.parse::<u32>().map_err(|_| invalid())?,
            None => 0,
        };
        if let Some(patch) = parts.next() {
            patch.parse::<u32>().map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self { major, minor })
    }
}

impl serde::Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(VersionVisitor)
    }
}

/// Accepts strings and bare YAML numbers (`1.0` parses as a float there)
struct VersionVisitor;

impl serde::de::Visitor<'_> for VersionVisitor {
    type Value = Version;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a version such as \"1.0\"")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Version, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Version, E> {
        let major = u32::try_from(v).map_err(E::custom)?;
        Ok(Version::new(major, 0))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Version, E> {
        let major = u32::try_from(v).map_err(E::custom)?;
        Ok(Version::new(major, 0))
    }

    // Float forms lose trailing zeros ("1.10" reads as 1.1), quote those in config files
    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Version, E> {
        v.to_string().parse().map_err(E::custom)
    }
}
