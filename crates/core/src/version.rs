use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::WeftError;

/// A semantic version: `major.minor.patch` with optional pre-release and
/// build tag (`1.4.0-rc.2+build.17`).
///
/// Ordering follows semantic-versioning precedence: numeric fields first,
/// a pre-release orders below the corresponding release, pre-release
/// identifiers compare numerically when both are numeric, lexically when
/// both are alphanumeric, and numeric identifiers order below alphanumeric
/// ones. The build tag does not participate in precedence; it is used only
/// as a final tie-break so that ordering stays consistent with equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pre: Vec<PreIdentifier>,
    build: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PreIdentifier {
    Numeric(u64),
    Alpha(String),
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
            build: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, WeftError> {
        input.parse()
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }
}

impl FromStr for Version {
    type Err = WeftError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || WeftError::InvalidVersion(input.to_string());

        let (rest, build) = match input.split_once('+') {
            Some((rest, build)) if !build.is_empty() => (rest, Some(build.to_string())),
            Some(_) => return Err(invalid()),
            None => (input, None),
        };

        let (numbers, pre) = match rest.split_once('-') {
            Some((numbers, pre)) if !pre.is_empty() => (numbers, Some(pre)),
            Some(_) => return Err(invalid()),
            None => (rest, None),
        };

        let mut fields = numbers.split('.');
        let major = parse_numeric_field(fields.next()).ok_or_else(invalid)?;
        let minor = parse_numeric_field(fields.next()).ok_or_else(invalid)?;
        let patch = parse_numeric_field(fields.next()).ok_or_else(invalid)?;
        if fields.next().is_some() {
            return Err(invalid());
        }

        let pre = match pre {
            Some(pre) => pre
                .split('.')
                .map(|id| {
                    if id.is_empty() {
                        return None;
                    }
                    if id.bytes().all(|b| b.is_ascii_digit()) {
                        id.parse().ok().map(PreIdentifier::Numeric)
                    } else if id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
                        Some(PreIdentifier::Alpha(id.to_string()))
                    } else {
                        None
                    }
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(invalid)?,
            None => Vec::new(),
        };

        Ok(Self {
            major,
            minor,
            patch,
            pre,
            build,
        })
    }
}

fn parse_numeric_field(field: Option<&str>) -> Option<u64> {
    let field = field?;
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                // A release orders above any pre-release of the same numbers.
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare_prerelease(&self.pre, &other.pre),
            })
            .then_with(|| self.build.cmp(&other.build))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_prerelease(a: &[PreIdentifier], b: &[PreIdentifier]) -> Ordering {
    for (left, right) in a.iter().zip(b.iter()) {
        let ord = match (left, right) {
            (PreIdentifier::Numeric(l), PreIdentifier::Numeric(r)) => l.cmp(r),
            (PreIdentifier::Alpha(l), PreIdentifier::Alpha(r)) => l.cmp(r),
            (PreIdentifier::Numeric(_), PreIdentifier::Alpha(_)) => Ordering::Less,
            (PreIdentifier::Alpha(_), PreIdentifier::Numeric(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    // Identical prefix: the longer identifier list wins.
    a.len().cmp(&b.len())
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            let ids: Vec<String> = self
                .pre
                .iter()
                .map(|id| match id {
                    PreIdentifier::Numeric(n) => n.to_string(),
                    PreIdentifier::Alpha(s) => s.clone(),
                })
                .collect();
            write!(f, "-{}", ids.join("."))?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
