use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Strongly typed correlation identifier backed by ULID.
///
/// A fresh id is stamped onto every request by the caller; replies copy it
/// back so the caller can match a reply to its own in-flight request and
/// skip stale traffic on a reused reply queue. Serialized as the ULID's
/// canonical string form.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct CorrelationId(ulid::Ulid);

impl CorrelationId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// The underlying ULID.
    #[must_use]
    pub fn as_ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for CorrelationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<CorrelationId>()
            .map_err(|_| serde::de::Error::custom("invalid correlation id"))
    }
}
