mod registry;

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use registry::{IdentityError, IdentityRegistry};

/// Default boundary between the authoritative range `[0, ceiling)` and the
/// local-only range `[ceiling, u32::MAX]`.
pub const DEFAULT_LOCAL_ID_CEILING: u32 = u32::MAX - 10_000_000;

/// Process-unique identity bound to an entity through its `UID` metadata.
///
/// Travels as a decimal string on the wire, both as a value and as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId(pub u32);

impl UniqueId {
    /// The scene root is bound to the first authoritative id on every process.
    pub const ROOT: UniqueId = UniqueId(0);

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniqueId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(UniqueId)
    }
}

impl From<u32> for UniqueId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Serialize for UniqueId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

struct UniqueIdVisitor;

impl Visitor<'_> for UniqueIdVisitor {
    type Value = UniqueId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an entity identity as a decimal string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        u32::try_from(v)
            .map(UniqueId)
            .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
    }
}

impl<'de> Deserialize<'de> for UniqueId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(UniqueIdVisitor)
    }
}
