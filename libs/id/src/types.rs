//! Identity types shared by every stored object.

use crate::{define_counter, define_id, IdError};

// =============================================================================
// UIDs
// =============================================================================

define_id!(Uid, "uid");

// =============================================================================
// Counters
// =============================================================================

define_counter!(
    /// Per-object write counter used for optimistic concurrency.
    ///
    /// Serialized as a decimal string, matching the wire form clients
    /// round-trip without interpreting.
    ResourceVersion
);

define_counter!(
    /// Per-object spec counter; bumps only when the spec changes.
    Generation
);

define_counter!(
    /// Monotonic sequence number of recorded events.
    EventId
);

impl ResourceVersion {
    /// Parses a resource version from its decimal wire form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        s.parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .map(Self::new)
            .ok_or_else(|| IdError::InvalidResourceVersion(s.to_string()))
    }
}

impl std::str::FromStr for ResourceVersion {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for Generation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.value())
    }
}

impl<'de> serde::Deserialize<'de> for Generation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self::new(i64::deserialize(deserializer)?))
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.value())
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self::new(i64::deserialize(deserializer)?))
    }
}

// =============================================================================
// Tests
// =============================================================================
