// ABOUTME: Phantom-typed identifiers for compile-time type safety.
// ABOUTME: Prevents accidental swapping of container, backup, and run ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Marker types for phantom type parameters.
/// Using empty enums prevents instantiation and requires no trait bounds.
pub enum ContainerMarker {}
pub enum BackupMarker {}
pub enum RunMarker {}

/// A type-safe identifier that prevents accidental mixing of different id types.
///
/// A `BackupId` can never be passed where a `RunId` is expected, so a rollback
/// command cannot be handed the wrong kind of reference by mistake.
#[must_use = "ids reference resources and should not be ignored"]
pub struct Id<T> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

// Manual trait implementations that don't require T to implement the trait.
// This is necessary because T is only used as a phantom type marker.

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Id").field("value", &self.value).finish()
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T> std::fmt::Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

pub type ContainerId = Id<ContainerMarker>;
pub type BackupId = Id<BackupMarker>;
pub type RunId = Id<RunMarker>;

impl BackupId {
    /// Derive a backup id from its creation instant. Millisecond precision
    /// keeps ids unique across invocations; collisions are resolved by the
    /// backup store when it creates the snapshot directory.
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self::new(at.format("%Y%m%dT%H%M%S%3f").to_string())
    }
}

impl RunId {
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self::new(format!("run-{}", at.format("%Y%m%dT%H%M%S%3f")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_id_is_timestamp_derived() {
        let at = DateTime::parse_from_rfc3339("2026-08-05T10:15:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(BackupId::from_timestamp(at).as_str(), "20260805T101500250");
    }

    #[test]
    fn ids_with_same_value_are_equal() {
        assert_eq!(BackupId::new("a"), BackupId::new("a"));
        assert_ne!(BackupId::new("a"), BackupId::new("b"));
    }
}
