//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of the aggregate whose search projection a task mutates
/// (a project, dataset, or any other indexed content item).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(Uuid);

impl TargetId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TargetId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for TargetId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<TargetId> for Uuid {
    fn from(value: TargetId) -> Self {
        value.0
    }
}

impl FromStr for TargetId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("TargetId: {}", e)))?;
        Ok(Self(uuid))
    }
}

macro_rules! impl_sequence_newtype {
    ($t:ident, $doc:literal) => {
        #[doc = $doc]
        ///
        /// Assigned by the store from a monotonically increasing sequence, so
        /// ascending order is insertion (FIFO) order.
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(i64);

        impl $t {
            pub fn new(value: i64) -> Self {
                Self(value)
            }

            pub fn value(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_sequence_newtype!(TaskId, "Identifier of a queued projection task.");
impl_sequence_newtype!(DeadLetterId, "Identifier of a quarantined (dead-lettered) task record.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_order_by_value() {
        assert!(TaskId::new(1) < TaskId::new(2));
        assert!(TaskId::new(2) < TaskId::new(10));
    }

    #[test]
    fn target_id_round_trips_through_str() {
        let id = TargetId::new();
        let parsed: TargetId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn malformed_target_id_is_rejected() {
        let err = "not-a-uuid".parse::<TargetId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }
}
