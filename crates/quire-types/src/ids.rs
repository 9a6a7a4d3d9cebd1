//! Typed identifiers for workspaces, documents, users and scheduler records.
//!
//! Everything except [`BlockId`] wraps a UUIDv7 (time-ordered, globally unique)
//! and displays as standard UUID text for logging. The `short()` form (first 8
//! hex chars) is for human-facing output only, never a lookup key.
//!
//! Block ids are opaque strings chosen by whichever client created the block,
//! so they get a transparent string newtype instead.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A workspace identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(uuid::Uuid);

/// A notebook document identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(uuid::Uuid);

/// A user identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(uuid::Uuid);

/// A replica identifier: one per process writing into a shared document.
///
/// Used as the tiebreak when two writers stamp the same Lamport tick.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(uuid::Uuid);

/// A layout block-group identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(uuid::Uuid);

/// An execution-queue batch identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(uuid::Uuid);

/// An execution-queue item identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(uuid::Uuid);

/// An AI task identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new time-ordered ID (UUIDv7).
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// First 8 hex characters, for human display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// A nil / zero ID, for sentinel values only.
            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            /// Check if this is the nil ID.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(WorkspaceId, "WorkspaceId");
impl_typed_id!(DocumentId, "DocumentId");
impl_typed_id!(UserId, "UserId");
impl_typed_id!(ReplicaId, "ReplicaId");
impl_typed_id!(GroupId, "GroupId");
impl_typed_id!(BatchId, "BatchId");
impl_typed_id!(ItemId, "ItemId");
impl_typed_id!(TaskId, "TaskId");

// ── Sentinels ───────────────────────────────────────────────────────────────

/// Fixed namespace for deriving deterministic ids via UUIDv5.
const QUIRE_NS: uuid::Uuid = uuid::uuid!("3f0c9a52-6d1e-4b7a-9c28-5e4d7b1a0f93");

impl UserId {
    /// The well-known scheduler user, for work nobody explicitly requested
    /// (scheduled run-alls, forced recovery transitions).
    pub fn system() -> Self {
        Self(uuid::Uuid::new_v5(&QUIRE_NS, b"system"))
    }
}

// ── BlockId ─────────────────────────────────────────────────────────────────

/// Stable block identifier. Unique within a document, immutable after creation.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_ids_are_unique() {
        let a = ItemId::new();
        let b = ItemId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_accepts_display_form() {
        let id = DocumentId::new();
        let parsed = DocumentId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn system_user_is_deterministic() {
        assert_eq!(UserId::system(), UserId::system());
        assert!(!UserId::system().is_nil());
    }

    #[test]
    fn block_id_is_transparent_on_the_wire() {
        let id = BlockId::from("block-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"block-1\"");
        assert_eq!(format!("{id:?}"), "BlockId(block-1)");
    }
}
