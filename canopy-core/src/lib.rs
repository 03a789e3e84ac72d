//! Canopy Core - Entity Types
//!
//! Pure data structures for the classification engine: identifiers, tree
//! definitions, permission targets, and the error taxonomy. All other crates
//! depend on this one; it contains no storage access and no business logic
//! beyond small pure helpers (placement rules, relation combination).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod error;
pub mod permission;
pub mod tree;

pub use error::{
    ConfigError, EngineError, EngineResult, FieldFailure, PermissionError, StorageError,
    ValidationCode, ValidationError,
};
pub use permission::{
    actions, AccessGate, AllowAll, ExplicitPermission, InvalidationPattern, InvalidationSink,
    PermissionKind, PermissionTarget, Relation, TreeScope,
};
pub use tree::{
    AllowedChildren, Element, LibrarySettings, Pagination, PermissionTreeLink, PermissionsConf,
    SubtreeNode, TreeBehavior, TreeDefinition, TreeNode,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// View the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Identifier of a tree definition (human-assigned key, e.g. `categories`).
    TreeId
);
id_type!(
    /// Identifier of a record library (human-assigned key, e.g. `shoes`).
    LibraryId
);
id_type!(
    /// Identifier of an external record within its library.
    RecordId
);
id_type!(
    /// Opaque identifier of a position within a tree.
    NodeId
);
id_type!(
    /// Identifier of an attribute linking an entity to a permission tree.
    AttributeId
);
id_type!(
    /// Identifier of a user group in the group hierarchy.
    GroupId
);
id_type!(
    /// Identifier of an acting user.
    UserId
);
id_type!(
    /// Name of a permission action (e.g. `access`, `edit_children`).
    ActionName
);

impl NodeId {
    /// Generate a fresh node identifier (UUIDv7, timestamp-sortable).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_roundtrip() {
        let tree = TreeId::from("categories");
        assert_eq!(tree.as_str(), "categories");
        assert_eq!(tree.to_string(), "categories");
    }

    #[test]
    fn test_id_serde_transparent() {
        let lib = LibraryId::from("shoes");
        let json = serde_json::to_string(&lib).unwrap();
        assert_eq!(json, "\"shoes\"");
        let back: LibraryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lib);
    }

    #[test]
    fn test_generated_node_ids_are_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
    }
}
