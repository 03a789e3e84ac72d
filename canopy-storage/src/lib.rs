//! Canopy Storage - Storage Contracts and In-Memory Implementations
//!
//! Defines the external-collaborator seams the engine consumes: node
//! topology ([`TreeStore`]), explicit permission records
//! ([`PermissionStore`]), record existence ([`RecordExistenceChecker`]),
//! group hierarchy ([`GroupHierarchyResolver`]), and permission-tree
//! configuration ([`PermissionsConfSource`]). Each contract ships with a
//! complete in-memory implementation used by tests and development setups;
//! production backends live behind the same traits.

pub mod directory;
pub mod permission_store;
pub mod schema;
pub mod tree_store;

pub use directory::{
    GroupHierarchyResolver, InMemoryGroupHierarchy, InMemoryRecordChecker, RecordExistenceChecker,
};
pub use permission_store::{InMemoryPermissionStore, PermissionStore};
pub use schema::{InMemoryConfSource, PermissionsConfSource};
pub use tree_store::{InMemoryTreeStore, TreeStore};
