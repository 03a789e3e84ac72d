//! Canopy Trees - Topology Management
//!
//! The two tree-side components of the engine: [`AncestryResolver`], a pure
//! traversal layer producing root-to-node paths and nested subtree views,
//! and [`TreeStructureManager`], which validates and applies topology
//! mutations while holding the per-tree mutation lock and signalling cache
//! invalidation to the permission side.

pub mod ancestry;
pub mod structure;

pub use ancestry::AncestryResolver;
pub use structure::TreeStructureManager;
