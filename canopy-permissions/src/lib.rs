//! Canopy Permissions - Inheritance Engine
//!
//! Boolean access decisions computed by walking the classification trees:
//! [`PermissionCache`] memoizes decisions with single-flight semantics and
//! pattern invalidation, [`PermissionTreeResolver`] combines ancestry walks
//! across the configured permission trees under an AND/OR relation, and
//! [`PermissionCascadeDomain`] dispatches per entity kind, applies fallback
//! chains, and fans topology-change signals out into cache invalidation.

pub mod cache;
pub mod cascade;
pub mod resolver;

pub use cache::{CacheConfig, CacheStats, DecisionKey, PermissionCache};
pub use cascade::{ActionRegistry, CascadeConfig, PermissionCascadeDomain};
pub use resolver::{DefaultPermissionSource, PermissionTreeResolver, StaticDefault};
