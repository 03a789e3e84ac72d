//! Permission targets, combination relations, and invalidation patterns.
//!
//! A permission decision is addressed by a [`PermissionTarget`]: the kind of
//! entity, the entity's apply-to identifier, the action, and an optional tree
//! scope. Composite apply-to identifiers join their components with `/`
//! (`shoes/A`, `categories/shoes`), which is also what structural
//! invalidation patterns match against, segment by segment.

use crate::tree::Element;
use crate::{
    ActionName, AttributeId, EngineResult, GroupId, LibraryId, NodeId, TreeId, UserId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// PERMISSION KINDS & ACTIONS
// ============================================================================

/// Kind discriminator for permission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionKind {
    Record,
    RecordAttribute,
    Library,
    Attribute,
    App,
    Tree,
    TreeNode,
    TreeLibrary,
}

impl PermissionKind {
    /// All kinds, in dispatch order.
    pub const ALL: [PermissionKind; 8] = [
        PermissionKind::Record,
        PermissionKind::RecordAttribute,
        PermissionKind::Library,
        PermissionKind::Attribute,
        PermissionKind::App,
        PermissionKind::Tree,
        PermissionKind::TreeNode,
        PermissionKind::TreeLibrary,
    ];

    /// Stable machine-readable kind string.
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::Record => "record",
            PermissionKind::RecordAttribute => "record_attribute",
            PermissionKind::Library => "library",
            PermissionKind::Attribute => "attribute",
            PermissionKind::App => "app",
            PermissionKind::Tree => "tree",
            PermissionKind::TreeNode => "tree_node",
            PermissionKind::TreeLibrary => "tree_library",
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known action names.
pub mod actions {
    pub const ACCESS: &str = "access";
    pub const CREATE: &str = "create";
    pub const EDIT: &str = "edit";
    pub const DELETE: &str = "delete";
    pub const ADMIN: &str = "admin";
    pub const EDIT_CHILDREN: &str = "edit_children";
    pub const DETACH: &str = "detach";
}

// ============================================================================
// COMBINATION RELATION
// ============================================================================

/// Rule for combining several permission-tree decisions into one.
///
/// Individual decisions are tri-state: `Some(true)`, `Some(false)`, or
/// `None` for undefined (no explicit record found anywhere along a walk).
/// Undefined entries are ignored by both relations; a combination where all
/// entries are undefined stays undefined and falls through to the caller's
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Relation {
    /// All defined entries must be true.
    #[default]
    And,
    /// Any defined true entry wins.
    Or,
}

impl Relation {
    /// Combine decisions under this relation.
    pub fn combine<I>(&self, results: I) -> Option<bool>
    where
        I: IntoIterator<Item = Option<bool>>,
    {
        let mut combined: Option<bool> = None;
        for result in results {
            let Some(value) = result else { continue };
            combined = Some(match (*self, combined) {
                (Relation::And, Some(acc)) => acc && value,
                (Relation::Or, Some(acc)) => acc || value,
                (_, None) => value,
            });
        }
        combined
    }
}

// ============================================================================
// TARGETS & EXPLICIT RECORDS
// ============================================================================

/// Position scope of a tree-node target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeScope {
    pub tree: TreeId,
    pub node: NodeId,
}

/// The unit addressed by one permission decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionTarget {
    /// Entity kind.
    pub kind: PermissionKind,
    /// Apply-to identifier; composite ids join components with `/`.
    pub apply_to: String,
    /// Action being decided.
    pub action: ActionName,
    /// Position scope, for tree-node targets.
    pub tree_scope: Option<TreeScope>,
}

impl PermissionTarget {
    /// Record-level target (`library/record`).
    pub fn record(element: &Element, action: impl Into<ActionName>) -> Self {
        Self {
            kind: PermissionKind::Record,
            apply_to: format!("{}/{}", element.library, element.id),
            action: action.into(),
            tree_scope: None,
        }
    }

    /// Record-attribute target (`library/attribute/record`).
    pub fn record_attribute(
        element: &Element,
        attribute: &AttributeId,
        action: impl Into<ActionName>,
    ) -> Self {
        Self {
            kind: PermissionKind::RecordAttribute,
            apply_to: format!("{}/{}/{}", element.library, attribute, element.id),
            action: action.into(),
            tree_scope: None,
        }
    }

    /// Library-level target.
    pub fn library(library: &LibraryId, action: impl Into<ActionName>) -> Self {
        Self {
            kind: PermissionKind::Library,
            apply_to: library.to_string(),
            action: action.into(),
            tree_scope: None,
        }
    }

    /// Attribute-level target.
    pub fn attribute(attribute: &AttributeId, action: impl Into<ActionName>) -> Self {
        Self {
            kind: PermissionKind::Attribute,
            apply_to: attribute.to_string(),
            action: action.into(),
            tree_scope: None,
        }
    }

    /// Application-wide target.
    pub fn app(action: impl Into<ActionName>) -> Self {
        Self {
            kind: PermissionKind::App,
            apply_to: "app".to_string(),
            action: action.into(),
            tree_scope: None,
        }
    }

    /// Tree-level target.
    pub fn tree(tree: &TreeId, action: impl Into<ActionName>) -> Self {
        Self {
            kind: PermissionKind::Tree,
            apply_to: tree.to_string(),
            action: action.into(),
            tree_scope: None,
        }
    }

    /// Tree-node target, scoped to one position.
    pub fn tree_node(tree: &TreeId, node: &NodeId, action: impl Into<ActionName>) -> Self {
        Self {
            kind: PermissionKind::TreeNode,
            apply_to: tree.to_string(),
            action: action.into(),
            tree_scope: Some(TreeScope {
                tree: tree.clone(),
                node: node.clone(),
            }),
        }
    }

    /// Tree-library target (`tree/library`).
    pub fn tree_library(
        tree: &TreeId,
        library: &LibraryId,
        action: impl Into<ActionName>,
    ) -> Self {
        Self {
            kind: PermissionKind::TreeLibrary,
            apply_to: format!("{}/{}", tree, library),
            action: action.into(),
            tree_scope: None,
        }
    }
}

/// An explicit grant or denial, as persisted in the permission store.
///
/// `node` scopes the record to a tree position for inheritance walks;
/// `None` addresses the entity directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitPermission {
    pub kind: PermissionKind,
    pub apply_to: String,
    pub group: GroupId,
    pub action: ActionName,
    pub node: Option<NodeId>,
    pub allowed: bool,
}

impl ExplicitPermission {
    /// Create an explicit record.
    pub fn new(
        kind: PermissionKind,
        apply_to: impl Into<String>,
        group: impl Into<GroupId>,
        action: impl Into<ActionName>,
        node: Option<NodeId>,
        allowed: bool,
    ) -> Self {
        Self {
            kind,
            apply_to: apply_to.into(),
            group: group.into(),
            action: action.into(),
            node,
            allowed,
        }
    }
}

// ============================================================================
// INVALIDATION PATTERNS
// ============================================================================

/// Whether `segment` appears as a whole `/`-separated component of
/// `composite` (or equals it outright).
fn segment_match(composite: &str, segment: &str) -> bool {
    composite == segment || composite.split('/').any(|part| part == segment)
}

/// Structural pattern over cached decision keys.
///
/// Every populated field must match for an entry to be invalidated; an empty
/// pattern matches everything. Apply-to matching is per segment of the
/// composite id, so over-invalidation is possible and safe (entries are
/// simply recomputed on the next request).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvalidationPattern {
    pub kind: Option<PermissionKind>,
    pub apply_to: Option<String>,
    pub action: Option<ActionName>,
    pub group: Option<GroupId>,
    pub tree: Option<TreeId>,
}

impl InvalidationPattern {
    /// Pattern matching every entry.
    pub fn any() -> Self {
        Self::default()
    }

    /// Entries scoped to `tree`, either through their position scope or
    /// through a `tree/...` composite apply-to.
    pub fn for_tree(tree: &TreeId) -> Self {
        Self {
            tree: Some(tree.clone()),
            ..Self::default()
        }
    }

    /// Entries of `kind` whose apply-to contains `segment`.
    pub fn for_kind_scope(kind: PermissionKind, segment: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            apply_to: Some(segment.into()),
            ..Self::default()
        }
    }

    /// Entries affected by saving or removing `record`.
    pub fn for_explicit(record: &ExplicitPermission) -> Self {
        Self {
            kind: Some(record.kind),
            apply_to: Some(record.apply_to.clone()),
            action: Some(record.action.clone()),
            group: Some(record.group.clone()),
            tree: None,
        }
    }

    /// Whether a cached decision for `(target, group)` matches this pattern.
    pub fn matches(&self, target: &PermissionTarget, group: &GroupId) -> bool {
        if let Some(kind) = self.kind {
            if target.kind != kind {
                return false;
            }
        }
        if let Some(apply_to) = &self.apply_to {
            if !segment_match(&target.apply_to, apply_to) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &target.action != action {
                return false;
            }
        }
        if let Some(wanted) = &self.group {
            if group != wanted {
                return false;
            }
        }
        if let Some(tree) = &self.tree {
            let in_scope = target
                .tree_scope
                .as_ref()
                .is_some_and(|scope| &scope.tree == tree);
            if !in_scope && !segment_match(&target.apply_to, tree.as_str()) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// COLLABORATION SEAMS
// ============================================================================

/// Boolean access decisions, as consumed by the structure manager for its
/// move/delete gates. Implemented by the permission cascade domain.
#[async_trait]
pub trait AccessGate: Send + Sync {
    /// Decide whether `user` may perform `target`.
    async fn allowed(&self, user: &UserId, target: &PermissionTarget) -> EngineResult<bool>;
}

/// Gate that allows everything. For tests and permission-less deployments.
pub struct AllowAll;

#[async_trait]
impl AccessGate for AllowAll {
    async fn allowed(&self, _user: &UserId, _target: &PermissionTarget) -> EngineResult<bool> {
        Ok(true)
    }
}

/// Receiver of topology-change signals, responsible for dropping every
/// cached decision the change could affect. Implemented by the permission
/// cascade domain.
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    /// Called after topology or configuration under `tree` changed.
    /// Returns the number of entries dropped.
    async fn tree_changed(&self, tree: &TreeId) -> EngineResult<u64>;
}

// =============================================================================
// TESTS
// =============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// AND over any decision list equals the conjunction of the defined
        /// entries, and stays undefined only when nothing is defined.
        #[test]
        fn prop_and_matches_reference_model(results in proptest::collection::vec(
            proptest::option::of(proptest::bool::ANY), 0..8,
        )) {
            let defined: Vec<bool> = results.iter().flatten().copied().collect();
            let expected = if defined.is_empty() {
                None
            } else {
                Some(defined.iter().all(|v| *v))
            };
            prop_assert_eq!(Relation::And.combine(results), expected);
        }

        /// OR over any decision list equals the disjunction of the defined
        /// entries, and stays undefined only when nothing is defined.
        #[test]
        fn prop_or_matches_reference_model(results in proptest::collection::vec(
            proptest::option::of(proptest::bool::ANY), 0..8,
        )) {
            let defined: Vec<bool> = results.iter().flatten().copied().collect();
            let expected = if defined.is_empty() {
                None
            } else {
                Some(defined.iter().any(|v| *v))
            };
            prop_assert_eq!(Relation::Or.combine(results), expected);
        }

        /// Undefined entries never change a combination, under either
        /// relation.
        #[test]
        fn prop_undefined_entries_are_ignored(
            results in proptest::collection::vec(proptest::option::of(proptest::bool::ANY), 0..8),
            padding in 0usize..4,
        ) {
            let mut padded = results.clone();
            for _ in 0..padding {
                padded.push(None);
            }
            prop_assert_eq!(
                Relation::And.combine(padded.clone()),
                Relation::And.combine(results.clone())
            );
            prop_assert_eq!(
                Relation::Or.combine(padded),
                Relation::Or.combine(results)
            );
        }
    }
}
