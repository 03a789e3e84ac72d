//! Tree definitions, nodes, and placement rules.
//!
//! A tree is a named hierarchy of nodes, each referencing an external record
//! through an [`Element`]. Placement of elements is governed by per-library
//! settings on the owning [`TreeDefinition`]; the rules themselves are pure
//! and evaluated here, while enforcement lives in the structure manager.

use crate::{AttributeId, LibraryId, NodeId, RecordId, Timestamp, TreeId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// ELEMENTS & NODES
// ============================================================================

/// Reference to an external record. Identity is the `(id, library)` pair;
/// the record itself is not owned by any tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Element {
    /// Record identifier within its library.
    pub id: RecordId,
    /// Library the record belongs to.
    pub library: LibraryId,
}

impl Element {
    /// Create an element reference.
    pub fn new(id: impl Into<RecordId>, library: impl Into<LibraryId>) -> Self {
        Self {
            id: id.into(),
            library: library.into(),
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.library, self.id)
    }
}

/// A position within a tree, distinct from the element it references.
///
/// The same element may occupy several nodes of one tree only when its
/// library enables multiple positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Opaque node identifier, unique across trees.
    pub id: NodeId,
    /// The referenced element.
    pub element: Element,
    /// Parent node; `None` means the node is a root.
    pub parent: Option<NodeId>,
    /// Sibling order position (0-based).
    pub order: i64,
}

/// One level of a nested subtree view.
///
/// Canonical node state stays flat in storage; this shape exists only as
/// query output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeNode {
    /// Node identifier.
    pub id: NodeId,
    /// The referenced element.
    pub element: Element,
    /// Total child count, when requested (computed by the store on demand).
    pub child_count: Option<u64>,
    /// Nested children, bounded by the query depth.
    pub children: Vec<SubtreeNode>,
}

/// Page window for child listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of entries to return.
    pub limit: usize,
    /// Number of entries to skip.
    pub offset: usize,
}

impl Pagination {
    /// Create a page window.
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

// ============================================================================
// TREE DEFINITION
// ============================================================================

/// Behavior flavor of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TreeBehavior {
    /// No structural constraint beyond the per-library placement rules.
    #[default]
    Standard,
    /// Parent elements must be directory-typed (file-tree semantics).
    FilesRestricted,
}

/// Which libraries may appear as children of a given library's nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AllowedChildren {
    /// Any declared library is allowed.
    #[default]
    Any,
    /// Only the listed libraries are allowed.
    Only(BTreeSet<LibraryId>),
}

impl AllowedChildren {
    /// Build the restricted variant from a list of library ids.
    pub fn only<I, L>(libraries: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LibraryId>,
    {
        Self::Only(libraries.into_iter().map(Into::into).collect())
    }

    /// Whether `library` is allowed as a child.
    pub fn allows(&self, library: &LibraryId) -> bool {
        match self {
            AllowedChildren::Any => true,
            AllowedChildren::Only(set) => set.contains(library),
        }
    }
}

/// Per-library placement settings within one tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LibrarySettings {
    /// Whether elements of this library may be placed at the tree root.
    pub allowed_at_root: bool,
    /// Which libraries may appear under this library's nodes.
    pub allowed_children: AllowedChildren,
    /// Whether one element may occupy several positions in the same tree.
    pub allow_multiple_positions: bool,
    /// Whether this library's records count as directories in
    /// files-restricted trees.
    pub directory_like: bool,
}

impl LibrarySettings {
    /// Settings with everything closed off; open up via the `with_*` methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow elements of this library at the tree root.
    pub fn with_root_allowed(mut self, allowed: bool) -> Self {
        self.allowed_at_root = allowed;
        self
    }

    /// Restrict or open the set of allowed child libraries.
    pub fn with_children(mut self, children: AllowedChildren) -> Self {
        self.allowed_children = children;
        self
    }

    /// Allow one element to occupy several positions.
    pub fn with_multiple_positions(mut self, allowed: bool) -> Self {
        self.allow_multiple_positions = allowed;
        self
    }

    /// Mark this library's records as directory-typed.
    pub fn with_directory_like(mut self, directory_like: bool) -> Self {
        self.directory_like = directory_like;
        self
    }
}

/// Link from an entity to one permission tree through the attribute that
/// positions the entity inside it. The attribute schema itself is an external
/// concern; the link carries the resolved tree id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTreeLink {
    /// Attribute whose value positions the entity in the tree.
    pub attribute: AttributeId,
    /// The permission tree walked for this link.
    pub tree: TreeId,
}

impl PermissionTreeLink {
    /// Create a link.
    pub fn new(attribute: impl Into<AttributeId>, tree: impl Into<TreeId>) -> Self {
        Self {
            attribute: attribute.into(),
            tree: tree.into(),
        }
    }
}

/// Permission-tree configuration for one entity: the trees to walk and the
/// relation used to combine their individual decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsConf {
    /// Permission trees to walk, in configuration order.
    pub links: Vec<PermissionTreeLink>,
    /// How the per-tree decisions are combined.
    pub relation: crate::permission::Relation,
}

impl PermissionsConf {
    /// Create a configuration.
    pub fn new(links: Vec<PermissionTreeLink>, relation: crate::permission::Relation) -> Self {
        Self { links, relation }
    }
}

/// Definition of one tree: identity, behavior, and per-library rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDefinition {
    /// Tree identifier.
    pub id: TreeId,
    /// Human-readable label.
    pub label: String,
    /// Behavior flavor.
    pub behavior: TreeBehavior,
    /// System trees cannot be deleted.
    pub system: bool,
    /// Placement settings per declared library.
    pub libraries: BTreeMap<LibraryId, LibrarySettings>,
    /// Permission-tree configuration per library, used for node permissions
    /// of this tree.
    pub permissions_conf: BTreeMap<LibraryId, PermissionsConf>,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last update timestamp.
    pub updated_at: Timestamp,
    /// Free-form metadata.
    pub metadata: Option<serde_json::Value>,
}

impl TreeDefinition {
    /// Create a definition with no declared libraries.
    pub fn new(id: impl Into<TreeId>, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            label: label.into(),
            behavior: TreeBehavior::Standard,
            system: false,
            libraries: BTreeMap::new(),
            permissions_conf: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            metadata: None,
        }
    }

    /// Set the behavior flavor.
    pub fn with_behavior(mut self, behavior: TreeBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Flag the tree as a system tree.
    pub fn with_system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    /// Declare a library with its placement settings.
    pub fn with_library(mut self, library: impl Into<LibraryId>, settings: LibrarySettings) -> Self {
        self.libraries.insert(library.into(), settings);
        self
    }

    /// Attach a permission-tree configuration for a library.
    pub fn with_permissions_conf(
        mut self,
        library: impl Into<LibraryId>,
        conf: PermissionsConf,
    ) -> Self {
        self.permissions_conf.insert(library.into(), conf);
        self
    }

    /// Placement settings for `library`, when declared.
    pub fn library_settings(&self, library: &LibraryId) -> Option<&LibrarySettings> {
        self.libraries.get(library)
    }

    /// Permission-tree configuration for `library`, when present.
    pub fn permissions_conf_for(&self, library: &LibraryId) -> Option<&PermissionsConf> {
        self.permissions_conf.get(library)
    }

    /// Whether `child` may be placed under a node of `parent` (or at the
    /// root when `parent` is `None`). Undeclared libraries are never allowed.
    pub fn allows_under(&self, parent: Option<&LibraryId>, child: &LibraryId) -> bool {
        let Some(child_settings) = self.libraries.get(child) else {
            return false;
        };
        match parent {
            None => child_settings.allowed_at_root,
            Some(parent_lib) => self
                .libraries
                .get(parent_lib)
                .is_some_and(|parent_settings| parent_settings.allowed_children.allows(child)),
        }
    }

    /// Whether this definition's permission configuration references `tree`.
    pub fn references_permission_tree(&self, tree: &TreeId) -> bool {
        self.permissions_conf
            .values()
            .any(|conf| conf.links.iter().any(|link| &link.tree == tree))
    }
}

// =============================================================================
// TESTS
// =============================================================================
