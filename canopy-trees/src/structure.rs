//! Topology mutation with invariant enforcement.
//!
//! Every structural mutation runs under the owning tree's mutation lock,
//! held across validate+commit so two concurrent mutations cannot both
//! validate against the same pre-mutation topology. Validation collects all
//! field failures instead of stopping at the first; permission gates
//! short-circuit. Cache invalidation is signalled before the commit call,
//! never after the mutating operation returns.

use crate::ancestry::AncestryResolver;
use canopy_core::{
    actions, AccessGate, ActionName, AllowAll, Element, EngineResult, InvalidationSink, NodeId,
    PermissionError, PermissionTarget, TreeBehavior, TreeDefinition, TreeId, TreeNode, UserId,
    ValidationCode, ValidationError,
};
use canopy_storage::{RecordExistenceChecker, TreeStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Validates and applies topology mutations for all trees.
pub struct TreeStructureManager {
    store: Arc<dyn TreeStore>,
    records: Arc<dyn RecordExistenceChecker>,
    ancestry: AncestryResolver,
    gate: Arc<dyn AccessGate>,
    invalidation: Option<Arc<dyn InvalidationSink>>,
    /// Per-tree mutation locks, created lazily.
    locks: StdMutex<HashMap<TreeId, Arc<Mutex<()>>>>,
}

impl TreeStructureManager {
    /// Create a manager with a permissive gate and no invalidation sink.
    pub fn new(store: Arc<dyn TreeStore>, records: Arc<dyn RecordExistenceChecker>) -> Self {
        Self {
            ancestry: AncestryResolver::new(Arc::clone(&store)),
            store,
            records,
            gate: Arc::new(AllowAll),
            invalidation: None,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Route move/delete permission checks through `gate`.
    pub fn with_gate(mut self, gate: Arc<dyn AccessGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Signal committed topology changes to `sink`.
    pub fn with_invalidation(mut self, sink: Arc<dyn InvalidationSink>) -> Self {
        self.invalidation = Some(sink);
        self
    }

    /// The traversal layer this manager validates against.
    pub fn ancestry(&self) -> &AncestryResolver {
        &self.ancestry
    }

    fn tree_lock(&self, tree: &TreeId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(tree.clone()).or_default())
    }

    async fn signal_tree_changed(&self, tree: &TreeId) -> EngineResult<()> {
        if let Some(sink) = &self.invalidation {
            let dropped = sink.tree_changed(tree).await?;
            tracing::debug!(tree = %tree, dropped, "invalidated permission cache for tree");
        }
        Ok(())
    }

    async fn require_tree(&self, tree: &TreeId) -> EngineResult<TreeDefinition> {
        self.store
            .get_tree(tree)
            .await?
            .ok_or_else(|| ValidationError::single("tree", ValidationCode::UnknownTree).into())
    }

    // ========================================================================
    // TREE DEFINITION ADMINISTRATION
    // ========================================================================

    /// Insert or update a tree definition. Cached decisions scoped to the
    /// tree are dropped when its permission configuration changed.
    pub async fn save_tree(&self, definition: &TreeDefinition) -> EngineResult<()> {
        let lock = self.tree_lock(&definition.id);
        let _guard = lock.lock().await;

        let previous = self.store.get_tree(&definition.id).await?;
        let mut definition = definition.clone();
        definition.updated_at = Utc::now();
        self.store.save_tree(&definition).await?;

        let conf_changed = previous
            .map(|p| p.permissions_conf != definition.permissions_conf)
            .unwrap_or(false);
        if conf_changed {
            self.signal_tree_changed(&definition.id).await?;
        }
        tracing::debug!(tree = %definition.id, "tree definition saved");
        Ok(())
    }

    /// Delete a tree definition with all of its nodes. System trees refuse
    /// deletion.
    pub async fn delete_tree(&self, tree: &TreeId) -> EngineResult<()> {
        let lock = self.tree_lock(tree);
        let _guard = lock.lock().await;

        let definition = self.require_tree(tree).await?;
        if definition.system {
            return Err(ValidationError::single("tree", ValidationCode::SystemTree).into());
        }
        self.signal_tree_changed(tree).await?;
        self.store.delete_tree(tree).await?;
        tracing::debug!(tree = %tree, "tree definition deleted");
        Ok(())
    }

    /// Get a tree definition by id.
    pub async fn get_tree(&self, tree: &TreeId) -> EngineResult<Option<TreeDefinition>> {
        self.store.get_tree(tree).await
    }

    /// List all tree definitions.
    pub async fn list_trees(&self) -> EngineResult<Vec<TreeDefinition>> {
        self.store.list_trees().await
    }

    // ========================================================================
    // NODE MUTATIONS
    // ========================================================================

    /// Add an element at a position. Validation collects every failing
    /// check; on success the new node handle is returned.
    pub async fn add_element(
        &self,
        tree: &TreeId,
        element: &Element,
        parent: Option<&NodeId>,
        order: i64,
    ) -> EngineResult<NodeId> {
        let lock = self.tree_lock(tree);
        let _guard = lock.lock().await;

        let definition = self.require_tree(tree).await?;
        let mut failures = ValidationError::new();

        if !self.records.exists(element).await? {
            failures.push("element", ValidationCode::UnknownRecord);
        }

        let settings = definition.library_settings(&element.library);
        if settings.is_none() {
            failures.push("element", ValidationCode::UnknownElement);
        }

        let parent_node = match parent {
            Some(id) => {
                let node = self.store.get_node(tree, id).await?;
                if node.is_none() {
                    failures.push("parent", ValidationCode::UnknownParent);
                }
                node
            }
            None => None,
        };

        if settings.is_some() {
            let placement_ok = match (parent, &parent_node) {
                (None, _) => definition.allows_under(None, &element.library),
                (Some(_), Some(parent_node)) => {
                    definition.allows_under(Some(&parent_node.element.library), &element.library)
                }
                // Unknown parent is already recorded; nothing left to check.
                (Some(_), None) => true,
            };
            if !placement_ok {
                failures.push("element", ValidationCode::LibraryForbiddenAsChild);
            }
        }

        if definition.behavior == TreeBehavior::FilesRestricted {
            if let Some(parent_node) = &parent_node {
                let directory = definition
                    .library_settings(&parent_node.element.library)
                    .map(|s| s.directory_like)
                    .unwrap_or(false);
                if !directory {
                    failures.push("parent", ValidationCode::LibraryForbiddenAsChild);
                }
            }
        }

        let multiple = settings.map(|s| s.allow_multiple_positions).unwrap_or(false);
        let existing = self.store.find_nodes_by_element(tree, element).await?;
        if !existing.is_empty() && !multiple {
            failures.push("element", ValidationCode::ElementAlreadyPresent);
        }
        if multiple {
            if let Some(parent_node) = &parent_node {
                let chain = self.ancestry.ancestors(tree, &parent_node.id).await?;
                if chain.iter().any(|(_, ancestor)| ancestor == element) {
                    failures.push("parent", ValidationCode::ElementAlreadyPresentInAncestors);
                }
            }
        }

        failures.check()?;

        self.signal_tree_changed(tree).await?;
        let node = self.store.create_node(tree, element, parent, order).await?;
        tracing::debug!(tree = %tree, node = %node, element = %element, "element added");
        Ok(node)
    }

    /// Reparent and reorder a node. Requires an `edit_children` decision on
    /// both the current and the destination parent (or the tree root for
    /// parentless positions).
    pub async fn move_element(
        &self,
        tree: &TreeId,
        node: &NodeId,
        parent_to: Option<&NodeId>,
        order: i64,
        user: &UserId,
    ) -> EngineResult<()> {
        let lock = self.tree_lock(tree);
        let _guard = lock.lock().await;

        let definition = self.require_tree(tree).await?;
        let mut failures = ValidationError::new();

        let moving = self.store.get_node(tree, node).await?;
        if moving.is_none() {
            failures.push("node", ValidationCode::UnknownNode);
        }

        let destination = match parent_to {
            Some(id) => {
                let dest = self.store.get_node(tree, id).await?;
                if dest.is_none() {
                    failures.push("parent", ValidationCode::UnknownParent);
                }
                dest
            }
            None => None,
        };

        if let Some(moving) = &moving {
            let placement_ok = match (parent_to, &destination) {
                (None, _) => definition.allows_under(None, &moving.element.library),
                (Some(_), Some(dest)) => {
                    definition.allows_under(Some(&dest.element.library), &moving.element.library)
                }
                (Some(_), None) => true,
            };
            if !placement_ok {
                failures.push("parent", ValidationCode::LibraryForbiddenAsChild);
            }

            if definition.behavior == TreeBehavior::FilesRestricted {
                if let Some(dest) = &destination {
                    let directory = definition
                        .library_settings(&dest.element.library)
                        .map(|s| s.directory_like)
                        .unwrap_or(false);
                    if !directory {
                        failures.push("parent", ValidationCode::LibraryForbiddenAsChild);
                    }
                }
            }

            // Moving into its own subtree would close a cycle: the element
            // must not appear in the destination's ancestor chain.
            if let Some(dest) = &destination {
                let chain = self.ancestry.ancestors(tree, &dest.id).await?;
                if chain.iter().any(|(_, ancestor)| ancestor == &moving.element) {
                    failures.push("parent", ValidationCode::ElementAlreadyPresentInAncestors);
                }
            }
        }

        failures.check()?;
        let Some(moving) = moving else {
            return Err(ValidationError::single("node", ValidationCode::UnknownNode).into());
        };

        self.require_edit_children(tree, user, moving.parent.as_ref()).await?;
        self.require_edit_children(tree, user, parent_to).await?;

        self.signal_tree_changed(tree).await?;
        self.store.move_node(tree, node, parent_to, order).await?;
        tracing::debug!(tree = %tree, node = %node, "element moved");
        Ok(())
    }

    /// Delete a node. With `delete_children` the whole subtree goes;
    /// otherwise children reattach to the deleted node's parent. Requires a
    /// `detach` decision on the node.
    pub async fn delete_element(
        &self,
        tree: &TreeId,
        node: &NodeId,
        delete_children: bool,
        user: &UserId,
    ) -> EngineResult<()> {
        let lock = self.tree_lock(tree);
        let _guard = lock.lock().await;

        self.require_tree(tree).await?;
        if !self.store.node_exists(tree, node).await? {
            return Err(ValidationError::single("node", ValidationCode::UnknownNode).into());
        }

        let target = PermissionTarget::tree_node(tree, node, actions::DETACH);
        if !self.gate.allowed(user, &target).await? {
            tracing::warn!(tree = %tree, node = %node, user = %user, "detach denied");
            return Err(PermissionError::Denied {
                action: ActionName::from(actions::DETACH),
                user: user.clone(),
            }
            .into());
        }

        self.signal_tree_changed(tree).await?;
        self.store.delete_node(tree, node, delete_children).await?;
        tracing::debug!(tree = %tree, node = %node, cascade = delete_children, "element deleted");
        Ok(())
    }

    async fn require_edit_children(
        &self,
        tree: &TreeId,
        user: &UserId,
        parent: Option<&NodeId>,
    ) -> EngineResult<()> {
        let target = match parent {
            Some(node) => PermissionTarget::tree_node(tree, node, actions::EDIT_CHILDREN),
            None => PermissionTarget::tree(tree, actions::EDIT_CHILDREN),
        };
        if self.gate.allowed(user, &target).await? {
            Ok(())
        } else {
            tracing::warn!(tree = %tree, user = %user, "edit_children denied");
            Err(PermissionError::Denied {
                action: ActionName::from(actions::EDIT_CHILDREN),
                user: user.clone(),
            }
            .into())
        }
    }

    /// Get a node by id, for callers that hold only the handle.
    pub async fn get_node(&self, tree: &TreeId, node: &NodeId) -> EngineResult<Option<TreeNode>> {
        self.store.get_node(tree, node).await
    }
}

// =============================================================================
// TESTS
// =============================================================================
