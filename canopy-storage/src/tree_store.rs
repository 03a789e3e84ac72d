//! Node topology storage: the `TreeStore` contract and its in-memory form.
//!
//! Canonical state is flat: a node arena plus a parent/children adjacency
//! index per tree. Sibling order is the index position inside a parent's
//! child list; insertion clamps the requested order into the sibling range
//! and later reads renumber sequentially from the list.

use async_trait::async_trait;
use canopy_core::{
    Element, EngineResult, NodeId, Pagination, StorageError, TreeDefinition, TreeId, TreeNode,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistent storage of tree definitions and node topology.
///
/// Structural correctness (acyclicity, placement rules) is enforced by the
/// structure manager before anything reaches this trait; implementations
/// only keep the adjacency consistent.
#[async_trait]
pub trait TreeStore: Send + Sync {
    // === Tree definitions ===

    /// Insert or replace a tree definition. Existing nodes are kept.
    async fn save_tree(&self, definition: &TreeDefinition) -> EngineResult<()>;

    /// Get a tree definition by id.
    async fn get_tree(&self, tree: &TreeId) -> EngineResult<Option<TreeDefinition>>;

    /// Delete a tree definition together with all of its nodes.
    async fn delete_tree(&self, tree: &TreeId) -> EngineResult<()>;

    /// List all tree definitions.
    async fn list_trees(&self) -> EngineResult<Vec<TreeDefinition>>;

    // === Nodes ===

    /// Create a node under `parent` (root when `None`) at the given sibling
    /// order. Returns the generated node id.
    async fn create_node(
        &self,
        tree: &TreeId,
        element: &Element,
        parent: Option<&NodeId>,
        order: i64,
    ) -> EngineResult<NodeId>;

    /// Reparent and reorder a node in one step.
    async fn move_node(
        &self,
        tree: &TreeId,
        node: &NodeId,
        new_parent: Option<&NodeId>,
        order: i64,
    ) -> EngineResult<()>;

    /// Delete a node. With `cascade` the whole subtree goes; without it the
    /// node's children are reattached to its parent in place, keeping their
    /// relative order.
    async fn delete_node(&self, tree: &TreeId, node: &NodeId, cascade: bool) -> EngineResult<()>;

    /// Get a node by id.
    async fn get_node(&self, tree: &TreeId, node: &NodeId) -> EngineResult<Option<TreeNode>>;

    /// List one level of children under `parent` (roots when `None`).
    async fn list_children(
        &self,
        tree: &TreeId,
        parent: Option<&NodeId>,
        pagination: Option<Pagination>,
    ) -> EngineResult<Vec<TreeNode>>;

    /// Number of direct children under `parent` (roots when `None`).
    async fn child_count(&self, tree: &TreeId, parent: Option<&NodeId>) -> EngineResult<u64>;

    /// All positions occupied by `element`, in id order (creation order for
    /// generated ids).
    async fn find_nodes_by_element(
        &self,
        tree: &TreeId,
        element: &Element,
    ) -> EngineResult<Vec<NodeId>>;

    /// Whether the node exists. `false` for unknown trees.
    async fn node_exists(&self, tree: &TreeId, node: &NodeId) -> EngineResult<bool>;

    /// Total number of nodes in the tree.
    async fn node_count(&self, tree: &TreeId) -> EngineResult<u64>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

#[derive(Debug, Clone)]
struct StoredNode {
    element: Element,
    parent: Option<NodeId>,
}

#[derive(Debug)]
struct TreeState {
    definition: TreeDefinition,
    nodes: HashMap<NodeId, StoredNode>,
    /// Ordered child lists keyed by parent; `None` keys the root level.
    children: HashMap<Option<NodeId>, Vec<NodeId>>,
}

impl TreeState {
    fn new(definition: TreeDefinition) -> Self {
        Self {
            definition,
            nodes: HashMap::new(),
            children: HashMap::new(),
        }
    }

    fn insert_child(&mut self, parent: Option<NodeId>, node: NodeId, order: i64) {
        let siblings = self.children.entry(parent).or_default();
        let index = order.clamp(0, siblings.len() as i64) as usize;
        siblings.insert(index, node);
    }

    fn detach_child(&mut self, parent: &Option<NodeId>, node: &NodeId) -> usize {
        let siblings = self.children.entry(parent.clone()).or_default();
        let index = siblings
            .iter()
            .position(|id| id == node)
            .unwrap_or(siblings.len());
        if index < siblings.len() {
            siblings.remove(index);
        }
        index
    }

    fn node_view(&self, id: &NodeId) -> Option<TreeNode> {
        let stored = self.nodes.get(id)?;
        let order = self
            .children
            .get(&stored.parent)
            .and_then(|siblings| siblings.iter().position(|n| n == id))
            .unwrap_or(0) as i64;
        Some(TreeNode {
            id: id.clone(),
            element: stored.element.clone(),
            parent: stored.parent.clone(),
            order,
        })
    }

    /// Node ids of the whole subtree rooted at `node`, including it.
    fn collect_subtree(&self, node: &NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = vec![node.clone()];
        while let Some(current) = stack.pop() {
            if let Some(kids) = self.children.get(&Some(current.clone())) {
                stack.extend(kids.iter().cloned());
            }
            result.push(current);
        }
        result
    }
}

/// In-memory tree store for tests and development.
#[derive(Default)]
pub struct InMemoryTreeStore {
    trees: RwLock<HashMap<TreeId, TreeState>>,
}

impl InMemoryTreeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn tree_not_found(tree: &TreeId) -> canopy_core::EngineError {
    StorageError::TreeNotFound { tree: tree.clone() }.into()
}

fn node_not_found(tree: &TreeId, node: &NodeId) -> canopy_core::EngineError {
    StorageError::NodeNotFound {
        tree: tree.clone(),
        node: node.clone(),
    }
    .into()
}

#[async_trait]
impl TreeStore for InMemoryTreeStore {
    async fn save_tree(&self, definition: &TreeDefinition) -> EngineResult<()> {
        let mut trees = self.trees.write().await;
        match trees.get_mut(&definition.id) {
            Some(state) => state.definition = definition.clone(),
            None => {
                trees.insert(definition.id.clone(), TreeState::new(definition.clone()));
            }
        }
        Ok(())
    }

    async fn get_tree(&self, tree: &TreeId) -> EngineResult<Option<TreeDefinition>> {
        let trees = self.trees.read().await;
        Ok(trees.get(tree).map(|state| state.definition.clone()))
    }

    async fn delete_tree(&self, tree: &TreeId) -> EngineResult<()> {
        let mut trees = self.trees.write().await;
        trees.remove(tree).ok_or_else(|| tree_not_found(tree))?;
        Ok(())
    }

    async fn list_trees(&self) -> EngineResult<Vec<TreeDefinition>> {
        let trees = self.trees.read().await;
        let mut definitions: Vec<TreeDefinition> =
            trees.values().map(|state| state.definition.clone()).collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn create_node(
        &self,
        tree: &TreeId,
        element: &Element,
        parent: Option<&NodeId>,
        order: i64,
    ) -> EngineResult<NodeId> {
        let mut trees = self.trees.write().await;
        let state = trees.get_mut(tree).ok_or_else(|| tree_not_found(tree))?;

        if let Some(parent_id) = parent {
            if !state.nodes.contains_key(parent_id) {
                return Err(node_not_found(tree, parent_id));
            }
        }

        let id = NodeId::generate();
        state.nodes.insert(
            id.clone(),
            StoredNode {
                element: element.clone(),
                parent: parent.cloned(),
            },
        );
        state.insert_child(parent.cloned(), id.clone(), order);
        Ok(id)
    }

    async fn move_node(
        &self,
        tree: &TreeId,
        node: &NodeId,
        new_parent: Option<&NodeId>,
        order: i64,
    ) -> EngineResult<()> {
        let mut trees = self.trees.write().await;
        let state = trees.get_mut(tree).ok_or_else(|| tree_not_found(tree))?;

        let old_parent = match state.nodes.get(node) {
            Some(stored) => stored.parent.clone(),
            None => return Err(node_not_found(tree, node)),
        };
        if let Some(parent_id) = new_parent {
            if !state.nodes.contains_key(parent_id) {
                return Err(node_not_found(tree, parent_id));
            }
        }

        state.detach_child(&old_parent, node);
        state.insert_child(new_parent.cloned(), node.clone(), order);
        if let Some(stored) = state.nodes.get_mut(node) {
            stored.parent = new_parent.cloned();
        }
        Ok(())
    }

    async fn delete_node(&self, tree: &TreeId, node: &NodeId, cascade: bool) -> EngineResult<()> {
        let mut trees = self.trees.write().await;
        let state = trees.get_mut(tree).ok_or_else(|| tree_not_found(tree))?;

        let parent = match state.nodes.get(node) {
            Some(stored) => stored.parent.clone(),
            None => return Err(node_not_found(tree, node)),
        };

        if cascade {
            for id in state.collect_subtree(node) {
                state.nodes.remove(&id);
                state.children.remove(&Some(id.clone()));
            }
            state.detach_child(&parent, node);
        } else {
            let index = state.detach_child(&parent, node);
            let orphans = state.children.remove(&Some(node.clone())).unwrap_or_default();
            for (offset, orphan) in orphans.iter().enumerate() {
                if let Some(stored) = state.nodes.get_mut(orphan) {
                    stored.parent = parent.clone();
                }
                let siblings = state.children.entry(parent.clone()).or_default();
                let at = (index + offset).min(siblings.len());
                siblings.insert(at, orphan.clone());
            }
            state.nodes.remove(node);
        }
        Ok(())
    }

    async fn get_node(&self, tree: &TreeId, node: &NodeId) -> EngineResult<Option<TreeNode>> {
        let trees = self.trees.read().await;
        let state = trees.get(tree).ok_or_else(|| tree_not_found(tree))?;
        Ok(state.node_view(node))
    }

    async fn list_children(
        &self,
        tree: &TreeId,
        parent: Option<&NodeId>,
        pagination: Option<Pagination>,
    ) -> EngineResult<Vec<TreeNode>> {
        let trees = self.trees.read().await;
        let state = trees.get(tree).ok_or_else(|| tree_not_found(tree))?;

        let ids = state
            .children
            .get(&parent.cloned())
            .cloned()
            .unwrap_or_default();
        let window: Box<dyn Iterator<Item = &NodeId> + '_> = match pagination {
            Some(page) => Box::new(ids.iter().skip(page.offset).take(page.limit)),
            None => Box::new(ids.iter()),
        };
        Ok(window.filter_map(|id| state.node_view(id)).collect())
    }

    async fn child_count(&self, tree: &TreeId, parent: Option<&NodeId>) -> EngineResult<u64> {
        let trees = self.trees.read().await;
        let state = trees.get(tree).ok_or_else(|| tree_not_found(tree))?;
        Ok(state
            .children
            .get(&parent.cloned())
            .map(|kids| kids.len() as u64)
            .unwrap_or(0))
    }

    async fn find_nodes_by_element(
        &self,
        tree: &TreeId,
        element: &Element,
    ) -> EngineResult<Vec<NodeId>> {
        let trees = self.trees.read().await;
        let state = trees.get(tree).ok_or_else(|| tree_not_found(tree))?;
        let mut ids: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(_, stored)| &stored.element == element)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn node_exists(&self, tree: &TreeId, node: &NodeId) -> EngineResult<bool> {
        let trees = self.trees.read().await;
        Ok(trees
            .get(tree)
            .is_some_and(|state| state.nodes.contains_key(node)))
    }

    async fn node_count(&self, tree: &TreeId) -> EngineResult<u64> {
        let trees = self.trees.read().await;
        let state = trees.get(tree).ok_or_else(|| tree_not_found(tree))?;
        Ok(state.nodes.len() as u64)
    }
}

// =============================================================================
// TESTS
// =============================================================================
