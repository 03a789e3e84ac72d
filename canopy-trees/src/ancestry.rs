//! Pure ancestry and subtree traversal.
//!
//! The resolver never caches and never mutates; calling it twice without an
//! intervening mutation returns identical sequences. Higher layers (the
//! permission cache) memoize on top of it.

use canopy_core::{
    Element, EngineResult, NodeId, Pagination, StorageError, SubtreeNode, TreeId, TreeNode,
};
use canopy_storage::TreeStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Read-only traversal over one tree store.
#[derive(Clone)]
pub struct AncestryResolver {
    store: Arc<dyn TreeStore>,
}

impl AncestryResolver {
    /// Create a resolver over the given store.
    pub fn new(store: Arc<dyn TreeStore>) -> Self {
        Self { store }
    }

    /// Root-to-node path of `(node, element)` pairs, the node itself last.
    ///
    /// Cost is proportional to the node's depth. A parent chain longer than
    /// the tree's node count can only mean a corrupted topology and is
    /// reported as such instead of walking forever.
    pub async fn ancestors(
        &self,
        tree: &TreeId,
        node: &NodeId,
    ) -> EngineResult<Vec<(NodeId, Element)>> {
        let limit = self.store.node_count(tree).await?;
        let mut chain: Vec<(NodeId, Element)> = Vec::new();
        let mut current = Some(node.clone());

        while let Some(id) = current {
            let stored = match self.store.get_node(tree, &id).await? {
                Some(n) => n,
                None if chain.is_empty() => {
                    return Err(StorageError::NodeNotFound {
                        tree: tree.clone(),
                        node: id,
                    }
                    .into());
                }
                None => {
                    return Err(StorageError::CorruptTopology {
                        tree: tree.clone(),
                        reason: format!("dangling parent pointer to {id}"),
                    }
                    .into());
                }
            };
            chain.push((id, stored.element));
            if chain.len() as u64 > limit {
                return Err(StorageError::CorruptTopology {
                    tree: tree.clone(),
                    reason: "parent chain exceeds node count".to_string(),
                }
                .into());
            }
            current = stored.parent;
        }

        chain.reverse();
        Ok(chain)
    }

    /// One level of children under `parent` (roots when `None`), paginated.
    pub async fn children(
        &self,
        tree: &TreeId,
        parent: Option<&NodeId>,
        pagination: Option<Pagination>,
    ) -> EngineResult<Vec<TreeNode>> {
        self.store.list_children(tree, parent, pagination).await
    }

    /// Nested view of the forest under `from` (the whole tree when `None`),
    /// bounded by `depth` levels (unbounded when `None`). Child counts, when
    /// requested, come from the store rather than from counting materialized
    /// children, so they are exact even at the depth boundary.
    pub async fn subtree(
        &self,
        tree: &TreeId,
        from: Option<&NodeId>,
        depth: Option<u32>,
        with_child_counts: bool,
    ) -> EngineResult<Vec<SubtreeNode>> {
        if let Some(start) = from {
            if !self.store.node_exists(tree, start).await? {
                return Err(StorageError::NodeNotFound {
                    tree: tree.clone(),
                    node: start.clone(),
                }
                .into());
            }
        }
        self.build_level(tree, from.cloned(), depth, with_child_counts)
            .await
    }

    /// Recursion shapes the nested output only; canonical state stays flat
    /// in the store.
    fn build_level<'a>(
        &'a self,
        tree: &'a TreeId,
        parent: Option<NodeId>,
        depth: Option<u32>,
        with_child_counts: bool,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Vec<SubtreeNode>>> + Send + 'a>> {
        Box::pin(async move {
            if depth == Some(0) {
                return Ok(Vec::new());
            }
            let next_depth = depth.map(|d| d - 1);
            let level = self.store.list_children(tree, parent.as_ref(), None).await?;

            let mut nodes = Vec::with_capacity(level.len());
            for child in level {
                let children = self
                    .build_level(tree, Some(child.id.clone()), next_depth, with_child_counts)
                    .await?;
                let child_count = if with_child_counts {
                    Some(self.store.child_count(tree, Some(&child.id)).await?)
                } else {
                    None
                };
                nodes.push(SubtreeNode {
                    id: child.id,
                    element: child.element,
                    child_count,
                    children,
                });
            }
            Ok(nodes)
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
