//! Tree-walk resolution of permission decisions.
//!
//! For one target, every configured permission tree is walked independently:
//! nearest tree-ancestor first, most specific user group first, first
//! explicit record wins. The per-tree decisions are then combined under the
//! entity's AND/OR relation, and an undefined combination falls through to
//! the caller-supplied default source, so the resolver never returns
//! undefined to its caller.

use async_trait::async_trait;
use canopy_core::{
    ActionName, Element, EngineResult, GroupId, NodeId, PermissionKind, PermissionsConf, TreeId,
};
use canopy_storage::{PermissionStore, TreeStore};
use canopy_trees::AncestryResolver;
use std::sync::Arc;

/// Fallback consulted when every configured tree leaves the decision
/// undefined. Typically the owning entity's own decision (a record falls
/// back to its library), ultimately the system-wide default.
#[async_trait]
pub trait DefaultPermissionSource: Send + Sync {
    /// The decision that applies in the absence of any tree-derived value.
    async fn default_permission(&self) -> EngineResult<bool>;
}

/// Constant default source.
pub struct StaticDefault(pub bool);

#[async_trait]
impl DefaultPermissionSource for StaticDefault {
    async fn default_permission(&self) -> EngineResult<bool> {
        Ok(self.0)
    }
}

/// Walks permission trees and combines their decisions.
pub struct PermissionTreeResolver {
    tree_store: Arc<dyn TreeStore>,
    permissions: Arc<dyn PermissionStore>,
    ancestry: AncestryResolver,
}

impl PermissionTreeResolver {
    /// Create a resolver over the given stores.
    pub fn new(tree_store: Arc<dyn TreeStore>, permissions: Arc<dyn PermissionStore>) -> Self {
        Self {
            ancestry: AncestryResolver::new(Arc::clone(&tree_store)),
            tree_store,
            permissions,
        }
    }

    /// Decide `action` for `subject` under the entity's configuration.
    ///
    /// `walk_scope` is the class-level apply-to identifier under which
    /// tree-scoped grants are stored (a record's library, an attribute's
    /// `library/attribute` pair). `groups` is the actor's group ancestry,
    /// most specific first.
    pub async fn resolve(
        &self,
        kind: PermissionKind,
        walk_scope: &str,
        subject: &Element,
        action: &ActionName,
        groups: &[GroupId],
        conf: &PermissionsConf,
        default_source: &dyn DefaultPermissionSource,
    ) -> EngineResult<bool> {
        let mut decisions = Vec::with_capacity(conf.links.len());
        for link in &conf.links {
            decisions.push(
                self.resolve_link(kind, walk_scope, subject, action, groups, &link.tree)
                    .await?,
            );
        }
        match conf.relation.combine(decisions) {
            Some(value) => Ok(value),
            None => default_source.default_permission().await,
        }
    }

    /// Decision of one configured tree, undefined when the subject has no
    /// position there or no explicit record exists along any walked path.
    ///
    /// Across several positions of one subject, a granting walk wins over a
    /// denying one, and denials win over undefined.
    async fn resolve_link(
        &self,
        kind: PermissionKind,
        walk_scope: &str,
        subject: &Element,
        action: &ActionName,
        groups: &[GroupId],
        tree: &TreeId,
    ) -> EngineResult<Option<bool>> {
        // An unknown tree or a failed position lookup is a defined skip,
        // never an error.
        let positions = match self.tree_store.find_nodes_by_element(tree, subject).await {
            Ok(positions) => positions,
            Err(err) => {
                tracing::warn!(
                    tree = %tree,
                    element = %subject,
                    error = %err,
                    "position lookup failed, link skipped"
                );
                return Ok(None);
            }
        };

        let mut denied = false;
        for node in &positions {
            match self
                .walk_position(kind, walk_scope, action, groups, tree, node)
                .await?
            {
                Some(true) => return Ok(Some(true)),
                Some(false) => denied = true,
                None => {}
            }
        }
        Ok(if denied { Some(false) } else { None })
    }

    /// Walk one position up to the root: nearest ancestor first, and at each
    /// level the most specific group first. The first explicit value wins.
    async fn walk_position(
        &self,
        kind: PermissionKind,
        walk_scope: &str,
        action: &ActionName,
        groups: &[GroupId],
        tree: &TreeId,
        node: &NodeId,
    ) -> EngineResult<Option<bool>> {
        let chain = self.ancestry.ancestors(tree, node).await?;
        for (level, _) in chain.iter().rev() {
            for group in groups {
                if let Some(value) = self
                    .permissions
                    .explicit(kind, walk_scope, group, action, Some(level))
                    .await?
                {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// Node-local inheritance within a node's own tree: the node itself
    /// (unless skipped), then its ancestors, nearest first.
    pub async fn node_inheritance(
        &self,
        tree: &TreeId,
        node: &NodeId,
        action: &ActionName,
        groups: &[GroupId],
        include_self: bool,
    ) -> EngineResult<Option<bool>> {
        let chain = self.ancestry.ancestors(tree, node).await?;
        let skip = usize::from(!include_self);
        for (level, _) in chain.iter().rev().skip(skip) {
            for group in groups {
                if let Some(value) = self
                    .permissions
                    .explicit(
                        PermissionKind::TreeNode,
                        tree.as_str(),
                        group,
                        action,
                        Some(level),
                    )
                    .await?
                {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{
        actions, ExplicitPermission, LibrarySettings, PermissionTreeLink, Relation,
        TreeDefinition,
    };
    use canopy_storage::{InMemoryPermissionStore, InMemoryTreeStore};

    struct Setup {
        tree_store: Arc<InMemoryTreeStore>,
        permissions: Arc<InMemoryPermissionStore>,
        resolver: PermissionTreeResolver,
        tree: TreeId,
        root: NodeId,
        mid: NodeId,
        leaf: NodeId,
    }

    /// zones tree: root -> mid -> leaf, subject element placed at leaf.
    async fn setup() -> Setup {
        let tree_store = Arc::new(InMemoryTreeStore::new());
        let permissions = Arc::new(InMemoryPermissionStore::new());

        let definition = TreeDefinition::new("zones", "Zones")
            .with_library("zones", LibrarySettings::new().with_root_allowed(true))
            .with_library("products", LibrarySettings::new());
        tree_store.save_tree(&definition).await.unwrap();

        let tree = definition.id.clone();
        let root = tree_store
            .create_node(&tree, &Element::new("z-root", "zones"), None, 0)
            .await
            .unwrap();
        let mid = tree_store
            .create_node(&tree, &Element::new("z-mid", "zones"), Some(&root), 0)
            .await
            .unwrap();
        let leaf = tree_store
            .create_node(&tree, &Element::new("P", "products"), Some(&mid), 0)
            .await
            .unwrap();

        let resolver = PermissionTreeResolver::new(
            Arc::clone(&tree_store) as Arc<dyn TreeStore>,
            Arc::clone(&permissions) as Arc<dyn PermissionStore>,
        );
        Setup {
            tree_store,
            permissions,
            resolver,
            tree,
            root,
            mid,
            leaf,
        }
    }

    fn conf_over(trees: &[&TreeId], relation: Relation) -> PermissionsConf {
        PermissionsConf::new(
            trees
                .iter()
                .enumerate()
                .map(|(i, tree)| PermissionTreeLink::new(format!("link{i}"), (*tree).clone()))
                .collect(),
            relation,
        )
    }

    fn groups(names: &[&str]) -> Vec<GroupId> {
        names.iter().map(|n| GroupId::from(*n)).collect()
    }

    async fn grant(
        permissions: &InMemoryPermissionStore,
        group: &str,
        node: &NodeId,
        allowed: bool,
    ) {
        permissions
            .save(&ExplicitPermission::new(
                PermissionKind::Record,
                "products",
                group,
                actions::ACCESS,
                Some(node.clone()),
                allowed,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nearest_ancestor_wins() {
        let s = setup().await;
        grant(&s.permissions, "editors", &s.root, false).await;
        grant(&s.permissions, "editors", &s.mid, true).await;

        let value = s
            .resolver
            .resolve(
                PermissionKind::Record,
                "products",
                &Element::new("P", "products"),
                &ActionName::from(actions::ACCESS),
                &groups(&["editors"]),
                &conf_over(&[&s.tree], Relation::And),
                &StaticDefault(false),
            )
            .await
            .unwrap();
        // mid is nearer to the leaf than root; its value wins.
        assert!(value);
        let _ = s.leaf;
    }

    #[tokio::test]
    async fn test_most_specific_group_wins() {
        let s = setup().await;
        grant(&s.permissions, "everyone", &s.mid, false).await;
        grant(&s.permissions, "editors", &s.mid, true).await;

        let value = s
            .resolver
            .resolve(
                PermissionKind::Record,
                "products",
                &Element::new("P", "products"),
                &ActionName::from(actions::ACCESS),
                &groups(&["editors", "everyone"]),
                &conf_over(&[&s.tree], Relation::And),
                &StaticDefault(false),
            )
            .await
            .unwrap();
        assert!(value);
    }

    #[tokio::test]
    async fn test_group_priority_beats_level_distance_only_within_level() {
        let s = setup().await;
        // Specific group denied at mid, broad group granted at root.
        grant(&s.permissions, "editors", &s.mid, false).await;
        grant(&s.permissions, "everyone", &s.root, true).await;

        let value = s
            .resolver
            .resolve(
                PermissionKind::Record,
                "products",
                &Element::new("P", "products"),
                &ActionName::from(actions::ACCESS),
                &groups(&["editors", "everyone"]),
                &conf_over(&[&s.tree], Relation::And),
                &StaticDefault(true),
            )
            .await
            .unwrap();
        // The nearer level settles first regardless of the broader grant above.
        assert!(!value);
    }

    #[tokio::test]
    async fn test_missing_position_is_skipped_under_and() {
        let s = setup().await;
        grant(&s.permissions, "editors", &s.root, true).await;

        // Second tree in which the subject was never placed.
        let empty = TreeDefinition::new("regions", "Regions")
            .with_library("products", LibrarySettings::new().with_root_allowed(true));
        s.tree_store.save_tree(&empty).await.unwrap();

        let value = s
            .resolver
            .resolve(
                PermissionKind::Record,
                "products",
                &Element::new("P", "products"),
                &ActionName::from(actions::ACCESS),
                &groups(&["editors"]),
                &conf_over(&[&s.tree, &empty.id], Relation::And),
                &StaticDefault(false),
            )
            .await
            .unwrap();
        // regions contributes undefined, which AND ignores.
        assert!(value);
    }

    #[tokio::test]
    async fn test_unknown_tree_is_skipped_not_an_error() {
        let s = setup().await;
        grant(&s.permissions, "editors", &s.root, true).await;

        let missing = TreeId::from("never-created");
        let value = s
            .resolver
            .resolve(
                PermissionKind::Record,
                "products",
                &Element::new("P", "products"),
                &ActionName::from(actions::ACCESS),
                &groups(&["editors"]),
                &conf_over(&[&s.tree, &missing], Relation::And),
                &StaticDefault(false),
            )
            .await
            .unwrap();
        assert!(value);
    }

    #[tokio::test]
    async fn test_all_undefined_falls_back_to_default() {
        let s = setup().await;

        for default in [true, false] {
            let value = s
                .resolver
                .resolve(
                    PermissionKind::Record,
                    "products",
                    &Element::new("P", "products"),
                    &ActionName::from(actions::ACCESS),
                    &groups(&["editors"]),
                    &conf_over(&[&s.tree], Relation::And),
                    &StaticDefault(default),
                )
                .await
                .unwrap();
            assert_eq!(value, default);
        }
    }

    #[tokio::test]
    async fn test_or_relation_any_grant_wins() {
        let s = setup().await;
        grant(&s.permissions, "editors", &s.root, false).await;

        // Second tree granting access at its root.
        let second = TreeDefinition::new("regions", "Regions")
            .with_library("products", LibrarySettings::new().with_root_allowed(true));
        s.tree_store.save_tree(&second).await.unwrap();
        let region_root = s
            .tree_store
            .create_node(&second.id, &Element::new("P", "products"), None, 0)
            .await
            .unwrap();
        s.permissions
            .save(&ExplicitPermission::new(
                PermissionKind::Record,
                "products",
                "editors",
                actions::ACCESS,
                Some(region_root),
                true,
            ))
            .await
            .unwrap();

        let or_value = s
            .resolver
            .resolve(
                PermissionKind::Record,
                "products",
                &Element::new("P", "products"),
                &ActionName::from(actions::ACCESS),
                &groups(&["editors"]),
                &conf_over(&[&s.tree, &second.id], Relation::Or),
                &StaticDefault(false),
            )
            .await
            .unwrap();
        assert!(or_value);

        let and_value = s
            .resolver
            .resolve(
                PermissionKind::Record,
                "products",
                &Element::new("P", "products"),
                &ActionName::from(actions::ACCESS),
                &groups(&["editors"]),
                &conf_over(&[&s.tree, &second.id], Relation::And),
                &StaticDefault(true),
            )
            .await
            .unwrap();
        assert!(!and_value);
    }

    #[tokio::test]
    async fn test_node_inheritance_skips_self_when_asked() {
        let s = setup().await;
        let action = ActionName::from(actions::ACCESS);
        let editors = groups(&["editors"]);

        s.permissions
            .save(&ExplicitPermission::new(
                PermissionKind::TreeNode,
                s.tree.as_str(),
                "editors",
                actions::ACCESS,
                Some(s.mid.clone()),
                false,
            ))
            .await
            .unwrap();
        s.permissions
            .save(&ExplicitPermission::new(
                PermissionKind::TreeNode,
                s.tree.as_str(),
                "editors",
                actions::ACCESS,
                Some(s.root.clone()),
                true,
            ))
            .await
            .unwrap();

        let with_self = s
            .resolver
            .node_inheritance(&s.tree, &s.mid, &action, &editors, true)
            .await
            .unwrap();
        assert_eq!(with_self, Some(false));

        let inherited = s
            .resolver
            .node_inheritance(&s.tree, &s.mid, &action, &editors, false)
            .await
            .unwrap();
        assert_eq!(inherited, Some(true));
    }
}
