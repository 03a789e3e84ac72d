//! End-to-end topology scenarios against the in-memory store.

use canopy_core::{
    AllowedChildren, Element, EngineError, LibrarySettings, NodeId, TreeDefinition, TreeId, UserId,
    ValidationCode,
};
use canopy_storage::{InMemoryRecordChecker, InMemoryTreeStore, TreeStore};
use canopy_trees::TreeStructureManager;
use std::sync::Arc;

fn single_position_tree() -> TreeDefinition {
    TreeDefinition::new("categories", "Categories").with_library(
        "shoes",
        LibrarySettings::new()
            .with_root_allowed(true)
            .with_children(AllowedChildren::only(["shoes"])),
    )
}

async fn manager_with(definition: &TreeDefinition) -> TreeStructureManager {
    let store = Arc::new(InMemoryTreeStore::new());
    store.save_tree(definition).await.unwrap();
    TreeStructureManager::new(store, Arc::new(InMemoryRecordChecker::permissive()))
}

fn assert_validation(err: EngineError, code: ValidationCode) {
    match err {
        EngineError::Validation(v) => assert!(
            v.contains(code),
            "expected {code:?} among {:?}",
            v.failures
        ),
        other => panic!("expected validation error, got {other:?}"),
    }
}

/// Scenario A: a second position of the same element is rejected when the
/// library disallows multiple positions.
#[tokio::test]
async fn second_add_of_same_element_is_rejected() {
    let manager = manager_with(&single_position_tree()).await;
    let tree = TreeId::from("categories");
    let element = Element::new("A", "shoes");

    let n1 = manager.add_element(&tree, &element, None, 0).await.unwrap();
    assert!(manager.get_node(&tree, &n1).await.unwrap().is_some());

    let err = manager.add_element(&tree, &element, None, 1).await.unwrap_err();
    assert_validation(err, ValidationCode::ElementAlreadyPresent);
}

/// Scenario B: moving a node under its own descendant is rejected.
#[tokio::test]
async fn move_into_own_subtree_is_rejected() {
    let manager = manager_with(&single_position_tree()).await;
    let tree = TreeId::from("categories");
    let user = UserId::from("u1");

    let n1 = manager
        .add_element(&tree, &Element::new("A", "shoes"), None, 0)
        .await
        .unwrap();
    let n2 = manager
        .add_element(&tree, &Element::new("B", "shoes"), Some(&n1), 0)
        .await
        .unwrap();

    let err = manager
        .move_element(&tree, &n1, Some(&n2), 0, &user)
        .await
        .unwrap_err();
    assert_validation(err, ValidationCode::ElementAlreadyPresentInAncestors);
}

/// Non-cascading delete reattaches children to the deleted node's parent.
#[tokio::test]
async fn delete_without_cascade_reattaches_to_grandparent() {
    let manager = manager_with(&single_position_tree()).await;
    let tree = TreeId::from("categories");
    let user = UserId::from("u1");

    let top = manager
        .add_element(&tree, &Element::new("top", "shoes"), None, 0)
        .await
        .unwrap();
    let middle = manager
        .add_element(&tree, &Element::new("middle", "shoes"), Some(&top), 0)
        .await
        .unwrap();
    let leaf = manager
        .add_element(&tree, &Element::new("leaf", "shoes"), Some(&middle), 0)
        .await
        .unwrap();

    manager.delete_element(&tree, &middle, false, &user).await.unwrap();

    let reattached = manager.get_node(&tree, &leaf).await.unwrap().unwrap();
    assert_eq!(reattached.parent, Some(top));
    assert!(manager.get_node(&tree, &middle).await.unwrap().is_none());
}

/// Cascading delete takes the whole subtree with it.
#[tokio::test]
async fn delete_with_cascade_removes_descendants() {
    let manager = manager_with(&single_position_tree()).await;
    let tree = TreeId::from("categories");
    let user = UserId::from("u1");

    let top = manager
        .add_element(&tree, &Element::new("top", "shoes"), None, 0)
        .await
        .unwrap();
    let leaf = manager
        .add_element(&tree, &Element::new("leaf", "shoes"), Some(&top), 0)
        .await
        .unwrap();

    manager.delete_element(&tree, &top, true, &user).await.unwrap();

    assert!(manager.get_node(&tree, &top).await.unwrap().is_none());
    assert!(manager.get_node(&tree, &leaf).await.unwrap().is_none());
}

/// Sibling order after a move is the requested position, clamped and
/// renumbered sequentially.
#[tokio::test]
async fn move_reorders_siblings() {
    let manager = manager_with(&single_position_tree()).await;
    let tree = TreeId::from("categories");
    let user = UserId::from("u1");

    let a = manager
        .add_element(&tree, &Element::new("A", "shoes"), None, 0)
        .await
        .unwrap();
    let b = manager
        .add_element(&tree, &Element::new("B", "shoes"), None, 1)
        .await
        .unwrap();
    let c = manager
        .add_element(&tree, &Element::new("C", "shoes"), None, 2)
        .await
        .unwrap();

    manager.move_element(&tree, &c, None, 0, &user).await.unwrap();

    let order_of = |node: NodeId| {
        let manager = &manager;
        let tree = &tree;
        async move { manager.get_node(tree, &node).await.unwrap().unwrap().order }
    };
    assert_eq!(order_of(c).await, 0);
    assert_eq!(order_of(a).await, 1);
    assert_eq!(order_of(b).await, 2);
}

// =============================================================================
// PROPERTY-BASED TESTS
// =============================================================================

mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Add { element: usize, parent: Option<usize>, order: i64 },
        Move { node: usize, parent: Option<usize>, order: i64 },
        Delete { node: usize, cascade: bool },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6, proptest::option::of(0usize..8), 0i64..4)
                .prop_map(|(element, parent, order)| Op::Add { element, parent, order }),
            (0usize..8, proptest::option::of(0usize..8), 0i64..4)
                .prop_map(|(node, parent, order)| Op::Move { node, parent, order }),
            (0usize..8, proptest::bool::ANY)
                .prop_map(|(node, cascade)| Op::Delete { node, cascade }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// For any reachable sequence of add/move/delete operations on a
        /// single-position tree, no node's ancestor chain ever contains that
        /// node's own element.
        #[test]
        fn prop_acyclicity_under_arbitrary_mutations(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let store = Arc::new(InMemoryTreeStore::new());
                store.save_tree(&single_position_tree()).await.unwrap();
                let manager = TreeStructureManager::new(
                    Arc::clone(&store) as Arc<dyn TreeStore>,
                    Arc::new(InMemoryRecordChecker::permissive()),
                );
                let tree = TreeId::from("categories");
                let user = UserId::from("u1");
                let mut nodes: Vec<NodeId> = Vec::new();

                for op in ops {
                    match op {
                        Op::Add { element, parent, order } => {
                            let element = Element::new(format!("E{element}"), "shoes");
                            let parent = parent
                                .filter(|_| !nodes.is_empty())
                                .map(|i| nodes[i % nodes.len()].clone());
                            if let Ok(node) = manager
                                .add_element(&tree, &element, parent.as_ref(), order)
                                .await
                            {
                                nodes.push(node);
                            }
                        }
                        Op::Move { node, parent, order } => {
                            if nodes.is_empty() {
                                continue;
                            }
                            let node = nodes[node % nodes.len()].clone();
                            let parent = parent
                                .filter(|_| !nodes.is_empty())
                                .map(|i| nodes[i % nodes.len()].clone());
                            let _ = manager
                                .move_element(&tree, &node, parent.as_ref(), order, &user)
                                .await;
                        }
                        Op::Delete { node, cascade } => {
                            if nodes.is_empty() {
                                continue;
                            }
                            let node = nodes[node % nodes.len()].clone();
                            let _ = manager.delete_element(&tree, &node, cascade, &user).await;
                        }
                    }
                }

                // Every surviving node's proper ancestors exclude its element.
                let ancestry = manager.ancestry();
                for node in &nodes {
                    let Some(view) = manager.get_node(&tree, node).await.unwrap() else {
                        continue;
                    };
                    let chain = ancestry.ancestors(&tree, node).await.unwrap();
                    let proper = &chain[..chain.len() - 1];
                    assert!(
                        proper.iter().all(|(_, element)| element != &view.element),
                        "cycle: element {:?} appears among ancestors of its own node",
                        view.element
                    );
                }
            });
        }
    }
}
