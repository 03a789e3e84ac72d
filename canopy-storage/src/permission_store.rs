//! Explicit permission record storage.

use async_trait::async_trait;
use canopy_core::{ActionName, EngineResult, ExplicitPermission, GroupId, NodeId, PermissionKind};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persisted explicit permission records: a boolean or absent value keyed by
/// `(kind, apply_to, group, action[, node])`.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Look up an explicit value. `None` means no record exists, which is a
    /// defined outcome (undefined), not an error.
    async fn explicit(
        &self,
        kind: PermissionKind,
        apply_to: &str,
        group: &GroupId,
        action: &ActionName,
        node: Option<&NodeId>,
    ) -> EngineResult<Option<bool>>;

    /// Insert or replace an explicit record.
    async fn save(&self, record: &ExplicitPermission) -> EngineResult<()>;

    /// Remove an explicit record. Returns whether one existed.
    async fn remove(
        &self,
        kind: PermissionKind,
        apply_to: &str,
        group: &GroupId,
        action: &ActionName,
        node: Option<&NodeId>,
    ) -> EngineResult<bool>;
}

type RecordKey = (PermissionKind, String, GroupId, ActionName, Option<NodeId>);

/// In-memory permission store for tests and development.
#[derive(Default)]
pub struct InMemoryPermissionStore {
    records: RwLock<HashMap<RecordKey, bool>>,
}

impl InMemoryPermissionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn key_of(
    kind: PermissionKind,
    apply_to: &str,
    group: &GroupId,
    action: &ActionName,
    node: Option<&NodeId>,
) -> RecordKey {
    (
        kind,
        apply_to.to_string(),
        group.clone(),
        action.clone(),
        node.cloned(),
    )
}

#[async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn explicit(
        &self,
        kind: PermissionKind,
        apply_to: &str,
        group: &GroupId,
        action: &ActionName,
        node: Option<&NodeId>,
    ) -> EngineResult<Option<bool>> {
        let records = self.records.read().await;
        Ok(records.get(&key_of(kind, apply_to, group, action, node)).copied())
    }

    async fn save(&self, record: &ExplicitPermission) -> EngineResult<()> {
        let mut records = self.records.write().await;
        records.insert(
            key_of(
                record.kind,
                &record.apply_to,
                &record.group,
                &record.action,
                record.node.as_ref(),
            ),
            record.allowed,
        );
        Ok(())
    }

    async fn remove(
        &self,
        kind: PermissionKind,
        apply_to: &str,
        group: &GroupId,
        action: &ActionName,
        node: Option<&NodeId>,
    ) -> EngineResult<bool> {
        let mut records = self.records.write().await;
        Ok(records
            .remove(&key_of(kind, apply_to, group, action, node))
            .is_some())
    }
}
