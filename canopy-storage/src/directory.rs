//! Record existence and user-group hierarchy lookups.
//!
//! Both concerns live outside the engine (record storage and identity are
//! separate systems); the traits here are the seams the engine consumes.

use async_trait::async_trait;
use canopy_core::{Element, EngineResult, GroupId, UserId};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Existence checks for the external records that elements reference.
#[async_trait]
pub trait RecordExistenceChecker: Send + Sync {
    /// Whether the element's underlying record exists.
    async fn exists(&self, element: &Element) -> EngineResult<bool>;
}

/// In-memory record registry for tests and development.
///
/// In permissive mode every record exists; otherwise only registered ones do.
#[derive(Default)]
pub struct InMemoryRecordChecker {
    known: RwLock<HashSet<Element>>,
    permissive: bool,
}

impl InMemoryRecordChecker {
    /// Checker that only knows explicitly registered records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checker for which every record exists.
    pub fn permissive() -> Self {
        Self {
            known: RwLock::new(HashSet::new()),
            permissive: true,
        }
    }

    /// Register a record as existing.
    pub async fn register(&self, element: Element) {
        self.known.write().await.insert(element);
    }

    /// Forget a record.
    pub async fn unregister(&self, element: &Element) {
        self.known.write().await.remove(element);
    }
}

#[async_trait]
impl RecordExistenceChecker for InMemoryRecordChecker {
    async fn exists(&self, element: &Element) -> EngineResult<bool> {
        if self.permissive {
            return Ok(true);
        }
        Ok(self.known.read().await.contains(element))
    }
}

/// User-group membership and group ancestry resolution.
#[async_trait]
pub trait GroupHierarchyResolver: Send + Sync {
    /// The group the user belongs to.
    async fn user_group(&self, user: &UserId) -> EngineResult<GroupId>;

    /// The group's ancestry, most specific first (the group itself leads).
    async fn ancestor_groups(&self, group: &GroupId) -> EngineResult<Vec<GroupId>>;
}

/// In-memory group hierarchy for tests and development.
///
/// Users without an assignment fall back to the configured default group.
pub struct InMemoryGroupHierarchy {
    parents: RwLock<HashMap<GroupId, GroupId>>,
    users: RwLock<HashMap<UserId, GroupId>>,
    default_group: GroupId,
}

impl InMemoryGroupHierarchy {
    /// Create a hierarchy with the given default group.
    pub fn new(default_group: impl Into<GroupId>) -> Self {
        Self {
            parents: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            default_group: default_group.into(),
        }
    }

    /// Declare `parent` as the parent of `child`.
    pub async fn set_parent(&self, child: impl Into<GroupId>, parent: impl Into<GroupId>) {
        self.parents.write().await.insert(child.into(), parent.into());
    }

    /// Assign a user to a group.
    pub async fn assign_user(&self, user: impl Into<UserId>, group: impl Into<GroupId>) {
        self.users.write().await.insert(user.into(), group.into());
    }
}

impl Default for InMemoryGroupHierarchy {
    fn default() -> Self {
        Self::new("everyone")
    }
}

#[async_trait]
impl GroupHierarchyResolver for InMemoryGroupHierarchy {
    async fn user_group(&self, user: &UserId) -> EngineResult<GroupId> {
        let users = self.users.read().await;
        Ok(users.get(user).cloned().unwrap_or_else(|| self.default_group.clone()))
    }

    async fn ancestor_groups(&self, group: &GroupId) -> EngineResult<Vec<GroupId>> {
        let parents = self.parents.read().await;
        let mut chain = vec![group.clone()];
        let mut seen: HashSet<GroupId> = chain.iter().cloned().collect();
        let mut current = group.clone();
        // A parent cycle would be a configuration fault; stop at the repeat.
        while let Some(parent) = parents.get(&current) {
            if !seen.insert(parent.clone()) {
                break;
            }
            chain.push(parent.clone());
            current = parent.clone();
        }
        Ok(chain)
    }
}
