//! Per-kind permission dispatch with fallback chains.
//!
//! Every decision follows the same cascade: the exact explicit record first,
//! then the tree-derived value when the entity carries a permission-tree
//! configuration, then the fallback appropriate to the entity kind (a record
//! falls back to its library, a library to the application, a tree-library
//! to its tree), bottoming out at the system-wide default. All final
//! decisions flow through the decision cache; inherited-permission queries
//! bypass it.

use crate::cache::{DecisionKey, PermissionCache};
use crate::resolver::{DefaultPermissionSource, PermissionTreeResolver};
use async_trait::async_trait;
use canopy_core::{
    actions, AccessGate, ActionName, AttributeId, ConfigError, Element, EngineResult,
    ExplicitPermission, GroupId, InvalidationPattern, InvalidationSink, LibraryId, NodeId,
    PermissionKind, PermissionTarget, TreeId, UserId,
};
use canopy_storage::{GroupHierarchyResolver, PermissionStore, PermissionsConfSource, TreeStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

// ============================================================================
// ACTION REGISTRY
// ============================================================================

/// Registered action names per permission kind.
///
/// The registry is an owned value injected at construction; plugins extend
/// it through [`PermissionCascadeDomain::register_action`] rather than
/// through any shared global.
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    actions: HashMap<PermissionKind, BTreeSet<ActionName>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        let mut registry = Self {
            actions: HashMap::new(),
        };
        for kind in PermissionKind::ALL {
            registry.insert(kind, actions::ACCESS);
        }
        for action in [actions::CREATE, actions::EDIT, actions::DELETE] {
            registry.insert(PermissionKind::Record, action);
            registry.insert(PermissionKind::Library, action);
        }
        registry.insert(PermissionKind::RecordAttribute, actions::EDIT);
        registry.insert(PermissionKind::Attribute, actions::EDIT);
        registry.insert(PermissionKind::App, actions::ADMIN);
        for kind in [
            PermissionKind::Tree,
            PermissionKind::TreeNode,
            PermissionKind::TreeLibrary,
        ] {
            registry.insert(kind, actions::EDIT_CHILDREN);
            registry.insert(kind, actions::DETACH);
        }
        registry
    }
}

impl ActionRegistry {
    /// The default action sets.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, kind: PermissionKind, action: impl Into<ActionName>) {
        self.actions.entry(kind).or_default().insert(action.into());
    }

    /// Register an additional action for a kind.
    pub fn register(&mut self, kind: PermissionKind, action: impl Into<ActionName>) {
        self.insert(kind, action);
    }

    /// Whether `action` is registered for `kind`.
    pub fn is_registered(&self, kind: PermissionKind, action: &ActionName) -> bool {
        self.actions
            .get(&kind)
            .is_some_and(|set| set.contains(action))
    }

    /// All actions registered for `kind`, sorted.
    pub fn actions_for(&self, kind: PermissionKind) -> Vec<ActionName> {
        self.actions
            .get(&kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Configuration of the cascade domain.
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    /// System-wide decision when nothing more specific applies.
    pub default_permission: bool,
    /// Initial action registry.
    pub actions: ActionRegistry,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            default_permission: true,
            actions: ActionRegistry::default(),
        }
    }
}

impl CascadeConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the system-wide default decision.
    pub fn with_default_permission(mut self, default: bool) -> Self {
        self.default_permission = default;
        self
    }

    /// Register an additional action for a kind.
    pub fn with_action(mut self, kind: PermissionKind, action: impl Into<ActionName>) -> Self {
        self.actions.register(kind, action);
        self
    }
}

// ============================================================================
// CASCADE DOMAIN
// ============================================================================

/// Dispatches permission decisions by entity kind.
pub struct PermissionCascadeDomain {
    tree_store: Arc<dyn TreeStore>,
    permissions: Arc<dyn PermissionStore>,
    groups: Arc<dyn GroupHierarchyResolver>,
    confs: Arc<dyn PermissionsConfSource>,
    resolver: PermissionTreeResolver,
    cache: Arc<PermissionCache>,
    actions: RwLock<ActionRegistry>,
    default_permission: bool,
}

impl PermissionCascadeDomain {
    /// Create a domain over the given collaborators.
    pub fn new(
        tree_store: Arc<dyn TreeStore>,
        permissions: Arc<dyn PermissionStore>,
        groups: Arc<dyn GroupHierarchyResolver>,
        confs: Arc<dyn PermissionsConfSource>,
        cache: Arc<PermissionCache>,
        config: CascadeConfig,
    ) -> Self {
        Self {
            resolver: PermissionTreeResolver::new(
                Arc::clone(&tree_store),
                Arc::clone(&permissions),
            ),
            tree_store,
            permissions,
            groups,
            confs,
            cache,
            actions: RwLock::new(config.actions),
            default_permission: config.default_permission,
        }
    }

    /// The decision cache shared with this domain.
    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    /// Register an additional action name for a kind at runtime.
    pub fn register_action(&self, kind: PermissionKind, action: impl Into<ActionName>) {
        let mut registry = self
            .actions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.register(kind, action);
    }

    /// All actions registered for `kind`.
    pub fn actions_for(&self, kind: PermissionKind) -> Vec<ActionName> {
        self.actions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .actions_for(kind)
    }

    fn require_registered(&self, target: &PermissionTarget) -> EngineResult<()> {
        let registered = self
            .actions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_registered(target.kind, &target.action);
        if registered {
            Ok(())
        } else {
            Err(ConfigError::UnknownAction {
                kind: target.kind,
                action: target.action.clone(),
            }
            .into())
        }
    }

    /// Decide whether `user` may perform `target`'s action, through the
    /// decision cache.
    pub async fn is_allowed(&self, user: &UserId, target: &PermissionTarget) -> EngineResult<bool> {
        self.require_registered(target)?;
        let group = self.groups.user_group(user).await?;
        let key = DecisionKey {
            target: target.clone(),
            group: group.clone(),
        };

        let group_ref = &group;
        let outcome = self
            .cache
            .memoize(key, move || async move {
                let value = self.decide(target, group_ref, false).await?;
                Ok(Some(value))
            })
            .await?;
        let value = outcome.unwrap_or(self.default_permission);
        tracing::debug!(
            kind = %target.kind,
            apply_to = %target.apply_to,
            action = %target.action,
            user = %user,
            value,
            "permission decided"
        );
        Ok(value)
    }

    /// The decision that would apply to `target` if its own explicit record
    /// were absent: forces evaluation through the tree-based path. Never
    /// cached.
    pub async fn get_inherited_permission(
        &self,
        user: &UserId,
        target: &PermissionTarget,
    ) -> EngineResult<bool> {
        self.require_registered(target)?;
        let group = self.groups.user_group(user).await?;
        self.decide(target, &group, true).await
    }

    /// Persist an explicit record and drop every cached decision it could
    /// have affected.
    pub async fn save_permission(&self, record: &ExplicitPermission) -> EngineResult<()> {
        self.permissions.save(record).await?;
        let dropped = self
            .cache
            .invalidate(&InvalidationPattern::for_explicit(record))
            .await;
        tracing::debug!(
            kind = %record.kind,
            apply_to = %record.apply_to,
            action = %record.action,
            dropped,
            "explicit permission saved"
        );
        Ok(())
    }

    // ========================================================================
    // INVALIDATION FAN-OUT
    // ========================================================================

    /// Drop every cached decision a topology or configuration change under
    /// `tree` could have affected: entries scoped to the tree itself, entries
    /// of entities whose configuration references the tree, and entries of
    /// other trees whose node permissions resolve through it.
    pub async fn invalidate_tree(&self, tree: &TreeId) -> EngineResult<u64> {
        let mut dropped = self.cache.invalidate(&InvalidationPattern::for_tree(tree)).await;

        for library in self.confs.libraries_referencing(tree).await? {
            dropped += self.library_conf_changed(&library).await;
        }
        for attribute in self.confs.attributes_referencing(tree).await? {
            dropped += self.attribute_conf_changed(&attribute).await;
        }
        for definition in self.tree_store.list_trees().await? {
            if &definition.id != tree && definition.references_permission_tree(tree) {
                dropped += self
                    .cache
                    .invalidate(&InvalidationPattern::for_tree(&definition.id))
                    .await;
            }
        }
        Ok(dropped)
    }

    /// Drop record-side decisions after a library's configuration changed.
    pub async fn library_conf_changed(&self, library: &LibraryId) -> u64 {
        let record = InvalidationPattern::for_kind_scope(PermissionKind::Record, library.as_str());
        let record_attribute =
            InvalidationPattern::for_kind_scope(PermissionKind::RecordAttribute, library.as_str());
        self.cache.invalidate(&record).await + self.cache.invalidate(&record_attribute).await
    }

    /// Drop attribute-side decisions after an attribute's configuration
    /// changed.
    pub async fn attribute_conf_changed(&self, attribute: &AttributeId) -> u64 {
        let pattern = InvalidationPattern::for_kind_scope(
            PermissionKind::RecordAttribute,
            attribute.as_str(),
        );
        self.cache.invalidate(&pattern).await
    }

    // ========================================================================
    // KIND STRATEGIES
    // ========================================================================

    async fn decide(
        &self,
        target: &PermissionTarget,
        group: &GroupId,
        skip_direct: bool,
    ) -> EngineResult<bool> {
        let groups = self.groups.ancestor_groups(group).await?;
        match target.kind {
            PermissionKind::Record => {
                let (library, record) = split2(&target.apply_to)?;
                let element = Element::new(record, library);
                self.decide_record(&element, target, &groups, skip_direct).await
            }
            PermissionKind::RecordAttribute => {
                let (library, attribute, record) = split3(&target.apply_to)?;
                let element = Element::new(record, library);
                let attribute = AttributeId::from(attribute);
                self.decide_record_attribute(&element, &attribute, target, &groups, skip_direct)
                    .await
            }
            PermissionKind::Library => {
                let library = LibraryId::from(target.apply_to.as_str());
                if !skip_direct {
                    if let Some(value) = self
                        .first_explicit(PermissionKind::Library, library.as_str(), &groups, &target.action)
                        .await?
                    {
                        return Ok(value);
                    }
                }
                self.decide_app(&target.action, &groups).await
            }
            PermissionKind::Attribute => {
                if !skip_direct {
                    if let Some(value) = self
                        .first_explicit(
                            PermissionKind::Attribute,
                            &target.apply_to,
                            &groups,
                            &target.action,
                        )
                        .await?
                    {
                        return Ok(value);
                    }
                }
                self.decide_app(&target.action, &groups).await
            }
            PermissionKind::App => {
                if !skip_direct {
                    if let Some(value) = self
                        .first_explicit(PermissionKind::App, "app", &groups, &target.action)
                        .await?
                    {
                        return Ok(value);
                    }
                }
                Ok(self.default_permission)
            }
            PermissionKind::Tree => {
                let tree = TreeId::from(target.apply_to.as_str());
                if !skip_direct {
                    if let Some(value) = self
                        .first_explicit(PermissionKind::Tree, tree.as_str(), &groups, &target.action)
                        .await?
                    {
                        return Ok(value);
                    }
                }
                self.decide_app(&target.action, &groups).await
            }
            PermissionKind::TreeNode => {
                let Some(scope) = &target.tree_scope else {
                    return Err(ConfigError::InvalidValue {
                        field: "tree_scope".to_string(),
                        reason: "tree-node targets carry a position scope".to_string(),
                    }
                    .into());
                };
                self.decide_tree_node(&scope.tree, &scope.node, &target.action, &groups, skip_direct)
                    .await
            }
            PermissionKind::TreeLibrary => {
                let (tree, _library) = split2(&target.apply_to)?;
                let tree = TreeId::from(tree);
                if !skip_direct {
                    if let Some(value) = self
                        .first_explicit(
                            PermissionKind::TreeLibrary,
                            &target.apply_to,
                            &groups,
                            &target.action,
                        )
                        .await?
                    {
                        return Ok(value);
                    }
                }
                self.decide_tree(&tree, &target.action, &groups).await
            }
        }
    }

    async fn decide_record(
        &self,
        element: &Element,
        target: &PermissionTarget,
        groups: &[GroupId],
        skip_direct: bool,
    ) -> EngineResult<bool> {
        if !skip_direct {
            if let Some(value) = self
                .first_explicit(PermissionKind::Record, &target.apply_to, groups, &target.action)
                .await?
            {
                return Ok(value);
            }
        }
        match self.confs.library_conf(&element.library).await? {
            Some(conf) => {
                let fallback = LibraryFallback {
                    domain: self,
                    library: element.library.clone(),
                    action: target.action.clone(),
                    groups,
                };
                self.resolver
                    .resolve(
                        PermissionKind::Record,
                        element.library.as_str(),
                        element,
                        &target.action,
                        groups,
                        &conf,
                        &fallback,
                    )
                    .await
            }
            None => self.decide_library(&element.library, &target.action, groups).await,
        }
    }

    async fn decide_record_attribute(
        &self,
        element: &Element,
        attribute: &AttributeId,
        target: &PermissionTarget,
        groups: &[GroupId],
        skip_direct: bool,
    ) -> EngineResult<bool> {
        if !skip_direct {
            if let Some(value) = self
                .first_explicit(
                    PermissionKind::RecordAttribute,
                    &target.apply_to,
                    groups,
                    &target.action,
                )
                .await?
            {
                return Ok(value);
            }
        }
        match self.confs.attribute_conf(attribute).await? {
            Some(conf) => {
                let walk_scope = format!("{}/{}", element.library, attribute);
                let fallback = AttributeFallback {
                    domain: self,
                    attribute: attribute.clone(),
                    action: target.action.clone(),
                    groups,
                };
                self.resolver
                    .resolve(
                        PermissionKind::RecordAttribute,
                        &walk_scope,
                        element,
                        &target.action,
                        groups,
                        &conf,
                        &fallback,
                    )
                    .await
            }
            None => self.decide_attribute(attribute, &target.action, groups).await,
        }
    }

    async fn decide_tree_node(
        &self,
        tree: &TreeId,
        node: &NodeId,
        action: &ActionName,
        groups: &[GroupId],
        skip_direct: bool,
    ) -> EngineResult<bool> {
        // Node-local record, then ancestors within the node's own tree.
        if let Some(value) = self
            .resolver
            .node_inheritance(tree, node, action, groups, !skip_direct)
            .await?
        {
            return Ok(value);
        }

        // Element-position based resolution per the tree's own configuration.
        let definition = self.tree_store.get_tree(tree).await?;
        let stored = self.tree_store.get_node(tree, node).await?;
        if let (Some(definition), Some(stored)) = (definition, stored) {
            if let Some(conf) = definition.permissions_conf_for(&stored.element.library) {
                let fallback = TreeFallback {
                    domain: self,
                    tree: tree.clone(),
                    action: action.clone(),
                    groups,
                };
                return self
                    .resolver
                    .resolve(
                        PermissionKind::TreeNode,
                        tree.as_str(),
                        &stored.element,
                        action,
                        groups,
                        conf,
                        &fallback,
                    )
                    .await;
            }
        }
        self.decide_tree(tree, action, groups).await
    }

    // === Fallback chain helpers (explicit record, then the next level) ===

    async fn decide_library(
        &self,
        library: &LibraryId,
        action: &ActionName,
        groups: &[GroupId],
    ) -> EngineResult<bool> {
        if let Some(value) = self
            .first_explicit(PermissionKind::Library, library.as_str(), groups, action)
            .await?
        {
            return Ok(value);
        }
        self.decide_app(action, groups).await
    }

    async fn decide_attribute(
        &self,
        attribute: &AttributeId,
        action: &ActionName,
        groups: &[GroupId],
    ) -> EngineResult<bool> {
        if let Some(value) = self
            .first_explicit(PermissionKind::Attribute, attribute.as_str(), groups, action)
            .await?
        {
            return Ok(value);
        }
        self.decide_app(action, groups).await
    }

    async fn decide_tree(
        &self,
        tree: &TreeId,
        action: &ActionName,
        groups: &[GroupId],
    ) -> EngineResult<bool> {
        if let Some(value) = self
            .first_explicit(PermissionKind::Tree, tree.as_str(), groups, action)
            .await?
        {
            return Ok(value);
        }
        self.decide_app(action, groups).await
    }

    async fn decide_app(&self, action: &ActionName, groups: &[GroupId]) -> EngineResult<bool> {
        if let Some(value) = self
            .first_explicit(PermissionKind::App, "app", groups, action)
            .await?
        {
            return Ok(value);
        }
        Ok(self.default_permission)
    }

    /// Direct explicit lookup across the group ancestry, most specific
    /// group first.
    async fn first_explicit(
        &self,
        kind: PermissionKind,
        apply_to: &str,
        groups: &[GroupId],
        action: &ActionName,
    ) -> EngineResult<Option<bool>> {
        for group in groups {
            if let Some(value) = self
                .permissions
                .explicit(kind, apply_to, group, action, None)
                .await?
            {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

fn split2(apply_to: &str) -> EngineResult<(&str, &str)> {
    apply_to.split_once('/').ok_or_else(|| {
        ConfigError::InvalidValue {
            field: "apply_to".to_string(),
            reason: format!("expected a two-part composite id, got {apply_to}"),
        }
        .into()
    })
}

fn split3(apply_to: &str) -> EngineResult<(&str, &str, &str)> {
    let (first, rest) = split2(apply_to)?;
    let (second, third) = split2(rest)?;
    Ok((first, second, third))
}

// ============================================================================
// FALLBACK SOURCES
// ============================================================================

struct LibraryFallback<'a> {
    domain: &'a PermissionCascadeDomain,
    library: LibraryId,
    action: ActionName,
    groups: &'a [GroupId],
}

#[async_trait]
impl DefaultPermissionSource for LibraryFallback<'_> {
    async fn default_permission(&self) -> EngineResult<bool> {
        self.domain
            .decide_library(&self.library, &self.action, self.groups)
            .await
    }
}

struct AttributeFallback<'a> {
    domain: &'a PermissionCascadeDomain,
    attribute: AttributeId,
    action: ActionName,
    groups: &'a [GroupId],
}

#[async_trait]
impl DefaultPermissionSource for AttributeFallback<'_> {
    async fn default_permission(&self) -> EngineResult<bool> {
        self.domain
            .decide_attribute(&self.attribute, &self.action, self.groups)
            .await
    }
}

struct TreeFallback<'a> {
    domain: &'a PermissionCascadeDomain,
    tree: TreeId,
    action: ActionName,
    groups: &'a [GroupId],
}

#[async_trait]
impl DefaultPermissionSource for TreeFallback<'_> {
    async fn default_permission(&self) -> EngineResult<bool> {
        self.domain
            .decide_tree(&self.tree, &self.action, self.groups)
            .await
    }
}

// ============================================================================
// SEAM IMPLEMENTATIONS
// ============================================================================

#[async_trait]
impl AccessGate for PermissionCascadeDomain {
    async fn allowed(&self, user: &UserId, target: &PermissionTarget) -> EngineResult<bool> {
        self.is_allowed(user, target).await
    }
}

#[async_trait]
impl InvalidationSink for PermissionCascadeDomain {
    async fn tree_changed(&self, tree: &TreeId) -> EngineResult<u64> {
        self.invalidate_tree(tree).await
    }
}

// =============================================================================
// TESTS
// =============================================================================
