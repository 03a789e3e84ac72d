//! Permission-tree configuration lookup.
//!
//! Which permission trees position a library's records or an attribute's
//! values is schema-management territory, which lives outside this engine.
//! The trait here exposes exactly what the resolver and the invalidation
//! fan-out need: the configuration per entity, and the reverse question of
//! which entities reference a given tree.

use async_trait::async_trait;
use canopy_core::{AttributeId, EngineResult, LibraryId, PermissionsConf, TreeId};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Source of permission-tree configurations for libraries and attributes.
#[async_trait]
pub trait PermissionsConfSource: Send + Sync {
    /// Configuration governing records of `library`, when any.
    async fn library_conf(&self, library: &LibraryId) -> EngineResult<Option<PermissionsConf>>;

    /// Configuration governing values of `attribute`, when any.
    async fn attribute_conf(
        &self,
        attribute: &AttributeId,
    ) -> EngineResult<Option<PermissionsConf>>;

    /// Libraries whose configuration references `tree`.
    async fn libraries_referencing(&self, tree: &TreeId) -> EngineResult<Vec<LibraryId>>;

    /// Attributes whose configuration references `tree`.
    async fn attributes_referencing(&self, tree: &TreeId) -> EngineResult<Vec<AttributeId>>;
}

/// In-memory configuration source for tests and development.
#[derive(Default)]
pub struct InMemoryConfSource {
    library_confs: RwLock<HashMap<LibraryId, PermissionsConf>>,
    attribute_confs: RwLock<HashMap<AttributeId, PermissionsConf>>,
}

impl InMemoryConfSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a configuration to a library.
    pub async fn set_library_conf(&self, library: impl Into<LibraryId>, conf: PermissionsConf) {
        self.library_confs.write().await.insert(library.into(), conf);
    }

    /// Detach a library's configuration.
    pub async fn clear_library_conf(&self, library: &LibraryId) {
        self.library_confs.write().await.remove(library);
    }

    /// Attach a configuration to an attribute.
    pub async fn set_attribute_conf(
        &self,
        attribute: impl Into<AttributeId>,
        conf: PermissionsConf,
    ) {
        self.attribute_confs
            .write()
            .await
            .insert(attribute.into(), conf);
    }

    /// Detach an attribute's configuration.
    pub async fn clear_attribute_conf(&self, attribute: &AttributeId) {
        self.attribute_confs.write().await.remove(attribute);
    }
}

fn references(conf: &PermissionsConf, tree: &TreeId) -> bool {
    conf.links.iter().any(|link| &link.tree == tree)
}

#[async_trait]
impl PermissionsConfSource for InMemoryConfSource {
    async fn library_conf(&self, library: &LibraryId) -> EngineResult<Option<PermissionsConf>> {
        Ok(self.library_confs.read().await.get(library).cloned())
    }

    async fn attribute_conf(
        &self,
        attribute: &AttributeId,
    ) -> EngineResult<Option<PermissionsConf>> {
        Ok(self.attribute_confs.read().await.get(attribute).cloned())
    }

    async fn libraries_referencing(&self, tree: &TreeId) -> EngineResult<Vec<LibraryId>> {
        let confs = self.library_confs.read().await;
        let mut libraries: Vec<LibraryId> = confs
            .iter()
            .filter(|(_, conf)| references(conf, tree))
            .map(|(library, _)| library.clone())
            .collect();
        libraries.sort();
        Ok(libraries)
    }

    async fn attributes_referencing(&self, tree: &TreeId) -> EngineResult<Vec<AttributeId>> {
        let confs = self.attribute_confs.read().await;
        let mut attributes: Vec<AttributeId> = confs
            .iter()
            .filter(|(_, conf)| references(conf, tree))
            .map(|(attribute, _)| attribute.clone())
            .collect();
        attributes.sort();
        Ok(attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{PermissionTreeLink, Relation};

    fn zones_conf() -> PermissionsConf {
        PermissionsConf::new(
            vec![PermissionTreeLink::new("access_zone", "zones")],
            Relation::And,
        )
    }

    #[tokio::test]
    async fn test_library_conf_roundtrip() {
        let source = InMemoryConfSource::new();
        assert!(source
            .library_conf(&LibraryId::from("shoes"))
            .await
            .unwrap()
            .is_none());

        source.set_library_conf("shoes", zones_conf()).await;
        let conf = source
            .library_conf(&LibraryId::from("shoes"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conf.links.len(), 1);
    }

    #[tokio::test]
    async fn test_reverse_lookup() {
        let source = InMemoryConfSource::new();
        source.set_library_conf("shoes", zones_conf()).await;
        source.set_attribute_conf("price", zones_conf()).await;

        let zones = TreeId::from("zones");
        assert_eq!(
            source.libraries_referencing(&zones).await.unwrap(),
            vec![LibraryId::from("shoes")]
        );
        assert_eq!(
            source.attributes_referencing(&zones).await.unwrap(),
            vec![AttributeId::from("price")]
        );
        assert!(source
            .libraries_referencing(&TreeId::from("other"))
            .await
            .unwrap()
            .is_empty());
    }
}
