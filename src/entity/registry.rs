//! Entity registry for managing the live hierarchy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entity::{Entity, EntityType, MetricSpec, RegistryError};

/// Identifier of a registered entity, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to an active sample collection attached to a registered metric.
///
/// The registry stops attached collections when their metric is unregistered.
#[async_trait::async_trait]
pub trait CollectionControl: Send + Sync + 'static {
    /// Cancel future ticks and discard buffered samples.
    async fn stop(&self);
}

/// An entity inserted into a registry.
///
/// Handles are cheap to clone and compare equal only to handles of the same
/// registration in the same registry.
#[derive(Clone)]
pub struct RegisteredEntity {
    id: EntityId,
    registry_id: Uuid,
    entity: Arc<Entity>,
}

impl RegisteredEntity {
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Identifier of the registry that issued this handle.
    pub fn registry_id(&self) -> Uuid {
        self.registry_id
    }

    pub fn name(&self) -> &str {
        self.entity.name()
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity.entity_type()
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn metric_spec(&self) -> Option<&MetricSpec> {
        self.entity.metric_spec()
    }
}

impl PartialEq for RegisteredEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.registry_id == other.registry_id
    }
}

impl Eq for RegisteredEntity {}

impl fmt::Debug for RegisteredEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredEntity")
            .field("id", &self.id)
            .field("name", &self.entity.name())
            .field("type", &self.entity.entity_type())
            .finish_non_exhaustive()
    }
}

/// One step of a root-to-leaf walk through the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageEntry {
    pub entity_type: EntityType,
    pub name: String,
}

struct Node {
    handle: RegisteredEntity,
    // Non-owning link: the parent may be removed, which detaches this node too.
    parent: Option<EntityId>,
    children: Vec<EntityId>,
    collection: Option<Arc<dyn CollectionControl>>,
}

#[derive(Default)]
struct Hierarchy {
    nodes: HashMap<EntityId, Node>,
    names: HashMap<(EntityType, String), EntityId>,
}

impl Hierarchy {
    fn is_ancestor(&self, candidate: EntityId, of: EntityId) -> bool {
        let mut cursor = self.nodes.get(&of).and_then(|n| n.parent);
        while let Some(id) = cursor {
            if id == candidate {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn lineage(&self, id: EntityId) -> Vec<LineageEntry> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            let Some(node) = self.nodes.get(&id) else {
                break;
            };
            chain.push(LineageEntry {
                entity_type: node.handle.entity_type(),
                name: node.handle.name().to_string(),
            });
            cursor = node.parent;
        }
        chain.reverse();
        chain
    }

    /// Pre-order walk of the subtree rooted at `root`.
    fn subtree(&self, root: EntityId) -> Vec<EntityId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                order.push(id);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }
}

/// Registry owning the hierarchy of registered entities.
///
/// The registry is the sole mutator of parent/child structure. All
/// operations take a single registry-wide lock, shared with every sampling
/// task that reads the hierarchy during a flush.
pub struct EntityRegistry {
    id: Uuid,
    next_id: AtomicU64,
    hierarchy: RwLock<Hierarchy>,
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            next_id: AtomicU64::new(1),
            hierarchy: RwLock::new(Hierarchy::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("id", &self.id)
            .field(
                "entity_count",
                &self.hierarchy.try_read().map(|h| h.nodes.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl EntityRegistry {
    /// Register an entity with no parent.
    ///
    /// # Errors
    /// - `RegistryError::InvalidEntity` if the name is empty
    /// - `RegistryError::DuplicateName` if an entity with the same name and
    ///   type is already registered
    pub async fn register(&self, entity: Entity) -> Result<RegisteredEntity, RegistryError> {
        if entity.name().trim().is_empty() {
            return Err(RegistryError::InvalidEntity(
                "entity name must not be empty".to_string(),
            ));
        }

        let key = (entity.entity_type(), entity.name().to_string());
        let mut hierarchy = self.hierarchy.write().await;
        if hierarchy.names.contains_key(&key) {
            return Err(RegistryError::DuplicateName {
                entity_type: key.0,
                name: key.1,
            });
        }

        let handle = RegisteredEntity {
            id: EntityId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            registry_id: self.id,
            entity: Arc::new(entity),
        };
        hierarchy.names.insert(key, handle.id);
        hierarchy.nodes.insert(
            handle.id,
            Node {
                handle: handle.clone(),
                parent: None,
                children: Vec::new(),
                collection: None,
            },
        );

        tracing::info!(
            entity = %handle.name(),
            entity_type = %handle.entity_type(),
            id = %handle.id,
            "Entity registered"
        );
        Ok(handle)
    }

    /// Attach `child` under `parent`.
    ///
    /// Calling this twice with the same arguments is a no-op.
    ///
    /// # Errors
    /// Returns `RegistryError::InvalidRelationship` when either entity is not
    /// registered here, `parent` is a metric, `parent == child`, `child`
    /// already has a different parent, or the link would create a cycle.
    pub async fn create_relationship(
        &self,
        parent: &RegisteredEntity,
        child: &RegisteredEntity,
    ) -> Result<(), RegistryError> {
        let mut hierarchy = self.hierarchy.write().await;

        for (role, entity) in [("parent", parent), ("child", child)] {
            if !self.owns(&hierarchy, entity) {
                return Err(RegistryError::InvalidRelationship(format!(
                    "{} '{}' is not registered in this registry",
                    role,
                    entity.name()
                )));
            }
        }
        if parent == child {
            return Err(RegistryError::InvalidRelationship(format!(
                "'{}' cannot be its own parent",
                parent.name()
            )));
        }
        if !parent.entity_type().can_be_parent() {
            return Err(RegistryError::InvalidRelationship(format!(
                "metric '{}' cannot have children",
                parent.name()
            )));
        }

        match hierarchy.nodes.get(&child.id).and_then(|n| n.parent) {
            Some(existing) if existing == parent.id => return Ok(()),
            Some(existing) => {
                let existing_name = hierarchy
                    .nodes
                    .get(&existing)
                    .map(|n| n.handle.name().to_string())
                    .unwrap_or_default();
                return Err(RegistryError::InvalidRelationship(format!(
                    "'{}' already has parent '{}'",
                    child.name(),
                    existing_name
                )));
            }
            None => {}
        }
        if hierarchy.is_ancestor(child.id, parent.id) {
            return Err(RegistryError::InvalidRelationship(format!(
                "'{}' is an ancestor of '{}'",
                child.name(),
                parent.name()
            )));
        }

        if let Some(node) = hierarchy.nodes.get_mut(&child.id) {
            node.parent = Some(parent.id);
        }
        if let Some(node) = hierarchy.nodes.get_mut(&parent.id) {
            node.children.push(child.id);
        }

        tracing::info!(parent = %parent.name(), child = %child.name(), "Relationship created");
        Ok(())
    }

    /// Remove an entity and all of its descendants.
    ///
    /// Collections attached to removed metrics are stopped after the
    /// registry lock is released. Returns the removed handles, root first.
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` if the entity is not registered.
    pub async fn unregister(
        &self,
        entity: &RegisteredEntity,
    ) -> Result<Vec<RegisteredEntity>, RegistryError> {
        let (removed, collections) = {
            let mut hierarchy = self.hierarchy.write().await;
            if !self.owns(&hierarchy, entity) {
                return Err(RegistryError::NotFound(entity.name().to_string()));
            }

            let parent_id = hierarchy.nodes.get(&entity.id).and_then(|n| n.parent);
            if let Some(parent) = parent_id.and_then(|id| hierarchy.nodes.get_mut(&id)) {
                parent.children.retain(|id| *id != entity.id);
            }

            let mut removed = Vec::new();
            let mut collections = Vec::new();
            for id in hierarchy.subtree(entity.id) {
                if let Some(node) = hierarchy.nodes.remove(&id) {
                    hierarchy.names.remove(&(
                        node.handle.entity_type(),
                        node.handle.name().to_string(),
                    ));
                    if let Some(collection) = node.collection {
                        collections.push(collection);
                    }
                    removed.push(node.handle);
                }
            }
            (removed, collections)
        };

        for collection in collections {
            collection.stop().await;
        }

        tracing::info!(
            entity = %entity.name(),
            removed = removed.len(),
            "Entity unregistered"
        );
        Ok(removed)
    }

    /// Names from the root ancestor down to `entity`, inclusive.
    ///
    /// # Errors
    /// Returns `RegistryError::InvalidEntity` unless `entity` is a metric or
    /// device registered here with at least one ancestor.
    pub async fn get_entity_hierarchy(
        &self,
        entity: &RegisteredEntity,
    ) -> Result<Vec<String>, RegistryError> {
        if entity.entity_type() == EntityType::EdgeSystem {
            return Err(RegistryError::InvalidEntity(format!(
                "hierarchy lookup requires a metric or device, got edge system '{}'",
                entity.name()
            )));
        }

        let hierarchy = self.hierarchy.read().await;
        if !self.owns(&hierarchy, entity) {
            return Err(RegistryError::InvalidEntity(format!(
                "'{}' is not registered in this registry",
                entity.name()
            )));
        }
        let lineage = hierarchy.lineage(entity.id);
        if lineage.len() < 2 {
            return Err(RegistryError::InvalidEntity(format!(
                "'{}' has no ancestors",
                entity.name()
            )));
        }
        Ok(lineage.into_iter().map(|e| e.name).collect())
    }

    /// Root-to-leaf lineage of any registered entity.
    pub async fn lineage(
        &self,
        entity: &RegisteredEntity,
    ) -> Result<Vec<LineageEntry>, RegistryError> {
        let hierarchy = self.hierarchy.read().await;
        if !self.owns(&hierarchy, entity) {
            return Err(RegistryError::NotFound(entity.name().to_string()));
        }
        Ok(hierarchy.lineage(entity.id))
    }

    pub async fn parent(&self, entity: &RegisteredEntity) -> Option<RegisteredEntity> {
        let hierarchy = self.hierarchy.read().await;
        if !self.owns(&hierarchy, entity) {
            return None;
        }
        let parent_id = hierarchy.nodes.get(&entity.id)?.parent?;
        hierarchy.nodes.get(&parent_id).map(|n| n.handle.clone())
    }

    /// Children in relationship-creation order.
    pub async fn children(
        &self,
        entity: &RegisteredEntity,
    ) -> Result<Vec<RegisteredEntity>, RegistryError> {
        let hierarchy = self.hierarchy.read().await;
        if !self.owns(&hierarchy, entity) {
            return Err(RegistryError::NotFound(entity.name().to_string()));
        }
        let node = hierarchy
            .nodes
            .get(&entity.id)
            .ok_or_else(|| RegistryError::NotFound(entity.name().to_string()))?;
        Ok(node
            .children
            .iter()
            .filter_map(|id| hierarchy.nodes.get(id).map(|n| n.handle.clone()))
            .collect())
    }

    /// Look up a registered entity by type and name.
    pub async fn find(&self, entity_type: EntityType, name: &str) -> Option<RegisteredEntity> {
        let hierarchy = self.hierarchy.read().await;
        let id = hierarchy.names.get(&(entity_type, name.to_string()))?;
        hierarchy.nodes.get(id).map(|n| n.handle.clone())
    }

    pub async fn contains(&self, entity: &RegisteredEntity) -> bool {
        self.owns(&*self.hierarchy.read().await, entity)
    }

    /// Number of registered entities.
    pub async fn len(&self) -> usize {
        self.hierarchy.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Attach a running collection to a registered metric.
    ///
    /// Returns the previously attached collection, if any; the caller is
    /// responsible for stopping it.
    pub async fn attach_collection(
        &self,
        metric: &RegisteredEntity,
        collection: Arc<dyn CollectionControl>,
    ) -> Result<Option<Arc<dyn CollectionControl>>, RegistryError> {
        if metric.entity_type() != EntityType::Metric {
            return Err(RegistryError::InvalidEntity(format!(
                "'{}' is not a metric",
                metric.name()
            )));
        }
        let mut hierarchy = self.hierarchy.write().await;
        if !self.owns(&hierarchy, metric) {
            return Err(RegistryError::NotFound(metric.name().to_string()));
        }
        let node = hierarchy
            .nodes
            .get_mut(&metric.id)
            .ok_or_else(|| RegistryError::NotFound(metric.name().to_string()))?;
        Ok(node.collection.replace(collection))
    }

    /// Detach `collection` from a metric without stopping it.
    ///
    /// Returns `false` when the metric is gone or another collection has
    /// been attached in the meantime; that one is left in place.
    pub async fn detach_collection(
        &self,
        metric: &RegisteredEntity,
        collection: &Arc<dyn CollectionControl>,
    ) -> bool {
        let mut hierarchy = self.hierarchy.write().await;
        if !self.owns(&hierarchy, metric) {
            return false;
        }
        let Some(node) = hierarchy.nodes.get_mut(&metric.id) else {
            return false;
        };
        if node
            .collection
            .as_ref()
            .is_some_and(|attached| Arc::ptr_eq(attached, collection))
        {
            node.collection = None;
            return true;
        }
        false
    }

    // --- Private helpers ---

    fn owns(&self, hierarchy: &Hierarchy, entity: &RegisteredEntity) -> bool {
        entity.registry_id == self.id && hierarchy.nodes.contains_key(&entity.id)
    }
}
