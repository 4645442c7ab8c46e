//! Entity Registry
//!
//! Tracks registered entities with their registry id, unique_id and
//! config entry, along with the user-facing flags (disabled, hidden).

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ha_core::valid_entity_id;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

/// Errors that can occur in the entity registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntityRegistryError {
    /// Entity was not found
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Neither a valid entity_id nor a known registry id
    #[error("Unknown entity registry entry {0}")]
    InvalidReference(String),

    /// Rename target is taken by another entry
    #[error("Entity ID already registered: {0}")]
    AlreadyExists(String),
}

/// Storage key for entity registry
pub const STORAGE_KEY: &str = "core.entity_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 19;

/// Reason an entity was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    ConfigEntry,
    Device,
    Hass,
    Integration,
    User,
}

/// Who hid an entity
///
/// Stored as `Option<HiddenBy>`: `None` means visible. Components only
/// clear a hide they set themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenBy {
    /// Hidden by an integration
    Integration,
    /// Hidden by the user
    User,
}

/// A registered entity entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Registry id, stable across entity_id renames
    pub id: String,
    /// Full entity ID (domain.object_id)
    pub entity_id: String,
    /// Platform-specific unique identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Integration that provides this entity
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Platform default name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_by: Option<HiddenBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    /// Create a new entity entry with a fresh registry id
    pub fn new(
        entity_id: impl Into<String>,
        platform: impl Into<String>,
        unique_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.into(),
            unique_id,
            platform: platform.into(),
            config_entry_id: None,
            device_id: None,
            name: None,
            original_name: None,
            disabled_by: None,
            hidden_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Get the domain from entity_id
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or(&self.entity_id)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden_by.is_some()
    }
}

/// Entity registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Entity Registry
///
/// The primary index maps entity_id to an `Arc<EntityEntry>`; updates swap
/// in a new `Arc` so readers never observe a half-applied change.
/// Secondary indexes map registry id, unique_id and config entry id back
/// to entity_ids.
pub struct EntityRegistry {
    storage: Arc<Storage>,

    /// entity_id -> entry, in insertion order
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// registry id -> entity_id
    by_id: DashMap<String, String>,

    /// unique_id -> entity_id
    by_unique_id: DashMap<String, String>,

    /// config_entry_id -> entity_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,

    /// Orders snapshot + write of concurrent saves
    save_lock: Mutex<()>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_id: DashMap::new(),
            by_unique_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(file) = self.storage.load::<EntityRegistryData>().await? {
            info!(
                "Loading {} entities from storage (v{}.{})",
                file.data.entities.len(),
                file.version,
                file.minor_version
            );
            for entry in file.data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save to storage
    pub async fn save(&self) -> StorageResult<()> {
        let _guard = self.save_lock.lock().await;
        let data = EntityRegistryData {
            entities: self.iter().iter().map(|e| (**e).clone()).collect(),
        };
        self.storage.save(&data).await?;
        debug!("Saved {} entities to storage", data.entities.len());
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        self.index_secondary(&entry);
        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entry.entity_id.clone(), entry);
        }
    }

    fn index_secondary(&self, entry: &EntityEntry) {
        self.by_id.insert(entry.id.clone(), entry.entity_id.clone());
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert(unique_id.clone(), entry.entity_id.clone());
        }
        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entry.entity_id.clone());
        }
    }

    /// Drop an entry from the secondary indexes
    fn unindex_secondary(&self, entry: &EntityEntry) {
        self.by_id.remove(&entry.id);
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id.remove(unique_id);
        }
        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.entity_id);
            }
        }
    }

    /// Get entity by entity_id
    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    /// Get entity by registry id
    pub fn get_by_id(&self, id: &str) -> Option<Arc<EntityEntry>> {
        let entity_id = self.by_id.get(id)?.value().clone();
        self.get(&entity_id)
    }

    pub fn get_by_unique_id(&self, unique_id: &str) -> Option<Arc<EntityEntry>> {
        let entity_id = self.by_unique_id.get(unique_id)?.value().clone();
        self.get(&entity_id)
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        let ids: Vec<String> = self
            .by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Resolve an entity reference to an entity_id
    ///
    /// A well-formed entity_id is returned unchanged, registered or not.
    /// Anything else is treated as a registry id and mapped to the entity_id
    /// it currently belongs to.
    pub fn validate_entity_id(&self, entity_id_or_id: &str) -> Result<String, EntityRegistryError> {
        if valid_entity_id(entity_id_or_id) {
            return Ok(entity_id_or_id.to_string());
        }
        self.get_by_id(entity_id_or_id)
            .map(|entry| entry.entity_id.clone())
            .ok_or_else(|| EntityRegistryError::InvalidReference(entity_id_or_id.to_string()))
    }

    /// Get or create an entity entry
    ///
    /// An existing entry with the same unique_id or entity_id is returned
    /// as is.
    pub fn get_or_create(
        &self,
        platform: &str,
        entity_id: &str,
        unique_id: Option<&str>,
        config_entry_id: Option<&str>,
    ) -> Arc<EntityEntry> {
        if let Some(existing) = unique_id.and_then(|uid| self.get_by_unique_id(uid)) {
            debug!("Found existing entity by unique_id: {}", existing.entity_id);
            return existing;
        }
        if let Some(existing) = self.get(entity_id) {
            return existing;
        }

        let mut entry = EntityEntry::new(entity_id, platform, unique_id.map(String::from));
        entry.config_entry_id = config_entry_id.map(String::from);

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        info!("Registered new entity: {}", entity_id);
        entry
    }

    /// Update an entity entry
    ///
    /// The closure edits a copy of the entry while the primary index is
    /// write-locked, so concurrent updates of the same entry apply in turn.
    /// When the closure changes nothing the stored entry is returned as is;
    /// otherwise the copy is stamped with a new `modified_at` and replaces
    /// the stored entry.
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let mut idx = self
            .by_entity_id
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let current = idx
            .get(entity_id)
            .cloned()
            .ok_or_else(|| EntityRegistryError::NotFound(entity_id.to_string()))?;

        let mut entry = (*current).clone();
        f(&mut entry);
        if entry == *current {
            return Ok(current);
        }
        entry.modified_at = Utc::now();

        if entry.entity_id != current.entity_id {
            if idx.contains_key(&entry.entity_id) {
                return Err(EntityRegistryError::AlreadyExists(entry.entity_id));
            }
            idx.shift_remove(&current.entity_id);
        }

        let entry = Arc::new(entry);
        self.unindex_secondary(&current);
        self.index_secondary(&entry);
        idx.insert(entry.entity_id.clone(), Arc::clone(&entry));
        drop(idx);

        debug!(entity_id = %entity_id, hidden_by = ?entry.hidden_by, "Updated entity");
        Ok(entry)
    }

    /// Remove an entity
    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let entry = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id))?;
        self.unindex_secondary(&entry);
        info!("Removed entity: {}", entity_id);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in registration order
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_registry() -> (TempDir, EntityRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        (temp_dir, EntityRegistry::new(storage))
    }

    #[test]
    fn test_get_or_create() {
        let (_dir, registry) = create_registry();

        let entry = registry.get_or_create("demo", "switch.kitchen", Some("k1"), Some("entry1"));
        assert_eq!(entry.entity_id, "switch.kitchen");
        assert_eq!(entry.domain(), "switch");
        assert!(!entry.is_hidden());

        let again = registry.get_or_create("demo", "switch.other", Some("k1"), None);
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_by_config_entry_id("entry1").len(), 1);
    }

    #[test]
    fn test_validate_entity_id() {
        let (_dir, registry) = create_registry();
        let entry = registry.get_or_create("demo", "switch.kitchen", None, None);

        // Well-formed ids pass through even if unregistered
        assert_eq!(
            registry.validate_entity_id("switch.unregistered").unwrap(),
            "switch.unregistered"
        );
        // Registry ids resolve to the current entity_id
        assert_eq!(registry.validate_entity_id(&entry.id).unwrap(), "switch.kitchen");

        assert_eq!(
            registry.validate_entity_id("abcd1234"),
            Err(EntityRegistryError::InvalidReference("abcd1234".to_string()))
        );
    }

    #[test]
    fn test_update_replaces_entry() {
        let (_dir, registry) = create_registry();
        let before = registry.get_or_create("demo", "switch.kitchen", None, None);

        let after = registry
            .update("switch.kitchen", |e| e.hidden_by = Some(HiddenBy::User))
            .unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.hidden_by, Some(HiddenBy::User));
        assert!(after.modified_at >= before.modified_at);
        assert_eq!(registry.get("switch.kitchen").unwrap().hidden_by, Some(HiddenBy::User));
    }

    #[test]
    fn test_update_rename_keeps_registry_id() {
        let (_dir, registry) = create_registry();
        let entry = registry.get_or_create("demo", "switch.kitchen", None, None);

        registry
            .update("switch.kitchen", |e| e.entity_id = "switch.pantry".to_string())
            .unwrap();

        assert!(registry.get("switch.kitchen").is_none());
        assert_eq!(registry.validate_entity_id(&entry.id).unwrap(), "switch.pantry");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_unchanged_keeps_entry() {
        let (_dir, registry) = create_registry();
        registry.get_or_create("demo", "switch.kitchen", None, None);
        let hidden = registry
            .update("switch.kitchen", |e| e.hidden_by = Some(HiddenBy::Integration))
            .unwrap();

        let again = registry
            .update("switch.kitchen", |e| {
                if e.hidden_by.is_none() {
                    e.hidden_by = Some(HiddenBy::User);
                }
            })
            .unwrap();
        assert!(Arc::ptr_eq(&hidden, &again));
        assert_eq!(again.modified_at, hidden.modified_at);
    }

    #[test]
    fn test_update_rename_to_taken_entity_id() {
        let (_dir, registry) = create_registry();
        let kitchen = registry.get_or_create("demo", "switch.kitchen", None, None);
        let pantry = registry.get_or_create("demo", "switch.pantry", None, None);

        let result = registry.update("switch.kitchen", |e| e.entity_id = "switch.pantry".to_string());
        assert_eq!(
            result.unwrap_err(),
            EntityRegistryError::AlreadyExists("switch.pantry".to_string())
        );

        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.get("switch.kitchen").unwrap(), &kitchen));
        assert_eq!(registry.validate_entity_id(&kitchen.id).unwrap(), "switch.kitchen");
        assert_eq!(registry.validate_entity_id(&pantry.id).unwrap(), "switch.pantry");
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        const THREADS: usize = 8;
        const UPDATES: usize = 500;

        let (_dir, registry) = create_registry();
        registry.get_or_create("demo", "switch.kitchen", None, None);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..UPDATES {
                        registry
                            .update("switch.kitchen", |e| {
                                let count: usize =
                                    e.name.as_deref().and_then(|n| n.parse().ok()).unwrap_or(0);
                                e.name = Some((count + 1).to_string());
                            })
                            .unwrap();
                    }
                });
            }
        });

        let entry = registry.get("switch.kitchen").unwrap();
        assert_eq!(entry.name, Some((THREADS * UPDATES).to_string()));
    }

    #[test]
    fn test_update_missing() {
        let (_dir, registry) = create_registry();
        let result = registry.update("switch.nope", |_| {});
        assert_eq!(
            result.unwrap_err(),
            EntityRegistryError::NotFound("switch.nope".to_string())
        );
    }

    #[test]
    fn test_remove_invalidates_registry_id() {
        let (_dir, registry) = create_registry();
        let entry = registry.get_or_create("demo", "switch.kitchen", None, None);

        assert!(registry.remove("switch.kitchen").is_some());
        assert!(registry.remove("switch.kitchen").is_none());
        assert!(registry.validate_entity_id(&entry.id).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        {
            let registry = EntityRegistry::new(storage.clone());
            registry.get_or_create("demo", "switch.kitchen", Some("k1"), None);
            registry
                .update("switch.kitchen", |e| e.hidden_by = Some(HiddenBy::Integration))
                .unwrap();
            registry.save().await.unwrap();
        }

        let registry = EntityRegistry::new(storage);
        registry.load().await.unwrap();
        let entry = registry.get_by_unique_id("k1").unwrap();
        assert_eq!(entry.hidden_by, Some(HiddenBy::Integration));
    }
}
