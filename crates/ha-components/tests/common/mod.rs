//! Test harness for component tests
//!
//! Provides an isolated host (entity registry + config entries backed by a
//! temp `.storage/` directory) and a mock entity platform that records the
//! entries forwarded to it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ha_config_entries::{ConfigEntries, ConfigEntriesResult, ConfigEntry, EntityPlatform};
use ha_registries::{EntityRegistry, Storage};
use serde_json::json;
use tempfile::TempDir;

/// Entity platform that records setup/unload calls
pub struct MockPlatform {
    accept: bool,
    setups: Mutex<Vec<String>>,
    unloads: Mutex<Vec<String>>,
}

impl MockPlatform {
    pub fn new(accept: bool) -> Self {
        Self {
            accept,
            setups: Mutex::new(Vec::new()),
            unloads: Mutex::new(Vec::new()),
        }
    }

    /// Entry ids the platform was set up for
    pub fn setups(&self) -> Vec<String> {
        self.setups.lock().unwrap().clone()
    }

    /// Entry ids the platform was unloaded for
    pub fn unloads(&self) -> Vec<String> {
        self.unloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntityPlatform for MockPlatform {
    async fn setup_entry(&self, entry: &ConfigEntry) -> ConfigEntriesResult<bool> {
        self.setups.lock().unwrap().push(entry.entry_id.clone());
        Ok(self.accept)
    }

    async fn unload_entry(&self, entry: &ConfigEntry) -> ConfigEntriesResult<bool> {
        self.unloads.lock().unwrap().push(entry.entry_id.clone());
        Ok(true)
    }
}

/// An isolated host instance for tests
pub struct TestHass {
    _config_dir: TempDir,
    storage: Arc<Storage>,
    pub registry: Arc<EntityRegistry>,
    pub entries: ConfigEntries,
}

impl TestHass {
    pub fn new() -> Self {
        let config_dir = TempDir::new().expect("Failed to create config dir");
        let storage = Arc::new(Storage::new(config_dir.path()));

        Self {
            registry: Arc::new(EntityRegistry::new(storage.clone())),
            entries: ConfigEntries::new(storage.clone()),
            storage,
            _config_dir: config_dir,
        }
    }

    /// Load a fresh entity registry from this instance's `.storage/`,
    /// as after a restart
    pub async fn restarted_registry(&self) -> EntityRegistry {
        let registry = EntityRegistry::new(self.storage.clone());
        registry.load().await.expect("Failed to load entity registry");
        registry
    }

    /// Register a mock platform for `integration.platform`
    pub fn mock_platform(&self, integration: &str, platform: &str, accept: bool) -> Arc<MockPlatform> {
        let mock = Arc::new(MockPlatform::new(accept));
        self.entries
            .register_platform(integration, platform, mock.clone());
        mock
    }

    /// Register a switch in the entity registry
    pub fn register_switch(&self, entity_id: &str) -> String {
        let object_id = entity_id.split('.').nth(1).unwrap_or(entity_id);
        self.registry
            .get_or_create("demo", entity_id, Some(object_id), None)
            .id
            .clone()
    }

    /// Add a config entry for `domain` with the given wrapping options
    pub async fn add_entry(&self, domain: &str, entity_id: &str, target_domain: &str) -> ConfigEntry {
        let entry = ConfigEntry::new(domain, "ABC")
            .with_option("entity_id", json!(entity_id))
            .with_option("target_domain", json!(target_domain));
        self.entries.add(entry).await.expect("Failed to add entry")
    }
}
