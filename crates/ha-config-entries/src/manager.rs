//! Config Entries Manager
//!
//! Manages the lifecycle of configuration entries and forwards entries to
//! the entity platforms of their integration.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use ha_registries::{EntityRegistryError, Storable, Storage, StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use crate::handler::{ConfigEntryHandler, EntityPlatform};
use crate::state_machine::InvalidTransition;

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 5;

/// Config entries errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Error in {domain}: {message}")]
    Integration { domain: String, message: String },

    #[error("Entity registry error: {0}")]
    Registry(#[from] EntityRegistryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Config entries data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Config Entries Manager
///
/// Entries are set up through the [`ConfigEntryHandler`] registered for
/// their domain. Setup, unload and removal of one entry are serialized on
/// the entry's `setup_lock`; different entries proceed independently.
pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Integration handlers by domain
    handlers: DashMap<String, Arc<dyn ConfigEntryHandler>>,

    /// Entity platforms by (integration domain, platform domain)
    platforms: DashMap<(String, String), Arc<dyn EntityPlatform>>,

    /// entry_id -> platform domains the entry is currently forwarded to
    loaded_platforms: DashMap<String, HashSet<String>>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            handlers: DashMap::new(),
            platforms: DashMap::new(),
            loaded_platforms: DashMap::new(),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(file) = self.storage.load::<ConfigEntriesData>().await? {
            info!(
                "Loading {} config entries from storage (v{}.{})",
                file.data.entries.len(),
                file.version,
                file.minor_version
            );
            for entry in file.data.entries {
                self.index_entry(&entry);
            }
        }
        Ok(())
    }

    /// Save entries to storage
    pub async fn save(&self) -> StorageResult<()> {
        let data = ConfigEntriesData {
            entries: self.iter().collect(),
        };
        self.storage.save(&data).await?;
        debug!("Saved {} config entries to storage", data.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.entries.insert(entry_id.clone(), entry.clone());
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    /// Get an entry by ID
    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    fn require(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        self.get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }

    /// Get all entries for a domain
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let ids: Vec<String> = self
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let entry_id = self
            .by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))?
            .value()
            .clone();
        self.get(&entry_id)
    }

    /// Add a new config entry
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Update an existing entry
    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self.require(entry_id)?;
        self.unindex_entry(&entry);

        let mut updated = entry;
        if let Some(title) = update.title {
            updated.title = title;
        }
        if let Some(options) = update.options {
            updated.options = options;
        }
        updated.modified_at = Utc::now();

        self.index_entry(&updated);
        self.save().await?;

        debug!("Updated config entry: {}", entry_id);
        Ok(updated)
    }

    /// Move an entry to a new lifecycle state
    fn set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed to {:?}", entry_id, state);
        Ok(())
    }

    /// Register the config entry handler of an integration
    pub fn register_handler(&self, domain: &str, handler: Arc<dyn ConfigEntryHandler>) {
        self.handlers.insert(domain.to_string(), handler);
        debug!("Registered config entry handler for domain: {}", domain);
    }

    fn handler(&self, domain: &str) -> Option<Arc<dyn ConfigEntryHandler>> {
        self.handlers.get(domain).map(|h| Arc::clone(h.value()))
    }

    /// Register an entity platform that entries of `integration` can be
    /// forwarded to
    pub fn register_platform(
        &self,
        integration: &str,
        platform: &str,
        handler: Arc<dyn EntityPlatform>,
    ) {
        self.platforms
            .insert((integration.to_string(), platform.to_string()), handler);
        debug!("Registered platform {}.{}", integration, platform);
    }

    fn platform(&self, integration: &str, platform: &str) -> Option<Arc<dyn EntityPlatform>> {
        self.platforms
            .get(&(integration.to_string(), platform.to_string()))
            .map(|p| Arc::clone(p.value()))
    }

    /// Platforms an entry is currently forwarded to, sorted
    pub fn loaded_platforms(&self, entry_id: &str) -> Vec<String> {
        let mut platforms: Vec<String> = self
            .loaded_platforms
            .get(entry_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        platforms.sort();
        platforms
    }

    /// Set up an entry by calling its integration's handler
    ///
    /// Returns whether the entry is loaded afterwards. Handler errors leave
    /// the entry in `SetupError` and are returned.
    #[instrument(skip(self))]
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = Arc::clone(&self.require(entry_id)?.setup_lock);
        let _guard = lock.lock().await;

        let entry = self.require(entry_id)?;
        if entry.is_disabled() {
            debug!("Skipping setup for disabled entry: {}", entry_id);
            return Ok(false);
        }

        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;
        let entry = self.require(entry_id)?;

        let Some(handler) = self.handler(&entry.domain) else {
            self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
            debug!(
                "No setup handler for domain {}, marking as loaded",
                entry.domain
            );
            return Ok(true);
        };

        match handler.setup_entry(self, &entry).await {
            Ok(true) => {
                self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(true)
            }
            Ok(false) => {
                warn!("Setup failed for entry {} ({})", entry.title, entry_id);
                self.set_state(
                    entry_id,
                    ConfigEntryState::SetupError,
                    Some("Setup failed".to_string()),
                )?;
                Ok(false)
            }
            Err(err) => {
                error!("Error setting up entry {} for {}: {}", entry.title, entry.domain, err);
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(err.to_string()))?;
                Err(err)
            }
        }
    }

    /// Unload an entry
    ///
    /// An entry that is not loaded unloads trivially. Entries in
    /// `SetupError` go back to `NotLoaded` without calling the handler.
    #[instrument(skip(self))]
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = Arc::clone(&self.require(entry_id)?.setup_lock);
        let _guard = lock.lock().await;
        self.unload_locked(entry_id).await
    }

    /// Unload with the entry's `setup_lock` already held
    async fn unload_locked(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self.require(entry_id)?;
        match entry.state {
            ConfigEntryState::NotLoaded => return Ok(true),
            state if !state.is_recoverable() => {
                return Err(ConfigEntriesError::CannotUnload(state));
            }
            _ => {}
        }

        self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        let handler = match entry.state {
            ConfigEntryState::Loaded => self.handler(&entry.domain),
            _ => None,
        };
        let Some(handler) = handler else {
            self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
            info!("Unloaded entry: {} ({})", entry.title, entry_id);
            return Ok(true);
        };

        match handler.unload_entry(self, &entry).await {
            Ok(true) => {
                self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
                info!("Unloaded entry: {} ({})", entry.title, entry_id);
                Ok(true)
            }
            Ok(false) => {
                warn!("Unload failed for entry {} ({})", entry.title, entry_id);
                self.set_state(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some("Unload failed".to_string()),
                )?;
                Ok(false)
            }
            Err(err) => {
                error!("Error unloading entry {} for {}: {}", entry.title, entry.domain, err);
                self.set_state(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some(err.to_string()),
                )?;
                Err(err)
            }
        }
    }

    /// Reload an entry (unload + setup)
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        if !self.unload(entry_id).await? {
            return Ok(false);
        }
        self.setup(entry_id).await
    }

    /// Remove an entry
    ///
    /// A loaded entry is unloaded first, under the same hold of the entry's
    /// `setup_lock`. The integration's `remove_entry` hook runs afterwards;
    /// its errors are logged and do not stop removal.
    #[instrument(skip(self))]
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let lock = Arc::clone(&self.require(entry_id)?.setup_lock);
        let _guard = lock.lock().await;

        if self.require(entry_id)?.is_loaded() && !self.unload_locked(entry_id).await? {
            warn!("Removing entry {} that failed to unload", entry_id);
        }
        let entry = self.require(entry_id)?;

        if let Some(handler) = self.handler(&entry.domain) {
            if let Err(err) = handler.remove_entry(self, &entry).await {
                error!("Error removing entry {} for {}: {}", entry.title, entry.domain, err);
            }
        }

        self.loaded_platforms.remove(entry_id);
        self.unindex_entry(&entry);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    /// Forward an entry to entity platforms of its integration
    ///
    /// Platforms are set up concurrently. Returns `true` only if every
    /// platform exists and accepted the entry.
    #[instrument(skip(self, entry), fields(entry_id = %entry.entry_id))]
    pub async fn setup_platforms(
        &self,
        entry: &ConfigEntry,
        platforms: &[&str],
    ) -> ConfigEntriesResult<bool> {
        let results = join_all(
            platforms
                .iter()
                .map(|platform| self.setup_platform(entry, platform)),
        )
        .await;

        let mut all_ok = true;
        for result in results {
            all_ok &= result?;
        }
        Ok(all_ok)
    }

    async fn setup_platform(&self, entry: &ConfigEntry, platform: &str) -> ConfigEntriesResult<bool> {
        let Some(handler) = self.platform(&entry.domain, platform) else {
            warn!(
                "Platform {}.{} not found for entry {}",
                entry.domain, platform, entry.entry_id
            );
            return Ok(false);
        };

        let ok = handler.setup_entry(entry).await?;
        if ok {
            self.loaded_platforms
                .entry(entry.entry_id.clone())
                .or_default()
                .insert(platform.to_string());
            debug!("Set up platform {}.{}", entry.domain, platform);
        }
        Ok(ok)
    }

    /// Unload an entry from entity platforms of its integration
    ///
    /// Platforms the entry was never forwarded to count as unloaded.
    #[instrument(skip(self, entry), fields(entry_id = %entry.entry_id))]
    pub async fn unload_platforms(
        &self,
        entry: &ConfigEntry,
        platforms: &[&str],
    ) -> ConfigEntriesResult<bool> {
        let results = join_all(
            platforms
                .iter()
                .map(|platform| self.unload_platform(entry, platform)),
        )
        .await;

        let mut all_ok = true;
        for result in results {
            all_ok &= result?;
        }
        Ok(all_ok)
    }

    async fn unload_platform(&self, entry: &ConfigEntry, platform: &str) -> ConfigEntriesResult<bool> {
        let loaded = self
            .loaded_platforms
            .get(&entry.entry_id)
            .map(|p| p.contains(platform))
            .unwrap_or(false);
        if !loaded {
            return Ok(true);
        }

        let Some(handler) = self.platform(&entry.domain, platform) else {
            warn!("Platform {}.{} disappeared while loaded", entry.domain, platform);
            return Ok(false);
        };

        let ok = handler.unload_entry(entry).await?;
        if ok {
            if let Some(mut loaded) = self.loaded_platforms.get_mut(&entry.entry_id) {
                loaded.remove(platform);
            }
            debug!("Unloaded platform {}.{}", entry.domain, platform);
        }
        Ok(ok)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ConfigEntry> + '_ {
        self.entries.iter().map(|r| r.value().clone())
    }
}
