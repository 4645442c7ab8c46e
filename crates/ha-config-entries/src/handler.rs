//! Integration and platform hooks
//!
//! An integration registers a [`ConfigEntryHandler`] for its domain. The
//! handler may forward its entries to entity platforms, which are registered
//! as [`EntityPlatform`]s keyed by (integration domain, platform domain).

use async_trait::async_trait;

use crate::entry::ConfigEntry;
use crate::manager::{ConfigEntries, ConfigEntriesResult};

/// Lifecycle hooks of an integration's config entries
#[async_trait]
pub trait ConfigEntryHandler: Send + Sync {
    /// Set up an entry. `Ok(false)` marks the entry as failed to set up.
    async fn setup_entry(
        &self,
        entries: &ConfigEntries,
        entry: &ConfigEntry,
    ) -> ConfigEntriesResult<bool>;

    /// Unload an entry. `Ok(false)` marks the entry as failed to unload.
    async fn unload_entry(
        &self,
        entries: &ConfigEntries,
        entry: &ConfigEntry,
    ) -> ConfigEntriesResult<bool>;

    /// Clean up after an entry was deleted. Called after unload.
    async fn remove_entry(
        &self,
        _entries: &ConfigEntries,
        _entry: &ConfigEntry,
    ) -> ConfigEntriesResult<()> {
        Ok(())
    }
}

/// An entity platform that config entries can be forwarded to
#[async_trait]
pub trait EntityPlatform: Send + Sync {
    async fn setup_entry(&self, entry: &ConfigEntry) -> ConfigEntriesResult<bool>;

    async fn unload_entry(&self, entry: &ConfigEntry) -> ConfigEntriesResult<bool>;
}
