//! Switch as X
//!
//! Wraps a switch entity in an entity of another domain (light, lock,
//! cover, ...). The façade entity is provided by the entity platform the
//! config entry is forwarded to; this module only manages the config entry
//! lifecycle and hides the wrapped switch while it is wrapped.
//!
//! Entry options:
//!
//! ```yaml
//! entity_id: switch.kitchen   # entity_id or entity registry id
//! target_domain: light
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ha_config_entries::{
    ConfigEntries, ConfigEntriesError, ConfigEntriesResult, ConfigEntry, ConfigEntryHandler,
};
use ha_registries::{EntityRegistry, EntityRegistryError, HiddenBy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

pub const DOMAIN: &str = "switch_as_x";

/// Option key of the wrapped entity
pub const CONF_ENTITY_ID: &str = "entity_id";
/// Option key of the façade domain
pub const CONF_TARGET_DOMAIN: &str = "target_domain";

#[derive(Debug, Error)]
pub enum SwitchAsXError {
    #[error("Invalid options for entry {entry_id}: {source}")]
    InvalidOptions {
        entry_id: String,
        source: serde_json::Error,
    },
}

impl From<SwitchAsXError> for ConfigEntriesError {
    fn from(err: SwitchAsXError) -> Self {
        ConfigEntriesError::Integration {
            domain: DOMAIN.to_string(),
            message: err.to_string(),
        }
    }
}

/// Domain the wrapped switch is presented as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDomain {
    Cover,
    Fan,
    Light,
    Lock,
    Siren,
    Valve,
}

impl TargetDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetDomain::Cover => "cover",
            TargetDomain::Fan => "fan",
            TargetDomain::Light => "light",
            TargetDomain::Lock => "lock",
            TargetDomain::Siren => "siren",
            TargetDomain::Valve => "valve",
        }
    }
}

impl fmt::Display for TargetDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options of a switch_as_x config entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchAsXOptions {
    /// Wrapped switch, as entity_id or entity registry id
    pub entity_id: String,
    pub target_domain: TargetDomain,
}

impl SwitchAsXOptions {
    pub fn from_entry(entry: &ConfigEntry) -> Result<Self, SwitchAsXError> {
        serde_json::from_value(entry.options_value()).map_err(|source| {
            SwitchAsXError::InvalidOptions {
                entry_id: entry.entry_id.clone(),
                source,
            }
        })
    }
}

/// Config entry handler for switch_as_x
///
/// Holds the shared entity registry; the config entry manager is passed in
/// on every call.
pub struct SwitchAsX {
    registry: Arc<EntityRegistry>,
}

impl SwitchAsX {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ConfigEntryHandler for SwitchAsX {
    async fn setup_entry(
        &self,
        entries: &ConfigEntries,
        entry: &ConfigEntry,
    ) -> ConfigEntriesResult<bool> {
        let options = SwitchAsXOptions::from_entry(entry)?;

        let entity_id = match self.registry.validate_entity_id(&options.entity_id) {
            Ok(entity_id) => entity_id,
            Err(EntityRegistryError::InvalidReference(_)) => {
                error!(
                    "Failed to setup switch_as_x for unknown entity {}",
                    options.entity_id
                );
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        // Hide the wrapped entity if registered and not hidden by anyone yet
        let mut hid = false;
        let hide = self.registry.update(&entity_id, |e| {
            if e.hidden_by.is_none() {
                e.hidden_by = Some(HiddenBy::Integration);
                hid = true;
            }
        });
        match hide {
            Ok(_) | Err(EntityRegistryError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if hid {
            self.registry.save().await?;
            debug!("Hid wrapped entity {}", entity_id);
        }

        entries
            .setup_platforms(entry, &[options.target_domain.as_str()])
            .await
    }

    async fn unload_entry(
        &self,
        entries: &ConfigEntries,
        entry: &ConfigEntry,
    ) -> ConfigEntriesResult<bool> {
        let options = SwitchAsXOptions::from_entry(entry)?;
        entries
            .unload_platforms(entry, &[options.target_domain.as_str()])
            .await
    }

    async fn remove_entry(
        &self,
        _entries: &ConfigEntries,
        entry: &ConfigEntry,
    ) -> ConfigEntriesResult<()> {
        let options = SwitchAsXOptions::from_entry(entry)?;

        // The wrapped entity may be gone from the registry already
        let Ok(entity_id) = self.registry.validate_entity_id(&options.entity_id) else {
            return Ok(());
        };

        let mut unhid = false;
        let unhide = self.registry.update(&entity_id, |e| {
            if e.hidden_by == Some(HiddenBy::Integration) {
                e.hidden_by = None;
                unhid = true;
            }
        });
        match unhide {
            Ok(_) | Err(EntityRegistryError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if unhid {
            self.registry.save().await?;
            debug!("Unhid wrapped entity {}", entity_id);
        }
        Ok(())
    }
}

/// Register the switch_as_x config entry handler
pub fn register_switch_as_x(entries: &ConfigEntries, registry: Arc<EntityRegistry>) {
    entries.register_handler(DOMAIN, Arc::new(SwitchAsX::new(registry)));
    info!("switch_as_x integration registered");
}
