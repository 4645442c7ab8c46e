//! Config Entry types
//!
//! A ConfigEntry represents a single instance of an integration's configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    /// Currently being configured (non-recoverable)
    SetupInProgress,
    /// Successfully set up (recoverable)
    Loaded,
    /// Setup failed (recoverable)
    SetupError,
    /// Currently unloading (non-recoverable)
    UnloadInProgress,
    /// Unload failed (not recoverable)
    FailedUnload,
}

impl ConfigEntryState {
    /// Check if the entry can be unloaded/reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded | ConfigEntryState::SetupError | ConfigEntryState::NotLoaded
        )
    }
}

/// Source of the config entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Configured via UI/API
    #[default]
    User,
    /// Imported from YAML config
    Import,
    /// Generic discovery
    Discovery,
}

/// Reason an entry was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g., "switch_as_x")
    pub domain: String,

    /// Human-readable display name
    pub title: String,

    /// Immutable configuration data
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// User-configurable options
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_version")]
    pub minor_version: u32,

    /// Optional unique identifier for duplicate prevention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Human-readable explanation for failed states
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Serializes setup/unload/remove of this entry (not persisted).
    /// Shared by every clone of the entry.
    #[serde(skip)]
    pub setup_lock: Arc<Mutex<()>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    /// Create a new config entry
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            version: 1,
            minor_version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            setup_lock: Arc::new(Mutex::new(())),
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Set a single option value
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Options as a JSON object, for typed deserialization by integrations
    pub fn options_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Attempt to transition to a new state with validation.
    ///
    /// On success, updates the state and reason fields.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.try_transition(new_state)?;
        self.reason = reason;
        Ok(())
    }
}

/// Update data for a config entry
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub options: Option<HashMap<String, serde_json::Value>>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = Some(options);
        self
    }
}
