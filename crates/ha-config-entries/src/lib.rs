//! Config Entries
//!
//! This crate provides the configuration entry system for Home Assistant.
//! Config entries represent individual integration instances and manage
//! their lifecycle (setup, unload, reload, removal).
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`ConfigEntryHandler`] / [`EntityPlatform`] - Integration hooks
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/core.config_entries` with
//! version tracking for migrations.

pub mod entry;
pub mod handler;
pub mod manager;
pub mod state_machine;

pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};

pub use handler::{ConfigEntryHandler, EntityPlatform};

pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, STORAGE_KEY,
    STORAGE_MINOR_VERSION, STORAGE_VERSION,
};

pub use state_machine::InvalidTransition;
