//! Core types for Home Assistant
//!
//! Value types shared by the registries, the config entry manager and the
//! built-in components.

mod entity_id;

pub use entity_id::{split_entity_id, valid_domain, valid_entity_id, EntityId, EntityIdError};
