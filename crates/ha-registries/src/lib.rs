//! Home Assistant Registries
//!
//! Persistent registries shared by integrations. Currently this is the
//! entity registry, stored as versioned JSON in the `.storage/` directory.

pub mod storage;

pub mod entity_registry;

pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};

pub use entity_registry::{
    DisabledBy, EntityEntry, EntityRegistry, EntityRegistryData, EntityRegistryError, HiddenBy,
};
