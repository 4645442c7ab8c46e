//! Entity ID type representing a domain.object_id pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity_id must contain exactly one '.' separator")]
    InvalidFormat,

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid object_id: {0}")]
    InvalidObjectId(String),
}

/// A Home Assistant entity ID such as `switch.kitchen`
///
/// Both parts are slugs: lowercase ASCII letters, digits and underscores,
/// not starting or ending with an underscore. Domains additionally may not
/// contain `__`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    object_id: String,
}

impl EntityId {
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let domain = domain.into();
        let object_id = object_id.into();

        if !valid_domain(&domain) {
            return Err(EntityIdError::InvalidDomain(domain));
        }
        if !is_slug(&object_id) {
            return Err(EntityIdError::InvalidObjectId(object_id));
        }
        Ok(Self { domain, object_id })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Check a domain name (`(?!.+__)(?!_)[\da-z_]+(?<!_)`)
pub fn valid_domain(domain: &str) -> bool {
    is_slug(domain) && !domain.contains("__")
}

/// Split an entity ID into its domain and object_id without validating them
pub fn split_entity_id(entity_id: &str) -> Option<(&str, &str)> {
    let (domain, object_id) = entity_id.split_once('.')?;
    if object_id.contains('.') {
        return None;
    }
    Some((domain, object_id))
}

/// Test if a string is a well-formed entity ID
///
/// This is a syntax check only, the entity does not have to exist.
pub fn valid_entity_id(entity_id: &str) -> bool {
    entity_id.parse::<EntityId>().is_ok()
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, object_id) = split_entity_id(s).ok_or(EntityIdError::InvalidFormat)?;
        Self::new(domain, object_id)
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_id() {
        let id: EntityId = "switch.kitchen_outlet".parse().unwrap();
        assert_eq!(id.domain(), "switch");
        assert_eq!(id.object_id(), "kitchen_outlet");
        assert_eq!(id.to_string(), "switch.kitchen_outlet");
    }

    #[test]
    fn test_separator_count() {
        assert_eq!(
            "no_separator".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            "switch.a.b".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
    }

    #[test]
    fn test_invalid_parts() {
        assert!(matches!(
            ".kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "switch.".parse::<EntityId>(),
            Err(EntityIdError::InvalidObjectId(_))
        ));
        assert!(matches!(
            "Switch.kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "my__switch.kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "switch._kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidObjectId(_))
        ));
        // Double underscores are allowed in the object_id
        assert!("switch.kitchen__outlet".parse::<EntityId>().is_ok());
    }

    #[test]
    fn test_valid_entity_id() {
        assert!(valid_entity_id("light.living_room"));
        assert!(!valid_entity_id("01hv7xq3m9c5k0d1bq2w6r8z4t"));
        assert!(!valid_entity_id("light.Living Room"));
    }

    #[test]
    fn test_split_entity_id() {
        assert_eq!(split_entity_id("lock.front_door"), Some(("lock", "front_door")));
        assert_eq!(split_entity_id("lock"), None);
    }

    #[test]
    fn test_serde_as_string() {
        let id = EntityId::new("switch", "kitchen").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"switch.kitchen\"");
        assert!(serde_json::from_str::<EntityId>("\"switch\"").is_err());
    }
}
