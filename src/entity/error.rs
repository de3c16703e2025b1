//! Registry-specific error types.
//!
//! Registry errors are always surfaced synchronously to the caller of the
//! offending operation; nothing on the sampling path produces them.

use thiserror::Error;

use crate::entity::EntityType;

/// Errors that can occur while mutating or querying the entity hierarchy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// An entity with the same name and type is already registered.
    #[error("{entity_type} '{name}' is already registered")]
    DuplicateName {
        /// Type of the conflicting entity.
        entity_type: EntityType,
        /// Conflicting name.
        name: String,
    },

    /// The requested parent/child relationship violates a hierarchy rule.
    #[error("invalid relationship: {0}")]
    InvalidRelationship(String),

    /// The entity is not currently registered.
    #[error("entity not registered: {0}")]
    NotFound(String),

    /// The entity is malformed or not valid for the requested operation.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),
}
