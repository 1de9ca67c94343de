use std::fmt;

use crate::core::strong_types::EntityId;

/// Where a transport failure came from; carried so callers can inspect or
/// retry the original request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportContext {
    Metadata { service_name: String },
    Query { uri: String },
    Save { bundle: String },
}

#[derive(Debug)]
pub enum AppError {
    Configuration(String),
    DuplicateKey(String),
    CrossManager(String),
    MissingKey(String),
    KeyCollision(String),
    UnknownEntity(EntityId),
    UnknownEntityType(String),
    UnknownProperty { entity_type: String, property: String },
    InvalidOperation(String),
    Validation { message: String, entities: Vec<EntityId> },
    ConcurrentSave(Vec<EntityId>),
    MetadataAlreadyFetched(String),
    QueryParse(String),
    Transport {
        message: String,
        context: TransportContext,
        source: anyhow::Error,
    },
    Serialization(String),
    Deserialization(String),
    Internal(String),
}

impl AppError {
    pub fn transport(context: TransportContext, source: anyhow::Error) -> Self {
        AppError::Transport {
            message: source.to_string(),
            context,
            source,
        }
    }

    pub fn unknown_property(entity_type: &str, property: &str) -> Self {
        AppError::UnknownProperty {
            entity_type: entity_type.to_string(),
            property: property.to_string(),
        }
    }

    /// Entities that failed validation, empty for every other variant.
    pub fn entities_with_errors(&self) -> &[EntityId] {
        match self {
            AppError::Validation { entities, .. } => entities,
            _ => &[],
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Transport { .. })
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::DuplicateKey(key) => {
                write!(f, "An entity with this key is already in the cache: {}", key)
            }
            AppError::CrossManager(msg) => write!(f, "Cross-manager attach: {}", msg),
            AppError::MissingKey(msg) => write!(f, "Cannot attach without a key: {}", msg),
            AppError::KeyCollision(key) => {
                write!(f, "Key change collides with a cached entity: {}", key)
            }
            AppError::UnknownEntity(id) => write!(f, "Unknown entity: {}", id),
            AppError::UnknownEntityType(name) => write!(f, "Unknown entity type: {}", name),
            AppError::UnknownProperty {
                entity_type,
                property,
            } => write!(
                f,
                "Unable to resolve property path '{}' on entity type '{}'",
                property, entity_type
            ),
            AppError::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            AppError::Validation { message, entities } => write!(
                f,
                "Validation error: {} ({} entities with errors)",
                message,
                entities.len()
            ),
            AppError::ConcurrentSave(ids) => write!(
                f,
                "Concurrent saves not allowed - {} entities are already being saved",
                ids.len()
            ),
            AppError::MetadataAlreadyFetched(service) => {
                write!(f, "Metadata for service '{}' has already been fetched", service)
            }
            AppError::QueryParse(msg) => write!(f, "Query parse error: {}", msg),
            AppError::Transport { message, .. } => write!(f, "Transport error: {}", message),
            AppError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            AppError::Deserialization(msg) => write!(f, "Deserialization error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Transport { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            AppError::Deserialization(err.to_string())
        } else {
            AppError::Serialization(err.to_string())
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_keeps_context() {
        let err = AppError::transport(
            TransportContext::Query {
                uri: "Customers?$top=1".into(),
            },
            anyhow::anyhow!("connection reset"),
        );
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "Transport error: connection reset");
        match err {
            AppError::Transport { context, .. } => assert_eq!(
                context,
                TransportContext::Query {
                    uri: "Customers?$top=1".into()
                }
            ),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_validation_error_lists_entities() {
        let err = AppError::Validation {
            message: "Validation error".into(),
            entities: vec![EntityId::new(1), EntityId::new(2)],
        };
        assert_eq!(err.entities_with_errors().len(), 2);
        assert!(AppError::Internal("x".into()).entities_with_errors().is_empty());
    }
}
