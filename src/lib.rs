// Entity Cache - client-side identity-mapped entity cache with change tracking

// Metadata and validation
pub mod ent_framework;

// Core types and primitives
pub mod core;

// Entity manager and its infrastructure
pub mod infrastructure;

// Query compiler
pub mod query;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use crate::config::{FetchStrategy, ManagerConfig, MergeStrategy};
pub use crate::core::{DataType, DataValue, EntityAction, EntityId, EntityKey, EntityState};
pub use crate::ent_framework::{
    DataPropertyDef, EntityTypeDef, MetadataStore, NavigationPropertyDef,
};
pub use crate::infrastructure::{EntityManager, MemoryDataService, SharedEntityManager};
pub use crate::query::{EntityQuery, FilterOp, Predicate};
pub use error::{AppError, AppResult};
