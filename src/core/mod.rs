// Core types and primitives - identity, state and values

pub mod data_value;     // DataType / DataValue
pub mod entity_key;     // Composite entity identity
pub mod entity_state;   // EntityState / EntityAction
pub mod key_generator;  // Temporary key generation
pub mod strong_types;   // EntityId / ManagerId handles

pub use data_value::{DataType, DataValue, PropertySource};
pub use entity_key::EntityKey;
pub use entity_state::{EntityAction, EntityState};
pub use key_generator::{KeyGenerator, TempKeyGenerator};
pub use strong_types::{EntityId, ManagerId};
