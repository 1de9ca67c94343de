// Cache infrastructure - the entity manager and the pieces it is built from

pub mod cache;               // LRU wrapper
pub mod entity_aspect;       // Per-entity tracking state
pub mod entity_group;        // Per-type identity map
pub mod entity_manager;      // Cache facade
pub mod events;              // Pub/sub events
pub mod memory_data_service; // In-process transport
pub mod relation_index;      // Navigation edges and relation arrays
pub mod traits;              // Transport, results and storage capabilities
pub mod unattached_children; // Children waiting for their parent

pub use cache::Cache;
pub use entity_aspect::EntityAspect;
pub use entity_group::EntityGroup;
pub use entity_manager::{
    EntityManager, EntityManagerBuilder, EntityView, FetchByKeyResult, ImportOptions,
    ImportResult, QueryOutcome, SaveOutcome, SharedEntityManager, WriteContext,
};
pub use events::{
    ArrayChangedArgs, EntityChangedArgs, Event, HasChangesChangedArgs, PropertyChangedArgs,
    PropertyValue, SubscriptionId, ValidationErrorsChangedArgs,
};
pub use memory_data_service::{MemoryDataService, ServiceOperation, ServiceRequest};
pub use traits::{
    BackingStore, BackingStoreLibrary, DataServiceAdapter, JsonResultsAdapter, KeyMapping,
    ModelLibrary, NodeContext, NodeMeta, PropertyStore, QueryResult, SaveResult,
    WebApiJsonResultsAdapter,
};
