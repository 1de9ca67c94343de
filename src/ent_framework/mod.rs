// Ent Framework - entity type metadata and validation

pub mod ent_schema;
pub mod validators;

pub use ent_schema::{
    AutoGeneratedKeyType, ConcurrencyMode, DataProperty, DataPropertyDef, EntityType,
    EntityTypeDef, MetadataStore, NavigationProperty, NavigationPropertyDef, ResolvedPath,
};
pub use validators::{
    FnValidator, MaxLengthValidator, RegexValidator, RequiredValidator, ValidationContext,
    ValidationError, Validator,
};
