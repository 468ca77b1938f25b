//! Canonical schema: entity types, foreign keys and their ordering

mod registry;
mod university;

pub use registry::{AttrKind, EntityDef, EntityKind, Relation, SchemaRegistry};
pub use university::{university_registry, ATTENDED_EDGE};
