//! Split-record persistence: one logical entity stored as a base row shared
//! by all variants plus an implementation row per variant, surfaced to callers
//! as a single object.
//!
//! Model types are declared on a [`Registry`] with [`ModelDef`]. A type marked
//! [`ModelDef::mti_base`] resolves to its implementation on every load; a type
//! marked [`ModelDef::mti_implementation_of`] forwards the base's fields,
//! relations and methods. Records are loaded and saved through a [`Session`]
//! over any [`Storage`].

mod binder;
pub mod delegation;
mod entity;
mod error;
pub mod introspection;
pub mod mode;
mod model;
mod session;
mod storage;
mod value;

pub use delegation::{accessor, Accessor, DelegationChain, Dynamic, Selector};
pub use entity::Entity;
pub use error::MtiError;
pub use model::{
    BaseBinding, Forward, ImplementationBinding, Method, ModelDef, ModelType, Registry, Relation,
    RelationKind, RelationOptions, Role, Validator,
};
pub use session::Session;
pub use storage::{Column, SchemaSource, Storage};
pub use value::{snake_case, FieldValue, RecordId, Row};
