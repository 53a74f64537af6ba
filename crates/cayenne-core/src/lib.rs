//! Core types and traits for the Cayenne object graph engine.
//!
//! This crate provides the foundational abstractions shared by the snapshot
//! cache, object contexts and data nodes:
//!
//! - [`ObjectId`] with numeric-type-insensitive, key-order-independent identity
//! - [`EntityResolver`] mapping entities, attributes and relationships
//! - [`ToOne`] / [`ToMany`] relationship slots implementing [`Fault`]
//! - [`GraphDiff`] / [`CompoundDiff`] change records
//! - [`DataNode`] trait for stores that execute selects and row operations
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod data_row;
pub mod diff;
pub mod entity;
pub mod error;
pub mod fault;
pub mod node;
pub mod object_id;
pub mod persistence;
pub mod value;

pub use data_row::{DataRow, NO_VERSION};
pub use diff::{CompoundDiff, GraphChangeHandler, GraphDiff};
pub use entity::{
    CollectionType, DbAttribute, DeleteRule, EntityDescriptor, EntityResolver, FkSide, Join,
    JoinTable, Relationship,
};
pub use error::{
    CommitError, CommitErrorKind, ConfigError, DeleteDeniedError, Error, FaultError,
    FaultErrorKind, IdentityError, IdentityErrorKind, MappingError, QueryError, QueryErrorKind,
    Result, TypeError,
};
pub use fault::{Fault, PendingArcs, RelatedCollection, ToMany, ToOne};
pub use node::{
    DataNode, JOIN_SOURCE_PREFIX, JointSpec, NodeTransaction, OperationKind, OperationResult,
    Qualifier, RowOperation, SelectQuery,
};
pub use object_id::ObjectId;
pub use persistence::{ContextId, PersistenceState};
pub use value::{CanonicalValue, Value};
