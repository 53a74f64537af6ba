//! Cayenne Rust - object graph persistence with ordered commits.
//!
//! Cayenne keeps a graph of persistent objects in an object context,
//! records every change made to it, and commits the changes as one
//! transaction of row operations ordered so that foreign keys are always
//! satisfied:
//!
//! - Unique object identity per context, with temporary ids replaced by
//!   database-generated keys on commit
//! - Lazy relationship faults and HOLLOW objects
//! - Joint, disjoint and disjoint-by-id prefetching
//! - Delete rules (`Nullify`, `Cascade`, `Deny`)
//! - Optimistic locking and a shared snapshot cache that keeps contexts in
//!   sync
//!
//! # Quick Start
//!
//! ```ignore
//! use cayenne::prelude::*;
//!
//! let resolver = EntityResolver::new([
//!     EntityDescriptor::new("Artist", "artist")
//!         .attribute(DbAttribute::generated_pk("id"))
//!         .attribute(DbAttribute::new("name"))
//!         .relationship(
//!             Relationship::to_many("paintings", "Painting")
//!                 .join("id", "artist_id")
//!                 .reverse("artist"),
//!         ),
//!     EntityDescriptor::new("Painting", "painting")
//!         .attribute(DbAttribute::generated_pk("id"))
//!         .attribute(DbAttribute::new("artist_id"))
//!         .relationship(
//!             Relationship::to_one("artist", "Artist")
//!                 .join("artist_id", "id")
//!                 .reverse("paintings"),
//!         ),
//! ])?;
//! let node = MemoryNode::from_resolver("memory", &resolver);
//! let runtime = CayenneRuntime::new(node, resolver, RuntimeConfig::default());
//!
//! let mut context = runtime.new_context();
//! let artist = context.new_object("Artist")?;
//! let painting = context.new_object("Painting")?;
//! context.add_to_many(&artist, "paintings", &painting)?;
//!
//! // INSERT artist, then INSERT painting carrying the generated artist id
//! let report = context.commit_changes(&cx).await;
//! ```

pub mod config;
pub mod runtime;

pub use config::{
    COMMIT_SORTER_PROPERTY, MAX_ID_QUALIFIER_SIZE_PROPERTY, RuntimeConfig,
    SNAPSHOT_CACHE_SIZE_PROPERTY, VALIDATE_VERSIONS_PROPERTY,
};
pub use runtime::CayenneRuntime;

// Re-export all public types from sub-crates
pub use cayenne_cache::{
    DataRowStore, SnapshotChanges, SnapshotEvent, StoreConfig, StoreStats, Subscription,
};
pub use cayenne_context::{
    AttributeChange, ChangeKind, ChangeLog, CommitLog, CommitReport, ContextCallbacks,
    ContextConfig, DataObject, EntityOrderSorter, FlattenedChange, LifecycleEvent, ObjectChange,
    ObjectContext, ObjectGraphSorter, ObjectSelect, ObjectStore, OperationSorter,
    PrefetchSemantics, PrefetchSpec, SharedContext, SorterKind, ToManyChange, ToOneChange,
};
pub use cayenne_core::{
    CanonicalValue, CollectionType, CommitError, CommitErrorKind, CompoundDiff, ConfigError,
    ContextId, Cx, DataNode, DataRow, DbAttribute, DeleteDeniedError, DeleteRule,
    EntityDescriptor, EntityResolver, Error, FaultError, FaultErrorKind, GraphChangeHandler,
    GraphDiff, IdentityError, IdentityErrorKind, JoinTable, MappingError, NodeTransaction,
    ObjectId, OperationKind, OperationResult, Outcome, PersistenceState, QueryError,
    QueryErrorKind, Qualifier, Relationship, Result, RowOperation, SelectQuery, ToMany, ToOne,
    TypeError, Value,
};
pub use cayenne_memory::{ForeignKey, MemoryNode, MemoryTransaction, NodeStats, TableDef};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use cayenne::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CayenneRuntime, CommitReport, Cx, DataNode, DataObject, DbAttribute, DeleteRule,
        EntityDescriptor, EntityResolver, Error, JoinTable, MemoryNode, ObjectContext, ObjectId,
        ObjectSelect, Outcome, PersistenceState, PrefetchSemantics, Qualifier, Relationship,
        Result, RuntimeConfig, SorterKind, Value,
    };
}
