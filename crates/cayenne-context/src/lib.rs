//! Object contexts for the Cayenne object graph engine.
//!
//! `cayenne-context` is the **unit-of-work layer**. An [`ObjectContext`]
//! owns the objects of one unit of work and turns their changes into
//! ordered row operations on a [`DataNode`](cayenne_core::DataNode).
//!
//! # Role In The Architecture
//!
//! - **Identity map**: [`ObjectStore`] keeps exactly one instance per id.
//! - **Change log**: [`ChangeLog`] records every mutation as a replayable diff.
//! - **Faults**: relationships and HOLLOW objects load on first access.
//! - **Commit**: [`CommitPlanner`] builds row operations, an
//!   [`OperationSorter`] orders them, and the node runs them in one
//!   transaction.
//! - **Child contexts**: a child replays its changes onto its parent, which
//!   commits them as its own.
//! - **Callbacks**: per-entity lifecycle callbacks and commit listeners.
//! - **Snapshot cache**: committed rows are published to the shared
//!   [`DataRowStore`](cayenne_cache::DataRowStore) and reach other contexts
//!   as events.
//!
//! # Example
//!
//! ```ignore
//! let mut context = ObjectContext::new(node, resolver, cache, ContextConfig::default());
//!
//! let artist = context.new_object("Artist")?;
//! context.write_property(&artist, "name", Value::Text("Monet".into()))?;
//!
//! let painting = context.new_object("Painting")?;
//! context.set_to_one(&painting, "artist", Some(&artist))?;
//!
//! // INSERT artist, then INSERT painting with the generated artist key
//! let report = context.commit_changes(&cx).await;
//! ```

/// Unwrap an `Outcome`, returning early on anything but `Ok`.
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            ::asupersync::Outcome::Ok(value) => value,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod callbacks;
pub mod change_log;
pub mod context;
mod delete;
mod fault_resolver;
pub mod flush;
mod nested;
pub mod object;
pub mod object_store;
pub mod prefetch;
pub mod unit_of_work;

pub use callbacks::{
    AttributeChange, ChangeKind, CommitLog, ContextCallbacks, LifecycleEvent, ObjectChange,
    ToManyChange, ToOneChange,
};
pub use change_log::{ChangeLog, FlattenedChange};
pub use context::{ContextConfig, DEFAULT_MAX_ID_QUALIFIER_SIZE, ObjectContext, SharedContext};
pub use flush::{CommitReport, EntityOrderSorter, ObjectGraphSorter, OperationSorter, SorterKind};
pub use object::DataObject;
pub use object_store::ObjectStore;
pub use prefetch::{ObjectSelect, PrefetchSemantics, PrefetchSpec};
pub use unit_of_work::{
    ColumnValue, CommitPlan, CommitPlanner, OperationGraph, OperationRank, PlannedOperation,
};
