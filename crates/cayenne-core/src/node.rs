//! Data node traits.
//!
//! A data node executes structural selects and row operations against a
//! store. It owns everything dialect-specific; the object graph layer only
//! speaks in [`SelectQuery`] and [`RowOperation`] values.
//!
//! All operations are async and take a `Cx` context for cancellation support.

use crate::data_row::DataRow;
use crate::entity::Join;
use crate::error::Error;
use crate::object_id::ObjectId;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::collections::BTreeMap;

/// Column prefix under which a join table select reports the join table's
/// source-side columns, e.g. `__source.artist_id`.
pub const JOIN_SOURCE_PREFIX: &str = "__source";

/// Row filter of a [`SelectQuery`].
#[derive(Debug, Clone, PartialEq)]
pub enum Qualifier {
    /// Every row.
    All,
    /// Column equality; all pairs must match. NULL matches NULL.
    Match(BTreeMap<String, Value>),
    /// Tuple IN list: `(columns...) IN (keys...)`.
    In {
        columns: Vec<String>,
        keys: Vec<Vec<Value>>,
    },
    /// Target rows linked through a join table whose `source_columns`
    /// match one of `keys`. Matching rows carry the join table source
    /// columns under [`JOIN_SOURCE_PREFIX`].
    ThroughJoinTable {
        join_table: String,
        /// Join table column -> target column.
        target_joins: Vec<Join>,
        source_columns: Vec<String>,
        keys: Vec<Vec<Value>>,
    },
}

impl Qualifier {
    /// Single-column IN list.
    pub fn in_values(column: impl Into<String>, values: Vec<Value>) -> Self {
        Qualifier::In {
            columns: vec![column.into()],
            keys: values.into_iter().map(|v| vec![v]).collect(),
        }
    }

    /// Evaluate a row-local qualifier. Join table qualifiers need the join
    /// table and are evaluated by the node; they report `false` here.
    pub fn matches(&self, row: &DataRow) -> bool {
        match self {
            Qualifier::All => true,
            Qualifier::Match(pairs) => pairs.iter().all(|(column, expected)| {
                let actual = row.get(column).unwrap_or(&Value::Null);
                actual.key_eq(expected) || (actual.is_null() && expected.is_null())
            }),
            Qualifier::In { columns, keys } => keys.iter().any(|key| {
                columns.iter().zip(key).all(|(column, expected)| {
                    row.get(column)
                        .is_some_and(|actual| !actual.is_null() && actual.key_eq(expected))
                })
            }),
            Qualifier::ThroughJoinTable { .. } => false,
        }
    }
}

/// A related table fetched in the same select (joint prefetch).
///
/// Columns of the joined row are reported as `path.column`. Rows without a
/// match are kept with NULL joined columns.
#[derive(Debug, Clone, PartialEq)]
pub struct JointSpec {
    pub path: String,
    pub table: String,
    /// Base column -> joined table column.
    pub joins: Vec<Join>,
}

/// Structural select against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub entity: String,
    pub table: String,
    pub qualifier: Qualifier,
    /// Projection; `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub joints: Vec<JointSpec>,
}

impl SelectQuery {
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            qualifier: Qualifier::All,
            columns: None,
            joints: Vec::new(),
        }
    }

    pub fn qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = qualifier;
        self
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn joint(mut self, joint: JointSpec) -> Self {
        self.joints.push(joint);
        self
    }
}

/// Kind of row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Insert,
    Update,
    JoinInsert,
    JoinDelete,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::JoinInsert => "INSERT JOIN",
            OperationKind::JoinDelete => "DELETE JOIN",
            OperationKind::Delete => "DELETE",
        }
    }
}

/// A single row-level write.
///
/// `values` holds inserted or updated columns, `qualifier` the WHERE
/// equality pairs of updates and deletes (NULL meaning `IS NULL`).
#[derive(Debug, Clone, PartialEq)]
pub struct RowOperation {
    pub kind: OperationKind,
    pub table: String,
    /// Object the row belongs to; `None` for join rows.
    pub id: Option<ObjectId>,
    pub values: BTreeMap<String, Value>,
    pub qualifier: BTreeMap<String, Value>,
    /// Columns the node must generate on insert.
    pub generated_keys: Vec<String>,
}

impl RowOperation {
    pub fn new(kind: OperationKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            id: None,
            values: BTreeMap::new(),
            qualifier: BTreeMap::new(),
            generated_keys: Vec::new(),
        }
    }
}

/// What the node reports back for one row operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationResult {
    pub rows_affected: u64,
    /// Values of the generated key columns, for inserts.
    pub generated_keys: BTreeMap<String, Value>,
}

/// A store capable of selecting rows and running write transactions.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
pub trait DataNode: Send + Sync {
    /// The transaction type returned by this node.
    type Tx<'node>: NodeTransaction
    where
        Self: 'node;

    /// Node name used in logs.
    fn name(&self) -> &str;

    /// Run a select and return all rows.
    fn select(
        &self,
        cx: &Cx,
        query: &SelectQuery,
    ) -> impl Future<Output = Outcome<Vec<DataRow>, Error>> + Send;

    /// Begin a write transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send;
}

/// Write transaction of a [`DataNode`].
///
/// Dropping a transaction without committing discards its operations.
pub trait NodeTransaction: Send {
    /// Execute one row operation.
    fn perform(
        &mut self,
        cx: &Cx,
        op: &RowOperation,
    ) -> impl Future<Output = Outcome<OperationResult, Error>> + Send;

    /// Commit the transaction, making all operations visible.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Discard all operations of the transaction.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
