//! `DataNode` implementation over the in-memory tables.
//!
//! All work happens synchronously under one mutex; the returned futures
//! only hand back the result. A transaction works on a private copy of the
//! tables and swaps it in on commit, so concurrent transactions follow
//! last-commit-wins.

use crate::table::{Database, ForeignKey, TableDef, query_error};
use cayenne_core::{
    Cx, DataNode, DataRow, EntityResolver, Error, NodeTransaction, OperationKind,
    OperationResult, Outcome, QueryErrorKind, Result, RowOperation, SelectQuery, Value,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Counters of the work a node did, for asserting query counts in tests.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub selects: usize,
    pub queries: Vec<SelectQuery>,
    /// Every performed row operation, including rolled back ones.
    pub operations: Vec<RowOperation>,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    db: Database,
    stats: NodeStats,
    fail_on: Option<(OperationKind, String)>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory relational store.
///
/// Cloning yields another handle to the same tables.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryNode {
    /// Node without tables.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Node with a table for every entity and join table of the mapping,
    /// and a foreign key for every relationship.
    pub fn from_resolver(name: impl Into<String>, resolver: &EntityResolver) -> Self {
        let node = Self::new(name);
        lock(&node.state).db = Database::from_resolver(resolver);
        node
    }

    pub fn define_table(&self, def: TableDef) {
        lock(&self.state).db.add_table(def);
    }

    pub fn define_foreign_key(&self, fk: ForeignKey) {
        lock(&self.state).db.add_foreign_key(fk);
    }

    pub fn stats(&self) -> NodeStats {
        lock(&self.state).stats.clone()
    }

    pub fn reset_stats(&self) {
        lock(&self.state).stats = NodeStats::default();
    }

    /// Fail every following operation of `kind` on `table`.
    pub fn fail_on(&self, kind: OperationKind, table: impl Into<String>) {
        lock(&self.state).fail_on = Some((kind, table.into()));
    }

    pub fn clear_failure(&self) {
        lock(&self.state).fail_on = None;
    }

    /// Committed rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<DataRow> {
        lock(&self.state).db.rows(table)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    /// Insert a row outside any transaction, generating the table's
    /// auto-increment columns when absent.
    pub fn insert_row(&self, table: &str, row: DataRow) -> Result<BTreeMap<String, Value>> {
        let mut state = lock(&self.state);
        let generated = state.db.generated_columns(table);
        let result = state.db.insert(table, row.into_values(), &generated)?;
        Ok(result.generated_keys)
    }

    /// Update rows outside any transaction, as another application would.
    pub fn update_rows(
        &self,
        table: &str,
        qualifier: &BTreeMap<String, Value>,
        values: &BTreeMap<String, Value>,
    ) -> Result<u64> {
        lock(&self.state).db.update(table, qualifier, values)
    }

    /// Delete rows outside any transaction.
    pub fn delete_rows(&self, table: &str, qualifier: &BTreeMap<String, Value>) -> Result<u64> {
        lock(&self.state).db.delete(table, qualifier)
    }
}

impl DataNode for MemoryNode {
    type Tx<'node>
        = MemoryTransaction
    where
        Self: 'node;

    fn name(&self) -> &str {
        &self.name
    }

    fn select(
        &self,
        _cx: &Cx,
        query: &SelectQuery,
    ) -> impl Future<Output = Outcome<Vec<DataRow>, Error>> + Send {
        let result = {
            let mut state = lock(&self.state);
            state.stats.selects += 1;
            state.stats.queries.push(query.clone());
            state.db.select(query)
        };
        let node = self.name.clone();
        let table = query.table.clone();
        async move {
            match result {
                Ok(rows) => {
                    tracing::trace!(node = %node, table = %table, rows = rows.len(), "Select");
                    Outcome::Ok(rows)
                }
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let working = lock(&self.state).db.clone();
        let tx = MemoryTransaction {
            state: Arc::clone(&self.state),
            working,
            performed: 0,
        };
        async move { Outcome::Ok(tx) }
    }
}

/// Transaction of a [`MemoryNode`].
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    working: Database,
    performed: usize,
}

impl MemoryTransaction {
    fn apply(&mut self, op: &RowOperation) -> Result<OperationResult> {
        {
            let mut state = lock(&self.state);
            state.stats.operations.push(op.clone());
            if let Some((kind, table)) = &state.fail_on {
                if *kind == op.kind && *table == op.table {
                    return Err(query_error(
                        QueryErrorKind::Database,
                        &op.table,
                        format!("injected failure on {} {}", op.kind.as_str(), op.table),
                    ));
                }
            }
        }
        self.performed += 1;
        self.working.perform(op)
    }
}

impl NodeTransaction for MemoryTransaction {
    fn perform(
        &mut self,
        _cx: &Cx,
        op: &RowOperation,
    ) -> impl Future<Output = Outcome<OperationResult, Error>> + Send {
        let result = self.apply(op);
        async move {
            match result {
                Ok(result) => Outcome::Ok(result),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = lock(&self.state);
        state.db = self.working;
        state.stats.commits += 1;
        drop(state);
        tracing::debug!(operations = self.performed, "Memory transaction committed");
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        lock(&self.state).stats.rollbacks += 1;
        tracing::debug!(operations = self.performed, "Memory transaction rolled back");
        async { Outcome::Ok(()) }
    }
}
