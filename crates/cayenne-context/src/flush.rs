//! Commit execution.
//!
//! `commit_changes` plans the pending changes, orders them with the
//! configured [`OperationSorter`] and runs them in one node transaction.
//! Memory is only touched after the node committed: a failed commit leaves
//! every object, id and recorded change as it was.

use crate::callbacks::{CommitLogBuilder, LifecycleEvent};
use crate::context::ObjectContext;
use crate::object::DataObject;
use crate::unit_of_work::{ColumnValue, CommitPlan, CommitPlanner, OperationGraph, OperationRank, PlannedOperation};
use cayenne_cache::SnapshotChanges;
use cayenne_core::{
    CommitError, CommitErrorKind, ConfigError, Cx, DataNode, DataRow, EntityResolver, Error, FkSide,
    NO_VERSION, NodeTransaction, ObjectId, OperationKind, Outcome, PersistenceState, Result,
    RowOperation, ToOne, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Orders the operations of a commit.
///
/// Implementations must honor every dependency of the graph; they only
/// choose among operations that are ready at the same time.
pub trait OperationSorter: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn sort(&self, graph: OperationGraph, resolver: &EntityResolver) -> Result<Vec<PlannedOperation>>;
}

const fn phase(kind: OperationKind) -> u8 {
    match kind {
        OperationKind::Insert => 0,
        OperationKind::Update => 1,
        OperationKind::JoinInsert => 2,
        OperationKind::JoinDelete => 3,
        OperationKind::Delete => 4,
    }
}

/// Orders ready operations by phase, then by the entity foreign key graph:
/// master entities are inserted first and deleted last.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityOrderSorter;

impl EntityOrderSorter {
    /// Topological rank of every entity. Entities on a cycle are ranked
    /// by name once nothing else is ready.
    fn ranks(resolver: &EntityResolver) -> HashMap<String, u64> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = resolver.entity_dependencies();
        let mut ranks = HashMap::new();
        let mut next = 0;
        while !remaining.is_empty() {
            let mut ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, masters)| masters.iter().all(|m| !remaining.contains_key(m)))
                .map(|(entity, _)| *entity)
                .collect();
            if ready.is_empty() {
                match remaining.keys().next() {
                    Some(first) => ready.push(*first),
                    None => break,
                }
            }
            for entity in ready {
                remaining.remove(entity);
                ranks.insert(entity.to_string(), next);
                next += 1;
            }
        }
        ranks
    }
}

impl OperationSorter for EntityOrderSorter {
    fn name(&self) -> &'static str {
        "entity-order"
    }

    fn sort(&self, graph: OperationGraph, resolver: &EntityResolver) -> Result<Vec<PlannedOperation>> {
        let ranks = Self::ranks(resolver);
        let last = u64::try_from(ranks.len()).unwrap_or(u64::MAX);
        graph.into_sorted(|op| {
            let rank = ranks.get(&op.entity).copied().unwrap_or(last);
            let rank = match op.kind {
                OperationKind::Delete | OperationKind::JoinDelete => last - rank.min(last),
                _ => rank,
            };
            (phase(op.kind), rank, op.seq)
        })
    }
}

/// Orders ready operations by phase and registration order only, leaving
/// every foreign key constraint to the per-object dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectGraphSorter;

impl OperationSorter for ObjectGraphSorter {
    fn name(&self) -> &'static str {
        "object-graph"
    }

    fn sort(&self, graph: OperationGraph, _resolver: &EntityResolver) -> Result<Vec<PlannedOperation>> {
        graph.into_sorted(|op| -> OperationRank { (phase(op.kind), 0, op.seq) })
    }
}

/// Built-in sorters, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SorterKind {
    #[default]
    EntityOrder,
    ObjectGraph,
}

impl SorterKind {
    pub fn sorter(self) -> Arc<dyn OperationSorter> {
        match self {
            SorterKind::EntityOrder => Arc::new(EntityOrderSorter),
            SorterKind::ObjectGraph => Arc::new(ObjectGraphSorter),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SorterKind::EntityOrder => "entity-order",
            SorterKind::ObjectGraph => "object-graph",
        }
    }
}

impl FromStr for SorterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entity-order" | "entity" => Ok(SorterKind::EntityOrder),
            "object-graph" | "graph" => Ok(SorterKind::ObjectGraph),
            other => Err(Error::Config(ConfigError {
                key: None,
                message: format!("unknown commit sorter '{other}'"),
                source: None,
            })),
        }
    }
}

impl fmt::Display for SorterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub join_inserted: usize,
    pub join_deleted: usize,
    /// Executed operations, in order.
    pub operations: Vec<RowOperation>,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn total(&self) -> usize {
        self.operations.len()
    }
}

/// Old id, permanent id and inserted row of a NEW object.
type Replacement = (ObjectId, ObjectId, BTreeMap<String, Value>);

fn missing_key(id: &ObjectId, column: &str) -> Error {
    CommitError::new(
        CommitErrorKind::MissingGeneratedKey,
        format!("no value for key column '{column}' of {id}"),
    )
    .with_objects([id])
    .into()
}

fn resolve_column(value: &ColumnValue, keys: &HashMap<ObjectId, BTreeMap<String, Value>>) -> Result<Value> {
    match value {
        ColumnValue::Literal(v) => Ok(v.clone()),
        ColumnValue::Key { id, column } => keys
            .get(id)
            .and_then(|row| row.get(column))
            .filter(|v| !v.is_null())
            .or_else(|| id.key_value(column))
            .cloned()
            .ok_or_else(|| missing_key(id, column)),
    }
}

fn to_row_operation(planned: &PlannedOperation, keys: &HashMap<ObjectId, BTreeMap<String, Value>>) -> Result<RowOperation> {
    let mut op = RowOperation::new(planned.kind, planned.table.clone());
    op.id.clone_from(&planned.id);
    op.generated_keys.clone_from(&planned.generated_keys);
    for (column, value) in &planned.values {
        op.values.insert(column.clone(), resolve_column(value, keys)?);
    }
    for (column, value) in &planned.qualifier {
        op.qualifier.insert(column.clone(), resolve_column(value, keys)?);
    }
    Ok(op)
}

async fn rollback_quietly<T: NodeTransaction>(cx: &Cx, tx: T) {
    if let Outcome::Err(e) = tx.rollback(cx).await {
        tracing::warn!(error = %e, "Rollback after failed commit failed");
    }
}

impl<N: DataNode> ObjectContext<N> {
    /// Write every pending change to the data node in one transaction.
    ///
    /// On success NEW objects receive permanent ids, dirty objects become
    /// COMMITTED, deleted objects leave the context and the snapshot cache
    /// notifies the other contexts. On failure nothing in memory changes.
    #[tracing::instrument(level = "info", skip(self, cx), fields(context = %self.id()))]
    pub async fn commit_changes(&mut self, cx: &Cx) -> Outcome<CommitReport, Error> {
        self.sync_snapshot_events();
        if !self.has_changes() {
            tracing::debug!("Nothing to commit");
            return Outcome::Ok(CommitReport::default());
        }
        for id in self.store.ids_in_state(PersistenceState::Modified) {
            try_result!(self.fire_lifecycle(LifecycleEvent::PreUpdate, &id));
        }
        let plan = try_result!(
            CommitPlanner::new(self.resolver(), &self.store, &self.log)
                .plan(self.config().sorter.as_ref())
        );
        try_result!(self.check_snapshot_versions());

        let node = Arc::clone(self.data_node());
        let mut tx = try_outcome!(node.begin(cx).await);
        let (report, replacements) = match self.execute(cx, &mut tx, &plan).await {
            Outcome::Ok(done) => done,
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Commit failed, rolling back");
                rollback_quietly(cx, tx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                rollback_quietly(cx, tx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                rollback_quietly(cx, tx).await;
                return Outcome::Panicked(p);
            }
        };
        try_outcome!(tx.commit(cx).await);

        let commit_log = self
            .callbacks
            .has_commit_listeners()
            .then(|| CommitLogBuilder::collect(&*self, &plan));
        let removed: Vec<DataObject> = if self.callbacks.listens(LifecycleEvent::PostRemove) {
            plan.deleted.iter().filter_map(|id| self.store.node(id).cloned()).collect()
        } else {
            Vec::new()
        };
        let persisted = plan.inserted.clone();
        let updated = plan.updated.clone();

        self.apply_commit(plan, replacements);
        tracing::info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            join_inserted = report.join_inserted,
            join_deleted = report.join_deleted,
            "Committed changes"
        );

        for id in &persisted {
            let id = self.store.resolve_id(id);
            self.notify_lifecycle(LifecycleEvent::PostPersist, &id);
        }
        for id in &updated {
            let id = self.store.resolve_id(id);
            self.notify_lifecycle(LifecycleEvent::PostUpdate, &id);
        }
        for object in &removed {
            self.notify_detached(LifecycleEvent::PostRemove, object);
        }
        if let Some(builder) = commit_log {
            let log = builder.finish(self);
            self.notify_commit(&log);
        }
        Outcome::Ok(report)
    }

    async fn execute<T: NodeTransaction>(
        &self,
        cx: &Cx,
        tx: &mut T,
        plan: &CommitPlan,
    ) -> Outcome<(CommitReport, Vec<Replacement>), Error> {
        let mut keys: HashMap<ObjectId, BTreeMap<String, Value>> = HashMap::new();
        let mut report = CommitReport::default();

        for planned in &plan.operations {
            let op = try_result!(to_row_operation(planned, &keys));
            tracing::trace!(kind = op.kind.as_str(), table = %op.table, "Executing row operation");
            let result = try_outcome!(tx.perform(cx, &op).await);
            match op.kind {
                OperationKind::Insert => {
                    let mut row = op.values.clone();
                    row.extend(result.generated_keys);
                    for column in &op.generated_keys {
                        if row.get(column).is_none_or(Value::is_null) {
                            let id = op.id.clone().unwrap_or_else(|| ObjectId::temporary(planned.entity.clone()));
                            return Outcome::Err(missing_key(&id, column));
                        }
                    }
                    if let Some(id) = &op.id {
                        keys.insert(id.clone(), row);
                    }
                    report.inserted += 1;
                }
                OperationKind::Update | OperationKind::Delete => {
                    if result.rows_affected == 0 && planned.optimistic {
                        let objects: Vec<&ObjectId> = op.id.iter().collect();
                        return Outcome::Err(
                            CommitError::new(
                                CommitErrorKind::OptimisticLock,
                                format!(
                                    "{} on '{}' matched no row; it was changed or deleted concurrently",
                                    op.kind.as_str(),
                                    op.table
                                ),
                            )
                            .with_objects(objects)
                            .into(),
                        );
                    }
                    if op.kind == OperationKind::Update {
                        report.updated += 1;
                    } else {
                        report.deleted += 1;
                    }
                }
                OperationKind::JoinInsert => report.join_inserted += 1,
                OperationKind::JoinDelete => report.join_deleted += 1,
            }
            report.operations.push(op);
        }

        let mut replacements = Vec::with_capacity(plan.inserted.len());
        for id in &plan.inserted {
            let entity = try_result!(self.resolver().entity(id.entity()));
            let Some(row) = keys.remove(id) else {
                return Outcome::Err(missing_key(id, "*"));
            };
            let data_row = DataRow::from_values(row);
            let Some(permanent) = entity.id_from_row(&data_row) else {
                let column = entity.pk_columns().next().unwrap_or("*");
                return Outcome::Err(missing_key(id, column));
            };
            replacements.push((id.clone(), permanent, data_row.into_values()));
        }
        Outcome::Ok((report, replacements))
    }

    /// Fail fast when another context committed a newer version of an
    /// optimistically locked object this context is about to write.
    fn check_snapshot_versions(&self) -> Result<()> {
        if !self.config().validate_optimistic_versions {
            return Ok(());
        }
        let mut stale = Vec::new();
        let mut dirty = self.store.ids_in_state(PersistenceState::Modified);
        dirty.extend(self.store.ids_in_state(PersistenceState::Deleted));
        for id in dirty {
            let Ok(entity) = self.resolver().entity(id.entity()) else {
                continue;
            };
            if !entity.optimistic_locking {
                continue;
            }
            let Some(object) = self.store.node(&id) else {
                continue;
            };
            let version = object.snapshot_version();
            if version != NO_VERSION && self.cache().cached_version(&id) > version {
                stale.push(id);
            }
        }
        if stale.is_empty() {
            return Ok(());
        }
        Err(CommitError::new(
            CommitErrorKind::OptimisticLock,
            format!(
                "{} object(s) changed by another context since they were read",
                stale.len()
            ),
        )
        .with_objects(stale)
        .into())
    }

    fn apply_commit(&mut self, plan: CommitPlan, replacements: Vec<Replacement>) {
        let resolver = Arc::clone(self.resolver());
        for (old, new, row) in replacements {
            if old.is_temporary() {
                if let Some(key) = new.id_snapshot() {
                    for (column, value) in key {
                        if let Err(e) = old.set_replacement_value(column.clone(), value.clone()) {
                            tracing::warn!(object = %old, error = %e, "Replacement key not recorded");
                            debug_assert!(false, "replacement key not recorded: {e}");
                        }
                    }
                }
            }
            if let Some(object) = self.store.node_mut(&old) {
                object.values_mut().extend(row);
            }
            if old != new {
                self.store.process_id_change(&old, &new);
                self.log.process_id_change(&old, &new);
            }
        }

        let committed: Vec<ObjectId> = plan
            .inserted
            .iter()
            .chain(&plan.updated)
            .chain(&plan.unchanged)
            .map(|id| self.store.resolve_id(id))
            .collect();
        for id in &committed {
            self.write_back_foreign_keys(&resolver, id);
            self.store.transition(id, PersistenceState::Committed);
        }

        let mut changes = SnapshotChanges::default();
        for id in plan.inserted.iter().chain(&plan.updated) {
            let id = self.store.resolve_id(id);
            if let Some(object) = self.store.node(&id) {
                let row = DataRow::from_values(object.values().clone());
                changes.updated.push((id, row));
            }
        }
        for id in &plan.deleted {
            self.store.unregister(id);
            changes.deleted.push(id.clone());
        }
        changes.indirectly_modified = plan
            .indirectly_modified
            .iter()
            .map(|id| self.store.resolve_id(id))
            .filter(|id| !id.is_temporary())
            .collect();

        let event = self.cache().process_snapshot_changes(Some(self.id()), changes);
        for (id, row) in &event.updated {
            if let Some(object) = self.store.node_mut(id) {
                object.set_snapshot_version(row.version());
            }
        }
        self.log.reset();
    }

    /// Copy resolved to-one targets into the foreign key columns and fill
    /// unset columns with NULL.
    fn write_back_foreign_keys(&mut self, resolver: &EntityResolver, id: &ObjectId) {
        let Ok(entity) = resolver.entity(id.entity()) else {
            return;
        };
        let Some(object) = self.store.node(id) else {
            return;
        };
        let mut updates = Vec::new();
        for rel in entity
            .relationships()
            .iter()
            .filter(|rel| !rel.to_many && rel.fk_side() == FkSide::Source)
        {
            if let Some(ToOne::Resolved(target)) = object.to_one(&rel.name) {
                for join in &rel.joins {
                    let value = target
                        .as_ref()
                        .map_or(Value::Null, |t| self.column_value(t, &join.target));
                    updates.push((join.source.clone(), value));
                }
            }
        }
        let Some(object) = self.store.node_mut(id) else {
            return;
        };
        let values = object.values_mut();
        values.extend(updates);
        for attribute in entity.attributes() {
            values.entry(attribute.name.clone()).or_insert(Value::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cayenne_core::{DbAttribute, EntityDescriptor, Relationship};

    fn resolver() -> EntityResolver {
        EntityResolver::new([
            EntityDescriptor::new("Artist", "artist")
                .attribute(DbAttribute::generated_pk("id"))
                .relationship(Relationship::to_many("paintings", "Painting").join("id", "artist_id").reverse("artist")),
            EntityDescriptor::new("Painting", "painting")
                .attribute(DbAttribute::generated_pk("id"))
                .attribute(DbAttribute::new("artist_id"))
                .relationship(Relationship::to_one("artist", "Artist").join("artist_id", "id").reverse("paintings")),
        ])
        .unwrap()
    }

    #[test]
    fn entity_ranks_put_masters_first() {
        let ranks = EntityOrderSorter::ranks(&resolver());
        assert!(ranks["Artist"] < ranks["Painting"]);
    }

    #[test]
    fn sorter_kind_parses_names() {
        assert_eq!("entity-order".parse::<SorterKind>().unwrap(), SorterKind::EntityOrder);
        assert_eq!(" Object-Graph ".parse::<SorterKind>().unwrap(), SorterKind::ObjectGraph);
        assert!(matches!("random".parse::<SorterKind>(), Err(Error::Config(_))));
        assert_eq!(SorterKind::ObjectGraph.sorter().name(), "object-graph");
    }

    #[test]
    fn key_columns_resolve_from_inserted_rows() {
        let temp = ObjectId::temporary("Artist");
        let mut keys = HashMap::new();
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), Value::BigInt(7));
        keys.insert(temp.clone(), row);
        let value = ColumnValue::Key {
            id: temp,
            column: "id".into(),
        };
        assert_eq!(resolve_column(&value, &keys).unwrap(), Value::BigInt(7));

        let unknown = ColumnValue::Key {
            id: ObjectId::temporary("Artist"),
            column: "id".into(),
        };
        let err = resolve_column(&unknown, &keys).unwrap_err();
        assert_eq!(err.commit_kind(), Some(CommitErrorKind::MissingGeneratedKey));
    }
}
