//! Commit planning.
//!
//! The planner turns the dirty objects and pending join rows of a context
//! into row operations, links them by foreign key dependencies and hands
//! the resulting [`OperationGraph`] to an [`OperationSorter`].
//!
//! Dependencies that close a cycle may carry a remedy. A nullable foreign
//! key between two inserts is written as NULL and set by a follow-up
//! update; a nullable foreign key between two deletes is cleared by an
//! update ahead of the deletes. A cycle without any remedy fails the commit
//! before a single row is written.

use crate::change_log::ChangeLog;
use crate::flush::OperationSorter;
use crate::object::DataObject;
use crate::object_store::ObjectStore;
use cayenne_core::{
    CommitError, CommitErrorKind, EntityDescriptor, EntityResolver, FkSide, ObjectId,
    OperationKind, PersistenceState, Relationship, Result, ToOne, Value,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// Value of a planned column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Literal(Value),
    /// Column of another object's row, known once that row is inserted.
    Key { id: ObjectId, column: String },
}

/// A row operation whose key values may still be pending.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
    pub kind: OperationKind,
    /// Entity of the row; for join rows, the entity declaring the
    /// relationship.
    pub entity: String,
    pub table: String,
    pub id: Option<ObjectId>,
    pub values: BTreeMap<String, ColumnValue>,
    pub qualifier: BTreeMap<String, ColumnValue>,
    pub generated_keys: Vec<String>,
    /// Registration order of the object the row belongs to.
    pub seq: u64,
    /// Whether the qualifier carries optimistic locking columns.
    pub optimistic: bool,
}

impl PlannedOperation {
    fn new(kind: OperationKind, entity: &EntityDescriptor, id: ObjectId, seq: u64) -> Self {
        Self {
            kind,
            entity: entity.name.clone(),
            table: entity.table.clone(),
            id: Some(id),
            values: BTreeMap::new(),
            qualifier: BTreeMap::new(),
            generated_keys: Vec::new(),
            seq,
            optimistic: false,
        }
    }
}

/// Sort priority of an operation among the ones whose dependencies are
/// satisfied: `(phase, rank, registration order)`, lowest first.
pub type OperationRank = (u8, u64, u64);

#[derive(Debug, Clone)]
enum Remedy {
    /// `after` is an insert: write NULL into the columns and set them with
    /// an update once `before` ran.
    DeferColumns {
        columns: Vec<String>,
        key: BTreeMap<String, ColumnValue>,
    },
    /// `before` is a delete: clear the columns with an update ahead of
    /// `after`.
    ClearColumns {
        columns: Vec<String>,
        key: BTreeMap<String, ColumnValue>,
    },
}

#[derive(Debug, Clone)]
struct Dependency {
    before: usize,
    after: usize,
    remedy: Option<Remedy>,
    active: bool,
}

/// Row operations and the order constraints between them.
#[derive(Debug, Default)]
pub struct OperationGraph {
    ops: Vec<PlannedOperation>,
    deps: Vec<Dependency>,
}

impl OperationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: PlannedOperation) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    /// Require `before` to run ahead of `after`.
    pub fn depend(&mut self, before: usize, after: usize) {
        self.push_dependency(before, after, None);
    }

    fn push_dependency(&mut self, before: usize, after: usize, remedy: Option<Remedy>) {
        self.deps.push(Dependency {
            before,
            after,
            remedy,
            active: true,
        });
    }

    pub fn operations(&self) -> &[PlannedOperation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Topological order honoring every dependency, ties broken by `rank`.
    ///
    /// Cycles are broken through their remedies, one dependency per
    /// strongly connected component and round.
    pub fn into_sorted(mut self, rank: impl Fn(&PlannedOperation) -> OperationRank) -> Result<Vec<PlannedOperation>> {
        loop {
            let stuck = match self.try_order(&rank) {
                Ok(order) => {
                    let mut slots: Vec<Option<PlannedOperation>> =
                        self.ops.into_iter().map(Some).collect();
                    return Ok(order
                        .into_iter()
                        .filter_map(|i| slots[i].take())
                        .collect());
                }
                Err(stuck) => stuck,
            };
            for component in self.cycles(&stuck) {
                if !self.break_cycle(&component) {
                    let objects: Vec<String> = component
                        .iter()
                        .filter_map(|&i| self.ops[i].id.as_ref().map(ToString::to_string))
                        .collect();
                    return Err(CommitError::new(
                        CommitErrorKind::CyclicDependency,
                        format!(
                            "foreign key cycle over {} rows has no nullable column to break it",
                            component.len()
                        ),
                    )
                    .with_objects(objects)
                    .into());
                }
            }
        }
    }

    /// Kahn's algorithm over the active dependencies. On failure returns
    /// the operations that could not be placed.
    fn try_order(&self, rank: &impl Fn(&PlannedOperation) -> OperationRank) -> std::result::Result<Vec<usize>, Vec<usize>> {
        let n = self.ops.len();
        let mut indegree = vec![0_usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for dep in self.deps.iter().filter(|d| d.active) {
            indegree[dep.after] += 1;
            successors[dep.before].push(dep.after);
        }
        let mut ready: BinaryHeap<Reverse<(OperationRank, usize)>> = (0..n)
            .filter(|&i| indegree[i] == 0)
            .map(|i| Reverse((rank(&self.ops[i]), i)))
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, i))) = ready.pop() {
            order.push(i);
            for &next in &successors[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse((rank(&self.ops[next]), next)));
                }
            }
        }
        if order.len() == n {
            Ok(order)
        } else {
            Err((0..n).filter(|&i| indegree[i] > 0).collect())
        }
    }

    /// Strongly connected components among `nodes` that contain a cycle.
    fn cycles(&self, nodes: &[usize]) -> Vec<Vec<usize>> {
        let members: HashSet<usize> = nodes.iter().copied().collect();
        let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut self_loops = HashSet::new();
        for dep in self.deps.iter().filter(|d| d.active) {
            if members.contains(&dep.before) && members.contains(&dep.after) {
                edges.entry(dep.before).or_default().push(dep.after);
                if dep.before == dep.after {
                    self_loops.insert(dep.before);
                }
            }
        }
        strongly_connected(nodes, &edges)
            .into_iter()
            .filter(|c| c.len() > 1 || self_loops.contains(&c[0]))
            .collect()
    }

    /// Apply the remedy of the first breakable dependency inside a
    /// component. Returns `false` when none is breakable.
    fn break_cycle(&mut self, component: &[usize]) -> bool {
        let inside: HashSet<usize> = component.iter().copied().collect();
        let Some(index) = self.deps.iter().position(|d| {
            d.active && d.remedy.is_some() && inside.contains(&d.before) && inside.contains(&d.after)
        }) else {
            return false;
        };
        self.deps[index].active = false;
        let Dependency {
            before,
            after,
            remedy,
            ..
        } = self.deps[index].clone();
        match remedy {
            Some(Remedy::DeferColumns { columns, key }) => {
                let insert = &mut self.ops[after];
                let mut values = BTreeMap::new();
                for column in columns {
                    if let Some(value) = insert
                        .values
                        .insert(column.clone(), ColumnValue::Literal(Value::Null))
                    {
                        values.insert(column, value);
                    }
                }
                let update = PlannedOperation {
                    kind: OperationKind::Update,
                    values,
                    qualifier: key,
                    generated_keys: Vec::new(),
                    optimistic: false,
                    ..insert.clone()
                };
                tracing::debug!(
                    table = %update.table,
                    columns = update.values.len(),
                    "Deferring foreign key to a follow-up update"
                );
                let index = self.add(update);
                self.depend(after, index);
                self.depend(before, index);
            }
            Some(Remedy::ClearColumns { columns, key }) => {
                let delete = &mut self.ops[before];
                for column in &columns {
                    delete.qualifier.remove(column);
                }
                let update = PlannedOperation {
                    kind: OperationKind::Update,
                    values: columns
                        .into_iter()
                        .map(|c| (c, ColumnValue::Literal(Value::Null)))
                        .collect(),
                    qualifier: key,
                    generated_keys: Vec::new(),
                    optimistic: false,
                    ..delete.clone()
                };
                tracing::debug!(table = %update.table, "Clearing foreign key ahead of delete");
                let index = self.add(update);
                self.depend(index, after);
                self.depend(index, before);
            }
            None => {}
        }
        true
    }
}

/// Iterative Tarjan over the subgraph of `nodes`.
fn strongly_connected(nodes: &[usize], edges: &HashMap<usize, Vec<usize>>) -> Vec<Vec<usize>> {
    let mut index: HashMap<usize, usize> = HashMap::new();
    let mut low: HashMap<usize, usize> = HashMap::new();
    let mut on_stack = HashSet::new();
    let mut stack = Vec::new();
    let mut components = Vec::new();
    let mut next = 0;

    for &start in nodes {
        if index.contains_key(&start) {
            continue;
        }
        index.insert(start, next);
        low.insert(start, next);
        next += 1;
        stack.push(start);
        on_stack.insert(start);
        let mut work = vec![(start, 0_usize)];

        while let Some(&(node, position)) = work.last() {
            let successors = edges.get(&node).map_or(&[][..], Vec::as_slice);
            if let Some(&succ) = successors.get(position) {
                if let Some(top) = work.last_mut() {
                    top.1 += 1;
                }
                if let Some(&succ_index) = index.get(&succ) {
                    if on_stack.contains(&succ) {
                        let current = low[&node];
                        low.insert(node, current.min(succ_index));
                    }
                } else {
                    index.insert(succ, next);
                    low.insert(succ, next);
                    next += 1;
                    stack.push(succ);
                    on_stack.insert(succ);
                    work.push((succ, 0));
                }
                continue;
            }
            work.pop();
            let node_low = low[&node];
            if let Some(&(parent, _)) = work.last() {
                let parent_low = low[&parent];
                low.insert(parent, parent_low.min(node_low));
            }
            if node_low == index[&node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack.remove(&member);
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                component.sort_unstable();
                components.push(component);
            }
        }
    }
    components
}

/// Target named by the committed foreign key values of a source-side
/// to-one relationship.
pub(crate) fn foreign_key_target(object: &DataObject, rel: &Relationship) -> Option<ObjectId> {
    let mut key = BTreeMap::new();
    for join in &rel.joins {
        let value = object.value(&join.source)?;
        if value.is_null() {
            return None;
        }
        key.insert(join.target.clone(), value.clone());
    }
    Some(ObjectId::permanent(rel.target.clone(), key))
}

fn source_to_ones(entity: &EntityDescriptor) -> impl Iterator<Item = &Relationship> {
    entity
        .relationships()
        .iter()
        .filter(|rel| !rel.to_many && rel.fk_side() == FkSide::Source)
}

/// Operations of one commit, in execution order.
#[derive(Debug, Clone, Default)]
pub struct CommitPlan {
    pub operations: Vec<PlannedOperation>,
    pub inserted: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
    /// MODIFIED objects whose row did not change.
    pub unchanged: Vec<ObjectId>,
    /// Objects whose to-many relationships changed through rows of other
    /// objects or join rows.
    pub indirectly_modified: Vec<ObjectId>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// An insert waiting for the insert of the object it references.
struct InsertLink<'r> {
    target: ObjectId,
    source: ObjectId,
    rel: &'r Relationship,
}

/// Builds a [`CommitPlan`] from the state of a context.
pub struct CommitPlanner<'a> {
    resolver: &'a EntityResolver,
    store: &'a ObjectStore,
    log: &'a ChangeLog,
}

impl<'a> CommitPlanner<'a> {
    pub fn new(resolver: &'a EntityResolver, store: &'a ObjectStore, log: &'a ChangeLog) -> Self {
        Self {
            resolver,
            store,
            log,
        }
    }

    /// Value of a column of a related row.
    fn key_value(&self, id: &ObjectId, column: &str) -> ColumnValue {
        if id.is_temporary() {
            return ColumnValue::Key {
                id: id.clone(),
                column: column.to_string(),
            };
        }
        let value = id
            .key_value(column)
            .or_else(|| self.store.node(id).and_then(|o| o.value(column)))
            .cloned()
            .unwrap_or(Value::Null);
        ColumnValue::Literal(value)
    }

    /// Primary key qualifier, plus the original values of the locking
    /// columns for optimistically locked entities.
    fn row_qualifier(&self, entity: &EntityDescriptor, object: &DataObject) -> (BTreeMap<String, ColumnValue>, bool) {
        let mut qualifier = BTreeMap::new();
        for column in entity.pk_columns() {
            qualifier.insert(column.to_string(), self.key_value(object.id(), column));
        }
        if !entity.optimistic_locking {
            return (qualifier, false);
        }
        let originals = self.log.original_values(object.id());
        for column in entity.locking_columns() {
            let original = originals
                .and_then(|o| o.get(column))
                .or_else(|| object.value(column))
                .cloned()
                .unwrap_or(Value::Null);
            qualifier.insert(column.to_string(), ColumnValue::Literal(original));
        }
        (qualifier, true)
    }

    fn key_of(&self, entity: &EntityDescriptor, id: &ObjectId) -> BTreeMap<String, ColumnValue> {
        entity
            .pk_columns()
            .map(|c| (c.to_string(), self.key_value(id, c)))
            .collect()
    }

    fn plan_insert(&self, entity: &'a EntityDescriptor, object: &DataObject) -> Result<(PlannedOperation, Vec<InsertLink<'a>>)> {
        let id = object.id();
        let seq = self.store.seq(id).unwrap_or_default();
        let mut op = PlannedOperation::new(OperationKind::Insert, entity, id.clone(), seq);
        let mut links = Vec::new();

        let mut propagated: HashSet<&str> = HashSet::new();
        for rel in source_to_ones(entity) {
            match object.to_one(&rel.name) {
                Some(ToOne::Resolved(Some(target))) => {
                    let target = self.store.resolve_id(target);
                    for join in &rel.joins {
                        propagated.insert(join.source.as_str());
                        op.values
                            .insert(join.source.clone(), self.key_value(&target, &join.target));
                    }
                    links.push(InsertLink {
                        target,
                        source: id.clone(),
                        rel,
                    });
                }
                Some(ToOne::Resolved(None)) => {
                    for join in &rel.joins {
                        op.values
                            .insert(join.source.clone(), ColumnValue::Literal(Value::Null));
                    }
                }
                _ => {}
            }
        }

        for attribute in entity.attributes() {
            if propagated.contains(attribute.name.as_str()) {
                continue;
            }
            if op.values.contains_key(&attribute.name) && !attribute.primary_key {
                continue;
            }
            let value = object.value(&attribute.name).cloned().unwrap_or(Value::Null);
            if value.is_null() && attribute.generated {
                op.values.remove(&attribute.name);
                op.generated_keys.push(attribute.name.clone());
                continue;
            }
            if value.is_null() && attribute.primary_key {
                return Err(CommitError::new(
                    CommitErrorKind::PkNotGenerated,
                    format!(
                        "{id} has no value for primary key '{}' and nothing generates it",
                        attribute.name
                    ),
                )
                .with_objects([id])
                .into());
            }
            op.values
                .insert(attribute.name.clone(), ColumnValue::Literal(value));
        }
        Ok((op, links))
    }

    /// Update of a MODIFIED object; `None` when its row is unchanged.
    /// Also returns the new and the previous targets of changed foreign
    /// keys.
    #[allow(clippy::type_complexity)]
    fn plan_update(
        &self,
        entity: &'a EntityDescriptor,
        object: &DataObject,
    ) -> (Option<PlannedOperation>, Vec<(ObjectId, &'a Relationship)>, Vec<ObjectId>) {
        let id = object.id();
        let seq = self.store.seq(id).unwrap_or_default();
        let mut op = PlannedOperation::new(OperationKind::Update, entity, id.clone(), seq);
        for column in self.log.changed_columns(id, object.values()) {
            if entity.find_attribute(&column).is_some() {
                let value = object.value(&column).cloned().unwrap_or(Value::Null);
                op.values.insert(column, ColumnValue::Literal(value));
            }
        }

        let mut targets = Vec::new();
        let mut previous = Vec::new();
        for rel in source_to_ones(entity) {
            let Some(ToOne::Resolved(target)) = object.to_one(&rel.name) else {
                continue;
            };
            let target = target.as_ref().map(|t| self.store.resolve_id(t));
            let committed = foreign_key_target(object, rel).map(|t| self.store.resolve_id(&t));
            if committed == target {
                continue;
            }
            for join in &rel.joins {
                let value = match &target {
                    Some(t) => self.key_value(t, &join.target),
                    None => ColumnValue::Literal(Value::Null),
                };
                op.values.insert(join.source.clone(), value);
            }
            if let Some(t) = target {
                targets.push((t, rel));
            }
            if let Some(old) = committed {
                previous.push(old);
            }
        }

        if op.values.is_empty() {
            return (None, targets, previous);
        }
        let (qualifier, optimistic) = self.row_qualifier(entity, object);
        op.qualifier = qualifier;
        op.optimistic = optimistic;
        (Some(op), targets, previous)
    }

    /// Plan the commit of every pending change.
    #[tracing::instrument(level = "debug", skip(self, sorter), fields(context = %self.store.context()))]
    pub fn plan(&self, sorter: &dyn OperationSorter) -> Result<CommitPlan> {
        let mut graph = OperationGraph::new();
        let mut plan = CommitPlan::default();
        let mut inserts: HashMap<ObjectId, usize> = HashMap::new();
        let mut updates: HashMap<ObjectId, usize> = HashMap::new();
        let mut deletes: HashMap<ObjectId, usize> = HashMap::new();
        let mut links: Vec<InsertLink<'a>> = Vec::new();
        let mut update_links: Vec<(ObjectId, ObjectId)> = Vec::new();
        let mut released: Vec<(ObjectId, ObjectId)> = Vec::new();
        let mut touched: Vec<ObjectId> = Vec::new();

        for id in self.store.ids_in_state(PersistenceState::New) {
            let object = self.store.require(&id)?;
            let entity = self.resolver.entity(id.entity())?;
            let (op, object_links) = self.plan_insert(entity, object)?;
            touched.extend(object_links.iter().map(|l| l.target.clone()));
            links.extend(object_links);
            inserts.insert(id.clone(), graph.add(op));
            plan.inserted.push(id);
        }

        for id in self.store.ids_in_state(PersistenceState::Modified) {
            let object = self.store.require(&id)?;
            let entity = self.resolver.entity(id.entity())?;
            let (op, targets, previous) = self.plan_update(entity, object);
            touched.extend(targets.iter().map(|(t, _)| t.clone()));
            touched.extend(previous.iter().cloned());
            let Some(op) = op else {
                plan.unchanged.push(id);
                continue;
            };
            update_links.extend(targets.into_iter().map(|(t, _)| (t, id.clone())));
            released.extend(previous.into_iter().map(|old| (id.clone(), old)));
            updates.insert(id.clone(), graph.add(op));
            plan.updated.push(id);
        }

        let mut delete_refs: Vec<(ObjectId, ObjectId, &'a Relationship)> = Vec::new();
        for id in self.store.ids_in_state(PersistenceState::Deleted) {
            let object = self.store.require(&id)?;
            let entity = self.resolver.entity(id.entity())?;
            let seq = self.store.seq(&id).unwrap_or_default();
            let mut op = PlannedOperation::new(OperationKind::Delete, entity, id.clone(), seq);
            let (qualifier, optimistic) = self.row_qualifier(entity, object);
            op.qualifier = qualifier;
            op.optimistic = optimistic;
            for rel in source_to_ones(entity) {
                if let Some(target) = foreign_key_target(object, rel) {
                    let target = self.store.resolve_id(&target);
                    touched.push(target.clone());
                    delete_refs.push((id.clone(), target, rel));
                }
            }
            deletes.insert(id.clone(), graph.add(op));
            plan.deleted.push(id);
        }

        for change in self.log.flattened_changes() {
            let rel = self.resolver.relationship(&change.entity, &change.relationship)?;
            let Some(join_table) = &rel.join_table else {
                continue;
            };
            let source = self.store.resolve_id(&change.source);
            let target = self.store.resolve_id(&change.target);
            let mut row = BTreeMap::new();
            for join in &join_table.source_joins {
                row.insert(join.target.clone(), self.key_value(&source, &join.source));
            }
            for join in &join_table.target_joins {
                row.insert(join.source.clone(), self.key_value(&target, &join.target));
            }
            let kind = if change.created {
                OperationKind::JoinInsert
            } else {
                OperationKind::JoinDelete
            };
            let op = PlannedOperation {
                kind,
                entity: change.entity.clone(),
                table: join_table.table.clone(),
                id: None,
                values: if change.created { row.clone() } else { BTreeMap::new() },
                qualifier: if change.created { BTreeMap::new() } else { row },
                generated_keys: Vec::new(),
                seq: self.store.seq(&source).unwrap_or_default(),
                optimistic: false,
            };
            let index = graph.add(op);
            for endpoint in [&source, &target] {
                if change.created {
                    if let Some(&insert) = inserts.get(endpoint) {
                        graph.depend(insert, index);
                    }
                } else if let Some(&delete) = deletes.get(endpoint) {
                    graph.depend(index, delete);
                }
            }
            touched.push(source);
            touched.push(target);
        }

        for link in links {
            let (Some(&before), Some(&after)) = (inserts.get(&link.target), inserts.get(&link.source)) else {
                continue;
            };
            let entity = self.resolver.entity(link.source.entity())?;
            let breakable = link.rel.is_nullable_fk()
                && !link.rel.source_columns().any(|c| entity.is_pk_column(c));
            let remedy = breakable.then(|| Remedy::DeferColumns {
                columns: link.rel.source_columns().map(str::to_string).collect(),
                key: self.key_of(entity, &link.source),
            });
            graph.push_dependency(before, after, remedy);
        }
        for (target, source) in update_links {
            if let (Some(&before), Some(&after)) = (inserts.get(&target), updates.get(&source)) {
                graph.depend(before, after);
            }
        }
        for (source, old) in released {
            if let (Some(&before), Some(&after)) = (updates.get(&source), deletes.get(&old)) {
                graph.depend(before, after);
            }
        }
        for (source, target, rel) in delete_refs {
            if source == target {
                continue;
            }
            let (Some(&before), Some(&after)) = (deletes.get(&source), deletes.get(&target)) else {
                continue;
            };
            let entity = self.resolver.entity(source.entity())?;
            let breakable = rel.is_nullable_fk() && !rel.source_columns().any(|c| entity.is_pk_column(c));
            let remedy = breakable.then(|| Remedy::ClearColumns {
                columns: rel.source_columns().map(str::to_string).collect(),
                key: self.key_of(entity, &source),
            });
            graph.push_dependency(before, after, remedy);
        }

        let mut seen = HashSet::new();
        plan.indirectly_modified = touched
            .into_iter()
            .filter(|id| !id.is_temporary() || self.store.contains(id))
            .filter(|id| seen.insert(id.clone()))
            .collect();

        tracing::debug!(
            operations = graph.len(),
            inserted = plan.inserted.len(),
            updated = plan.updated.len(),
            deleted = plan.deleted.len(),
            unchanged = plan.unchanged.len(),
            "Commit planned"
        );
        plan.operations = sorter.sort(graph, self.resolver)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, n: i64) -> PlannedOperation {
        let id = ObjectId::single("Node", "id", n);
        PlannedOperation {
            kind,
            entity: "Node".into(),
            table: "node".into(),
            id: Some(id),
            values: BTreeMap::new(),
            qualifier: BTreeMap::new(),
            generated_keys: Vec::new(),
            seq: u64::try_from(n).unwrap(),
            optimistic: false,
        }
    }

    fn by_seq(op: &PlannedOperation) -> OperationRank {
        (0, 0, op.seq)
    }

    fn seqs(ops: &[PlannedOperation]) -> Vec<(OperationKind, u64)> {
        ops.iter().map(|o| (o.kind, o.seq)).collect()
    }

    #[test]
    fn dependencies_override_rank() {
        let mut graph = OperationGraph::new();
        let a = graph.add(op(OperationKind::Insert, 1));
        let b = graph.add(op(OperationKind::Insert, 2));
        let c = graph.add(op(OperationKind::Insert, 3));
        graph.depend(c, a);
        graph.depend(b, c);
        let sorted = graph.into_sorted(by_seq).unwrap();
        assert_eq!(
            seqs(&sorted),
            vec![
                (OperationKind::Insert, 2),
                (OperationKind::Insert, 3),
                (OperationKind::Insert, 1)
            ]
        );
    }

    #[test]
    fn unbreakable_cycle_is_reported() {
        let mut graph = OperationGraph::new();
        let a = graph.add(op(OperationKind::Insert, 1));
        let b = graph.add(op(OperationKind::Insert, 2));
        graph.depend(a, b);
        graph.depend(b, a);
        let err = graph.into_sorted(by_seq).unwrap_err();
        assert_eq!(err.commit_kind(), Some(CommitErrorKind::CyclicDependency));
    }

    #[test]
    fn deferred_column_becomes_follow_up_update() {
        let mut graph = OperationGraph::new();
        let mut first = op(OperationKind::Insert, 1);
        first.values.insert(
            "next_id".into(),
            ColumnValue::Key {
                id: ObjectId::single("Node", "id", 2_i64),
                column: "id".into(),
            },
        );
        let a = graph.add(first);
        let b = graph.add(op(OperationKind::Insert, 2));
        graph.push_dependency(
            b,
            a,
            Some(Remedy::DeferColumns {
                columns: vec!["next_id".into()],
                key: BTreeMap::new(),
            }),
        );
        graph.depend(a, b);

        let sorted = graph.into_sorted(by_seq).unwrap();
        assert_eq!(sorted.len(), 3);
        assert_eq!(sorted[0].seq, 1);
        assert_eq!(
            sorted[0].values.get("next_id"),
            Some(&ColumnValue::Literal(Value::Null))
        );
        assert_eq!(sorted[1].seq, 2);
        assert_eq!(sorted[2].kind, OperationKind::Update);
        assert!(matches!(
            sorted[2].values.get("next_id"),
            Some(ColumnValue::Key { .. })
        ));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut graph = OperationGraph::new();
        let a = graph.add(op(OperationKind::Insert, 1));
        graph.push_dependency(
            a,
            a,
            Some(Remedy::DeferColumns {
                columns: vec!["parent_id".into()],
                key: BTreeMap::new(),
            }),
        );
        let sorted = graph.into_sorted(by_seq).unwrap();
        assert_eq!(
            seqs(&sorted),
            vec![(OperationKind::Insert, 1), (OperationKind::Update, 1)]
        );
    }

    #[test]
    fn tarjan_finds_nested_components() {
        let mut edges = HashMap::new();
        edges.insert(0, vec![1]);
        edges.insert(1, vec![2]);
        edges.insert(2, vec![0, 3]);
        edges.insert(3, vec![4]);
        edges.insert(4, vec![3]);
        let mut components = strongly_connected(&[0, 1, 2, 3, 4], &edges);
        components.sort();
        assert_eq!(components, vec![vec![0, 1, 2], vec![3, 4]]);
    }
}
