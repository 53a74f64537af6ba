//! Object queries with relationship prefetching.
//!
//! Three prefetch strategies resolve relationship faults of the fetched
//! objects ahead of time:
//!
//! - **Joint**: related rows come back in the main select, one level deep.
//! - **Disjoint**: one extra select per level, qualified by the keys of the
//!   objects fetched at the level above.
//! - **Disjoint by id**: the related ids are collected first and only rows
//!   not already in memory are fetched by primary key.
//!
//! Disjoint selects are split so that no IN qualifier holds more keys than
//! `max_id_qualifier_size`.

use crate::context::ObjectContext;
use crate::fault_resolver::{dedup_ids, mapping_error};
use cayenne_core::{
    CanonicalValue, Cx, DataNode, DataRow, EntityDescriptor, Error, FkSide, JOIN_SOURCE_PREFIX,
    JointSpec, ObjectId, Outcome, PersistenceState, Qualifier, Relationship, SelectQuery, ToOne,
    Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// How a prefetched relationship is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrefetchSemantics {
    Joint,
    Disjoint,
    DisjointById,
}

/// A relationship path to prefetch, e.g. `paintings` or `paintings.gallery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchSpec {
    pub path: String,
    pub semantics: PrefetchSemantics,
}

/// Select of objects of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSelect {
    pub entity: String,
    pub qualifier: Qualifier,
    pub prefetches: Vec<PrefetchSpec>,
}

impl ObjectSelect {
    /// Select every object of an entity.
    pub fn query(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Qualifier::All,
            prefetches: Vec::new(),
        }
    }

    pub fn qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = qualifier;
        self
    }

    pub fn prefetch(mut self, path: impl Into<String>, semantics: PrefetchSemantics) -> Self {
        self.prefetches.push(PrefetchSpec {
            path: path.into(),
            semantics,
        });
        self
    }
}

type Key = Vec<CanonicalValue>;

fn canonical(values: &[Value]) -> Key {
    values.iter().map(Value::canonical).collect()
}

/// Split `items` into chunks of at most `limit`. A limit of zero or less
/// keeps everything in one chunk.
pub(crate) fn chunked<T: Clone>(items: &[T], limit: i32) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    match usize::try_from(limit) {
        Ok(size) if size > 0 => items.chunks(size).map(<[T]>::to_vec).collect(),
        _ => vec![items.to_vec()],
    }
}

fn row_key(row: &DataRow, columns: &[String]) -> Key {
    columns
        .iter()
        .map(|c| row.get(c).unwrap_or(&Value::Null).canonical())
        .collect()
}

fn source_prefixed(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|c| format!("{JOIN_SOURCE_PREFIX}.{c}"))
        .collect()
}

/// Prefetch paths ordered by depth, with missing intermediate levels added
/// using the semantics of the deeper path.
fn expand_paths(specs: &[PrefetchSpec]) -> Vec<(String, PrefetchSemantics)> {
    let mut paths: BTreeMap<String, PrefetchSemantics> = BTreeMap::new();
    for spec in specs {
        paths.insert(spec.path.clone(), spec.semantics);
    }
    for spec in specs {
        let mut prefix = String::new();
        for segment in spec.path.split('.') {
            if !prefix.is_empty() {
                paths.entry(prefix.clone()).or_insert(spec.semantics);
                prefix.push('.');
            }
            prefix.push_str(segment);
        }
    }
    let mut ordered: Vec<(String, PrefetchSemantics)> = paths.into_iter().collect();
    ordered.sort_by_key(|(path, _)| path.matches('.').count());
    ordered
}

impl<N: DataNode> ObjectContext<N> {
    /// Fetch objects and prefetch the requested relationships.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(context = %self.id(), entity = %query.entity))]
    pub async fn select(&mut self, cx: &Cx, query: &ObjectSelect) -> Outcome<Vec<ObjectId>, Error> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(self.resolver());
        let entity = try_result!(resolver.entity(&query.entity));

        let mut joints: Vec<&Relationship> = Vec::new();
        for spec in query
            .prefetches
            .iter()
            .filter(|p| p.semantics == PrefetchSemantics::Joint)
        {
            if spec.path.contains('.') {
                return Outcome::Err(mapping_error(
                    &entity.name,
                    format!("joint prefetch '{}' must name a single relationship", spec.path),
                ));
            }
            let rel = try_result!(resolver.relationship(&entity.name, &spec.path));
            if rel.is_flattened() {
                return Outcome::Err(mapping_error(
                    &entity.name,
                    format!("joint prefetch cannot follow flattened relationship '{}'", rel.name),
                ));
            }
            joints.push(rel);
        }

        let mut select = SelectQuery::new(entity.name.clone(), entity.table.clone())
            .qualifier(query.qualifier.clone());
        for rel in &joints {
            let target = try_result!(resolver.entity(&rel.target));
            select = select.joint(JointSpec {
                path: rel.name.clone(),
                table: target.table.clone(),
                joins: rel.joins.clone(),
            });
        }
        let node = Arc::clone(self.data_node());
        let rows = try_outcome!(node.select(cx, &select).await);
        let joint_rows: Vec<Vec<Option<DataRow>>> = joints
            .iter()
            .map(|rel| rows.iter().map(|row| row.prefixed(&rel.name)).collect())
            .collect();
        let per_row = try_result!(self.materialize(entity, rows));
        let parents = dedup_ids(per_row.clone());

        let mut levels: HashMap<String, (String, Vec<ObjectId>)> = HashMap::new();
        levels.insert(String::new(), (entity.name.clone(), parents.clone()));

        for (rel, child_rows) in joints.iter().zip(joint_rows) {
            let target = try_result!(resolver.entity(&rel.target));
            let (positions, present): (Vec<usize>, Vec<DataRow>) = child_rows
                .into_iter()
                .enumerate()
                .filter_map(|(i, row)| row.map(|row| (i, row)))
                .unzip();
            let children = try_result!(self.materialize(target, present));
            let mut grouped: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();
            for (position, child) in positions.iter().zip(&children) {
                grouped
                    .entry(per_row[*position].clone())
                    .or_default()
                    .push(child.clone());
            }
            for parent in &parents {
                let members = dedup_ids(grouped.remove(parent).unwrap_or_default());
                self.resolve_prefetched(parent, rel, members);
            }
            tracing::debug!(path = %rel.name, related = children.len(), "Joint prefetch resolved");
            levels.insert(rel.name.clone(), (rel.target.clone(), dedup_ids(children)));
        }

        let disjoint: Vec<PrefetchSpec> = query
            .prefetches
            .iter()
            .filter(|p| p.semantics != PrefetchSemantics::Joint)
            .cloned()
            .collect();
        for (path, semantics) in expand_paths(&disjoint) {
            if levels.contains_key(&path) {
                continue;
            }
            let (prefix, name) = path.rsplit_once('.').unwrap_or(("", path.as_str()));
            let Some((parent_entity, parent_ids)) = levels.get(prefix).cloned() else {
                continue;
            };
            let rel = try_result!(resolver.relationship(&parent_entity, name));
            let children = match semantics {
                PrefetchSemantics::DisjointById => {
                    try_outcome!(self.prefetch_by_id(cx, &parent_ids, rel).await)
                }
                _ => try_outcome!(self.prefetch_disjoint(cx, &parent_ids, rel).await),
            };
            tracing::debug!(path = %path, related = children.len(), "Disjoint prefetch resolved");
            levels.insert(path.clone(), (rel.target.clone(), children));
        }

        Outcome::Ok(parents)
    }

    /// Resolve a relationship fault with prefetched members. Resolved
    /// relationships are left alone.
    fn resolve_prefetched(&mut self, parent: &ObjectId, rel: &Relationship, members: Vec<ObjectId>) {
        if rel.to_many {
            let collection = self.related_collection(rel, &members);
            if let Some(slot) = self
                .store
                .node_mut(parent)
                .and_then(|o| o.to_many_mut().get_mut(&rel.name))
            {
                slot.resolve(collection);
            }
            return;
        }
        if let Some(slot) = self
            .store
            .node_mut(parent)
            .and_then(|o| o.to_one_mut().get_mut(&rel.name))
        {
            if matches!(slot, ToOne::Fault) {
                *slot = ToOne::Resolved(members.into_iter().next());
            }
        }
    }

    /// Parents whose relationship can be prefetched.
    fn prefetch_parents(&self, parents: &[ObjectId], rel: &Relationship) -> Vec<ObjectId> {
        let needs_values = !rel.to_many && rel.fk_side() == FkSide::Source;
        parents
            .iter()
            .filter(|p| match self.state(p) {
                PersistenceState::Committed | PersistenceState::Modified => true,
                PersistenceState::Hollow => !needs_values,
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Key of a parent on the given columns; `None` when a value is NULL.
    fn parent_key<'c>(&self, parent: &ObjectId, columns: impl Iterator<Item = &'c str>) -> Option<Vec<Value>> {
        columns
            .map(|c| Some(self.column_value(parent, c)).filter(|v| !v.is_null()))
            .collect()
    }

    async fn prefetch_disjoint(&mut self, cx: &Cx, parents: &[ObjectId], rel: &Relationship) -> Outcome<Vec<ObjectId>, Error> {
        let parents = self.prefetch_parents(parents, rel);
        let resolver = Arc::clone(self.resolver());
        let target = try_result!(resolver.entity(&rel.target));
        let limit = self.config().max_id_qualifier_size;

        let (parent_keys, owner_columns, row_owner): (Vec<(ObjectId, Option<Vec<Value>>)>, Vec<String>, Vec<String>) =
            match &rel.join_table {
                Some(join_table) => {
                    let columns: Vec<String> = join_table.source_joins.iter().map(|j| j.target.clone()).collect();
                    let keys = parents
                        .iter()
                        .map(|p| (p.clone(), self.parent_key(p, join_table.source_joins.iter().map(|j| j.source.as_str()))))
                        .collect();
                    let prefixed = source_prefixed(&columns);
                    (keys, columns, prefixed)
                }
                None => {
                    let keys = parents
                        .iter()
                        .map(|p| (p.clone(), self.parent_key(p, rel.source_columns())))
                        .collect();
                    let columns: Vec<String> = rel.target_columns().map(str::to_string).collect();
                    (keys, columns.clone(), columns)
                }
            };

        let mut seen = HashSet::new();
        let distinct: Vec<Vec<Value>> = parent_keys
            .iter()
            .filter_map(|(_, key)| key.clone())
            .filter(|key| seen.insert(canonical(key)))
            .collect();

        let mut grouped: HashMap<Key, Vec<ObjectId>> = HashMap::new();
        let mut all = Vec::new();
        for chunk in chunked(&distinct, limit) {
            let qualifier = match &rel.join_table {
                Some(join_table) => Qualifier::ThroughJoinTable {
                    join_table: join_table.table.clone(),
                    target_joins: join_table.target_joins.clone(),
                    source_columns: owner_columns.clone(),
                    keys: chunk,
                },
                None => Qualifier::In {
                    columns: owner_columns.clone(),
                    keys: chunk,
                },
            };
            let query = SelectQuery::new(target.name.clone(), target.table.clone()).qualifier(qualifier);
            let node = Arc::clone(self.data_node());
            let rows = try_outcome!(node.select(cx, &query).await);
            let owners: Vec<Key> = rows.iter().map(|row| row_key(row, &row_owner)).collect();
            let ids = try_result!(self.materialize(target, rows));
            for (owner, id) in owners.into_iter().zip(ids) {
                grouped.entry(owner).or_default().push(id.clone());
                all.push(id);
            }
        }

        let dangling_allowed = rel.to_many || rel.fk_side() != FkSide::Source;
        for (parent, key) in parent_keys {
            let members = key
                .map(|k| dedup_ids(grouped.get(&canonical(&k)).cloned().unwrap_or_default()))
                .unwrap_or_default();
            if members.is_empty() && !dangling_allowed && self.fk_is_set(&parent, rel) {
                continue;
            }
            self.resolve_prefetched(&parent, rel, members);
        }
        Outcome::Ok(dedup_ids(all))
    }

    fn fk_is_set(&self, parent: &ObjectId, rel: &Relationship) -> bool {
        self.store
            .node(parent)
            .and_then(|o| self.fk_target(o, rel))
            .is_some()
    }

    /// Fetch rows of an entity by primary key, in IN chunks.
    async fn fetch_by_ids(&mut self, cx: &Cx, entity: &EntityDescriptor, ids: &[ObjectId]) -> Outcome<Vec<ObjectId>, Error> {
        let columns: Vec<String> = entity.pk_columns().map(str::to_string).collect();
        let keys: Vec<Vec<Value>> = ids
            .iter()
            .map(|id| {
                columns
                    .iter()
                    .map(|c| id.key_value(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        let mut found = Vec::new();
        for chunk in chunked(&keys, self.config().max_id_qualifier_size) {
            let qualifier = Qualifier::In {
                columns: columns.clone(),
                keys: chunk,
            };
            found.extend(try_outcome!(self.fetch_objects(cx, entity, qualifier).await));
        }
        Outcome::Ok(found)
    }

    /// Whether an object is in memory with its row.
    fn is_loaded(&self, id: &ObjectId) -> bool {
        !matches!(
            self.state(id),
            PersistenceState::Hollow | PersistenceState::Transient
        )
    }

    async fn prefetch_by_id(&mut self, cx: &Cx, parents: &[ObjectId], rel: &Relationship) -> Outcome<Vec<ObjectId>, Error> {
        let parents = self.prefetch_parents(parents, rel);
        let resolver = Arc::clone(self.resolver());
        let target = try_result!(resolver.entity(&rel.target));
        let limit = self.config().max_id_qualifier_size;

        if !rel.to_many && rel.fk_side() == FkSide::Source {
            let targets: Vec<(ObjectId, Option<ObjectId>)> = parents
                .iter()
                .map(|p| {
                    let t = self.store.node(p).and_then(|o| self.fk_target(o, rel));
                    (p.clone(), t)
                })
                .collect();
            let distinct = dedup_ids(targets.iter().filter_map(|(_, t)| t.clone()).collect());
            let missing: Vec<ObjectId> = distinct
                .iter()
                .filter(|t| !self.is_loaded(t))
                .cloned()
                .collect();
            try_outcome!(self.fetch_by_ids(cx, target, &missing).await);
            for (parent, t) in targets {
                match t {
                    None => self.resolve_prefetched(&parent, rel, Vec::new()),
                    Some(t) if self.is_loaded(&t) => self.resolve_prefetched(&parent, rel, vec![t]),
                    Some(_) => {}
                }
            }
            return Outcome::Ok(distinct.into_iter().filter(|t| self.store.contains(t)).collect());
        }

        let pk: Vec<String> = target.pk_columns().map(str::to_string).collect();
        let (parent_keys, owner_columns, row_owner): (Vec<(ObjectId, Option<Vec<Value>>)>, Vec<String>, Vec<String>) =
            match &rel.join_table {
                Some(join_table) => {
                    let columns: Vec<String> = join_table.source_joins.iter().map(|j| j.target.clone()).collect();
                    let keys = parents
                        .iter()
                        .map(|p| (p.clone(), self.parent_key(p, join_table.source_joins.iter().map(|j| j.source.as_str()))))
                        .collect();
                    let prefixed = source_prefixed(&columns);
                    (keys, columns, prefixed)
                }
                None => {
                    let keys = parents
                        .iter()
                        .map(|p| (p.clone(), self.parent_key(p, rel.source_columns())))
                        .collect();
                    let columns: Vec<String> = rel.target_columns().map(str::to_string).collect();
                    (keys, columns.clone(), columns)
                }
            };
        let mut seen = HashSet::new();
        let distinct: Vec<Vec<Value>> = parent_keys
            .iter()
            .filter_map(|(_, key)| key.clone())
            .filter(|key| seen.insert(canonical(key)))
            .collect();

        let mut projection = pk.clone();
        if rel.join_table.is_none() {
            projection.extend(owner_columns.iter().filter(|c| !pk.contains(c)).cloned());
        }
        let mut grouped: HashMap<Key, Vec<ObjectId>> = HashMap::new();
        let mut related = Vec::new();
        for chunk in chunked(&distinct, limit) {
            let qualifier = match &rel.join_table {
                Some(join_table) => Qualifier::ThroughJoinTable {
                    join_table: join_table.table.clone(),
                    target_joins: join_table.target_joins.clone(),
                    source_columns: owner_columns.clone(),
                    keys: chunk,
                },
                None => Qualifier::In {
                    columns: owner_columns.clone(),
                    keys: chunk,
                },
            };
            let query = SelectQuery::new(target.name.clone(), target.table.clone())
                .qualifier(qualifier)
                .columns(projection.clone());
            let node = Arc::clone(self.data_node());
            for row in try_outcome!(node.select(cx, &query).await) {
                let Some(id) = target.id_from_row(&row.unprefixed()) else {
                    continue;
                };
                grouped
                    .entry(row_key(&row, &row_owner))
                    .or_default()
                    .push(id.clone());
                related.push(id);
            }
        }

        let related = dedup_ids(related);
        let missing: Vec<ObjectId> = related
            .iter()
            .filter(|id| !self.is_loaded(id))
            .cloned()
            .collect();
        try_outcome!(self.fetch_by_ids(cx, target, &missing).await);

        for (parent, key) in parent_keys {
            let members: Vec<ObjectId> = key
                .map(|k| grouped.get(&canonical(&k)).cloned().unwrap_or_default())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| self.store.contains(id))
                .map(|id| self.store.resolve_id(&id))
                .collect();
            self.resolve_prefetched(&parent, rel, dedup_ids(members));
        }
        Outcome::Ok(related.into_iter().filter(|id| self.store.contains(id)).collect())
    }
}
