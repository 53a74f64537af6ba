//! Fault resolution: reading properties and relationships that are not in
//! memory yet.
//!
//! Every fetched row goes through [`ObjectContext::materialize`], which
//! feeds the snapshot cache and merges the row into the identity map, so a
//! row maps to exactly one object per context.

use crate::context::ObjectContext;
use crate::object::DataObject;
use cayenne_core::{
    Cx, DataNode, DataRow, EntityDescriptor, Error, FaultError, FaultErrorKind, FkSide,
    IdentityErrorKind, MappingError, ObjectId, Outcome, PersistenceState, Qualifier,
    RelatedCollection, Relationship, Result, SelectQuery, ToOne, Value,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

fn fault_error(kind: FaultErrorKind, object: &ObjectId, message: impl Into<String>) -> Error {
    Error::Fault(FaultError {
        kind,
        object: object.to_string(),
        message: message.into(),
    })
}

pub(crate) fn mapping_error(entity: &str, message: impl Into<String>) -> Error {
    Error::Mapping(MappingError {
        entity: Some(entity.to_string()),
        message: message.into(),
    })
}

/// Drop repeated ids, keeping the first occurrence.
pub(crate) fn dedup_ids(ids: Vec<ObjectId>) -> Vec<ObjectId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

impl<N: DataNode> ObjectContext<N> {
    /// Register fetched rows of an entity.
    ///
    /// Returns one id per row, in row order; repeated rows yield repeated
    /// ids. Dirty objects keep their in-memory state.
    pub(crate) fn materialize(&mut self, entity: &EntityDescriptor, rows: Vec<DataRow>) -> Result<Vec<ObjectId>> {
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let row = row.unprefixed();
            let id = entity.id_from_row(&row).ok_or_else(|| {
                mapping_error(&entity.name, "fetched row lacks a primary key value")
            })?;
            keyed.push((id, row));
        }
        let ids: Vec<ObjectId> = keyed.iter().map(|(id, _)| id.clone()).collect();
        let stored = self.cache().remember_fetched(Some(self.id()), keyed);
        for (id, row) in ids.iter().zip(stored) {
            self.merge_row(entity, id, row);
        }
        tracing::trace!(entity = %entity.name, rows = ids.len(), "Materialized rows");
        Ok(ids.iter().map(|id| self.store.resolve_id(id)).collect())
    }

    /// Select rows of an entity and materialize them.
    pub(crate) async fn fetch_objects(
        &mut self,
        cx: &Cx,
        entity: &EntityDescriptor,
        qualifier: Qualifier,
    ) -> Outcome<Vec<ObjectId>, Error> {
        let query = SelectQuery::new(entity.name.clone(), entity.table.clone()).qualifier(qualifier);
        let node = Arc::clone(self.data_node());
        let rows = try_outcome!(node.select(cx, &query).await);
        Outcome::Ok(try_result!(self.materialize(entity, rows)))
    }

    /// Fill a HOLLOW object from the cache, or from the node when the
    /// cache has no snapshot.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(context = %self.id()))]
    pub async fn resolve_hollow(&mut self, cx: &Cx, id: &ObjectId) -> Outcome<(), Error> {
        let id = self.store.resolve_id(id);
        let state = try_result!(self.store.require(&id)).state();
        if state != PersistenceState::Hollow {
            return Outcome::Ok(());
        }
        let resolver = Arc::clone(self.resolver());
        let entity = try_result!(resolver.entity(id.entity()));
        if let Some(row) = self.cache().cached_snapshot(&id) {
            self.merge_row(entity, &id, row);
            return Outcome::Ok(());
        }
        let Some(key) = id.id_snapshot() else {
            return Outcome::Err(Error::identity(
                IdentityErrorKind::TemporaryId,
                format!("{id} has no permanent id to fetch"),
            ));
        };
        let fetched = try_outcome!(
            self.fetch_objects(cx, entity, Qualifier::Match(key.clone()))
                .await
        );
        if fetched.is_empty() {
            return Outcome::Err(fault_error(
                FaultErrorKind::ObjectNotFound,
                &id,
                format!("row of {id} no longer exists"),
            ));
        }
        Outcome::Ok(())
    }

    /// Read a column, resolving a HOLLOW object first.
    pub async fn read_property(&mut self, cx: &Cx, id: &ObjectId, property: &str) -> Outcome<Value, Error> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(self.resolver());
        let entity = try_result!(resolver.entity(id.entity()));
        if entity.find_attribute(property).is_none() {
            return Outcome::Err(Error::identity(
                IdentityErrorKind::UnknownProperty,
                format!("attribute '{}.{property}' is not mapped", entity.name),
            ));
        }
        try_outcome!(self.resolve_hollow(cx, id).await);
        let object = try_result!(self.store.require(id));
        Outcome::Ok(object.value(property).cloned().unwrap_or(Value::Null))
    }

    /// Read a to-one relationship, resolving its fault.
    ///
    /// A NULL foreign key resolves to `None` without a query. A target that
    /// is registered or cached is used without a query.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(context = %self.id()))]
    pub async fn read_to_one(&mut self, cx: &Cx, id: &ObjectId, relationship: &str) -> Outcome<Option<ObjectId>, Error> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(self.resolver());
        let rel = try_result!(resolver.relationship(id.entity(), relationship));
        if rel.to_many {
            return Outcome::Err(Error::identity(
                IdentityErrorKind::UnknownProperty,
                format!("'{}.{relationship}' is a to-many relationship", id.entity()),
            ));
        }
        let id = self.store.resolve_id(id);
        if rel.fk_side() == FkSide::Source {
            try_outcome!(self.resolve_hollow(cx, &id).await);
        }
        let object = try_result!(self.store.require(&id));
        if let Some(ToOne::Resolved(target)) = object.to_one(&rel.name) {
            return Outcome::Ok(target.as_ref().map(|t| self.store.resolve_id(t)));
        }
        let target = match rel.fk_side() {
            FkSide::Source => try_outcome!(self.fetch_to_one_by_key(cx, &id, rel).await),
            _ => try_outcome!(self.fetch_to_one_by_join(cx, &id, rel).await),
        };
        if let Some(object) = self.store.node_mut(&id) {
            object
                .to_one_mut()
                .insert(rel.name.clone(), ToOne::Resolved(target.clone()));
        }
        Outcome::Ok(target)
    }

    async fn fetch_to_one_by_key(&mut self, cx: &Cx, id: &ObjectId, rel: &Relationship) -> Outcome<Option<ObjectId>, Error> {
        let object = try_result!(self.store.require(id));
        let Some(target) = self.fk_target(object, rel) else {
            return Outcome::Ok(None);
        };
        if self.store.contains(&target) {
            return Outcome::Ok(Some(target));
        }
        let resolver = Arc::clone(self.resolver());
        let entity = try_result!(resolver.entity(&rel.target));
        if let Some(row) = self.cache().cached_snapshot(&target) {
            self.merge_row(entity, &target, row);
            return Outcome::Ok(Some(target));
        }
        let key = target.id_snapshot().cloned().unwrap_or_default();
        let fetched = try_outcome!(self.fetch_objects(cx, entity, Qualifier::Match(key)).await);
        match fetched.into_iter().next() {
            Some(found) => Outcome::Ok(Some(found)),
            None => Outcome::Err(fault_error(
                FaultErrorKind::DanglingReference,
                id,
                format!("'{}' of {id} points to missing {target}", rel.name),
            )),
        }
    }

    async fn fetch_to_one_by_join(&mut self, cx: &Cx, id: &ObjectId, rel: &Relationship) -> Outcome<Option<ObjectId>, Error> {
        if self.state(id) == PersistenceState::New {
            return Outcome::Ok(None);
        }
        let key: BTreeMap<String, Value> = rel
            .joins
            .iter()
            .map(|join| (join.target.clone(), self.column_value(id, &join.source)))
            .collect();
        let resolver = Arc::clone(self.resolver());
        let entity = try_result!(resolver.entity(&rel.target));
        let fetched = try_outcome!(self.fetch_objects(cx, entity, Qualifier::Match(key)).await);
        Outcome::Ok(fetched.into_iter().next())
    }

    /// Read a to-many relationship, resolving its fault. Changes queued on
    /// the fault are applied to the fetched members.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(context = %self.id()))]
    pub async fn read_to_many(&mut self, cx: &Cx, id: &ObjectId, relationship: &str) -> Outcome<Vec<ObjectId>, Error> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(self.resolver());
        let rel = try_result!(resolver.relationship(id.entity(), relationship));
        if !rel.to_many {
            return Outcome::Err(Error::identity(
                IdentityErrorKind::UnknownProperty,
                format!("'{}.{relationship}' is a to-one relationship", id.entity()),
            ));
        }
        let id = self.store.resolve_id(id);
        let object = try_result!(self.store.require(&id));
        let fetched = match object.to_many(&rel.name).map(|slot| slot.collection().is_some()) {
            Some(true) => None,
            _ if object.state() == PersistenceState::New => Some(Vec::new()),
            _ => Some(try_outcome!(self.fetch_to_many(cx, &id, rel).await)),
        };
        if let Some(fetched) = fetched {
            let collection = self.related_collection(rel, &fetched);
            if let Some(object) = self.store.node_mut(&id) {
                object
                    .to_many_mut()
                    .entry(rel.name.clone())
                    .or_insert_with(|| cayenne_core::ToMany::fault(rel.collection))
                    .resolve(collection);
            }
        }
        let members = self
            .store
            .node(&id)
            .and_then(|o| o.to_many(&rel.name))
            .and_then(|slot| slot.collection())
            .map(|c| c.ids().into_iter().cloned().collect())
            .unwrap_or_default();
        Outcome::Ok(members)
    }

    async fn fetch_to_many(&mut self, cx: &Cx, id: &ObjectId, rel: &Relationship) -> Outcome<Vec<ObjectId>, Error> {
        let resolver = Arc::clone(self.resolver());
        let entity = try_result!(resolver.entity(&rel.target));
        let qualifier = match &rel.join_table {
            Some(join_table) => Qualifier::ThroughJoinTable {
                join_table: join_table.table.clone(),
                target_joins: join_table.target_joins.clone(),
                source_columns: join_table.source_joins.iter().map(|j| j.target.clone()).collect(),
                keys: vec![
                    join_table
                        .source_joins
                        .iter()
                        .map(|j| self.column_value(id, &j.source))
                        .collect(),
                ],
            },
            None => Qualifier::Match(
                rel.joins
                    .iter()
                    .map(|join| (join.target.clone(), self.column_value(id, &join.source)))
                    .collect(),
            ),
        };
        let fetched = try_outcome!(self.fetch_objects(cx, entity, qualifier).await);
        Outcome::Ok(dedup_ids(fetched))
    }

    /// Collection of the relationship's kind holding `members`, keyed by
    /// the map key attribute for map relationships.
    pub(crate) fn related_collection(&self, rel: &Relationship, members: &[ObjectId]) -> RelatedCollection {
        let mut collection = RelatedCollection::empty(rel.collection);
        for member in members {
            let key = rel.map_key.as_ref().map(|attribute| {
                self.store
                    .node(member)
                    .and_then(|o| o.value(attribute))
                    .cloned()
                    .unwrap_or(Value::Null)
            });
            collection.add(member.clone(), key);
        }
        collection
    }

    /// Fetch objects matching a qualifier.
    pub async fn select_objects(&mut self, cx: &Cx, entity: &str, qualifier: Qualifier) -> Outcome<Vec<ObjectId>, Error> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(self.resolver());
        let entity = try_result!(resolver.entity(entity));
        let fetched = try_outcome!(self.fetch_objects(cx, entity, qualifier).await);
        Outcome::Ok(dedup_ids(fetched))
    }

    /// A registered object, resolved from HOLLOW if needed.
    pub async fn object(&mut self, cx: &Cx, id: &ObjectId) -> Outcome<&DataObject, Error> {
        try_outcome!(self.resolve_hollow(cx, id).await);
        Outcome::Ok(try_result!(self.store.require(id)))
    }
}
