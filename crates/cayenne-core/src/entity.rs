//! Entity and relationship mapping.
//!
//! Mapping is plain data assembled with builder methods and validated once by
//! [`EntityResolver::new`]. Object properties map one-to-one onto columns, so
//! an attribute name is also its column name.

use crate::data_row::DataRow;
use crate::error::{Error, IdentityErrorKind, MappingError, Result};
use crate::object_id::ObjectId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// A mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbAttribute {
    pub name: String,
    pub primary_key: bool,
    /// Value is generated by the node on insert (auto-increment).
    pub generated: bool,
    /// Column is NOT NULL.
    pub mandatory: bool,
    /// Column participates in optimistic locking qualifiers.
    pub used_for_locking: bool,
}

impl DbAttribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            generated: false,
            mandatory: false,
            used_for_locking: false,
        }
    }

    /// Primary key column. Implies NOT NULL.
    pub fn pk(name: impl Into<String>) -> Self {
        Self::new(name).primary_key()
    }

    /// Node-generated primary key column.
    pub fn generated_pk(name: impl Into<String>) -> Self {
        Self::new(name).primary_key().generated()
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.mandatory = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn used_for_locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }
}

/// Shape of a to-many relationship value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CollectionType {
    /// Ordered list.
    #[default]
    List,
    /// Unordered set without duplicates.
    Set,
    /// Map keyed by a target attribute.
    Map,
}

/// What deleting the source object does to the related objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteRule {
    /// Leave related objects alone.
    #[default]
    NoAction,
    /// Clear the foreign key or unlink join rows.
    Nullify,
    /// Delete related objects as well.
    Cascade,
    /// Refuse the delete while related objects exist.
    Deny,
}

/// One column pair of a relationship join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub source: String,
    pub target: String,
}

impl Join {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Join table backing a flattened relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Source entity column -> join table column.
    pub source_joins: Vec<Join>,
    /// Join table column -> target entity column.
    pub target_joins: Vec<Join>,
}

impl JoinTable {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            source_joins: Vec::new(),
            target_joins: Vec::new(),
        }
    }

    pub fn source_join(mut self, source_column: impl Into<String>, join_column: impl Into<String>) -> Self {
        self.source_joins.push(Join::new(source_column, join_column));
        self
    }

    pub fn target_join(mut self, join_column: impl Into<String>, target_column: impl Into<String>) -> Self {
        self.target_joins.push(Join::new(join_column, target_column));
        self
    }

    /// All join table columns.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.source_joins
            .iter()
            .map(|j| j.target.as_str())
            .chain(self.target_joins.iter().map(|j| j.source.as_str()))
    }
}

/// Which row stores the foreign key of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FkSide {
    /// Source row holds the key: the source depends on the target.
    #[default]
    Source,
    /// Target row holds the key: the target depends on the source.
    Target,
    /// A join table row links both ends.
    JoinTable,
}

/// A mapped relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    pub source: String,
    pub target: String,
    pub to_many: bool,
    pub joins: Vec<Join>,
    pub join_table: Option<JoinTable>,
    pub collection: CollectionType,
    /// Target attribute keying a `Map` collection.
    pub map_key: Option<String>,
    pub reverse: Option<String>,
    /// Target primary key is propagated from the source primary key.
    pub to_dependent_pk: bool,
    pub delete_rule: DeleteRule,
    fk_side: FkSide,
    nullable_fk: bool,
}

impl Relationship {
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, false)
    }

    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, true)
    }

    /// Many-to-many relationship through a join table.
    pub fn flattened(name: impl Into<String>, target: impl Into<String>, join_table: JoinTable) -> Self {
        let mut rel = Self::new(name, target, true);
        rel.join_table = Some(join_table);
        rel
    }

    fn new(name: impl Into<String>, target: impl Into<String>, to_many: bool) -> Self {
        Self {
            name: name.into(),
            source: String::new(),
            target: target.into(),
            to_many,
            joins: Vec::new(),
            join_table: None,
            collection: CollectionType::List,
            map_key: None,
            reverse: None,
            to_dependent_pk: false,
            delete_rule: DeleteRule::NoAction,
            fk_side: FkSide::Source,
            nullable_fk: true,
        }
    }

    pub fn join(mut self, source_column: impl Into<String>, target_column: impl Into<String>) -> Self {
        self.joins.push(Join::new(source_column, target_column));
        self
    }

    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    pub fn collection(mut self, collection: CollectionType) -> Self {
        self.collection = collection;
        self
    }

    /// Key a to-many relationship as a map by the given target attribute.
    pub fn map_key(mut self, attribute: impl Into<String>) -> Self {
        self.collection = CollectionType::Map;
        self.map_key = Some(attribute.into());
        self
    }

    pub fn to_dependent_pk(mut self) -> Self {
        self.to_dependent_pk = true;
        self
    }

    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    pub fn is_flattened(&self) -> bool {
        self.join_table.is_some()
    }

    /// Which row holds the foreign key. Computed by [`EntityResolver::new`].
    pub fn fk_side(&self) -> FkSide {
        self.fk_side
    }

    /// Whether every foreign key column may be NULL.
    pub fn is_nullable_fk(&self) -> bool {
        self.nullable_fk
    }

    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.source.as_str())
    }

    pub fn target_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.target.as_str())
    }
}

/// Mapping of one entity onto a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub optimistic_locking: bool,
    attributes: Vec<DbAttribute>,
    relationships: Vec<Relationship>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            optimistic_locking: false,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn attribute(mut self, attribute: DbAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn relationship(mut self, mut relationship: Relationship) -> Self {
        relationship.source.clone_from(&self.name);
        self.relationships.push(relationship);
        self
    }

    pub fn optimistic_locking(mut self) -> Self {
        self.optimistic_locking = true;
        self
    }

    pub fn attributes(&self) -> &[DbAttribute] {
        &self.attributes
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn find_attribute(&self, name: &str) -> Option<&DbAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn pk_columns(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|a| a.primary_key)
            .map(|a| a.name.as_str())
    }

    pub fn is_pk_column(&self, column: &str) -> bool {
        self.find_attribute(column).is_some_and(|a| a.primary_key)
    }

    /// Columns compared in optimistic locking qualifiers: the flagged ones,
    /// or every non-key column when none is flagged.
    pub fn locking_columns(&self) -> Vec<&str> {
        let flagged: Vec<&str> = self
            .attributes
            .iter()
            .filter(|a| a.used_for_locking)
            .map(|a| a.name.as_str())
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }
        self.attributes
            .iter()
            .filter(|a| !a.primary_key)
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Permanent id for a row, or `None` when a key column is missing or NULL.
    pub fn id_from_row(&self, row: &DataRow) -> Option<ObjectId> {
        let mut key = BTreeMap::new();
        for column in self.pk_columns() {
            let value = row.get(column)?;
            if value.is_null() {
                return None;
            }
            key.insert(column.to_string(), value.clone());
        }
        if key.is_empty() {
            return None;
        }
        Some(ObjectId::permanent(self.name.clone(), key))
    }
}

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

fn mapping_error(entity: &str, message: impl Into<String>) -> Error {
    Error::Mapping(MappingError {
        entity: Some(entity.to_string()),
        message: message.into(),
    })
}

/// Validated set of entity mappings.
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl EntityResolver {
    /// Validate and index entity mappings.
    ///
    /// Checks identifiers, primary keys, join columns and reverse
    /// relationships, and computes the foreign key side of every relationship.
    pub fn new(entities: impl IntoIterator<Item = EntityDescriptor>) -> Result<Self> {
        let mut indexed = BTreeMap::new();
        for entity in entities {
            if indexed.contains_key(&entity.name) {
                return Err(mapping_error(&entity.name, "entity is mapped twice"));
            }
            indexed.insert(entity.name.clone(), entity);
        }

        let pattern = identifier_pattern().ok_or_else(|| {
            Error::Mapping(MappingError {
                entity: None,
                message: "identifier pattern failed to compile".to_string(),
            })
        })?;

        for entity in indexed.values() {
            Self::check_entity(pattern, entity)?;
        }

        let mut computed = Vec::new();
        for entity in indexed.values() {
            for rel in &entity.relationships {
                let target = indexed.get(&rel.target).ok_or_else(|| {
                    mapping_error(
                        &entity.name,
                        format!("relationship '{}' targets unknown entity '{}'", rel.name, rel.target),
                    )
                })?;
                Self::check_relationship(pattern, entity, rel, target)?;
                let side = Self::compute_fk_side(rel, target);
                let nullable = match side {
                    FkSide::Source => Self::columns_nullable(entity, rel.source_columns()),
                    FkSide::Target => Self::columns_nullable(target, rel.target_columns()),
                    FkSide::JoinTable => true,
                };
                computed.push((entity.name.clone(), rel.name.clone(), side, nullable));
            }
        }
        for (entity, rel, side, nullable) in computed {
            if let Some(r) = indexed
                .get_mut(&entity)
                .and_then(|e| e.relationships.iter_mut().find(|r| r.name == rel))
            {
                r.fk_side = side;
                r.nullable_fk = nullable;
            }
        }

        for entity in indexed.values() {
            for rel in &entity.relationships {
                Self::check_reverse(&indexed, entity, rel)?;
            }
        }

        tracing::debug!(entities = indexed.len(), "Entity mapping validated");
        Ok(Self { entities: indexed })
    }

    fn check_entity(pattern: &Regex, entity: &EntityDescriptor) -> Result<()> {
        if !pattern.is_match(&entity.name) {
            return Err(mapping_error(&entity.name, "invalid entity name"));
        }
        if !pattern.is_match(&entity.table) {
            return Err(mapping_error(&entity.name, format!("invalid table name '{}'", entity.table)));
        }
        let mut seen = BTreeSet::new();
        for attr in &entity.attributes {
            if !pattern.is_match(&attr.name) {
                return Err(mapping_error(&entity.name, format!("invalid attribute name '{}'", attr.name)));
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(mapping_error(&entity.name, format!("attribute '{}' is mapped twice", attr.name)));
            }
        }
        if entity.pk_columns().next().is_none() {
            return Err(mapping_error(&entity.name, "entity has no primary key"));
        }
        for rel in &entity.relationships {
            if !pattern.is_match(&rel.name) {
                return Err(mapping_error(&entity.name, format!("invalid relationship name '{}'", rel.name)));
            }
            if seen.contains(rel.name.as_str()) {
                return Err(mapping_error(
                    &entity.name,
                    format!("relationship '{}' clashes with an attribute", rel.name),
                ));
            }
        }
        Ok(())
    }

    fn check_relationship(
        pattern: &Regex,
        entity: &EntityDescriptor,
        rel: &Relationship,
        target: &EntityDescriptor,
    ) -> Result<()> {
        if let Some(jt) = &rel.join_table {
            if !pattern.is_match(&jt.table) {
                return Err(mapping_error(&entity.name, format!("invalid join table '{}'", jt.table)));
            }
            if jt.source_joins.is_empty() || jt.target_joins.is_empty() {
                return Err(mapping_error(
                    &entity.name,
                    format!("join table of '{}' needs source and target joins", rel.name),
                ));
            }
            for j in &jt.source_joins {
                if entity.find_attribute(&j.source).is_none() {
                    return Err(mapping_error(&entity.name, format!("unknown join column '{}'", j.source)));
                }
            }
            for j in &jt.target_joins {
                if target.find_attribute(&j.target).is_none() {
                    return Err(mapping_error(&target.name, format!("unknown join column '{}'", j.target)));
                }
            }
            if !rel.to_many {
                return Err(mapping_error(
                    &entity.name,
                    format!("flattened relationship '{}' must be to-many", rel.name),
                ));
            }
        } else {
            if rel.joins.is_empty() {
                return Err(mapping_error(&entity.name, format!("relationship '{}' has no joins", rel.name)));
            }
            for j in &rel.joins {
                if entity.find_attribute(&j.source).is_none() {
                    return Err(mapping_error(&entity.name, format!("unknown join column '{}'", j.source)));
                }
                if target.find_attribute(&j.target).is_none() {
                    return Err(mapping_error(&target.name, format!("unknown join column '{}'", j.target)));
                }
            }
        }
        if rel.collection == CollectionType::Map {
            let Some(key) = &rel.map_key else {
                return Err(mapping_error(
                    &entity.name,
                    format!("map relationship '{}' needs a map key", rel.name),
                ));
            };
            if target.find_attribute(key).is_none() {
                return Err(mapping_error(&target.name, format!("unknown map key '{key}'")));
            }
        }
        Ok(())
    }

    fn compute_fk_side(rel: &Relationship, target: &EntityDescriptor) -> FkSide {
        if rel.join_table.is_some() {
            return FkSide::JoinTable;
        }
        if rel.to_dependent_pk || rel.to_many {
            return FkSide::Target;
        }
        let target_pk: BTreeSet<&str> = target.pk_columns().collect();
        let joined: BTreeSet<&str> = rel.target_columns().collect();
        if joined == target_pk {
            FkSide::Source
        } else {
            FkSide::Target
        }
    }

    fn columns_nullable<'a>(entity: &EntityDescriptor, mut columns: impl Iterator<Item = &'a str>) -> bool {
        columns.all(|c| entity.find_attribute(c).is_some_and(|a| !a.mandatory && !a.primary_key))
    }

    fn check_reverse(
        entities: &BTreeMap<String, EntityDescriptor>,
        entity: &EntityDescriptor,
        rel: &Relationship,
    ) -> Result<()> {
        let Some(reverse_name) = &rel.reverse else {
            if rel.fk_side == FkSide::Target {
                return Err(mapping_error(
                    &entity.name,
                    format!(
                        "relationship '{}' keeps its foreign key in '{}' and needs a reverse relationship",
                        rel.name, rel.target
                    ),
                ));
            }
            return Ok(());
        };
        let reverse = entities
            .get(&rel.target)
            .and_then(|t| t.find_relationship(reverse_name))
            .ok_or_else(|| {
                mapping_error(
                    &entity.name,
                    format!("reverse '{}.{}' of '{}' is not mapped", rel.target, reverse_name, rel.name),
                )
            })?;
        if reverse.target != entity.name {
            return Err(mapping_error(
                &entity.name,
                format!("reverse '{}.{}' does not point back", rel.target, reverse_name),
            ));
        }
        if rel.fk_side == FkSide::Target && reverse.fk_side != FkSide::Source {
            return Err(mapping_error(
                &entity.name,
                format!("reverse of '{}' must hold the foreign key", rel.name),
            ));
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entities.get(name).ok_or_else(|| {
            Error::identity(
                IdentityErrorKind::UnknownEntity,
                format!("entity '{name}' is not mapped"),
            )
        })
    }

    pub fn relationship(&self, entity: &str, name: &str) -> Result<&Relationship> {
        self.entity(entity)?.find_relationship(name).ok_or_else(|| {
            Error::identity(
                IdentityErrorKind::UnknownProperty,
                format!("relationship '{entity}.{name}' is not mapped"),
            )
        })
    }

    /// The reverse of a relationship, if mapped.
    pub fn reverse_of(&self, rel: &Relationship) -> Option<&Relationship> {
        let name = rel.reverse.as_ref()?;
        self.entities.get(&rel.target)?.find_relationship(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entity-level foreign key graph: entity -> entities whose rows must
    /// exist before its rows can be inserted. Self references are omitted.
    pub fn entity_dependencies(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut deps: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for entity in self.entities.values() {
            deps.entry(entity.name.as_str()).or_default();
            for rel in &entity.relationships {
                if rel.source == rel.target {
                    continue;
                }
                match rel.fk_side {
                    FkSide::Source => {
                        deps.entry(rel.source.as_str()).or_default().insert(rel.target.as_str());
                    }
                    FkSide::Target => {
                        deps.entry(rel.target.as_str()).or_default().insert(rel.source.as_str());
                    }
                    FkSide::JoinTable => {}
                }
            }
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn artist() -> EntityDescriptor {
        EntityDescriptor::new("Artist", "artist")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("name").mandatory())
            .relationship(
                Relationship::to_many("paintings", "Painting")
                    .join("id", "artist_id")
                    .reverse("artist"),
            )
    }

    fn painting() -> EntityDescriptor {
        EntityDescriptor::new("Painting", "painting")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("title"))
            .attribute(DbAttribute::new("artist_id"))
            .relationship(
                Relationship::to_one("artist", "Artist")
                    .join("artist_id", "id")
                    .reverse("paintings"),
            )
    }

    #[test]
    fn computes_foreign_key_sides() {
        let resolver = EntityResolver::new([artist(), painting()]).unwrap();
        let to_many = resolver.relationship("Artist", "paintings").unwrap();
        let to_one = resolver.relationship("Painting", "artist").unwrap();
        assert_eq!(to_many.fk_side(), FkSide::Target);
        assert_eq!(to_one.fk_side(), FkSide::Source);
        assert!(to_one.is_nullable_fk());
        assert_eq!(resolver.reverse_of(to_one).unwrap().name, "paintings");
    }

    #[test]
    fn entity_graph_points_at_masters() {
        let resolver = EntityResolver::new([artist(), painting()]).unwrap();
        let deps = resolver.entity_dependencies();
        assert!(deps["Painting"].contains("Artist"));
        assert!(deps["Artist"].is_empty());
    }

    #[test]
    fn rejects_target_side_relationship_without_reverse() {
        let artist = EntityDescriptor::new("Artist", "artist")
            .attribute(DbAttribute::generated_pk("id"))
            .relationship(Relationship::to_many("paintings", "Painting").join("id", "artist_id"));
        let err = EntityResolver::new([artist, painting()]).unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn rejects_bad_identifiers_and_unknown_columns() {
        let bad = EntityDescriptor::new("Bad Name", "t").attribute(DbAttribute::pk("id"));
        assert!(EntityResolver::new([bad]).is_err());

        let painting = EntityDescriptor::new("Painting", "painting")
            .attribute(DbAttribute::generated_pk("id"))
            .relationship(Relationship::to_one("artist", "Artist").join("missing", "id"));
        assert!(EntityResolver::new([artist(), painting]).is_err());
    }

    #[test]
    fn id_from_row_requires_all_key_columns() {
        let e = EntityDescriptor::new("Exhibit", "exhibit")
            .attribute(DbAttribute::pk("gallery_id"))
            .attribute(DbAttribute::pk("seq"));
        let row = DataRow::from_pairs([("gallery_id", Value::Int(1)), ("seq", Value::Int(2))]);
        assert_eq!(
            e.id_from_row(&row),
            Some(ObjectId::compound("Exhibit", [("gallery_id", 1_i64), ("seq", 2_i64)]))
        );
        let partial = DataRow::from_pairs([("gallery_id", Value::Int(1)), ("seq", Value::Null)]);
        assert_eq!(e.id_from_row(&partial), None);
    }

    #[test]
    fn locking_columns_default_to_non_key_attributes() {
        let e = artist().optimistic_locking();
        assert_eq!(e.locking_columns(), vec!["name"]);
        let flagged = EntityDescriptor::new("X", "x")
            .attribute(DbAttribute::pk("id"))
            .attribute(DbAttribute::new("a"))
            .attribute(DbAttribute::new("v").used_for_locking());
        assert_eq!(flagged.locking_columns(), vec!["v"]);
    }
}
