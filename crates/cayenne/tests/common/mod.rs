//! Shared mapping and helpers for the integration tests.

#![allow(dead_code)]

use cayenne::prelude::*;
use cayenne::{DataRow, OperationKind, RowOperation};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

/// Artists, their paintings, galleries showing them, exhibition groups
/// joined through `artist_group`, and a profile sharing the artist key.
pub fn gallery_mapping() -> EntityResolver {
    EntityResolver::new([
        EntityDescriptor::new("Artist", "artist")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("name").mandatory())
            .relationship(
                Relationship::to_many("paintings", "Painting")
                    .join("id", "artist_id")
                    .reverse("artist")
                    .delete_rule(DeleteRule::Nullify),
            )
            .relationship(
                Relationship::to_one("profile", "ArtistProfile")
                    .join("id", "artist_id")
                    .to_dependent_pk()
                    .reverse("artist")
                    .delete_rule(DeleteRule::Cascade),
            )
            .relationship(
                Relationship::flattened(
                    "groups",
                    "ArtGroup",
                    JoinTable::new("artist_group")
                        .source_join("id", "artist_id")
                        .target_join("group_id", "id"),
                )
                .reverse("artists")
                .delete_rule(DeleteRule::Nullify),
            ),
        EntityDescriptor::new("ArtistProfile", "artist_profile")
            .attribute(DbAttribute::pk("artist_id"))
            .attribute(DbAttribute::new("bio"))
            .relationship(
                Relationship::to_one("artist", "Artist")
                    .join("artist_id", "id")
                    .reverse("profile"),
            ),
        EntityDescriptor::new("Painting", "painting")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("title"))
            .attribute(DbAttribute::new("artist_id"))
            .attribute(DbAttribute::new("gallery_id"))
            .relationship(
                Relationship::to_one("artist", "Artist")
                    .join("artist_id", "id")
                    .reverse("paintings"),
            )
            .relationship(
                Relationship::to_one("gallery", "Gallery")
                    .join("gallery_id", "id")
                    .reverse("paintings"),
            ),
        EntityDescriptor::new("Gallery", "gallery")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("name"))
            .relationship(
                Relationship::to_many("paintings", "Painting")
                    .join("id", "gallery_id")
                    .reverse("gallery")
                    .delete_rule(DeleteRule::Deny),
            ),
        EntityDescriptor::new("ArtGroup", "art_group")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("name"))
            .relationship(
                Relationship::flattened(
                    "artists",
                    "Artist",
                    JoinTable::new("artist_group")
                        .source_join("id", "group_id")
                        .target_join("artist_id", "id"),
                )
                .reverse("groups"),
            ),
    ])
    .expect("valid gallery mapping")
}

/// A self-referencing tree.
pub fn tree_mapping() -> EntityResolver {
    EntityResolver::new([EntityDescriptor::new("TreeNode", "tree_node")
        .attribute(DbAttribute::generated_pk("id"))
        .attribute(DbAttribute::new("name"))
        .attribute(DbAttribute::new("parent_id"))
        .relationship(
            Relationship::to_one("parent", "TreeNode")
                .join("parent_id", "id")
                .reverse("children"),
        )
        .relationship(
            Relationship::to_many("children", "TreeNode")
                .join("id", "parent_id")
                .reverse("parent")
                .delete_rule(DeleteRule::Cascade),
        )])
    .expect("valid tree mapping")
}

/// Departments and employees referencing each other. The manager key is
/// nullable, the department key is not.
pub fn department_mapping() -> EntityResolver {
    EntityResolver::new([
        EntityDescriptor::new("Department", "department")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("manager_id"))
            .relationship(Relationship::to_one("manager", "Employee").join("manager_id", "id")),
        EntityDescriptor::new("Employee", "employee")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("name"))
            .attribute(DbAttribute::new("department_id").mandatory())
            .relationship(
                Relationship::to_one("department", "Department").join("department_id", "id"),
            ),
    ])
    .expect("valid department mapping")
}

/// Two entities whose mandatory keys point at each other.
pub fn deadlock_mapping() -> EntityResolver {
    EntityResolver::new([
        EntityDescriptor::new("Left", "left_side")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("right_id").mandatory())
            .relationship(Relationship::to_one("right", "Right").join("right_id", "id")),
        EntityDescriptor::new("Right", "right_side")
            .attribute(DbAttribute::generated_pk("id"))
            .attribute(DbAttribute::new("left_id").mandatory())
            .relationship(Relationship::to_one("left", "Left").join("left_id", "id")),
    ])
    .expect("valid deadlock mapping")
}

pub fn memory_runtime(resolver: EntityResolver, config: RuntimeConfig) -> CayenneRuntime<MemoryNode> {
    let node = MemoryNode::from_resolver("memory", &resolver);
    CayenneRuntime::new(node, resolver, config)
}

pub fn gallery_runtime() -> CayenneRuntime<MemoryNode> {
    memory_runtime(gallery_mapping(), RuntimeConfig::new("gallery"))
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

pub fn row(pairs: &[(&str, Value)]) -> DataRow {
    DataRow::from_pairs(pairs.iter().map(|(c, v)| (*c, v.clone())))
}

/// Insert a row directly into the node and return its generated id.
pub fn seed(node: &MemoryNode, table: &str, pairs: &[(&str, Value)]) -> i64 {
    let generated = node.insert_row(table, row(pairs)).expect("seed row");
    generated
        .get("id")
        .and_then(Value::as_i64)
        .or_else(|| pairs.iter().find(|(c, _)| *c == "id").and_then(|(_, v)| v.as_i64()))
        .unwrap_or_default()
}

pub fn artist_id(id: i64) -> ObjectId {
    ObjectId::single("Artist", "id", id)
}

pub fn painting_id(id: i64) -> ObjectId {
    ObjectId::single("Painting", "id", id)
}

/// `(kind, table)` of every executed operation.
pub fn shape(operations: &[RowOperation]) -> Vec<(OperationKind, String)> {
    operations.iter().map(|op| (op.kind, op.table.clone())).collect()
}

pub fn op(kind: OperationKind, table: &str) -> (OperationKind, String) {
    (kind, table.to_string())
}
