//! Tables, keys and constraint checks of the in-memory store.

use cayenne_core::{
    DataRow, EntityResolver, Error, FkSide, JOIN_SOURCE_PREFIX, OperationKind, OperationResult,
    Qualifier, QueryError, QueryErrorKind, Result, RowOperation, SelectQuery, Value,
};
use std::collections::{BTreeMap, BTreeSet};

pub(crate) fn query_error(kind: QueryErrorKind, table: &str, message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind,
        table: Some(table.to_string()),
        message: message.into(),
        source: None,
    })
}

fn constraint(table: &str, message: impl Into<String>) -> Error {
    query_error(QueryErrorKind::Constraint, table, message)
}

/// Both values present, non-NULL and equal as keys.
fn same_key(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => !a.is_null() && a.key_eq(b),
        _ => false,
    }
}

/// Column layout and constraints of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    /// Auto-increment columns.
    pub generated: Vec<String>,
    pub not_null: Vec<String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            generated: Vec::new(),
            not_null: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(name.into());
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.not_null.push(name.clone());
        self.primary_key.push(name.clone());
        self.columns.push(name);
        self
    }

    pub fn generated_key(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.generated.push(name.clone());
        self.primary_key(name)
    }

    pub fn not_null(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.not_null.push(name.clone());
        self.columns.push(name);
        self
    }
}

/// A foreign key, checked on insert, update and delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Clone)]
struct Table {
    def: TableDef,
    rows: Vec<DataRow>,
    next_key: i64,
}

impl Table {
    fn check_row(&self, row: &DataRow, skip: Option<usize>) -> Result<()> {
        let table = &self.def.name;
        for column in &self.def.not_null {
            if row.get(column).is_none_or(Value::is_null) {
                return Err(constraint(
                    table,
                    format!("NOT NULL constraint failed: {table}.{column}"),
                ));
            }
        }
        if self.def.primary_key.is_empty() {
            return Ok(());
        }
        let duplicate = self.rows.iter().enumerate().any(|(i, other)| {
            Some(i) != skip
                && self
                    .def
                    .primary_key
                    .iter()
                    .all(|c| same_key(row.get(c), other.get(c)))
        });
        if duplicate {
            return Err(constraint(
                table,
                format!("UNIQUE constraint failed: {table}.{}", self.def.primary_key.join(", ")),
            ));
        }
        Ok(())
    }

    fn matching(&self, qualifier: &BTreeMap<String, Value>) -> Vec<usize> {
        let qualifier = Qualifier::Match(qualifier.clone());
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| qualifier.matches(row))
            .map(|(i, _)| i)
            .collect()
    }

    fn check_columns<'a>(&self, mut columns: impl Iterator<Item = &'a String>) -> Result<()> {
        match columns.find(|c| !self.def.columns.contains(c)) {
            Some(column) => Err(query_error(
                QueryErrorKind::NotFound,
                &self.def.name,
                format!("no such column: {}.{column}", self.def.name),
            )),
            None => Ok(()),
        }
    }
}

/// Every table of the store.
#[derive(Debug, Clone, Default)]
pub(crate) struct Database {
    tables: BTreeMap<String, Table>,
    foreign_keys: Vec<ForeignKey>,
}

impl Database {
    /// Tables and foreign keys for every entity and join table of a mapping.
    pub(crate) fn from_resolver(resolver: &EntityResolver) -> Self {
        let mut db = Database::default();
        for entity in resolver.entities() {
            let mut def = TableDef::new(entity.table.clone());
            for attribute in entity.attributes() {
                def.columns.push(attribute.name.clone());
                if attribute.primary_key {
                    def.primary_key.push(attribute.name.clone());
                }
                if attribute.generated {
                    def.generated.push(attribute.name.clone());
                }
                if attribute.primary_key || attribute.mandatory {
                    def.not_null.push(attribute.name.clone());
                }
            }
            db.add_table(def);
        }

        for entity in resolver.entities() {
            for rel in entity.relationships() {
                let Ok(target) = resolver.entity(&rel.target) else {
                    continue;
                };
                match (&rel.join_table, rel.fk_side()) {
                    (Some(join_table), _) => {
                        if !db.tables.contains_key(&join_table.table) {
                            let columns: Vec<String> =
                                join_table.columns().map(str::to_string).collect();
                            let mut def = TableDef::new(join_table.table.clone());
                            def.columns.clone_from(&columns);
                            def.primary_key.clone_from(&columns);
                            def.not_null = columns;
                            db.add_table(def);
                        }
                        db.add_foreign_key(ForeignKey {
                            table: join_table.table.clone(),
                            columns: join_table.source_joins.iter().map(|j| j.target.clone()).collect(),
                            referenced_table: entity.table.clone(),
                            referenced_columns: join_table.source_joins.iter().map(|j| j.source.clone()).collect(),
                        });
                        db.add_foreign_key(ForeignKey {
                            table: join_table.table.clone(),
                            columns: join_table.target_joins.iter().map(|j| j.source.clone()).collect(),
                            referenced_table: target.table.clone(),
                            referenced_columns: join_table.target_joins.iter().map(|j| j.target.clone()).collect(),
                        });
                    }
                    (None, FkSide::Source) => db.add_foreign_key(ForeignKey {
                        table: entity.table.clone(),
                        columns: rel.source_columns().map(str::to_string).collect(),
                        referenced_table: target.table.clone(),
                        referenced_columns: rel.target_columns().map(str::to_string).collect(),
                    }),
                    (None, _) => db.add_foreign_key(ForeignKey {
                        table: target.table.clone(),
                        columns: rel.target_columns().map(str::to_string).collect(),
                        referenced_table: entity.table.clone(),
                        referenced_columns: rel.source_columns().map(str::to_string).collect(),
                    }),
                }
            }
        }
        db
    }

    pub(crate) fn add_table(&mut self, def: TableDef) {
        self.tables.insert(
            def.name.clone(),
            Table {
                def,
                rows: Vec::new(),
                next_key: 1,
            },
        );
    }

    pub(crate) fn add_foreign_key(&mut self, fk: ForeignKey) {
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| {
            query_error(QueryErrorKind::NotFound, name, format!("no such table: {name}"))
        })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| {
            query_error(QueryErrorKind::NotFound, name, format!("no such table: {name}"))
        })
    }

    pub(crate) fn generated_columns(&self, table: &str) -> Vec<String> {
        self.tables
            .get(table)
            .map(|t| t.def.generated.clone())
            .unwrap_or_default()
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<DataRow> {
        self.tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub(crate) fn select(&self, query: &SelectQuery) -> Result<Vec<DataRow>> {
        let table = self.table(&query.table)?;
        let mut rows: Vec<DataRow> = match &query.qualifier {
            Qualifier::ThroughJoinTable {
                join_table,
                target_joins,
                source_columns,
                keys,
            } => {
                let link = self.table(join_table)?;
                let mut out = Vec::new();
                for link_row in &link.rows {
                    let linked = keys.iter().any(|key| {
                        source_columns
                            .iter()
                            .zip(key)
                            .all(|(c, v)| same_key(link_row.get(c), Some(v)))
                    });
                    if !linked {
                        continue;
                    }
                    for row in &table.rows {
                        if target_joins
                            .iter()
                            .all(|j| same_key(link_row.get(&j.source), row.get(&j.target)))
                        {
                            let mut row = row.clone();
                            for c in source_columns {
                                row.insert(
                                    format!("{JOIN_SOURCE_PREFIX}.{c}"),
                                    link_row.get(c).cloned().unwrap_or(Value::Null),
                                );
                            }
                            out.push(row);
                        }
                    }
                }
                out
            }
            qualifier => table
                .rows
                .iter()
                .filter(|row| qualifier.matches(row))
                .cloned()
                .collect(),
        };

        for joint in &query.joints {
            let joined = self.table(&joint.table)?;
            let mut expanded = Vec::with_capacity(rows.len());
            for row in rows {
                let matches: Vec<&DataRow> = joined
                    .rows
                    .iter()
                    .filter(|j| {
                        joint
                            .joins
                            .iter()
                            .all(|join| same_key(row.get(&join.source), j.get(&join.target)))
                    })
                    .collect();
                if matches.is_empty() {
                    let mut row = row;
                    for c in &joined.def.columns {
                        row.insert(format!("{}.{c}", joint.path), Value::Null);
                    }
                    expanded.push(row);
                    continue;
                }
                for m in matches {
                    let mut out = row.clone();
                    for c in &joined.def.columns {
                        out.insert(
                            format!("{}.{c}", joint.path),
                            m.get(c).cloned().unwrap_or(Value::Null),
                        );
                    }
                    expanded.push(out);
                }
            }
            rows = expanded;
        }

        if let Some(columns) = &query.columns {
            let source_prefix = format!("{JOIN_SOURCE_PREFIX}.");
            rows = rows
                .into_iter()
                .map(|row| {
                    row.into_values()
                        .into_iter()
                        .filter(|(c, _)| columns.contains(c) || c.starts_with(&source_prefix))
                        .collect()
                })
                .collect();
        }
        Ok(rows)
    }

    pub(crate) fn perform(&mut self, op: &RowOperation) -> Result<OperationResult> {
        match op.kind {
            OperationKind::Insert | OperationKind::JoinInsert => {
                self.insert(&op.table, op.values.clone(), &op.generated_keys)
            }
            OperationKind::Update => {
                let rows_affected = self.update(&op.table, &op.qualifier, &op.values)?;
                Ok(OperationResult {
                    rows_affected,
                    generated_keys: BTreeMap::new(),
                })
            }
            OperationKind::Delete | OperationKind::JoinDelete => {
                let rows_affected = self.delete(&op.table, &op.qualifier)?;
                Ok(OperationResult {
                    rows_affected,
                    generated_keys: BTreeMap::new(),
                })
            }
        }
    }

    /// Insert a row, generating values for the listed key columns that are
    /// missing or NULL.
    pub(crate) fn insert(
        &mut self,
        name: &str,
        values: BTreeMap<String, Value>,
        generated: &[String],
    ) -> Result<OperationResult> {
        let table = self.table_mut(name)?;
        table.check_columns(values.keys())?;
        let mut row = DataRow::from_values(values);
        let mut keys = BTreeMap::new();
        for column in generated {
            match row.get(column).and_then(Value::as_i64) {
                Some(explicit) => table.next_key = table.next_key.max(explicit + 1),
                None => {
                    let value = Value::BigInt(table.next_key);
                    table.next_key += 1;
                    row.insert(column.clone(), value.clone());
                    keys.insert(column.clone(), value);
                }
            }
        }
        for column in &table.def.columns {
            if !row.contains_column(column) {
                row.insert(column.clone(), Value::Null);
            }
        }
        table.check_row(&row, None)?;
        self.check_references(name, &row)?;
        self.table_mut(name)?.rows.push(row);
        Ok(OperationResult {
            rows_affected: 1,
            generated_keys: keys,
        })
    }

    pub(crate) fn update(
        &mut self,
        name: &str,
        qualifier: &BTreeMap<String, Value>,
        values: &BTreeMap<String, Value>,
    ) -> Result<u64> {
        let table = self.table(name)?;
        table.check_columns(values.keys())?;
        let mut updated = Vec::new();
        for i in table.matching(qualifier) {
            let mut row = table.rows[i].clone();
            for (column, value) in values {
                row.insert(column.clone(), value.clone());
            }
            table.check_row(&row, Some(i))?;
            self.check_references(name, &row)?;
            updated.push((i, row));
        }
        let count = updated.len() as u64;
        let table = self.table_mut(name)?;
        for (i, row) in updated {
            table.rows[i] = row;
        }
        Ok(count)
    }

    pub(crate) fn delete(&mut self, name: &str, qualifier: &BTreeMap<String, Value>) -> Result<u64> {
        let table = self.table(name)?;
        let doomed: BTreeSet<usize> = table.matching(qualifier).into_iter().collect();
        for &i in &doomed {
            self.check_not_referenced(name, &table.rows[i], &doomed)?;
        }
        let table = self.table_mut(name)?;
        let mut index = 0;
        table.rows.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
        Ok(doomed.len() as u64)
    }

    /// Every non-NULL foreign key of `row` must point at an existing row.
    fn check_references(&self, table: &str, row: &DataRow) -> Result<()> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let key: Vec<&Value> = fk
                .columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&Value::Null))
                .collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let referenced = self.table(&fk.referenced_table)?;
            let exists = referenced.rows.iter().any(|r| {
                fk.referenced_columns
                    .iter()
                    .zip(&key)
                    .all(|(c, v)| same_key(r.get(c), Some(v)))
            });
            if !exists {
                return Err(constraint(
                    table,
                    format!(
                        "FOREIGN KEY constraint failed: {table}({}) references missing {} row",
                        fk.columns.join(", "),
                        fk.referenced_table
                    ),
                ));
            }
        }
        Ok(())
    }

    /// No row outside `skip` may reference `row`.
    fn check_not_referenced(&self, table: &str, row: &DataRow, skip: &BTreeSet<usize>) -> Result<()> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.referenced_table == table) {
            let key: Vec<&Value> = fk
                .referenced_columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&Value::Null))
                .collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let referencing = self.table(&fk.table)?;
            let referenced = referencing.rows.iter().enumerate().any(|(i, r)| {
                !(fk.table == table && skip.contains(&i))
                    && fk.columns.iter().zip(&key).all(|(c, v)| same_key(r.get(c), Some(v)))
            });
            if referenced {
                return Err(constraint(
                    table,
                    format!(
                        "FOREIGN KEY constraint failed: {table} row is referenced by {}({})",
                        fk.table,
                        fk.columns.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let mut db = Database::default();
        db.add_table(TableDef::new("artist").generated_key("id").not_null("name"));
        db.add_table(
            TableDef::new("painting")
                .generated_key("id")
                .column("title")
                .column("artist_id"),
        );
        db.add_foreign_key(ForeignKey {
            table: "painting".into(),
            columns: vec!["artist_id".into()],
            referenced_table: "artist".into(),
            referenced_columns: vec!["id".into()],
        });
        db
    }

    fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(c, v)| ((*c).to_string(), v.clone())).collect()
    }

    #[test]
    fn insert_generates_keys() {
        let mut db = db();
        let generated = vec!["id".to_string()];
        let first = db
            .insert("artist", values(&[("name", Value::Text("A".into()))]), &generated)
            .unwrap();
        let second = db
            .insert("artist", values(&[("name", Value::Text("B".into()))]), &generated)
            .unwrap();
        assert_eq!(first.generated_keys.get("id"), Some(&Value::BigInt(1)));
        assert_eq!(second.generated_keys.get("id"), Some(&Value::BigInt(2)));
    }

    #[test]
    fn not_null_and_foreign_keys_are_enforced() {
        let mut db = db();
        let err = db.insert("artist", BTreeMap::new(), &[]).unwrap_err();
        assert!(err.is_constraint_violation());

        let err = db
            .insert("painting", values(&[("id", Value::BigInt(1)), ("artist_id", Value::BigInt(9))]), &[])
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn referenced_rows_cannot_be_deleted() {
        let mut db = db();
        db.insert("artist", values(&[("id", Value::BigInt(1)), ("name", Value::Text("A".into()))]), &[])
            .unwrap();
        db.insert("painting", values(&[("id", Value::BigInt(5)), ("artist_id", Value::Int(1))]), &[])
            .unwrap();
        let err = db.delete("artist", &values(&[("id", Value::BigInt(1))])).unwrap_err();
        assert!(err.is_constraint_violation());

        assert_eq!(db.delete("painting", &values(&[("id", Value::BigInt(5))])).unwrap(), 1);
        assert_eq!(db.delete("artist", &values(&[("id", Value::BigInt(1))])).unwrap(), 1);
        assert!(db.rows("artist").is_empty());
    }

    #[test]
    fn joint_select_keeps_unmatched_rows() {
        let mut db = db();
        db.insert("artist", values(&[("id", Value::BigInt(1)), ("name", Value::Text("A".into()))]), &[])
            .unwrap();
        db.insert("painting", values(&[("id", Value::BigInt(1)), ("artist_id", Value::BigInt(1))]), &[])
            .unwrap();
        db.insert("painting", values(&[("id", Value::BigInt(2))]), &[]).unwrap();

        let query = SelectQuery::new("Painting", "painting").joint(cayenne_core::JointSpec {
            path: "artist".into(),
            table: "artist".into(),
            joins: vec![cayenne_core::Join::new("artist_id", "id")],
        });
        let rows = db.select(&query).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].prefixed("artist").is_some());
        assert!(rows[1].prefixed("artist").is_none());
    }

    #[test]
    fn projection_keeps_requested_columns() {
        let mut db = db();
        db.insert("painting", values(&[("id", Value::BigInt(1)), ("title", Value::Text("T".into()))]), &[])
            .unwrap();
        let query = SelectQuery::new("Painting", "painting").columns(vec!["id".into()]);
        let rows = db.select(&query).unwrap();
        assert_eq!(rows[0].len(), 1);
        assert!(rows[0].contains_column("id"));
    }
}
