//! In-memory store for development and testing
//!
//! Tables are vectors of rows in insertion order. A session holds the store
//! lock for its whole lifetime and snapshots the database before its first
//! write so it can be rolled back.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use regex::Regex;
use restless_common::{Error, Result};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{Group, Row, Session, Store};
use crate::compiler::{OrderKey, Predicate, Query};
use crate::model::{ColumnRef, FieldType, ModelMetadata, RelationKind, Relationship};
use crate::registry::ModelRegistry;
use crate::search::Direction;
use crate::value::Scalar;

type Patterns = HashMap<(String, bool), Regex>;

#[derive(Debug, Clone, Default)]
struct Database {
    tables: HashMap<String, Vec<Row>>,
    sequences: HashMap<String, i64>,
}

/// Store keeping every table in memory
pub struct InMemoryStore {
    registry: Arc<ModelRegistry>,
    database: Mutex<Database>,
}

impl InMemoryStore {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            database: Mutex::new(Database::default()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Open a session without boxing it
    pub fn session(&self) -> MemorySession<'_> {
        MemorySession {
            registry: &self.registry,
            database: self.database.lock(),
            snapshot: None,
        }
    }
}

impl Store for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn Session + '_>> {
        Ok(Box::new(self.session()))
    }
}

/// Transaction over an [`InMemoryStore`]
pub struct MemorySession<'a> {
    registry: &'a ModelRegistry,
    database: MutexGuard<'a, Database>,
    snapshot: Option<Database>,
}

impl Drop for MemorySession<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.database = snapshot;
            debug!("Session rolled back");
        }
    }
}

impl<'a> MemorySession<'a> {
    fn model(&self, name: &str) -> Result<&'a dyn ModelMetadata> {
        self.registry.target(name)
    }

    fn relationship<'m>(&self, model: &'m dyn ModelMetadata, name: &str) -> Result<&'m Relationship> {
        model.relationship(name).ok_or_else(|| Error::UnknownField {
            model: model.name().to_string(),
            field: name.to_string(),
        })
    }

    fn table(&self, name: &str) -> &[Row] {
        self.database
            .tables
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Mutable access, snapshotting before the first write
    fn write(&mut self) -> &mut Database {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.database.clone());
        }
        &mut *self.database
    }

    fn set_column(&mut self, table: &str, index: usize, column: &str, value: Value) {
        if let Some(row) = self.write().tables.get_mut(table).and_then(|t| t.get_mut(index)) {
            row.insert(column.to_string(), value);
        }
    }

    fn find_index(&self, model: &dyn ModelMetadata, id: &Scalar) -> Option<usize> {
        let pk = model.primary_key();
        let pk_type = model.primary_key_column().map_or(FieldType::Integer, |c| c.field_type);
        self.table(model.name())
            .iter()
            .position(|row| Scalar::from_stored(pk_type, row.get(pk)).matches(id))
    }

    fn locate(&self, model: &dyn ModelMetadata, id: &Scalar) -> Result<usize> {
        self.find_index(model, id)
            .ok_or_else(|| Error::not_found(model.name(), id))
    }

    fn key_of<'r>(&self, model: &dyn ModelMetadata, row: &'r Row) -> Option<&'r Value> {
        row.get(model.primary_key()).filter(|v| !v.is_null())
    }

    fn related_rows(&self, model: &dyn ModelMetadata, row: &Row, rel: &Relationship) -> Result<Vec<Row>> {
        let target = self.model(&rel.target)?;
        let target_pk = target.primary_key();
        let rows = match &rel.kind {
            RelationKind::ManyToOne { foreign_key } => match row.get(foreign_key).filter(|v| !v.is_null()) {
                Some(fk) => self
                    .table(target.name())
                    .iter()
                    .filter(|r| r.get(target_pk) == Some(fk))
                    .cloned()
                    .collect(),
                None => vec![],
            },
            RelationKind::OneToMany { remote_key } => match self.key_of(model, row) {
                Some(pk) => self
                    .table(target.name())
                    .iter()
                    .filter(|r| r.get(remote_key) == Some(pk))
                    .cloned()
                    .collect(),
                None => vec![],
            },
            RelationKind::ManyToMany {
                secondary,
                local_key,
                remote_key,
            } => {
                let Some(pk) = self.key_of(model, row) else {
                    return Ok(vec![]);
                };
                let ids: Vec<&Value> = self
                    .table(secondary)
                    .iter()
                    .filter(|a| a.get(local_key) == Some(pk))
                    .filter_map(|a| a.get(remote_key))
                    .collect();
                self.table(target.name())
                    .iter()
                    .filter(|r| r.get(target_pk).is_some_and(|v| ids.contains(&v)))
                    .cloned()
                    .collect()
            }
        };
        Ok(rows)
    }

    fn matches(
        &self,
        model: &dyn ModelMetadata,
        row: &Row,
        predicate: &Predicate,
        patterns: &Patterns,
    ) -> Result<bool> {
        let matched = match predicate {
            Predicate::Always => true,
            Predicate::Compare { column, op, param } => stored(row, column)
                .compare(param)
                .is_some_and(|ord| op.matches(ord)),
            Predicate::CompareColumns { left, op, right } => stored(row, left)
                .compare(&stored(row, right))
                .is_some_and(|ord| op.matches(ord)),
            Predicate::Like {
                column,
                pattern,
                case_insensitive,
                negated,
            } => match stored(row, column) {
                Scalar::Text(text) => {
                    let found = patterns
                        .get(&(pattern.clone(), *case_insensitive))
                        .is_some_and(|re| re.is_match(&text));
                    found != *negated
                }
                _ => false,
            },
            Predicate::InList {
                column,
                params,
                negated,
            } => {
                let value = stored(row, column);
                !value.is_null() && params.iter().any(|p| value.matches(p)) != *negated
            }
            Predicate::IsNull { column, negated } => stored(row, column).is_null() != *negated,
            Predicate::Related { relation, predicate } => {
                let rel = self.relationship(model, relation)?;
                let target = self.model(&rel.target)?;
                for related in self.related_rows(model, row, rel)? {
                    if self.matches(target, &related, predicate, patterns)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::And(children) => {
                for child in children {
                    if !self.matches(model, row, child, patterns)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Or(children) => {
                for child in children {
                    if self.matches(model, row, child, patterns)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::Not(inner) => !self.matches(model, row, inner, patterns)?,
        };
        Ok(matched)
    }

    /// Filtered and sorted rows, before grouping and pagination
    fn scan(&self, query: &Query) -> Result<Vec<Row>> {
        let model = self.model(&query.model)?;
        let mut patterns = Patterns::new();
        compile_patterns(&query.predicate, &mut patterns)?;

        let mut keyed = vec![];
        for row in self.table(model.name()) {
            if self.matches(model, row, &query.predicate, &patterns)? {
                let keys = query
                    .order_by
                    .iter()
                    .map(|key| self.sort_value(model, row, key))
                    .collect::<Result<Vec<_>>>()?;
                keyed.push((keys, row.clone()));
            }
        }

        if !query.order_by.is_empty() {
            keyed.sort_by(|(a, _), (b, _)| compare_keys(a, b, &query.order_by));
        }
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    fn sort_value(&self, model: &dyn ModelMetadata, row: &Row, key: &OrderKey) -> Result<Scalar> {
        let Some(relation) = &key.relation else {
            return Ok(stored(row, &key.column));
        };
        let rel = self.relationship(model, relation)?;
        Ok(self
            .related_rows(model, row, rel)?
            .first()
            .map_or(Scalar::Null, |r| stored(r, &key.column)))
    }

    fn group(rows: Vec<Row>, columns: &[ColumnRef]) -> Vec<Group> {
        let mut groups: Vec<Group> = vec![];
        for row in rows {
            let key: Row = columns
                .iter()
                .map(|c| (c.name.clone(), stored(&row, c).to_json()))
                .collect();
            match groups.iter_mut().find(|g| g.key == key) {
                Some(group) => group.rows.push(row),
                None => groups.push(Group { key, rows: vec![row] }),
            }
        }
        groups
    }

    /// Every `ManyToOne` key in `row` must reference an existing row
    fn check_references(&self, model: &dyn ModelMetadata, row: &Row) -> Result<()> {
        for rel in model.relationships() {
            let RelationKind::ManyToOne { foreign_key } = &rel.kind else {
                continue;
            };
            let Some(fk) = row.get(foreign_key).filter(|v| !v.is_null()) else {
                continue;
            };
            let target = self.model(&rel.target)?;
            let exists = self
                .table(target.name())
                .iter()
                .any(|r| r.get(target.primary_key()) == Some(fk));
            if !exists {
                return Err(Error::Conflict(format!(
                    "'{}.{foreign_key}' references missing '{}' {fk}",
                    model.name(),
                    target.name()
                )));
            }
        }
        Ok(())
    }

    /// Refuse to delete a row other rows still point at through a key
    fn check_unreferenced(&self, model: &dyn ModelMetadata, pk: &Value) -> Result<()> {
        for other in self.registry.models() {
            for rel in other.relationships() {
                let (table, column) = match &rel.kind {
                    RelationKind::ManyToOne { foreign_key } if rel.target == model.name() => {
                        (other.name(), foreign_key)
                    }
                    RelationKind::OneToMany { remote_key } if other.name() == model.name() => {
                        (rel.target.as_str(), remote_key)
                    }
                    _ => continue,
                };
                if self.table(table).iter().any(|r| r.get(column) == Some(pk)) {
                    return Err(Error::Conflict(format!(
                        "'{}' {pk} is still referenced through '{}.{}'",
                        model.name(),
                        other.name(),
                        rel.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop the association rows naming a row on either side
    fn unlink(&mut self, model: &dyn ModelMetadata, pk: &Value) -> usize {
        let registry = self.registry;
        let mut removed = 0;
        for other in registry.models() {
            for rel in other.relationships() {
                let RelationKind::ManyToMany {
                    secondary,
                    local_key,
                    remote_key,
                } = &rel.kind
                else {
                    continue;
                };
                let mut columns = vec![];
                if other.name() == model.name() {
                    columns.push(local_key);
                }
                if rel.target == model.name() {
                    columns.push(remote_key);
                }
                if columns.is_empty() || self.table(secondary).is_empty() {
                    continue;
                }
                if let Some(table) = self.write().tables.get_mut(secondary) {
                    let before = table.len();
                    table.retain(|a| !columns.iter().any(|c| a.get(*c) == Some(pk)));
                    removed += before - table.len();
                }
            }
        }
        removed
    }

    fn next_id(&mut self, model: &dyn ModelMetadata) -> i64 {
        let pk = model.primary_key();
        let highest = self
            .table(model.name())
            .iter()
            .filter_map(|r| r.get(pk).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        let sequence = self.write().sequences.entry(model.name().to_string()).or_insert(0);
        *sequence = (*sequence).max(highest) + 1;
        *sequence
    }
}

impl Session for MemorySession<'_> {
    fn select(&self, query: &Query) -> Result<Vec<Row>> {
        let rows = self.scan(query)?;
        if query.is_grouped() {
            let groups = paginate(Self::group(rows, &query.group_by), query);
            return Ok(groups.into_iter().filter_map(|g| g.rows.into_iter().next()).collect());
        }
        Ok(paginate(rows, query))
    }

    fn select_groups(&self, query: &Query) -> Result<Vec<Group>> {
        let rows = self.scan(query)?;
        Ok(paginate(Self::group(rows, &query.group_by), query))
    }

    fn count(&self, query: &Query) -> Result<usize> {
        let rows = self.scan(query)?;
        if query.is_grouped() {
            return Ok(Self::group(rows, &query.group_by).len());
        }
        Ok(rows.len())
    }

    fn get(&self, model: &str, id: &Scalar) -> Result<Option<Row>> {
        let meta = self.model(model)?;
        Ok(self.find_index(meta, id).map(|i| self.table(model)[i].clone()))
    }

    fn insert(&mut self, model: &str, mut row: Row) -> Result<Scalar> {
        let meta = self.model(model)?;
        let pk = meta.primary_key();
        let pk_column = meta
            .primary_key_column()
            .ok_or_else(|| Error::Config(format!("model '{model}' has no primary key column")))?;

        let id = match row.get(pk).filter(|v| !v.is_null()) {
            Some(value) => Scalar::from_stored(pk_column.field_type, Some(value)),
            None if pk_column.autoincrement => Scalar::Int(self.next_id(meta)),
            None if pk_column.field_type == FieldType::Uuid => Scalar::Uuid(Uuid::new_v4()),
            None => return Err(Error::invalid_field(pk, "a primary key is required")),
        };
        if self.find_index(meta, &id).is_some() {
            return Err(Error::Conflict(format!("'{model}' {id} already exists")));
        }

        row.insert(pk.to_string(), id.to_json());
        for column in meta.columns() {
            row.entry(column.name.clone()).or_insert(Value::Null);
        }
        self.check_references(meta, &row)?;

        self.write().tables.entry(model.to_string()).or_default().push(row);
        debug!(model, id = %id, "Inserted row");
        Ok(id)
    }

    fn update(&mut self, model: &str, id: &Scalar, changes: &Row) -> Result<()> {
        let meta = self.model(model)?;
        let index = self.locate(meta, id)?;
        if let Some(new_pk) = changes.get(meta.primary_key()) {
            if self.table(model)[index].get(meta.primary_key()) != Some(new_pk) {
                return Err(Error::Conflict(format!("primary key of '{model}' {id} cannot change")));
            }
        }
        self.check_references(meta, changes)?;

        if let Some(row) = self.write().tables.get_mut(model).and_then(|t| t.get_mut(index)) {
            for (column, value) in changes {
                row.insert(column.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn delete(&mut self, model: &str, id: &Scalar) -> Result<bool> {
        let meta = self.model(model)?;
        let Some(index) = self.find_index(meta, id) else {
            return Ok(false);
        };
        let mut unlinked = 0;
        if let Some(pk) = self.key_of(meta, &self.table(model)[index]).cloned() {
            self.check_unreferenced(meta, &pk)?;
            unlinked = self.unlink(meta, &pk);
        }
        if let Some(table) = self.write().tables.get_mut(model) {
            table.remove(index);
        }
        debug!(model, id = %id, unlinked, "Deleted row");
        Ok(true)
    }

    fn related(&self, model: &str, id: &Scalar, relation: &str) -> Result<Vec<Row>> {
        let meta = self.model(model)?;
        let rel = self.relationship(meta, relation)?;
        let index = self.locate(meta, id)?;
        self.related_rows(meta, &self.table(model)[index], rel)
    }

    fn attach(&mut self, model: &str, id: &Scalar, relation: &str, target: &Scalar) -> Result<()> {
        let meta = self.model(model)?;
        let rel = self.relationship(meta, relation)?;
        let target_meta = self.model(&rel.target)?;
        let owner_index = self.locate(meta, id)?;
        let target_index = self.locate(target_meta, target)?;
        let owner_pk = self.table(model)[owner_index].get(meta.primary_key()).cloned().unwrap_or(Value::Null);
        let target_pk = self.table(target_meta.name())[target_index]
            .get(target_meta.primary_key())
            .cloned()
            .unwrap_or(Value::Null);

        match &rel.kind {
            RelationKind::ManyToOne { foreign_key } => {
                self.set_column(model, owner_index, foreign_key, target_pk);
            }
            RelationKind::OneToMany { remote_key } => {
                self.set_column(target_meta.name(), target_index, remote_key, owner_pk);
            }
            RelationKind::ManyToMany {
                secondary,
                local_key,
                remote_key,
            } => {
                let linked = self
                    .table(secondary)
                    .iter()
                    .any(|a| a.get(local_key) == Some(&owner_pk) && a.get(remote_key) == Some(&target_pk));
                if !linked {
                    let mut pair = Row::new();
                    pair.insert(local_key.clone(), owner_pk);
                    pair.insert(remote_key.clone(), target_pk);
                    self.write().tables.entry(secondary.clone()).or_default().push(pair);
                }
            }
        }
        Ok(())
    }

    fn detach(&mut self, model: &str, id: &Scalar, relation: &str, target: &Scalar) -> Result<bool> {
        let meta = self.model(model)?;
        let rel = self.relationship(meta, relation)?;
        let target_meta = self.model(&rel.target)?;
        let owner_index = self.locate(meta, id)?;
        let Some(target_index) = self.find_index(target_meta, target) else {
            return Ok(false);
        };
        let owner_row = &self.table(model)[owner_index];
        let target_row = &self.table(target_meta.name())[target_index];
        let owner_pk = owner_row.get(meta.primary_key()).cloned();
        let target_pk = target_row.get(target_meta.primary_key()).cloned();

        match &rel.kind {
            RelationKind::ManyToOne { foreign_key } => {
                if owner_row.get(foreign_key).cloned() != target_pk {
                    return Ok(false);
                }
                self.set_column(model, owner_index, foreign_key, Value::Null);
            }
            RelationKind::OneToMany { remote_key } => {
                if target_row.get(remote_key).cloned() != owner_pk {
                    return Ok(false);
                }
                self.set_column(target_meta.name(), target_index, remote_key, Value::Null);
            }
            RelationKind::ManyToMany {
                secondary,
                local_key,
                remote_key,
            } => {
                let position = self.table(secondary).iter().position(|a| {
                    a.get(local_key).cloned() == owner_pk && a.get(remote_key).cloned() == target_pk
                });
                let Some(position) = position else {
                    return Ok(false);
                };
                if let Some(table) = self.write().tables.get_mut(secondary) {
                    table.remove(position);
                }
            }
        }
        Ok(true)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if self.snapshot.take().is_some() {
            debug!("Session committed");
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

fn stored(row: &Row, column: &ColumnRef) -> Scalar {
    Scalar::from_stored(column.field_type, row.get(&column.name))
}

fn paginate<T>(items: Vec<T>, query: &Query) -> Vec<T> {
    items
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}

/// Nulls sort first, ties keep insertion order
fn compare_keys(a: &[Scalar], b: &[Scalar], keys: &[OrderKey]) -> Ordering {
    for ((a, b), key) in a.iter().zip(b).zip(keys) {
        let ordering = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
        };
        let ordering = match key.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compile_patterns(predicate: &Predicate, patterns: &mut Patterns) -> Result<()> {
    match predicate {
        Predicate::Like {
            pattern,
            case_insensitive,
            ..
        } => {
            let key = (pattern.clone(), *case_insensitive);
            if !patterns.contains_key(&key) {
                let regex = like_regex(pattern, *case_insensitive)?;
                patterns.insert(key, regex);
            }
        }
        Predicate::Related { predicate, .. } | Predicate::Not(predicate) => {
            compile_patterns(predicate, patterns)?;
        }
        Predicate::And(children) | Predicate::Or(children) => {
            for child in children {
                compile_patterns(child, patterns)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Translate a SQL `LIKE` pattern into an anchored regex
fn like_regex(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    let mut source = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| Error::Storage(format!("invalid pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Comparison;
    use crate::sample;
    use serde_json::json;

    fn store() -> InMemoryStore {
        sample::store(sample::registry().unwrap()).unwrap()
    }

    fn name_column() -> ColumnRef {
        ColumnRef {
            name: "name".into(),
            field_type: FieldType::String,
        }
    }

    fn names(rows: &[Row]) -> Vec<&str> {
        rows.iter().filter_map(|r| r["name"].as_str()).collect()
    }

    fn person_query(predicate: Predicate) -> Query {
        Query {
            predicate,
            ..Query::all(store_registry().model("person").unwrap())
        }
    }

    fn store_registry() -> Arc<ModelRegistry> {
        sample::registry().unwrap()
    }

    #[test]
    fn test_like_regex() {
        let re = like_regex("%y%", false).unwrap();
        assert!(re.is_match("Mary"));
        assert!(!re.is_match("Tom"));
        assert!(like_regex("t_m", true).unwrap().is_match("Tom"));
        assert!(like_regex("a.c", false).unwrap().is_match("a.c"));
        assert!(!like_regex("a.c", false).unwrap().is_match("abc"));
    }

    #[test]
    fn test_select_like() {
        let store = store();
        let session = store.session();
        let rows = session
            .select(&person_query(Predicate::Like {
                column: name_column(),
                pattern: "%y%".into(),
                case_insensitive: false,
                negated: false,
            }))
            .unwrap();
        assert_eq!(names(&rows), vec!["Mary", "Amy"]);
    }

    #[test]
    fn test_select_related() {
        let store = store();
        let session = store.session();
        let query = person_query(Predicate::Related {
            relation: "computers".into(),
            predicate: Box::new(Predicate::Compare {
                column: ColumnRef {
                    name: "vendor".into(),
                    field_type: FieldType::String,
                },
                op: Comparison::Eq,
                param: Scalar::Text("Dell".into()),
            }),
        });
        assert_eq!(names(&session.select(&query).unwrap()), vec!["Mary", "Tom"]);
    }

    #[test]
    fn test_order_and_paginate() {
        let store = store();
        let session = store.session();
        let mut query = person_query(Predicate::Always);
        query.order_by = vec![OrderKey {
            relation: None,
            column: ColumnRef {
                name: "age".into(),
                field_type: FieldType::Integer,
            },
            direction: Direction::Desc,
        }];
        query.limit = Some(2);
        assert_eq!(names(&session.select(&query).unwrap()), vec!["Amy", "Tom"]);
        assert_eq!(session.count(&query).unwrap(), 3);

        query.offset = 2;
        assert_eq!(names(&session.select(&query).unwrap()), vec!["Mary"]);
    }

    #[test]
    fn test_groups() {
        let store = store();
        let session = store.session();
        let registry = store_registry();
        let mut query = Query::all(registry.model("computer").unwrap());
        query.group_by = vec![ColumnRef {
            name: "vendor".into(),
            field_type: FieldType::String,
        }];
        let groups = session.select_groups(&query).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key["vendor"], json!("Dell"));
        assert_eq!(groups[0].rows.len(), 2);
        assert_eq!(session.count(&query).unwrap(), 2);
        assert_eq!(session.select(&query).unwrap().len(), 2);
    }

    #[test]
    fn test_insert_assigns_ids() {
        let store = store();
        let mut session = store.session();
        let mut row = Row::new();
        row.insert("name".into(), json!("Zed"));
        let id = session.insert("person", row).unwrap();
        assert_eq!(id, Scalar::Int(4));
        let stored = session.get("person", &id).unwrap().unwrap();
        assert_eq!(stored["age"], Value::Null);

        let mut dup = Row::new();
        dup.insert("id".into(), json!(4));
        dup.insert("name".into(), json!("Again"));
        assert!(matches!(session.insert("person", dup), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_rollback_on_drop() {
        let store = store();
        {
            let mut session = store.session();
            assert!(session.delete("person", &Scalar::Int(3)).unwrap());
            assert!(session.get("person", &Scalar::Int(3)).unwrap().is_none());
        }
        let session = store.session();
        assert!(session.get("person", &Scalar::Int(3)).unwrap().is_some());
    }

    #[test]
    fn test_commit_persists() {
        let store = store();
        let mut session = store.begin().unwrap();
        session
            .update("person", &Scalar::Int(1), &json!({"age": 21}).as_object().cloned().unwrap())
            .unwrap();
        session.commit().unwrap();
        let session = store.session();
        assert_eq!(session.get("person", &Scalar::Int(1)).unwrap().unwrap()["age"], json!(21));
    }

    #[test]
    fn test_foreign_key_enforced() {
        let store = store();
        let mut session = store.session();
        let changes = json!({"owner_id": 99}).as_object().cloned().unwrap();
        assert!(matches!(
            session.update("computer", &Scalar::Int(1), &changes),
            Err(Error::Conflict(_))
        ));
        // Mary still owns computers
        assert!(matches!(session.delete("person", &Scalar::Int(1)), Err(Error::Conflict(_))));
        assert!(!session.delete("person", &Scalar::Int(42)).unwrap());
    }

    #[test]
    fn test_attach_detach_many_to_many() {
        let store = store();
        let mut session = store.session();
        let computer = Scalar::Int(2);
        assert!(session.related("computer", &computer, "tags").unwrap().is_empty());

        session.attach("computer", &computer, "tags", &Scalar::Int(1)).unwrap();
        session.attach("computer", &computer, "tags", &Scalar::Int(1)).unwrap();
        assert_eq!(session.related("computer", &computer, "tags").unwrap().len(), 1);

        assert!(session.detach("computer", &computer, "tags", &Scalar::Int(1)).unwrap());
        assert!(!session.detach("computer", &computer, "tags", &Scalar::Int(1)).unwrap());
    }

    #[test]
    fn test_attach_detach_one_to_many() {
        let store = store();
        let mut session = store.session();
        session.attach("person", &Scalar::Int(3), "computers", &Scalar::Int(3)).unwrap();
        let owned = session.related("person", &Scalar::Int(3), "computers").unwrap();
        assert_eq!(names(&owned), vec!["hopper"]);

        assert!(session.detach("person", &Scalar::Int(3), "computers", &Scalar::Int(3)).unwrap());
        let computer = session.get("computer", &Scalar::Int(3)).unwrap().unwrap();
        assert_eq!(computer["owner_id"], Value::Null);

        let err = session
            .attach("person", &Scalar::Int(3), "computers", &Scalar::Int(77))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_drops_association_rows() {
        let store = store();
        let mut session = store.session();
        assert!(session.delete("computer", &Scalar::Int(1)).unwrap());
        assert!(session.get("computer", &Scalar::Int(1)).unwrap().is_none());
        // hopper keeps its own link to the shared tag
        let tags = session.related("computer", &Scalar::Int(3), "tags").unwrap();
        assert_eq!(names(&tags), vec!["cheap"]);

        // deleting a tag unlinks it from every computer
        assert!(session.delete("tag", &Scalar::Int(2)).unwrap());
        assert!(session.related("computer", &Scalar::Int(3), "tags").unwrap().is_empty());
    }
}
