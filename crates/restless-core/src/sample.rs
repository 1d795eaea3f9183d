//! Sample models and data
//!
//! A small person / computer / tag schema used by the demo server and the
//! test suites.

use std::sync::Arc;

use restless_common::Result;
use serde_json::{json, Value};

use crate::backend::{InMemoryStore, Row, Session};
use crate::model::{Column, FieldType, TableModel};
use crate::registry::{ModelRegistry, RegistryBuilder, ResourceOptions};
use crate::value::Scalar;

pub fn person() -> TableModel {
    TableModel::new("person")
        .with_column(Column::serial("id"))
        .with_column(Column::new("name", FieldType::String).not_null())
        .with_column(Column::new("age", FieldType::Integer))
        .with_column(Column::new("other", FieldType::Float))
        .with_column(Column::new("birthday", FieldType::Date))
        .with_one_to_many("computers", "computer", "owner_id")
}

pub fn computer() -> TableModel {
    TableModel::new("computer")
        .with_column(Column::serial("id"))
        .with_column(Column::new("name", FieldType::String).not_null())
        .with_column(Column::new("vendor", FieldType::String))
        .with_column(Column::new("buy_date", FieldType::DateTime))
        .with_column(Column::new("owner_id", FieldType::Integer))
        .with_many_to_one("owner", "person", "owner_id")
        .with_many_to_many("tags", "tag", "computer_tags", "computer_id", "tag_id")
}

pub fn tag() -> TableModel {
    TableModel::new("tag")
        .with_column(Column::serial("id"))
        .with_column(Column::new("name", FieldType::String).not_null())
}

fn writable() -> ResourceOptions {
    ResourceOptions::read_write()
        .allow_patch_many()
        .allow_delete_many()
        .allow_functions()
        .allow_to_many_replacement()
}

/// Builder preloaded with the sample models, for callers adding options
pub fn builder() -> RegistryBuilder {
    ModelRegistry::builder()
        .register(person(), writable())
        .register(computer(), writable())
        .register(tag(), ResourceOptions::read_only())
}

pub fn registry() -> Result<Arc<ModelRegistry>> {
    builder().build().map(Arc::new)
}

/// A store holding the sample rows
pub fn store(registry: Arc<ModelRegistry>) -> Result<InMemoryStore> {
    let store = InMemoryStore::new(registry);
    seed(&store)?;
    Ok(store)
}

/// Insert the sample rows into an empty store
pub fn seed(store: &InMemoryStore) -> Result<()> {
    let mut session = store.session();

    insert_all(
        &mut session,
        "person",
        vec![
            json!({"name": "Mary", "age": 20, "other": 1.5, "birthday": "2004-03-01"}),
            json!({"name": "Tom", "age": 30, "birthday": "1994-07-15"}),
            json!({"name": "Amy", "age": 40, "other": 2.5, "birthday": "1984-11-30"}),
        ],
    )?;
    insert_all(
        &mut session,
        "computer",
        vec![
            json!({"name": "turing", "vendor": "Dell", "buy_date": "2020-01-01T09:00:00", "owner_id": 1}),
            json!({"name": "lovelace", "vendor": "Apple", "buy_date": "2021-06-15T14:30:00", "owner_id": 1}),
            json!({"name": "hopper", "vendor": "Dell", "owner_id": 2}),
        ],
    )?;
    insert_all(&mut session, "tag", vec![json!({"name": "fast"}), json!({"name": "cheap"})])?;

    for (computer, tag) in [(1, 1), (1, 2), (3, 2)] {
        session.attach("computer", &Scalar::Int(computer), "tags", &Scalar::Int(tag))?;
    }

    Box::new(session).commit()
}

fn insert_all(session: &mut dyn Session, model: &str, rows: Vec<Value>) -> Result<()> {
    for row in rows {
        let row: Row = match row {
            Value::Object(map) => map,
            _ => Row::new(),
        };
        session.insert(model, row)?;
    }
    Ok(())
}
