//! Relationship mutation engine
//!
//! Applies add/remove edits to the relationships of one instance:
//!
//! ```json
//! {"computers": {"add": [3, {"id": 4}, {"name": "new"}],
//!                "remove": [{"id": 2, "__delete__": true}]}}
//! ```
//!
//! Relationships are processed in name order, adds before removes. Each
//! item that fails is recorded and the rest still run; the caller decides
//! whether the successful part is kept.

use restless_common::{Error, Result};
use serde_json::{Map, Value};
use tracing::info;

use crate::backend::Session;
use crate::model::{Cardinality, ModelMetadata, Relationship};
use crate::registry::ModelRegistry;
use crate::serializer::{identity, Deserializer, Purpose};
use crate::value::Scalar;

/// Item to associate with the owner
#[derive(Debug, Clone, PartialEq)]
pub enum AddItem {
    /// Existing row, by primary key; other fields of an object are ignored
    Reference(Scalar),
    /// New row created from these fields first
    Create(Value),
}

/// Item to dissociate from the owner
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveItem {
    pub id: Scalar,
    /// Also delete the related row once detached
    pub delete: bool,
}

/// Edits to one relationship
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipEdit {
    pub relation: String,
    pub add: Vec<AddItem>,
    pub remove: Vec<RemoveItem>,
    /// Detach every related row not named in `add`
    pub replace: bool,
}

/// Counts of applied sub-operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub attached: usize,
    pub created: usize,
    pub detached: usize,
    pub deleted: usize,
}

/// Report plus every failed sub-operation
#[derive(Debug, Default)]
pub struct MutationOutcome {
    pub report: MutationReport,
    pub failures: Vec<Error>,
}

impl MutationOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<MutationReport> {
        match Error::from_failures(self.failures) {
            Some(err) => Err(err),
            None => Ok(self.report),
        }
    }
}

/// Decode the relationship keys of a payload.
///
/// `{"add": [...], "remove": [...]}` edits a relationship in place. A plain
/// list replaces a to-many collection (only when `allow_replacement`); a
/// scalar, object or null replaces a to-one relationship.
pub fn parse_edits(
    model: &dyn ModelMetadata,
    registry: &ModelRegistry,
    payload: &Map<String, Value>,
    allow_replacement: bool,
) -> Result<Vec<RelationshipEdit>> {
    let mut edits = vec![];
    let mut failures = vec![];

    for (name, value) in payload {
        let Some(rel) = model.relationship(name) else {
            failures.push(Error::invalid_field(name, format!("no relationship on '{}'", model.name())));
            continue;
        };
        let target = registry.target(&rel.target)?;
        match parse_edit(rel, target, value, allow_replacement) {
            Ok(edit) => edits.push(edit),
            Err(Error::MultipleFailures(errors)) => failures.extend(errors),
            Err(err) => failures.push(err),
        }
    }

    if let Some(err) = Error::from_failures(failures) {
        return Err(err);
    }
    edits.sort_by(|a, b| a.relation.cmp(&b.relation));
    Ok(edits)
}

fn parse_edit(
    rel: &Relationship,
    target: &dyn ModelMetadata,
    value: &Value,
    allow_replacement: bool,
) -> Result<RelationshipEdit> {
    let mut edit = RelationshipEdit {
        relation: rel.name.clone(),
        add: vec![],
        remove: vec![],
        replace: false,
    };

    match value {
        Value::Object(obj) if is_edit_object(obj) => {
            let mut failures = vec![];
            for item in list(obj.get("add")) {
                match parse_add(&rel.name, target, item) {
                    Ok(add) => edit.add.push(add),
                    Err(err) => failures.push(err),
                }
            }
            for item in list(obj.get("remove")) {
                match parse_remove(&rel.name, target, item) {
                    Ok(remove) => edit.remove.push(remove),
                    Err(err) => failures.push(err),
                }
            }
            if let Some(err) = Error::from_failures(failures) {
                return Err(err);
            }
        }
        Value::Array(items) => {
            if rel.cardinality() == Cardinality::One {
                return Err(Error::invalid_field(&rel.name, "a to-one relationship takes a single value"));
            }
            if !allow_replacement {
                return Err(Error::invalid_field(
                    &rel.name,
                    "replacing a to-many relationship is not allowed, use add/remove",
                ));
            }
            edit.replace = true;
            edit.add = items
                .iter()
                .map(|item| parse_add(&rel.name, target, item))
                .collect::<Result<_>>()?;
        }
        _ if rel.cardinality() == Cardinality::Many => {
            return Err(Error::invalid_field(
                &rel.name,
                "expected a list or an add/remove object",
            ));
        }
        Value::Null => edit.replace = true,
        item => {
            edit.replace = true;
            edit.add.push(parse_add(&rel.name, target, item)?);
        }
    }
    Ok(edit)
}

fn is_edit_object(obj: &Map<String, Value>) -> bool {
    !obj.is_empty() && obj.keys().all(|k| k == "add" || k == "remove")
}

fn list(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(items)) => items,
        Some(other) => std::slice::from_ref(other),
        None => &[],
    }
}

fn parse_key(relation: &str, target: &dyn ModelMetadata, raw: &Value) -> Result<Scalar> {
    let field_type = target
        .primary_key_column()
        .map_or(crate::model::FieldType::Integer, |c| c.field_type);
    match Scalar::coerce(field_type, raw) {
        Ok(id) if !id.is_null() => Ok(id),
        Ok(_) => Err(Error::invalid_field(relation, "primary key may not be null")),
        Err(reason) => Err(Error::invalid_field(relation, format!("invalid primary key: {reason}"))),
    }
}

fn parse_add(relation: &str, target: &dyn ModelMetadata, item: &Value) -> Result<AddItem> {
    match item {
        Value::Object(obj) => match obj.get(target.primary_key()) {
            Some(pk) if !pk.is_null() => parse_key(relation, target, pk).map(AddItem::Reference),
            _ => Ok(AddItem::Create(item.clone())),
        },
        scalar => parse_key(relation, target, scalar).map(AddItem::Reference),
    }
}

fn parse_remove(relation: &str, target: &dyn ModelMetadata, item: &Value) -> Result<RemoveItem> {
    match item {
        Value::Object(obj) => {
            let pk = obj
                .get(target.primary_key())
                .ok_or_else(|| Error::invalid_field(relation, format!("removal needs '{}'", target.primary_key())))?;
            let delete = ["__delete__", "delete"]
                .iter()
                .filter_map(|k| obj.get(*k))
                .any(|v| v.as_bool() == Some(true));
            Ok(RemoveItem {
                id: parse_key(relation, target, pk)?,
                delete,
            })
        }
        scalar => Ok(RemoveItem {
            id: parse_key(relation, target, scalar)?,
            delete: false,
        }),
    }
}

/// Applies relationship edits within one session
pub struct RelationshipEngine<'a> {
    registry: &'a ModelRegistry,
    deserializer: Deserializer,
}

impl<'a> RelationshipEngine<'a> {
    pub fn new(registry: &'a ModelRegistry, deserializer: Deserializer) -> Self {
        Self { registry, deserializer }
    }

    /// Apply every edit to the instance `id`, collecting failures
    pub fn apply(
        &self,
        session: &mut dyn Session,
        model: &dyn ModelMetadata,
        id: &Scalar,
        edits: &[RelationshipEdit],
    ) -> MutationOutcome {
        let mut outcome = MutationOutcome::default();
        for edit in edits {
            if let Err(err) = self.apply_one(session, model, id, edit, &mut outcome) {
                outcome.failures.push(err);
            }
        }
        info!(
            model = model.name(),
            id = %id,
            attached = outcome.report.attached,
            created = outcome.report.created,
            detached = outcome.report.detached,
            deleted = outcome.report.deleted,
            failures = outcome.failures.len(),
            "Applied relationship edits"
        );
        outcome
    }

    /// Errors returned here abort the whole edit; per-item failures are
    /// pushed onto the outcome
    fn apply_one(
        &self,
        session: &mut dyn Session,
        model: &dyn ModelMetadata,
        id: &Scalar,
        edit: &RelationshipEdit,
        outcome: &mut MutationOutcome,
    ) -> Result<()> {
        let rel = model.relationship(&edit.relation).ok_or_else(|| Error::UnknownField {
            model: model.name().to_string(),
            field: edit.relation.clone(),
        })?;
        let target = self.registry.target(&rel.target)?;
        let mut kept = vec![];

        for item in &edit.add {
            match self.add(session, model, id, rel, target, item) {
                Ok(target_id) => {
                    outcome.report.attached += 1;
                    if matches!(item, AddItem::Create(_)) {
                        outcome.report.created += 1;
                    }
                    kept.push(target_id);
                }
                Err(err) => outcome.failures.push(err),
            }
        }

        if edit.replace {
            let current = session.related(model.name(), id, &rel.name)?;
            for row in current {
                let Some(current_id) = identity(target, &row) else {
                    continue;
                };
                if kept.iter().any(|k| k.matches(&current_id)) {
                    continue;
                }
                match session.detach(model.name(), id, &rel.name, &current_id) {
                    Ok(_) => outcome.report.detached += 1,
                    Err(err) => outcome.failures.push(err),
                }
            }
        }

        for item in &edit.remove {
            match self.remove(session, model, id, rel, target, item) {
                Ok(()) => {
                    outcome.report.detached += 1;
                    if item.delete {
                        outcome.report.deleted += 1;
                    }
                }
                Err(err) => outcome.failures.push(err),
            }
        }
        Ok(())
    }

    fn add(
        &self,
        session: &mut dyn Session,
        model: &dyn ModelMetadata,
        id: &Scalar,
        rel: &Relationship,
        target: &dyn ModelMetadata,
        item: &AddItem,
    ) -> Result<Scalar> {
        let target_id = match item {
            AddItem::Reference(target_id) => {
                if session.get(target.name(), target_id)?.is_none() {
                    return Err(Error::not_found(target.name(), target_id));
                }
                target_id.clone()
            }
            AddItem::Create(fields) => {
                let decoded = self.deserializer.from_json(fields, target, Purpose::Create)?;
                if let Some(nested) = decoded.relations.keys().next() {
                    return Err(Error::invalid_field(
                        format!("{}.{nested}", rel.name),
                        "nested relationship edits are not supported",
                    ));
                }
                session.insert(target.name(), decoded.fields)?
            }
        };
        session.attach(model.name(), id, &rel.name, &target_id)?;
        Ok(target_id)
    }

    fn remove(
        &self,
        session: &mut dyn Session,
        model: &dyn ModelMetadata,
        id: &Scalar,
        rel: &Relationship,
        target: &dyn ModelMetadata,
        item: &RemoveItem,
    ) -> Result<()> {
        if session.get(target.name(), &item.id)?.is_none() {
            return Err(Error::not_found(target.name(), &item.id));
        }
        if !session.detach(model.name(), id, &rel.name, &item.id)? {
            return Err(Error::not_found(format!("{}.{}", model.name(), rel.name), &item.id));
        }
        if item.delete {
            if let Err(err) = session.delete(target.name(), &item.id) {
                session.attach(model.name(), id, &rel.name, &item.id)?;
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryStore;
    use crate::sample;
    use crate::serializer::Mode;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        registry: Arc<ModelRegistry>,
        store: InMemoryStore,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = sample::registry().unwrap();
            let store = sample::store(registry.clone()).unwrap();
            Self { registry, store }
        }

        fn edits(&self, model: &str, payload: Value) -> Result<Vec<RelationshipEdit>> {
            let model = self.registry.model(model).unwrap();
            parse_edits(model, &self.registry, payload.as_object().unwrap(), true)
        }

        fn apply(&self, session: &mut dyn Session, model: &str, id: i64, edits: &[RelationshipEdit]) -> MutationOutcome {
            let engine = RelationshipEngine::new(&self.registry, Deserializer::new(Mode::Strict));
            engine.apply(session, self.registry.model(model).unwrap(), &Scalar::Int(id), edits)
        }
    }

    #[test]
    fn test_parse_forms() {
        let fixture = Fixture::new();
        let edits = fixture
            .edits(
                "person",
                json!({"computers": {
                    "add": [3, {"id": 2}, {"name": "new"}, {"id": 1, "name": "renamed"}, {"id": null, "name": "new"}],
                    "remove": [{"id": 1, "delete": true}, 2]
                }}),
            )
            .unwrap();
        let edit = &edits[0];
        assert_eq!(edit.add[0], AddItem::Reference(Scalar::Int(3)));
        assert_eq!(edit.add[1], AddItem::Reference(Scalar::Int(2)));
        assert!(matches!(edit.add[2], AddItem::Create(_)));
        assert_eq!(edit.add[3], AddItem::Reference(Scalar::Int(1)));
        assert!(matches!(edit.add[4], AddItem::Create(_)));
        assert_eq!(edit.remove[0], RemoveItem { id: Scalar::Int(1), delete: true });
        assert_eq!(edit.remove[1], RemoveItem { id: Scalar::Int(2), delete: false });
        assert!(!edit.replace);
    }

    #[test]
    fn test_parse_replacement() {
        let fixture = Fixture::new();
        let edits = fixture.edits("computer", json!({"owner": 2, "tags": [1]})).unwrap();
        assert_eq!(edits[0].relation, "owner");
        assert!(edits[0].replace);
        assert!(edits[1].replace);

        let person = fixture.registry.model("person").unwrap();
        let err = parse_edits(
            person,
            &fixture.registry,
            json!({"computers": [1]}).as_object().unwrap(),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_remove_with_delete() {
        let fixture = Fixture::new();
        let edits = fixture
            .edits("person", json!({"computers": {"remove": [{"id": 2, "__delete__": true}]}}))
            .unwrap();
        let mut session = fixture.store.session();
        let outcome = fixture.apply(&mut session, "person", 1, &edits);
        assert_eq!(outcome.into_result().unwrap().deleted, 1);
        assert!(session.get("computer", &Scalar::Int(2)).unwrap().is_none());
        assert_eq!(session.related("person", &Scalar::Int(1), "computers").unwrap().len(), 1);
    }

    #[test]
    fn test_remove_twice_not_found() {
        let fixture = Fixture::new();
        let edits = fixture.edits("person", json!({"computers": {"remove": [2]}})).unwrap();
        let mut session = fixture.store.session();
        assert!(fixture.apply(&mut session, "person", 1, &edits).is_clean());
        let err = fixture.apply(&mut session, "person", 1, &edits).into_result().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_failures_do_not_stop_other_items() {
        let fixture = Fixture::new();
        let edits = fixture
            .edits("computer", json!({"tags": {"add": [99, 1, {"name": "quiet"}]}}))
            .unwrap();
        let mut session = fixture.store.session();
        let outcome = fixture.apply(&mut session, "computer", 2, &edits);
        assert_eq!(outcome.report.attached, 2);
        assert_eq!(outcome.report.created, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].is_not_found());
        assert_eq!(session.related("computer", &Scalar::Int(2), "tags").unwrap().len(), 2);
    }

    #[test]
    fn test_adds_before_removes() {
        let fixture = Fixture::new();
        let edits = fixture
            .edits("person", json!({"computers": {"remove": [3], "add": [3]}}))
            .unwrap();
        let mut session = fixture.store.session();
        // adding 3 moves it to Amy, removing it then detaches it again
        assert!(fixture.apply(&mut session, "person", 3, &edits).is_clean());
        assert!(session.related("person", &Scalar::Int(3), "computers").unwrap().is_empty());
    }

    #[test]
    fn test_to_many_replacement() {
        let fixture = Fixture::new();
        let edits = fixture.edits("computer", json!({"tags": [2]})).unwrap();
        let mut session = fixture.store.session();
        let report = fixture.apply(&mut session, "computer", 1, &edits).into_result().unwrap();
        assert_eq!(report.detached, 1);
        let tags = session.related("computer", &Scalar::Int(1), "tags").unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0]["name"], json!("cheap"));
    }

    #[test]
    fn test_to_one_clear() {
        let fixture = Fixture::new();
        let edits = fixture.edits("computer", json!({"owner": null})).unwrap();
        let mut session = fixture.store.session();
        assert!(fixture.apply(&mut session, "computer", 3, &edits).is_clean());
        let row = session.get("computer", &Scalar::Int(3)).unwrap().unwrap();
        assert_eq!(row["owner_id"], Value::Null);
    }

    #[test]
    fn test_failed_delete_keeps_link() {
        let fixture = Fixture::new();
        // Mary still owns lovelace, so she cannot be deleted
        let edits = fixture
            .edits("computer", json!({"owner": {"remove": [{"id": 1, "__delete__": true}]}}))
            .unwrap();
        let mut session = fixture.store.session();
        let outcome = fixture.apply(&mut session, "computer", 1, &edits);
        assert_eq!(outcome.report.detached, 0);
        assert_eq!(outcome.report.deleted, 0);
        assert!(matches!(outcome.failures[..], [Error::Conflict(_)]));
        let row = session.get("computer", &Scalar::Int(1)).unwrap().unwrap();
        assert_eq!(row["owner_id"], json!(1));
        assert!(session.get("person", &Scalar::Int(1)).unwrap().is_some());
    }

    #[test]
    fn test_reference_with_extra_fields() {
        let fixture = Fixture::new();
        let edits = fixture
            .edits("person", json!({"computers": {"add": [{"id": 3, "name": "ignored", "tags": []}, {"id": 42, "name": "x"}]}}))
            .unwrap();
        let mut session = fixture.store.session();
        let outcome = fixture.apply(&mut session, "person", 1, &edits);
        assert_eq!(outcome.report.attached, 1);
        assert_eq!(outcome.report.created, 0);
        assert!(outcome.failures[0].is_not_found());
        let hopper = session.get("computer", &Scalar::Int(3)).unwrap().unwrap();
        assert_eq!(hopper["name"], json!("hopper"));
        assert_eq!(hopper["owner_id"], json!(1));
    }
}
