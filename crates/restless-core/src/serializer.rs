//! Conversion between stored rows and client JSON

use restless_common::{Error, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::{Row, Session};
use crate::model::{Cardinality, ModelMetadata};
use crate::registry::ModelRegistry;
use crate::value::Scalar;

/// Renders rows, nesting relationships up to a fixed depth
pub struct Serializer<'a> {
    registry: &'a ModelRegistry,
    depth: usize,
}

impl<'a> Serializer<'a> {
    pub fn new(registry: &'a ModelRegistry, depth: usize) -> Self {
        Self { registry, depth }
    }

    /// Serialize one row with the configured relationship depth
    pub fn to_json(&self, session: &dyn Session, model: &dyn ModelMetadata, row: &Row) -> Result<Value> {
        self.render(session, model, row, self.depth)
    }

    pub fn to_json_many(&self, session: &dyn Session, model: &dyn ModelMetadata, rows: &[Row]) -> Result<Vec<Value>> {
        rows.iter().map(|row| self.to_json(session, model, row)).collect()
    }

    fn render(&self, session: &dyn Session, model: &dyn ModelMetadata, row: &Row, depth: usize) -> Result<Value> {
        let options = self.registry.resource(model.name()).map(|r| &r.options);
        let visible = |field: &str| field == model.primary_key() || options.map_or(true, |o| o.is_visible(field));

        let mut out = Map::new();
        for column in model.columns().iter().filter(|c| visible(&c.name)) {
            let value = Scalar::from_stored(column.field_type, row.get(&column.name));
            out.insert(column.name.clone(), value.to_json());
        }

        let Some(id) = identity(model, row) else {
            return Ok(Value::Object(out));
        };
        for rel in model.relationships().iter().filter(|r| visible(&r.name)) {
            let target = self.registry.target(&rel.target)?;
            let related = session.related(model.name(), &id, &rel.name)?;
            let rendered = related
                .iter()
                .map(|r| {
                    if depth == 0 {
                        Ok(identifying_keys(target, r))
                    } else {
                        self.render(session, target, r, depth - 1)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            let value = match rel.cardinality() {
                Cardinality::One => rendered.into_iter().next().unwrap_or(Value::Null),
                Cardinality::Many => Value::Array(rendered),
            };
            out.insert(rel.name.clone(), value);
        }
        Ok(Value::Object(out))
    }
}

/// Typed primary key of a stored row
pub fn identity(model: &dyn ModelMetadata, row: &Row) -> Option<Scalar> {
    let column = model.primary_key_column()?;
    let id = Scalar::from_stored(column.field_type, row.get(&column.name));
    (!id.is_null()).then_some(id)
}

/// `{"<pk>": value}`
pub fn identifying_keys(model: &dyn ModelMetadata, row: &Row) -> Value {
    let mut keys = Map::new();
    keys.insert(
        model.primary_key().to_string(),
        row.get(model.primary_key()).cloned().unwrap_or(Value::Null),
    );
    Value::Object(keys)
}

/// Handling of unknown fields in inbound payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Strict,
    Lenient,
}

/// What a payload is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Required columns must be present
    Create,
    Update,
}

/// A decoded payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deserialized {
    /// Coerced column values in canonical form
    pub fields: Row,
    /// Raw values of relationship keys, for the mutation engine
    pub relations: Map<String, Value>,
}

/// Decodes client JSON against model metadata
#[derive(Debug, Clone, Copy)]
pub struct Deserializer {
    mode: Mode,
}

impl Deserializer {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }

    pub fn strict(strict: bool) -> Self {
        Self::new(if strict { Mode::Strict } else { Mode::Lenient })
    }

    /// Decode a payload, reporting every failing field
    pub fn from_json(&self, value: &Value, model: &dyn ModelMetadata, purpose: Purpose) -> Result<Deserialized> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::invalid_field(model.name(), format!("expected a JSON object, got {value}")))?;

        let mut decoded = Deserialized::default();
        let mut failures = vec![];

        for (key, raw) in obj {
            if let Some(column) = model.column(key) {
                if raw.is_null() && !column.nullable {
                    if !(column.autoincrement && purpose == Purpose::Create) {
                        failures.push(Error::invalid_field(key, "may not be null"));
                    }
                    continue;
                }
                match Scalar::coerce(column.field_type, raw) {
                    Ok(scalar) => {
                        decoded.fields.insert(key.clone(), scalar.to_json());
                    }
                    Err(reason) => failures.push(Error::invalid_field(key, reason)),
                }
            } else if model.relationship(key).is_some() {
                decoded.relations.insert(key.clone(), raw.clone());
            } else if self.mode == Mode::Strict {
                failures.push(Error::invalid_field(key, format!("no such field on '{}'", model.name())));
            } else {
                debug!(model = model.name(), field = %key, "Ignoring unknown field");
            }
        }

        if purpose == Purpose::Create {
            for column in model.columns().iter().filter(|c| c.is_required()) {
                if !obj.contains_key(&column.name) {
                    failures.push(Error::invalid_field(&column.name, "missing required field"));
                }
            }
        }

        match Error::from_failures(failures) {
            Some(err) => Err(err),
            None => Ok(decoded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceOptions;
    use crate::sample;
    use serde_json::json;

    #[test]
    fn test_depth_one_nests_then_keys() {
        let registry = sample::registry().unwrap();
        let store = sample::store(registry.clone()).unwrap();
        let session = store.session();
        let person = registry.model("person").unwrap();
        let row = session.get("person", &Scalar::Int(1)).unwrap().unwrap();

        let body = Serializer::new(&registry, 1).to_json(&session, person, &row).unwrap();
        assert_eq!(body["name"], json!("Mary"));
        assert_eq!(body["birthday"], json!("2004-03-01"));
        assert_eq!(body["computers"].as_array().unwrap().len(), 2);
        assert_eq!(body["computers"][0]["name"], json!("turing"));
        // one hop further only keys remain
        assert_eq!(body["computers"][0]["owner"], json!({"id": 1}));
        assert_eq!(body["computers"][0]["tags"], json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn test_depth_zero_and_to_one() {
        let registry = sample::registry().unwrap();
        let store = sample::store(registry.clone()).unwrap();
        let session = store.session();
        let computer = registry.model("computer").unwrap();
        let row = session.get("computer", &Scalar::Int(3)).unwrap().unwrap();

        let body = Serializer::new(&registry, 0).to_json(&session, computer, &row).unwrap();
        assert_eq!(body["owner"], json!({"id": 2}));
        assert_eq!(body["buy_date"], Value::Null);
    }

    #[test]
    fn test_excluded_columns() {
        let registry = std::sync::Arc::new(
            ModelRegistry::builder()
                .register(sample::person(), ResourceOptions::read_only().exclude_columns(["age", "computers"]))
                .register(sample::computer(), ResourceOptions::hidden())
                .register(sample::tag(), ResourceOptions::hidden())
                .build()
                .unwrap(),
        );
        let store = sample::store(registry.clone()).unwrap();
        let session = store.session();
        let row = session.get("person", &Scalar::Int(2)).unwrap().unwrap();
        let body = Serializer::new(&registry, 1)
            .to_json(&session, registry.model("person").unwrap(), &row)
            .unwrap();
        assert!(body.get("age").is_none());
        assert!(body.get("computers").is_none());
        assert_eq!(body["id"], json!(2));
    }

    #[test]
    fn test_roundtrip_restores_columns() {
        let registry = sample::registry().unwrap();
        let store = sample::store(registry.clone()).unwrap();
        let session = store.session();
        let person = registry.model("person").unwrap();
        let row = session.get("person", &Scalar::Int(3)).unwrap().unwrap();

        let body = Serializer::new(&registry, 0).to_json(&session, person, &row).unwrap();
        let decoded = Deserializer::new(Mode::Strict)
            .from_json(&body, person, Purpose::Update)
            .unwrap();
        for column in person.columns() {
            assert_eq!(decoded.fields.get(&column.name), row.get(&column.name), "column {}", column.name);
        }
        assert!(decoded.relations.contains_key("computers"));
    }

    #[test]
    fn test_strict_and_lenient() {
        let registry = sample::registry().unwrap();
        let person = registry.model("person").unwrap();
        let payload = json!({"name": "Zed", "height": 180});

        let err = Deserializer::new(Mode::Strict)
            .from_json(&payload, person, Purpose::Create)
            .unwrap_err();
        assert!(matches!(err, Error::Deserialization(ref e) if e.field == "height"));

        let ok = Deserializer::new(Mode::Lenient)
            .from_json(&payload, person, Purpose::Create)
            .unwrap();
        assert_eq!(ok.fields.len(), 1);
    }

    #[test]
    fn test_all_failures_reported() {
        let registry = sample::registry().unwrap();
        let person = registry.model("person").unwrap();
        let err = Deserializer::new(Mode::Strict)
            .from_json(&json!({"age": "old", "birthday": "soon"}), person, Purpose::Create)
            .unwrap_err();
        let fields: Vec<String> = err.field_errors().into_iter().map(|e| e.field).collect();
        assert_eq!(fields.len(), 3);
        assert!(fields.contains(&"name".to_string()));
        assert!(fields.contains(&"birthday".to_string()));
    }

    #[test]
    fn test_update_skips_required_check() {
        let registry = sample::registry().unwrap();
        let person = registry.model("person").unwrap();
        let decoded = Deserializer::new(Mode::Strict)
            .from_json(&json!({"age": "31"}), person, Purpose::Update)
            .unwrap();
        assert_eq!(decoded.fields["age"], json!(31));
        assert!(Deserializer::new(Mode::Strict)
            .from_json(&json!({"name": null}), person, Purpose::Update)
            .is_err());
        assert!(Deserializer::new(Mode::Strict)
            .from_json(&json!([1, 2]), person, Purpose::Update)
            .is_err());
    }
}
