//! Resource operations
//!
//! [`ResourceApi`] runs one request end to end: hooks, parsing and
//! validation first, then a single store session for the data access, then
//! serialization and postprocessors. The HTTP layer only maps its
//! [`Response`] and errors onto the wire.

use std::sync::Arc;

use restless_common::{ApiConfig, Error, Result};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::backend::{Session, Store};
use crate::compiler::{self, PageLimits, Query};
use crate::filter::{self, FilterLimits};
use crate::functions::{FunctionRegistry, FunctionSpec};
use crate::hooks::{HookRequest, Hooks, Operation};
use crate::model::{Cardinality, ModelMetadata};
use crate::registry::{Method, ModelRegistry, Resource};
use crate::relations::{parse_edits, RelationshipEdit, RelationshipEngine};
use crate::search::{decode_param, SearchSpec};
use crate::serializer::{identity, Deserializer, Purpose, Serializer};
use crate::value::Scalar;

/// Outcome of a successful operation
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Option<Value>,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    pub fn created(body: Value) -> Self {
        Self {
            status: 201,
            body: Some(body),
        }
    }

    pub fn no_content() -> Self {
        Self { status: 204, body: None }
    }
}

/// Failure inside a write session
enum Abort {
    /// Discard every write of the request
    Rollback(Error),
    /// Keep the writes that succeeded, still report the error
    Commit(Error),
}

impl From<Error> for Abort {
    fn from(err: Error) -> Self {
        Self::Rollback(err)
    }
}

type Attempt<T> = std::result::Result<T, Abort>;

/// Entry point for every resource operation
pub struct ResourceApi {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn Store>,
    config: ApiConfig,
    functions: FunctionRegistry,
    /// Run before the per-model hooks of every collection
    hooks: Hooks,
}

impl ResourceApi {
    pub fn new(registry: Arc<ModelRegistry>, store: Arc<dyn Store>, config: ApiConfig) -> Self {
        Self {
            registry,
            store,
            config,
            functions: FunctionRegistry::new(),
            hooks: Hooks::new(),
        }
    }

    /// Replace the built-in aggregate set, e.g. with extra functions registered
    #[must_use]
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Hooks shared by every collection
    #[must_use]
    pub fn with_universal_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// `GET /<collection>/<id>`
    pub fn get_single(&self, collection: &str, id: &str) -> Result<Response> {
        let resource = self.resource(collection, Method::Get)?;
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::GetSingle, collection).with_instance(id);
        self.run_pre(resource, &mut request)?;
        let id = parse_id(model, request.instance_id.as_deref().unwrap_or(id))?;

        let session = self.store.begin()?;
        let row = session
            .get(model.name(), &id)?
            .ok_or_else(|| Error::not_found(model.name(), &id))?;
        let mut body = self.serializer().to_json(&*session, model, &row)?;
        drop(session);

        self.run_post(resource, &request, &mut body)?;
        Ok(Response::ok(body))
    }

    /// `GET /<collection>/<id>/<relation>[/<related_id>]`
    ///
    /// Runs the `GetSingle` hooks with the relation set on the request.
    pub fn get_related(
        &self,
        collection: &str,
        id: &str,
        relation: &str,
        related_id: Option<&str>,
    ) -> Result<Response> {
        let resource = self.resource(collection, Method::Get)?;
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::GetSingle, collection)
            .with_instance(id)
            .with_relation(relation);
        self.run_pre(resource, &mut request)?;
        let id = parse_id(model, request.instance_id.as_deref().unwrap_or(id))?;
        let rel = model
            .relationship(relation)
            .ok_or_else(|| Error::CollectionNotFound(format!("{collection}/{id}/{relation}")))?;
        let target = self.registry.target(&rel.target)?;
        let related_id = match (rel.cardinality(), related_id) {
            (Cardinality::One, Some(_)) => {
                return Err(Error::InvalidQueryParam(format!(
                    "'{relation}' is a to-one relationship and takes no related id"
                )));
            }
            (_, Some(raw)) => Some(parse_id(target, raw)?),
            (_, None) => None,
        };

        let session = self.store.begin()?;
        if session.get(model.name(), &id)?.is_none() {
            return Err(Error::not_found(model.name(), &id));
        }
        let rows = session.related(model.name(), &id, &rel.name)?;
        let serializer = self.serializer();
        let mut body = match (rel.cardinality(), related_id) {
            (Cardinality::One, _) => match rows.first() {
                Some(row) => serializer.to_json(&*session, target, row)?,
                None => Value::Null,
            },
            (Cardinality::Many, Some(related_id)) => {
                let row = rows
                    .iter()
                    .find(|row| identity(target, row).is_some_and(|r| r.matches(&related_id)))
                    .ok_or_else(|| Error::not_found(format!("{}.{}", model.name(), rel.name), &related_id))?;
                serializer.to_json(&*session, target, row)?
            }
            (Cardinality::Many, None) => json!({
                "objects": serializer.to_json_many(&*session, target, &rows)?,
                "num_results": rows.len(),
            }),
        };
        drop(session);

        self.run_post(resource, &request, &mut body)?;
        Ok(Response::ok(body))
    }

    /// `GET /<collection>?q=...&page=...`
    pub fn get_many(&self, collection: &str, q: Option<&str>, page: Option<usize>) -> Result<Response> {
        let resource = self.resource(collection, Method::Get)?;
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::GetMany, collection).with_search(decode_param("q", q)?);
        self.run_pre(resource, &mut request)?;

        let spec = search_spec(request.search.as_ref())?;
        let mut query = self.compile(resource, &spec)?;
        if let Some(page) = page {
            if page == 0 {
                return Err(Error::InvalidQueryParam("'page' starts at 1".into()));
            }
            query.offset = (page - 1)
                .checked_mul(query.limit.unwrap_or(0))
                .and_then(|skipped| skipped.checked_add(query.offset))
                .ok_or_else(|| Error::InvalidQueryParam(format!("'page' {page} is out of range")))?;
        }

        let session = self.store.begin()?;
        let serializer = self.serializer();
        let mut body = if spec.single {
            let mut rows = session.select(&query.clone().unpaginated())?;
            match rows.len() {
                0 => return Err(Error::NoResultFound),
                1 => serializer.to_json(&*session, model, &rows.remove(0))?,
                _ => return Err(Error::MultipleResultsFound),
            }
        } else {
            let num_results = session.count(&query)?;
            let rows = session.select(&query)?;
            let objects = serializer.to_json_many(&*session, model, &rows)?;
            let total_pages = match query.limit {
                Some(limit) if limit > 0 => num_results.div_ceil(limit),
                _ => usize::from(num_results > 0),
            };
            json!({
                "objects": objects,
                "num_results": num_results,
                "page": query.page(),
                "total_pages": total_pages,
            })
        };
        drop(session);

        self.run_post(resource, &request, &mut body)?;
        Ok(Response::ok(body))
    }

    /// `GET /eval/<collection>?functions=...&q=...`
    pub fn evaluate(&self, collection: &str, functions: Option<&str>, q: Option<&str>) -> Result<Response> {
        let resource = self.resource(collection, Method::Get)?;
        if !resource.options.allow_functions {
            return Err(Error::MethodNotAllowed(format!(
                "function evaluation is not enabled for '{collection}'"
            )));
        }
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::Eval, collection)
            .with_search(decode_param("q", q)?)
            .with_functions(decode_param("functions", functions)?);
        self.run_pre(resource, &mut request)?;

        let specs = request
            .functions
            .as_ref()
            .ok_or_else(|| Error::InvalidQueryParam("missing 'functions' parameter".into()))
            .and_then(FunctionSpec::from_json)?;
        let spec = search_spec(request.search.as_ref())?;
        let query = self.compile(resource, &spec)?;

        self.functions.validate(&specs, model)?;

        let mut body = if specs.is_empty() {
            Value::Object(Map::new())
        } else {
            let session = self.store.begin()?;
            self.functions.evaluate(&specs, &query, &*session, model)?.into_json()
        };

        self.run_post(resource, &request, &mut body)?;
        Ok(Response::ok(body))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// `POST /<collection>`
    pub fn create(&self, collection: &str, body: Value) -> Result<Response> {
        let resource = self.resource(collection, Method::Post)?;
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::Post, collection).with_body(body);
        self.run_pre(resource, &mut request)?;

        let payload = request.body.clone().unwrap_or(Value::Null);
        let decoded = self.deserializer().from_json(&payload, model, Purpose::Create)?;
        // a new instance has nothing to replace
        let edits = parse_edits(model, &self.registry, &decoded.relations, true)?;

        let mut session = self.store.begin()?;
        let result = (|| -> Attempt<Scalar> {
            let id = session.insert(model.name(), decoded.fields)?;
            self.apply_edits(&mut *session, resource, &id, &edits)?;
            Ok(id)
        })();
        let id = settle(session, result)?;
        info!(model = model.name(), id = %id, "Created instance");

        let mut keys = Map::new();
        keys.insert(model.primary_key().to_string(), id.to_json());
        let mut body = Value::Object(keys);
        self.run_post(resource, &request, &mut body)?;
        Ok(Response::created(body))
    }

    /// `PATCH /<collection>/<id>`
    pub fn update_single(&self, collection: &str, id: &str, body: Value) -> Result<Response> {
        let resource = self.resource(collection, Method::Patch)?;
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::PatchSingle, collection)
            .with_instance(id)
            .with_body(body);
        self.run_pre(resource, &mut request)?;
        let id = parse_id(model, request.instance_id.as_deref().unwrap_or(id))?;

        let payload = request.body.clone().unwrap_or(Value::Null);
        let decoded = self.deserializer().from_json(&payload, model, Purpose::Update)?;
        if let Some(pk) = model.primary_key_column() {
            let changed = decoded
                .fields
                .get(&pk.name)
                .map(|v| Scalar::from_stored(pk.field_type, Some(v)))
                .is_some_and(|new| !new.matches(&id));
            if changed {
                return Err(Error::invalid_field(&pk.name, "primary key cannot be changed"));
            }
        }
        let edits = parse_edits(
            model,
            &self.registry,
            &decoded.relations,
            resource.options.allow_to_many_replacement,
        )?;

        let mut session = self.store.begin()?;
        let result = (|| -> Attempt<()> {
            if session.get(model.name(), &id)?.is_none() {
                return Err(Error::not_found(model.name(), &id).into());
            }
            if !decoded.fields.is_empty() {
                session.update(model.name(), &id, &decoded.fields)?;
            }
            self.apply_edits(&mut *session, resource, &id, &edits)
        })();
        settle(session, result)?;
        info!(model = model.name(), id = %id, "Updated instance");

        let session = self.store.begin()?;
        let row = session
            .get(model.name(), &id)?
            .ok_or_else(|| Error::not_found(model.name(), &id))?;
        let mut body = self.serializer().to_json(&*session, model, &row)?;
        drop(session);

        self.run_post(resource, &request, &mut body)?;
        Ok(Response::ok(body))
    }

    /// `PATCH /<collection>?q=...`
    pub fn update_many(&self, collection: &str, q: Option<&str>, body: Value) -> Result<Response> {
        let resource = self.resource(collection, Method::Patch)?;
        if !resource.options.allow_patch_many {
            return Err(Error::MethodNotAllowed(format!(
                "bulk PATCH is not enabled for '{collection}'"
            )));
        }
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::PatchMany, collection)
            .with_search(decode_param("q", q)?)
            .with_body(body);
        self.run_pre(resource, &mut request)?;

        let payload = request.body.clone().unwrap_or(Value::Null);
        let decoded = self.deserializer().from_json(&payload, model, Purpose::Update)?;
        if let Some(relation) = decoded.relations.keys().next() {
            return Err(Error::invalid_field(
                relation,
                "relationships cannot be edited by a bulk update",
            ));
        }
        if decoded.fields.contains_key(model.primary_key()) {
            return Err(Error::invalid_field(model.primary_key(), "primary key cannot be changed"));
        }
        let query = self.bulk_query(resource, request.search.as_ref())?;

        let mut session = self.store.begin()?;
        let result = (|| -> Attempt<usize> {
            let ids = matching_ids(&*session, model, &query)?;
            for id in &ids {
                session.update(model.name(), id, &decoded.fields)?;
            }
            Ok(ids.len())
        })();
        let num_modified = settle(session, result)?;
        info!(model = model.name(), num_modified, "Bulk update");

        let mut body = json!({ "num_modified": num_modified });
        self.run_post(resource, &request, &mut body)?;
        Ok(Response::ok(body))
    }

    /// `DELETE /<collection>/<id>`
    pub fn delete_single(&self, collection: &str, id: &str) -> Result<Response> {
        let resource = self.resource(collection, Method::Delete)?;
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::DeleteSingle, collection).with_instance(id);
        self.run_pre(resource, &mut request)?;
        let id = parse_id(model, request.instance_id.as_deref().unwrap_or(id))?;

        let mut session = self.store.begin()?;
        let result = (|| -> Attempt<()> {
            if session.delete(model.name(), &id)? {
                Ok(())
            } else {
                Err(Error::not_found(model.name(), &id).into())
            }
        })();
        settle(session, result)?;
        info!(model = model.name(), id = %id, "Deleted instance");

        let mut body = Value::Null;
        self.run_post(resource, &request, &mut body)?;
        Ok(Response::no_content())
    }

    /// `DELETE /<collection>?q=...`
    pub fn delete_many(&self, collection: &str, q: Option<&str>) -> Result<Response> {
        let resource = self.resource(collection, Method::Delete)?;
        if !resource.options.allow_delete_many {
            return Err(Error::MethodNotAllowed(format!(
                "bulk DELETE is not enabled for '{collection}'"
            )));
        }
        let model = &*resource.model;
        let mut request = HookRequest::new(Operation::DeleteMany, collection).with_search(decode_param("q", q)?);
        self.run_pre(resource, &mut request)?;
        let query = self.bulk_query(resource, request.search.as_ref())?;

        let mut session = self.store.begin()?;
        let result = (|| -> Attempt<usize> {
            let ids = matching_ids(&*session, model, &query)?;
            for id in &ids {
                session.delete(model.name(), id)?;
            }
            Ok(ids.len())
        })();
        let num_deleted = settle(session, result)?;
        info!(model = model.name(), num_deleted, "Bulk delete");

        let mut body = json!({ "num_deleted": num_deleted });
        self.run_post(resource, &request, &mut body)?;
        Ok(Response::ok(body))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn resource(&self, collection: &str, method: Method) -> Result<&Resource> {
        let resource = self.registry.by_collection(collection)?;
        resource.ensure(method)?;
        Ok(resource)
    }

    fn run_pre(&self, resource: &Resource, request: &mut HookRequest) -> Result<()> {
        self.hooks.run_pre(request)?;
        resource.options.hooks.run_pre(request)
    }

    fn run_post(&self, resource: &Resource, request: &HookRequest, body: &mut Value) -> Result<()> {
        self.hooks.run_post(request, body)?;
        resource.options.hooks.run_post(request, body)
    }

    fn compile(&self, resource: &Resource, spec: &SearchSpec) -> Result<Query> {
        let model = &*resource.model;
        let ast = filter::parse(spec, model, &self.registry, FilterLimits::from(&self.config))?;
        let limits = PageLimits {
            page_size: resource.options.page_size.unwrap_or(self.config.page_size),
            max_page_size: resource.options.max_page_size.unwrap_or(self.config.max_page_size),
        };
        compiler::compile(&ast, spec, model, &self.registry, limits)
    }

    /// Bulk operations ignore pagination and cannot group
    fn bulk_query(&self, resource: &Resource, search: Option<&Value>) -> Result<Query> {
        let spec = search_spec(search)?;
        if !spec.group_by.is_empty() {
            return Err(Error::InvalidQueryParam(
                "'group_by' is not supported by bulk operations".into(),
            ));
        }
        Ok(self.compile(resource, &spec)?.unpaginated())
    }

    fn serializer(&self) -> Serializer<'_> {
        Serializer::new(&self.registry, self.config.relation_depth)
    }

    fn deserializer(&self) -> Deserializer {
        Deserializer::strict(self.config.strict_deserialization)
    }

    fn apply_edits(
        &self,
        session: &mut dyn Session,
        resource: &Resource,
        id: &Scalar,
        edits: &[RelationshipEdit],
    ) -> Attempt<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let engine = RelationshipEngine::new(&self.registry, self.deserializer());
        let outcome = engine.apply(session, &*resource.model, id, edits);
        let atomic = resource
            .options
            .atomic_relationship_edits
            .unwrap_or(self.config.atomic_relationship_edits);
        match outcome.into_result() {
            Ok(report) => {
                debug!(?report, "Relationship edits applied");
                Ok(())
            }
            Err(err) if atomic => Err(Abort::Rollback(err)),
            Err(err) => Err(Abort::Commit(err)),
        }
    }
}

/// Close a write session according to how the request went
fn settle<T>(session: Box<dyn Session + '_>, result: Attempt<T>) -> Result<T> {
    match result {
        Ok(value) => {
            session.commit()?;
            Ok(value)
        }
        Err(Abort::Rollback(err)) => {
            warn!(error = %err, "Rolling back request");
            session.rollback()?;
            Err(err)
        }
        Err(Abort::Commit(err)) => {
            warn!(error = %err, "Keeping successful relationship edits");
            session.commit()?;
            Err(err)
        }
    }
}

fn search_spec(search: Option<&Value>) -> Result<SearchSpec> {
    search.map_or_else(|| Ok(SearchSpec::default()), SearchSpec::from_json)
}

/// Unparsable ids cannot name an instance
fn parse_id(model: &dyn ModelMetadata, raw: &str) -> Result<Scalar> {
    let field_type = model
        .primary_key_column()
        .ok_or_else(|| Error::Config(format!("model '{}' has no primary key column", model.name())))?
        .field_type;
    match Scalar::coerce(field_type, &Value::String(raw.to_string())) {
        Ok(id) if !id.is_null() => Ok(id),
        _ => Err(Error::not_found(model.name(), raw)),
    }
}

fn matching_ids(session: &dyn Session, model: &dyn ModelMetadata, query: &Query) -> Result<Vec<Scalar>> {
    Ok(session
        .select(query)?
        .iter()
        .filter_map(|row| identity(model, row))
        .collect())
}
