//! Model registry
//!
//! Built once at start-up through [`RegistryBuilder`], validated, then
//! shared read-only as `Arc<ModelRegistry>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use restless_common::{Error, Result};
use tracing::info;

use crate::hooks::Hooks;
use crate::model::{ModelMetadata, RelationKind};

/// HTTP methods a resource may enable. `Patch` also enables `PUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Per-model API options
#[derive(Debug, Clone)]
pub struct ResourceOptions {
    pub methods: HashSet<Method>,
    pub allow_patch_many: bool,
    pub allow_delete_many: bool,
    pub allow_functions: bool,
    pub allow_to_many_replacement: bool,
    /// Only these columns are serialized, when set
    pub include_columns: Option<Vec<String>>,
    pub exclude_columns: Vec<String>,
    pub page_size: Option<usize>,
    pub max_page_size: Option<usize>,
    /// Overrides `api.atomic_relationship_edits` for this model
    pub atomic_relationship_edits: Option<bool>,
    pub hooks: Hooks,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            methods: HashSet::from([Method::Get]),
            allow_patch_many: false,
            allow_delete_many: false,
            allow_functions: false,
            allow_to_many_replacement: false,
            include_columns: None,
            exclude_columns: vec![],
            page_size: None,
            max_page_size: None,
            atomic_relationship_edits: None,
            hooks: Hooks::default(),
        }
    }
}

impl ResourceOptions {
    /// Read-only resource (GET only)
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Metadata only: related to by other models but never exposed
    pub fn hidden() -> Self {
        Self {
            methods: HashSet::new(),
            ..Self::default()
        }
    }

    /// Every method enabled
    pub fn read_write() -> Self {
        Self::default().methods([Method::Get, Method::Post, Method::Patch, Method::Delete])
    }

    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    #[must_use]
    pub fn allow_patch_many(mut self) -> Self {
        self.allow_patch_many = true;
        self
    }

    #[must_use]
    pub fn allow_delete_many(mut self) -> Self {
        self.allow_delete_many = true;
        self
    }

    #[must_use]
    pub fn allow_functions(mut self) -> Self {
        self.allow_functions = true;
        self
    }

    #[must_use]
    pub fn allow_to_many_replacement(mut self) -> Self {
        self.allow_to_many_replacement = true;
        self
    }

    #[must_use]
    pub fn include_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.include_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn exclude_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.exclude_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: usize, max_page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self.max_page_size = Some(max_page_size);
        self
    }

    #[must_use]
    pub fn atomic_relationship_edits(mut self, atomic: bool) -> Self {
        self.atomic_relationship_edits = Some(atomic);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn allows(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Is this field part of serialized output?
    pub fn is_visible(&self, field: &str) -> bool {
        if self.exclude_columns.iter().any(|c| c == field) {
            return false;
        }
        self.include_columns
            .as_ref()
            .map_or(true, |cols| cols.iter().any(|c| c == field))
    }
}

/// A registered model with its options
#[derive(Debug, Clone)]
pub struct Resource {
    pub model: Arc<dyn ModelMetadata>,
    pub options: ResourceOptions,
}

impl Resource {
    /// Fail with `MethodNotAllowed` unless `method` is enabled
    pub fn ensure(&self, method: Method) -> Result<()> {
        if self.options.allows(method) {
            Ok(())
        } else {
            Err(Error::MethodNotAllowed(format!(
                "{} is not enabled for '{}'",
                method.as_str(),
                self.model.collection_name()
            )))
        }
    }
}

/// Immutable model-to-metadata registry
#[derive(Debug, Default)]
pub struct ModelRegistry {
    resources: HashMap<String, Resource>,
    collections: HashMap<String, String>,
}

impl ModelRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Metadata by model name
    pub fn model(&self, name: &str) -> Option<&dyn ModelMetadata> {
        self.resources.get(name).map(|r| r.model.as_ref())
    }

    /// Model and options by model name
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    /// Resolve an exposed collection, failing with `CollectionNotFound`
    pub fn by_collection(&self, collection: &str) -> Result<&Resource> {
        self.collections
            .get(collection)
            .and_then(|name| self.resources.get(name))
            .filter(|r| !r.options.methods.is_empty())
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    /// Metadata for a related model; registration guarantees presence
    pub fn target(&self, name: &str) -> Result<&dyn ModelMetadata> {
        self.model(name)
            .ok_or_else(|| Error::Config(format!("model '{name}' is not registered")))
    }

    pub fn models(&self) -> impl Iterator<Item = &dyn ModelMetadata> {
        self.resources.values().map(|r| r.model.as_ref())
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Collects models before the registry is closed
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    resources: Vec<Resource>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn register(mut self, model: impl ModelMetadata + 'static, options: ResourceOptions) -> Self {
        self.resources.push(Resource {
            model: Arc::new(model),
            options,
        });
        self
    }

    /// Validate every model and close the registry
    pub fn build(self) -> Result<ModelRegistry> {
        let mut registry = ModelRegistry::default();
        for resource in self.resources {
            let name = resource.model.name().to_string();
            let collection = resource.model.collection_name().to_string();
            if registry.resources.contains_key(&name) {
                return Err(Error::Config(format!("model '{name}' registered twice")));
            }
            if let Some(other) = registry.collections.insert(collection.clone(), name.clone()) {
                return Err(Error::Config(format!(
                    "collection '{collection}' used by both '{other}' and '{name}'"
                )));
            }
            registry.resources.insert(name, resource);
        }

        for resource in registry.resources.values() {
            validate(&registry, resource.model.as_ref())?;
        }

        info!(models = registry.len(), "Model registry built");
        Ok(registry)
    }
}

fn validate(registry: &ModelRegistry, model: &dyn ModelMetadata) -> Result<()> {
    let name = model.name();
    if model.primary_key_column().is_none() {
        return Err(Error::Config(format!(
            "model '{name}' has no primary key column '{}'",
            model.primary_key()
        )));
    }
    for rel in model.relationships() {
        if model.column(&rel.name).is_some() {
            return Err(Error::Config(format!(
                "relationship '{name}.{}' shadows a column",
                rel.name
            )));
        }
        let target = registry.model(&rel.target).ok_or_else(|| {
            Error::Config(format!(
                "relationship '{name}.{}' targets unknown model '{}'",
                rel.name, rel.target
            ))
        })?;
        let (holder, key) = match &rel.kind {
            RelationKind::ManyToOne { foreign_key } => (model, foreign_key),
            RelationKind::OneToMany { remote_key } => (target, remote_key),
            RelationKind::ManyToMany { .. } => continue,
        };
        if holder.column(key).is_none() {
            return Err(Error::Config(format!(
                "relationship '{name}.{}' needs column '{key}' on '{}'",
                rel.name,
                holder.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, FieldType, TableModel};

    fn person() -> TableModel {
        TableModel::new("person")
            .with_column(Column::serial("id"))
            .with_column(Column::new("name", FieldType::String))
            .with_one_to_many("computers", "computer", "owner_id")
    }

    fn computer() -> TableModel {
        TableModel::new("computer")
            .with_column(Column::serial("id"))
            .with_column(Column::new("owner_id", FieldType::Integer))
            .with_many_to_one("owner", "person", "owner_id")
    }

    #[test]
    fn test_build_and_lookup() {
        let registry = ModelRegistry::builder()
            .register(person(), ResourceOptions::read_write())
            .register(computer(), ResourceOptions::hidden())
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_collection("person").unwrap().model.name(), "person");
        assert!(registry.model("computer").is_some());
        // hidden models are not routable
        assert!(matches!(
            registry.by_collection("computer"),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = ModelRegistry::builder()
            .register(person(), ResourceOptions::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_foreign_key_rejected() {
        let broken = TableModel::new("computer")
            .with_column(Column::serial("id"))
            .with_many_to_one("owner", "person", "owner_id");
        let err = ModelRegistry::builder()
            .register(person(), ResourceOptions::default())
            .register(broken, ResourceOptions::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("owner_id"));
    }

    #[test]
    fn test_method_gating() {
        let resource = Resource {
            model: Arc::new(person()),
            options: ResourceOptions::read_only(),
        };
        assert!(resource.ensure(Method::Get).is_ok());
        let err = resource.ensure(Method::Delete).unwrap_err();
        assert_eq!(err.status_code(), 405);
    }

    #[test]
    fn test_column_visibility() {
        let options = ResourceOptions::default()
            .include_columns(["id", "name", "age"])
            .exclude_columns(["age"]);
        assert!(options.is_visible("name"));
        assert!(!options.is_visible("age"));
        assert!(!options.is_visible("birthday"));
    }
}
