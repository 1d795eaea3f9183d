//! Model metadata
//!
//! The engine never looks at concrete model types. It is polymorphic over
//! [`ModelMetadata`], which describes a model's primary key, typed columns
//! and relationships. [`TableModel`] is the stock implementation.

use serde::{Deserialize, Serialize};

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Float,
    String,
    Text,
    Boolean,
    Date,
    DateTime,
    Time,
    Uuid,
    Json,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Time => "time",
            Self::Uuid => "uuid",
            Self::Json => "json",
        }
    }

    /// Fields that accept `like`-style pattern operators
    pub fn is_string_like(self) -> bool {
        matches!(self, Self::String | Self::Text)
    }

    /// Fields with a meaningful `<`/`>` ordering
    pub fn is_ordered(self) -> bool {
        !matches!(self, Self::Boolean | Self::Json)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub has_default: bool,
    pub autoincrement: bool,
}

impl Column {
    /// A nullable column without a default
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            has_default: false,
            autoincrement: false,
        }
    }

    /// An integer primary key assigned by the store
    pub fn serial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Integer,
            nullable: false,
            has_default: false,
            autoincrement: true,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    /// Must a create payload name this column?
    pub fn is_required(&self) -> bool {
        !self.nullable && !self.has_default && !self.autoincrement
    }
}

/// A column name paired with its declared type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub name: String,
    pub field_type: FieldType,
}

impl From<&Column> for ColumnRef {
    fn from(column: &Column) -> Self {
        Self {
            name: column.name.clone(),
            field_type: column.field_type,
        }
    }
}

/// How a relationship is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// Foreign key column on this model referencing the target's primary key
    ManyToOne { foreign_key: String },
    /// Foreign key column on the target referencing this model's primary key
    OneToMany { remote_key: String },
    /// Rows of an association collection pairing both primary keys
    ManyToMany {
        secondary: String,
        local_key: String,
        remote_key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Relationship metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    /// Name of the related model
    pub target: String,
    pub kind: RelationKind,
}

impl Relationship {
    pub fn cardinality(&self) -> Cardinality {
        match self.kind {
            RelationKind::ManyToOne { .. } => Cardinality::One,
            RelationKind::OneToMany { .. } | RelationKind::ManyToMany { .. } => Cardinality::Many,
        }
    }
}

/// Read-only description of one model, supplied by the registry
pub trait ModelMetadata: Send + Sync + std::fmt::Debug {
    /// Model name used by the registry and in error messages
    fn name(&self) -> &str;

    /// URL segment under which the model is exposed
    fn collection_name(&self) -> &str;

    /// Name of the primary-key column
    fn primary_key(&self) -> &str;

    fn columns(&self) -> &[Column];

    fn relationships(&self) -> &[Relationship];

    fn column(&self, name: &str) -> Option<&Column> {
        self.columns().iter().find(|c| c.name == name)
    }

    fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships().iter().find(|r| r.name == name)
    }

    fn primary_key_column(&self) -> Option<&Column> {
        self.column(self.primary_key())
    }

    fn has_field(&self, name: &str) -> bool {
        self.column(name).is_some() || self.relationship(name).is_some()
    }
}

/// Model metadata assembled at start-up
#[derive(Debug, Clone)]
pub struct TableModel {
    name: String,
    collection_name: String,
    primary_key: String,
    columns: Vec<Column>,
    relationships: Vec<Relationship>,
}

impl TableModel {
    /// Start a model whose collection is named after it, keyed by `id`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection_name: name.clone(),
            name,
            primary_key: "id".to_string(),
            columns: vec![],
            relationships: vec![],
        }
    }

    #[must_use]
    pub fn collection(mut self, collection_name: impl Into<String>) -> Self {
        self.collection_name = collection_name.into();
        self
    }

    #[must_use]
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    #[must_use]
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn with_many_to_one(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationships.push(Relationship {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ManyToOne {
                foreign_key: foreign_key.into(),
            },
        });
        self
    }

    #[must_use]
    pub fn with_one_to_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        self.relationships.push(Relationship {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::OneToMany {
                remote_key: remote_key.into(),
            },
        });
        self
    }

    #[must_use]
    pub fn with_many_to_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        secondary: impl Into<String>,
        local_key: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        self.relationships.push(Relationship {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ManyToMany {
                secondary: secondary.into(),
                local_key: local_key.into(),
                remote_key: remote_key.into(),
            },
        });
        self
    }
}

impl ModelMetadata for TableModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection_name(&self) -> &str {
        &self.collection_name
    }

    fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }
}
