//! Restless Core
//!
//! Turns JSON requests against registered models into executable queries
//! and mutations:
//! - Filter grammar and validation against model metadata
//! - Query compilation (predicates, ordering, grouping, pagination)
//! - Aggregate function evaluation
//! - Relationship add/remove edits
//! - Serialization with bounded relationship depth
//! - Pre- and post-processor hooks

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod compiler;
pub mod filter;
pub mod functions;
pub mod hooks;
pub mod model;
pub mod registry;
pub mod relations;
pub mod sample;
pub mod search;
pub mod serializer;
pub mod value;

mod resource;

pub use backend::{InMemoryStore, Row, Session, Store};
pub use compiler::{compile, Predicate, Query};
pub use filter::{Expr, Filter, Operator};
pub use functions::{Evaluation, FunctionRegistry, FunctionSpec};
pub use hooks::{HookRequest, Hooks, Operation};
pub use model::{Column, FieldType, ModelMetadata, RelationKind, Relationship, TableModel};
pub use registry::{Method, ModelRegistry, Resource, ResourceOptions};
pub use resource::{ResourceApi, Response};
pub use search::SearchSpec;
pub use serializer::{Deserializer, Serializer};
pub use value::Scalar;
