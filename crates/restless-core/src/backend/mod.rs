//! Data-access layer
//!
//! The engine talks to storage through [`Store`] and the transaction-scoped
//! [`Session`] it hands out. Writes made through a session become visible
//! on [`Session::commit`]; dropping a session without committing rolls it
//! back.

mod memory;

pub use memory::{InMemoryStore, MemorySession};

use restless_common::Result;
use serde_json::{Map, Value};

use crate::compiler::Query;
use crate::value::Scalar;

/// A stored row: column name to canonical JSON value
pub type Row = Map<String, Value>;

/// Rows sharing the same values for a query's group-by columns
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Group-by column values, keyed by column name
    pub key: Row,
    pub rows: Vec<Row>,
}

/// Storage backend shared by all requests
pub trait Store: Send + Sync {
    /// Open a transaction scope
    fn begin(&self) -> Result<Box<dyn Session + '_>>;
}

/// One transaction scope
pub trait Session {
    /// Rows matching a query, ordered and paginated. A grouped query yields
    /// the first row of each group.
    fn select(&self, query: &Query) -> Result<Vec<Row>>;

    /// Matching groups, in order of first appearance, paginated by group
    fn select_groups(&self, query: &Query) -> Result<Vec<Group>>;

    /// Matching rows (or groups) ignoring pagination
    fn count(&self, query: &Query) -> Result<usize>;

    /// Fetch one row by primary key
    fn get(&self, model: &str, id: &Scalar) -> Result<Option<Row>>;

    /// Insert a row, returning its primary key
    fn insert(&mut self, model: &str, row: Row) -> Result<Scalar>;

    /// Overwrite the given columns of one row
    fn update(&mut self, model: &str, id: &Scalar, changes: &Row) -> Result<()>;

    /// Delete one row. `false` when it did not exist.
    fn delete(&mut self, model: &str, id: &Scalar) -> Result<bool>;

    /// Rows reached from one row through a relationship
    fn related(&self, model: &str, id: &Scalar, relation: &str) -> Result<Vec<Row>>;

    /// Associate `target` with the row through a relationship
    fn attach(&mut self, model: &str, id: &Scalar, relation: &str, target: &Scalar) -> Result<()>;

    /// Remove an association. `false` when none existed.
    fn detach(&mut self, model: &str, id: &Scalar, relation: &str, target: &Scalar) -> Result<bool>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}
