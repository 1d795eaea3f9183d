//! Pre- and post-processors
//!
//! Hooks run per model and per operation. Preprocessors see the raw request
//! before anything is parsed and may rewrite it; postprocessors see the
//! response body before it leaves. Either may abort the request by
//! returning [`Error::ProcessingVeto`](restless_common::Error::ProcessingVeto).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use restless_common::Result;
use serde_json::Value;
use tracing::warn;

/// Operation a hook is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetSingle,
    GetMany,
    Post,
    PatchSingle,
    PatchMany,
    DeleteSingle,
    DeleteMany,
    Eval,
}

/// Raw request state handed to preprocessors
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub operation: Operation,
    pub collection: String,
    pub instance_id: Option<String>,
    /// Relationship named after the instance id, for related reads
    pub relation: Option<String>,
    /// Decoded `q` parameter
    pub search: Option<Value>,
    /// Decoded request body
    pub body: Option<Value>,
    /// Decoded `functions` parameter
    pub functions: Option<Value>,
}

impl HookRequest {
    pub fn new(operation: Operation, collection: impl Into<String>) -> Self {
        Self {
            operation,
            collection: collection.into(),
            instance_id: None,
            relation: None,
            search: None,
            body: None,
            functions: None,
        }
    }

    #[must_use]
    pub fn with_instance(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    #[must_use]
    pub fn with_search(mut self, search: Option<Value>) -> Self {
        self.search = search;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_functions(mut self, functions: Option<Value>) -> Self {
        self.functions = functions;
        self
    }
}

pub type Preprocessor = Arc<dyn Fn(&mut HookRequest) -> Result<()> + Send + Sync>;
pub type Postprocessor = Arc<dyn Fn(&HookRequest, &mut Value) -> Result<()> + Send + Sync>;

/// Hooks registered for one model, or for every model of an API
#[derive(Clone, Default)]
pub struct Hooks {
    pre: HashMap<Operation, Vec<Preprocessor>>,
    post: HashMap<Operation, Vec<Postprocessor>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn preprocessor<F>(mut self, operation: Operation, hook: F) -> Self
    where
        F: Fn(&mut HookRequest) -> Result<()> + Send + Sync + 'static,
    {
        self.pre.entry(operation).or_default().push(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn postprocessor<F>(mut self, operation: Operation, hook: F) -> Self
    where
        F: Fn(&HookRequest, &mut Value) -> Result<()> + Send + Sync + 'static,
    {
        self.post.entry(operation).or_default().push(Arc::new(hook));
        self
    }

    /// Run preprocessors in registration order, stopping at the first veto
    pub fn run_pre(&self, request: &mut HookRequest) -> Result<()> {
        for hook in self.pre.get(&request.operation).into_iter().flatten() {
            hook(request).inspect_err(|e| {
                warn!(collection = %request.collection, operation = ?request.operation, error = %e, "Preprocessor vetoed request");
            })?;
        }
        Ok(())
    }

    /// Run postprocessors in registration order over the response body
    pub fn run_post(&self, request: &HookRequest, body: &mut Value) -> Result<()> {
        for hook in self.post.get(&request.operation).into_iter().flatten() {
            hook(request, body).inspect_err(|e| {
                warn!(collection = %request.collection, operation = ?request.operation, error = %e, "Postprocessor vetoed response");
            })?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre", &count(&self.pre))
            .field("post", &count(&self.post))
            .finish()
    }
}

fn count<T>(hooks: &HashMap<Operation, Vec<T>>) -> usize {
    hooks.values().map(Vec::len).sum()
}
