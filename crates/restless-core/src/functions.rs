//! Aggregate function evaluation
//!
//! Requests name functions as `{"name": "sum", "field": "age"}` and receive
//! results keyed `"sum__age"`.

use std::collections::HashMap;
use std::sync::Arc;

use restless_common::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::{Row, Session};
use crate::compiler::Query;
use crate::model::{ColumnRef, ModelMetadata};
use crate::value::Scalar;

/// Function registry
pub struct FunctionRegistry {
    aggregate_functions: HashMap<String, Arc<dyn AggregateFunction>>,
}

impl FunctionRegistry {
    /// Create a registry with the built-in aggregates
    pub fn new() -> Self {
        let mut registry = Self {
            aggregate_functions: HashMap::new(),
        };

        registry.register(Arc::new(CountFunction));
        registry.register(Arc::new(SumFunction));
        registry.register(Arc::new(AvgFunction));
        registry.register_aggregate("average", Arc::new(AvgFunction));
        registry.register(Arc::new(MinFunction));
        registry.register(Arc::new(MaxFunction));

        registry
    }

    /// Register under the function's own name
    pub fn register(&mut self, func: Arc<dyn AggregateFunction>) {
        let name = func.name().to_string();
        self.register_aggregate(&name, func);
    }

    /// Register under an alias; names are case-insensitive
    pub fn register_aggregate(&mut self, name: &str, func: Arc<dyn AggregateFunction>) {
        self.aggregate_functions.insert(name.to_lowercase(), func);
    }

    pub fn get_aggregate(&self, name: &str) -> Option<Arc<dyn AggregateFunction>> {
        self.aggregate_functions.get(&name.to_lowercase()).cloned()
    }

    /// Check every name and field without reading any rows
    pub fn validate(&self, specs: &[FunctionSpec], model: &dyn ModelMetadata) -> Result<()> {
        self.bind(specs, model).map(|_| ())
    }

    /// Evaluate aggregates over the rows a query selects.
    ///
    /// Every name and field is validated before any row is read. Pagination
    /// is ignored; a grouped query yields one mapping per group.
    pub fn evaluate(
        &self,
        specs: &[FunctionSpec],
        query: &Query,
        session: &dyn Session,
        model: &dyn ModelMetadata,
    ) -> Result<Evaluation> {
        if specs.is_empty() {
            return Ok(Evaluation::Scalar(Map::new()));
        }

        let bound = self.bind(specs, model)?;
        let query = query.clone().unpaginated();
        debug!(model = model.name(), functions = bound.len(), grouped = query.is_grouped(), "Evaluating functions");

        if query.is_grouped() {
            let results = session
                .select_groups(&query)?
                .into_iter()
                .map(|group| {
                    let mut result = group.key;
                    result.extend(aggregate(&bound, &group.rows));
                    result
                })
                .collect();
            return Ok(Evaluation::Grouped(results));
        }

        let rows = session.select(&query)?;
        Ok(Evaluation::Scalar(aggregate(&bound, &rows)))
    }

    /// Resolve every spec, failing with all unsupported names first, then
    /// all unknown fields
    fn bind(&self, specs: &[FunctionSpec], model: &dyn ModelMetadata) -> Result<Vec<Bound>> {
        let unsupported: Vec<Error> = specs
            .iter()
            .filter(|s| self.get_aggregate(&s.name).is_none())
            .map(|s| Error::UnsupportedFunction(s.name.clone()))
            .collect();
        if let Some(err) = Error::from_failures(unsupported) {
            return Err(err);
        }

        let mut bound = Vec::with_capacity(specs.len());
        let mut failures = vec![];
        for spec in specs {
            let (Some(function), column) = (self.get_aggregate(&spec.name), model.column(&spec.field)) else {
                continue;
            };
            match column {
                Some(column) => bound.push(Bound {
                    key: spec.result_key(),
                    column: ColumnRef::from(column),
                    function,
                }),
                None => failures.push(Error::UnknownField {
                    model: model.name().to_string(),
                    field: spec.field.clone(),
                }),
            }
        }
        match Error::from_failures(failures) {
            Some(err) => Err(err),
            None => Ok(bound),
        }
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate function trait
pub trait AggregateFunction: Send + Sync {
    /// Function name
    fn name(&self) -> &str;

    /// Create a fresh accumulator
    fn create_accumulator(&self) -> Box<dyn Accumulator>;
}

/// Accumulator for aggregate functions
pub trait Accumulator: Send {
    /// Fold in one column value
    fn accumulate(&mut self, value: &Scalar);

    /// Final result
    fn finalize(&self) -> Value;
}

/// One requested aggregate
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub field: String,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Key of this function's result, `"<name>__<field>"`
    pub fn result_key(&self) -> String {
        format!("{}__{}", self.name, self.field)
    }

    /// Decode the `functions` parameter, a JSON list of specs
    pub fn from_json(value: &Value) -> Result<Vec<Self>> {
        Vec::<Self>::deserialize(value).map_err(|e| {
            Error::InvalidQueryParam(format!(
                "'functions' must be a list of {{\"name\", \"field\"}} objects: {e}"
            ))
        })
    }
}

/// Evaluation result
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Scalar(Map<String, Value>),
    Grouped(Vec<Map<String, Value>>),
}

impl Evaluation {
    /// A grouped result is wrapped as `{"objects": [...]}`
    pub fn into_json(self) -> Value {
        match self {
            Self::Scalar(map) => Value::Object(map),
            Self::Grouped(groups) => {
                let objects = groups.into_iter().map(Value::Object).collect();
                let mut body = Map::new();
                body.insert("objects".to_string(), Value::Array(objects));
                Value::Object(body)
            }
        }
    }
}

struct Bound {
    key: String,
    column: ColumnRef,
    function: Arc<dyn AggregateFunction>,
}

/// Duplicate keys overwrite, last spec wins
fn aggregate(bound: &[Bound], rows: &[Row]) -> Map<String, Value> {
    let mut results = Map::new();
    for b in bound {
        let mut acc = b.function.create_accumulator();
        for row in rows {
            acc.accumulate(&Scalar::from_stored(b.column.field_type, row.get(&b.column.name)));
        }
        results.insert(b.key.clone(), acc.finalize());
    }
    results
}

// ============================================================================
// Built-in aggregate functions
// ============================================================================

struct CountFunction;

impl AggregateFunction for CountFunction {
    fn name(&self) -> &str {
        "count"
    }

    fn create_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(CountAccumulator { count: 0 })
    }
}

struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    fn accumulate(&mut self, value: &Scalar) {
        if !value.is_null() {
            self.count += 1;
        }
    }

    fn finalize(&self) -> Value {
        Value::from(self.count)
    }
}

struct SumFunction;

impl AggregateFunction for SumFunction {
    fn name(&self) -> &str {
        "sum"
    }

    fn create_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(SumAccumulator { sum: None })
    }
}

/// Stays integral until a float is seen
#[derive(Clone, Copy)]
enum Total {
    Int(i64),
    Float(f64),
}

struct SumAccumulator {
    sum: Option<Total>,
}

#[allow(clippy::cast_precision_loss)]
impl Accumulator for SumAccumulator {
    fn accumulate(&mut self, value: &Scalar) {
        let next = match (self.sum, value) {
            (None, Scalar::Int(i)) => Total::Int(*i),
            (None, Scalar::Float(f)) => Total::Float(*f),
            (Some(Total::Int(acc)), Scalar::Int(i)) => match acc.checked_add(*i) {
                Some(sum) => Total::Int(sum),
                None => Total::Float(acc as f64 + *i as f64),
            },
            (Some(Total::Int(acc)), Scalar::Float(f)) => Total::Float(acc as f64 + f),
            (Some(Total::Float(acc)), Scalar::Int(i)) => Total::Float(acc + *i as f64),
            (Some(Total::Float(acc)), Scalar::Float(f)) => Total::Float(acc + f),
            _ => return,
        };
        self.sum = Some(next);
    }

    fn finalize(&self) -> Value {
        match self.sum {
            None => Value::Null,
            Some(Total::Int(i)) => Scalar::Int(i).to_json(),
            Some(Total::Float(f)) => Scalar::Float(f).to_json(),
        }
    }
}

struct AvgFunction;

impl AggregateFunction for AvgFunction {
    fn name(&self) -> &str {
        "avg"
    }

    fn create_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(AvgAccumulator { sum: 0.0, count: 0 })
    }
}

struct AvgAccumulator {
    sum: f64,
    count: u64,
}

#[allow(clippy::cast_precision_loss)]
impl Accumulator for AvgAccumulator {
    fn accumulate(&mut self, value: &Scalar) {
        let n = match value {
            Scalar::Int(i) => *i as f64,
            Scalar::Float(f) => *f,
            _ => return,
        };
        self.sum += n;
        self.count += 1;
    }

    fn finalize(&self) -> Value {
        if self.count == 0 {
            Value::Null
        } else {
            Scalar::Float(self.sum / self.count as f64).to_json()
        }
    }
}

struct MinFunction;

impl AggregateFunction for MinFunction {
    fn name(&self) -> &str {
        "min"
    }

    fn create_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(ExtremeAccumulator {
            best: None,
            keep: std::cmp::Ordering::Less,
        })
    }
}

struct MaxFunction;

impl AggregateFunction for MaxFunction {
    fn name(&self) -> &str {
        "max"
    }

    fn create_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(ExtremeAccumulator {
            best: None,
            keep: std::cmp::Ordering::Greater,
        })
    }
}

/// Min or max over any ordered type
struct ExtremeAccumulator {
    best: Option<Scalar>,
    /// Replace the current best when the new value compares this way
    keep: std::cmp::Ordering,
}

impl Accumulator for ExtremeAccumulator {
    fn accumulate(&mut self, value: &Scalar) {
        if value.is_null() {
            return;
        }
        let replace = match &self.best {
            None => true,
            Some(best) => value.compare(best) == Some(self.keep),
        };
        if replace {
            self.best = Some(value.clone());
        }
    }

    fn finalize(&self) -> Value {
        self.best.as_ref().map_or(Value::Null, Scalar::to_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample;
    use serde_json::json;

    fn run(specs: &[FunctionSpec], query: impl FnOnce(&dyn ModelMetadata) -> Query) -> Result<Evaluation> {
        let registry = sample::registry().unwrap();
        let store = sample::store(registry.clone()).unwrap();
        let session = store.session();
        let model = registry.model("person").unwrap();
        FunctionRegistry::new().evaluate(specs, &query(model), &session, model)
    }

    #[test]
    fn test_sum_stays_integer() {
        let result = run(&[FunctionSpec::new("sum", "age")], Query::all).unwrap();
        assert_eq!(result.into_json(), json!({"sum__age": 90}));
    }

    #[test]
    fn test_empty_specs() {
        let result = run(&[], Query::all).unwrap();
        assert_eq!(result.into_json(), json!({}));
    }

    #[test]
    fn test_all_builtins() {
        let specs = [
            FunctionSpec::new("count", "other"),
            FunctionSpec::new("avg", "age"),
            FunctionSpec::new("average", "age"),
            FunctionSpec::new("min", "birthday"),
            FunctionSpec::new("max", "name"),
            FunctionSpec::new("sum", "other"),
        ];
        let result = run(&specs, Query::all).unwrap().into_json();
        assert_eq!(result["count__other"], json!(2));
        assert_eq!(result["avg__age"], json!(30.0));
        assert_eq!(result["average__age"], json!(30.0));
        assert_eq!(result["min__birthday"], json!("1984-11-30"));
        assert_eq!(result["max__name"], json!("Tom"));
        assert_eq!(result["sum__other"], json!(4.0));
    }

    #[test]
    fn test_pagination_ignored() {
        let result = run(&[FunctionSpec::new("count", "id")], |model| Query {
            limit: Some(1),
            ..Query::all(model)
        })
        .unwrap();
        assert_eq!(result.into_json(), json!({"count__id": 3}));
    }

    #[test]
    fn test_avg_of_nothing_is_null() {
        let result = run(&[FunctionSpec::new("avg", "age")], |model| Query {
            predicate: crate::compiler::Predicate::Or(vec![]),
            ..Query::all(model)
        })
        .unwrap();
        assert_eq!(result.into_json(), json!({"avg__age": null}));
    }

    #[test]
    fn test_unsupported_function() {
        let err = run(
            &[FunctionSpec::new("sum", "bogus"), FunctionSpec::new("median", "age")],
            Query::all,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFunction(ref name) if name == "median"));
    }

    #[test]
    fn test_unknown_field() {
        let err = run(&[FunctionSpec::new("sum", "height")], Query::all).unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[test]
    fn test_grouped() {
        let registry = sample::registry().unwrap();
        let store = sample::store(registry.clone()).unwrap();
        let session = store.session();
        let model = registry.model("computer").unwrap();
        let query = Query {
            group_by: vec![ColumnRef::from(model.column("vendor").unwrap())],
            ..Query::all(model)
        };
        let result = FunctionRegistry::new()
            .evaluate(&[FunctionSpec::new("count", "id")], &query, &session, model)
            .unwrap();
        let Evaluation::Grouped(groups) = result else {
            panic!("expected grouped result");
        };
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["vendor"], json!("Dell"));
        assert_eq!(groups[0]["count__id"], json!(2));
        assert_eq!(groups[1]["count__id"], json!(1));
    }

    #[test]
    fn test_spec_decoding() {
        let specs = FunctionSpec::from_json(&json!([{"name": "sum", "field": "age"}])).unwrap();
        assert_eq!(specs[0].result_key(), "sum__age");
        assert!(FunctionSpec::from_json(&json!({"name": "sum"})).is_err());
    }

    struct SpanFunction;

    impl AggregateFunction for SpanFunction {
        fn name(&self) -> &str {
            "Span"
        }

        fn create_accumulator(&self) -> Box<dyn Accumulator> {
            Box::new(SpanAccumulator { low: None, high: None })
        }
    }

    struct SpanAccumulator {
        low: Option<i64>,
        high: Option<i64>,
    }

    impl Accumulator for SpanAccumulator {
        fn accumulate(&mut self, value: &Scalar) {
            if let Scalar::Int(v) = value {
                self.low = Some(self.low.map_or(*v, |low| low.min(*v)));
                self.high = Some(self.high.map_or(*v, |high| high.max(*v)));
            }
        }

        fn finalize(&self) -> Value {
            match (self.low, self.high) {
                (Some(low), Some(high)) => json!(high - low),
                _ => Value::Null,
            }
        }
    }

    #[test]
    fn test_register_by_name() {
        let mut functions = FunctionRegistry::new();
        assert!(functions.get_aggregate("span").is_none());
        functions.register(Arc::new(SpanFunction));
        assert_eq!(functions.get_aggregate("SPAN").unwrap().name(), "Span");
        assert_eq!(functions.get_aggregate("average").unwrap().name(), "avg");

        let registry = sample::registry().unwrap();
        let store = sample::store(registry.clone()).unwrap();
        let model = registry.model("person").unwrap();
        let result = functions
            .evaluate(&[FunctionSpec::new("span", "age")], &Query::all(model), &store.session(), model)
            .unwrap();
        assert_eq!(result.into_json(), json!({"span__age": 20}));
    }
}
