//! Filter grammar and AST
//!
//! Raw JSON filters are validated against model metadata and turned into a
//! typed [`Expr`] tree. A filter is either
//!
//! ```json
//! {"name": "age", "op": "gt", "val": 20}
//! {"name": "age", "op": "lt", "field": "height"}
//! {"name": "computers", "op": "any", "val": {"name": "vendor", "op": "eq", "val": "Dell"}}
//! ```
//!
//! and a junction is `{"op": "or", "conditions": [...]}` or the compact
//! `{"or": [...]}`, `{"and": [...]}`, `{"not": {...}}`.

use std::fmt;

use restless_common::{ApiConfig, Error, Result};
use serde_json::{Map, Value};

use crate::model::{Cardinality, Column, ColumnRef, FieldType, ModelMetadata};
use crate::registry::ModelRegistry;
use crate::search::SearchSpec;
use crate::value::Scalar;

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Has,
    Any,
}

impl Operator {
    /// Resolve an operator name or one of its aliases
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name.to_ascii_lowercase().as_str() {
            "==" | "eq" | "equals" | "equal_to" => Self::Eq,
            "!=" | "ne" | "neq" | "not_equal_to" | "does_not_equal" => Self::Neq,
            ">" | "gt" => Self::Gt,
            ">=" | "ge" | "gte" | "geq" => Self::Gte,
            "<" | "lt" => Self::Lt,
            "<=" | "le" | "lte" | "leq" => Self::Lte,
            "like" => Self::Like,
            "ilike" => Self::Ilike,
            "not_like" => Self::NotLike,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "is_null" => Self::IsNull,
            "is_not_null" => Self::IsNotNull,
            "has" => Self::Has,
            "any" => Self::Any,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Like => "like",
            Self::Ilike => "ilike",
            Self::NotLike => "not_like",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::IsNull => "is_null",
            Self::IsNotNull => "is_not_null",
            Self::Has => "has",
            Self::Any => "any",
        }
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Self::IsNull | Self::IsNotNull)
    }

    /// `has` / `any`, evaluated against related rows
    pub fn is_relational(self) -> bool {
        matches!(self, Self::Has | Self::Any)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Neq | Self::Gt | Self::Gte | Self::Lt | Self::Lte
        )
    }

    pub fn is_ordering(self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }

    pub fn is_pattern(self) -> bool {
        matches!(self, Self::Like | Self::Ilike | Self::NotLike)
    }

    pub fn is_membership(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    /// Can this operator be applied to a column of the given type?
    fn check_type(self, field_type: FieldType) -> std::result::Result<(), String> {
        if self.is_ordering() && !field_type.is_ordered() {
            return Err(format!("{} fields have no ordering", field_type.name()));
        }
        if self.is_pattern() && !field_type.is_string_like() {
            return Err(format!(
                "pattern matching needs a string field, not {}",
                field_type.name()
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// AST
// ============================================================================

/// `field` or `relation.field` (also written `relation__field`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub relation: Option<String>,
    pub field: String,
}

impl FieldPath {
    pub fn local(field: impl Into<String>) -> Self {
        Self {
            relation: None,
            field: field.into(),
        }
    }

    /// Split a raw path. `None` when it is empty or has more than one hop.
    pub fn parse(raw: &str) -> Option<Self> {
        let (relation, field) = if let Some((rel, field)) = raw.split_once('.') {
            (Some(rel), field)
        } else if let Some((rel, field)) = raw.split_once("__") {
            (Some(rel), field)
        } else {
            (None, raw)
        };
        if field.is_empty()
            || relation == Some("")
            || field.contains('.')
            || (relation.is_some() && field.contains("__"))
        {
            return None;
        }
        Some(Self {
            relation: relation.map(str::to_string),
            field: field.to_string(),
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(rel) => write!(f, "{rel}.{}", self.field),
            None => f.write_str(&self.field),
        }
    }
}

/// Right-hand side of a filter
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Unary operators
    None,
    Value(Scalar),
    List(Vec<Scalar>),
    /// Another column of the same model
    Field(ColumnRef),
    /// Condition on related rows (`has` / `any`)
    Nested(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub path: FieldPath,
    /// Resolved left-hand column; `None` for `has` / `any`
    pub column: Option<ColumnRef>,
    pub operator: Operator,
    pub operand: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JunctionOp {
    #[default]
    And,
    Or,
    Not,
}

impl JunctionOp {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "not" => Some(Self::Not),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Junction {
    pub op: JunctionOp,
    pub conditions: Vec<Expr>,
}

/// Validated filter tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Filter(Filter),
    Junction(Junction),
}

impl Expr {
    /// Levels of nesting, counting relationship filters as a level
    pub fn depth(&self) -> usize {
        match self {
            Self::Filter(Filter {
                operand: Operand::Nested(inner),
                ..
            }) => 1 + inner.depth(),
            Self::Filter(_) => 1,
            Self::Junction(j) => 1 + j.conditions.iter().map(Expr::depth).max().unwrap_or(0),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Complexity bounds applied while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterLimits {
    pub max_depth: usize,
    pub max_breadth: usize,
    pub strict_unary_operands: bool,
}

impl From<&ApiConfig> for FilterLimits {
    fn from(config: &ApiConfig) -> Self {
        Self {
            max_depth: config.max_filter_depth,
            max_breadth: config.max_filter_breadth,
            strict_unary_operands: config.strict_unary_operands,
        }
    }
}

impl Default for FilterLimits {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

/// Parse the filters of a search into a tree rooted at its junction
pub fn parse(
    spec: &SearchSpec,
    model: &dyn ModelMetadata,
    registry: &ModelRegistry,
    limits: FilterLimits,
) -> Result<Expr> {
    FilterParser::new(registry, limits).parse(spec, model)
}

/// Parse a single filter or junction node
pub fn parse_node(
    node: &Value,
    model: &dyn ModelMetadata,
    registry: &ModelRegistry,
    limits: FilterLimits,
) -> Result<Expr> {
    FilterParser::new(registry, limits).parse_node(node, model, 1)
}

pub struct FilterParser<'a> {
    registry: &'a ModelRegistry,
    limits: FilterLimits,
}

impl<'a> FilterParser<'a> {
    pub fn new(registry: &'a ModelRegistry, limits: FilterLimits) -> Self {
        Self { registry, limits }
    }

    pub fn parse(&self, spec: &SearchSpec, model: &dyn ModelMetadata) -> Result<Expr> {
        let conditions = self.parse_children(&spec.filters, model, 1)?;
        Ok(Expr::Junction(Junction {
            op: spec.junction,
            conditions,
        }))
    }

    pub fn parse_node(&self, node: &Value, model: &dyn ModelMetadata, depth: usize) -> Result<Expr> {
        self.check_depth(depth)?;

        let Some(obj) = node.as_object() else {
            return Err(shape_error(format!("expected a filter object, got {node}")));
        };

        if obj.contains_key("name") {
            return self.parse_filter(obj, model, depth).map(Expr::Filter);
        }

        if let Some(conditions) = obj.get("conditions") {
            let op = obj
                .get("op")
                .and_then(Value::as_str)
                .and_then(JunctionOp::parse)
                .ok_or_else(|| shape_error("junction 'op' must be one of and/or/not"))?;
            return self.parse_junction(op, conditions, model, depth);
        }

        if obj.len() == 1 {
            if let Some((key, conditions)) = obj.iter().next() {
                if let Some(op) = JunctionOp::parse(key) {
                    return self.parse_junction(op, conditions, model, depth);
                }
            }
        }

        Err(shape_error(format!("unrecognized filter {node}")))
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.limits.max_depth {
            return Err(Error::QueryTooComplex(format!(
                "filters nest deeper than {} levels",
                self.limits.max_depth
            )));
        }
        Ok(())
    }

    /// Parse every child, aggregating failures. Complexity errors win.
    fn parse_children(&self, nodes: &[Value], model: &dyn ModelMetadata, depth: usize) -> Result<Vec<Expr>> {
        if nodes.len() > self.limits.max_breadth {
            return Err(Error::QueryTooComplex(format!(
                "{} conditions under one junction, at most {} allowed",
                nodes.len(),
                self.limits.max_breadth
            )));
        }

        let mut parsed = Vec::with_capacity(nodes.len());
        let mut failures = vec![];
        for node in nodes {
            match self.parse_node(node, model, depth) {
                Ok(expr) => parsed.push(expr),
                Err(err @ Error::QueryTooComplex(_)) => return Err(err),
                Err(Error::MultipleFailures(errors)) => failures.extend(errors),
                Err(err) => failures.push(err),
            }
        }

        match Error::from_failures(failures) {
            Some(err) => Err(err),
            None => Ok(parsed),
        }
    }

    fn parse_junction(
        &self,
        op: JunctionOp,
        conditions: &Value,
        model: &dyn ModelMetadata,
        depth: usize,
    ) -> Result<Expr> {
        let nodes: &[Value] = match conditions {
            Value::Array(items) => items,
            Value::Object(_) if op == JunctionOp::Not => std::slice::from_ref(conditions),
            _ => return Err(shape_error("junction conditions must be a list")),
        };
        let conditions = self.parse_children(nodes, model, depth + 1)?;
        Ok(Expr::Junction(Junction { op, conditions }))
    }

    fn parse_filter(&self, obj: &Map<String, Value>, model: &dyn ModelMetadata, depth: usize) -> Result<Filter> {
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| shape_error("filter 'name' must be a string"))?;
        let op_name = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_filter(name, "missing 'op'"))?;
        let operator = Operator::parse(op_name)
            .ok_or_else(|| Error::invalid_operator(name, op_name, "unknown operator"))?;

        let val = obj.get("val");
        let other = obj.get("field");
        if val.is_some() && other.is_some() {
            return Err(Error::invalid_operator(
                name,
                op_name,
                "'val' and 'field' are mutually exclusive",
            ));
        }

        let path = if model.column(name).is_some() {
            FieldPath::local(name)
        } else {
            FieldPath::parse(name).ok_or_else(|| {
                Error::invalid_filter(name, "a field path may cross at most one relationship")
            })?
        };

        if operator.is_relational() {
            return self.parse_relational(name, op_name, operator, path, val, other, model, depth);
        }

        let (owner, column) = self.resolve_column(&path, model, name)?;
        operator
            .check_type(column.field_type)
            .map_err(|reason| Error::invalid_operator(name, op_name, reason))?;

        let operand = if operator.is_unary() {
            let supplied = val.is_some_and(|v| !v.is_null()) || other.is_some();
            if supplied && self.limits.strict_unary_operands {
                return Err(Error::invalid_operator(name, op_name, "takes no argument"));
            }
            Operand::None
        } else if let Some(other) = other {
            self.parse_field_operand(name, op_name, operator, &path, owner, column, other)?
        } else {
            let val = val.ok_or_else(|| Error::invalid_operator(name, op_name, "missing 'val'"))?;
            parse_value(name, op_name, operator, column, val)?
        };

        Ok(Filter {
            path,
            column: Some(ColumnRef::from(column)),
            operator,
            operand,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_relational(
        &self,
        name: &str,
        op_name: &str,
        operator: Operator,
        path: FieldPath,
        val: Option<&Value>,
        other: Option<&Value>,
        model: &dyn ModelMetadata,
        depth: usize,
    ) -> Result<Filter> {
        if other.is_some() {
            return Err(Error::invalid_operator(name, op_name, "'field' cannot be used here"));
        }
        let (rel_name, inner) = match path.relation {
            Some(rel) => (rel, Some(path.field)),
            None => (path.field, None),
        };
        let relationship = model.relationship(&rel_name).ok_or_else(|| {
            Error::invalid_operator(
                name,
                op_name,
                format!("'{rel_name}' is not a relationship of '{}'", model.name()),
            )
        })?;
        match (operator, relationship.cardinality()) {
            (Operator::Has, Cardinality::Many) => {
                return Err(Error::invalid_operator(
                    name,
                    op_name,
                    "to-many relationship, use 'any'",
                ))
            }
            (Operator::Any, Cardinality::One) => {
                return Err(Error::invalid_operator(
                    name,
                    op_name,
                    "to-one relationship, use 'has'",
                ))
            }
            _ => {}
        }

        let target = self.registry.target(&relationship.target)?;
        let val = val.ok_or_else(|| Error::invalid_operator(name, op_name, "missing 'val'"))?;

        let nested = match inner {
            Some(field) => {
                self.check_depth(depth + 1)?;
                let column = target.column(&field).ok_or_else(|| {
                    Error::invalid_filter(name, format!("no field '{field}' on '{}'", target.name()))
                })?;
                if val.is_object() || val.is_array() {
                    return Err(Error::invalid_operator(name, op_name, "expected a scalar value").with_value(val));
                }
                let operand = parse_value(name, op_name, Operator::Eq, column, val)?;
                Expr::Filter(Filter {
                    path: FieldPath::local(field),
                    column: Some(ColumnRef::from(column)),
                    operator: Operator::Eq,
                    operand,
                })
            }
            None => {
                if !val.is_object() {
                    return Err(
                        Error::invalid_operator(name, op_name, "expected a nested filter object").with_value(val)
                    );
                }
                self.parse_node(val, target, depth + 1)?
            }
        };

        Ok(Filter {
            path: FieldPath::local(rel_name),
            column: None,
            operator,
            operand: Operand::Nested(Box::new(nested)),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_field_operand(
        &self,
        name: &str,
        op_name: &str,
        operator: Operator,
        path: &FieldPath,
        owner: &dyn ModelMetadata,
        column: &Column,
        other: &Value,
    ) -> Result<Operand> {
        if !operator.is_comparison() {
            return Err(Error::invalid_operator(
                name,
                op_name,
                "only comparison operators accept 'field'",
            ));
        }
        let raw = other
            .as_str()
            .ok_or_else(|| Error::invalid_operator(name, op_name, "'field' must be a string"))?;
        // A bare name refers to the same model as the left-hand side
        let other_path = match FieldPath::parse(raw) {
            Some(p) if p.relation.is_some() => p,
            _ => FieldPath {
                relation: path.relation.clone(),
                field: raw.to_string(),
            },
        };
        if other_path.relation != path.relation {
            return Err(Error::invalid_operator(
                name,
                op_name,
                format!("'{raw}' must name a column of '{}'", owner.name()),
            ));
        }
        let right = owner.column(&other_path.field).ok_or_else(|| {
            Error::invalid_operator(name, op_name, format!("no field '{raw}' on '{}'", owner.name()))
        })?;
        if operator.is_ordering() && right.field_type.is_ordered() != column.field_type.is_ordered() {
            return Err(Error::invalid_operator(name, op_name, "fields cannot be ordered together"));
        }
        Ok(Operand::Field(ColumnRef::from(right)))
    }

    /// Resolve a local or one-hop column, returning the model that owns it
    fn resolve_column<'m>(
        &'m self,
        path: &FieldPath,
        model: &'m dyn ModelMetadata,
        raw: &str,
    ) -> Result<(&'m dyn ModelMetadata, &'m Column)> {
        let owner = match &path.relation {
            None => model,
            Some(rel) => {
                let relationship = model.relationship(rel).ok_or_else(|| {
                    Error::invalid_filter(raw, format!("'{rel}' is not a relationship of '{}'", model.name()))
                })?;
                self.registry.target(&relationship.target)?
            }
        };
        if let Some(column) = owner.column(&path.field) {
            return Ok((owner, column));
        }
        if owner.relationship(&path.field).is_some() {
            return Err(Error::invalid_filter(
                raw,
                "names a relationship, filter it with 'has' or 'any'",
            ));
        }
        Err(Error::invalid_filter(
            raw,
            format!("no field '{}' on '{}'", path.field, owner.name()),
        ))
    }
}

fn parse_value(name: &str, op_name: &str, operator: Operator, column: &Column, val: &Value) -> Result<Operand> {
    let coerce = |v: &Value| {
        let field_type = if operator.is_pattern() {
            FieldType::Text
        } else {
            column.field_type
        };
        Scalar::coerce(field_type, v)
            .map_err(|reason| {
                Error::invalid_operator(name, op_name, format!("invalid value: {reason}")).with_value(v)
            })
    };

    if operator.is_membership() {
        let items = val
            .as_array()
            .ok_or_else(|| Error::invalid_operator(name, op_name, "value must be a list").with_value(val))?;
        return items
            .iter()
            .map(coerce)
            .collect::<Result<Vec<_>>>()
            .map(Operand::List);
    }

    if val.is_null() {
        let reason = if matches!(operator, Operator::Eq | Operator::Neq) {
            "comparison to null, use is_null or is_not_null"
        } else {
            "null cannot be compared"
        };
        return Err(Error::invalid_operator(name, op_name, reason).with_value(val));
    }

    coerce(val).map(Operand::Value)
}

fn shape_error(reason: impl Into<String>) -> Error {
    Error::InvalidFilter {
        field: None,
        operator: None,
        value: None,
        reason: reason.into(),
    }
}
