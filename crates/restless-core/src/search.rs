//! Search specification decoded from the `q` parameter

use restless_common::{Error, Result};
use serde_json::Value;

use crate::filter::JunctionOp;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    pub field: String,
    pub direction: Direction,
}

/// Client search request. Filters stay raw JSON until validated against a
/// model by [`crate::filter::parse`].
#[derive(Debug, Clone, Default)]
pub struct SearchSpec {
    pub filters: Vec<Value>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub group_by: Vec<String>,
    pub junction: JunctionOp,
    /// Exactly one result is expected
    pub single: bool,
}

impl SearchSpec {
    /// Decode the raw `q` parameter; absent or blank means "everything"
    pub fn from_query_param(raw: Option<&str>) -> Result<Self> {
        match decode_param("q", raw)? {
            Some(value) => Self::from_json(&value),
            None => Ok(Self::default()),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidQueryParam("search query must be a JSON object".into()))?;

        let mut spec = Self::default();

        if let Some(filters) = obj.get("filters").filter(|v| !v.is_null()) {
            spec.filters = filters
                .as_array()
                .cloned()
                .ok_or_else(|| Error::InvalidQueryParam("'filters' must be a list".into()))?;
        }

        if let Some(order_by) = obj.get("order_by").filter(|v| !v.is_null()) {
            let items = order_by
                .as_array()
                .ok_or_else(|| Error::InvalidQueryParam("'order_by' must be a list".into()))?;
            spec.order_by = items.iter().map(parse_order).collect::<Result<_>>()?;
        }

        spec.limit = non_negative(obj.get("limit"), "limit")?;
        spec.offset = non_negative(obj.get("offset"), "offset")?;

        if let Some(group_by) = obj.get("group_by").filter(|v| !v.is_null()) {
            spec.group_by = group_by
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| {
                    Error::InvalidQueryParam("'group_by' must be a list of field names".into())
                })?;
        }

        if let Some(junction) = obj.get("junction").filter(|v| !v.is_null()) {
            spec.junction = match junction.as_str() {
                Some("and") => JunctionOp::And,
                Some("or") => JunctionOp::Or,
                _ => {
                    return Err(Error::InvalidQueryParam(
                        "'junction' must be \"and\" or \"or\"".into(),
                    ))
                }
            };
        }
        if flag(obj.get("disjunction"), "disjunction")? {
            spec.junction = JunctionOp::Or;
        }
        spec.single = flag(obj.get("single"), "single")?;

        Ok(spec)
    }
}

/// Decode a JSON-valued query parameter
pub fn decode_param(name: &str, raw: Option<&str>) -> Result<Option<Value>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => serde_json::from_str(text).map(Some).map_err(|e| {
            Error::InvalidQueryParam(format!("unable to decode '{name}' as JSON: {e}"))
        }),
    }
}

fn parse_order(item: &Value) -> Result<OrderSpec> {
    let field = item
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidSort {
            field: String::new(),
            reason: "each order_by entry needs a 'field'".into(),
        })?;
    let direction = match item.get("direction").and_then(Value::as_str) {
        None | Some("asc") => Direction::Asc,
        Some("desc") => Direction::Desc,
        Some(other) => {
            return Err(Error::InvalidSort {
                field: field.to_string(),
                reason: format!("direction must be 'asc' or 'desc', got '{other}'"),
            })
        }
    };
    Ok(OrderSpec {
        field: field.to_string(),
        direction,
    })
}

fn non_negative(value: Option<&Value>, name: &str) -> Result<Option<usize>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                Error::InvalidQueryParam(format!("'{name}' must be a non-negative integer"))
            }),
    }
}

fn flag(value: Option<&Value>, name: &str) -> Result<bool> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(Error::InvalidQueryParam(format!("'{name}' must be a boolean"))),
    }
}
