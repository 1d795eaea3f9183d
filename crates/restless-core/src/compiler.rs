//! Query compiler
//!
//! Lowers a validated [`Expr`] plus the ordering and paging parts of a
//! [`SearchSpec`] into a [`Query`] the data-access layer executes. Values
//! stay typed [`Scalar`] parameters all the way down.

use std::cmp::Ordering;

use restless_common::{ApiConfig, Error, Result};
use tracing::debug;

use crate::filter::{Expr, Filter, Junction, JunctionOp, Operand, Operator};
use crate::model::{Cardinality, ColumnRef, ModelMetadata};
use crate::registry::ModelRegistry;
use crate::search::{Direction, SearchSpec};
use crate::value::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn from_operator(op: Operator) -> Option<Self> {
        match op {
            Operator::Eq => Some(Self::Eq),
            Operator::Neq => Some(Self::Neq),
            Operator::Gt => Some(Self::Gt),
            Operator::Gte => Some(Self::Gte),
            Operator::Lt => Some(Self::Lt),
            Operator::Lte => Some(Self::Lte),
            _ => None,
        }
    }

    pub fn matches(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Neq => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Gte => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Lte => ordering != Ordering::Greater,
        }
    }
}

/// Parameterized predicate over the rows of one model
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Always,
    Compare {
        column: ColumnRef,
        op: Comparison,
        param: Scalar,
    },
    CompareColumns {
        left: ColumnRef,
        op: Comparison,
        right: ColumnRef,
    },
    /// SQL `LIKE` pattern with `%` and `_` wildcards
    Like {
        column: ColumnRef,
        pattern: String,
        case_insensitive: bool,
        negated: bool,
    },
    InList {
        column: ColumnRef,
        params: Vec<Scalar>,
        negated: bool,
    },
    IsNull {
        column: ColumnRef,
        negated: bool,
    },
    /// Some row reached through `relation` satisfies the inner predicate,
    /// which is expressed over the related model
    Related {
        relation: String,
        predicate: Box<Predicate>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

/// Sort key, optionally reached through a to-one relationship
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub relation: Option<String>,
    pub column: ColumnRef,
    pub direction: Direction,
}

/// Paging limits in force for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: usize,
    pub max_page_size: usize,
}

impl From<&ApiConfig> for PageLimits {
    fn from(config: &ApiConfig) -> Self {
        Self {
            page_size: config.page_size,
            max_page_size: config.max_page_size,
        }
    }
}

impl Default for PageLimits {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

/// Executable query over one model
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub model: String,
    pub predicate: Predicate,
    /// Relationships the predicate or ordering traverses
    pub joins: Vec<String>,
    pub order_by: Vec<OrderKey>,
    pub group_by: Vec<ColumnRef>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    /// Every row of a model, unpaginated
    pub fn all(model: &dyn ModelMetadata) -> Self {
        Self {
            model: model.name().to_string(),
            predicate: Predicate::Always,
            joins: vec![],
            order_by: vec![],
            group_by: vec![],
            limit: None,
            offset: 0,
        }
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Same rows without limit or offset
    #[must_use]
    pub fn unpaginated(mut self) -> Self {
        self.limit = None;
        self.offset = 0;
        self
    }

    /// One-based page number implied by limit and offset
    pub fn page(&self) -> usize {
        match self.limit {
            Some(limit) if limit > 0 => self.offset / limit + 1,
            _ => 1,
        }
    }
}

/// Compile a validated filter tree and the rest of a search into a query
pub fn compile(
    ast: &Expr,
    spec: &SearchSpec,
    model: &dyn ModelMetadata,
    registry: &ModelRegistry,
    limits: PageLimits,
) -> Result<Query> {
    let mut joins = vec![];
    let predicate = lower(ast, &mut joins);

    let order_by = spec
        .order_by
        .iter()
        .map(|order| {
            let key = resolve_order(&order.field, order.direction, model, registry)?;
            if let Some(rel) = &key.relation {
                push_join(&mut joins, rel);
            }
            Ok(key)
        })
        .collect::<Result<Vec<_>>>()?;

    let group_by = spec
        .group_by
        .iter()
        .map(|field| {
            model.column(field).map(ColumnRef::from).ok_or_else(|| Error::UnknownField {
                model: model.name().to_string(),
                field: field.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let limit = spec.limit.unwrap_or(limits.page_size).min(limits.max_page_size);

    let query = Query {
        model: model.name().to_string(),
        predicate,
        joins,
        order_by,
        group_by,
        limit: Some(limit),
        offset: spec.offset.unwrap_or(0),
    };
    debug!(model = %query.model, predicate = ?query.predicate, limit, offset = query.offset, "Compiled query");
    Ok(query)
}

fn lower(expr: &Expr, joins: &mut Vec<String>) -> Predicate {
    match expr {
        Expr::Junction(Junction { op, conditions }) => {
            let children: Vec<Predicate> = conditions.iter().map(|c| lower(c, joins)).collect();
            match op {
                JunctionOp::And => Predicate::And(children),
                JunctionOp::Or => Predicate::Or(children),
                JunctionOp::Not => match <[Predicate; 1]>::try_from(children) {
                    Ok([only]) => Predicate::Not(Box::new(only)),
                    Err(children) => Predicate::Not(Box::new(Predicate::And(children))),
                },
            }
        }
        Expr::Filter(filter) => match &filter.path.relation {
            Some(rel) => {
                push_join(joins, rel);
                Predicate::Related {
                    relation: rel.clone(),
                    predicate: Box::new(lower_leaf(filter, joins)),
                }
            }
            None => lower_leaf(filter, joins),
        },
    }
}

fn lower_leaf(filter: &Filter, joins: &mut Vec<String>) -> Predicate {
    if let Operand::Nested(inner) = &filter.operand {
        push_join(joins, &filter.path.field);
        // joins inside the related model are resolved by the store
        let mut inner_joins = vec![];
        return Predicate::Related {
            relation: filter.path.field.clone(),
            predicate: Box::new(lower(inner, &mut inner_joins)),
        };
    }

    let Some(column) = filter.column.clone() else {
        return Predicate::Always;
    };

    match (&filter.operand, filter.operator) {
        (_, Operator::IsNull) => Predicate::IsNull {
            column,
            negated: false,
        },
        (_, Operator::IsNotNull) => Predicate::IsNull {
            column,
            negated: true,
        },
        (Operand::Field(right), op) => Predicate::CompareColumns {
            left: column,
            op: Comparison::from_operator(op).unwrap_or(Comparison::Eq),
            right: right.clone(),
        },
        (Operand::List(params), op) => Predicate::InList {
            column,
            params: params.clone(),
            negated: op == Operator::NotIn,
        },
        (Operand::Value(param), op) if op.is_pattern() => Predicate::Like {
            column,
            pattern: param.as_text().unwrap_or_default().to_string(),
            case_insensitive: op == Operator::Ilike,
            negated: op == Operator::NotLike,
        },
        (Operand::Value(param), op) => Predicate::Compare {
            column,
            op: Comparison::from_operator(op).unwrap_or(Comparison::Eq),
            param: param.clone(),
        },
        (Operand::None | Operand::Nested(_), _) => Predicate::Always,
    }
}

fn push_join(joins: &mut Vec<String>, relation: &str) {
    if !joins.iter().any(|j| j == relation) {
        joins.push(relation.to_string());
    }
}

fn resolve_order(
    field: &str,
    direction: Direction,
    model: &dyn ModelMetadata,
    registry: &ModelRegistry,
) -> Result<OrderKey> {
    let sort_error = |reason: String| Error::InvalidSort {
        field: field.to_string(),
        reason,
    };

    if let Some(column) = model.column(field) {
        return Ok(OrderKey {
            relation: None,
            column: ColumnRef::from(column),
            direction,
        });
    }

    let (rel_name, target_field) = field
        .split_once('.')
        .or_else(|| field.split_once("__"))
        .ok_or_else(|| sort_error(format!("no field '{field}' on '{}'", model.name())))?;
    let relationship = model
        .relationship(rel_name)
        .ok_or_else(|| sort_error(format!("'{rel_name}' is not a relationship of '{}'", model.name())))?;
    if relationship.cardinality() == Cardinality::Many {
        return Err(sort_error("cannot sort by a to-many relationship".into()));
    }
    let target = registry.target(&relationship.target)?;
    let column = target
        .column(target_field)
        .ok_or_else(|| sort_error(format!("no field '{target_field}' on '{}'", target.name())))?;
    Ok(OrderKey {
        relation: Some(rel_name.to_string()),
        column: ColumnRef::from(column),
        direction,
    })
}
