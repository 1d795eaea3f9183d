//! Error types for restless
//!
//! Every failure raised by the translation engine carries enough structure
//! (field, operator, offending value) to be rendered as a 4xx response
//! without the transport layer re-deriving context.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failure attached to one field of a payload or filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Restless error types
#[derive(Error, Debug)]
pub enum Error {
    // Query Errors
    #[error("Invalid filter{}: {reason}{}", describe_filter(.field, .operator), describe_value(.value))]
    InvalidFilter {
        field: Option<String>,
        operator: Option<String>,
        /// Offending argument, rendered as JSON
        value: Option<String>,
        reason: String,
    },

    #[error("Query too complex: {0}")]
    QueryTooComplex(String),

    #[error("Invalid sort on '{field}': {reason}")]
    InvalidSort { field: String, reason: String },

    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    #[error("No such field '{field}' on model '{model}'")]
    UnknownField { model: String, field: String },

    #[error("Invalid query parameter: {0}")]
    InvalidQueryParam(String),

    // Lookup Errors
    #[error("No instance of '{model}' with id {id}")]
    NotFound { model: String, id: String },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("No result found")]
    NoResultFound,

    #[error("Multiple results found")]
    MultipleResultsFound,

    // Payload Errors
    #[error("Invalid value for '{}': {}", .0.field, .0.message)]
    Deserialization(FieldError),

    #[error("{} errors: {}", .0.len(), join_messages(.0))]
    MultipleFailures(Vec<Error>),

    // Hook Errors
    #[error("{message}")]
    ProcessingVeto { status: u16, message: String },

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    // Storage Errors
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // General Errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for restless operations
pub type Result<T> = std::result::Result<T, Error>;

fn describe_filter(field: &Option<String>, operator: &Option<String>) -> String {
    match (field, operator) {
        (Some(field), Some(op)) => format!(" on '{field}' with operator '{op}'"),
        (Some(field), None) => format!(" on '{field}'"),
        (None, Some(op)) => format!(" with operator '{op}'"),
        (None, None) => String::new(),
    }
}

fn describe_value(value: &Option<String>) -> String {
    value.as_ref().map(|v| format!(" (got {v})")).unwrap_or_default()
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Filter error naming the offending field
    pub fn invalid_filter(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            field: Some(field.into()),
            operator: None,
            value: None,
            reason: reason.into(),
        }
    }

    /// Filter error naming the offending field and operator
    pub fn invalid_operator(
        field: impl Into<String>,
        operator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidFilter {
            field: Some(field.into()),
            operator: Some(operator.into()),
            value: None,
            reason: reason.into(),
        }
    }

    /// Attach the offending argument to a filter error; other errors pass through
    #[must_use]
    pub fn with_value(mut self, offending: &serde_json::Value) -> Self {
        if let Self::InvalidFilter { value, .. } = &mut self {
            *value = Some(offending.to_string());
        }
        self
    }

    /// Payload error for a single field
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deserialization(FieldError::new(field, message))
    }

    /// Abort a request from a pre- or post-processor with the given status
    pub fn veto(status: u16, message: impl Into<String>) -> Self {
        Self::ProcessingVeto {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(model: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            model: model.into(),
            id: id.to_string(),
        }
    }

    /// Collapse collected failures: none yields `None`, one is returned
    /// as-is, several become a `MultipleFailures` aggregate.
    pub fn from_failures(mut failures: Vec<Error>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(Self::MultipleFailures(failures)),
        }
    }

    /// True for every not-found flavour, looking through aggregates
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::MultipleFailures(errors) => errors.iter().all(Error::is_not_found),
            _ => false,
        }
    }

    /// Per-field detail for rendering validation failures
    pub fn field_errors(&self) -> Vec<FieldError> {
        match self {
            Self::Deserialization(err) => vec![err.clone()],
            Self::InvalidFilter { field, value, reason, .. } => vec![FieldError::new(
                field.clone().unwrap_or_default(),
                format!("{reason}{}", describe_value(value)),
            )],
            Self::InvalidSort { field, reason } => vec![FieldError::new(field, reason)],
            Self::UnknownField { field, .. } => vec![FieldError::new(field, self.to_string())],
            Self::MultipleFailures(errors) => errors.iter().flat_map(Error::field_errors).collect(),
            _ => vec![],
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidFilter { .. }
            | Self::QueryTooComplex(_)
            | Self::InvalidSort { .. }
            | Self::UnsupportedFunction(_)
            | Self::UnknownField { .. }
            | Self::InvalidQueryParam(_)
            | Self::Deserialization(_) => 400,

            // 404 Not Found
            Self::NotFound { .. }
            | Self::CollectionNotFound(_)
            | Self::NoResultFound
            | Self::MultipleResultsFound => 404,

            // 405 Method Not Allowed
            Self::MethodNotAllowed(_) => 405,

            // 409 Conflict
            Self::Conflict(_) => 409,

            Self::ProcessingVeto { status, .. } => *status,

            // Uniform status when every failure agrees, 400 otherwise
            Self::MultipleFailures(errors) => {
                let mut codes = errors.iter().map(Error::status_code);
                match codes.next() {
                    Some(first) if codes.all(|c| c == first) => first,
                    _ => 400,
                }
            }

            // 500 Internal Server Error
            Self::Storage(_) | Self::Config(_) | Self::Io(_) | Self::Json(_) => 500,
        }
    }

    /// Error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidFilter { .. } => "invalid_filter",
            Self::QueryTooComplex(_) => "query_too_complex",
            Self::InvalidSort { .. } => "invalid_sort",
            Self::UnsupportedFunction(_) => "unsupported_function",
            Self::UnknownField { .. } => "unknown_field",
            Self::InvalidQueryParam(_) => "invalid_param",
            Self::NotFound { .. } => "not_found",
            Self::CollectionNotFound(_) => "collection_not_found",
            Self::NoResultFound => "no_result_found",
            Self::MultipleResultsFound => "multiple_results_found",
            Self::Deserialization(_) => "validation_error",
            Self::MultipleFailures(_) => "multiple_failures",
            Self::ProcessingVeto { .. } => "processing_veto",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::Conflict(_) => "conflict",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::QueryTooComplex("depth".into()).status_code(), 400);
        assert_eq!(Error::not_found("person", 3).status_code(), 404);
        assert_eq!(Error::MethodNotAllowed("POST".into()).status_code(), 405);
        assert_eq!(Error::veto(401, "nope").status_code(), 401);
        assert_eq!(Error::Storage("disk".into()).status_code(), 500);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::UnsupportedFunction("bogus".into()).error_code(),
            "unsupported_function"
        );
        assert_eq!(Error::invalid_field("age", "bad").error_code(), "validation_error");
    }

    #[test]
    fn test_from_failures() {
        assert!(Error::from_failures(vec![]).is_none());

        let single = Error::from_failures(vec![Error::not_found("computer", 2)]).unwrap();
        assert!(matches!(single, Error::NotFound { .. }));

        let many = Error::from_failures(vec![
            Error::invalid_field("name", "required"),
            Error::invalid_field("age", "expected integer"),
        ])
        .unwrap();
        let Error::MultipleFailures(errors) = &many else {
            panic!("expected aggregate");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(many.field_errors().len(), 2);
        assert_eq!(many.status_code(), 400);
    }

    #[test]
    fn test_aggregate_status_follows_members() {
        let err = Error::MultipleFailures(vec![
            Error::not_found("computer", 1),
            Error::not_found("computer", 2),
        ]);
        assert_eq!(err.status_code(), 404);
        assert!(err.is_not_found());

        let mixed = Error::MultipleFailures(vec![
            Error::not_found("computer", 1),
            Error::invalid_field("name", "required"),
        ]);
        assert_eq!(mixed.status_code(), 400);
        assert!(!mixed.is_not_found());
    }

    #[test]
    fn test_invalid_filter_message_names_field_and_operator() {
        let err = Error::invalid_operator("age", "bogus", "unknown operator");
        let message = err.to_string();
        assert!(message.contains("'age'"));
        assert!(message.contains("'bogus'"));
    }

    #[test]
    fn test_invalid_filter_carries_value() {
        let err = Error::invalid_operator("age", "lt", "invalid value: not a number").with_value(&serde_json::json!("old"));
        assert!(matches!(err, Error::InvalidFilter { value: Some(ref v), .. } if v == "\"old\""));
        assert!(err.to_string().ends_with("not a number (got \"old\")"));
        assert_eq!(err.field_errors()[0].message, "invalid value: not a number (got \"old\")");

        let plain = Error::invalid_filter("age", "missing 'op'");
        assert_eq!(plain.to_string(), "Invalid filter on 'age': missing 'op'");
        // only filter errors take a value
        let other = Error::NoResultFound.with_value(&serde_json::json!(1));
        assert!(matches!(other, Error::NoResultFound));
    }
}
