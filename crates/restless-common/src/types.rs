//! Response envelope types

use serde::{Deserialize, Serialize};

use crate::error::{Error, FieldError};

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            errors: vec![],
        }
    }

    pub fn with_errors(mut self, errors: Vec<FieldError>) -> Self {
        self.errors = errors;
        self
    }
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        Self::new(err.error_code(), err.to_string()).with_errors(err.field_errors())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_from_aggregate() {
        let err = Error::MultipleFailures(vec![
            Error::invalid_field("name", "required"),
            Error::invalid_field("birthday", "expected an ISO-8601 date"),
        ]);
        let body = serde_json::to_value(ApiError::from(&err)).unwrap();
        assert_eq!(body["code"], "multiple_failures");
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
        assert_eq!(body["errors"][1]["field"], "birthday");
    }

    #[test]
    fn test_api_error_omits_empty_errors() {
        let body = serde_json::to_value(ApiError::new("not_found", "missing")).unwrap();
        assert!(body.get("errors").is_none());
        assert_eq!(body["message"], "missing");
    }
}
