//! Restless Common Types and Utilities
//!
//! Shared configuration, error handling and response envelopes.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{ApiConfig, RestlessConfig, ServerConfig};
pub use error::{Error, FieldError, Result};
pub use types::ApiError;
