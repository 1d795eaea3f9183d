//! Configuration types for restless

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestlessConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Resource API configuration
    pub api: ApiConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port for the REST API (default: 5000)
    pub port: u16,
    /// Number of actix workers
    pub workers: usize,
    /// CORS allowed origins
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            workers: 4,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Limits and policies applied by the translation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Prefix under which every collection is mounted
    pub url_prefix: String,
    /// Page size used when a search names no limit
    pub page_size: usize,
    /// Hard ceiling on any page, whatever the client asks for
    pub max_page_size: usize,
    /// Maximum nesting of junctions and relationship filters
    pub max_filter_depth: usize,
    /// Maximum number of conditions under a single junction
    pub max_filter_breadth: usize,
    /// Relationship hops serialized in full (default: 1)
    pub relation_depth: usize,
    /// Reject unknown fields in inbound payloads
    pub strict_deserialization: bool,
    /// Reject a value given to `is_null`/`is_not_null` instead of ignoring it
    pub strict_unary_operands: bool,
    /// Roll back a whole request when any relationship edit fails
    pub atomic_relationship_edits: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url_prefix: "/api".to_string(),
            page_size: 10,
            max_page_size: 100,
            max_filter_depth: 8,
            max_filter_breadth: 64,
            relation_depth: 1,
            strict_deserialization: true,
            strict_unary_operands: false,
            atomic_relationship_edits: true,
        }
    }
}
