//! HTTP server

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, App, HttpServer};
use tracing::{info, warn};

use restless_common::{Result, ServerConfig};
use restless_core::ResourceApi;

use crate::handlers;

/// Serves every registered collection over HTTP
pub struct RestServer {
    config: ServerConfig,
    api: Arc<ResourceApi>,
}

impl RestServer {
    pub fn new(config: &ServerConfig, api: Arc<ResourceApi>) -> Self {
        Self {
            config: config.clone(),
            api,
        }
    }

    /// Build CORS middleware from the configured origins
    fn build_cors(origins: &[String]) -> Cors {
        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            return Cors::permissive();
        }

        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST", "PATCH", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                actix_web::http::header::ACCEPT,
                actix_web::http::header::CONTENT_TYPE,
            ])
            .max_age(3600);

        for origin in origins {
            cors = cors.allowed_origin(origin);
        }

        cors
    }

    /// Run until the server is stopped
    pub async fn run(&self) -> Result<()> {
        let api = self.api.clone();
        let cors_origins = self.config.cors_origins.clone();
        let host = self.config.host.clone();
        let port = self.config.port;

        if cors_origins.is_empty() || cors_origins.iter().any(|o| o == "*") {
            warn!("CORS is configured with wildcard origin");
        }
        info!(
            "Starting REST API server on {}:{} under '{}'",
            host,
            port,
            api.config().url_prefix
        );
        for collection in api.registry().collections() {
            info!("  /{}", collection);
        }

        HttpServer::new(move || {
            App::new()
                .configure(handlers::configure(api.clone()))
                .wrap(Self::build_cors(&cors_origins))
                .wrap(middleware::Compress::default())
                .wrap(middleware::Logger::default())
        })
        .workers(self.config.workers.max(1))
        .bind((host.as_str(), port))?
        .run()
        .await?;

        info!("REST API server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restless_common::ApiConfig;
    use restless_core::{sample, InMemoryStore};

    #[test]
    fn test_rest_server_creation() {
        let registry = sample::registry().unwrap();
        let store = Arc::new(InMemoryStore::new(registry.clone()));
        let api = Arc::new(ResourceApi::new(registry, store, ApiConfig::default()));
        let server = RestServer::new(&ServerConfig::default(), api);
        assert_eq!(server.config.port, 5000);
        assert_eq!(server.api.registry().len(), 3);
    }
}
