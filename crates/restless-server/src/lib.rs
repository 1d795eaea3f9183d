//! Restless HTTP server
//!
//! Exposes a [`restless_core::ResourceApi`] over actix-web: one set of
//! routes per registered collection, plus `/health`.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod handlers;
pub mod server;

pub use handlers::{configure, AppState};
pub use server::RestServer;
