//! HTTP API application wiring (Axum router + state wiring).
//!
//! Layout:
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and JSON view helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

use briefly_infra::store::Store;

pub mod dto;
pub mod errors;
pub mod routes;

/// Shared state injected into every handler.
pub struct AppState {
    pub store: Store,
}

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(store: Store) -> Router {
    let state = Arc::new(AppState { store });

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(state))
}
