//! HTTP surface over [`FundService`](crate::fund::FundService).

pub mod dto;
pub mod error;
pub mod extract;
pub mod requests;
pub mod routes;

use axum::{middleware, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::fund::FundService;

pub use error::ApiError;
pub use routes::{create_router, AppState};

/// The full application: routes plus logging, tracing and CORS layers.
pub fn app(funds: FundService) -> Router {
    create_router(funds)
        .layer(middleware::from_fn(crate::middleware::request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
