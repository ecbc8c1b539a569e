pub mod handlers;
pub mod types;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

pub use handlers::{AppState, SharedState};

/// Build the HTTP router. The body limit applies to every route.
pub fn router(state: SharedState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/swap", post(handlers::swap))
        .route("/result/{filename}", get(handlers::result))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
