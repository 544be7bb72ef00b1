pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::service::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Analyses
        .route("/api/v1/analyses", post(handlers::handle_create_analysis))
        .route("/api/v1/analyses/:id", get(handlers::handle_get_analysis))
        // Prompt administration
        .route("/api/v1/admin/prompts", get(handlers::handle_list_prompts))
        .route(
            "/api/v1/admin/prompts/reload",
            post(handlers::handle_reload_prompts),
        )
        .with_state(state)
}
