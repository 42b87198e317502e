use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::handler::{self, AppState};

/// Build the axum router with all MBC endpoints.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/info", get(handler::info_handler))
        .route(
            "/v1/commands",
            post(handler::publish_handler).patch(handler::partial_update_handler),
        )
        .route("/v1/items/:pk", get(handler::list_items_handler))
        .route("/v1/items/:pk/:sk", get(handler::get_item_handler))
        .route("/v1/history/:pk/:sk", get(handler::list_versions_handler))
        .route("/v1/history/:pk/:sk/:version", get(handler::get_version_handler))
        .route("/v1/imports", post(handler::import_single_handler))
        .route("/v1/imports/csv", post(handler::import_csv_handler))
        .route("/v1/imports/zip", post(handler::import_zip_handler))
        .route("/v1/jobs/:id", get(handler::get_job_handler))
        .route("/v1/jobs/:id/children", get(handler::job_children_handler))
        .route("/v1/jobs/:id/status", put(handler::update_job_status_handler))
        .route("/v1/exports/:pk", get(handler::export_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http());

    if config.cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
