use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/run", post(handlers::run))
        .route("/images/build", post(handlers::build_image))
        .route("/images/remove", post(handlers::remove_image))
        .route("/images/*image_name", get(handlers::image_status))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::export_metrics))
}
