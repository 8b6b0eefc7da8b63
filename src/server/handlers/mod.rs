use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;

use crate::server::AppState;

mod cache;
mod chat;
mod health;
mod models;
mod usage;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/{model}/equivalents", get(models::model_equivalents))
        .route("/v1/cache", delete(cache::invalidate_cache))
        .route("/v1/cache/stats", get(cache::cache_stats))
        .route("/v1/usage", get(usage::usage))
}
