use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;

use crate::server::AppState;

/// 存储和日志库都可用时为 `ok`，否则 503 `degraded`
pub async fn health(State(app_state): State<Arc<AppState>>) -> Response {
    let store_ok = match app_state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Store health check failed: {}", e);
            false
        }
    };
    let db_ok = match app_state.logger.store().recent(1).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Log store health check failed: {}", e);
            false
        }
    };

    let circuits: BTreeMap<&str, _> = match app_state.breaker.all_states().await {
        Ok(states) => states.into_iter().map(|(p, s)| (p.as_str(), s)).collect(),
        Err(_) => BTreeMap::new(),
    };
    let cache = app_state.cache.stats().await.ok();

    let healthy = store_ok && db_ok;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let label = |ok: bool| if ok { "ok" } else { "error" };
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "store": label(store_ok),
        "db": label(db_ok),
        "circuits": circuits,
        "cache": cache,
        "timestamp": Utc::now().to_rfc3339(),
    });
    (status, Json(body)).into_response()
}
