use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::server::AppState;
use crate::server::identity::authenticate;

#[derive(Debug, Deserialize, Default)]
pub struct InvalidateQuery {
    /// 缓存键哈希的前缀；为空时清空全部响应缓存
    #[serde(default)]
    pub prefix: Option<String>,
}

pub async fn invalidate_cache(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InvalidateQuery>,
) -> Result<Json<Value>, GatewayError> {
    authenticate(app_state.api_keys.as_ref(), &headers).await?;
    let prefix = query.prefix.as_deref().filter(|p| !p.is_empty());
    let removed = app_state.cache.invalidate(prefix).await?;
    Ok(Json(json!({ "removed": removed, "prefix": prefix })))
}

pub async fn cache_stats(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    authenticate(app_state.api_keys.as_ref(), &headers).await?;
    let stats = app_state.cache.stats().await?;
    Ok(Json(serde_json::to_value(stats)?))
}
