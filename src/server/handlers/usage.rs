use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::routing::PlanLimits;
use crate::server::AppState;
use crate::server::identity::authenticate;

const STATS_WINDOW_DAYS: i64 = 30;

/// 调用方自己的当前计数、套餐限额和近 30 天请求统计
pub async fn usage(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    let identity = authenticate(app_state.api_keys.as_ref(), &headers).await?;
    let limits = PlanLimits::for_plan(&identity.plan);
    let counts = app_state.limiter.usage(&identity.api_key_id).await?;

    let now = DateTime::from_timestamp_millis(app_state.clock.now_ms()).unwrap_or_else(Utc::now);
    let stats = app_state
        .logger
        .store()
        .stats(&identity.api_key_id, now - Duration::days(STATS_WINDOW_DAYS))
        .await?;

    Ok(Json(json!({
        "apiKeyId": identity.api_key_id,
        "plan": identity.plan,
        "limits": limits,
        "minute": {
            "used": counts.minute_count,
            "limit": limits.requests_per_minute,
        },
        "monthly": {
            "used": counts.monthly_count,
            "limit": limits.monthly_requests,
        },
        "last30Days": stats,
    })))
}
