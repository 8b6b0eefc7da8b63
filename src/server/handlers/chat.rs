use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::events::{EventKind, GatewayEvent};
use crate::providers::{ChatCompletionRequest, ChunkSink, StreamChunk};
use crate::routing::{RateLimitResult, RequestMetadata, RouteContext, RouteFailure};
use crate::server::AppState;
use crate::server::identity::{ApiKeyIdentity, authenticate};
use crate::server::util::{REQUEST_ID_HEADER, client_ip, header_str, new_request_id, set_header};

/// Chat Completions 入口：
/// - 鉴权 -> 限流（无论结果都带上限流头）-> 校验请求体
/// - 非流式先查缓存，未命中走路由引擎，成功后回写缓存
/// - 流式由后台任务驱动路由引擎，经 SSE 下发，客户端断开即取消
pub async fn chat_completions(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let mut out = HeaderMap::new();
    set_header(&mut out, REQUEST_ID_HEADER, &request_id);

    let response = match handle(app_state, &headers, &body, &request_id, &mut out).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    with_headers(response, out)
}

async fn handle(
    app_state: Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
    request_id: &str,
    out: &mut HeaderMap,
) -> Result<Response> {
    let start_time = app_state.clock.now_ms();
    let identity = authenticate(app_state.api_keys.as_ref(), headers).await?;

    match app_state.limiter.check(&identity.api_key_id, &identity.plan).await {
        Ok(limit) => {
            rate_limit_headers(out, &limit);
            if !limit.allowed {
                return Err(GatewayError::RateLimited {
                    retry_after: limit.retry_after.unwrap_or(60),
                    monthly: limit.monthly_exhausted(),
                });
            }
            notify_quota(&app_state, &identity, &limit).await;
        }
        // 存储不可用时放行，不因限流组件故障拒绝请求
        Err(e) => tracing::warn!(request_id, "Rate limit check failed: {}", e),
    }

    let request = parse_request(body)?;
    let ctx = RouteContext {
        request_id: request_id.to_string(),
        api_key_id: identity.api_key_id.clone(),
        organization_id: identity.organization_id.clone(),
        provider_key_override: header_str(headers, "x-provider-key")
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string),
        ip_address: client_ip(headers),
        user_agent: header_str(headers, "user-agent").map(str::to_string),
        cancel: CancellationToken::new(),
    };

    if request.is_stream() {
        return Ok(stream_chat(app_state, request, ctx));
    }

    if let Some(cached) = app_state.cache.get(&request).await {
        let mut metadata = RequestMetadata::start(&ctx, &request.model, start_time);
        metadata.mark_cached();
        metadata.finish(app_state.clock.now_ms());

        set_header(out, "x-cached", "true");
        set_header(out, "x-provider", &metadata.provider);
        set_header(out, "x-model", &metadata.model);
        set_header(out, "x-latency-ms", metadata.latency_ms.unwrap_or(0));
        set_header(out, "x-fallback", "false");
        app_state.logger.append(metadata, Some(request), None);
        return Ok(Json(cached).into_response());
    }

    match app_state.engine.route(&request, &ctx).await {
        Ok((response, metadata)) => {
            set_header(out, "x-provider", &metadata.provider);
            set_header(out, "x-model", &metadata.model);
            set_header(out, "x-latency-ms", metadata.latency_ms.unwrap_or(0));
            set_header(out, "x-cached", "false");
            set_header(out, "x-fallback", metadata.fallback_used);
            if let Some(p) = &metadata.fallback_provider {
                set_header(out, "x-fallback-provider", p);
            }

            app_state.cache.set(&request, &response).await;
            app_state
                .logger
                .append(metadata, Some(request), Some(response.clone()));
            Ok(Json(response).into_response())
        }
        Err(RouteFailure { error, metadata }) => {
            app_state.logger.append(metadata, Some(request), None);
            Err(error)
        }
    }
}

fn parse_request(body: &[u8]) -> Result<ChatCompletionRequest> {
    let request: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|e| GatewayError::Validation(format!("invalid request body: {e}")))?;
    if request.model.trim().is_empty() || request.messages.is_empty() {
        return Err(GatewayError::Validation("model and messages are required".into()));
    }
    Ok(request)
}

fn rate_limit_headers(out: &mut HeaderMap, limit: &RateLimitResult) {
    set_header(out, "x-ratelimit-limit", limit.minute_limit);
    set_header(out, "x-ratelimit-remaining", limit.minute_remaining);
    set_header(out, "x-ratelimit-reset", limit.minute_reset);
    set_header(out, "x-monthly-limit", limit.monthly_limit);
    set_header(out, "x-monthly-remaining", limit.monthly_remaining);
}

fn with_headers(mut response: Response, headers: HeaderMap) -> Response {
    response.headers_mut().extend(headers);
    response
}

/// 月度用量越过 80% / 100% 时各通知一次
async fn notify_quota(app_state: &AppState, identity: &ApiKeyIdentity, limit: &RateLimitResult) {
    let alerts = match app_state
        .limiter
        .quota_alerts(&identity.api_key_id, &identity.plan)
        .await
    {
        Ok(alerts) => alerts,
        Err(e) => {
            tracing::warn!(api_key_id = %identity.api_key_id, "Quota alert check failed: {}", e);
            return;
        }
    };

    let (kind, level) = if alerts.alert100 {
        (EventKind::QuotaExceeded, "exceeded")
    } else if alerts.alert80 {
        (EventKind::QuotaWarning, "warning")
    } else {
        return;
    };

    match app_state
        .limiter
        .claim_quota_alert(&identity.api_key_id, level)
        .await
    {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            tracing::warn!(api_key_id = %identity.api_key_id, "Quota alert claim failed: {}", e);
            return;
        }
    }

    let used = limit.monthly_limit.saturating_sub(limit.monthly_remaining);
    let data = match kind {
        EventKind::QuotaExceeded => json!({
            "apiKeyId": identity.api_key_id,
            "usage": used,
            "limit": limit.monthly_limit,
            "message": "Monthly API quota has been exceeded",
        }),
        _ => {
            let percentage = if limit.monthly_limit > 0 {
                (used as f64 / limit.monthly_limit as f64 * 100.0).round()
            } else {
                100.0
            };
            json!({
                "apiKeyId": identity.api_key_id,
                "usage": used,
                "limit": limit.monthly_limit,
                "percentage": percentage,
                "message": format!("API usage has reached {percentage}% of monthly quota"),
            })
        }
    };
    app_state
        .events
        .emit(GatewayEvent::new(kind, Some(identity.organization_id.as_str()), data));
}

/// 把 chunk 编成 SSE 事件送进响应流；接收端断开后直接丢弃
struct SseSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChunkSink for SseSink {
    fn push(&mut self, chunk: StreamChunk) {
        match serde_json::to_string(&chunk) {
            Ok(data) => {
                let _ = self.tx.send(Event::default().data(data));
            }
            Err(e) => tracing::warn!("Failed to encode stream chunk: {}", e),
        }
    }
}

fn stream_chat(app_state: Arc<AppState>, request: ChatCompletionRequest, ctx: RouteContext) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    // 响应流被丢弃（客户端断开）时取消整条候选链
    let disconnect_guard = ctx.cancel.clone().drop_guard();

    tokio::spawn(async move {
        let mut sink = SseSink { tx: tx.clone() };
        let result = app_state.engine.route_stream(&request, &ctx, &mut sink).await;
        match result {
            Ok((_usage, metadata)) => {
                let _ = tx.send(Event::default().data("[DONE]"));
                app_state.logger.append(metadata, Some(request), None);
            }
            Err(RouteFailure { error, metadata }) => {
                if !ctx.cancel.is_cancelled() {
                    let payload = json!({ "error": error.to_string() });
                    let _ = tx.send(Event::default().data(payload.to_string()));
                }
                app_state.logger.append(metadata, Some(request), None);
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _ = &disconnect_guard;
        Ok::<_, Infallible>(event)
    });
    Sse::new(stream).into_response()
}
