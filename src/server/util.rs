use axum::http::{HeaderMap, HeaderName, HeaderValue};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// HTTP helpers
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn api_key_header(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-api-key")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// 反向代理后取第一个 `X-Forwarded-For`，否则 `X-Real-Ip`
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `req_` + 32 位 hex
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// 值不是合法 header 时静默跳过
pub fn set_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), v);
    }
}
