use std::fmt;
use std::time::Duration;

use super::ProviderId;

/// 路由层据此决定：是否重试、是否计入熔断、是否跳到下一个候选
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 401/403：不重试、不计入熔断，直接跳过该候选
    Auth,
    /// 其余 4xx（408/429 除外）：不重试，但计入熔断
    Client,
    /// 408/429/5xx/超时/网络/解码：按退避重试并计入熔断
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Status,
    Timeout,
    Network,
    Decode,
    Cancelled,
    Upstream,
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: ProviderId,
    pub status: Option<u16>,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn status(provider: ProviderId, status: u16, message: impl Into<String>) -> Self {
        Self {
            provider,
            status: Some(status),
            message: message.into(),
            kind: ProviderErrorKind::Status,
        }
    }

    pub fn timeout(provider: ProviderId, after: Duration) -> Self {
        Self {
            provider,
            status: None,
            message: format!("request timed out after {}ms", after.as_millis()),
            kind: ProviderErrorKind::Timeout,
        }
    }

    pub fn cancelled(provider: ProviderId) -> Self {
        Self {
            provider,
            status: None,
            message: "request cancelled".to_string(),
            kind: ProviderErrorKind::Cancelled,
        }
    }

    pub fn decode(provider: ProviderId, message: impl Into<String>) -> Self {
        Self {
            provider,
            status: None,
            message: message.into(),
            kind: ProviderErrorKind::Decode,
        }
    }

    /// 流内的错误事件（例如 Anthropic 的 `overloaded_error`）
    pub fn upstream(provider: ProviderId, message: impl Into<String>) -> Self {
        Self {
            provider,
            status: None,
            message: message.into(),
            kind: ProviderErrorKind::Upstream,
        }
    }

    pub fn from_reqwest(provider: ProviderId, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::status(provider, status.as_u16(), err.to_string());
        }
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_decode() {
            ProviderErrorKind::Decode
        } else {
            ProviderErrorKind::Network
        };
        Self {
            provider,
            status: None,
            message: err.to_string(),
            kind,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self.status {
            Some(401 | 403) => FailureClass::Auth,
            Some(408 | 429) => FailureClass::Transient,
            Some(s) if (400..500).contains(&s) => FailureClass::Client,
            _ => FailureClass::Transient,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ProviderErrorKind::Cancelled
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} API error: {} - {}",
                self.provider.display_name(),
                status,
                self.message
            ),
            None => write!(f, "{} API error: {}", self.provider.display_name(), self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// 读取非 2xx 响应体里的错误描述：`{"error":{"message"}}`、`{"message"}` 或状态码原因短语
pub(crate) async fn error_from_response(
    provider: ProviderId,
    response: reqwest::Response,
) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ProviderError::status(provider, status.as_u16(), describe_error_body(status, &body))
}

pub(crate) fn describe_error_body(status: reqwest::StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error").filter(|e| e.is_string()))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    });
    message.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_uses_status_code_only() {
        let p = ProviderId::OpenAI;
        assert_eq!(ProviderError::status(p, 401, "server error").class(), FailureClass::Auth);
        assert_eq!(ProviderError::status(p, 403, "x").class(), FailureClass::Auth);
        assert_eq!(ProviderError::status(p, 400, "500 in text").class(), FailureClass::Client);
        assert_eq!(ProviderError::status(p, 404, "x").class(), FailureClass::Client);
        assert_eq!(ProviderError::status(p, 408, "x").class(), FailureClass::Transient);
        assert_eq!(ProviderError::status(p, 429, "x").class(), FailureClass::Transient);
        assert_eq!(ProviderError::status(p, 503, "401").class(), FailureClass::Transient);
        assert_eq!(
            ProviderError::timeout(p, Duration::from_millis(10)).class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn display_includes_provider_and_status() {
        let err = ProviderError::status(ProviderId::Anthropic, 529, "Overloaded");
        assert_eq!(err.to_string(), "Anthropic API error: 529 - Overloaded");
    }

    #[test]
    fn error_body_message_extraction() {
        let s = reqwest::StatusCode::BAD_REQUEST;
        assert_eq!(
            describe_error_body(s, r#"{"error":{"message":"bad model"}}"#),
            "bad model"
        );
        assert_eq!(describe_error_body(s, r#"{"message":"cohere says no"}"#), "cohere says no");
        assert_eq!(describe_error_body(s, "<html>"), "Bad Request");
    }
}
