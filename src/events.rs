use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    /// 月度配额使用到 80%
    #[serde(rename = "quota.warning")]
    QuotaWarning,
    #[serde(rename = "quota.exceeded")]
    QuotaExceeded,
    /// 候选链全部失败
    #[serde(rename = "request.error")]
    RequestError,
    #[serde(rename = "circuit.open")]
    CircuitOpen,
    #[serde(rename = "circuit.closed")]
    CircuitClosed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::QuotaWarning => "quota.warning",
            EventKind::QuotaExceeded => "quota.exceeded",
            EventKind::RequestError => "request.error",
            EventKind::CircuitOpen => "circuit.open",
            EventKind::CircuitClosed => "circuit.closed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event: EventKind,
    /// 熔断类事件不属于任何组织
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl GatewayEvent {
    pub fn new(event: EventKind, organization_id: Option<&str>, data: Value) -> Self {
        Self {
            event,
            organization_id: organization_id.map(str::to_string),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// 事件投递（例如 webhook）的边界；`emit` 必须立即返回，不能阻塞请求路径
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// 默认实现：以结构化日志形式输出
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: GatewayEvent) {
        tracing::info!(
            event = event.event.as_str(),
            organization_id = event.organization_id.as_deref().unwrap_or("-"),
            data = %event.data,
            "gateway event"
        );
    }
}

/// 记录所有事件，测试中用于断言
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<GatewayEvent>>,
}

#[allow(dead_code)]
impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.event)
            .collect()
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: GatewayEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_uses_dotted_event_names() {
        let ev = GatewayEvent::new(
            EventKind::QuotaWarning,
            Some("org_1"),
            json!({"used": 40000, "limit": 50000}),
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "quota.warning");
        assert_eq!(v["organization_id"], "org_1");
        assert_eq!(v["data"]["limit"], 50000);

        let circuit = GatewayEvent::new(EventKind::CircuitOpen, None, json!({}));
        assert!(serde_json::to_value(&circuit).unwrap().get("organization_id").is_none());
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingEventSink::new();
        sink.emit(GatewayEvent::new(EventKind::CircuitOpen, None, json!({})));
        sink.emit(GatewayEvent::new(EventKind::CircuitClosed, None, json!({})));
        assert_eq!(sink.kinds(), vec![EventKind::CircuitOpen, EventKind::CircuitClosed]);
    }
}
