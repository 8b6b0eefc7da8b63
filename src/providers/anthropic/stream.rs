use std::ops::ControlFlow;

use serde::Deserialize;

use super::response::{AnthropicUsage, map_stop_reason};
use crate::providers::types::{StreamChunk, Usage};
use crate::providers::{ChunkSink, ProviderError, ProviderId};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error {
        error: StreamErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Messages API 的流式事件 -> 统一 chunk
pub(super) struct StreamState<'a> {
    model: &'a str,
    message_id: String,
    input_tokens: u32,
    output_tokens: u32,
}

impl<'a> StreamState<'a> {
    pub(super) fn new(model: &'a str) -> Self {
        Self {
            model,
            message_id: String::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub(super) fn usage(&self) -> Usage {
        Usage::new(self.input_tokens, self.output_tokens)
    }

    pub(super) fn handle(
        &mut self,
        data: &str,
        sink: &mut dyn ChunkSink,
    ) -> Result<ControlFlow<()>, ProviderError> {
        let event = match serde_json::from_str::<StreamEvent>(data) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::debug!(provider = "anthropic", "skipping malformed stream event: {}", e);
                return Ok(ControlFlow::Continue(()));
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                self.message_id = message.id;
                if let Some(u) = message.usage {
                    self.input_tokens = u.input_tokens;
                }
            }
            StreamEvent::ContentBlockDelta { delta } => {
                if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                    sink.push(StreamChunk::content(&self.message_id, self.model, text));
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(u) = usage {
                    self.output_tokens = u.output_tokens;
                }
                if let Some(reason) = map_stop_reason(delta.stop_reason.as_deref()) {
                    sink.push(
                        StreamChunk::content(&self.message_id, self.model, "")
                            .with_finish_reason(Some(reason)),
                    );
                }
            }
            StreamEvent::MessageStop => return Ok(ControlFlow::Break(())),
            StreamEvent::Error { error } => {
                return Err(ProviderError::upstream(
                    ProviderId::Anthropic,
                    format!("{}: {}", error.kind, error.message),
                ));
            }
            StreamEvent::Other => {}
        }
        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_become_chunks_with_usage() {
        let mut state = StreamState::new("claude-3-haiku");
        let mut sink: Vec<StreamChunk> = Vec::new();
        let events = [
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
        ];
        for e in events {
            assert!(state.handle(e, &mut sink).unwrap().is_continue());
        }
        assert!(state.handle(r#"{"type":"message_stop"}"#, &mut sink).unwrap().is_break());

        let text: String = sink.iter().map(|c| c.text()).collect();
        assert_eq!(text, "Hi there");
        assert_eq!(sink[0].id, "msg_1");
        assert_eq!(
            sink.last().and_then(|c| c.choices[0].finish_reason.clone()).as_deref(),
            Some("stop")
        );
        assert_eq!(state.usage(), Usage::new(12, 7));
    }

    #[test]
    fn error_event_fails_attempt() {
        let mut state = StreamState::new("claude-3-haiku");
        let mut sink: Vec<StreamChunk> = Vec::new();
        let err = state
            .handle(
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
                &mut sink,
            )
            .unwrap_err();
        assert!(err.message.contains("overloaded_error"));
        assert_eq!(err.class(), crate::providers::FailureClass::Transient);
    }
}
