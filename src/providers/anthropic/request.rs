use serde::Serialize;

use crate::providers::types::{ChatCompletionRequest, Role};

pub(super) const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnthropicMessage {
    pub role: &'static str,
    pub content: String,
}

/// system 消息移到顶层 `system` 字段；相邻同角色消息合并（Messages API 要求 user/assistant 交替）
pub fn convert_to_anthropic(req: &ChatCompletionRequest, stream: bool) -> MessagesRequest {
    let mut messages: Vec<AnthropicMessage> = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        let role = match msg.role {
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => messages.push(AnthropicMessage {
                role,
                content: msg.content.clone(),
            }),
        }
    }

    MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: req.system_prompt(),
        messages,
        temperature: req.temperature,
        stream,
    }
}
