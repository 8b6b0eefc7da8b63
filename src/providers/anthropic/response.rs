use serde::Deserialize;

use crate::providers::types::{ChatCompletionResponse, Usage};

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl From<AnthropicUsage> for Usage {
    fn from(u: AnthropicUsage) -> Self {
        Usage::new(u.input_tokens, u.output_tokens)
    }
}

pub fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| match r {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        _ => "length".to_string(),
    })
}

pub fn convert_to_canonical(resp: MessagesResponse) -> ChatCompletionResponse {
    let text = resp
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    ChatCompletionResponse::single(
        resp.id,
        resp.model,
        text,
        map_stop_reason(resp.stop_reason.as_deref()),
        Some(resp.usage.into()),
    )
}
