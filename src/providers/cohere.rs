use std::ops::ControlFlow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{ProviderError, error_from_response};
use super::streaming::{ChunkSink, drive_ndjson};
use super::types::{ChatCompletionRequest, ChatCompletionResponse, Role, StreamChunk, Usage};
use super::{ProviderAdapter, ProviderId, RequestOptions, with_deadline};
use crate::http_client;

const MODELS: &[&str] = &["command-r-plus", "command-r", "command", "command-light"];

#[derive(Debug, Serialize, PartialEq)]
struct CohereChatRequest {
    model: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    preamble: Option<String>,
    chat_history: Vec<CohereMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct CohereMessage {
    role: &'static str,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CohereChatResponse {
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    tokens: Option<Tokens>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Tokens {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl CohereChatResponse {
    fn usage(&self) -> Option<Usage> {
        self.meta
            .as_ref()
            .and_then(|m| m.tokens)
            .map(|t| Usage::new(t.input_tokens, t.output_tokens))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", rename_all = "kebab-case")]
enum StreamEvent {
    TextGeneration {
        #[serde(default)]
        text: String,
    },
    StreamEnd {
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        response: Option<CohereChatResponse>,
    },
    #[serde(other)]
    Other,
}

fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| match r {
        "MAX_TOKENS" => "length".to_string(),
        _ => "stop".to_string(),
    })
}

/// 最后一条 user 消息作为 `message`，之前的对话进入 `chat_history`，system 作为 `preamble`
fn convert_to_cohere(req: &ChatCompletionRequest, stream: bool) -> CohereChatRequest {
    let last = req.messages.len().saturating_sub(1);
    let mut message = String::new();
    let mut chat_history = Vec::new();

    for (i, msg) in req.messages.iter().enumerate() {
        match msg.role {
            Role::System => {}
            Role::User if i == last => message = msg.content.clone(),
            role => chat_history.push(CohereMessage {
                role: if role == Role::Assistant { "CHATBOT" } else { "USER" },
                message: msg.content.clone(),
            }),
        }
    }

    CohereChatRequest {
        model: req.model.clone(),
        message,
        preamble: req.system_prompt(),
        chat_history,
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        stream,
    }
}

pub struct CohereProvider {
    base_url: String,
    client: reqwest::Client,
}

impl CohereProvider {
    pub fn new(base_url: Option<String>) -> Result<Self, reqwest::Error> {
        let base_url = base_url
            .unwrap_or_else(|| ProviderId::Cohere.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();
        let client = http_client::client_for_url(&base_url)?;
        Ok(Self { base_url, client })
    }

    fn generated_id() -> String {
        format!("cohere-{}", chrono::Utc::now().timestamp_millis())
    }
}

#[async_trait]
impl ProviderAdapter for CohereProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Cohere
    }

    fn models(&self) -> &[&'static str] {
        MODELS
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let id = ProviderId::Cohere;
        let body = convert_to_cohere(request, false);
        with_deadline(id, opts, async {
            let response = self
                .client
                .post(format!("{}/chat", self.base_url))
                .bearer_auth(&opts.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;

            if !response.status().is_success() {
                return Err(error_from_response(id, response).await);
            }

            let resp: CohereChatResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;
            let usage = resp.usage();
            Ok(ChatCompletionResponse::single(
                resp.response_id.unwrap_or_else(Self::generated_id),
                request.model.clone(),
                resp.text,
                Some("stop".to_string()),
                usage,
            ))
        })
        .await
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
        sink: &mut dyn ChunkSink,
    ) -> Result<Option<Usage>, ProviderError> {
        let id = ProviderId::Cohere;
        let body = convert_to_cohere(request, true);

        // 连接与读流共用同一个截止点
        let response = with_deadline(id, opts, async {
            self.client
                .post(format!("{}/chat", self.base_url))
                .bearer_auth(&opts.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))
        })
        .await?;

        if !response.status().is_success() {
            return Err(error_from_response(id, response).await);
        }

        let stream_id = Self::generated_id();
        let mut usage = Usage::default();
        drive_ndjson(id, response, opts, |line| {
            match serde_json::from_str::<StreamEvent>(line) {
                Ok(StreamEvent::TextGeneration { text }) if !text.is_empty() => {
                    sink.push(StreamChunk::content(&stream_id, &request.model, text));
                }
                Ok(StreamEvent::StreamEnd {
                    finish_reason,
                    response,
                }) => {
                    if let Some(u) = response.as_ref().and_then(CohereChatResponse::usage) {
                        usage = u;
                    }
                    if finish_reason.as_deref() == Some("ERROR") {
                        return Err(ProviderError::upstream(id, "stream ended with ERROR"));
                    }
                    sink.push(
                        StreamChunk::content(&stream_id, &request.model, "")
                            .with_finish_reason(map_finish_reason(finish_reason.as_deref())),
                    );
                    return Ok(ControlFlow::Break(()));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(provider = "cohere", "skipping malformed stream line: {}", e);
                }
            }
            Ok(ControlFlow::Continue(()))
        })
        .await?;

        Ok(Some(usage))
    }
}
