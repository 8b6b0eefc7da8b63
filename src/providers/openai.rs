use std::ops::ControlFlow;

use async_trait::async_trait;
use reqwest_eventsource::RequestBuilderExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ProviderError, error_from_response};
use super::streaming::{ChunkSink, drive_event_source};
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, ChunkChoice, Role,
    StreamChunk, Usage,
};
use super::{ProviderAdapter, ProviderId, RequestOptions, with_deadline};
use crate::http_client;

const OPENAI_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"];

const GROQ_MODELS: &[&str] = &[
    "llama-3.1-70b-versatile",
    "llama-3.1-8b-instant",
    "llama-3.2-90b-text-preview",
    "mixtral-8x7b-32768",
    "gemma2-9b-it",
];

const MISTRAL_MODELS: &[&str] = &[
    "mistral-large-latest",
    "mistral-large",
    "mistral-medium-latest",
    "mistral-medium",
    "mistral-small-latest",
    "mistral-small",
    "open-mixtral-8x7b",
    "open-mistral-7b",
];

const TOGETHER_MODELS: &[&str] = &[
    "meta-llama/Llama-3-70b-chat-hf",
    "meta-llama/Llama-3-8b-chat-hf",
    "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo",
    "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo",
    "mistralai/Mixtral-8x7B-Instruct-v0.1",
    "Qwen/Qwen2-72B-Instruct",
];

const PERPLEXITY_MODELS: &[&str] = &[
    "llama-3.1-sonar-large-128k-online",
    "llama-3.1-sonar-small-128k-online",
    "llama-3.1-sonar-huge-128k-online",
];

fn models_for(id: ProviderId) -> &'static [&'static str] {
    match id {
        ProviderId::OpenAI => OPENAI_MODELS,
        ProviderId::Groq => GROQ_MODELS,
        ProviderId::Mistral => MISTRAL_MODELS,
        ProviderId::Together => TOGETHER_MODELS,
        ProviderId::Perplexity => PERPLEXITY_MODELS,
        _ => &[],
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// OpenAI Chat Completions 协议的适配器；Groq、Mistral、Together、Perplexity 共用，
/// 只有 base url 和模型列表不同
pub struct OpenAICompatibleProvider {
    id: ProviderId,
    base_url: String,
    models: &'static [&'static str],
    client: reqwest::Client,
}

impl OpenAICompatibleProvider {
    pub fn new(id: ProviderId, base_url: Option<String>) -> Result<Self, reqwest::Error> {
        let base_url = base_url
            .unwrap_or_else(|| id.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();
        let client = http_client::client_for_url(&base_url)?;
        Ok(Self {
            id,
            base_url,
            models: models_for(id),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn wire_request<'a>(&self, request: &'a ChatCompletionRequest, stream: bool) -> WireRequest<'a> {
        WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: (stream && self.id == ProviderId::OpenAI)
                .then_some(StreamOptions { include_usage: true }),
        }
    }

    fn into_canonical(&self, wire: WireResponse, requested_model: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: wire
                .id
                .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4().simple())),
            object: "chat.completion".to_string(),
            created: wire
                .created
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            model: wire.model.unwrap_or_else(|| requested_model.to_string()),
            choices: wire
                .choices
                .into_iter()
                .map(|c| Choice {
                    index: c.index,
                    message: ChatMessage {
                        role: c.message.role.unwrap_or(Role::Assistant),
                        content: c.message.content.unwrap_or_default(),
                    },
                    finish_reason: c.finish_reason,
                })
                .collect(),
            usage: wire.usage,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAICompatibleProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn models(&self) -> &[&'static str] {
        self.models
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let id = self.id;
        with_deadline(id, opts, async {
            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(&opts.api_key)
                .json(&self.wire_request(request, false))
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;

            if !response.status().is_success() {
                return Err(error_from_response(id, response).await);
            }

            let wire: WireResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;
            Ok(self.into_canonical(wire, &request.model))
        })
        .await
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
        sink: &mut dyn ChunkSink,
    ) -> Result<Option<Usage>, ProviderError> {
        let id = self.id;
        let es = self
            .client
            .post(self.endpoint())
            .bearer_auth(&opts.api_key)
            .header("Accept", "text/event-stream")
            .json(&self.wire_request(request, true))
            .eventsource()
            .map_err(|e| ProviderError::decode(id, e.to_string()))?;

        let mut usage: Option<Usage> = None;
        drive_event_source(id, es, opts, |_event, data| {
            let chunk = match serde_json::from_str::<WireChunk>(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(provider = %id, "skipping malformed stream event: {}", e);
                    return Ok(ControlFlow::Continue(()));
                }
            };
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if !chunk.choices.is_empty() {
                sink.push(StreamChunk {
                    id: chunk.id.unwrap_or_default(),
                    object: "chat.completion.chunk".to_string(),
                    created: chunk
                        .created
                        .unwrap_or_else(|| chrono::Utc::now().timestamp()),
                    model: chunk.model.unwrap_or_else(|| request.model.clone()),
                    choices: chunk.choices,
                });
            }
            Ok(ControlFlow::Continue(()))
        })
        .await?;

        Ok(usage)
    }
}
