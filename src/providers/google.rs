use std::ops::ControlFlow;

use async_trait::async_trait;
use reqwest_eventsource::RequestBuilderExt;
use serde::{Deserialize, Serialize};

use super::error::{ProviderError, error_from_response};
use super::streaming::{ChunkSink, drive_event_source};
use super::types::{ChatCompletionRequest, ChatCompletionResponse, Role, StreamChunk, Usage};
use super::{ProviderAdapter, ProviderId, RequestOptions, with_deadline};
use crate::http_client;

const MODELS: &[&str] = &["gemini-1.5-pro", "gemini-1.5-flash", "gemini-pro", "gemini-1.0-pro"];

/// 模型名不是 gemini 系列时使用的默认模型
const DEFAULT_MODEL: &str = "gemini-1.5-pro";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl Candidate {
    fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| match r {
        "STOP" => "stop".to_string(),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            "content_filter".to_string()
        }
        _ => "length".to_string(),
    })
}

/// assistant 对应 Gemini 的 `model` 角色，system 进入 `systemInstruction`
fn convert_to_gemini(req: &ChatCompletionRequest) -> GenerateRequest {
    let contents = req
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| Content {
            role: Some(if m.role == Role::Assistant { "model" } else { "user" }.to_string()),
            parts: vec![Part {
                text: Some(m.content.clone()),
            }],
        })
        .collect();

    GenerateRequest {
        system_instruction: req.system_prompt().map(|s| Content {
            role: None,
            parts: vec![Part { text: Some(s) }],
        }),
        contents,
        generation_config: GenerationConfig {
            temperature: req.temperature,
            max_output_tokens: req.max_tokens,
        },
    }
}

fn resolve_model(requested: &str) -> &str {
    if requested.starts_with("gemini") {
        requested
    } else {
        DEFAULT_MODEL
    }
}

pub struct GoogleProvider {
    base_url: String,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(base_url: Option<String>) -> Result<Self, reqwest::Error> {
        let base_url = base_url
            .unwrap_or_else(|| ProviderId::Google.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();
        let client = http_client::client_for_url(&base_url)?;
        Ok(Self { base_url, client })
    }

    fn generated_id() -> String {
        format!("gemini-{}", chrono::Utc::now().timestamp_millis())
    }
}

#[async_trait]
impl ProviderAdapter for GoogleProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Google
    }

    fn models(&self) -> &[&'static str] {
        MODELS
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let id = ProviderId::Google;
        let model = resolve_model(&request.model);
        let body = convert_to_gemini(request);
        with_deadline(id, opts, async {
            let response = self
                .client
                .post(format!("{}/models/{}:generateContent", self.base_url, model))
                .query(&[("key", opts.api_key.as_str())])
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;

            if !response.status().is_success() {
                return Err(error_from_response(id, response).await);
            }

            let resp: GenerateResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;
            let candidate = resp.candidates.first();
            Ok(ChatCompletionResponse::single(
                Self::generated_id(),
                model,
                candidate.map(Candidate::text).unwrap_or_default(),
                map_finish_reason(candidate.and_then(|c| c.finish_reason.as_deref())),
                resp.usage_metadata.map(Usage::from),
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
        let id = ProviderId::Google;
        let model = resolve_model(&request.model);
        let es = self
            .client
            .post(format!(
                "{}/models/{}:streamGenerateContent",
                self.base_url, model
            ))
            .query(&[("alt", "sse"), ("key", opts.api_key.as_str())])
            .json(&convert_to_gemini(request))
            .eventsource()
            .map_err(|e| ProviderError::decode(id, e.to_string()))?;

        let stream_id = Self::generated_id();
        let mut usage: Option<Usage> = None;
        drive_event_source(id, es, opts, |_event, data| {
            let resp = match serde_json::from_str::<GenerateResponse>(data) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(provider = "google", "skipping malformed stream event: {}", e);
                    return Ok(ControlFlow::Continue(()));
                }
            };
            if let Some(u) = resp.usage_metadata {
                usage = Some(u.into());
            }
            if let Some(candidate) = resp.candidates.first() {
                let text = candidate.text();
                let finish = map_finish_reason(candidate.finish_reason.as_deref());
                if !text.is_empty() || finish.is_some() {
                    sink.push(StreamChunk::content(&stream_id, model, text).with_finish_reason(finish));
                }
            }
            Ok(ControlFlow::Continue(()))
        })
        .await?;

        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::ChatMessage;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn roles_are_mapped_for_gemini() {
        let req = ChatCompletionRequest::new(
            "gemini-1.5-flash",
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("q"),
                ChatMessage::assistant("a"),
            ],
        );
        let wire = serde_json::to_value(convert_to_gemini(&req)).unwrap();
        assert_eq!(wire["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(wire["contents"][0]["role"], "user");
        assert_eq!(wire["contents"][1]["role"], "model");
        assert!(wire["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn non_gemini_names_fall_back_to_default_model() {
        assert_eq!(resolve_model("gemini-pro"), "gemini-pro");
        assert_eq!(resolve_model("palm-2"), DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn chat_uses_query_key_and_maps_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(query_param("key", "g-key"))
            .and(body_partial_json(json!({
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "hello"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1, "totalTokenCount": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let p = GoogleProvider::new(Some(server.uri())).unwrap();
        let req = ChatCompletionRequest::new("gemini-1.5-flash", vec![ChatMessage::user("hi")]);
        let resp = p
            .chat(&req, &RequestOptions::new("g-key", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(resp.model, "gemini-1.5-flash");
        assert!(resp.id.starts_with("gemini-"));
        assert_eq!(resp.choices[0].message.content, "hello");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage, Some(Usage::new(2, 1)));
    }

    #[tokio::test]
    async fn stream_reads_sse_frames() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":2,\"candidatesTokenCount\":2,\"totalTokenCount\":4}}\r\n\r\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let p = GoogleProvider::new(Some(server.uri())).unwrap();
        let req = ChatCompletionRequest::new("gemini-pro", vec![ChatMessage::user("hi")]);
        let mut chunks: Vec<StreamChunk> = Vec::new();
        let usage = p
            .chat_stream(&req, &RequestOptions::new("g", Duration::from_secs(5)), &mut chunks)
            .await
            .unwrap();
        let text: String = chunks.iter().map(|c| c.text()).collect();
        assert_eq!(text, "Hello");
        assert_eq!(usage, Some(Usage::new(2, 2)));
    }
}
