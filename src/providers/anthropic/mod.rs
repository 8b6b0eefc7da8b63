use async_trait::async_trait;
use reqwest_eventsource::RequestBuilderExt;

use super::error::{ProviderError, error_from_response};
use super::streaming::{ChunkSink, drive_event_source};
use super::types::{ChatCompletionRequest, ChatCompletionResponse, Usage};
use super::{ProviderAdapter, ProviderId, RequestOptions, with_deadline};
use crate::http_client;

mod request;
mod response;
mod stream;

use request::{MessagesRequest, convert_to_anthropic};
use response::{MessagesResponse, convert_to_canonical};

const ANTHROPIC_VERSION: &str = "2023-06-01";

const MODELS: &[&str] = &[
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
    "claude-3-5-sonnet-20240620",
    "claude-3-opus",
    "claude-3-sonnet",
    "claude-3-haiku",
    "claude-3.5-sonnet",
];

pub struct AnthropicProvider {
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(base_url: Option<String>) -> Result<Self, reqwest::Error> {
        let base_url = base_url
            .unwrap_or_else(|| ProviderId::Anthropic.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();
        let client = http_client::client_for_url(&base_url)?;
        Ok(Self { base_url, client })
    }

    fn post(&self, api_key: &str, body: &MessagesRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn models(&self) -> &[&'static str] {
        MODELS
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let id = ProviderId::Anthropic;
        let body = convert_to_anthropic(request, false);
        with_deadline(id, opts, async {
            let response = self
                .post(&opts.api_key, &body)
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;

            if !response.status().is_success() {
                return Err(error_from_response(id, response).await);
            }

            let resp: MessagesResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::from_reqwest(id, e))?;
            Ok(convert_to_canonical(resp))
        })
        .await
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
        sink: &mut dyn ChunkSink,
    ) -> Result<Option<Usage>, ProviderError> {
        let id = ProviderId::Anthropic;
        let body = convert_to_anthropic(request, true);
        let es = self
            .post(&opts.api_key, &body)
            .eventsource()
            .map_err(|e| ProviderError::decode(id, e.to_string()))?;

        let mut state = stream::StreamState::new(&request.model);
        drive_event_source(id, es, opts, |_event, data| state.handle(data, sink)).await?;
        Ok(Some(state.usage()))
    }
}
