use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::detect::resolve_provider;
use super::metadata::{RequestMetadata, RouteContext};
use crate::clock::SharedClock;
use crate::config::{ProvidersConfig, StreamMode};
use crate::credentials::CredentialResolver;
use crate::error::GatewayError;
use crate::events::{EventKind, EventSink, GatewayEvent};
use crate::providers::{
    ChatCompletionRequest, ChatCompletionResponse, ChunkSink, FailureClass, ProviderAdapter,
    ProviderError, ProviderId, ProviderRegistry, RequestOptions, StreamChunk, Usage,
};

/// 客户端主动断开，沿用 nginx 的约定
const STATUS_CLIENT_CLOSED: u16 = 499;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub provider: ProviderId,
    pub model: String,
}

/// 单个候选没有产出结果的原因
#[derive(Debug, Clone)]
pub enum CandidateFailure {
    CircuitOpen,
    /// 配置问题，不计入熔断
    MissingCredential,
    Provider(ProviderError),
}

impl CandidateFailure {
    fn describe(&self, provider: ProviderId) -> String {
        match self {
            CandidateFailure::CircuitOpen => format!("Circuit open for provider: {provider}"),
            CandidateFailure::MissingCredential => {
                format!("No API key configured for provider: {provider}")
            }
            CandidateFailure::Provider(e) => e.to_string(),
        }
    }
}

/// 路由失败时也要带上 metadata，入口据此写日志
#[derive(Debug)]
pub struct RouteFailure {
    pub error: GatewayError,
    pub metadata: RequestMetadata,
}

/// 单个候选重试结束后的结果
enum ExecFailure {
    /// 重试耗尽或不可重试，继续下一个候选
    Exhausted(ProviderError),
    /// 已有 chunk 送达调用方，不能再换候选
    Committed(ProviderError),
    Cancelled,
}

/// 一次尝试的执行方式：普通调用 / 流式调用
#[async_trait]
trait AttemptRunner: Send {
    type Output: Send;

    async fn run(
        &mut self,
        adapter: &dyn ProviderAdapter,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<Self::Output, ProviderError>;

    fn usage(output: &Self::Output) -> Option<Usage>;

    fn committed(&self) -> bool {
        false
    }
}

struct ChatAttempt;

#[async_trait]
impl AttemptRunner for ChatAttempt {
    type Output = ChatCompletionResponse;

    async fn run(
        &mut self,
        adapter: &dyn ProviderAdapter,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        adapter.chat(request, opts).await
    }

    fn usage(output: &ChatCompletionResponse) -> Option<Usage> {
        output.usage
    }
}

struct StreamAttempt<'s> {
    downstream: &'s mut dyn ChunkSink,
    mode: StreamMode,
    committed: bool,
}

/// 转发的同时记录是否已有 chunk 送出
struct CommitSink<'a, 's> {
    inner: &'a mut (dyn ChunkSink + 's),
    forwarded: bool,
}

impl ChunkSink for CommitSink<'_, '_> {
    fn push(&mut self, chunk: StreamChunk) {
        self.forwarded = true;
        self.inner.push(chunk);
    }
}

#[async_trait]
impl<'s> AttemptRunner for StreamAttempt<'s> {
    type Output = Option<Usage>;

    async fn run(
        &mut self,
        adapter: &dyn ProviderAdapter,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<Option<Usage>, ProviderError> {
        match self.mode {
            StreamMode::Buffered => {
                // 失败的尝试留下的半截输出直接丢弃
                let mut buffer: Vec<StreamChunk> = Vec::new();
                let usage = adapter.chat_stream(request, opts, &mut buffer).await?;
                for chunk in buffer {
                    self.downstream.push(chunk);
                }
                Ok(usage)
            }
            StreamMode::FirstChunk => {
                let mut sink = CommitSink {
                    inner: &mut *self.downstream,
                    forwarded: false,
                };
                let result = adapter.chat_stream(request, opts, &mut sink).await;
                let forwarded = sink.forwarded;
                self.committed |= forwarded;
                result
            }
        }
    }

    fn usage(output: &Option<Usage>) -> Option<Usage> {
        *output
    }

    fn committed(&self) -> bool {
        self.committed
    }
}

#[derive(Debug, Clone)]
struct EngineConfig {
    timeout: Duration,
    retries: u32,
    retry_base_delay: Duration,
    total_deadline: Option<Duration>,
    stream_mode: StreamMode,
}

impl From<&ProvidersConfig> for EngineConfig {
    fn from(c: &ProvidersConfig) -> Self {
        Self {
            timeout: Duration::from_millis(c.timeout_ms),
            retries: c.retries,
            retry_base_delay: Duration::from_millis(c.retry_base_delay_ms),
            total_deadline: c.total_deadline_ms.map(Duration::from_millis),
            stream_mode: c.stream_mode,
        }
    }
}

/// 候选链编排：主模型 + 调用方给出的 fallback，严格按顺序逐个尝试
pub struct RouteEngine {
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    credentials: Arc<CredentialResolver>,
    events: Arc<dyn EventSink>,
    clock: SharedClock,
    config: EngineConfig,
}

impl RouteEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breaker: Arc<CircuitBreaker>,
        credentials: Arc<CredentialResolver>,
        events: Arc<dyn EventSink>,
        clock: SharedClock,
        config: &ProvidersConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            credentials,
            events,
            clock,
            config: EngineConfig::from(config),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// fallback 只来自 `fallback_models`，与主模型同 provider 的候选被跳过
    pub fn build_chain(&self, request: &ChatCompletionRequest) -> Result<Vec<Candidate>, GatewayError> {
        let primary = resolve_provider(&request.model, &self.registry)
            .ok_or_else(|| GatewayError::UnknownModel(request.model.clone()))?;

        let mut chain = vec![Candidate {
            provider: primary,
            model: request.model.clone(),
        }];
        for model in request.fallback_models.iter().flatten() {
            match resolve_provider(model, &self.registry) {
                Some(provider) if provider != primary => chain.push(Candidate {
                    provider,
                    model: model.clone(),
                }),
                Some(_) => {}
                None => tracing::debug!(model = %model, "ignoring unresolvable fallback model"),
            }
        }
        Ok(chain)
    }

    pub async fn route(
        &self,
        request: &ChatCompletionRequest,
        ctx: &RouteContext,
    ) -> Result<(ChatCompletionResponse, RequestMetadata), RouteFailure> {
        self.run_chain(request, ctx, &mut ChatAttempt).await
    }

    /// chunk 按到达顺序推给 `sink`；只有最终胜出的候选的 chunk 会出现在 `sink` 里（buffered 模式）
    pub async fn route_stream(
        &self,
        request: &ChatCompletionRequest,
        ctx: &RouteContext,
        sink: &mut dyn ChunkSink,
    ) -> Result<(Option<Usage>, RequestMetadata), RouteFailure> {
        let mut runner = StreamAttempt {
            downstream: sink,
            mode: self.config.stream_mode,
            committed: false,
        };
        self.run_chain(request, ctx, &mut runner).await
    }

    async fn run_chain<R: AttemptRunner>(
        &self,
        request: &ChatCompletionRequest,
        ctx: &RouteContext,
        runner: &mut R,
    ) -> Result<(R::Output, RequestMetadata), RouteFailure> {
        let mut metadata = RequestMetadata::start(ctx, &request.model, self.clock.now_ms());
        let deadline = self.config.total_deadline.map(|d| Instant::now() + d);

        let chain = match self.build_chain(request) {
            Ok(chain) => chain,
            Err(error) => return Err(self.fail(metadata, error, 400)),
        };

        let mut last_error: Option<String> = None;
        for (index, candidate) in chain.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(self.cancelled(metadata, candidate.provider));
            }
            if index > 0 && budget_spent(deadline) {
                tracing::warn!(request_id = %ctx.request_id, "total deadline exhausted, stopping chain");
                break;
            }

            match self.try_candidate(candidate, request, ctx, deadline, runner).await {
                Ok(output) => {
                    metadata.select_candidate(candidate.provider, &candidate.model, index);
                    metadata.record_usage(R::usage(&output));
                    metadata.finish(self.clock.now_ms());
                    return Ok((output, metadata));
                }
                Err(CandidateOutcome::Skip(failure)) => {
                    let message = failure.describe(candidate.provider);
                    tracing::info!(
                        request_id = %ctx.request_id,
                        provider = %candidate.provider,
                        model = %candidate.model,
                        "candidate skipped: {}",
                        message
                    );
                    if matches!(failure, CandidateFailure::Provider(_)) || last_error.is_none() {
                        last_error = Some(message);
                    }
                }
                Err(CandidateOutcome::Abort(ExecFailure::Cancelled)) => {
                    return Err(self.cancelled(metadata, candidate.provider));
                }
                Err(CandidateOutcome::Abort(ExecFailure::Committed(e))) => {
                    metadata.select_candidate(candidate.provider, &candidate.model, index);
                    let message = e.to_string();
                    return Err(self.exhausted(metadata, ctx, message));
                }
                Err(CandidateOutcome::Abort(ExecFailure::Exhausted(e))) => {
                    last_error = Some(e.to_string());
                }
            }
        }

        let message = last_error.unwrap_or_else(|| "All providers failed".to_string());
        Err(self.exhausted(metadata, ctx, message))
    }

    async fn try_candidate<R: AttemptRunner>(
        &self,
        candidate: &Candidate,
        request: &ChatCompletionRequest,
        ctx: &RouteContext,
        deadline: Option<Instant>,
        runner: &mut R,
    ) -> Result<R::Output, CandidateOutcome> {
        let provider = candidate.provider;
        if !self.can_attempt(provider).await {
            return Err(CandidateOutcome::Skip(CandidateFailure::CircuitOpen));
        }
        let Some(adapter) = self.registry.get(provider) else {
            return Err(CandidateOutcome::Skip(CandidateFailure::MissingCredential));
        };
        let Some(api_key) = self
            .credentials
            .resolve(provider, &ctx.organization_id, ctx.provider_key_override.as_deref())
            .await
        else {
            return Err(CandidateOutcome::Skip(CandidateFailure::MissingCredential));
        };

        let candidate_request = request.with_model(&candidate.model);
        match self
            .execute_with_retry(adapter.as_ref(), &candidate_request, api_key, ctx, deadline, runner)
            .await
        {
            Ok(output) => Ok(output),
            Err(ExecFailure::Exhausted(e)) => {
                Err(CandidateOutcome::Skip(CandidateFailure::Provider(e)))
            }
            Err(other) => Err(CandidateOutcome::Abort(other)),
        }
    }

    async fn execute_with_retry<R: AttemptRunner>(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &ChatCompletionRequest,
        api_key: String,
        ctx: &RouteContext,
        deadline: Option<Instant>,
        runner: &mut R,
    ) -> Result<R::Output, ExecFailure> {
        let provider = adapter.id();
        let attempts = self.config.retries.saturating_add(1);
        let mut last: Option<ProviderError> = None;

        for attempt in 0..attempts {
            let Some(timeout) = self.attempt_timeout(deadline) else {
                break;
            };
            let opts = RequestOptions::new(api_key.clone(), timeout).with_cancel(ctx.cancel.clone());

            match runner.run(adapter, request, &opts).await {
                Ok(output) => {
                    self.on_success(provider).await;
                    return Ok(output);
                }
                Err(e) if e.is_cancelled() => return Err(ExecFailure::Cancelled),
                Err(e) => {
                    let class = e.class();
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        provider = %provider,
                        model = %request.model,
                        attempt,
                        "provider attempt failed: {}",
                        e
                    );
                    if class != FailureClass::Auth {
                        self.on_failure(provider).await;
                    }
                    if runner.committed() {
                        return Err(ExecFailure::Committed(e));
                    }
                    if class != FailureClass::Transient {
                        return Err(ExecFailure::Exhausted(e));
                    }
                    last = Some(e);
                }
            }

            if attempt + 1 < attempts {
                let delay = self.backoff(attempt, deadline);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(ExecFailure::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(ExecFailure::Exhausted(last.unwrap_or_else(|| {
            ProviderError::timeout(provider, self.config.total_deadline.unwrap_or_default())
        })))
    }

    /// 单次尝试的超时不能超过总预算的剩余部分
    fn attempt_timeout(&self, deadline: Option<Instant>) -> Option<Duration> {
        match deadline {
            None => Some(self.config.timeout),
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    None
                } else {
                    Some(remaining.min(self.config.timeout))
                }
            }
        }
    }

    /// `base * 2^attempt`
    fn backoff(&self, attempt: u32, deadline: Option<Instant>) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.config.retry_base_delay.saturating_mul(factor);
        match deadline {
            Some(at) => delay.min(at.saturating_duration_since(Instant::now())),
            None => delay,
        }
    }

    /// 熔断存储不可用时放行
    async fn can_attempt(&self, provider: ProviderId) -> bool {
        match self.breaker.can_attempt(provider).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(provider = %provider, "circuit state unavailable: {}", e);
                true
            }
        }
    }

    async fn on_success(&self, provider: ProviderId) {
        match self.breaker.record_success(provider).await {
            Ok(previous) if previous.state != CircuitState::Closed => {
                self.events.emit(GatewayEvent::new(
                    EventKind::CircuitClosed,
                    None,
                    json!({ "provider": provider, "failures": previous.failures }),
                ));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(provider = %provider, "failed to record success: {}", e),
        }
    }

    async fn on_failure(&self, provider: ProviderId) {
        match self.breaker.record_failure(provider).await {
            Ok(status) if status.state == CircuitState::Open => {
                self.events.emit(GatewayEvent::new(
                    EventKind::CircuitOpen,
                    None,
                    json!({
                        "provider": provider,
                        "failures": status.failures,
                        "openUntil": status.open_until,
                    }),
                ));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(provider = %provider, "failed to record failure: {}", e),
        }
    }

    fn fail(&self, mut metadata: RequestMetadata, error: GatewayError, status: u16) -> RouteFailure {
        if metadata.provider.is_empty() {
            metadata.provider = "unknown".to_string();
        }
        metadata.fail(status, error.to_string());
        metadata.finish(self.clock.now_ms());
        RouteFailure { error, metadata }
    }

    fn cancelled(&self, metadata: RequestMetadata, provider: ProviderId) -> RouteFailure {
        let error = GatewayError::Provider(ProviderError::cancelled(provider));
        self.fail(metadata, error, STATUS_CLIENT_CLOSED)
    }

    fn exhausted(&self, metadata: RequestMetadata, ctx: &RouteContext, message: String) -> RouteFailure {
        tracing::error!(request_id = %ctx.request_id, model = %metadata.model, "all providers failed: {}", message);
        self.events.emit(GatewayEvent::new(
            EventKind::RequestError,
            Some(&ctx.organization_id),
            json!({
                "requestId": ctx.request_id,
                "model": metadata.model,
                "error": message,
            }),
        ));
        let error = GatewayError::ChainExhausted {
            message,
            request_id: ctx.request_id.clone(),
        };
        self.fail(metadata, error, 502)
    }
}

enum CandidateOutcome {
    Skip(CandidateFailure),
    Abort(ExecFailure),
}

fn budget_spent(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CircuitBreakerConfig;
    use crate::credentials::MemoryCredentialStore;
    use crate::events::RecordingEventSink;
    use crate::providers::with_deadline;
    use crate::store::MemoryStore;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Step {
        Reply(&'static str),
        Fail(u16),
        /// 先输出一段文本再失败
        PartialThenFail(&'static str, u16),
        Hang,
    }

    struct ScriptedAdapter {
        id: ProviderId,
        models: &'static [&'static str],
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(id: ProviderId, models: &'static [&'static str], steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                id,
                models,
                script: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_step(&self) -> Step {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Reply("default"))
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
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
            match self.next_step() {
                Step::Reply(text) => Ok(ChatCompletionResponse::single(
                    "id-1",
                    request.model.clone(),
                    text,
                    Some("stop".into()),
                    Some(Usage::new(5, 3)),
                )),
                Step::Fail(status) | Step::PartialThenFail(_, status) => {
                    Err(ProviderError::status(self.id, status, "scripted failure"))
                }
                Step::Hang => with_deadline(self.id, opts, std::future::pending()).await,
            }
        }

        async fn chat_stream(
            &self,
            request: &ChatCompletionRequest,
            opts: &RequestOptions,
            sink: &mut dyn ChunkSink,
        ) -> Result<Option<Usage>, ProviderError> {
            match self.next_step() {
                Step::Reply(text) => {
                    for word in text.split_inclusive(' ') {
                        sink.push(StreamChunk::content("s", &request.model, word));
                    }
                    Ok(Some(Usage::new(2, 2)))
                }
                Step::Fail(status) => Err(ProviderError::status(self.id, status, "scripted failure")),
                Step::PartialThenFail(text, status) => {
                    sink.push(StreamChunk::content("s", &request.model, text));
                    Err(ProviderError::status(self.id, status, "stream broke"))
                }
                Step::Hang => with_deadline(self.id, opts, std::future::pending()).await,
            }
        }
    }

    const OPENAI_MODELS: &[&str] = &["gpt-4o"];
    const ANTHROPIC_MODELS: &[&str] = &["claude-3-haiku"];
    const GOOGLE_MODELS: &[&str] = &["gemini-pro"];

    struct Harness {
        engine: RouteEngine,
        breaker: Arc<CircuitBreaker>,
        events: Arc<RecordingEventSink>,
        clock: Arc<ManualClock>,
    }

    struct Options {
        threshold: u32,
        keys: &'static [&'static str],
        providers: ProvidersConfig,
    }

    impl Default for Options {
        fn default() -> Self {
            Self {
                threshold: 5,
                keys: &["openai", "anthropic", "google"],
                providers: ProvidersConfig {
                    timeout_ms: 2_000,
                    retries: 2,
                    retry_base_delay_ms: 1,
                    total_deadline_ms: None,
                    stream_mode: StreamMode::Buffered,
                },
            }
        }
    }

    fn harness(adapters: Vec<Arc<ScriptedAdapter>>, opts: Options) -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            store,
            clock.clone(),
            &CircuitBreakerConfig {
                threshold: opts.threshold,
                timeout_ms: 60_000,
                half_open_single_probe: false,
            },
        ));
        let mut registry = ProviderRegistry::new();
        for a in adapters {
            registry.register(a);
        }
        let env: HashMap<String, String> = opts
            .keys
            .iter()
            .map(|p| (p.to_string(), format!("key-{p}")))
            .collect();
        let credentials = Arc::new(CredentialResolver::new(
            Arc::new(MemoryCredentialStore::new()),
            &env,
        ));
        let events = Arc::new(RecordingEventSink::new());
        let engine = RouteEngine::new(
            Arc::new(registry),
            breaker.clone(),
            credentials,
            events.clone(),
            clock.clone(),
            &opts.providers,
        );
        Harness {
            engine,
            breaker,
            events,
            clock,
        }
    }

    fn ctx() -> RouteContext {
        RouteContext {
            request_id: "req_test".into(),
            api_key_id: "key_1".into(),
            organization_id: "org_1".into(),
            ..Default::default()
        }
    }

    fn request_with_fallbacks(fallbacks: &[&str]) -> ChatCompletionRequest {
        let mut req = ChatCompletionRequest::new(
            "gpt-4o",
            vec![crate::providers::ChatMessage::user("hi")],
        );
        req.fallback_models = Some(fallbacks.iter().map(|s| s.to_string()).collect());
        req
    }

    async fn failures(breaker: &CircuitBreaker, p: ProviderId) -> u32 {
        breaker.state(p).await.unwrap().failures
    }

    #[tokio::test]
    async fn happy_path_records_cost() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![Step::Reply("hello")]);
        let h = harness(vec![openai.clone()], Options::default());
        let req = request_with_fallbacks(&[]);

        let (resp, meta) = h.engine.route(&req, &ctx()).await.unwrap();
        assert_eq!(resp.usage.unwrap().total_tokens, 8);
        assert_eq!(meta.provider, "openai");
        assert!(!meta.fallback_used);
        let expected = 5.0 / 1000.0 * 0.005 + 3.0 / 1000.0 * 0.015;
        assert!((meta.cost.unwrap() - expected).abs() < 1e-12);
        assert_eq!(openai.calls(), 1);
    }

    #[tokio::test]
    async fn falls_back_in_order_after_transient_failures() {
        let openai = ScriptedAdapter::new(
            ProviderId::OpenAI,
            OPENAI_MODELS,
            vec![Step::Fail(503), Step::Fail(503), Step::Fail(503)],
        );
        let anthropic = ScriptedAdapter::new(
            ProviderId::Anthropic,
            ANTHROPIC_MODELS,
            vec![Step::Fail(500), Step::Fail(502), Step::Fail(500)],
        );
        let google = ScriptedAdapter::new(ProviderId::Google, GOOGLE_MODELS, vec![Step::Reply("ok")]);
        let h = harness(
            vec![openai.clone(), anthropic.clone(), google.clone()],
            Options::default(),
        );
        let req = request_with_fallbacks(&["claude-3-haiku", "gemini-pro"]);

        let (resp, meta) = h.engine.route(&req, &ctx()).await.unwrap();
        assert_eq!(resp.model, "gemini-pro");
        assert_eq!(meta.provider, "google");
        assert_eq!(meta.model, "gemini-pro");
        assert!(meta.fallback_used);
        assert_eq!(meta.fallback_provider.as_deref(), Some("google"));
        assert_eq!((openai.calls(), anthropic.calls(), google.calls()), (3, 3, 1));
        assert_eq!(failures(&h.breaker, ProviderId::OpenAI).await, 3);
        assert_eq!(failures(&h.breaker, ProviderId::Google).await, 0);
    }

    #[tokio::test]
    async fn auth_error_uses_one_attempt_without_penalty() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![Step::Fail(401)]);
        let anthropic =
            ScriptedAdapter::new(ProviderId::Anthropic, ANTHROPIC_MODELS, vec![Step::Reply("ok")]);
        let h = harness(vec![openai.clone(), anthropic.clone()], Options::default());

        let (_, meta) = h
            .engine
            .route(&request_with_fallbacks(&["claude-3-haiku"]), &ctx())
            .await
            .unwrap();
        assert_eq!(meta.provider, "anthropic");
        assert_eq!(openai.calls(), 1);
        assert_eq!(failures(&h.breaker, ProviderId::OpenAI).await, 0);
    }

    #[tokio::test]
    async fn client_error_is_not_retried_but_penalized() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![Step::Fail(404)]);
        let h = harness(vec![openai.clone()], Options::default());

        let failure = h.engine.route(&request_with_fallbacks(&[]), &ctx()).await.unwrap_err();
        assert!(matches!(failure.error, GatewayError::ChainExhausted { .. }));
        assert_eq!(openai.calls(), 1);
        assert_eq!(failures(&h.breaker, ProviderId::OpenAI).await, 1);
    }

    #[tokio::test]
    async fn rate_limited_upstream_is_retried() {
        let openai = ScriptedAdapter::new(
            ProviderId::OpenAI,
            OPENAI_MODELS,
            vec![Step::Fail(429), Step::Reply("ok")],
        );
        let h = harness(vec![openai.clone()], Options::default());
        let (_, meta) = h.engine.route(&request_with_fallbacks(&[]), &ctx()).await.unwrap();
        assert_eq!(meta.provider, "openai");
        assert_eq!(openai.calls(), 2);
        // 成功即复位
        assert_eq!(failures(&h.breaker, ProviderId::OpenAI).await, 0);
    }

    #[tokio::test]
    async fn full_exhaustion_returns_502_and_penalizes_every_provider() {
        let openai = ScriptedAdapter::new(
            ProviderId::OpenAI,
            OPENAI_MODELS,
            vec![Step::Fail(500), Step::Fail(500), Step::Fail(500)],
        );
        let anthropic = ScriptedAdapter::new(
            ProviderId::Anthropic,
            ANTHROPIC_MODELS,
            vec![Step::Fail(503), Step::Fail(503), Step::Fail(503)],
        );
        let h = harness(vec![openai.clone(), anthropic.clone()], Options::default());

        let failure = h
            .engine
            .route(&request_with_fallbacks(&["claude-3-haiku"]), &ctx())
            .await
            .unwrap_err();
        match &failure.error {
            GatewayError::ChainExhausted { message, request_id } => {
                assert_eq!(request_id, "req_test");
                assert!(message.contains("Anthropic API error: 503"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(failure.error.status_code().as_u16(), 502);
        assert_eq!(failure.metadata.status_code, 502);
        assert_eq!(failure.metadata.provider, "unknown");
        assert_eq!(failures(&h.breaker, ProviderId::OpenAI).await, 3);
        assert_eq!(failures(&h.breaker, ProviderId::Anthropic).await, 3);
        assert_eq!(h.events.kinds(), vec![EventKind::RequestError]);
    }

    #[tokio::test]
    async fn unknown_model_fails_before_any_call() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![]);
        let h = harness(vec![openai.clone()], Options::default());
        let req = ChatCompletionRequest::new("totally-unknown", vec![]);

        let failure = h.engine.route(&req, &ctx()).await.unwrap_err();
        assert!(matches!(failure.error, GatewayError::UnknownModel(_)));
        assert_eq!(failure.metadata.status_code, 400);
        assert_eq!(openai.calls(), 0);
    }

    #[test]
    fn chain_skips_fallbacks_on_the_primary_provider() {
        let h = harness(
            vec![
                ScriptedAdapter::new(ProviderId::OpenAI, &["gpt-4o", "gpt-4o-mini"], vec![]),
                ScriptedAdapter::new(ProviderId::Anthropic, ANTHROPIC_MODELS, vec![]),
            ],
            Options::default(),
        );
        let req = request_with_fallbacks(&["gpt-4o-mini", "claude-3-haiku", "nope-model"]);
        let chain = h.engine.build_chain(&req).unwrap();
        assert_eq!(
            chain,
            vec![
                Candidate { provider: ProviderId::OpenAI, model: "gpt-4o".into() },
                Candidate { provider: ProviderId::Anthropic, model: "claude-3-haiku".into() },
            ]
        );
    }

    #[tokio::test]
    async fn missing_credential_skips_without_penalty() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![]);
        let anthropic =
            ScriptedAdapter::new(ProviderId::Anthropic, ANTHROPIC_MODELS, vec![Step::Reply("ok")]);
        let h = harness(
            vec![openai.clone(), anthropic.clone()],
            Options {
                keys: &["anthropic"],
                ..Default::default()
            },
        );

        let (_, meta) = h
            .engine
            .route(&request_with_fallbacks(&["claude-3-haiku"]), &ctx())
            .await
            .unwrap();
        assert_eq!(meta.provider, "anthropic");
        assert_eq!(openai.calls(), 0);
        assert_eq!(failures(&h.breaker, ProviderId::OpenAI).await, 0);

        // 只有缺 key 时，错误信息指明 provider
        let h = harness(
            vec![ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![])],
            Options {
                keys: &[],
                ..Default::default()
            },
        );
        let failure = h.engine.route(&request_with_fallbacks(&[]), &ctx()).await.unwrap_err();
        assert!(failure.error.to_string().contains("No API key configured for provider: openai"));
    }

    #[tokio::test]
    async fn header_key_overrides_missing_configuration() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![Step::Reply("ok")]);
        let h = harness(
            vec![openai.clone()],
            Options {
                keys: &[],
                ..Default::default()
            },
        );
        let mut ctx = ctx();
        ctx.provider_key_override = Some("sk-user".into());
        assert!(h.engine.route(&request_with_fallbacks(&[]), &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn open_circuit_is_skipped_and_half_open_success_closes_it() {
        let openai = ScriptedAdapter::new(
            ProviderId::OpenAI,
            OPENAI_MODELS,
            vec![Step::Fail(500), Step::Fail(500), Step::Fail(500)],
        );
        let anthropic = ScriptedAdapter::new(ProviderId::Anthropic, ANTHROPIC_MODELS, vec![]);
        let h = harness(
            vec![openai.clone(), anthropic.clone()],
            Options {
                threshold: 3,
                ..Default::default()
            },
        );
        let req = request_with_fallbacks(&["claude-3-haiku"]);

        let (_, meta) = h.engine.route(&req, &ctx()).await.unwrap();
        assert_eq!(meta.provider, "anthropic");
        assert_eq!(h.events.kinds(), vec![EventKind::CircuitOpen]);

        // 熔断期间不再调用 openai
        let (_, meta) = h.engine.route(&req, &ctx()).await.unwrap();
        assert_eq!(meta.provider, "anthropic");
        assert_eq!(openai.calls(), 3);

        // 冷却结束后进入半开，探测成功即关闭
        h.clock.advance(60_000);
        let (_, meta) = h.engine.route(&req, &ctx()).await.unwrap();
        assert_eq!(meta.provider, "openai");
        assert_eq!(openai.calls(), 4);
        assert_eq!(
            h.events.kinds(),
            vec![EventKind::CircuitOpen, EventKind::CircuitClosed]
        );
        assert_eq!(h.breaker.state(ProviderId::OpenAI).await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn buffered_stream_only_forwards_winning_candidate() {
        let openai = ScriptedAdapter::new(
            ProviderId::OpenAI,
            OPENAI_MODELS,
            vec![
                Step::PartialThenFail("garbage ", 500),
                Step::PartialThenFail("garbage ", 500),
                Step::PartialThenFail("garbage ", 500),
            ],
        );
        let anthropic = ScriptedAdapter::new(
            ProviderId::Anthropic,
            ANTHROPIC_MODELS,
            vec![Step::Reply("Hello there")],
        );
        let h = harness(vec![openai.clone(), anthropic.clone()], Options::default());

        let mut out: Vec<StreamChunk> = Vec::new();
        let (usage, meta) = h
            .engine
            .route_stream(&request_with_fallbacks(&["claude-3-haiku"]), &ctx(), &mut out)
            .await
            .unwrap();
        let text: String = out.iter().map(StreamChunk::text).collect();
        assert_eq!(text, "Hello there");
        assert!(out.iter().all(|c| c.model == "claude-3-haiku"));
        assert_eq!(usage, Some(Usage::new(2, 2)));
        assert_eq!(meta.fallback_provider.as_deref(), Some("anthropic"));
        assert_eq!(meta.total_tokens, Some(4));
    }

    #[tokio::test]
    async fn first_chunk_mode_commits_after_forwarding() {
        let openai = ScriptedAdapter::new(
            ProviderId::OpenAI,
            OPENAI_MODELS,
            vec![Step::PartialThenFail("par", 500)],
        );
        let anthropic = ScriptedAdapter::new(ProviderId::Anthropic, ANTHROPIC_MODELS, vec![]);
        let mut opts = Options::default();
        opts.providers.stream_mode = StreamMode::FirstChunk;
        let h = harness(vec![openai.clone(), anthropic.clone()], opts);

        let mut out: Vec<StreamChunk> = Vec::new();
        let failure = h
            .engine
            .route_stream(&request_with_fallbacks(&["claude-3-haiku"]), &ctx(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, GatewayError::ChainExhausted { .. }));
        assert_eq!(out.len(), 1);
        assert_eq!(openai.calls(), 1);
        assert_eq!(anthropic.calls(), 0);
        assert_eq!(failure.metadata.provider, "openai");
    }

    #[tokio::test]
    async fn first_chunk_mode_still_falls_back_before_any_output() {
        let openai = ScriptedAdapter::new(
            ProviderId::OpenAI,
            OPENAI_MODELS,
            vec![Step::Fail(401)],
        );
        let anthropic =
            ScriptedAdapter::new(ProviderId::Anthropic, ANTHROPIC_MODELS, vec![Step::Reply("hi")]);
        let mut opts = Options::default();
        opts.providers.stream_mode = StreamMode::FirstChunk;
        let h = harness(vec![openai.clone(), anthropic.clone()], opts);

        let mut out: Vec<StreamChunk> = Vec::new();
        let (_, meta) = h
            .engine
            .route_stream(&request_with_fallbacks(&["claude-3-haiku"]), &ctx(), &mut out)
            .await
            .unwrap();
        assert_eq!(meta.provider, "anthropic");
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn total_deadline_bounds_the_chain() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![Step::Hang]);
        let anthropic = ScriptedAdapter::new(ProviderId::Anthropic, ANTHROPIC_MODELS, vec![]);
        let mut opts = Options::default();
        opts.providers.timeout_ms = 10_000;
        opts.providers.total_deadline_ms = Some(50);
        let h = harness(vec![openai.clone(), anthropic.clone()], opts);

        let started = std::time::Instant::now();
        let failure = h
            .engine
            .route(&request_with_fallbacks(&["claude-3-haiku"]), &ctx())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(failure.error.to_string().contains("timed out"), "{}", failure.error);
        assert_eq!(openai.calls(), 1);
        assert_eq!(anthropic.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_aborts_without_penalty() {
        let openai = ScriptedAdapter::new(ProviderId::OpenAI, OPENAI_MODELS, vec![Step::Hang]);
        let h = harness(vec![openai.clone()], Options::default());
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let failure = h.engine.route(&request_with_fallbacks(&[]), &ctx).await.unwrap_err();
        assert_eq!(failure.metadata.status_code, 499);
        assert_eq!(failures(&h.breaker, ProviderId::OpenAI).await, 0);
        assert!(h.events.kinds().is_empty());
    }
}
