use std::ops::ControlFlow;

use futures_util::{Stream, StreamExt};
use reqwest_eventsource::{Event, EventSource};

use super::error::{ProviderError, describe_error_body};
use super::types::StreamChunk;
use super::{ProviderId, RequestOptions};

/// 接收流式 chunk 的一端；路由层决定是直接转发还是先缓冲
pub trait ChunkSink: Send {
    fn push(&mut self, chunk: StreamChunk);
}

impl ChunkSink for Vec<StreamChunk> {
    fn push(&mut self, chunk: StreamChunk) {
        Vec::push(self, chunk);
    }
}

/// 行缓冲：网络读到的字节不保证按行对齐，不完整的尾部留到下一次
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段字节，返回其中已完整的行（去掉 `\r\n` / `\n`，跳过空行）
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// 流结束时剩下的最后一行（没有换行结尾）
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() { None } else { Some(line) }
    }
}

enum Next<T> {
    Cancelled,
    TimedOut,
    Item(Option<T>),
}

/// 从流里取下一项，受请求的取消信号和整体截止点约束（不是空闲超时，每次事件不会续期）
async fn next_or_deadline<S, T>(stream: &mut S, opts: &RequestOptions) -> Next<T>
where
    S: Stream<Item = T> + Unpin,
{
    tokio::select! {
        biased;
        _ = opts.cancel.cancelled() => Next::Cancelled,
        _ = tokio::time::sleep_until(opts.deadline()) => Next::TimedOut,
        item = stream.next() => Next::Item(item),
    }
}

/// 驱动一个 SSE 连接直到 `[DONE]`、回调要求结束或连接关闭。
///
/// 回调收到 `(event, data)`；整条流必须在 `opts.deadline()` 之前结束。
pub(crate) async fn drive_event_source<F>(
    provider: ProviderId,
    mut es: EventSource,
    opts: &RequestOptions,
    mut on_message: F,
) -> Result<(), ProviderError>
where
    F: FnMut(&str, &str) -> Result<ControlFlow<()>, ProviderError> + Send,
{
    es.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

    let result = loop {
        let item = match next_or_deadline(&mut es, opts).await {
            Next::Cancelled => break Err(ProviderError::cancelled(provider)),
            Next::TimedOut => break Err(ProviderError::timeout(provider, opts.timeout)),
            Next::Item(item) => item,
        };

        match item {
            None => break Ok(()),
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(m))) => {
                if m.data.trim() == "[DONE]" {
                    break Ok(());
                }
                match on_message(&m.event, &m.data) {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            Some(Err(reqwest_eventsource::Error::StreamEnded)) => break Ok(()),
            Some(Err(e)) => break Err(map_eventsource_error(provider, e).await),
        }
    };

    es.close();
    result
}

async fn map_eventsource_error(
    provider: ProviderId,
    err: reqwest_eventsource::Error,
) -> ProviderError {
    use reqwest_eventsource::Error as EsError;
    match err {
        EsError::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            ProviderError::status(provider, status.as_u16(), describe_error_body(status, &body))
        }
        EsError::InvalidContentType(content_type, response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return ProviderError::status(
                    provider,
                    status.as_u16(),
                    describe_error_body(status, &body),
                );
            }
            ProviderError::decode(
                provider,
                format!(
                    "expected text/event-stream, got {}",
                    content_type.to_str().unwrap_or("<binary>")
                ),
            )
        }
        EsError::Transport(e) => ProviderError::from_reqwest(provider, e),
        other => ProviderError::decode(provider, other.to_string()),
    }
}

/// 按行分隔的 JSON 流（Cohere 原生格式）
pub(crate) async fn drive_ndjson<F>(
    provider: ProviderId,
    response: reqwest::Response,
    opts: &RequestOptions,
    mut on_line: F,
) -> Result<(), ProviderError>
where
    F: FnMut(&str) -> Result<ControlFlow<()>, ProviderError> + Send,
{
    let mut bytes = Box::pin(response.bytes_stream());
    let mut buffer = LineBuffer::new();

    loop {
        let item = match next_or_deadline(&mut bytes, opts).await {
            Next::Cancelled => return Err(ProviderError::cancelled(provider)),
            Next::TimedOut => return Err(ProviderError::timeout(provider, opts.timeout)),
            Next::Item(item) => item,
        };

        let Some(chunk) = item else {
            break;
        };
        let chunk = chunk.map_err(|e| ProviderError::from_reqwest(provider, e))?;
        for line in buffer.feed(&chunk) {
            if on_line(&line)?.is_break() {
                return Ok(());
            }
        }
    }

    if let Some(line) = buffer.finish() {
        on_line(&line)?;
    }
    Ok(())
}
