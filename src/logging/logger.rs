use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot};

use super::store::RequestLogStore;
use super::types::{BodyLogFile, LogEntry};
use crate::config::LoggingConfig;
use crate::error::Result;
use crate::providers::{ChatCompletionRequest, ChatCompletionResponse};
use crate::routing::RequestMetadata;

enum Message {
    Entry(Box<LogEntry>),
    Flush(oneshot::Sender<()>),
}

/// 请求遥测的异步写入端。
///
/// `append` 只把记录塞进无界队列，单个后台 worker 按到达顺序写入存储，
/// 存储或文件写入失败只记 `tracing` 日志。
#[derive(Clone)]
pub struct RequestLogger {
    tx: mpsc::UnboundedSender<Message>,
    store: Arc<dyn RequestLogStore>,
}

impl RequestLogger {
    /// 需要在 tokio 运行时内调用
    pub fn spawn(store: Arc<dyn RequestLogStore>, config: &LoggingConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let body_dir = config.log_bodies.then(|| PathBuf::from(&config.log_dir));
        tokio::spawn(run_worker(rx, store.clone(), body_dir));
        Self { tx, store }
    }

    pub fn append(
        &self,
        metadata: RequestMetadata,
        request: Option<ChatCompletionRequest>,
        response: Option<ChatCompletionResponse>,
    ) {
        let request_id = metadata.request_id.clone();
        let entry = LogEntry {
            metadata,
            request,
            response,
        };
        if self.tx.send(Message::Entry(Box::new(entry))).is_err() {
            tracing::error!(request_id = %request_id, "request log worker has stopped, entry dropped");
        }
    }

    /// 等待此前投递的记录全部写完
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestLogStore> {
        &self.store
    }

    pub async fn cleanup_old_logs(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.store.cleanup(cutoff).await
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Message>,
    store: Arc<dyn RequestLogStore>,
    body_dir: Option<PathBuf>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Entry(entry) => {
                if let Err(e) = store.append(&entry.metadata).await {
                    tracing::error!(
                        request_id = %entry.metadata.request_id,
                        "Failed to log request: {}", e
                    );
                }
                if let Some(dir) = &body_dir {
                    if let Err(e) = write_body_file(dir, &entry).await {
                        tracing::error!(
                            request_id = %entry.metadata.request_id,
                            "Failed to write request body log: {}", e
                        );
                    }
                }
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("request log worker stopped");
}

/// `<dir>/<YYYY-MM-DD>/<request_id>.json`，日期取请求开始时间
async fn write_body_file(dir: &std::path::Path, entry: &LogEntry) -> Result<PathBuf> {
    let started = DateTime::from_timestamp_millis(entry.metadata.start_time).unwrap_or_else(Utc::now);
    let day_dir = dir.join(started.format("%Y-%m-%d").to_string());
    tokio::fs::create_dir_all(&day_dir).await?;

    let file = BodyLogFile {
        metadata: &entry.metadata,
        request: entry.request.as_ref(),
        response: entry.response.as_ref(),
        timestamp: Utc::now().to_rfc3339(),
    };
    let path = day_dir.join(format!("{}.json", entry.metadata.request_id));
    tokio::fs::write(&path, serde_json::to_vec_pretty(&file)?).await?;
    Ok(path)
}
