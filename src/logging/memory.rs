use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::RequestLogStore;
use super::types::{RequestLog, RequestStats};
use crate::error::Result;
use crate::routing::RequestMetadata;

/// 进程内日志存储，测试和无盘部署用
#[derive(Default)]
pub struct MemoryLogStore {
    logs: Mutex<Vec<RequestLog>>,
}

#[allow(dead_code)]
impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按写入顺序返回全部记录
    pub fn entries(&self) -> Vec<RequestMetadata> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|log| log.metadata.clone())
            .collect()
    }

    pub fn insert_at(&self, metadata: RequestMetadata, created_at: DateTime<Utc>) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let id = logs.len() as i64 + 1;
        logs.push(RequestLog {
            id,
            created_at,
            metadata,
        });
    }
}

#[async_trait]
impl RequestLogStore for MemoryLogStore {
    async fn append(&self, metadata: &RequestMetadata) -> Result<()> {
        self.insert_at(metadata.clone(), Utc::now());
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<RequestLog>> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(logs.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn stats(&self, api_key_id: &str, since: DateTime<Utc>) -> Result<RequestStats> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<&RequestMetadata> = logs
            .iter()
            .filter(|log| log.created_at >= since && log.metadata.api_key_id == api_key_id)
            .map(|log| &log.metadata)
            .collect();

        let total = matching.len() as u64;
        if total == 0 {
            return Ok(RequestStats::default());
        }
        let errors = matching.iter().filter(|m| m.status_code >= 400).count();
        let latency: i64 = matching.iter().map(|m| m.latency_ms.unwrap_or(0)).sum();
        Ok(RequestStats {
            total_requests: total,
            total_tokens: matching.iter().map(|m| m.total_tokens.unwrap_or(0) as u64).sum(),
            total_cost: matching.iter().map(|m| m.cost.unwrap_or(0.0)).sum(),
            avg_latency: latency as f64 / total as f64,
            error_rate: errors as f64 / total as f64,
        })
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let before = logs.len();
        logs.retain(|log| log.created_at >= cutoff);
        Ok((before - logs.len()) as u64)
    }
}
