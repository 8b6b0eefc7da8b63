use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Result, Row};
use tokio::sync::Mutex;

use super::store::RequestLogStore;
use super::types::{RequestLog, RequestStats};
use crate::error::GatewayError;
use crate::routing::RequestMetadata;

const SELECT_COLUMNS: &str = "id, created_at, request_id, api_key_id, provider, model,
    start_time, end_time, latency_ms, input_tokens, output_tokens, total_tokens, cost,
    cached, fallback_used, fallback_provider, status_code, error_message, ip_address, user_agent";

#[derive(Clone)]
pub struct DatabaseLogger {
    connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("Failed to create directory: {}", e)),
                    ));
                }
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);
        Self::init(conn)
    }

    #[allow(dead_code)]
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                request_id TEXT NOT NULL,
                api_key_id TEXT,
                provider TEXT,
                model TEXT,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER,
                output_tokens INTEGER,
                total_tokens INTEGER,
                cost REAL,
                cached INTEGER NOT NULL DEFAULT 0,
                fallback_used INTEGER NOT NULL DEFAULT 0,
                fallback_provider TEXT,
                status_code INTEGER NOT NULL,
                error_message TEXT,
                ip_address TEXT,
                user_agent TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_request_logs_key_time
                ON request_logs (api_key_id, created_at);",
        )?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn log_request(&self, metadata: &RequestMetadata, created_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.connection.lock().await;

        conn.execute(
            "INSERT INTO request_logs (
                created_at, request_id, api_key_id, provider, model,
                start_time, end_time, latency_ms, input_tokens, output_tokens,
                total_tokens, cost, cached, fallback_used, fallback_provider,
                status_code, error_message, ip_address, user_agent
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            rusqlite::params![
                to_db_time(&created_at),
                &metadata.request_id,
                &metadata.api_key_id,
                &metadata.provider,
                &metadata.model,
                metadata.start_time,
                metadata.end_time,
                metadata.latency_ms.unwrap_or(0),
                metadata.input_tokens,
                metadata.output_tokens,
                metadata.total_tokens,
                metadata.cost,
                metadata.cached,
                metadata.fallback_used,
                &metadata.fallback_provider,
                metadata.status_code,
                &metadata.error_message,
                &metadata.ip_address,
                &metadata.user_agent,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub async fn recent_logs(&self, limit: u32) -> Result<Vec<RequestLog>> {
        let conn = self.connection.lock().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM request_logs ORDER BY id DESC LIMIT ?1"
        ))?;
        let log_iter = stmt.query_map([limit], row_to_log)?;

        let mut logs = Vec::new();
        for log in log_iter {
            logs.push(log?);
        }
        Ok(logs)
    }

    pub async fn request_stats(&self, api_key_id: &str, since: DateTime<Utc>) -> Result<RequestStats> {
        let conn = self.connection.lock().await;

        let (total, tokens, cost, avg_latency, errors): (i64, i64, f64, f64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost), 0.0),
                    COALESCE(AVG(latency_ms), 0.0),
                    COALESCE(SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), 0)
             FROM request_logs
             WHERE api_key_id = ?1 AND created_at >= ?2",
            (api_key_id, to_db_time(&since)),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        Ok(RequestStats {
            total_requests: total.max(0) as u64,
            total_tokens: tokens.max(0) as u64,
            total_cost: cost,
            avg_latency,
            error_rate: if total > 0 { errors as f64 / total as f64 } else { 0.0 },
        })
    }

    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.connection.lock().await;
        let removed = conn.execute(
            "DELETE FROM request_logs WHERE created_at < ?1",
            [to_db_time(&cutoff)],
        )?;
        tracing::info!("Cleaned up {} old log entries", removed);
        Ok(removed as u64)
    }
}

/// 固定毫秒精度的 UTC 字符串，保证字典序与时间序一致
fn to_db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_log(row: &Row<'_>) -> Result<RequestLog> {
    let created_at: String = row.get(1)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(RequestLog {
        id: row.get(0)?,
        created_at,
        metadata: RequestMetadata {
            request_id: row.get(2)?,
            api_key_id: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            provider: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            model: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            latency_ms: row.get(8)?,
            input_tokens: row.get(9)?,
            output_tokens: row.get(10)?,
            total_tokens: row.get(11)?,
            cost: row.get(12)?,
            cached: row.get(13)?,
            fallback_used: row.get(14)?,
            fallback_provider: row.get(15)?,
            status_code: row.get(16)?,
            error_message: row.get(17)?,
            ip_address: row.get(18)?,
            user_agent: row.get(19)?,
        },
    })
}

#[async_trait]
impl RequestLogStore for DatabaseLogger {
    async fn append(&self, metadata: &RequestMetadata) -> std::result::Result<(), GatewayError> {
        self.log_request(metadata, Utc::now()).await?;
        Ok(())
    }

    async fn recent(&self, limit: u32) -> std::result::Result<Vec<RequestLog>, GatewayError> {
        Ok(self.recent_logs(limit).await?)
    }

    async fn stats(
        &self,
        api_key_id: &str,
        since: DateTime<Utc>,
    ) -> std::result::Result<RequestStats, GatewayError> {
        Ok(self.request_stats(api_key_id, since).await?)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> std::result::Result<u64, GatewayError> {
        Ok(self.cleanup_before(cutoff).await?)
    }
}
