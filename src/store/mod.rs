pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("key '{0}' holds a value of the wrong type")]
    WrongType(String),
    #[error("corrupt value under '{0}'")]
    Corrupt(String),
}

/// 限流、熔断、响应缓存共用的键值存储。
///
/// 所有计数类操作都必须是原子的（同一批次内要么全部生效，要么全部不生效），
/// 不允许"先读后写"式的实现，否则并发请求下会丢失增量。
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 在同一个原子批次里对每个 key 自增 1，并给每个 key 设置各自的过期时间；按顺序返回自增后的值。
    async fn incr_batch(&self, ops: &[(String, Duration)]) -> Result<Vec<i64>, StoreError>;

    /// 原子地：hash 字段自增 1、写入附带字段、刷新整个 key 的过期时间。返回自增后的值。
    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        also_set: &[(&str, String)],
        ttl: Duration,
    ) -> Result<i64, StoreError>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// 仅当 key 不存在时写入；返回是否写入成功
    async fn set_nx_ex(&self, key: &str, value: String, ttl: Duration)
    -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    async fn count_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}
