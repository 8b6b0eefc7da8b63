use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{KvStore, StoreError};
use crate::clock::SharedClock;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// 写路径上整表扫描过期项的最小间隔
const SWEEP_INTERVAL_MS: i64 = 60_000;

/// 单进程内存实现：一把锁覆盖整张表，批量操作天然原子。
/// 过期项在访问时惰性清理，写入时再按间隔整表清扫一次，
/// 带窗口号的限流键不会再被读到，只能靠清扫回收。
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    last_sweep_ms: AtomicI64,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            entries: Mutex::new(HashMap::new()),
            last_sweep_ms: AtomicI64::new(now),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 写操作用的加锁入口，顺带做周期清扫
    fn lock_for_write(&self, now_ms: i64) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        let mut map = self.lock();
        // 持锁读写，Relaxed 足够
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms - last >= SWEEP_INTERVAL_MS {
            let before = map.len();
            map.retain(|_, e| !e.is_expired(now_ms));
            self.last_sweep_ms.store(now_ms, Ordering::Relaxed);
            let swept = before - map.len();
            if swept > 0 {
                tracing::debug!(swept, held = map.len(), "memory store sweep");
            }
        }
        map
    }

    #[cfg(test)]
    fn held_entries(&self) -> usize {
        self.lock().len()
    }

    fn deadline(&self, now_ms: i64, ttl: Duration) -> Option<i64> {
        Some(now_ms + ttl.as_millis() as i64)
    }
}

fn purge_if_expired(map: &mut HashMap<String, Entry>, key: &str, now_ms: i64) {
    if map.get(key).is_some_and(|e| e.is_expired(now_ms)) {
        map.remove(key);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn incr_batch(&self, ops: &[(String, Duration)]) -> Result<Vec<i64>, StoreError> {
        let now = self.clock.now_ms();
        let mut map = self.lock_for_write(now);

        // 先整体校验类型，保证批次内不会出现"部分自增"
        for (key, _) in ops {
            purge_if_expired(&mut map, key, now);
            if let Some(entry) = map.get(key) {
                if !matches!(entry.value, Value::Counter(_)) {
                    return Err(StoreError::WrongType(key.clone()));
                }
            }
        }

        let mut out = Vec::with_capacity(ops.len());
        for (key, ttl) in ops {
            let deadline = self.deadline(now, *ttl);
            let entry = map.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Counter(0),
                expires_at_ms: deadline,
            });
            if let Value::Counter(n) = &mut entry.value {
                *n += 1;
                out.push(*n);
            }
        }
        Ok(out)
    }

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        also_set: &[(&str, String)],
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        let deadline = self.deadline(now, ttl);
        let mut map = self.lock_for_write(now);
        purge_if_expired(&mut map, key, now);

        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at_ms: deadline,
        });
        let Value::Hash(fields) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };

        let current = match fields.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StoreError::Corrupt(format!("{key}.{field}")))?,
            None => 0,
        };
        let next = current + 1;
        fields.insert(field.to_string(), next.to_string());
        for (f, v) in also_set {
            fields.insert((*f).to_string(), v.clone());
        }
        entry.expires_at_ms = deadline;
        Ok(next)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut map = self.lock();
        purge_if_expired(&mut map, key, now);

        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at_ms: None,
        });
        let Value::Hash(existing) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        for (f, v) in fields {
            existing.insert((*f).to_string(), v.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let now = self.clock.now_ms();
        let mut map = self.lock();
        purge_if_expired(&mut map, key, now);
        match map.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        let mut map = self.lock();
        purge_if_expired(&mut map, key, now);
        match map.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string())),
            Some(Value::Hash(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut map = self.lock_for_write(now);
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value),
                expires_at_ms: self.deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut map = self.lock_for_write(now);
        purge_if_expired(&mut map, key, now);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value),
                expires_at_ms: self.deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let mut map = self.lock();
        let before = map.len();
        let mut removed_live = 0u64;
        map.retain(|k, e| {
            if !k.starts_with(prefix) {
                return true;
            }
            if !e.is_expired(now) {
                removed_live += 1;
            }
            false
        });
        tracing::debug!(prefix, removed = before - map.len(), "memory store prefix delete");
        Ok(removed_live)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let map = self.lock();
        Ok(map
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .count() as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
