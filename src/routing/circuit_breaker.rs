use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::CircuitBreakerConfig;
use crate::providers::ProviderId;
use crate::store::{KvStore, StoreError};

const CIRCUIT_PREFIX: &str = "circuit:";
const PROBE_PREFIX: &str = "circuit-probe:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure: Option<i64>,
    pub open_until: Option<i64>,
}

impl CircuitStatus {
    pub fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            open_until: None,
        }
    }

    /// 状态完全由存储的字段和当前时间推导，不依赖后台定时器
    pub fn derive(fields: &HashMap<String, String>, now_ms: i64) -> Self {
        if fields.is_empty() {
            return Self::closed();
        }
        let int = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());
        let failures = int("failures").unwrap_or(0).max(0) as u32;
        let last_failure = int("lastFailure");
        let open_until = int("openUntil");

        match open_until {
            Some(until) if now_ms < until => Self {
                state: CircuitState::Open,
                failures,
                last_failure,
                open_until,
            },
            Some(_) => Self {
                state: CircuitState::HalfOpen,
                failures,
                last_failure,
                open_until,
            },
            None => Self {
                state: CircuitState::Closed,
                failures,
                last_failure,
                open_until: None,
            },
        }
    }
}

/// 每个 provider 一个失败计数器，状态存放在共享存储里，多实例共享
pub struct CircuitBreaker {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    threshold: u32,
    timeout_ms: u64,
    single_probe: bool,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock, config: &CircuitBreakerConfig) -> Self {
        Self {
            store,
            clock,
            threshold: config.threshold.max(1),
            timeout_ms: config.timeout_ms,
            single_probe: config.half_open_single_probe,
        }
    }

    fn key(provider: ProviderId) -> String {
        format!("{CIRCUIT_PREFIX}{provider}")
    }

    fn probe_key(provider: ProviderId) -> String {
        format!("{PROBE_PREFIX}{provider}")
    }

    /// 失败记录的存活时间：冷却时间（向上取整到秒）的两倍，长时间无失败则自动复位
    fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.timeout_ms.div_ceil(1000).max(1) * 2)
    }

    pub async fn state(&self, provider: ProviderId) -> Result<CircuitStatus, StoreError> {
        let fields = self.store.hash_get_all(&Self::key(provider)).await?;
        Ok(CircuitStatus::derive(&fields, self.clock.now_ms()))
    }

    pub async fn record_failure(&self, provider: ProviderId) -> Result<CircuitStatus, StoreError> {
        let key = Self::key(provider);
        let now = self.clock.now_ms();
        let failures = self
            .store
            .hash_incr(
                &key,
                "failures",
                &[("lastFailure", now.to_string())],
                self.failure_ttl(),
            )
            .await?;
        let failures = failures.max(0) as u32;

        if failures >= self.threshold {
            let open_until = now + self.timeout_ms as i64;
            self.store
                .hash_set(&key, &[("openUntil", open_until.to_string())])
                .await?;
            if self.single_probe {
                self.store.delete(&Self::probe_key(provider)).await?;
            }
            tracing::warn!(
                provider = %provider,
                failures,
                open_until,
                "circuit breaker open"
            );
            return Ok(CircuitStatus {
                state: CircuitState::Open,
                failures,
                last_failure: Some(now),
                open_until: Some(open_until),
            });
        }

        Ok(CircuitStatus {
            state: CircuitState::Closed,
            failures,
            last_failure: Some(now),
            open_until: None,
        })
    }

    /// 成功即完全复位；返回复位前的状态
    pub async fn record_success(&self, provider: ProviderId) -> Result<CircuitStatus, StoreError> {
        let previous = self.state(provider).await?;
        if previous.failures > 0 || previous.open_until.is_some() {
            self.store.delete(&Self::key(provider)).await?;
        }
        if self.single_probe && previous.state != CircuitState::Closed {
            self.store.delete(&Self::probe_key(provider)).await?;
        }
        Ok(previous)
    }

    /// 仅在严格处于 open 时拒绝；开启单探测时，半开状态只有抢到探测名额的请求可以通过
    pub async fn can_attempt(&self, provider: ProviderId) -> Result<bool, StoreError> {
        let status = self.state(provider).await?;
        match status.state {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => Ok(false),
            CircuitState::HalfOpen if !self.single_probe => Ok(true),
            CircuitState::HalfOpen => {
                self.store
                    .set_nx_ex(
                        &Self::probe_key(provider),
                        self.clock.now_ms().to_string(),
                        Duration::from_millis(self.timeout_ms.max(1000)),
                    )
                    .await
            }
        }
    }

    pub async fn reset(&self, provider: ProviderId) -> Result<(), StoreError> {
        self.store.delete(&Self::key(provider)).await?;
        self.store.delete(&Self::probe_key(provider)).await
    }

    pub async fn all_states(&self) -> Result<Vec<(ProviderId, CircuitStatus)>, StoreError> {
        let mut out = Vec::with_capacity(ProviderId::ALL.len());
        for provider in ProviderId::ALL {
            out.push((provider, self.state(provider).await?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn breaker(single_probe: bool) -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let config = CircuitBreakerConfig {
            threshold: 3,
            timeout_ms: 10_000,
            half_open_single_probe: single_probe,
        };
        (clock.clone(), CircuitBreaker::new(store, clock, &config))
    }

    #[tokio::test]
    async fn opens_after_threshold_and_half_opens_by_time() {
        let (clock, cb) = breaker(false);
        let p = ProviderId::OpenAI;

        for _ in 0..2 {
            assert_eq!(cb.record_failure(p).await.unwrap().state, CircuitState::Closed);
            assert!(cb.can_attempt(p).await.unwrap());
        }
        let status = cb.record_failure(p).await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failures, 3);
        assert!(!cb.can_attempt(p).await.unwrap());

        clock.advance(9_999);
        assert!(!cb.can_attempt(p).await.unwrap());
        clock.advance(1);
        assert_eq!(cb.state(p).await.unwrap().state, CircuitState::HalfOpen);
        assert!(cb.can_attempt(p).await.unwrap());
        assert!(cb.can_attempt(p).await.unwrap());
    }

    #[tokio::test]
    async fn success_fully_resets() {
        let (_clock, cb) = breaker(false);
        let p = ProviderId::Anthropic;
        for _ in 0..3 {
            cb.record_failure(p).await.unwrap();
        }
        let previous = cb.record_success(p).await.unwrap();
        assert_eq!(previous.state, CircuitState::Open);
        assert_eq!(cb.state(p).await.unwrap(), CircuitStatus::closed());

        // 复位后需要重新累计到阈值
        cb.record_failure(p).await.unwrap();
        assert!(cb.can_attempt(p).await.unwrap());
    }

    #[tokio::test]
    async fn idle_failures_expire() {
        let (clock, cb) = breaker(false);
        let p = ProviderId::Google;
        cb.record_failure(p).await.unwrap();
        cb.record_failure(p).await.unwrap();
        clock.advance(20_000);
        assert_eq!(cb.state(p).await.unwrap(), CircuitStatus::closed());
        assert_eq!(cb.record_failure(p).await.unwrap().failures, 1);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let (clock, cb) = breaker(false);
        let p = ProviderId::Groq;
        for _ in 0..3 {
            cb.record_failure(p).await.unwrap();
        }
        clock.advance(10_000);
        assert!(cb.can_attempt(p).await.unwrap());
        assert_eq!(cb.record_failure(p).await.unwrap().state, CircuitState::Open);
        assert!(!cb.can_attempt(p).await.unwrap());
    }

    #[tokio::test]
    async fn single_probe_gate_admits_one_caller() {
        let (clock, cb) = breaker(true);
        let p = ProviderId::Mistral;
        for _ in 0..3 {
            cb.record_failure(p).await.unwrap();
        }
        clock.advance(10_000);
        assert!(cb.can_attempt(p).await.unwrap());
        assert!(!cb.can_attempt(p).await.unwrap());

        cb.record_success(p).await.unwrap();
        assert!(cb.can_attempt(p).await.unwrap());
        assert!(cb.can_attempt(p).await.unwrap());
    }

    #[tokio::test]
    async fn all_states_lists_every_provider() {
        let (_clock, cb) = breaker(false);
        cb.record_failure(ProviderId::Cohere).await.unwrap();
        let states = cb.all_states().await.unwrap();
        assert_eq!(states.len(), ProviderId::ALL.len());
        let cohere = states.iter().find(|(p, _)| *p == ProviderId::Cohere).unwrap();
        assert_eq!(cohere.1.failures, 1);

        cb.reset(ProviderId::Cohere).await.unwrap();
        assert_eq!(cb.state(ProviderId::Cohere).await.unwrap().failures, 0);
    }

    #[test]
    fn serialized_state_uses_kebab_case() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("half-open")
        );
    }
}
