use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::store::{KvStore, StoreError};

const MINUTE_TTL: Duration = Duration::from_secs(60);
/// 跨月边界留出时钟偏差余量
const MONTH_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 35);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub monthly_requests: u64,
    pub requests_per_minute: u64,
    pub log_retention_days: u32,
}

impl PlanLimits {
    pub const FREE: PlanLimits = PlanLimits {
        monthly_requests: 50_000,
        requests_per_minute: 60,
        log_retention_days: 7,
    };
    pub const STARTER: PlanLimits = PlanLimits {
        monthly_requests: 500_000,
        requests_per_minute: 60,
        log_retention_days: 30,
    };
    pub const GROWTH: PlanLimits = PlanLimits {
        monthly_requests: 5_000_000,
        requests_per_minute: 60,
        log_retention_days: 90,
    };
    pub const ENTERPRISE: PlanLimits = PlanLimits {
        monthly_requests: 25_000_000,
        requests_per_minute: 60,
        log_retention_days: 365,
    };

    /// 未知套餐按 FREE 处理
    pub fn for_plan(plan: &str) -> PlanLimits {
        match plan.to_ascii_uppercase().as_str() {
            "STARTER" => Self::STARTER,
            "GROWTH" => Self::GROWTH,
            "ENTERPRISE" => Self::ENTERPRISE,
            _ => Self::FREE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub minute_limit: u64,
    pub minute_remaining: u64,
    /// 当前分钟窗口结束的 unix 秒
    pub minute_reset: i64,
    pub monthly_limit: u64,
    pub monthly_remaining: u64,
    /// 下个 UTC 自然月开始的 unix 秒
    pub monthly_reset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
    /// 拒绝原因是月度配额；由 `check` 在判定分支里设置
    #[serde(skip)]
    pub monthly_exceeded: bool,
}

impl RateLimitResult {
    /// 被月度配额拒绝（而不是分钟窗口）
    pub fn monthly_exhausted(&self) -> bool {
        !self.allowed && self.monthly_exceeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub minute_count: u64,
    pub monthly_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaAlerts {
    pub alert80: bool,
    pub alert100: bool,
}

/// 固定窗口计数：分钟桶 + 自然月桶，两个计数在同一个原子批次里自增
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_ms()).unwrap_or_default()
    }

    fn keys(api_key_id: &str, now: &DateTime<Utc>) -> (String, String) {
        let window = now.timestamp_millis().div_euclid(60_000);
        (
            format!("ratelimit:minute:{api_key_id}:{window}"),
            format!("ratelimit:monthly:{api_key_id}:{}", now.format("%Y-%m")),
        )
    }

    pub async fn check(&self, api_key_id: &str, plan: &str) -> Result<RateLimitResult, StoreError> {
        let limits = PlanLimits::for_plan(plan);
        let now = self.now();
        let (minute_key, monthly_key) = Self::keys(api_key_id, &now);

        let counts = self
            .store
            .incr_batch(&[(minute_key, MINUTE_TTL), (monthly_key, MONTH_TTL)])
            .await?;
        let minute_count = counts.first().copied().unwrap_or(0).max(0) as u64;
        let monthly_count = counts.get(1).copied().unwrap_or(0).max(0) as u64;

        let now_s = now.timestamp();
        let window = now.timestamp_millis().div_euclid(60_000);
        let minute_reset = (window + 1) * 60;
        let monthly_reset = next_month_start(&now);

        let mut result = RateLimitResult {
            allowed: true,
            minute_limit: limits.requests_per_minute,
            minute_remaining: limits.requests_per_minute.saturating_sub(minute_count),
            minute_reset,
            monthly_limit: limits.monthly_requests,
            monthly_remaining: limits.monthly_requests.saturating_sub(monthly_count),
            monthly_reset,
            retry_after: None,
            monthly_exceeded: false,
        };

        // 先判分钟窗口，与月度剩余无关
        if minute_count > limits.requests_per_minute {
            result.allowed = false;
            result.minute_remaining = 0;
            result.retry_after = Some(60 - now_s.rem_euclid(60));
        } else if monthly_count > limits.monthly_requests {
            result.allowed = false;
            result.monthly_remaining = 0;
            result.monthly_exceeded = true;
            result.retry_after = Some(monthly_reset - now_s);
        }

        if !result.allowed {
            tracing::debug!(
                api_key_id,
                minute_count,
                monthly_count,
                retry_after = result.retry_after,
                "rate limited"
            );
        }
        Ok(result)
    }

    pub async fn usage(&self, api_key_id: &str) -> Result<UsageStats, StoreError> {
        let (minute_key, monthly_key) = Self::keys(api_key_id, &self.now());
        let read = |v: Option<String>| v.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        Ok(UsageStats {
            minute_count: read(self.store.get(&minute_key).await?),
            monthly_count: read(self.store.get(&monthly_key).await?),
        })
    }

    pub async fn quota_alerts(&self, api_key_id: &str, plan: &str) -> Result<QuotaAlerts, StoreError> {
        let limits = PlanLimits::for_plan(plan);
        let usage = self.usage(api_key_id).await?;
        Ok(quota_alerts_for(usage.monthly_count, limits.monthly_requests))
    }

    /// 每个 key 每个自然月每个级别只通知一次；返回本次是否拿到通知权
    pub async fn claim_quota_alert(&self, api_key_id: &str, level: &str) -> Result<bool, StoreError> {
        let now = self.now();
        let key = format!("quota-alert:{level}:{api_key_id}:{}", now.format("%Y-%m"));
        self.store.set_nx_ex(&key, "1".to_string(), MONTH_TTL).await
    }
}

fn quota_alerts_for(used: u64, limit: u64) -> QuotaAlerts {
    if limit == 0 {
        return QuotaAlerts {
            alert80: false,
            alert100: true,
        };
    }
    let percent = used as f64 / limit as f64 * 100.0;
    QuotaAlerts {
        alert80: (80.0..100.0).contains(&percent),
        alert100: percent >= 100.0,
    }
}

fn next_month_start(now: &DateTime<Utc>) -> i64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .unwrap_or_else(|| now.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    // 2024-05-10 12:00:30 UTC
    const START_MS: i64 = 1_715_342_430_000;

    fn limiter() -> (Arc<ManualClock>, Arc<MemoryStore>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = RateLimiter::new(store.clone(), clock.clone());
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn sixty_first_request_in_window_is_rejected() {
        let (_clock, _store, rl) = limiter();
        for i in 0..60 {
            let r = rl.check("key_1", "FREE").await.unwrap();
            assert!(r.allowed, "request {i}");
            assert_eq!(r.minute_remaining, 59 - i);
        }
        let r = rl.check("key_1", "FREE").await.unwrap();
        assert!(!r.allowed);
        assert_eq!(r.minute_remaining, 0);
        let retry = r.retry_after.unwrap();
        assert!((1..=60).contains(&retry));
        assert_eq!(retry, 30);
        assert!(!r.monthly_exhausted());
        assert_eq!(r.minute_reset, (START_MS / 60_000 + 1) * 60);
    }

    #[tokio::test]
    async fn new_minute_window_starts_fresh() {
        let (clock, _store, rl) = limiter();
        for _ in 0..61 {
            rl.check("key_1", "FREE").await.unwrap();
        }
        clock.advance(30_000);
        let r = rl.check("key_1", "FREE").await.unwrap();
        assert!(r.allowed);
        assert_eq!(r.minute_remaining, 59);
        // 月度计数不随分钟窗口重置
        assert_eq!(r.monthly_remaining, 50_000 - 62);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_lose_no_increments() {
        let (_clock, _store, rl) = limiter();
        let rl = Arc::new(rl);
        let mut handles = Vec::new();
        for _ in 0..40 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move {
                rl.check("shared", "ENTERPRISE").await.unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().allowed);
        }
        let usage = rl.usage("shared").await.unwrap();
        assert_eq!(usage.minute_count, 40);
        assert_eq!(usage.monthly_count, 40);
    }

    #[tokio::test]
    async fn monthly_breach_retries_at_next_month() {
        let (_clock, store, rl) = limiter();
        let monthly_key = "ratelimit:monthly:key_m:2024-05".to_string();
        for _ in 0..50_000 {
            store.incr_batch(&[(monthly_key.clone(), MONTH_TTL)]).await.unwrap();
        }
        let r = rl.check("key_m", "FREE").await.unwrap();
        assert!(!r.allowed);
        assert!(r.monthly_exhausted());
        // 2024-06-01T00:00:00Z
        assert_eq!(r.monthly_reset, 1_717_200_000);
        assert_eq!(r.retry_after, Some(1_717_200_000 - START_MS / 1000));
    }

    #[tokio::test]
    async fn monthly_breach_on_last_request_of_minute_is_reported_as_monthly() {
        let (_clock, store, rl) = limiter();
        let monthly_key = "ratelimit:monthly:key_m:2024-05".to_string();
        for _ in 0..(50_000 - 59) {
            store.incr_batch(&[(monthly_key.clone(), MONTH_TTL)]).await.unwrap();
        }
        for i in 0..59 {
            assert!(rl.check("key_m", "FREE").await.unwrap().allowed, "request {i}");
        }

        let r = rl.check("key_m", "FREE").await.unwrap();
        assert!(!r.allowed);
        assert_eq!(r.minute_remaining, 0);
        assert_eq!(r.monthly_remaining, 0);
        assert!(r.monthly_exhausted());
        assert_eq!(r.retry_after, Some(1_717_200_000 - START_MS / 1000));
    }

    #[tokio::test]
    async fn unknown_plan_uses_free_limits() {
        let (_clock, _store, rl) = limiter();
        let r = rl.check("key_x", "PLATINUM").await.unwrap();
        assert_eq!(r.minute_limit, 60);
        assert_eq!(r.monthly_limit, 50_000);
        assert_eq!(PlanLimits::for_plan("growth"), PlanLimits::GROWTH);
    }

    #[tokio::test]
    async fn quota_alert_is_claimed_once_per_month() {
        let (clock, _store, rl) = limiter();
        assert!(rl.claim_quota_alert("key_1", "warning").await.unwrap());
        assert!(!rl.claim_quota_alert("key_1", "warning").await.unwrap());
        assert!(rl.claim_quota_alert("key_1", "exceeded").await.unwrap());
        assert!(rl.claim_quota_alert("key_2", "warning").await.unwrap());

        // 2024-06-01
        clock.set(1_717_200_000_000);
        assert!(rl.claim_quota_alert("key_1", "warning").await.unwrap());
    }

    #[test]
    fn quota_alert_thresholds() {
        assert_eq!(quota_alerts_for(39_999, 50_000), QuotaAlerts::default());
        assert_eq!(
            quota_alerts_for(40_000, 50_000),
            QuotaAlerts { alert80: true, alert100: false }
        );
        assert_eq!(
            quota_alerts_for(50_000, 50_000),
            QuotaAlerts { alert80: false, alert100: true }
        );
    }

    #[test]
    fn december_rolls_into_january() {
        let dec = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let jan = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(next_month_start(&dec), jan.timestamp());
    }
}
