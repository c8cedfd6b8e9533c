//! 가중치 기반 Token Bucket rate limiter.
//!
//! 토큰은 연속량으로 취급되며 `capacity / window_ms` 속도(밀리초당)로
//! 지연 리필됩니다. 호출마다 기능별 가중치만큼 토큰을 소비합니다.
//!
//! 대기자는 도착 순서(FIFO)대로만 처리됩니다. 대기열은 공정(fair)한
//! `tokio::sync::Mutex`로 구현되어, 선두 대기자만 리필을 기다리며 잠들고
//! 나머지는 그 뒤에 줄을 섭니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rate limiter 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 버킷 용량 (윈도우당 최대 토큰 수)
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// 용량 전체가 리필되는 시간 (밀리초)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// 기능 키별 토큰 비용 (예: "orders" => 5)
    #[serde(default)]
    pub feature_costs: HashMap<String, u32>,
}

fn default_capacity() -> f64 {
    1200.0
}
fn default_window_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            window_ms: default_window_ms(),
            feature_costs: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// 새 설정 생성.
    pub fn new(capacity: f64, window_ms: u64) -> Self {
        Self {
            capacity,
            window_ms,
            feature_costs: HashMap::new(),
        }
    }

    /// 기능별 비용 추가.
    pub fn with_feature_cost(mut self, feature: impl Into<String>, cost: u32) -> Self {
        self.feature_costs.insert(feature.into(), cost);
        self
    }

    /// 밀리초당 리필 토큰 수.
    pub fn refill_per_ms(&self) -> f64 {
        self.capacity / self.window_ms.max(1) as f64
    }
}

/// Token Bucket 상태.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_ms: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// 가득 찬 버킷 생성.
    pub fn new(capacity: f64, refill_per_ms: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_ms,
            last_refill: now,
        }
    }

    /// 경과 시간만큼 토큰 리필.
    pub fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// 토큰 소비 시도. 부족하면 아무것도 차감하지 않습니다.
    pub fn try_take(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// `cost`만큼 쌓일 때까지 남은 시간.
    pub fn time_until(&self, cost: f64) -> Duration {
        let missing = (cost - self.tokens).max(0.0);
        if missing == 0.0 || self.refill_per_ms <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing / self.refill_per_ms / 1000.0)
    }

    /// 현재 토큰 수 (마지막 리필 기준).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// 버킷을 가득 채웁니다.
    pub fn reset(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }
}

/// Rate limiter 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    /// 허용된 요청 수
    pub granted: u64,
    /// `try_acquire`로 거부된 요청 수
    pub rejected: u64,
    /// 토큰을 기다려야 했던 `acquire` 수
    pub delayed: u64,
}

impl RateLimiterStats {
    /// 한도에 걸린 총 횟수 (거부 + 대기).
    pub fn hits(&self) -> u64 {
        self.rejected + self.delayed
    }
}

/// 클라이언트별 Token Bucket rate limiter.
///
/// # Example
///
/// ```ignore
/// let limiter = RateLimiter::new("binance", RateLimitConfig::new(1200.0, 60_000));
///
/// // 토큰이 생길 때까지 대기 (에러 없음)
/// limiter.acquire(Some("orders"), None).await;
///
/// // 대기 없이 시도
/// if !limiter.try_acquire(None, Some(10)) {
///     // 한도 초과
/// }
/// ```
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
    /// FIFO 대기열 (공정 뮤텍스의 소유권 = 처리 순번)
    queue: tokio::sync::Mutex<()>,
    granted: AtomicU64,
    rejected: AtomicU64,
    delayed: AtomicU64,
}

impl RateLimiter {
    /// 새 rate limiter 생성.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let bucket = TokenBucket::new(config.capacity, config.refill_per_ms(), Instant::now());
        Self {
            name: name.into(),
            config,
            bucket: Mutex::new(bucket),
            queue: tokio::sync::Mutex::new(()),
            granted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
        }
    }

    /// 기본 설정으로 생성.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RateLimitConfig::default())
    }

    /// 설정 반환.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// 요청 비용 결정.
    ///
    /// 명시적 가중치 > 기능별 비용 > 1 순서로 적용하며 용량을 넘지 않습니다.
    pub fn cost_of(&self, feature_key: Option<&str>, weight: Option<u32>) -> f64 {
        let cost = weight
            .or_else(|| feature_key.and_then(|key| self.config.feature_costs.get(key).copied()))
            .unwrap_or(1) as f64;

        if cost > self.config.capacity {
            warn!(
                rate_limiter = %self.name,
                cost,
                capacity = self.config.capacity,
                "Request weight exceeds bucket capacity, clamping"
            );
            self.config.capacity
        } else {
            cost
        }
    }

    /// 토큰이 확보될 때까지 대기한 뒤 차감합니다.
    ///
    /// 에러를 반환하지 않으며 지연만 발생시킵니다. 토큰을 기다려야 했으면
    /// `true`를 반환합니다.
    pub async fn acquire(&self, feature_key: Option<&str>, weight: Option<u32>) -> bool {
        let cost = self.cost_of(feature_key, weight);
        let _turn = self.queue.lock().await;
        let mut waited = false;

        loop {
            let wait = {
                let mut bucket = self.bucket();
                let now = Instant::now();
                if bucket.try_take(cost, now) {
                    None
                } else {
                    Some(bucket.time_until(cost))
                }
            };

            match wait {
                None => break,
                Some(delay) => {
                    if !waited {
                        waited = true;
                        self.delayed.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            rate_limiter = %self.name,
                            cost,
                            wait_ms = delay.as_millis() as u64,
                            "Rate limit reached, waiting for refill"
                        );
                    }
                    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                }
            }
        }

        self.granted.fetch_add(1, Ordering::Relaxed);
        waited
    }

    /// 대기 없이 토큰 차감을 시도합니다.
    ///
    /// 이미 대기 중인 호출자가 있으면 새치기를 막기 위해 `false`를 반환합니다.
    pub fn try_acquire(&self, feature_key: Option<&str>, weight: Option<u32>) -> bool {
        let cost = self.cost_of(feature_key, weight);

        let acquired = match self.queue.try_lock() {
            Ok(_turn) => self.bucket().try_take(cost, Instant::now()),
            Err(_) => false,
        };

        if acquired {
            self.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// 현재 사용 가능한 토큰 수.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket();
        bucket.refill(Instant::now());
        bucket.tokens()
    }

    /// 버킷을 가득 채우고 통계를 초기화합니다.
    pub fn reset(&self) {
        self.bucket().reset(Instant::now());
        self.granted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.delayed.store(0, Ordering::Relaxed);
        debug!(rate_limiter = %self.name, "Rate limiter reset");
    }

    /// 통계 반환.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            granted: self.granted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
        }
    }

    fn bucket(&self) -> std::sync::MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_exhausts_and_refills() {
        let limiter = RateLimiter::new("test", RateLimitConfig::new(5.0, 1000));

        for i in 0..5 {
            assert!(limiter.try_acquire(None, None), "request {i} should pass");
        }
        assert!(!limiter.try_acquire(None, None));

        // 윈도우 하나가 지나면 다시 허용
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.try_acquire(None, None));

        let stats = limiter.stats();
        assert_eq!(stats.granted, 6);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feature_cost_and_explicit_weight() {
        let config = RateLimitConfig::new(10.0, 1000).with_feature_cost("orders", 4);
        let limiter = RateLimiter::new("test", config);

        assert!(limiter.try_acquire(Some("orders"), None));
        assert!((limiter.available_tokens() - 6.0).abs() < 1e-9);

        // 명시적 가중치가 기능 비용보다 우선
        assert!(limiter.try_acquire(Some("orders"), Some(1)));
        assert!((limiter.available_tokens() - 5.0).abs() < 1e-9);

        // 알 수 없는 기능은 비용 1
        assert!(limiter.try_acquire(Some("unknown"), None));
        assert!((limiter.available_tokens() - 4.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new("test", RateLimitConfig::new(2.0, 1000));
        assert!(limiter.try_acquire(None, Some(2)));

        let start = Instant::now();
        limiter.acquire(None, Some(1)).await;

        // 토큰 1개 = 500ms
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(limiter.stats().delayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_fifo() {
        let limiter = Arc::new(RateLimiter::new("test", RateLimitConfig::new(3.0, 300)));
        assert!(limiter.try_acquire(None, Some(3)));

        let (tx, mut rx) = mpsc::unbounded_channel();

        // 무거운 요청이 먼저 줄을 선다
        let heavy = {
            let limiter = limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                limiter.acquire(None, Some(3)).await;
                tx.send("heavy").unwrap();
            })
        };
        tokio::task::yield_now().await;

        let light = {
            let limiter = limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                limiter.acquire(None, Some(1)).await;
                tx.send("light").unwrap();
            })
        };
        tokio::task::yield_now().await;

        // 대기자가 있는 동안 try_acquire는 새치기할 수 없다
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!limiter.try_acquire(None, Some(1)));

        heavy.await.unwrap();
        light.await.unwrap();

        assert_eq!(rx.recv().await, Some("heavy"));
        assert_eq!(rx.recv().await, Some("light"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_weight_above_capacity_is_clamped() {
        let limiter = RateLimiter::new("test", RateLimitConfig::new(5.0, 1000));
        assert!(limiter.try_acquire(None, Some(50)));
        assert!(limiter.available_tokens() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_refills_bucket() {
        let limiter = RateLimiter::new("test", RateLimitConfig::new(5.0, 60_000));
        assert!(limiter.try_acquire(None, Some(5)));
        assert!(!limiter.try_acquire(None, None));

        limiter.reset();
        assert!((limiter.available_tokens() - 5.0).abs() < 1e-9);
        assert_eq!(limiter.stats(), RateLimiterStats::default());
    }

    #[test]
    fn test_rate_limit_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.capacity, 1200.0);
        assert_eq!(config.window_ms, 60_000);
        assert!((config.refill_per_ms() - 0.02).abs() < 1e-12);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Take(u32),
        Wait(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..20).prop_map(Op::Take),
            (0u64..5_000).prop_map(Op::Wait),
        ]
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1.0f64..100.0,
            window_ms in 1u64..10_000,
            ops in proptest::collection::vec(op_strategy(), 1..100),
        ) {
            let start = Instant::now();
            let mut now = start;
            let mut bucket = TokenBucket::new(capacity, capacity / window_ms as f64, start);

            for op in ops {
                match op {
                    Op::Take(weight) => {
                        bucket.try_take(weight as f64, now);
                    }
                    Op::Wait(ms) => {
                        now += Duration::from_millis(ms);
                        bucket.refill(now);
                    }
                }
                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(bucket.tokens() <= capacity);
            }
        }
    }
}
