//! Circuit Breaker pattern implementation.
//!
//! 외부 서비스 장애 시 연쇄 실패를 방지하고 업스트림을 보호합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[연속 실패 임계치 도달]──> Open
//!    ↑                                 │
//!    │                        [reset_timeout 경과]
//!    │                                 ↓
//!    └──[프로브 성공]── HalfOpen ──[프로브 실패]──> Open
//! ```
//!
//! HalfOpen에서는 정확히 하나의 프로브 호출만 통과하며, 프로브가 진행되는
//! 동안 다른 호출은 Open과 동일하게 즉시 거부됩니다.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit Breaker 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 정상 상태 - 모든 요청 허용
    Closed,
    /// 장애 상태 - 모든 요청 즉시 거부
    Open,
    /// 복구 테스트 상태 - 단일 프로브만 허용
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit Breaker 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Open으로 전이하는 연속 실패 횟수
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Open 상태 유지 시간 (밀리초, 이후 HalfOpen으로 전이)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
} // 30초

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// 새 설정 생성.
    pub fn new(failure_threshold: u32, reset_timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms,
        }
    }

    /// reset timeout을 Duration으로 반환.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// 보수적인 설정 (낮은 임계치, 긴 타임아웃).
    pub fn conservative() -> Self {
        Self::new(3, 60_000)
    }

    /// 공격적인 설정 (높은 임계치, 짧은 타임아웃).
    pub fn aggressive() -> Self {
        Self::new(10, 10_000)
    }
}

/// Circuit Breaker 내부 상태.
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    probe_in_flight: bool,
    /// 상태 전이마다 증가. 허가가 발급된 상태가 아직 유효한지 판별
    epoch: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_state_change: Instant::now(),
            probe_in_flight: false,
            epoch: 0,
        }
    }
}

/// 호출 허가 결과. 발급 시점의 epoch를 기억합니다.
#[derive(Debug, Clone, Copy)]
enum Permit {
    /// Closed 상태의 일반 호출
    Normal { epoch: u64 },
    /// HalfOpen 상태의 프로브 호출
    Probe { epoch: u64 },
}

/// Circuit Breaker.
///
/// 외부 서비스 호출 시 연쇄 실패를 방지합니다.
///
/// # Example
///
/// ```ignore
/// let cb = CircuitBreaker::new("binance", CircuitBreakerConfig::default());
///
/// let result = cb.execute(|| async { client.get("/api/v3/time").await }).await;
/// match result {
///     Err(e) if e.is_circuit_open() => { /* 빠른 실패 */ }
///     other => { /* 결과 처리 */ }
/// }
/// ```
pub struct CircuitBreaker {
    /// 서비스 이름 (로깅 및 메트릭용)
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejections: AtomicU64,
    open_count: AtomicU64,
}

impl CircuitBreaker {
    /// 새 Circuit Breaker 생성.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
        }
    }

    /// 기본 설정으로 생성.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// 서비스 이름 반환.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 현재 상태 반환.
    ///
    /// Open 상태에서 reset timeout이 경과했으면 HalfOpen으로 보고합니다.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_transition_from_open(&mut state);
        state.state
    }

    /// 현재 연속 실패 횟수.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// 함수를 Circuit Breaker로 감싸 실행합니다.
    ///
    /// Open 상태(또는 프로브 진행 중인 HalfOpen)에서는 `f`를 호출하지 않고
    /// 즉시 [`CircuitOpenError`]를 반환합니다. `f` 내부의 재시도는 보이지 않으며
    /// 최종 결과 하나만 집계됩니다. 모든 에러를 실패로 집계합니다.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.execute_classified(f, |_| true).await
    }

    /// [`execute`](Self::execute)와 같지만 `is_failure`로 에러를 분류합니다.
    ///
    /// `is_failure`가 `false`인 에러(예: 로컬 취소)는 성공으로도 실패로도
    /// 집계하지 않으며, 프로브였다면 슬롯만 반납합니다.
    pub async fn execute_classified<F, Fut, T, E, C>(&self, f: F, is_failure: C) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
        C: FnOnce(&E) -> bool,
    {
        let permit = self.try_permit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            permit,
            armed: true,
        };

        let result = f().await;
        let outcome = match &result {
            Ok(_) => Some(true),
            Err(e) => is_failure(e).then_some(false),
        };
        match outcome {
            Some(success) => {
                guard.armed = false;
                if success {
                    self.record_success(permit);
                } else {
                    self.record_failure(permit);
                }
            }
            None => {
                tracing::debug!(circuit_breaker = %self.name, "Call ended without outcome");
            }
        }
        result
    }

    /// 허가가 발급된 상태가 그대로인지 확인.
    ///
    /// 이전 상태에서 시작된 호출의 결과는 통계에만 반영됩니다.
    fn is_current(state: &BreakerState, permit: Permit) -> bool {
        match permit {
            Permit::Normal { epoch } => {
                state.state == CircuitState::Closed && state.epoch == epoch
            }
            Permit::Probe { epoch } => {
                state.state == CircuitState::HalfOpen
                    && state.probe_in_flight
                    && state.epoch == epoch
            }
        }
    }

    /// 성공 기록.
    ///
    /// 실패 카운트를 0으로 만들고 Closed로 전이합니다.
    fn record_success(&self, permit: Permit) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        if !Self::is_current(&state, permit) {
            tracing::debug!(circuit_breaker = %self.name, "Stale call succeeded, state unchanged");
            return;
        }
        let previous = state.state;
        state.consecutive_failures = 0;

        if previous != CircuitState::Closed {
            self.transition_to(&mut state, CircuitState::Closed);
            tracing::info!(
                circuit_breaker = %self.name,
                from = %previous,
                "Circuit breaker recovered: -> Closed"
            );
        }
    }

    /// 실패 기록.
    ///
    /// 연속 실패가 임계치에 도달하거나 프로브가 실패하면 Open으로 전이합니다.
    fn record_failure(&self, permit: Permit) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        if !Self::is_current(&state, permit) {
            tracing::debug!(circuit_breaker = %self.name, "Stale call failed, state unchanged");
            return;
        }
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut state);
                    tracing::warn!(
                        circuit_breaker = %self.name,
                        failure_count = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker tripped: Closed -> Open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.trip(&mut state);
                tracing::warn!(
                    circuit_breaker = %self.name,
                    "Circuit breaker recovery failed: HalfOpen -> Open"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// 수동으로 Circuit 리셋.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.probe_in_flight = false;
        self.transition_to(&mut state, CircuitState::Closed);
        tracing::info!(circuit_breaker = %self.name, "Circuit breaker manually reset");
    }

    /// 메트릭 반환.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut state = self.lock();
        self.maybe_transition_from_open(&mut state);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            time_in_current_state: state.last_state_change.elapsed(),
        }
    }

    /// 호출 허가 획득.
    fn try_permit(&self) -> Result<Permit, CircuitOpenError> {
        let mut state = self.lock();
        self.maybe_transition_from_open(&mut state);

        match state.state {
            CircuitState::Closed => Ok(Permit::Normal { epoch: state.epoch }),
            CircuitState::HalfOpen if !state.probe_in_flight => {
                state.probe_in_flight = true;
                tracing::debug!(circuit_breaker = %self.name, "Letting probe call through");
                Ok(Permit::Probe { epoch: state.epoch })
            }
            _ => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                let retry_after = state
                    .opened_at
                    .map(|opened| self.config.reset_timeout().saturating_sub(opened.elapsed()));
                Err(CircuitOpenError {
                    name: self.name.clone(),
                    retry_after,
                })
            }
        }
    }

    /// Open 상태에서 타임아웃이 경과했으면 HalfOpen으로 전이.
    fn maybe_transition_from_open(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        let elapsed = state
            .opened_at
            .map(|opened| opened.elapsed())
            .unwrap_or_default();
        if elapsed >= self.config.reset_timeout() {
            self.transition_to(state, CircuitState::HalfOpen);
            tracing::info!(
                circuit_breaker = %self.name,
                "Circuit breaker timeout: Open -> HalfOpen"
            );
        }
    }

    fn trip(&self, state: &mut BreakerState) {
        state.opened_at = Some(Instant::now());
        self.transition_to(state, CircuitState::Open);
        self.open_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 상태 전이.
    fn transition_to(&self, state: &mut BreakerState, new_state: CircuitState) {
        state.state = new_state;
        state.last_state_change = Instant::now();
        state.probe_in_flight = false;
        state.epoch = state.epoch.wrapping_add(1);
        if new_state == CircuitState::Closed {
            state.consecutive_failures = 0;
            state.opened_at = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 결과 없이 끝난(드롭 또는 집계 제외) 프로브의 슬롯을 반납합니다.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || !matches!(self.permit, Permit::Probe { .. }) {
            return;
        }
        let mut state = self.breaker.lock();
        if CircuitBreaker::is_current(&state, self.permit) {
            state.probe_in_flight = false;
            tracing::debug!(
                circuit_breaker = %self.breaker.name,
                "Probe ended without outcome, slot released"
            );
        }
    }
}

/// Circuit Breaker 메트릭.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// 서비스 이름
    pub name: String,
    /// 현재 상태
    pub state: CircuitState,
    /// 현재 연속 실패 횟수
    pub consecutive_failures: u32,
    /// 총 실패 횟수
    pub total_failures: u64,
    /// 총 성공 횟수
    pub total_successes: u64,
    /// 호출 없이 거부된 횟수
    pub total_rejections: u64,
    /// Circuit Open 횟수
    pub open_count: u64,
    /// 현재 상태 유지 시간
    pub time_in_current_state: Duration,
}

/// Circuit이 열려있을 때 반환되는 에러.
#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    /// Circuit Breaker 이름
    pub name: String,
    /// 남은 대기 시간 (예상)
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit breaker '{}' is open", self.name)?;
        if let Some(retry_after) = self.retry_after {
            write!(f, " (retry after {:?})", retry_after)?;
        }
        Ok(())
    }
}

impl std::error::Error for CircuitOpenError {}
