//! 요청 지연/에러 텔레메트리.
//!
//! 모든 시도(attempt)는 `METHOD:path` 키의 엔드포인트 버킷과 전체 합계를
//! 갱신합니다. 재시도도 각각 하나의 시도로 집계됩니다.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 엔드포인트별 메트릭.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointMetrics {
    /// `METHOD:path` 형식의 키
    pub endpoint: String,
    /// 시도 횟수
    pub count: u64,
    /// 누적 지연 (밀리초)
    pub total_latency_ms: f64,
    /// 실패한 시도 수
    pub errors: u64,
    /// 최소 지연 (밀리초)
    pub min_latency_ms: f64,
    /// 최대 지연 (밀리초)
    pub max_latency_ms: f64,
    /// 마지막 요청 시각
    pub last_request_at: DateTime<Utc>,
}

impl EndpointMetrics {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            count: 0,
            total_latency_ms: 0.0,
            errors: 0,
            min_latency_ms: f64::MAX,
            max_latency_ms: 0.0,
            last_request_at: Utc::now(),
        }
    }

    /// 평균 지연 (밀리초).
    pub fn average_latency_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_latency_ms / self.count as f64
        }
    }
}

/// 메트릭 스냅샷.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// 총 시도 수
    pub total_requests: u64,
    /// 성공한 시도 수
    pub successful_requests: u64,
    /// 실패한 시도 수
    pub failed_requests: u64,
    /// rate limit에 걸린 횟수
    pub rate_limit_hits: u64,
    /// 전체 평균 지연 (밀리초)
    pub average_latency_ms: f64,
    /// 엔드포인트별 메트릭 (키 순 정렬)
    pub per_endpoint: Vec<EndpointMetrics>,
}

impl MetricsSnapshot {
    /// 엔드포인트 메트릭 조회.
    pub fn endpoint(&self, key: &str) -> Option<&EndpointMetrics> {
        self.per_endpoint.iter().find(|m| m.endpoint == key)
    }
}

#[derive(Default)]
struct MetricsState {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rate_limit_hits: u64,
    average_latency_ms: f64,
    endpoints: HashMap<String, EndpointMetrics>,
}

/// 요청 메트릭 수집기.
#[derive(Default)]
pub struct MetricsRecorder {
    state: Mutex<MetricsState>,
}

impl MetricsRecorder {
    /// 빈 수집기 생성.
    pub fn new() -> Self {
        Self::default()
    }

    /// 시도 하나를 기록합니다.
    pub fn record_attempt(&self, endpoint: &str, latency: Duration, success: bool) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut state = self.lock();

        state.total_requests += 1;
        if success {
            state.successful_requests += 1;
        } else {
            state.failed_requests += 1;
        }
        // 누적 이동 평균
        let n = state.total_requests as f64;
        state.average_latency_ms += (latency_ms - state.average_latency_ms) / n;

        let bucket = state
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointMetrics::new(endpoint.to_string()));
        bucket.count += 1;
        bucket.total_latency_ms += latency_ms;
        if !success {
            bucket.errors += 1;
        }
        bucket.min_latency_ms = bucket.min_latency_ms.min(latency_ms);
        bucket.max_latency_ms = bucket.max_latency_ms.max(latency_ms);
        bucket.last_request_at = Utc::now();
    }

    /// rate limit 적중을 기록합니다.
    pub fn record_rate_limit_hit(&self) {
        self.lock().rate_limit_hits += 1;
    }

    /// 현재 메트릭 스냅샷.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let mut per_endpoint: Vec<EndpointMetrics> = state.endpoints.values().cloned().collect();
        per_endpoint.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        MetricsSnapshot {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rate_limit_hits: state.rate_limit_hits,
            average_latency_ms: state.average_latency_ms,
            per_endpoint,
        }
    }

    /// 모든 메트릭 초기화.
    pub fn reset(&self) {
        *self.lock() = MetricsState::default();
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// URL에서 `METHOD:path` 엔드포인트 키를 만듭니다.
///
/// 쿼리 문자열은 제외되며, 파싱할 수 없는 URL은 그대로 사용합니다.
pub fn endpoint_key(method: &str, url: &str) -> String {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    };
    format!("{}:{}", method, path)
}
