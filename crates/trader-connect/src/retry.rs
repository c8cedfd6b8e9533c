//! 재시도 요청 엔진.
//!
//! 논리적 호출 하나를 최대 `max_attempts`번의 시도로 실행합니다. 각 시도는
//! 요청 타임아웃과 클라이언트 취소 토큰에 묶여 있으며, 재시도 가능한 실패
//! 사이에는 지수 백오프만큼 대기합니다.
//!
//! 모든 시도는 같은 상관관계 ID(`X-Correlation-Id`)를 전송하고, 호출자에게
//! 반환되는 에러에도 같은 ID가 부착됩니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backoff::ExponentialBackoff;
use crate::error::{ExchangeError, ExchangeResult};
use crate::metrics::{endpoint_key, MetricsRecorder};
use crate::transport::{HttpRequest, HttpTransport, Method, CORRELATION_HEADER};

/// 재시도 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 논리적 호출당 최대 시도 횟수 (첫 시도 포함)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 첫 재시도 전 대기 시간 (밀리초)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// 백오프 배수
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 최대 대기 시간 (밀리초)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 무작위 변동 비율 (0.0 = 변동 없음)
    #[serde(default)]
    pub jitter: f64,
    /// 재시도할 HTTP 상태 코드
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_retryable_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl RetryConfig {
    /// 재시도 없이 한 번만 시도하는 설정.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// 최대 시도 횟수 설정.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// 백오프 정책 생성.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }
}

/// 새 상관관계 ID 생성.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// 재시도 요청 실행기.
///
/// Circuit breaker와 rate limiter는 호출자([`ExchangeClient`](crate::client::ExchangeClient))가
/// 바깥에서 감쌉니다. 실행기 자체는 시도 루프만 책임집니다.
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    config: RetryConfig,
    backoff: ExponentialBackoff,
    request_timeout: Duration,
    metrics: Arc<MetricsRecorder>,
    cancel: Mutex<CancellationToken>,
}

impl RequestExecutor {
    /// 새 실행기 생성.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: RetryConfig,
        request_timeout: Duration,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let backoff = config.backoff();
        Self {
            transport,
            config,
            backoff,
            request_timeout,
            metrics,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// 재시도 설정 반환.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 메트릭 수집기 반환.
    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// 요청을 보내고 응답 본문을 `T`로 역직렬화합니다.
    ///
    /// 새 상관관계 ID를 생성합니다.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        headers: Option<HashMap<String, String>>,
    ) -> ExchangeResult<T> {
        let mut request = HttpRequest::new(method, url);
        request.body = body;
        if let Some(headers) = headers {
            request.headers.extend(headers);
        }
        self.execute(&request, &new_correlation_id()).await
    }

    /// 주어진 상관관계 ID로 시도 루프를 실행합니다.
    ///
    /// 반환되는 에러는 항상 상관관계 ID가 부착된
    /// [`ExchangeError::Correlated`]입니다.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: &HttpRequest,
        correlation_id: &str,
    ) -> ExchangeResult<T> {
        let cancel = self.cancellation_token();
        self.execute_with_cancel(request, correlation_id, &cancel)
            .await
    }

    /// 호출자가 미리 받아 둔 취소 토큰으로 시도 루프를 실행합니다.
    ///
    /// 토큰을 받은 뒤 [`cancel_all`](Self::cancel_all)이 호출되면 이 호출도
    /// 취소됩니다.
    pub async fn execute_with_cancel<T: DeserializeOwned>(
        &self,
        request: &HttpRequest,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> ExchangeResult<T> {
        let endpoint = endpoint_key(request.method.as_str(), &request.url);
        let span = info_span!(
            "exchange_request",
            correlation_id = %correlation_id,
            endpoint = %endpoint
        );

        let mut request = request.clone();
        request
            .headers
            .insert(CORRELATION_HEADER.to_string(), correlation_id.to_string());

        self.attempt_loop(request, &endpoint, cancel)
            .instrument(span)
            .await
            .map_err(|(error, attempts)| error.with_correlation(correlation_id, attempts))
    }

    async fn attempt_loop<T: DeserializeOwned>(
        &self,
        request: HttpRequest,
        endpoint: &str,
        token: &CancellationToken,
    ) -> Result<T, (ExchangeError, u32)> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();

            let outcome = tokio::select! {
                _ = token.cancelled() => Err(ExchangeError::Cancelled),
                result = tokio::time::timeout(self.request_timeout, self.transport.execute(&request)) => {
                    match result {
                        Ok(response) => response,
                        Err(_) => Err(ExchangeError::Timeout(format!(
                            "attempt {} exceeded {}ms",
                            attempt,
                            self.request_timeout.as_millis()
                        ))),
                    }
                }
            };
            let latency = started.elapsed();

            let error = match outcome {
                Ok(response) if response.is_success() => {
                    self.metrics.record_attempt(endpoint, latency, true);
                    debug!(
                        attempt,
                        status = response.status,
                        latency_ms = latency.as_millis() as u64,
                        "Request succeeded"
                    );
                    return response.json::<T>().map_err(|e| (e, attempt));
                }
                Ok(response) => ExchangeError::Http {
                    status: response.status,
                    body: response.body,
                },
                // 취소된 시도는 메트릭에 남기지 않는다
                Err(ExchangeError::Cancelled) => {
                    debug!(attempt, "Request cancelled");
                    return Err((ExchangeError::Cancelled, attempt));
                }
                Err(e) => e,
            };

            self.metrics.record_attempt(endpoint, latency, false);
            if error.status() == Some(429) {
                self.metrics.record_rate_limit_hit();
            }

            if !error.is_retryable(&self.config.retryable_statuses) {
                warn!(attempt, error = %error, "Request failed with non-retryable error");
                return Err((error, attempt));
            }
            if attempt >= max_attempts {
                warn!(attempt, error = %error, "Request failed, retry attempts exhausted");
                return Err((error, attempt));
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Request failed, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => return Err((ExchangeError::Cancelled, attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 진행 중인 모든 시도와 백오프 대기를 취소합니다.
    ///
    /// 이후 호출은 새 토큰으로 정상 동작합니다.
    pub fn cancel_all(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
        debug!("Cancelled all in-flight requests");
    }

    /// 현재 취소 토큰.
    ///
    /// 다음 [`cancel_all`](Self::cancel_all) 호출 때 취소됩니다.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 항상 같은 상태 코드를 반환하는 전송 계층.
    struct FixedStatus {
        status: u16,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HttpTransport for FixedStatus {
        async fn execute(&self, _request: &HttpRequest) -> ExchangeResult<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(self.status, r#"{"ok":true}"#))
        }
    }

    /// 응답하지 않는 전송 계층.
    struct Hanging;

    #[async_trait]
    impl HttpTransport for Hanging {
        async fn execute(&self, _request: &HttpRequest) -> ExchangeResult<HttpResponse> {
            std::future::pending().await
        }
    }

    fn executor(transport: Arc<dyn HttpTransport>, config: RetryConfig) -> RequestExecutor {
        RequestExecutor::new(
            transport,
            config,
            Duration::from_millis(5_000),
            Arc::new(MetricsRecorder::new()),
        )
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_ms, 1_000);
        assert_eq!(config.max_delay_ms, 10_000);
        assert_eq!(config.retryable_statuses, vec![408, 429, 500, 502, 503, 504]);
        assert_eq!(config.backoff().base_delay(1), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_stops_immediately() {
        let transport = Arc::new(FixedStatus {
            status: 400,
            calls: AtomicU32::new(0),
        });
        let exec = executor(transport.clone(), RetryConfig::default());

        let err = exec
            .send::<Value>(Method::Get, "https://api.example.com/v1/ticker", None, None)
            .await
            .unwrap_err();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.status(), Some(400));
        assert!(err.correlation_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_status_exhausts_attempts() {
        let transport = Arc::new(FixedStatus {
            status: 502,
            calls: AtomicU32::new(0),
        });
        let exec = executor(transport.clone(), RetryConfig::default().with_max_attempts(4));

        let started = Instant::now();
        let err = exec
            .send::<Value>(Method::Post, "https://api.example.com/v1/order", None, None)
            .await
            .unwrap_err();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.status(), Some(502));
        // 1s + 2s + 4s 백오프
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(7_000));
        assert!(elapsed < Duration::from_millis(7_100));

        let snapshot = exec.metrics().snapshot();
        assert_eq!(snapshot.failed_requests, 4);
        assert_eq!(snapshot.endpoint("POST:/v1/order").unwrap().errors, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let exec = RequestExecutor::new(
            Arc::new(Hanging),
            RetryConfig::default().with_max_attempts(2),
            Duration::from_millis(100),
            Arc::new(MetricsRecorder::new()),
        );

        let err = exec
            .send::<Value>(Method::Get, "https://api.example.com/v1/time", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err.root(), ExchangeError::Timeout(_)));
        assert_eq!(exec.metrics().snapshot().total_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_aborts_in_flight_attempt() {
        let exec = Arc::new(executor(Arc::new(Hanging), RetryConfig::default()));

        let pending = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.send::<Value>(Method::Get, "https://api.example.com/v1/time", None, None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        exec.cancel_all();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err.root(), ExchangeError::Cancelled));
        // 취소된 시도는 집계하지 않음
        assert_eq!(exec.metrics().snapshot().total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_aborts_backoff_sleep() {
        let transport = Arc::new(FixedStatus {
            status: 503,
            calls: AtomicU32::new(0),
        });
        let exec = Arc::new(executor(transport.clone(), RetryConfig::default()));

        let pending = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.send::<Value>(Method::Get, "https://api.example.com/v1/time", None, None)
                    .await
            })
        };
        // 첫 시도 후 1초 백오프 중
        tokio::time::sleep(Duration::from_millis(500)).await;
        exec.cancel_all();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err.root(), ExchangeError::Cancelled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // 새 토큰으로 다시 동작
        let exec_ok = executor(
            Arc::new(FixedStatus {
                status: 200,
                calls: AtomicU32::new(0),
            }),
            RetryConfig::default(),
        );
        exec_ok.cancel_all();
        let value: Value = exec_ok
            .send(Method::Get, "https://api.example.com/v1/time", None, None)
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_parse_error() {
        let exec = executor(
            Arc::new(FixedStatus {
                status: 200,
                calls: AtomicU32::new(0),
            }),
            RetryConfig::default(),
        );

        let err = exec
            .send::<Vec<u64>>(Method::Get, "https://api.example.com/v1/time", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), ExchangeError::Parse(_)));
    }
}
