//! 거래소 클라이언트.
//!
//! rate limiter, circuit breaker, 재시도 실행기, 멀티플렉서, 메트릭을
//! 명시적인 필드로 조합합니다. 거래소 어댑터는 이 타입의 `send`/`request`와
//! `subscribe`만 사용합니다.
//!
//! 단일 요청 흐름:
//!
//! ```text
//! acquire (rate limiter) → execute (circuit breaker) → 시도 루프 (retry) → transport
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
use crate::config::ClientConfig;
use crate::connection::ConnectionEvent;
use crate::error::{ExchangeError, ExchangeResult};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::multiplexer::{ChannelProtocol, JsonChannelProtocol, Multiplexer, SubscriptionStream};
use crate::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::retry::{new_correlation_id, RequestExecutor};
use crate::transport::{HttpRequest, HttpTransport, Method, ReqwestTransport, StreamConnector};

/// [`ExchangeClient`] 빌더.
pub struct ExchangeClientBuilder {
    name: String,
    config: ClientConfig,
    http: Option<Arc<dyn HttpTransport>>,
    stream: Option<Arc<dyn StreamConnector>>,
    protocol: Option<Arc<dyn ChannelProtocol>>,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl ExchangeClientBuilder {
    /// 클라이언트 설정.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// HTTP 전송 계층. 지정하지 않으면 [`ReqwestTransport`]를 사용합니다.
    pub fn http_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.http = Some(transport);
        self
    }

    /// 스트리밍 커넥터. 지정하지 않으면 구독을 사용할 수 없습니다.
    pub fn stream_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.stream = Some(connector);
        self
    }

    /// 채널 프로토콜. 기본값은 [`JsonChannelProtocol`].
    pub fn channel_protocol(mut self, protocol: Arc<dyn ChannelProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// 인증 구독용 자격 증명 공급자.
    pub fn auth_provider(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// 클라이언트 생성.
    pub fn build(self) -> ExchangeResult<ExchangeClient> {
        self.config.validate()?;

        let http: Arc<dyn HttpTransport> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let metrics = Arc::new(MetricsRecorder::new());
        let executor = RequestExecutor::new(
            http,
            self.config.retry.clone(),
            self.config.request_timeout(),
            metrics.clone(),
        );
        let multiplexer = self.stream.map(|connector| {
            let protocol = self.protocol.unwrap_or_else(|| {
                Arc::new(JsonChannelProtocol::default()) as Arc<dyn ChannelProtocol>
            });
            Multiplexer::new(connector, self.config.connection(), protocol, self.auth)
        });

        info!(
            exchange = %self.name,
            streaming = multiplexer.is_some(),
            "Exchange client created"
        );

        Ok(ExchangeClient {
            limiter: RateLimiter::new(self.name.clone(), self.config.rate_limit.clone()),
            breaker: CircuitBreaker::new(self.name.clone(), self.config.circuit_breaker.clone()),
            name: self.name,
            config: self.config,
            executor,
            multiplexer,
            metrics,
        })
    }
}

/// 거래소 클라이언트.
///
/// rate limiter와 circuit breaker 상태는 인스턴스마다 독립적입니다.
pub struct ExchangeClient {
    name: String,
    config: ClientConfig,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    executor: RequestExecutor,
    multiplexer: Option<Multiplexer>,
    metrics: Arc<MetricsRecorder>,
}

impl ExchangeClient {
    /// 빌더 생성.
    pub fn builder(name: impl Into<String>) -> ExchangeClientBuilder {
        ExchangeClientBuilder {
            name: name.into(),
            config: ClientConfig::default(),
            http: None,
            stream: None,
            protocol: None,
            auth: None,
        }
    }

    /// 거래소 이름.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 클라이언트 설정.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // === 단일 요청 ===

    /// 요청을 보내고 응답을 `T`로 역직렬화합니다.
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
        self.request(request).await
    }

    /// 기능 키/가중치가 지정된 요청을 보냅니다.
    ///
    /// 논리적 호출 하나당 에러도 하나이며, 항상 상관관계 ID가 붙어 있습니다.
    /// [`disconnect`](Self::disconnect)는 토큰 대기 중인 호출도 취소합니다.
    pub async fn request<T: DeserializeOwned>(&self, request: HttpRequest) -> ExchangeResult<T> {
        let correlation_id = new_correlation_id();
        let cancel = self.executor.cancellation_token();

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(
                    exchange = %self.name,
                    correlation_id = %correlation_id,
                    "Request cancelled while waiting for rate limit"
                );
                return Err(ExchangeError::Cancelled.with_correlation(&correlation_id, 0));
            }
            waited = self
                .limiter
                .acquire(request.feature_key.as_deref(), request.weight) => waited,
        };
        if waited {
            self.metrics.record_rate_limit_hit();
        }

        // 로컬 취소는 업스트림 장애가 아니다
        let result = self
            .breaker
            .execute_classified(
                || {
                    self.executor
                        .execute_with_cancel::<T>(&request, &correlation_id, &cancel)
                },
                |e: &ExchangeError| !e.is_cancelled(),
            )
            .await;

        result.map_err(|e: ExchangeError| {
            if e.is_circuit_open() {
                warn!(
                    exchange = %self.name,
                    correlation_id = %correlation_id,
                    "Request rejected, circuit open"
                );
            }
            e.with_correlation(&correlation_id, 0)
        })
    }

    // === Rate limit ===

    /// 토큰이 생길 때까지 대기한 뒤 차감합니다.
    pub async fn acquire(&self, feature_key: Option<&str>, weight: Option<u32>) {
        if self.limiter.acquire(feature_key, weight).await {
            self.metrics.record_rate_limit_hit();
        }
    }

    /// 대기 없이 토큰 차감을 시도합니다.
    pub fn try_acquire(&self, feature_key: Option<&str>, weight: Option<u32>) -> bool {
        let acquired = self.limiter.try_acquire(feature_key, weight);
        if !acquired {
            self.metrics.record_rate_limit_hit();
        }
        acquired
    }

    /// 사용 가능한 토큰 수.
    pub fn available_tokens(&self) -> f64 {
        self.limiter.available_tokens()
    }

    /// rate limiter 초기화.
    pub fn reset_limiter(&self) {
        self.limiter.reset();
    }

    /// rate limiter 통계.
    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    // === Circuit breaker ===

    /// circuit breaker 상태.
    pub fn breaker_status(&self) -> CircuitState {
        self.breaker.state()
    }

    /// circuit breaker 메트릭.
    pub fn breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    /// circuit breaker를 Closed로 강제 초기화.
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    // === 스트리밍 ===

    /// 채널을 구독합니다.
    pub async fn subscribe<T: DeserializeOwned>(
        &self,
        channel_id: impl Into<String>,
        request: Value,
    ) -> ExchangeResult<SubscriptionStream<T>> {
        self.multiplexer()?.subscribe(channel_id, request).await
    }

    /// 인증이 필요한 채널을 구독합니다.
    pub async fn subscribe_private<T: DeserializeOwned>(
        &self,
        channel_id: impl Into<String>,
        request: Value,
    ) -> ExchangeResult<SubscriptionStream<T>> {
        self.multiplexer()?
            .subscribe_private(channel_id, request)
            .await
    }

    /// 스트리밍 연결을 엽니다.
    pub async fn connect(&self) -> ExchangeResult<()> {
        self.multiplexer()?.connect().await
    }

    /// 진행 중인 모든 요청을 취소하고 스트리밍 연결을 닫습니다.
    pub async fn disconnect(&self) {
        self.executor.cancel_all();
        if let Some(multiplexer) = &self.multiplexer {
            multiplexer.disconnect().await;
        }
        info!(exchange = %self.name, "Exchange client disconnected");
    }

    /// 스트리밍 연결 여부.
    pub fn is_connected(&self) -> bool {
        self.multiplexer
            .as_ref()
            .is_some_and(Multiplexer::is_connected)
    }

    /// 연결 이벤트 구독.
    pub fn connection_events(&self) -> ExchangeResult<broadcast::Receiver<ConnectionEvent>> {
        Ok(self.multiplexer()?.events())
    }

    // === 메트릭 ===

    /// 요청 메트릭 스냅샷.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 요청 메트릭 초기화.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    fn multiplexer(&self) -> ExchangeResult<&Multiplexer> {
        self.multiplexer.as_ref().ok_or_else(|| {
            ExchangeError::Config(format!("{}: no stream connector configured", self.name))
        })
    }
}
