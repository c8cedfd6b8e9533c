//! 거래소 어댑터가 공유하는 복원력 있는 네트워크 클라이언트 코어.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Token bucket rate limiter: 가중치 기반 FIFO 입장 제어
//! - Circuit breaker: 장애 허용을 위한 회로 차단기
//! - 재시도 요청 엔진: 타임아웃, 지수 백오프, 상관관계 ID, 메트릭
//! - 연결 상태 머신: heartbeat와 자동 재연결
//! - 채널 멀티플렉서: 하나의 연결 위의 여러 구독, 재연결 시 재구독
//!
//! # Example
//!
//! ```ignore
//! let config = ClientConfig::load(Some(Path::new("config/client.toml")))?;
//! config.init_logging()?;
//!
//! let client = ExchangeClient::builder("binance")
//!     .config(config)
//!     .stream_connector(Arc::new(TungsteniteConnector::new("wss://stream.example.com/ws")))
//!     .build()?;
//!
//! let time: ServerTime = client
//!     .send(Method::Get, "https://api.example.com/api/v3/time", None, None)
//!     .await?;
//!
//! let mut trades = client
//!     .subscribe::<Trade>("trades:BTC-USD", json!({"op": "subscribe", "channel": "trades:BTC-USD"}))
//!     .await?;
//! while let Some(trade) = trades.next().await { /* ... */ }
//! ```

pub mod auth;
pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod multiplexer;
pub mod rate_limiter;
pub mod retry;
pub mod transport;

pub use auth::{AuthProvider, StaticTokenAuth};
pub use backoff::ExponentialBackoff;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitOpenError, CircuitState,
};
pub use client::{ExchangeClient, ExchangeClientBuilder};
pub use config::ClientConfig;
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandler, ConnectionManager, ConnectionState,
    HeartbeatConfig, InboundMessage, ReconnectConfig,
};
pub use error::*;
pub use metrics::{EndpointMetrics, MetricsRecorder, MetricsSnapshot};
pub use multiplexer::{
    ChannelProtocol, JsonChannelProtocol, Multiplexer, SubscriptionInfo, SubscriptionStream,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterStats};
pub use retry::{RequestExecutor, RetryConfig};
pub use transport::{
    Frame, FrameSink, FrameStream, HttpRequest, HttpResponse, HttpTransport, Method,
    ReqwestTransport, StreamConnector, TungsteniteConnector, CORRELATION_HEADER,
};
