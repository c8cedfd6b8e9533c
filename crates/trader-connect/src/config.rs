//! 클라이언트 설정.
//!
//! 모든 구성 요소의 설정을 하나로 묶습니다. TOML 예:
//!
//! ```toml
//! request_timeout_ms = 10000
//!
//! [retry]
//! max_attempts = 3
//!
//! [rate_limit]
//! capacity = 1200
//! window_ms = 60000
//! feature_costs = { orders = 5 }
//!
//! [circuit_breaker]
//! failure_threshold = 5
//!
//! [reconnect]
//! max_attempts = 0
//!
//! [heartbeat]
//! interval_ms = 15000
//! ```
//!
//! 환경 변수는 `TRADER__RETRY__MAX_ATTEMPTS=5`처럼 덮어씁니다.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trader_core::{init_logging, load_from_toml, load_layered, LoggingConfig, DEFAULT_ENV_PREFIX};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connection::{ConnectionConfig, HeartbeatConfig, ReconnectConfig};
use crate::error::{ExchangeError, ExchangeResult};
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;

/// 거래소 클라이언트 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 시도당 요청 타임아웃 (밀리초)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// 설정 파일(선택)과 `TRADER__` 환경 변수에서 로드합니다.
    pub fn load(path: Option<&Path>) -> ExchangeResult<Self> {
        let config: Self = load_layered(path, DEFAULT_ENV_PREFIX)
            .map_err(|e| ExchangeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 로드합니다.
    pub fn from_toml(toml: &str) -> ExchangeResult<Self> {
        let config: Self =
            load_from_toml(toml).map_err(|e| ExchangeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 시도당 요청 타임아웃.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// 연결 관리자 설정.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect: self.reconnect.clone(),
            heartbeat: self.heartbeat.clone(),
        }
    }

    /// `[logging]` 섹션으로 전역 로깅을 초기화합니다.
    ///
    /// 프로세스당 한 번만 성공하며, 이미 초기화되어 있으면 에러를 반환합니다.
    pub fn init_logging(&self) -> ExchangeResult<()> {
        init_logging(self.logging.to_log_config())
            .map_err(|e| ExchangeError::Config(format!("logging: {}", e)))
    }

    /// 값의 범위를 검사합니다.
    pub fn validate(&self) -> ExchangeResult<()> {
        if self.request_timeout_ms == 0 {
            return Err(ExchangeError::Config(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ExchangeError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        let capacity = self.rate_limit.capacity;
        if capacity.is_nan() || capacity <= 0.0 || self.rate_limit.window_ms == 0 {
            return Err(ExchangeError::Config(
                "rate_limit.capacity and rate_limit.window_ms must be positive".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ExchangeError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limit.capacity, 1200.0);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ClientConfig::from_toml(
            r#"
            request_timeout_ms = 2500

            [retry]
            max_attempts = 5
            retryable_statuses = [503]

            [rate_limit]
            capacity = 10
            window_ms = 1000
            feature_costs = { orders = 5 }

            [reconnect]
            max_attempts = 0
            jitter = 0.0

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.request_timeout_ms, 2500);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.retryable_statuses, vec![503]);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.rate_limit.capacity, 10.0);
        assert_eq!(config.rate_limit.feature_costs.get("orders"), Some(&5));
        assert_eq!(config.connection().reconnect.max_attempts, 0);
        assert_eq!(config.connection().heartbeat, HeartbeatConfig::default());
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ClientConfig::from_toml("[retry]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, ExchangeError::Config(_)));

        let err = ClientConfig::from_toml("[rate_limit]\ncapacity = 0").unwrap_err();
        assert!(matches!(err, ExchangeError::Config(_)));
    }

    #[test]
    fn test_init_logging_only_once() {
        let config =
            ClientConfig::from_toml("[logging]\nlevel = \"debug\"\nformat = \"compact\"")
                .unwrap();
        // 다른 구독자가 먼저 설치됐을 수도 있으므로 첫 결과는 확인하지 않는다
        let _ = config.init_logging();
        assert!(matches!(config.init_logging(), Err(ExchangeError::Config(_))));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = ClientConfig::load(None).unwrap();
        assert_eq!(config.retry.max_attempts, RetryConfig::default().max_attempts);
    }
}
