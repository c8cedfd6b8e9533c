//! 거래소 클라이언트 에러 타입.

use thiserror::Error;

use crate::circuit_breaker::CircuitOpenError;

/// 거래소 클라이언트 작업을 위한 Result 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// 거래소 클라이언트 에러.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// 네트워크/연결 에러 (연결 리셋, DNS 실패 등)
    #[error("Network error: {0}")]
    Network(String),

    /// 요청이 제한 시간을 초과함
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 2xx가 아닌 HTTP 응답
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Circuit breaker가 열려 있어 호출이 즉시 거부됨
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// 클라이언트 종료로 요청이 취소됨
    #[error("Request cancelled")]
    Cancelled,

    /// 스트리밍 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// WebSocket 프로토콜 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    Parse(String),

    /// 재연결 최대 시도 횟수 초과
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// 인증 정보 발급 실패
    #[error("Auth error: {0}")]
    Auth(String),

    /// 잘못된 설정
    #[error("Config error: {0}")]
    Config(String),

    /// 상관관계 ID가 부착된 에러 (논리적 호출 하나당 하나)
    #[error("[{correlation_id}] {source} (after {attempts} attempt(s))")]
    Correlated {
        correlation_id: String,
        attempts: u32,
        #[source]
        source: Box<ExchangeError>,
    },
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 확인.
    ///
    /// HTTP 상태 코드는 설정된 재시도 집합에 포함될 때만 재시도합니다.
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            ExchangeError::Network(_)
            | ExchangeError::Timeout(_)
            | ExchangeError::Disconnected(_)
            | ExchangeError::WebSocket(_) => true,
            ExchangeError::Http { status, .. } => retryable_statuses.contains(status),
            ExchangeError::Correlated { source, .. } => source.is_retryable(retryable_statuses),
            _ => false,
        }
    }

    /// 부착된 상관관계 ID 반환.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ExchangeError::Correlated { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    /// 상관관계 래퍼를 벗긴 원인 에러 반환.
    pub fn root(&self) -> &ExchangeError {
        match self {
            ExchangeError::Correlated { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP 상태 코드 반환 (HTTP 에러인 경우).
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            ExchangeError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Circuit open으로 거부된 에러인지 확인.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), ExchangeError::CircuitOpen(_))
    }

    /// 로컬 취소로 끝난 에러인지 확인.
    ///
    /// 업스트림 장애가 아니므로 circuit breaker 집계에서 제외됩니다.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), ExchangeError::Cancelled)
    }

    /// 상관관계 ID를 부착합니다.
    ///
    /// 이미 ID가 있는 에러는 그대로 반환합니다.
    pub fn with_correlation(self, correlation_id: &str, attempts: u32) -> Self {
        match self {
            already @ ExchangeError::Correlated { .. } => already,
            other => ExchangeError::Correlated {
                correlation_id: correlation_id.to_string(),
                attempts,
                source: Box::new(other),
            },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_decode() {
            ExchangeError::Parse(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ExchangeError::Disconnected(err.to_string())
            }
            WsError::Io(_) => ExchangeError::Network(err.to_string()),
            other => ExchangeError::WebSocket(other.to_string()),
        }
    }
}
