//! 공통 인프라 에러 타입.

use thiserror::Error;

/// 설정/로깅 인프라 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 설정 로드 또는 역직렬화 실패
    #[error("설정 에러: {0}")]
    Config(#[from] config::ConfigError),

    /// 잘못된 설정 값
    #[error("잘못된 설정 값: {0}")]
    InvalidConfig(String),

    /// 로깅 초기화 실패
    #[error("로깅 초기화 에러: {0}")]
    Logging(String),
}

/// 인프라 작업을 위한 Result 타입.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// 사용자 입력(설정 파일) 문제로 인한 에러인지 확인합니다.
    pub fn is_config_error(&self) -> bool {
        matches!(self, CoreError::Config(_) | CoreError::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        let err = CoreError::InvalidConfig("window_ms must be > 0".to_string());
        assert!(err.is_config_error());
        assert!(err.to_string().contains("window_ms"));

        let err = CoreError::Logging("already initialized".to_string());
        assert!(!err.is_config_error());
    }
}
