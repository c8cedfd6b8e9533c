//! # Trader Core
//!
//! 거래소 클라이언트 전반에서 공유하는 인프라를 제공합니다:
//! - 구조화된 로깅 초기화
//! - 파일 + 환경 변수 계층형 설정 로더
//! - 인프라 에러 타입

pub mod config;
pub mod error;
pub mod logging;

pub use config::{load_from_toml, load_layered, LoggingConfig, DEFAULT_ENV_PREFIX};
pub use error::*;
pub use logging::*;
