//! 계층형 설정 로더.
//!
//! 설정은 다음 순서로 병합됩니다 (뒤의 소스가 앞의 값을 덮어씀):
//! 1. 각 타입의 `#[serde(default)]` 기본값
//! 2. TOML 설정 파일 (선택)
//! 3. `{PREFIX}__SECTION__KEY` 형식의 환경 변수

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CoreResult;
use crate::logging::{LogConfig, LogFormat};

/// 기본 환경 변수 접두사.
pub const DEFAULT_ENV_PREFIX: &str = "TRADER";

/// 파일과 환경 변수에서 설정을 로드합니다.
///
/// `path`가 `None`이거나 파일이 없으면 환경 변수와 기본값만 사용합니다.
pub fn load_layered<T: DeserializeOwned>(path: Option<&Path>, env_prefix: &str) -> CoreResult<T> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    tracing::debug!(path = ?path, env_prefix, "Configuration loaded");
    Ok(config.try_deserialize()?)
}

/// TOML 문자열에서 설정을 로드합니다 (환경 변수 미적용).
pub fn load_from_toml<T: DeserializeOwned>(toml: &str) -> CoreResult<T> {
    let config = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?;
    Ok(config.try_deserialize()?)
}

/// 로깅 설정 섹션.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// 로깅 초기화용 [`LogConfig`]로 변환합니다.
    ///
    /// 알 수 없는 형식은 `pretty`로 대체됩니다.
    pub fn to_log_config(&self) -> LogConfig {
        let format = self.format.parse().unwrap_or(LogFormat::Pretty);
        LogConfig::new(self.level.clone()).with_format(format)
    }
}
