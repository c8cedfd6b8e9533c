//! 인증 구독을 위한 자격 증명 공급자.
//!
//! 서명 알고리즘(HMAC, Ed25519 등)은 거래소 어댑터의 몫입니다. 이 모듈은
//! 구독 요청을 보낼 때마다 새 자격 증명을 받아 요청에 붙이는 경계만
//! 정의합니다. 토큰은 재연결 사이에 만료될 수 있으므로 캐시하지 않습니다.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{ExchangeError, ExchangeResult};

/// 자격 증명이 병합되는 요청 필드 이름.
pub const AUTH_FIELD: &str = "auth";

/// 인증 정보 공급자.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 채널 구독 요청에 붙일 자격 증명을 발급합니다.
    async fn credentials(&self, channel_id: &str, request: &Value) -> ExchangeResult<Value>;
}

/// 고정 토큰을 `{"token": ...}`으로 제공하는 공급자.
#[derive(Debug, Clone)]
pub struct StaticTokenAuth {
    token: String,
}

impl StaticTokenAuth {
    /// 새 공급자 생성.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn credentials(&self, _channel_id: &str, _request: &Value) -> ExchangeResult<Value> {
        Ok(json!({ "token": self.token }))
    }
}

/// 구독 요청에 자격 증명을 병합합니다.
///
/// 요청은 JSON 객체여야 하며, 기존 `auth` 필드는 덮어씁니다.
pub fn with_credentials(request: &Value, credentials: Value) -> ExchangeResult<Value> {
    let mut merged = request.clone();
    match merged.as_object_mut() {
        Some(map) => {
            map.insert(AUTH_FIELD.to_string(), credentials);
            Ok(merged)
        }
        None => Err(ExchangeError::Auth(
            "authenticated subscription request must be a JSON object".to_string(),
        )),
    }
}
