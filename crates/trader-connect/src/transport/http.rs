//! 단일 요청(unary) HTTP 타입과 reqwest 기반 전송 계층.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::HttpTransport;
use crate::error::{ExchangeError, ExchangeResult};

/// 상관관계 ID 헤더 이름.
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// HTTP 메서드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// 대문자 메서드 이름.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// 외부로 나가는 요청.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// 메서드
    pub method: Method,
    /// 전체 URL
    pub url: String,
    /// JSON 본문
    pub body: Option<Value>,
    /// 추가 헤더
    pub headers: HashMap<String, String>,
    /// rate limiter 기능 키 (예: "orders")
    pub feature_key: Option<String>,
    /// rate limiter 가중치 (기능 비용보다 우선)
    pub weight: Option<u32>,
}

impl HttpRequest {
    /// 새 요청 생성.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: HashMap::new(),
            feature_key: None,
            weight: None,
        }
    }

    /// GET 요청 생성.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// POST 요청 생성.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// JSON 본문 설정.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// 헤더 추가.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// rate limiter 기능 키 설정.
    pub fn feature(mut self, key: impl Into<String>) -> Self {
        self.feature_key = Some(key.into());
        self
    }

    /// rate limiter 가중치 설정.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// 전송 계층 응답.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// 상태 코드
    pub status: u16,
    /// 응답 헤더 (소문자 이름)
    pub headers: HashMap<String, String>,
    /// 본문
    pub body: String,
}

impl HttpResponse {
    /// 새 응답 생성.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// 2xx 응답인지 확인.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 본문을 JSON으로 역직렬화.
    ///
    /// 빈 본문은 `null`로 취급합니다.
    pub fn json<T: DeserializeOwned>(&self) -> ExchangeResult<T> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// reqwest 기반 HTTP 전송 계층.
///
/// 요청 타임아웃은 [`RequestExecutor`](crate::retry::RequestExecutor)가
/// 시도 단위로 적용하므로 여기서는 연결 타임아웃만 설정합니다.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 기본 설정으로 생성.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성에 실패하면 `ExchangeError::Config`를 반환합니다.
    pub fn new() -> ExchangeResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ExchangeError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// 미리 구성된 reqwest 클라이언트 사용.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> ExchangeResult<HttpResponse> {
        let mut builder = self.client.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
