//! 주입 가능한 전송 계층.
//!
//! - [`HttpTransport`]: 단일 요청/응답 (기본 구현 [`ReqwestTransport`])
//! - [`StreamConnector`]: 양방향 프레임 스트림 (기본 구현 [`TungsteniteConnector`])

pub mod http;
pub mod websocket;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::error::{ExchangeError, ExchangeResult};

pub use http::{HttpRequest, HttpResponse, Method, ReqwestTransport, CORRELATION_HEADER};
pub use websocket::TungsteniteConnector;

/// 스트리밍 연결에서 주고받는 프레임.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 텍스트 프레임
    Text(String),
    /// 바이너리 프레임
    Binary(Vec<u8>),
    /// 프로토콜 레벨 ping
    Ping(Vec<u8>),
    /// 프로토콜 레벨 pong
    Pong(Vec<u8>),
    /// 연결 종료
    Close,
}

impl Frame {
    /// 텍스트 프레임 생성.
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }
}

/// 송신 방향 프레임 싱크.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ExchangeError> + Send>>;

/// 수신 방향 프레임 스트림.
pub type FrameStream = Pin<Box<dyn Stream<Item = ExchangeResult<Frame>> + Send>>;

/// 단일 요청 전송 계층.
///
/// 2xx가 아닌 응답도 `Ok`로 반환해야 합니다. 상태 코드 분류는
/// [`RequestExecutor`](crate::retry::RequestExecutor)가 담당합니다.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// 요청 하나를 전송합니다.
    async fn execute(&self, request: &HttpRequest) -> ExchangeResult<HttpResponse>;
}

/// 스트리밍 연결 생성기.
///
/// 호출될 때마다 새로운 물리 연결을 엽니다.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// 연결을 열고 송신/수신 절반을 반환합니다.
    async fn connect(&self) -> ExchangeResult<(FrameSink, FrameStream)>;

    /// 프로토콜 레벨 ping 프레임 지원 여부.
    ///
    /// `false`면 heartbeat가 애플리케이션 ping 텍스트를 보냅니다.
    fn supports_ping_frames(&self) -> bool {
        true
    }
}
