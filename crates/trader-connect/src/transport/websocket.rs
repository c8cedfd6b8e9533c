//! tokio-tungstenite 기반 WebSocket 커넥터.

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info};

use super::{Frame, FrameSink, FrameStream, StreamConnector};
use crate::error::{ExchangeError, ExchangeResult};

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

/// 수신 메시지를 프레임으로 변환. 원시 프레임은 무시합니다.
fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(_) => Some(Frame::Close),
        Message::Frame(_) => None,
    }
}

/// WebSocket 커넥터.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    url: String,
}

impl TungsteniteConnector {
    /// 새 커넥터 생성 (`wss://...`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// 접속 URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StreamConnector for TungsteniteConnector {
    async fn connect(&self) -> ExchangeResult<(FrameSink, FrameStream)> {
        debug!(url = %self.url, "Opening WebSocket connection");

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ExchangeError::Network(format!("WebSocket 연결 실패: {}", e)))?;
        let (write, read) = ws_stream.split();

        let sink = write.with(|frame: Frame| future::ready(Ok::<_, ExchangeError>(Message::from(frame))));
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => frame_from_message(message).map(Ok),
                Err(e) => Some(Err(ExchangeError::from(e))),
            })
        });

        info!(url = %self.url, "WebSocket connected");
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_message_conversion() {
        assert_eq!(Message::from(Frame::text("hi")), Message::Text("hi".into()));
        assert_eq!(Message::from(Frame::Ping(vec![1])), Message::Ping(vec![1]));
        assert_eq!(Message::from(Frame::Close), Message::Close(None));

        assert_eq!(
            frame_from_message(Message::Pong(vec![2])),
            Some(Frame::Pong(vec![2]))
        );
        assert_eq!(frame_from_message(Message::Close(None)), Some(Frame::Close));
    }

    #[tokio::test]
    async fn test_connect_failure_is_network_error() {
        // 아무도 듣지 않는 포트
        let connector = TungsteniteConnector::new("ws://127.0.0.1:9/stream");
        let err = match connector.connect().await {
            Ok(_) => panic!("connection should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ExchangeError::Network(_)));
        assert!(connector.supports_ping_frames());
    }
}
