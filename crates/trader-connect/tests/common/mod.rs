//! trader-connect 통합 테스트 공용 테스트 더블

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use trader_connect::{
    ExchangeError, ExchangeResult, Frame, FrameSink, FrameStream, HttpRequest, HttpResponse,
    HttpTransport, StreamConnector,
};

/// 모의 스트리밍 연결 하나의 서버 측.
pub struct MockServer {
    /// 클라이언트가 보낸 프레임
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    /// 클라이언트로 보낼 프레임(또는 에러)
    pub inbound: mpsc::UnboundedSender<ExchangeResult<Frame>>,
}

impl MockServer {
    /// 클라이언트가 보낸 다음 프레임. `timeout`이 지나면 테스트 실패.
    pub async fn recv(&mut self, timeout: Duration) -> Frame {
        tokio::time::timeout(timeout, self.outbound.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed the connection")
    }

    /// 클라이언트가 보낸 다음 텍스트 프레임을 JSON으로 파싱. ping은 건너뜀.
    pub async fn recv_json(&mut self, timeout: Duration) -> Value {
        loop {
            match self.recv(timeout).await {
                Frame::Text(text) => {
                    return serde_json::from_str(&text).expect("client sent invalid JSON")
                }
                Frame::Ping(_) | Frame::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// 대기 없이 이미 도착한 프레임.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_next().ok().flatten()
    }

    /// 클라이언트로 JSON 텍스트 프레임 전송.
    pub fn push_json(&self, value: Value) {
        self.inbound
            .unbounded_send(Ok(Frame::Text(value.to_string())))
            .expect("client stream dropped");
    }

    /// 클라이언트로 프레임 전송.
    pub fn push(&self, frame: Frame) {
        self.inbound
            .unbounded_send(Ok(frame))
            .expect("client stream dropped");
    }

    /// 갑작스러운 연결 끊김: 클라이언트의 수신 스트림이 끝난다.
    pub fn drop_connection(self) {
        drop(self);
    }
}

/// 채널 기반 `StreamConnector`. 연결에 성공할 때마다 `accept`로
/// `MockServer`를 넘겨줍니다.
pub struct MockConnector {
    servers: tokio::sync::mpsc::UnboundedSender<MockServer>,
    accepted: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<MockServer>>,
    fail_next: AtomicU32,
    connects: AtomicU32,
    ping_frames: bool,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Self::with_ping_frames(true)
    }

    pub fn with_ping_frames(ping_frames: bool) -> Arc<Self> {
        let (servers, accepted) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Self {
            servers,
            accepted: tokio::sync::Mutex::new(accepted),
            fail_next: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            ping_frames,
        })
    }

    /// 다음 `n`번의 연결 시도를 실패시킴.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// 실패를 포함한 전체 연결 시도 횟수.
    pub fn connect_attempts(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// 다음 연결 성공을 기다림.
    pub async fn accept(&self, timeout: Duration) -> MockServer {
        let mut accepted = self.accepted.lock().await;
        tokio::time::timeout(timeout, accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self) -> ExchangeResult<(FrameSink, FrameStream)> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ExchangeError::Network("connection refused".to_string()));
        }

        let (client_tx, server_rx) = mpsc::unbounded::<Frame>();
        let (server_tx, client_rx) = mpsc::unbounded::<ExchangeResult<Frame>>();

        let _ = self.servers.send(MockServer {
            outbound: server_rx,
            inbound: server_tx,
        });

        let sink = client_tx.sink_map_err(|e| ExchangeError::Disconnected(e.to_string()));
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }

    fn supports_ping_frames(&self) -> bool {
        self.ping_frames
    }
}

/// 정해진 응답 순서를 재생하고 받은 요청을 모두 기록하는 `HttpTransport`.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ExchangeResult<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ExchangeResult<HttpResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// 상태 코드/본문만으로 된 응답 순서.
    pub fn statuses(responses: &[(u16, &str)]) -> Arc<Self> {
        Self::new(
            responses
                .iter()
                .map(|(status, body)| Ok(HttpResponse::new(*status, *body)))
                .collect(),
        )
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: &HttpRequest) -> ExchangeResult<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(500, "script exhausted")))
    }
}
