//! 스트리밍 연결 상태 머신.
//!
//! 물리 연결 하나는 전용 actor 태스크가 단독으로 소유합니다. 외부에서는
//! 명령 채널로 프레임을 보내고, `watch` 채널로 상태를 관찰하며,
//! `broadcast` 채널로 [`ConnectionEvent`]를 구독합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──open──> Connected
//!                                 ↑                    │
//!                                 └──[끊김/heartbeat 타임아웃, 백오프 후]
//!
//! Connected ──disconnect()──> Disconnecting ──> Disconnected
//! ```
//!
//! 최초 연결 실패만 `connect()`의 에러로 반환되며, 이후의 실패는 재연결
//! 경로로 처리됩니다. 재연결 횟수를 모두 소진하면
//! [`ConnectionEvent::MaxRetriesExceeded`]를 보내고 `Disconnected`에서 멈춥니다.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{ExchangeError, ExchangeResult};
use crate::transport::{Frame, FrameSink, FrameStream, StreamConnector};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// 연결 이벤트.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// 상태 전이
    StateChanged(ConnectionState),
    /// 재연결 대기 시작
    Reconnecting { attempt: u32, delay: Duration },
    /// 최초 연결이 아닌 연결 성공
    Reconnected,
    /// 재연결 시도 소진 (종료 상태)
    MaxRetriesExceeded { attempts: u32 },
    /// heartbeat 응답 없음으로 연결 강제 종료
    HeartbeatTimeout,
    /// 연결을 끊지 않는 에러 (예: 디코딩 불가 프레임)
    Error(String),
}

/// 재연결 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 재연결 활성화 여부
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 최대 재연결 시도 횟수 (0 = 무제한)
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
    /// 첫 재연결 대기 시간 (밀리초)
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// 백오프 배수
    #[serde(default = "default_reconnect_multiplier")]
    pub multiplier: f64,
    /// 최대 대기 시간 (밀리초)
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 무작위 변동 비율
    #[serde(default = "default_reconnect_jitter")]
    pub jitter: f64,
}

fn default_true() -> bool {
    true
}
fn default_reconnect_max_attempts() -> u32 {
    10
}
fn default_reconnect_initial_delay_ms() -> u64 {
    500
}
fn default_reconnect_multiplier() -> f64 {
    2.0
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_reconnect_jitter() -> f64 {
    0.1
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_reconnect_max_attempts(),
            initial_delay_ms: default_reconnect_initial_delay_ms(),
            multiplier: default_reconnect_multiplier(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            jitter: default_reconnect_jitter(),
        }
    }
}

impl ReconnectConfig {
    /// 재연결을 하지 않는 설정.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// 백오프 정책 생성.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }
}

/// Heartbeat 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// heartbeat 활성화 여부
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// ping 간격 (밀리초)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// pong 대기 시간 (밀리초)
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
    /// 네이티브 ping 프레임이 없을 때 보내는 애플리케이션 ping
    #[serde(default = "default_ping_payload")]
    pub ping_payload: String,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_ping_payload() -> String {
    r#"{"op":"ping"}"#.to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
            ping_payload: default_ping_payload(),
        }
    }
}

impl HeartbeatConfig {
    /// ping 간격.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// pong 대기 시간.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 연결 관리자 설정.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// 디코딩된 수신 메시지.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// JSON으로 파싱된 프레임
    Json(Value),
    /// JSON이 아닌 원문
    Text(String),
}

impl InboundMessage {
    /// 텍스트를 JSON으로 파싱하고, 실패하면 원문을 유지합니다.
    pub fn decode(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => InboundMessage::Json(value),
            Err(_) => InboundMessage::Text(text),
        }
    }
}

/// 애플리케이션 레벨 pong 판별 기본 규칙.
///
/// `op`/`type`/`event` 필드가 `"pong"`이거나 원문이 `pong`이면 pong입니다.
pub fn is_application_pong(message: &InboundMessage) -> bool {
    match message {
        InboundMessage::Json(value) => ["op", "type", "event"]
            .iter()
            .any(|key| value.get(*key).and_then(Value::as_str) == Some("pong")),
        InboundMessage::Text(text) => text.trim().eq_ignore_ascii_case("pong"),
    }
}

/// 연결 수명주기 콜백.
///
/// 모든 콜백은 연결 actor 태스크에서 호출됩니다.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// 연결이 열릴 때마다 호출됩니다.
    ///
    /// 반환한 프레임은 수신 프레임을 처리하기 전에 순서대로 전송됩니다.
    async fn on_open(&self) -> Vec<Frame> {
        Vec::new()
    }

    /// 수신 메시지 (pong 제외).
    fn on_message(&self, message: InboundMessage);

    /// 물리 연결이 닫힘 (재연결 전).
    fn on_close(&self) {}

    /// 연결 관리자가 종료됨 (disconnect 또는 재연결 소진).
    fn on_terminated(&self) {}

    /// 애플리케이션 레벨 pong인지 판별.
    fn is_pong(&self, message: &InboundMessage) -> bool {
        is_application_pong(message)
    }
}

enum Command {
    Send(Frame),
}

struct Session {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// 연결 관리자.
pub struct ConnectionManager {
    connector: Arc<dyn StreamConnector>,
    config: ConnectionConfig,
    handler: Arc<dyn ConnectionHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    /// 새 연결 관리자 생성. 연결은 `connect()` 호출 시 열립니다.
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector,
            config,
            handler,
            state: Arc::new(state),
            events,
            session: Mutex::new(None),
        }
    }

    /// 설정 반환.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 현재 상태.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 연결 여부.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 상태 변화를 관찰하는 수신자.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 연결 이벤트 구독.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// 연결을 엽니다.
    ///
    /// 이미 연결(또는 재연결) 중이면 즉시 반환합니다. 최초 연결 시도가
    /// 실패하면 그 에러를 반환합니다.
    pub async fn connect(&self) -> ExchangeResult<()> {
        let ready = {
            let mut session = self.lock_session();
            if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
                return Ok(());
            }

            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let shutdown = CancellationToken::new();

            let actor = ConnectionActor {
                connector: self.connector.clone(),
                backoff: self.config.reconnect.backoff(),
                config: self.config.clone(),
                handler: self.handler.clone(),
                state: self.state.clone(),
                events: self.events.clone(),
                commands: commands_rx,
                shutdown: shutdown.clone(),
            };
            let task = tokio::spawn(actor.run(ready_tx));

            *session = Some(Session {
                commands: commands_tx,
                shutdown,
                task,
            });
            ready_rx
        };

        match ready.await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Disconnected(
                "connection task ended before opening".to_string(),
            )),
        }
    }

    /// 연결을 닫고 모든 타이머를 정리합니다.
    ///
    /// actor 태스크가 끝날 때까지 기다립니다.
    pub async fn disconnect(&self) {
        let session = self.lock_session().take();
        if let Some(session) = session {
            session.shutdown.cancel();
            if let Err(e) = session.task.await {
                warn!(error = %e, "Connection task ended abnormally");
            }
        }
    }

    /// 프레임 전송.
    ///
    /// 연결이 끊긴 동안 보낸 프레임은 다음 연결에서 폐기됩니다.
    pub fn send(&self, frame: Frame) -> ExchangeResult<()> {
        let session = self.lock_session();
        match session.as_ref() {
            Some(session) if !session.task.is_finished() => session
                .commands
                .send(Command::Send(frame))
                .map_err(|_| ExchangeError::Disconnected("connection task stopped".to_string())),
            _ => Err(ExchangeError::Disconnected("not connected".to_string())),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.lock_session().take() {
            session.shutdown.cancel();
        }
    }
}

/// 세션(물리 연결 하나)이 끝난 이유.
enum SessionEnd {
    Shutdown,
    Dropped(String),
    HeartbeatTimeout,
}

struct ConnectionActor {
    connector: Arc<dyn StreamConnector>,
    config: ConnectionConfig,
    backoff: ExponentialBackoff,
    handler: Arc<dyn ConnectionHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
}

impl ConnectionActor {
    async fn run(mut self, ready: oneshot::Sender<ExchangeResult<()>>) {
        self.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ExchangeError::Disconnected(
                "disconnected before opening".to_string(),
            )),
            result = self.connector.connect() => result,
        };
        let mut pending = match opened {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!(error = %e, "Initial connection failed");
                self.set_state(ConnectionState::Disconnected);
                let _ = ready.send(Err(e));
                return;
            }
        };

        let mut ready = Some(ready);
        let mut first = true;
        let mut attempt: u32 = 0;

        loop {
            if let Some((sink, stream)) = pending.take() {
                attempt = 0;
                let end = self.session(sink, stream, &mut ready, first).await;
                first = false;
                self.handler.on_close();

                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::HeartbeatTimeout => {
                        warn!("Heartbeat timed out, forcing reconnect");
                        self.emit(ConnectionEvent::HeartbeatTimeout);
                    }
                    SessionEnd::Dropped(reason) => {
                        warn!(reason = %reason, "Connection dropped");
                    }
                }

                if !self.config.reconnect.enabled {
                    break;
                }
                self.set_state(ConnectionState::Connecting);
            }

            attempt += 1;
            let max_attempts = self.config.reconnect.max_attempts;
            if max_attempts != 0 && attempt > max_attempts {
                error!(attempts = max_attempts, "Max reconnect attempts exceeded");
                self.emit(ConnectionEvent::MaxRetriesExceeded {
                    attempts: max_attempts,
                });
                break;
            }

            let delay = self.backoff.delay(attempt);
            info!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connector.connect() => result,
            };
            match opened {
                Ok(pair) => pending = Some(pair),
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        let cancelled = self.shutdown.is_cancelled();
        if cancelled {
            self.set_state(ConnectionState::Disconnecting);
        }
        self.drain_commands();
        self.set_state(ConnectionState::Disconnected);
        if let Some(ready) = ready.take() {
            let err = if cancelled {
                ExchangeError::Disconnected("disconnected before opening".to_string())
            } else {
                ExchangeError::ReconnectExhausted {
                    attempts: self.config.reconnect.max_attempts,
                }
            };
            let _ = ready.send(Err(err));
        }
        self.handler.on_terminated();
        debug!("Connection task stopped");
    }

    /// 연결 하나를 끝날 때까지 구동합니다.
    async fn session(
        &mut self,
        mut sink: FrameSink,
        mut stream: FrameStream,
        ready: &mut Option<oneshot::Sender<ExchangeResult<()>>>,
        first: bool,
    ) -> SessionEnd {
        // 이전 연결에서 남은 명령은 유효하지 않다
        self.drain_commands();

        for frame in self.handler.on_open().await {
            if let Err(e) = sink.send(frame).await {
                return SessionEnd::Dropped(format!("failed to replay frame: {}", e));
            }
        }

        self.set_state(ConnectionState::Connected);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }
        if first {
            info!("Connected");
        } else {
            info!("Reconnected");
            self.emit(ConnectionEvent::Reconnected);
        }

        let heartbeat = self.config.heartbeat.clone();
        let native_ping = self.connector.supports_ping_frames();
        let mut ping = interval_at(Instant::now() + heartbeat.interval(), heartbeat.interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Disconnecting);
                    let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(Frame::Close)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Send(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            return SessionEnd::Dropped(format!("send failed: {}", e));
                        }
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Frame::Text(text))) => {
                        self.dispatch(InboundMessage::decode(text), &mut deadline);
                    }
                    Some(Ok(Frame::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.dispatch(InboundMessage::decode(text), &mut deadline),
                        Err(e) => {
                            warn!(error = %e, "Dropping undecodable binary frame");
                            self.emit(ConnectionEvent::Error(format!(
                                "undecodable binary frame: {}",
                                e
                            )));
                        }
                    },
                    Some(Ok(Frame::Ping(data))) => {
                        debug!("Ping received, sending pong");
                        if let Err(e) = sink.send(Frame::Pong(data)).await {
                            return SessionEnd::Dropped(format!("pong failed: {}", e));
                        }
                    }
                    Some(Ok(Frame::Pong(_))) => {
                        deadline = None;
                    }
                    Some(Ok(Frame::Close)) => {
                        return SessionEnd::Dropped("closed by server".to_string());
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".to_string()),
                },
                _ = ping.tick(), if heartbeat.enabled => {
                    let frame = if native_ping {
                        Frame::Ping(Vec::new())
                    } else {
                        Frame::Text(heartbeat.ping_payload.clone())
                    };
                    debug!(native_ping, "Sending heartbeat ping");
                    if let Err(e) = sink.send(frame).await {
                        return SessionEnd::Dropped(format!("ping failed: {}", e));
                    }
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + heartbeat.timeout());
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    return SessionEnd::HeartbeatTimeout;
                }
            }
        }
    }

    fn dispatch(&self, message: InboundMessage, deadline: &mut Option<Instant>) {
        if self.handler.is_pong(&message) {
            *deadline = None;
            return;
        }
        self.handler.on_message(message);
    }

    fn drain_commands(&mut self) {
        let mut dropped = 0usize;
        while self.commands.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded frames queued for a closed connection");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // 구독자가 없어도 무시
        let _ = self.events.send(event);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
