//! 채널 멀티플렉서.
//!
//! 하나의 물리 연결 위에 여러 논리 구독을 유지합니다.
//!
//! - 구독은 채널 ID 단위로 등록되고 구독자 수로 참조 카운트됩니다.
//! - 연결이 (재)수립될 때마다 등록된 모든 구독을 등록 순서대로 다시 보내며,
//!   재전송이 끝나기 전에는 수신 프레임을 처리하지 않습니다.
//! - 수신 프레임은 [`ChannelProtocol`]이 추출한 채널 ID로 라우팅됩니다.
//! - 마지막 구독자가 스트림을 drop하면 구독 해제 메시지를 보내고 기록을 지웁니다.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::auth::{with_credentials, AuthProvider};
use crate::connection::{
    is_application_pong, ConnectionConfig, ConnectionEvent, ConnectionHandler, ConnectionManager,
    ConnectionState, InboundMessage,
};
use crate::error::{ExchangeError, ExchangeResult};
use crate::transport::{Frame, StreamConnector};

/// 거래소 메시지 형식에 대한 최소한의 지식.
pub trait ChannelProtocol: Send + Sync {
    /// 수신 프레임의 채널 ID. 라우팅 대상이 아니면 `None`.
    fn channel_of(&self, frame: &Value) -> Option<String>;

    /// 구독 해제 메시지.
    fn unsubscribe_message(&self, channel_id: &str, request: &Value) -> Value;

    /// 구독자에게 전달할 페이로드 추출.
    fn payload(&self, frame: Value) -> Value {
        frame
    }

    /// 애플리케이션 레벨 pong 판별.
    fn is_pong(&self, message: &InboundMessage) -> bool {
        is_application_pong(message)
    }
}

/// 채널 ID가 JSON 필드 하나에 들어 있는 프로토콜.
///
/// 구독 해제는 `{"op": "unsubscribe", "channel": <id>}`로 보냅니다.
#[derive(Debug, Clone)]
pub struct JsonChannelProtocol {
    channel_field: String,
}

impl JsonChannelProtocol {
    /// 채널 ID 필드 이름을 지정해 생성.
    pub fn new(channel_field: impl Into<String>) -> Self {
        Self {
            channel_field: channel_field.into(),
        }
    }
}

impl Default for JsonChannelProtocol {
    fn default() -> Self {
        Self::new("channel")
    }
}

impl ChannelProtocol for JsonChannelProtocol {
    fn channel_of(&self, frame: &Value) -> Option<String> {
        frame
            .get(&self.channel_field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn unsubscribe_message(&self, channel_id: &str, _request: &Value) -> Value {
        json!({ "op": "unsubscribe", "channel": channel_id })
    }
}

/// 등록된 구독 정보.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    /// 채널 ID (예: "orderbook:BTC-USD")
    pub channel_id: String,
    /// 구독 요청 (재연결 시 그대로 재전송)
    pub request: Value,
    /// 구독 시작 시각
    pub active_since: DateTime<Utc>,
    /// 인증 구독 여부
    pub authenticated: bool,
}

struct ChannelEntry {
    seq: u64,
    info: SubscriptionInfo,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Value>>,
}

#[derive(Default)]
struct Registry {
    connected: bool,
    /// on_open마다 증가하는 연결 세대
    generation: u64,
    next_seq: u64,
    next_subscriber: u64,
    channels: HashMap<String, ChannelEntry>,
}

impl Registry {
    fn ordered(&self) -> Vec<SubscriptionInfo> {
        let mut entries: Vec<&ChannelEntry> = self.channels.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.info.clone()).collect()
    }
}

struct Registration {
    subscriber_id: u64,
    receiver: mpsc::UnboundedReceiver<Value>,
    /// 연결된 상태에서 새로 만든 채널이면 해당 연결 세대
    send_in_generation: Option<u64>,
    info: SubscriptionInfo,
}

/// 멀티플렉서 공유 상태. 연결 actor의 핸들러이기도 합니다.
struct MuxState {
    protocol: Arc<dyn ChannelProtocol>,
    auth: Option<Arc<dyn AuthProvider>>,
    registry: Mutex<Registry>,
    connection: OnceLock<Weak<ConnectionManager>>,
}

impl MuxState {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, frame: Frame) -> ExchangeResult<()> {
        match self.connection.get().and_then(Weak::upgrade) {
            Some(connection) => connection.send(frame),
            None => Err(ExchangeError::Disconnected("connection dropped".to_string())),
        }
    }

    fn register(&self, channel_id: &str, request: Value, authenticated: bool) -> Registration {
        let mut registry = self.lock();
        let subscriber_id = registry.next_subscriber;
        registry.next_subscriber += 1;
        let seq = registry.next_seq;
        let connected = registry.connected;
        let generation = registry.generation;

        let (tx, receiver) = mpsc::unbounded_channel();
        let mut created = false;
        let entry = registry
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                created = true;
                ChannelEntry {
                    seq,
                    info: SubscriptionInfo {
                        channel_id: channel_id.to_string(),
                        request,
                        active_since: Utc::now(),
                        authenticated,
                    },
                    subscribers: HashMap::new(),
                }
            });
        entry.subscribers.insert(subscriber_id, tx);
        let info = entry.info.clone();

        if created {
            registry.next_seq += 1;
            debug!(channel_id, "Subscription registered");
        }

        Registration {
            subscriber_id,
            receiver,
            send_in_generation: (created && connected).then_some(generation),
            info,
        }
    }

    /// 연결 세대가 바뀌지 않았을 때만 구독 프레임을 보냅니다.
    ///
    /// 세대가 바뀌었다면 재전송이 이미 이 구독을 포함했습니다.
    fn send_if_current(&self, generation: u64, channel_id: &str, frame: Frame) {
        let registry = self.lock();
        if registry.connected
            && registry.generation == generation
            && registry.channels.contains_key(channel_id)
        {
            if let Err(e) = self.send(frame) {
                debug!(channel_id, error = %e, "Subscribe deferred until reconnect");
            }
        }
    }

    fn release(&self, channel_id: &str, subscriber_id: u64) {
        let mut registry = self.lock();
        let Some(entry) = registry.channels.get_mut(channel_id) else {
            return;
        };
        entry.subscribers.remove(&subscriber_id);
        if !entry.subscribers.is_empty() {
            return;
        }

        let request = entry.info.request.clone();
        registry.channels.remove(channel_id);
        debug!(channel_id, "Last subscriber released");

        if registry.connected {
            let message = self.protocol.unsubscribe_message(channel_id, &request);
            if let Err(e) = self.send(Frame::Text(message.to_string())) {
                debug!(channel_id, error = %e, "Unsubscribe not sent");
            }
        }
    }

    async fn subscribe_frame(&self, info: &SubscriptionInfo) -> ExchangeResult<Frame> {
        let request = if info.authenticated {
            let auth = self.auth.as_ref().ok_or_else(|| {
                ExchangeError::Auth("no auth provider configured".to_string())
            })?;
            let credentials = auth.credentials(&info.channel_id, &info.request).await?;
            with_credentials(&info.request, credentials)?
        } else {
            info.request.clone()
        };
        Ok(Frame::Text(request.to_string()))
    }
}

#[async_trait]
impl ConnectionHandler for MuxState {
    async fn on_open(&self) -> Vec<Frame> {
        let snapshot = {
            let mut registry = self.lock();
            registry.connected = true;
            registry.generation += 1;
            registry.ordered()
        };

        let mut frames = Vec::with_capacity(snapshot.len());
        for info in &snapshot {
            match self.subscribe_frame(info).await {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!(
                    channel_id = %info.channel_id,
                    error = %e,
                    "Failed to build subscription, skipping replay"
                ),
            }
        }

        if !frames.is_empty() {
            info!(count = frames.len(), "Replaying subscriptions");
        }
        frames
    }

    fn on_message(&self, message: InboundMessage) {
        let frame = match message {
            InboundMessage::Json(frame) => frame,
            InboundMessage::Text(text) => {
                debug!(len = text.len(), "Dropping non-JSON frame");
                return;
            }
        };

        let Some(channel_id) = self.protocol.channel_of(&frame) else {
            debug!("Dropping frame without channel");
            return;
        };

        let registry = self.lock();
        match registry.channels.get(&channel_id) {
            Some(entry) => {
                let payload = self.protocol.payload(frame);
                for subscriber in entry.subscribers.values() {
                    // 수신자가 사라진 구독자는 drop 시 정리된다
                    let _ = subscriber.send(payload.clone());
                }
            }
            None => debug!(channel_id = %channel_id, "Dropping frame for unknown channel"),
        }
    }

    fn on_close(&self) {
        self.lock().connected = false;
    }

    fn on_terminated(&self) {
        let mut registry = self.lock();
        registry.connected = false;
        let count = registry.channels.len();
        // 송신측이 drop되면 모든 스트림이 끝난다
        registry.channels.clear();
        if count > 0 {
            info!(count, "Connection terminated, ending subscriptions");
        }
    }

    fn is_pong(&self, message: &InboundMessage) -> bool {
        self.protocol.is_pong(message)
    }
}

/// 채널 멀티플렉서.
pub struct Multiplexer {
    connection: Arc<ConnectionManager>,
    state: Arc<MuxState>,
}

impl Multiplexer {
    /// 새 멀티플렉서 생성.
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        config: ConnectionConfig,
        protocol: Arc<dyn ChannelProtocol>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        let state = Arc::new(MuxState {
            protocol,
            auth,
            registry: Mutex::new(Registry::default()),
            connection: OnceLock::new(),
        });
        let connection = Arc::new(ConnectionManager::new(connector, config, state.clone()));
        let _ = state.connection.set(Arc::downgrade(&connection));

        Self { connection, state }
    }

    /// 하부 연결 관리자.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// 채널을 구독합니다.
    ///
    /// 같은 채널의 첫 구독자가 보낸 요청이 재연결 시 재전송됩니다.
    /// 연결이 없으면 연결을 엽니다.
    pub async fn subscribe<T: DeserializeOwned>(
        &self,
        channel_id: impl Into<String>,
        request: Value,
    ) -> ExchangeResult<SubscriptionStream<T>> {
        self.subscribe_inner(channel_id.into(), request, false)
            .await
    }

    /// 인증이 필요한 채널을 구독합니다.
    ///
    /// 전송할 때마다 [`AuthProvider`]에서 새 자격 증명을 받아 `auth` 필드에 붙입니다.
    pub async fn subscribe_private<T: DeserializeOwned>(
        &self,
        channel_id: impl Into<String>,
        request: Value,
    ) -> ExchangeResult<SubscriptionStream<T>> {
        if self.state.auth.is_none() {
            return Err(ExchangeError::Auth(
                "no auth provider configured".to_string(),
            ));
        }
        if !request.is_object() {
            return Err(ExchangeError::Auth(
                "authenticated subscription request must be a JSON object".to_string(),
            ));
        }
        self.subscribe_inner(channel_id.into(), request, true).await
    }

    async fn subscribe_inner<T: DeserializeOwned>(
        &self,
        channel_id: String,
        request: Value,
        authenticated: bool,
    ) -> ExchangeResult<SubscriptionStream<T>> {
        let registration = self.state.register(&channel_id, request, authenticated);
        let stream = SubscriptionStream {
            channel_id: channel_id.clone(),
            subscriber_id: registration.subscriber_id,
            receiver: registration.receiver,
            state: self.state.clone(),
            _marker: PhantomData,
        };

        if let Some(generation) = registration.send_in_generation {
            let frame = self.state.subscribe_frame(&registration.info).await?;
            self.state.send_if_current(generation, &channel_id, frame);
        }

        if self.connection.state() == ConnectionState::Disconnected {
            self.connection.connect().await?;
        }
        Ok(stream)
    }

    /// 연결을 엽니다.
    pub async fn connect(&self) -> ExchangeResult<()> {
        self.connection.connect().await
    }

    /// 연결을 닫고 모든 구독 스트림을 종료합니다.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// 연결 여부.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// 연결 이벤트 구독.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.events()
    }

    /// 등록 순서대로 정렬된 활성 구독 목록.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.state.lock().ordered()
    }

    /// 채널의 구독자 수.
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .map_or(0, |entry| entry.subscribers.len())
    }
}

/// 채널 하나에 대한 타입 있는 메시지 스트림.
///
/// 역직렬화할 수 없는 메시지는 건너뜁니다. 연결 관리자가 종료되면
/// 스트림도 끝납니다.
pub struct SubscriptionStream<T> {
    channel_id: String,
    subscriber_id: u64,
    receiver: mpsc::UnboundedReceiver<Value>,
    state: Arc<MuxState>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SubscriptionStream<T> {
    /// 채널 ID.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl<T: DeserializeOwned> Stream for SubscriptionStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(value)) => match serde_json::from_value::<T>(value) {
                    Ok(item) => return Poll::Ready(Some(item)),
                    Err(e) => warn!(
                        channel_id = %this.channel_id,
                        error = %e,
                        "Skipping undecodable message"
                    ),
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for SubscriptionStream<T> {
    fn drop(&mut self) {
        self.state.release(&self.channel_id, self.subscriber_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde::Deserialize;

    fn state() -> Arc<MuxState> {
        Arc::new(MuxState {
            protocol: Arc::new(JsonChannelProtocol::default()),
            auth: None,
            registry: Mutex::new(Registry::default()),
            connection: OnceLock::new(),
        })
    }

    fn stream<T>(state: &Arc<MuxState>, channel_id: &str, request: Value) -> SubscriptionStream<T> {
        let registration = state.register(channel_id, request, false);
        SubscriptionStream {
            channel_id: channel_id.to_string(),
            subscriber_id: registration.subscriber_id,
            receiver: registration.receiver,
            state: state.clone(),
            _marker: PhantomData,
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Trade {
        channel: String,
        price: f64,
    }

    #[test]
    fn test_json_protocol() {
        let protocol = JsonChannelProtocol::default();
        assert_eq!(
            protocol.channel_of(&json!({"channel": "trades:BTC", "price": 1})),
            Some("trades:BTC".to_string())
        );
        assert_eq!(protocol.channel_of(&json!({"topic": "trades:BTC"})), None);
        assert_eq!(
            protocol.unsubscribe_message("trades:BTC", &json!({})),
            json!({"op": "unsubscribe", "channel": "trades:BTC"})
        );

        let custom = JsonChannelProtocol::new("topic");
        assert_eq!(
            custom.channel_of(&json!({"topic": "book"})),
            Some("book".to_string())
        );
    }

    #[tokio::test]
    async fn test_routes_by_channel_and_skips_undecodable() {
        let state = state();
        let mut trades: SubscriptionStream<Trade> = stream(&state, "trades:BTC", json!({}));
        let mut other: SubscriptionStream<Trade> = stream(&state, "trades:ETH", json!({}));

        state.on_message(InboundMessage::Json(json!({"channel": "trades:BTC", "price": "bad"})));
        state.on_message(InboundMessage::Json(json!({"channel": "trades:BTC", "price": 42.5})));
        state.on_message(InboundMessage::Json(json!({"channel": "unknown", "price": 1.0})));
        state.on_message(InboundMessage::Text("not json".to_string()));

        let trade = trades.next().await.unwrap();
        assert_eq!(trade.price, 42.5);
        assert_eq!(trade.channel, "trades:BTC");

        state.on_terminated();
        assert!(trades.next().await.is_none());
        assert!(other.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fan_out_and_reference_counting() {
        let state = state();
        let mut first: SubscriptionStream<Value> = stream(&state, "book", json!({"n": 1}));
        let second: SubscriptionStream<Value> = stream(&state, "book", json!({"n": 2}));

        // 첫 구독자의 요청이 유지됨
        assert_eq!(state.lock().ordered()[0].request, json!({"n": 1}));

        drop(second);
        assert_eq!(state.lock().channels["book"].subscribers.len(), 1);

        state.on_message(InboundMessage::Json(json!({"channel": "book", "bid": 1})));
        assert_eq!(first.next().await.unwrap()["bid"], 1);

        drop(first);
        assert!(state.lock().channels.is_empty());
    }

    #[tokio::test]
    async fn test_on_open_replays_in_registration_order() {
        let state = state();
        let _c: SubscriptionStream<Value> = stream(&state, "c", json!({"channel": "c"}));
        let _a: SubscriptionStream<Value> = stream(&state, "a", json!({"channel": "a"}));
        let _b: SubscriptionStream<Value> = stream(&state, "b", json!({"channel": "b"}));

        let frames = state.on_open().await;
        let channels: Vec<String> = frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Text(text) => serde_json::from_str::<Value>(&text).unwrap()["channel"]
                    .as_str()
                    .unwrap()
                    .to_string(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(channels, vec!["c", "a", "b"]);

        let registry = state.lock();
        assert!(registry.connected);
        assert_eq!(registry.generation, 1);
    }

    #[tokio::test]
    async fn test_private_replay_without_auth_is_skipped() {
        let state = state();
        let registration = state.register("orders", json!({"channel": "orders"}), true);
        let _orders: SubscriptionStream<Value> = SubscriptionStream {
            channel_id: "orders".to_string(),
            subscriber_id: registration.subscriber_id,
            receiver: registration.receiver,
            state: state.clone(),
            _marker: PhantomData,
        };

        assert!(state.on_open().await.is_empty());
    }
}
