//! MQTT transport to the controller peer.
//!
//! The [`Interface`] owns the broker connection. Its network loop runs on a
//! tokio task, decodes every inbound publish into [`Inbound`] items and hands
//! them to the single registered message handler on that same task.
//!
//! Outbound traffic never touches the client's bounded request channel
//! directly. Publishes, subscriptions and the final disconnect go through an
//! unbounded queue in call order; a publisher task awaits each one on the
//! current session's client, so a burst from a hook is delayed, never lost.
//!
//! Reconnects are explicit: after a fault the event loop is torn down and a
//! fresh client is built, as long as the configured [`ReconnectPolicy`]
//! allows another attempt.
//!
//! [`ReconnectPolicy`]: crate::config::ReconnectPolicy

use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{InterfaceConfig, ReconnectPolicy};
use crate::error::{PolyError, PolyResult};
use crate::protocol::{parse_envelope, Control, Envelope, Inbound, Outbound, Topics};

/// Outbound side of the transport, as seen by nodes and the controller.
pub trait Transport: Send + Sync {
    /// Profile number stamped on every envelope.
    fn profile_num(&self) -> &str;

    /// Publish a message on the node input topic.
    fn send(&self, message: &Outbound) -> PolyResult<()>;

    fn is_connected(&self) -> bool;

    /// Disconnect cleanly. Never blocks on acknowledgements.
    fn stop(&self);

    /// Reserve the single controller slot of this transport.
    fn claim_controller(&self) -> PolyResult<()>;

    /// Give the controller slot back.
    fn release_controller(&self);
}

/// Callback receiving decoded inbound items on the network task. Must not block.
pub type MessageHandler = Arc<dyn Fn(Inbound) + Send + Sync>;

static INTERFACE_EXISTS: AtomicBool = AtomicBool::new(false);

const REQUEST_CAPACITY: usize = 64;
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// How one broker session ended.
#[derive(Debug, PartialEq)]
enum SessionEnd {
    /// We asked for the disconnect
    Clean,
    /// Anything else; `was_connected` is true if CONNACK succeeded first
    Fault { reason: String, was_connected: bool },
}

/// Whether `event` ends the current session.
fn session_end(event: &Event, was_connected: bool) -> Option<SessionEnd> {
    let fault = |reason: String| {
        Some(SessionEnd::Fault {
            reason,
            was_connected,
        })
    };
    match event {
        Event::Incoming(Packet::ConnAck(ack)) if ack.code != ConnectReturnCode::Success => {
            error!("MQTT Failed to connect. Result code: {:?}", ack.code);
            fault(format!("{:?}", ack.code))
        }
        Event::Incoming(Packet::SubAck(ack))
            if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)) =>
        {
            warn!(pkid = ack.pkid, "MQTT Subscription failed. This is unusual.");
            fault("subscription refused".into())
        }
        Event::Incoming(Packet::Disconnect) => fault("broker closed the session".into()),
        Event::Outgoing(Outgoing::Disconnect) => Some(SessionEnd::Clean),
        _ => None,
    }
}

/// Attempt number of the next session, or `None` to give up.
///
/// The counter restarts at 1 after a session that got a CONNACK.
fn next_attempt(end: &SessionEnd, attempt: u32, policy: &ReconnectPolicy) -> Option<u32> {
    match end {
        SessionEnd::Clean => None,
        SessionEnd::Fault { was_connected, .. } => {
            let next = if *was_connected { 1 } else { attempt + 1 };
            policy.allows(next).then_some(next)
        }
    }
}

/// One queued outbound operation.
#[derive(Debug, Clone, PartialEq)]
enum Request {
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Subscribe(String),
    Disconnect,
}

impl Request {
    async fn execute(self, client: &AsyncClient) -> Result<(), ClientError> {
        match self {
            Self::Publish {
                topic,
                payload,
                retain,
            } => client.publish(topic, QoS::AtLeastOnce, retain, payload).await,
            Self::Subscribe(topic) => client.subscribe(topic, QoS::AtLeastOnce).await,
            Self::Disconnect => client.disconnect().await,
        }
    }
}

/// The process-wide MQTT interface.
pub struct Interface {
    config: InterfaceConfig,
    topics: Topics,
    broker: Mutex<(String, u16)>,
    client: RwLock<Option<AsyncClient>>,
    handler: RwLock<Option<MessageHandler>>,
    task: Mutex<Option<JoinHandle<()>>>,
    outbound: mpsc::UnboundedSender<Request>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    publisher: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    peer_connected: AtomicBool,
    running: AtomicBool,
    controller_claimed: AtomicBool,
}

impl Interface {
    /// Create the interface. Fails if one already exists in this process.
    pub fn new(config: InterfaceConfig) -> PolyResult<Arc<Self>> {
        if INTERFACE_EXISTS
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PolyError::Singleton("Interface"));
        }

        let topics = Topics::new(&config.namespace, &config.profile_num, &config.peer_id);
        let broker = (config.mqtt_host.clone(), config.mqtt_port);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        info!(
            profile_num = %config.profile_num,
            input = %topics.input,
            "NodeServer interface created"
        );

        Ok(Arc::new(Self {
            config,
            topics,
            broker: Mutex::new(broker),
            client: RwLock::new(None),
            handler: RwLock::new(None),
            task: Mutex::new(None),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            publisher: Mutex::new(None),
            connected: AtomicBool::new(false),
            peer_connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            controller_claimed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Last `connected` value announced by the peer.
    pub fn peer_connected(&self) -> bool {
        self.peer_connected.load(Ordering::SeqCst)
    }

    /// Register the inbound message handler, replacing any previous one.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Inbound) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Connect to the configured broker.
    pub fn start(self: &Arc<Self>) -> PolyResult<()> {
        let (host, port) = self.broker.lock().clone();
        self.connect(&host, port)
    }

    /// Connect to `host:port` and spawn the network loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16) -> PolyResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PolyError::Transport("interface already started".into()));
        }
        *self.broker.lock() = (host.to_string(), port);

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            PolyError::Transport(format!("no async runtime: {}", e))
        })?;

        info!("Connecting to MQTT... {}:{}", host, port);
        if let Some(requests) = self.outbound_rx.lock().take() {
            let this = Arc::clone(self);
            *self.publisher.lock() =
                Some(runtime.spawn(async move { this.publish_loop(requests).await }));
        }
        let this = Arc::clone(self);
        *self.task.lock() = Some(runtime.spawn(async move { this.network_loop().await }));
        Ok(())
    }

    /// Queue raw bytes for `topic`. Never blocks and never drops.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> PolyResult<()> {
        self.enqueue(Request::Publish {
            topic: topic.to_string(),
            payload,
            retain,
        })
    }

    /// Queue a subscription to each of `topics`.
    pub fn subscribe(&self, topics: &[&str]) -> PolyResult<()> {
        for topic in topics {
            self.enqueue(Request::Subscribe(topic.to_string()))?;
            info!("MQTT Subscribing to topic: {}", topic);
        }
        Ok(())
    }

    fn enqueue(&self, request: Request) -> PolyResult<()> {
        if self.client.read().is_none() {
            return Err(PolyError::Transport("MQTT client not started".into()));
        }
        self.outbound
            .send(request)
            .map_err(|_| PolyError::Transport("MQTT outbound queue closed".into()))
    }

    async fn publish_loop(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = requests.recv().await {
            let client = self.client.read().clone();
            let Some(client) = client else {
                warn!("MQTT client gone, dropping {:?}", request);
                continue;
            };
            if let Err(e) = request.execute(&client).await {
                warn!("MQTT Send Error: {}", e);
            }
        }
        debug!("MQTT publisher finished");
    }

    fn connection_envelope(&self, connected: bool) -> Vec<u8> {
        let mut message = json!({
            "node": self.config.profile_num,
            "connected": connected,
        });
        if connected && !self.config.features.is_null() {
            message["features"] = self.config.features.clone();
        }
        message.to_string().into_bytes()
    }

    fn build_client(&self) -> (AsyncClient, EventLoop) {
        let (host, port) = self.broker.lock().clone();
        let client_id = self.config.client_id.clone().unwrap_or_else(|| {
            format!("polylink-{}-{}", self.config.profile_num, Uuid::new_v4())
        });

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(
            self.config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            &self.topics.self_connection,
            self.connection_envelope(false),
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(password) = &self.config.password {
            let username = self
                .config
                .username
                .clone()
                .unwrap_or_else(|| self.config.profile_num.clone());
            options.set_credentials(username, password);
        }

        AsyncClient::new(options, REQUEST_CAPACITY)
    }

    async fn network_loop(self: Arc<Self>) {
        let policy = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            let (client, eventloop) = self.build_client();
            *self.client.write() = Some(client);

            let end = self.drive(eventloop).await;
            self.connected.store(false, Ordering::SeqCst);

            let SessionEnd::Fault { reason, .. } = &end else {
                info!("MQTT Graceful disconnection.");
                break;
            };
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match next_attempt(&end, attempt, &policy) {
                Some(next) => {
                    attempt = next;
                    warn!("MQTT Unexpected disconnection ({}). Trying reconnect.", reason);
                    if !policy.delay().is_zero() {
                        tokio::time::sleep(policy.delay()).await;
                    }
                }
                None => {
                    error!(
                        "MQTT Connection error: {}. Reconnect attempts exhausted ({}), giving up.",
                        reason, attempt
                    );
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        *self.client.write() = None;
        debug!("MQTT network loop finished");
    }

    async fn drive(&self, mut eventloop: EventLoop) -> SessionEnd {
        let mut was_connected = false;
        loop {
            let event = match eventloop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return SessionEnd::Clean;
                    }
                    return SessionEnd::Fault {
                        reason: e.to_string(),
                        was_connected,
                    };
                }
            };

            if let Some(end) = session_end(&event, was_connected) {
                return end;
            }
            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    was_connected = true;
                    if let Err(e) = self.on_connected() {
                        return SessionEnd::Fault {
                            reason: e.to_string(),
                            was_connected,
                        };
                    }
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    self.handle_payload(&publish.topic, &publish.payload);
                }
                _ => {}
            }
        }
    }

    fn on_connected(&self) -> PolyResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!("MQTT Connected (Success)");
        self.subscribe(&self.topics.subscriptions())?;
        self.publish(
            &self.topics.self_connection,
            self.connection_envelope(true),
            true,
        )?;
        info!("Sent Connected message to Polyglot");
        Ok(())
    }

    /// Decode one payload and hand the result to the message handler.
    pub(crate) fn handle_payload(&self, topic: &str, payload: &[u8]) {
        let items = match parse_envelope(payload, &self.config.peer_id) {
            Ok(Envelope::Accepted(items)) => items,
            Ok(Envelope::Ignored) => return,
            Err(e) => {
                error!(topic = %topic, "MQTT Received Payload Error: {}", e);
                return;
            }
        };

        let handler = self.handler.read().clone();
        for item in items {
            if let Inbound::Control(Control::Connected(connected)) = &item {
                self.peer_connected.store(*connected, Ordering::SeqCst);
            }
            match &handler {
                Some(handler) => handler(item),
                None => debug!("No message handler registered, dropping {:?}", item),
            }
        }
    }
}

impl Transport for Interface {
    fn profile_num(&self) -> &str {
        &self.config.profile_num
    }

    fn send(&self, message: &Outbound) -> PolyResult<()> {
        let payload = message.to_envelope(&self.config.profile_num)?;
        self.publish(&self.topics.input, payload, false)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.is_connected() {
            info!("Disconnecting from MQTT... {}", self.config.broker_addr());
            if let Err(e) = self.publish(
                &self.topics.self_connection,
                self.connection_envelope(false),
                true,
            ) {
                warn!("{}", e);
            }
            if let Err(e) = self.enqueue(Request::Disconnect) {
                warn!("MQTT disconnect request failed: {}", e);
            }
        } else if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn claim_controller(&self) -> PolyResult<()> {
        self.controller_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| PolyError::Singleton("Controller"))
    }

    fn release_controller(&self) {
        self.controller_claimed.store(false, Ordering::SeqCst);
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        for task in [self.task.get_mut().take(), self.publisher.get_mut().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        INTERFACE_EXISTS.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("profile_num", &self.config.profile_num)
            .field("broker", &self.config.broker_addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}
