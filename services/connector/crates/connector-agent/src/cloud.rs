//! Cloud command channel over MQTT with mutual TLS.
//!
//! [`connect`] establishes the first session and fails hard; afterwards
//! [`CloudLink::run`] keeps polling, reconnecting with a bounded backoff and
//! resubscribing the whole command table on every ConnAck.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS,
    SubscribeFilter, TlsConfiguration, Transport,
};
use tokio::task::JoinHandle;

use connector_common::{AgentConfig, thing_namespace, thing_topic};

use crate::channel::Channel;
use crate::dispatch::Dispatcher;
use crate::error::AgentError;
use crate::tls;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(20);
const REQUEST_CAPACITY: usize = 64;

/// [`Channel`] backed by a rumqttc client.
#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
}

#[async_trait]
impl Channel for MqttChannel {
    // Never waits on the request queue: while the broker is unreachable the
    // queue is not drained and a full queue is a publish failure.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), AgentError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| AgentError::publish(topic, e))
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<(), AgentError> {
        if topics.is_empty() {
            return Ok(());
        }
        let filters: Vec<SubscribeFilter> = topics
            .into_iter()
            .map(|t| SubscribeFilter::new(t, QoS::AtLeastOnce))
            .collect();
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| AgentError::Connection(format!("subscribe failed: {e}")))
    }
}

/// Per-device view of the broker: subscribes the command table and routes
/// inbound publications to the dispatcher.
#[derive(Clone)]
pub struct CloudSession {
    device_id: String,
    namespace: String,
    channel: Arc<dyn Channel>,
    dispatcher: Dispatcher,
    debug: bool,
}

impl CloudSession {
    #[must_use]
    pub fn new(device_id: &str, channel: Arc<dyn Channel>, dispatcher: Dispatcher) -> Self {
        Self {
            device_id: device_id.to_string(),
            namespace: thing_namespace(device_id),
            channel,
            dispatcher,
            debug: false,
        }
    }

    /// Log every inbound topic and payload before dispatch.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Subscribe every command suffix currently in the table, in one request.
    ///
    /// # Errors
    ///
    /// Passes through the channel's subscribe failure.
    pub async fn on_connected(&self) -> Result<(), AgentError> {
        let topics: Vec<String> = self
            .dispatcher
            .table()
            .iter()
            .map(|suffix| thing_topic(&self.device_id, suffix))
            .collect();
        tracing::info!(count = topics.len(), "subscribing command topics");
        self.channel.subscribe(topics).await
    }

    /// Route replies and status through this session again and resubscribe
    /// the command table.
    pub async fn on_established(&self) {
        let store = &self.dispatcher.context().store;
        store.attach_cloud(self.channel.clone()).await;
        subscribe_in_background(self);
    }

    /// Stop publishing through the session until it is re-established.
    pub async fn on_lost(&self) {
        self.dispatcher.context().store.detach_cloud().await;
    }

    /// Route one inbound publication. Topics outside the device namespace or
    /// without a handler are dropped.
    pub fn on_message(&self, topic: &str, payload: Vec<u8>) -> Option<JoinHandle<()>> {
        if self.debug {
            tracing::info!(%topic, payload = %String::from_utf8_lossy(&payload), "mqtt in");
        }
        let Some(suffix) = topic.strip_prefix(&self.namespace) else {
            tracing::debug!(%topic, "topic outside device namespace");
            return None;
        };
        self.dispatcher.dispatch(suffix, payload)
    }
}

/// Bounded exponential reconnect delay.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: RECONNECT_INITIAL,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = RECONNECT_INITIAL;
    }
}

fn mqtt_options(config: &AgentConfig, tls: rustls::ClientConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.id, &config.host, config.port);
    options
        .set_keep_alive(KEEP_ALIVE)
        .set_clean_session(true)
        .set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(tls),
        )));
    options
}

fn network_options() -> NetworkOptions {
    let mut network = NetworkOptions::new();
    network.set_connection_timeout(CONNECT_TIMEOUT.as_secs());
    network
}

/// A connected client whose event loop has not been handed to
/// [`CloudLink::run`] yet.
pub struct CloudLink {
    channel: Arc<MqttChannel>,
    eventloop: EventLoop,
    backoff: Backoff,
}

/// Open the first broker session.
///
/// # Errors
///
/// `AgentError::Connection` when the TLS material cannot be loaded, the
/// handshake or CONNECT is refused, or no ConnAck arrives in time.
pub async fn connect(config: &AgentConfig) -> Result<CloudLink, AgentError> {
    let tls = tls::client_config(&config.ca_file, &config.cert_file, &config.key_file)?;
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, tls), REQUEST_CAPACITY);
    eventloop.set_network_options(network_options());

    tracing::info!(
        host = %config.host,
        port = config.port,
        client_id = %config.id,
        "connecting to cloud broker"
    );
    let first = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await;

    match first {
        Ok(Ok(())) => {
            tracing::info!(host = %config.host, "cloud session established");
            Ok(CloudLink {
                channel: Arc::new(MqttChannel { client }),
                eventloop,
                backoff: Backoff::new(),
            })
        }
        Ok(Err(e)) => Err(AgentError::Connection(e.to_string())),
        Err(_) => Err(AgentError::Connection(format!(
            "no ConnAck from {} within {}s",
            config.host,
            CONNECT_TIMEOUT.as_secs()
        ))),
    }
}

impl CloudLink {
    #[must_use]
    pub fn channel(&self) -> Arc<MqttChannel> {
        self.channel.clone()
    }

    /// Drive the session forever.
    pub async fn run(mut self, session: CloudSession) {
        session.on_established().await;
        loop {
            let event = self.eventloop.poll().await;
            if let Some(delay) = self.handle_event(&session, event).await {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// React to one event-loop outcome. Returns the delay to wait before
    /// polling again after a connection failure.
    async fn handle_event(
        &mut self,
        session: &CloudSession,
        event: Result<Event, ConnectionError>,
    ) -> Option<Duration> {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("cloud session re-established");
                self.backoff.reset();
                session.on_established().await;
                None
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                session.on_message(&publish.topic, publish.payload.to_vec());
                None
            }
            Ok(_) => None,
            Err(e) => {
                // Nothing from the dropped session is replayed on reconnect.
                let dropped = self.eventloop.pending.len();
                self.eventloop.pending.clear();
                session.on_lost().await;
                let delay = self.backoff.next_delay();
                tracing::warn!(error = %e, dropped, retry_in = ?delay, "cloud connection lost");
                Some(delay)
            }
        }
    }
}

// Subscribing goes through the client's request queue, which only drains
// while the event loop is polled.
fn subscribe_in_background(session: &CloudSession) {
    let session = session.clone();
    tokio::spawn(async move {
        if let Err(e) = session.on_connected().await {
            tracing::error!(error = %e, "command subscription failed");
        }
    });
}
