//! MQTT transport.
//!
//! Two halves, both on rumqttc:
//!
//! - [`SourceListener`] subscribes the vendor base topics, drops immediately
//!   repeated messages and feeds the engine. Its client also carries vendor
//!   commands and the configured init/periodic messages.
//! - [`MqttHomieTransport`] opens one Homie session per device with the
//!   `$state = lost` last will and forwards writes received on the session
//!   to a channel consumed by [`spawn_write_dispatcher`].

use crate::config::{BridgeConfig, MqttBrokerConfig, VendorMessage};
use crate::engine::{report_error, BridgeEngine};
use crate::error::{BridgeError, BridgeResult};
use crate::message::OutboundMessage;
use crate::profiles::{create_profile, matching_base};
use crate::transport::{Transport, LAST_WILL_PAYLOAD};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Request channel capacity of every rumqttc client.
const CLIENT_CAPACITY: usize = 64;
/// Pause after a failed eventloop poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Consecutive poll errors after which the failure is logged as an error.
const MAX_ERRORS: u32 = 5;
/// Spacing between consecutive init or periodic messages.
const VENDOR_MESSAGE_SPACING: Duration = Duration::from_secs(5);

pub(crate) fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn client_id(role: &str) -> String {
    format!("homie-bridge-{}-{}", role, Uuid::new_v4().simple())
}

fn mqtt_options(client_id: &str, broker: &MqttBrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, broker.broker.as_str(), broker.port);
    options.set_keep_alive(Duration::from_secs(broker.keep_alive.max(5)));
    options.set_max_packet_size(10 * 1024 * 1024, 10 * 1024 * 1024);

    if let (Some(user), Some(pass)) = (&broker.username, &broker.password) {
        options.set_credentials(user, pass);
    }
    options
}

/// Drops a message identical to the one right before it.
#[derive(Debug, Default)]
pub struct DedupFilter {
    last: Option<(String, Vec<u8>)>,
}

impl DedupFilter {
    pub fn is_repeat(&mut self, topic: &str, payload: &[u8]) -> bool {
        if let Some((last_topic, last_payload)) = &self.last {
            if last_topic == topic && last_payload.as_slice() == payload {
                return true;
            }
        }
        self.last = Some((topic.to_string(), payload.to_vec()));
        false
    }
}

/// Listener on the vendor broker.
pub struct SourceListener {
    client: AsyncClient,
    eventloop: EventLoop,
    broker_addr: String,
    base_topics: Vec<String>,
    init_messages: Vec<VendorMessage>,
    periodic_messages: Vec<VendorMessage>,
    periodic_interval: Duration,
}

impl SourceListener {
    pub fn new(broker: &MqttBrokerConfig, base_topics: Vec<String>) -> Self {
        let options = mqtt_options(&client_id("source"), broker);
        let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        Self {
            client,
            eventloop,
            broker_addr: broker.full_broker_addr(),
            base_topics,
            init_messages: Vec::new(),
            periodic_messages: Vec::new(),
            periodic_interval: Duration::from_secs(300),
        }
    }

    pub fn with_vendor_messages(
        mut self,
        init_messages: Vec<VendorMessage>,
        periodic_messages: Vec<VendorMessage>,
        periodic_interval: Duration,
    ) -> Self {
        self.init_messages = init_messages;
        self.periodic_messages = periodic_messages;
        self.periodic_interval = periodic_interval;
        self
    }

    /// Client used for vendor commands.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Run until aborted. Messages are handed to `engine` one at a time.
    pub fn spawn(self, engine: Arc<BridgeEngine>) -> JoinHandle<()> {
        let Self {
            client,
            mut eventloop,
            broker_addr,
            base_topics,
            init_messages,
            periodic_messages,
            periodic_interval,
        } = self;

        tokio::spawn(async move {
            info!(broker = %broker_addr, topics = ?base_topics, "Starting source listener");

            let _periodic = (!periodic_messages.is_empty()).then(|| {
                AbortOnDrop(spawn_periodic_messages(
                    client.clone(),
                    periodic_messages,
                    periodic_interval,
                ))
            });

            let mut dedup = DedupFilter::default();
            let mut error_count = 0u32;

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        error_count = 0;
                        info!(broker = %broker_addr, "Source broker connected");
                        for topic in &base_topics {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                error!(topic = %topic, error = %e, "Source subscription failed");
                            }
                        }
                        if !init_messages.is_empty() {
                            tokio::spawn(send_vendor_messages(
                                client.clone(),
                                init_messages.clone(),
                                "init",
                            ));
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        error_count = 0;
                        let topic = publish.topic.as_str();
                        if dedup.is_repeat(topic, &publish.payload) {
                            trace!(topic = %topic, "Dropping repeated message");
                            continue;
                        }
                        let Some(base) = matching_base(&base_topics, topic) else {
                            debug!(topic = %topic, "No base topic matches");
                            continue;
                        };
                        if let Err(e) = engine.on_message(base, topic, &publish.payload).await {
                            report_error(topic, &e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error_count += 1;
                        if error_count == MAX_ERRORS {
                            error!(broker = %broker_addr, error = %e, "Source broker keeps failing");
                        } else {
                            warn!(broker = %broker_addr, attempt = error_count, error = %e, "Source broker error");
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        })
    }
}

/// Aborts the wrapped task when the owning future is dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn send_vendor_messages(client: AsyncClient, messages: Vec<VendorMessage>, kind: &'static str) {
    for message in messages {
        tokio::time::sleep(VENDOR_MESSAGE_SPACING).await;
        info!(topic = %message.topic, payload = %message.payload, kind, "Sending vendor message");
        if let Err(e) = client
            .publish(message.topic.as_str(), QoS::AtMostOnce, false, message.payload.into_bytes())
            .await
        {
            warn!(error = %e, kind, "Vendor message failed");
        }
    }
}

fn spawn_periodic_messages(
    client: AsyncClient,
    messages: Vec<VendorMessage>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.tick().await; // Skip first tick
        loop {
            timer.tick().await;
            send_vendor_messages(client.clone(), messages.clone(), "periodic").await;
        }
    })
}

/// A write received on a Homie session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomieWrite {
    pub topic: String,
    pub payload: Vec<u8>,
}

struct DeviceSession {
    client: AsyncClient,
    filters: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

/// Homie side of the bridge: one MQTT session per device.
pub struct MqttHomieTransport {
    broker: MqttBrokerConfig,
    command_client: AsyncClient,
    sessions: DashMap<String, DeviceSession>,
    writes: mpsc::Sender<HomieWrite>,
}

impl MqttHomieTransport {
    /// `command_client` publishes vendor commands, normally the
    /// [`SourceListener`] client.
    pub fn new(
        broker: MqttBrokerConfig,
        command_client: AsyncClient,
        write_capacity: usize,
    ) -> (Self, mpsc::Receiver<HomieWrite>) {
        let (writes, rx) = mpsc::channel(write_capacity.max(1));
        (
            Self {
                broker,
                command_client,
                sessions: DashMap::new(),
                writes,
            },
            rx,
        )
    }

    fn session_client(&self, device_id: &str) -> BridgeResult<AsyncClient> {
        self.sessions
            .get(device_id)
            .map(|s| s.client.clone())
            .ok_or_else(|| BridgeError::Transport(format!("no session for {}", device_id)))
    }
}

#[async_trait]
impl Transport for MqttHomieTransport {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn register_device(&self, device_id: &str, device_topic: &str) -> BridgeResult<()> {
        if self.sessions.contains_key(device_id) {
            return Ok(());
        }

        let mut options = mqtt_options(&client_id(device_id), &self.broker);
        options.set_last_will(LastWill::new(
            format!("{}/$state", device_topic),
            LAST_WILL_PAYLOAD,
            QoS::AtLeastOnce,
            true,
        ));
        let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let filters = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(run_device_session(
            device_id.to_string(),
            client.clone(),
            eventloop,
            filters.clone(),
            self.writes.clone(),
        ));

        self.sessions.insert(
            device_id.to_string(),
            DeviceSession {
                client,
                filters,
                task,
            },
        );
        debug!(device_id = %device_id, broker = %self.broker.full_broker_addr(), "Homie session opened");
        Ok(())
    }

    async fn subscribe(&self, device_id: &str, filter: &str) -> BridgeResult<()> {
        let client = {
            let session = self
                .sessions
                .get(device_id)
                .ok_or_else(|| BridgeError::Transport(format!("no session for {}", device_id)))?;
            session.filters.lock().push(filter.to_string());
            session.client.clone()
        };
        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    async fn publish(&self, device_id: &str, message: &OutboundMessage) -> BridgeResult<()> {
        let client = self.session_client(device_id)?;
        client
            .publish(
                message.topic.as_str(),
                qos(message.qos),
                message.retain,
                message.payload.clone().into_bytes(),
            )
            .await
            .map_err(|e| BridgeError::publish(&message.topic, e))
    }

    async fn publish_command(&self, topic: &str, payload: &str) -> BridgeResult<()> {
        self.command_client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BridgeError::publish(topic, e))
    }

    async fn disconnect(&self) -> BridgeResult<()> {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                if let Err(e) = session.client.disconnect().await {
                    debug!(device_id = %id, error = %e, "Disconnect failed");
                }
                session.task.abort();
            }
        }
        Ok(())
    }
}

/// Poll one device session. Subscriptions are renewed on every connect.
async fn run_device_session(
    device_id: String,
    client: AsyncClient,
    mut eventloop: EventLoop,
    filters: Arc<Mutex<Vec<String>>>,
    writes: mpsc::Sender<HomieWrite>,
) {
    let mut error_count = 0u32;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                error_count = 0;
                debug!(device_id = %device_id, "Homie session connected");
                let filters: Vec<String> = filters.lock().clone();
                for filter in filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!(device_id = %device_id, filter = %filter, error = %e, "Resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                error_count = 0;
                let write = HomieWrite {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if writes.send(write).await.is_err() {
                    debug!(device_id = %device_id, "Write dispatcher gone");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error_count += 1;
                if error_count == MAX_ERRORS {
                    error!(device_id = %device_id, error = %e, "Homie session keeps failing");
                } else {
                    warn!(device_id = %device_id, attempt = error_count, error = %e, "Homie session error");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Feed Homie writes into the engine.
pub fn spawn_write_dispatcher(
    engine: Arc<BridgeEngine>,
    mut writes: mpsc::Receiver<HomieWrite>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(write) = writes.recv().await {
            if let Err(e) = engine.on_write(&write.topic, &write.payload).await {
                report_error(&write.topic, &e);
            }
        }
    })
}

/// A running bridge: source listener, Homie sessions and engine.
pub struct MqttBridge {
    engine: Arc<BridgeEngine>,
    listener: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl MqttBridge {
    /// Wire everything up from `config` and start listening.
    pub fn start(config: &BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;

        let profile = create_profile(config.source.profile);
        let listener = SourceListener::new(&config.source_broker(), config.base_topics())
            .with_vendor_messages(
                config.init_messages.clone(),
                config.periodic_messages.clone(),
                config.periodic_interval(),
            );

        let (transport, writes) = MqttHomieTransport::new(
            config.homie.mqtt.clone(),
            listener.client(),
            config.engine.outbox_depth,
        );
        let engine = BridgeEngine::new(config.engine_config(), profile, Arc::new(transport));
        engine.start();

        info!(
            profile = %config.source.profile,
            homie = %config.homie.mqtt.full_broker_addr(),
            base_topic = %config.homie.base_topic,
            "Bridge started"
        );

        Ok(Self {
            dispatcher: spawn_write_dispatcher(engine.clone(), writes),
            listener: listener.spawn(engine.clone()),
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<BridgeEngine> {
        &self.engine
    }

    pub async fn shutdown(self) {
        self.listener.abort();
        self.dispatcher.abort();
        self.engine.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
        assert_eq!(qos(7), QoS::AtLeastOnce);
    }

    #[test]
    fn test_dedup_filter() {
        let mut dedup = DedupFilter::default();
        assert!(!dedup.is_repeat("tele/dev1/STATE", b"a"));
        assert!(dedup.is_repeat("tele/dev1/STATE", b"a"));
        assert!(!dedup.is_repeat("tele/dev1/STATE", b"b"));
        assert!(!dedup.is_repeat("tele/dev2/STATE", b"b"));
        // Only the immediately preceding message counts
        assert!(!dedup.is_repeat("tele/dev1/STATE", b"b"));
    }

    #[test]
    fn test_mqtt_options() {
        let broker = MqttBrokerConfig::new("10.0.0.2")
            .with_port(1884)
            .with_auth("mqtt", "secret");
        let options = mqtt_options("homie-bridge-test", &broker);
        assert_eq!(options.broker_address(), ("10.0.0.2".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(
            options.credentials(),
            Some(("mqtt".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(client_id("dev1"), client_id("dev1"));
        assert!(client_id("source").starts_with("homie-bridge-source-"));
    }

    #[tokio::test]
    async fn test_register_device_sets_up_session() {
        let broker = MqttBrokerConfig::new("127.0.0.1").with_port(1);
        let (command_client, _eventloop) =
            AsyncClient::new(MqttOptions::new("cmd", "127.0.0.1", 1), 10);
        let (transport, _writes) = MqttHomieTransport::new(broker, command_client, 10);

        transport.register_device("dev1", "homie/dev1").await.unwrap();
        transport.register_device("dev1", "homie/dev1").await.unwrap();
        assert_eq!(transport.sessions.len(), 1);

        let err = transport
            .publish("ghost", &OutboundMessage::runtime("homie/ghost/n/p", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));

        transport.disconnect().await.unwrap();
        assert!(transport.sessions.is_empty());
    }
}
