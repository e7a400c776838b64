use crate::config::{BrokerConfig, RuleSet};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// A message delivered by the broker on one of our subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Cannot connect to broker {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: rumqttc::ConnectionError,
    },
    #[error("Subscribe request failed: {0}")]
    Subscribe(#[source] rumqttc::ClientError),
    #[error("Publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
    #[error("Disconnect request failed: {0}")]
    Disconnect(#[source] rumqttc::ClientError),
    #[error("MQTT event loop stopped unexpectedly")]
    EventLoopStopped,
}

/// Outbound half of the transport, the seam the router publishes through.
///
/// Publishing only queues the message; it must not wait on the network.
pub trait Publisher: Send + Sync {
    fn publish(&self, message: OutboundMessage) -> Result<(), ConnectionError>;
}

pub fn qos_from_u8(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Credentials are only sent when both username and password are configured.
pub fn credentials(broker: &BrokerConfig) -> Option<(&str, &str)> {
    match (broker.username.as_deref(), broker.password.as_deref()) {
        (Some(username), Some(password)) => Some((username, password)),
        _ => None,
    }
}

pub fn mqtt_options(broker: &BrokerConfig) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(broker.client_id(), &broker.broker, broker.port);
    mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    mqtt_options.set_clean_session(true);

    if let Some((username, password)) = credentials(broker) {
        mqtt_options.set_credentials(username, password);
    } else if broker.username.is_some() {
        warn!("MQTT username configured without password, connecting anonymously.");
    }

    mqtt_options
}

/// One subscription per configured rule, in a stable order.
pub fn subscriptions(rules: &RuleSet) -> Vec<SubscribeFilter> {
    let mut topics: Vec<&String> = rules.keys().collect();
    topics.sort();
    topics
        .into_iter()
        .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce))
        .collect()
}

/// Live broker session. Cloning shares the same client, state and driver.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    client_state: Arc<Mutex<ConnectionState>>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MqttTransport {
    /// Connect to the broker and wait for the first CONNACK.
    ///
    /// Every CONNACK, including the ones following an automatic reconnect,
    /// re-issues the full subscription list because the session is clean.
    /// Incoming publishes are forwarded, in order, on the returned receiver.
    pub async fn connect(
        broker: &BrokerConfig,
        topics: Vec<SubscribeFilter>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), ConnectionError> {
        info!("Connecting to broker {}:{}...", broker.broker, broker.port);

        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(broker), broker.channel_capacity);
        let client_state = Arc::new(Mutex::new(ConnectionState::Disconnected));

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected with result code {:?}", ack.code);
                    subscribe_all(&client, &topics)?;
                    *client_state.lock().await = ConnectionState::Connected;
                    break;
                }
                Ok(event) => debug!("Event before CONNACK: {:?}", event),
                Err(source) => {
                    return Err(ConnectionError::Connect {
                        host: broker.broker.clone(),
                        port: broker.port,
                        source,
                    });
                }
            }
        }

        let (tx, rx) = mpsc::channel(broker.channel_capacity);
        let driver = EventLoopDriver {
            client: client.clone(),
            client_state: client_state.clone(),
            topics,
            retry_interval: Duration::from_millis(broker.reconnect_interval_ms),
            inbound: tx,
        };
        let driver = tokio::spawn(driver.run(eventloop));

        Ok((
            Self {
                client,
                client_state,
                driver: Arc::new(Mutex::new(Some(driver))),
            },
            rx,
        ))
    }

    pub async fn state(&self) -> ConnectionState {
        *self.client_state.lock().await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.client
            .disconnect()
            .await
            .map_err(ConnectionError::Disconnect)
    }

    /// Queue a DISCONNECT behind any pending publishes and wait up to `grace`
    /// for the event loop to put it on the wire. The event loop is aborted if
    /// it has not finished by then.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ConnectionError> {
        let requested = self.disconnect().await;

        let Some(mut driver) = self.driver.lock().await.take() else {
            return requested;
        };

        match timeout(grace, &mut driver).await {
            Ok(Ok(())) => debug!("MQTT event loop finished."),
            Ok(Err(e)) => error!("MQTT event loop task failed: {}", e),
            Err(_) => {
                warn!("DISCONNECT not sent within {:?}, aborting event loop.", grace);
                driver.abort();
            }
        }
        *self.client_state.lock().await = ConnectionState::Disconnected;

        requested
    }
}

impl Publisher for MqttTransport {
    fn publish(&self, message: OutboundMessage) -> Result<(), ConnectionError> {
        let OutboundMessage {
            topic,
            payload,
            qos,
            retain,
        } = message;

        self.client
            .try_publish(topic.clone(), qos, retain, payload)
            .map_err(|source| ConnectionError::Publish { topic, source })
    }
}

fn subscribe_all(client: &AsyncClient, topics: &[SubscribeFilter]) -> Result<(), ConnectionError> {
    if topics.is_empty() {
        warn!("No topics configured, nothing to subscribe to.");
        return Ok(());
    }
    for filter in topics {
        info!("Subscribing to {}", filter.path);
    }
    // The event loop is not being polled while this runs, so never await here.
    client
        .try_subscribe_many(topics.to_vec())
        .map_err(ConnectionError::Subscribe)
}

/// Owns the rumqttc event loop after the initial connect.
struct EventLoopDriver {
    client: AsyncClient,
    client_state: Arc<Mutex<ConnectionState>>,
    topics: Vec<SubscribeFilter>,
    retry_interval: Duration,
    inbound: mpsc::Sender<InboundMessage>,
}

impl EventLoopDriver {
    async fn run(self, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    // Keep polling without a receiver so a pending DISCONNECT
                    // still gets written.
                    if self.inbound.send(message).await.is_err() {
                        debug!("Message receiver dropped, discarding incoming publish.");
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Reconnected with result code {:?}", ack.code);
                    *self.client_state.lock().await = ConnectionState::Connected;
                    if let Err(e) = subscribe_all(&self.client, &self.topics) {
                        error!("Failed to resubscribe after reconnect: {}", e);
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker sent DISCONNECT.");
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    info!("Disconnected from broker.");
                    *self.client_state.lock().await = ConnectionState::Disconnected;
                    break;
                }
                Ok(event) => {
                    debug!("Unhandled event: {:?}", event);
                }
                Err(e) => {
                    *self.client_state.lock().await = ConnectionState::Disconnected;
                    if self.inbound.is_closed() {
                        break;
                    }
                    warn!(
                        "Lost connection to MQTT broker ({}). Retrying in {:?}...",
                        e, self.retry_interval
                    );
                    sleep(self.retry_interval).await;
                }
            }
        }
    }
}
