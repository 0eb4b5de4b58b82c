//! MQTT transport for the signaling contract
//!
//! One [`MqttRouter`] per process owns the broker connection and fans
//! incoming publishes out to per-topic routes; one [`MqttSignaling`] per
//! stream holds the router plus the stream's topic set. Offers share a
//! fixed deployment-wide topic, answers and candidates are addressed per
//! session id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{IceCandidate, OfferMessage, SessionIdentity, SignalingChannel};
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};

const KEEP_ALIVE: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Shared broker connection plus the topic route table
pub struct MqttRouter {
    client: AsyncClient,
    routes: Routes,
}

impl MqttRouter {
    /// Build the client and spawn the event-loop poll task. The connection
    /// itself is established lazily by the first poll.
    pub fn connect(config: &SignalingConfig) -> Arc<Self> {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.host.clone(),
            config.port,
        );
        options.set_keep_alive(KEEP_ALIVE);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(Self::poll_loop(eventloop, routes.clone()));

        Arc::new(Self { client, routes })
    }

    async fn poll_loop(mut eventloop: EventLoop, routes: Routes) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    Self::dispatch(&routes, &publish.topic, publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt connection error: {}, reconnecting", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn dispatch(routes: &Routes, topic: &str, payload: Bytes) {
        let mut routes = routes.lock().await;
        let dead = match routes.get(topic) {
            Some(sender) => sender.send(payload).is_err(),
            None => return,
        };
        if dead {
            routes.remove(topic);
            debug!("dropped closed route for {}", topic);
        }
    }

    /// Subscribe to a topic and route its payloads to the returned
    /// receiver. Subscribing a topic again replaces the previous route.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<mpsc::UnboundedReceiver<Bytes>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().await.insert(topic.to_string(), tx);
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| AppError::Signaling(format!("could not subscribe {}: {}", topic, e)))?;
        Ok(rx)
    }

    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.client
            .publish(topic, qos, retained, payload)
            .await
            .map_err(|e| AppError::Signaling(format!("could not publish to {}: {}", topic, e)))
    }
}

/// Topic set of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    /// Fixed topic shared by the deployment
    pub offer: String,
    /// Answer topic, one per stream
    pub answer: String,
    /// Outbound candidates (edge to consumer)
    pub candidate_send: String,
    /// Inbound candidates (consumer to edge)
    pub candidate_recv: String,
}

impl TopicSet {
    pub fn new(config: &SignalingConfig, identity: &SessionIdentity) -> Self {
        Self {
            offer: config.offer_topic.clone(),
            answer: format!("{}/{}", config.answer_topic_prefix, identity.id),
            candidate_send: format!("{}/{}/edge", config.candidate_topic_prefix, identity.id),
            candidate_recv: format!("{}/{}/cloud", config.candidate_topic_prefix, identity.id),
        }
    }
}

/// Per-stream signaling endpoint over the shared router
pub struct MqttSignaling {
    router: Arc<MqttRouter>,
    identity: SessionIdentity,
    topics: TopicSet,
    qos: QoS,
    retained: bool,
}

impl MqttSignaling {
    pub fn new(router: Arc<MqttRouter>, config: &SignalingConfig, identity: &SessionIdentity) -> Self {
        Self {
            router,
            identity: identity.clone(),
            topics: TopicSet::new(config, identity),
            qos: qos_level(config.qos),
            retained: config.retained,
        }
    }
}

#[async_trait]
impl SignalingChannel for MqttSignaling {
    async fn send_offer(&self, description: &RTCSessionDescription) -> Result<()> {
        // the offer topic is shared, so the message carries the identity
        let message = OfferMessage {
            id: self.identity.id.clone(),
            track_source: self.identity.kind,
            description: description.clone(),
        };
        let payload = serde_json::to_vec(&message)?;
        self.router
            .publish(&self.topics.offer, self.qos, self.retained, payload)
            .await
    }

    async fn answers(&self) -> Result<mpsc::Receiver<RTCSessionDescription>> {
        let mut raw = self.router.subscribe(&self.topics.answer, self.qos).await?;
        let (tx, rx) = mpsc::channel(1);
        let topic = self.topics.answer.clone();

        // Forward at most one decoded answer, then end the channel. A
        // malformed payload ends it without a value, which the session
        // manager treats as a graceful abort.
        tokio::spawn(async move {
            if let Some(payload) = raw.recv().await {
                match serde_json::from_slice::<RTCSessionDescription>(&payload) {
                    Ok(description) => {
                        let _ = tx.send(description).await;
                    }
                    Err(e) => error!("discarding malformed answer on {}: {}", topic, e),
                }
            }
        });

        Ok(rx)
    }

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let payload = serde_json::to_vec(candidate)?;
        self.router
            .publish(&self.topics.candidate_send, self.qos, self.retained, payload)
            .await
    }

    async fn candidates(&self) -> Result<mpsc::Receiver<IceCandidate>> {
        let mut raw = self
            .router
            .subscribe(&self.topics.candidate_recv, self.qos)
            .await?;
        let (tx, rx) = mpsc::channel(64);
        let topic = self.topics.candidate_recv.clone();

        tokio::spawn(async move {
            while let Some(payload) = raw.recv().await {
                match serde_json::from_slice::<IceCandidate>(&payload) {
                    Ok(candidate) => {
                        if tx.send(candidate).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("discarding malformed candidate on {}: {}", topic, e),
                }
            }
        });

        Ok(rx)
    }
}
