//! Signaling transport implementations
//!
//! Two fan-out channels ship with the crate. [`LoopbackHub`] delivers
//! in-process and exists for tests and single-machine demos.
//! [`QuicMeshTransport`] fans every published message out to all connected
//! mesh nodes over ant-quic. Both echo published messages back to local
//! subscribers, the same way a real pub/sub topic would; the signaling
//! channel is responsible for filtering those echoes.

use crate::identity::PeerIdentity;
use crate::signaling::{
    validate_message, SignalingError, SignalingMessage, SignalingTransport,
    MAX_SIGNALING_MESSAGE_SIZE,
};
use crate::types::ConversationId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, watch, RwLock};

#[cfg(feature = "quic-mesh")]
use std::net::SocketAddr;
#[cfg(feature = "quic-mesh")]
use std::sync::Arc;
#[cfg(feature = "quic-mesh")]
use std::time::Duration;
#[cfg(feature = "quic-mesh")]
use thiserror::Error;

/// Depth of each topic's local fan-out queue
const TOPIC_QUEUE_DEPTH: usize = 64;

// ============================================================================
// In-process hub
// ============================================================================

/// In-process fan-out hub
///
/// Every publish reaches every subscriber of the topic, the publisher's own
/// subscriptions included. Several signaling channels can share one hub to
/// exercise complete call flows without touching a network.
pub struct LoopbackHub<I: PeerIdentity> {
    topics: RwLock<HashMap<ConversationId, broadcast::Sender<SignalingMessage<I>>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<I: PeerIdentity> LoopbackHub<I> {
    /// Create a hub that reports ready immediately
    #[must_use]
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(true);
        Self {
            topics: RwLock::new(HashMap::new()),
            ready_tx,
            ready_rx,
        }
    }

    /// Override the readiness signal, for exercising startup paths
    pub fn set_ready(&self, ready: bool) {
        let _ = self.ready_tx.send(ready);
    }

    /// Number of topics currently held open
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

impl<I: PeerIdentity> Default for LoopbackHub<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<I: PeerIdentity> SignalingTransport for LoopbackHub<I> {
    type PeerId = I;
    type Error = SignalingError;

    async fn publish(
        &self,
        topic: &ConversationId,
        message: SignalingMessage<I>,
    ) -> Result<(), SignalingError> {
        validate_message(&message)?;
        let encoded = serde_json::to_vec(&message)
            .map_err(|e| SignalingError::InvalidMessage(format!("Serialization failed: {e}")))?;
        if encoded.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::InvalidMessage(format!(
                "Message size {} exceeds maximum of {} bytes",
                encoded.len(),
                MAX_SIGNALING_MESSAGE_SIZE
            )));
        }

        let topics = self.topics.read().await;
        if let Some(sender) = topics.get(topic) {
            // A send error only means nobody is listening right now
            let _ = sender.send(message);
        } else {
            tracing::trace!(topic = %topic, "Published to topic with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &ConversationId,
    ) -> Result<broadcast::Receiver<SignalingMessage<I>>, SignalingError> {
        let mut topics = self.topics.write().await;
        let sender = topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_QUEUE_DEPTH).0);
        Ok(sender.subscribe())
    }

    async fn unsubscribe(&self, topic: &ConversationId) -> Result<(), SignalingError> {
        self.topics.write().await.remove(topic);
        Ok(())
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }
}

// ============================================================================
// ant-quic mesh
// ============================================================================

/// Mesh transport errors
#[cfg(feature = "quic-mesh")]
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),
}

/// Mesh transport configuration
#[cfg(feature = "quic-mesh")]
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Local endpoint address; an OS-assigned port when `None`
    pub bind_addr: Option<SocketAddr>,
    /// How long each receive poll waits before cycling
    pub recv_timeout: Duration,
}

#[cfg(feature = "quic-mesh")]
impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            recv_timeout: Duration::from_secs(30),
        }
    }
}

/// ant-quic mesh signaling transport
///
/// Every node connects to every other node it knows about, and `publish`
/// sends the serialized message to each of them. There is no relay and no
/// retransmission: a send failure is logged and skipped, matching the
/// at-most-once delivery the signaling layer is built to tolerate. Inbound
/// frames are decoded, validated and routed to the matching local topic.
#[cfg(feature = "quic-mesh")]
pub struct QuicMeshTransport<I: PeerIdentity> {
    config: MeshConfig,
    node: Arc<ant_quic::Node>,
    peers: Arc<RwLock<HashMap<String, ant_quic::PeerId>>>,
    topics: Arc<RwLock<HashMap<ConversationId, broadcast::Sender<SignalingMessage<I>>>>>,
    ready_rx: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

#[cfg(feature = "quic-mesh")]
impl<I: PeerIdentity> QuicMeshTransport<I> {
    /// Bind the QUIC node and start the accept and receive loops
    ///
    /// # Errors
    ///
    /// Returns error if node creation fails
    pub async fn bind(config: MeshConfig) -> Result<Self, TransportError> {
        use ant_quic::{Node, NodeConfigBuilder};

        let config_builder = NodeConfigBuilder::default();
        let node_config = if let Some(addr) = config.bind_addr {
            config_builder.bind_addr(addr).build()
        } else {
            config_builder.build()
        };

        let node = Node::with_config(node_config).await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to create QUIC node: {e}"))
        })?;
        let node = Arc::new(node);

        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peers = Arc::new(RwLock::new(HashMap::new()));
        let topics = Arc::new(RwLock::new(HashMap::new()));

        // Accept loop: register inbound peers so fan-out reaches them
        let node_clone = Arc::clone(&node);
        let peers_clone = Arc::clone(&peers);
        let mut accept_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => {
                        if *accept_shutdown.borrow() {
                            tracing::info!("Shutting down mesh accept loop");
                            break;
                        }
                    }
                    result = node_clone.accept() => {
                        if let Some(conn) = result {
                            let peer_id = conn.peer_id;
                            tracing::debug!(peer = ?peer_id, addr = ?conn.remote_addr, "Mesh peer connected");
                            peers_clone.write().await.insert(format!("{peer_id:?}"), peer_id);
                        }
                    }
                }
            }
        });

        // Receive loop: decode inbound frames and route them to topics
        let node_clone = Arc::clone(&node);
        let peers_clone = Arc::clone(&peers);
        let topics_clone = Arc::clone(&topics);
        let mut recv_shutdown = shutdown_rx.clone();
        let recv_timeout = config.recv_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = recv_shutdown.changed() => {
                        if *recv_shutdown.borrow() {
                            tracing::info!("Shutting down mesh receive loop");
                            break;
                        }
                    }
                    result = node_clone.recv(recv_timeout) => {
                        match result {
                            Ok((peer_id, data)) => {
                                Self::route_inbound(&topics_clone, &peers_clone, peer_id, &data)
                                    .await;
                            }
                            Err(e) => {
                                // Poll timeouts just cycle the loop
                                tracing::trace!(error = %e, "Mesh receive poll ended");
                            }
                        }
                    }
                }
            }
        });

        let _ = ready_tx.send(true);
        Ok(Self {
            config,
            node,
            peers,
            topics,
            ready_rx,
            shutdown: shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get transport configuration
    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Get the local endpoint address
    ///
    /// # Errors
    ///
    /// Returns error if no local address is available
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        let mut addr = self.node.local_addr().ok_or_else(|| {
            TransportError::ConnectionError("No local address available".to_string())
        })?;

        // If bound to 0.0.0.0, replace with localhost for connection purposes
        if addr.ip().is_unspecified() {
            addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        }

        Ok(addr)
    }

    /// Connect to a mesh peer at a known address
    ///
    /// # Errors
    ///
    /// Returns error if connection fails
    pub async fn join_peer(&self, addr: SocketAddr) -> Result<String, TransportError> {
        let conn = self
            .node
            .connect_addr(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("Failed to connect: {e}")))?;

        let peer_id = conn.peer_id;
        let peer_str = format!("{peer_id:?}");
        self.peers.write().await.insert(peer_str.clone(), peer_id);
        tracing::info!(peer = %peer_str, addr = %addr, "Joined mesh peer");
        Ok(peer_str)
    }

    /// Number of known mesh peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Stop the accept and receive loops
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown signal fails to send
    pub fn shutdown(&self) -> Result<(), TransportError> {
        if *self.shutdown_rx.borrow() {
            return Ok(());
        }
        if self.shutdown.send(true).is_err() {
            return Err(TransportError::ConnectionError(
                "Failed to send shutdown signal".to_string(),
            ));
        }
        tracing::info!("Mesh shutdown signal sent");
        Ok(())
    }

    async fn route_inbound(
        topics: &RwLock<HashMap<ConversationId, broadcast::Sender<SignalingMessage<I>>>>,
        peers: &RwLock<HashMap<String, ant_quic::PeerId>>,
        peer_id: ant_quic::PeerId,
        data: &[u8],
    ) {
        if data.len() > MAX_SIGNALING_MESSAGE_SIZE {
            tracing::warn!(size = data.len(), "Dropping oversized mesh frame");
            return;
        }
        let message: SignalingMessage<I> = match serde_json::from_slice(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable mesh frame");
                return;
            }
        };
        if let Err(e) = validate_message(&message) {
            tracing::warn!(error = %e, "Dropping invalid mesh frame");
            return;
        }

        // Remember the sender so future publishes fan out to it too
        peers
            .write()
            .await
            .entry(format!("{peer_id:?}"))
            .or_insert(peer_id);

        let topics = topics.read().await;
        if let Some(sender) = topics.get(message.conversation_id()) {
            let _ = sender.send(message);
        } else {
            tracing::trace!(
                conversation = %message.conversation_id(),
                "Mesh frame for conversation with no local subscribers"
            );
        }
    }
}

#[cfg(feature = "quic-mesh")]
#[async_trait]
impl<I: PeerIdentity> SignalingTransport for QuicMeshTransport<I> {
    type PeerId = I;
    type Error = TransportError;

    async fn publish(
        &self,
        topic: &ConversationId,
        message: SignalingMessage<I>,
    ) -> Result<(), TransportError> {
        validate_message(&message).map_err(|e| TransportError::SendError(e.to_string()))?;
        let data = serde_json::to_vec(&message)
            .map_err(|e| TransportError::SendError(format!("Failed to serialize message: {e}")))?;
        if data.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(TransportError::SendError(format!(
                "Message size {} exceeds maximum of {} bytes",
                data.len(),
                MAX_SIGNALING_MESSAGE_SIZE
            )));
        }

        // Best-effort fan-out; a lost message is the normal case the
        // signaling layer already absorbs
        let peer_ids: Vec<ant_quic::PeerId> = self.peers.read().await.values().copied().collect();
        for peer_id in &peer_ids {
            if let Err(e) = self.node.send(peer_id, &data).await {
                tracing::warn!(peer = ?peer_id, error = %e, "Mesh send failed, continuing fan-out");
            }
        }
        tracing::trace!(topic = %topic, peers = peer_ids.len(), "Fanned message out");

        // Local subscribers of the topic see the publish too
        let topics = self.topics.read().await;
        if let Some(sender) = topics.get(topic) {
            let _ = sender.send(message);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &ConversationId,
    ) -> Result<broadcast::Receiver<SignalingMessage<I>>, TransportError> {
        let mut topics = self.topics.write().await;
        let sender = topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_QUEUE_DEPTH).0);
        Ok(sender.subscribe())
    }

    async fn unsubscribe(&self, topic: &ConversationId) -> Result<(), TransportError> {
        self.topics.write().await.remove(topic);
        Ok(())
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;
    use crate::types::IceCandidate;
    use chrono::Utc;

    fn ring(from: &str) -> SignalingMessage<PeerIdentityString> {
        SignalingMessage::Ring {
            conversation_id: ConversationId::new("conv-1"),
            from: PeerIdentityString::new(from),
            to: PeerIdentityString::new("bob"),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn hub_fans_out_to_every_subscriber() {
        let hub = LoopbackHub::<PeerIdentityString>::new();
        let conversation = ConversationId::new("conv-1");
        let mut first = hub.subscribe(&conversation).await.unwrap();
        let mut second = hub.subscribe(&conversation).await.unwrap();

        hub.publish(&conversation, ring("alice")).await.unwrap();

        assert_eq!(first.recv().await.unwrap().sender().as_str(), "alice");
        assert_eq!(second.recv().await.unwrap().sender().as_str(), "alice");
    }

    #[tokio::test]
    async fn hub_publish_without_subscribers_succeeds() {
        let hub = LoopbackHub::<PeerIdentityString>::new();
        let result = hub.publish(&ConversationId::new("conv-1"), ring("alice")).await;
        assert!(result.is_ok());
        assert_eq!(hub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn hub_rejects_oversized_wire_frames() {
        // Each field passes its own limit; only the serialized frame trips
        let hub = LoopbackHub::<PeerIdentityString>::new();
        let message = SignalingMessage::IceCandidate {
            conversation_id: ConversationId::new("conv-1"),
            from: PeerIdentityString::new("a".repeat(40 * 1024)),
            to: PeerIdentityString::new("b".repeat(40 * 1024)),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
            timestamp: Utc::now(),
        };

        let result = hub.publish(&ConversationId::new("conv-1"), message).await;
        assert!(matches!(result, Err(SignalingError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn hub_unsubscribe_closes_receivers() {
        let hub = LoopbackHub::<PeerIdentityString>::new();
        let conversation = ConversationId::new("conv-1");
        let mut rx = hub.subscribe(&conversation).await.unwrap();

        hub.unsubscribe(&conversation).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(hub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn hub_readiness_is_settable() {
        let hub = LoopbackHub::<PeerIdentityString>::new();
        assert!(*hub.readiness().borrow());

        hub.set_ready(false);
        assert!(!*hub.readiness().borrow());

        hub.set_ready(true);
        assert!(*hub.readiness().borrow());
    }
}
