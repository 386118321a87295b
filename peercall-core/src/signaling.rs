//! Call signaling over a fan-out pub/sub channel
//!
//! Every message is published to the conversation's topic and delivered to
//! all subscribers, including the publisher itself. The channel therefore
//! filters self-originated echoes before anything reaches a call session,
//! and validates field sizes at the boundary so malformed or oversized
//! messages never enter the state machine.

use crate::identity::PeerIdentity;
use crate::types::{ConversationId, HangupReason, IceCandidate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

/// Maximum serialized signaling message size (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum conversation ID length
pub const MAX_CONVERSATION_ID_LENGTH: usize = 256;

/// Maximum SDP string length, also bounds candidate strings
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Message failed boundary validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Transport did not become ready in time
    #[error("Transport not ready after {0:?}")]
    NotReady(Duration),

    /// Channel closed
    #[error("Signaling channel closed")]
    ChannelClosed,
}

/// Signaling transport trait
///
/// Implement this for your specific fan-out channel (gossip topic, DHT
/// pub/sub, message relay, etc.). Topics are conversation IDs; a published
/// message reaches every subscriber of the topic with no ordering or
/// delivery guarantee beyond best-effort at-most-once.
///
/// `readiness` lets callers defer subscription until the transport can
/// actually deliver. Subscribing earlier silently loses messages on most
/// real channels.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Peer identity type carried in messages
    type PeerId: PeerIdentity;

    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a message to every subscriber of the topic
    async fn publish(
        &self,
        topic: &ConversationId,
        message: SignalingMessage<Self::PeerId>,
    ) -> Result<(), Self::Error>;

    /// Subscribe to a topic, receiving every message published to it
    async fn subscribe(
        &self,
        topic: &ConversationId,
    ) -> Result<broadcast::Receiver<SignalingMessage<Self::PeerId>>, Self::Error>;

    /// Drop the subscription for a topic and stop delivery to its receivers
    async fn unsubscribe(&self, topic: &ConversationId) -> Result<(), Self::Error>;

    /// Readiness signal, `true` once the transport can deliver messages
    fn readiness(&self) -> watch::Receiver<bool>;
}

/// Signaling message types
///
/// The wire format is a tagged union: `type` selects the variant and every
/// variant carries the conversation, sender, intended recipient and a
/// sender-side timestamp. The recipient field is advisory; subscription to
/// the conversation topic is what scopes delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", bound = "I: PeerIdentity")]
pub enum SignalingMessage<I: PeerIdentity> {
    /// Session description offer
    #[serde(rename = "offer")]
    Offer {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Sending peer
        from: I,
        /// Intended recipient
        to: I,
        /// SDP content
        sdp: String,
        /// Sender-side send time
        timestamp: DateTime<Utc>,
    },

    /// Callee-side notification that the call is ringing
    #[serde(rename = "ring")]
    Ring {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Sending peer
        from: I,
        /// Intended recipient
        to: I,
        /// Sender-side send time
        timestamp: DateTime<Utc>,
    },

    /// Session description answer
    #[serde(rename = "answer")]
    Answer {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Sending peer
        from: I,
        /// Intended recipient
        to: I,
        /// SDP content
        sdp: String,
        /// Sender-side send time
        timestamp: DateTime<Utc>,
    },

    /// Connectivity candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Sending peer
        from: I,
        /// Intended recipient
        to: I,
        /// The candidate being forwarded
        candidate: IceCandidate,
        /// Sender-side send time
        timestamp: DateTime<Utc>,
    },

    /// Call termination
    #[serde(rename = "hangup")]
    Hangup {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Sending peer
        from: I,
        /// Intended recipient
        to: I,
        /// Why the sender ended the call
        reason: HangupReason,
        /// Sender-side send time
        timestamp: DateTime<Utc>,
    },
}

impl<I: PeerIdentity> SignalingMessage<I> {
    /// Get the conversation ID
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Offer {
                conversation_id, ..
            }
            | Self::Ring {
                conversation_id, ..
            }
            | Self::Answer {
                conversation_id, ..
            }
            | Self::IceCandidate {
                conversation_id, ..
            }
            | Self::Hangup {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Get the sending peer
    #[must_use]
    pub fn sender(&self) -> &I {
        match self {
            Self::Offer { from, .. }
            | Self::Ring { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::Hangup { from, .. } => from,
        }
    }

    /// Get the intended recipient.
    ///
    /// Advisory only. Delivery is scoped by topic subscription, not by this
    /// field.
    #[must_use]
    pub fn recipient(&self) -> &I {
        match self {
            Self::Offer { to, .. }
            | Self::Ring { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::Hangup { to, .. } => to,
        }
    }

    /// Get the sender-side timestamp
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Offer { timestamp, .. }
            | Self::Ring { timestamp, .. }
            | Self::Answer { timestamp, .. }
            | Self::IceCandidate { timestamp, .. }
            | Self::Hangup { timestamp, .. } => *timestamp,
        }
    }
}

/// Validate a message against the boundary limits.
///
/// # Errors
///
/// Returns `SignalingError::InvalidMessage` when any field exceeds its limit.
pub fn validate_message<I: PeerIdentity>(
    message: &SignalingMessage<I>,
) -> Result<(), SignalingError> {
    if message.conversation_id().as_str().len() > MAX_CONVERSATION_ID_LENGTH {
        return Err(SignalingError::InvalidMessage(format!(
            "Conversation ID too long: {} bytes",
            message.conversation_id().as_str().len()
        )));
    }

    match message {
        SignalingMessage::Offer { sdp, .. } | SignalingMessage::Answer { sdp, .. } => {
            if sdp.len() > MAX_SDP_LENGTH {
                return Err(SignalingError::InvalidMessage(format!(
                    "SDP too long: {} bytes",
                    sdp.len()
                )));
            }
        }
        SignalingMessage::IceCandidate { candidate, .. } => {
            if candidate.candidate.len() > MAX_SDP_LENGTH {
                return Err(SignalingError::InvalidMessage(format!(
                    "Candidate too long: {} bytes",
                    candidate.candidate.len()
                )));
            }
        }
        SignalingMessage::Ring { .. } | SignalingMessage::Hangup { .. } => {}
    }

    Ok(())
}

/// Configuration for a signaling channel
#[derive(Debug, Clone)]
pub struct SignalingChannelConfig {
    /// How long to wait for transport readiness before giving up
    pub ready_timeout: Duration,
    /// Depth of each per-conversation delivery queue
    pub queue_depth: usize,
}

impl Default for SignalingChannelConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            queue_depth: 64,
        }
    }
}

/// Signaling channel bound to one local identity
///
/// Wraps a transport with the two behaviors every session needs: waiting
/// for readiness before subscribing, and dropping self-originated echoes
/// and invalid messages before delivery.
pub struct SignalingChannel<T: SignalingTransport> {
    transport: Arc<T>,
    local: T::PeerId,
    config: SignalingChannelConfig,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Create a channel with default configuration
    #[must_use]
    pub fn new(transport: Arc<T>, local: T::PeerId) -> Self {
        Self::with_config(transport, local, SignalingChannelConfig::default())
    }

    /// Create a channel with explicit configuration
    #[must_use]
    pub fn with_config(
        transport: Arc<T>,
        local: T::PeerId,
        config: SignalingChannelConfig,
    ) -> Self {
        Self {
            transport,
            local,
            config,
        }
    }

    /// The identity stamped on outgoing messages
    pub fn local(&self) -> &T::PeerId {
        &self.local
    }

    /// The wrapped transport
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Publish a message to its conversation topic
    ///
    /// # Errors
    ///
    /// Returns error if the message fails validation or the transport
    /// rejects it.
    #[tracing::instrument(skip(self, message), fields(conversation = %message.conversation_id(), message_type = message_type(&message)))]
    pub async fn publish(
        &self,
        message: SignalingMessage<T::PeerId>,
    ) -> Result<(), SignalingError> {
        validate_message(&message)?;
        let topic = message.conversation_id().clone();
        tracing::debug!("Publishing signaling message");
        self.transport
            .publish(&topic, message)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Open a filtered subscription for one conversation
    ///
    /// Waits for transport readiness first; subscribing before the channel
    /// can deliver would silently lose messages. The returned receiver
    /// yields only messages from other peers that pass validation, and
    /// closes once the conversation is unsubscribed.
    ///
    /// # Errors
    ///
    /// Returns error if readiness times out or the transport refuses the
    /// subscription.
    #[tracing::instrument(skip(self), fields(conversation = %conversation))]
    pub async fn open(
        &self,
        conversation: &ConversationId,
    ) -> Result<mpsc::Receiver<SignalingMessage<T::PeerId>>, SignalingError> {
        self.wait_ready().await?;

        let mut raw = self
            .transport
            .subscribe(conversation)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))?;

        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let local_id = self.local.unique_id();
        let conversation = conversation.clone();

        tokio::spawn(async move {
            loop {
                match raw.recv().await {
                    Ok(message) => {
                        if message.sender().unique_id() == local_id {
                            tracing::trace!(
                                conversation = %conversation,
                                "Dropping self-originated message"
                            );
                            continue;
                        }
                        if message.conversation_id() != &conversation {
                            tracing::trace!(
                                conversation = %conversation,
                                actual = %message.conversation_id(),
                                "Dropping message for different conversation"
                            );
                            continue;
                        }
                        if let Err(e) = validate_message(&message) {
                            tracing::warn!(
                                conversation = %conversation,
                                error = %e,
                                "Dropping invalid signaling message"
                            );
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            conversation = %conversation,
                            skipped,
                            "Subscriber lagging, messages lost"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(conversation = %conversation, "Subscription pump stopped");
        });

        Ok(rx)
    }

    /// Unsubscribe from a conversation, closing any receiver from [`open`]
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the unsubscribe.
    ///
    /// [`open`]: SignalingChannel::open
    #[tracing::instrument(skip(self), fields(conversation = %conversation))]
    pub async fn close(&self, conversation: &ConversationId) -> Result<(), SignalingError> {
        self.transport
            .unsubscribe(conversation)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Whether the transport currently reports ready
    pub fn is_ready(&self) -> bool {
        *self.transport.readiness().borrow()
    }

    async fn wait_ready(&self) -> Result<(), SignalingError> {
        let mut ready = self.transport.readiness();
        if *ready.borrow() {
            return Ok(());
        }

        let deadline = self.config.ready_timeout;
        tracing::debug!(
            timeout_ms = deadline.as_millis(),
            "Waiting for transport readiness"
        );
        tokio::time::timeout(deadline, async move {
            loop {
                if ready.changed().await.is_err() {
                    return Err(SignalingError::ChannelClosed);
                }
                if *ready.borrow_and_update() {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| SignalingError::NotReady(deadline))?
    }
}

/// Helper to extract message type for logging
fn message_type<I: PeerIdentity>(msg: &SignalingMessage<I>) -> &'static str {
    match msg {
        SignalingMessage::Offer { .. } => "offer",
        SignalingMessage::Ring { .. } => "ring",
        SignalingMessage::Answer { .. } => "answer",
        SignalingMessage::IceCandidate { .. } => "ice-candidate",
        SignalingMessage::Hangup { .. } => "hangup",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// Mock fan-out transport that echoes every publish to all subscribers,
    /// the publisher included
    struct MockTransport {
        topics:
            RwLock<HashMap<ConversationId, broadcast::Sender<SignalingMessage<PeerIdentityString>>>>,
        ready_tx: watch::Sender<bool>,
        ready_rx: watch::Receiver<bool>,
    }

    impl MockTransport {
        fn new(ready: bool) -> Self {
            let (ready_tx, ready_rx) = watch::channel(ready);
            Self {
                topics: RwLock::new(HashMap::new()),
                ready_tx,
                ready_rx,
            }
        }

        fn set_ready(&self, ready: bool) {
            let _ = self.ready_tx.send(ready);
        }

        /// Inject a message without validation, as a hostile peer would
        async fn inject(&self, message: SignalingMessage<PeerIdentityString>) {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(message.conversation_id()) {
                let _ = sender.send(message);
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        type PeerId = PeerIdentityString;
        type Error = SignalingError;

        async fn publish(
            &self,
            topic: &ConversationId,
            message: SignalingMessage<PeerIdentityString>,
        ) -> Result<(), SignalingError> {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(topic) {
                let _ = sender.send(message);
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            topic: &ConversationId,
        ) -> Result<broadcast::Receiver<SignalingMessage<PeerIdentityString>>, SignalingError>
        {
            let mut topics = self.topics.write().await;
            let sender = topics
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(16).0);
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

    fn offer(
        conversation: &str,
        from: &str,
        to: &str,
        sdp: &str,
    ) -> SignalingMessage<PeerIdentityString> {
        SignalingMessage::Offer {
            conversation_id: ConversationId::new(conversation),
            from: PeerIdentityString::new(from),
            to: PeerIdentityString::new(to),
            sdp: sdp.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn wire_format_uses_type_tag() {
        let message = offer("conv-1", "alice", "bob", "v=0");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["conversation_id"], "conv-1");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["sdp"], "v=0");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn candidate_wire_tag_is_hyphenated() {
        let message: SignalingMessage<PeerIdentityString> = SignalingMessage::IceCandidate {
            conversation_id: ConversationId::new("conv-1"),
            from: PeerIdentityString::new("alice"),
            to: PeerIdentityString::new("bob"),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
            timestamp: Utc::now(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "ice-candidate");

        let parsed: SignalingMessage<PeerIdentityString> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn hangup_carries_lowercase_reason() {
        let message: SignalingMessage<PeerIdentityString> = SignalingMessage::Hangup {
            conversation_id: ConversationId::new("conv-1"),
            from: PeerIdentityString::new("alice"),
            to: PeerIdentityString::new("bob"),
            reason: HangupReason::Rejected,
            timestamp: Utc::now(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "hangup");
        assert_eq!(json["reason"], "rejected");
    }

    #[test]
    fn validation_rejects_oversized_sdp() {
        let message = offer("conv-1", "alice", "bob", &"x".repeat(MAX_SDP_LENGTH + 1));
        assert!(matches!(
            validate_message(&message),
            Err(SignalingError::InvalidMessage(_))
        ));
    }

    #[test]
    fn validation_rejects_long_conversation_id() {
        let message = offer(
            &"c".repeat(MAX_CONVERSATION_ID_LENGTH + 1),
            "alice",
            "bob",
            "v=0",
        );
        assert!(matches!(
            validate_message(&message),
            Err(SignalingError::InvalidMessage(_))
        ));
    }

    #[test]
    fn validation_accepts_normal_messages() {
        let message = offer("conv-1", "alice", "bob", "v=0");
        assert!(validate_message(&message).is_ok());
    }

    #[tokio::test]
    async fn open_filters_self_originated_messages() {
        let transport = Arc::new(MockTransport::new(true));
        let channel = SignalingChannel::new(transport.clone(), PeerIdentityString::new("alice"));
        let conversation = ConversationId::new("conv-1");

        let mut rx = channel.open(&conversation).await.unwrap();

        channel
            .publish(offer("conv-1", "alice", "bob", "self"))
            .await
            .unwrap();
        transport
            .inject(offer("conv-1", "bob", "alice", "other"))
            .await;

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.sender().as_str(), "bob");

        // Nothing else should arrive; the self-echo was dropped
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn open_drops_invalid_messages() {
        let transport = Arc::new(MockTransport::new(true));
        let channel = SignalingChannel::new(transport.clone(), PeerIdentityString::new("alice"));
        let conversation = ConversationId::new("conv-1");

        let mut rx = channel.open(&conversation).await.unwrap();

        transport
            .inject(offer(
                "conv-1",
                "bob",
                "alice",
                &"x".repeat(MAX_SDP_LENGTH + 1),
            ))
            .await;
        transport.inject(offer("conv-1", "bob", "alice", "ok")).await;

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(delivered, SignalingMessage::Offer { ref sdp, .. } if sdp == "ok"));
    }

    #[tokio::test]
    async fn open_times_out_when_transport_never_ready() {
        let transport = Arc::new(MockTransport::new(false));
        let channel = SignalingChannel::with_config(
            transport,
            PeerIdentityString::new("alice"),
            SignalingChannelConfig {
                ready_timeout: Duration::from_millis(50),
                queue_depth: 8,
            },
        );

        let result = channel.open(&ConversationId::new("conv-1")).await;
        assert!(matches!(result, Err(SignalingError::NotReady(_))));
    }

    #[tokio::test]
    async fn open_waits_for_readiness_flip() {
        let transport = Arc::new(MockTransport::new(false));
        let channel = SignalingChannel::new(transport.clone(), PeerIdentityString::new("alice"));

        let opened = tokio::spawn({
            let conversation = ConversationId::new("conv-1");
            async move { channel.open(&conversation).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.set_ready(true);

        let result = opened.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn close_ends_delivery() {
        let transport = Arc::new(MockTransport::new(true));
        let channel = SignalingChannel::new(transport.clone(), PeerIdentityString::new("alice"));
        let conversation = ConversationId::new("conv-1");

        let mut rx = channel.open(&conversation).await.unwrap();
        channel.close(&conversation).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn publish_validates_before_sending() {
        let transport = Arc::new(MockTransport::new(true));
        let channel = SignalingChannel::new(transport, PeerIdentityString::new("alice"));
        let oversized = offer("conv-1", "alice", "bob", &"x".repeat(MAX_SDP_LENGTH + 1));

        let result = tokio_test::block_on(channel.publish(oversized));
        assert!(matches!(result, Err(SignalingError::InvalidMessage(_))));
    }

    // Message pumps capture transports in spawned tasks, so every
    // implementor must satisfy the spawn bounds through the trait alone
    #[test]
    fn transports_satisfy_spawn_bounds() {
        fn assert_spawnable<T: SignalingTransport>() {
            fn assert_static<X: Send + Sync + 'static>() {}
            assert_static::<T>();
        }
        assert_spawnable::<MockTransport>();
    }
}
