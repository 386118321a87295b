//! Call service orchestration
//!
//! [`CallService`] is the crate's front door: it owns one signaling channel,
//! one peer-connection manager and one session per watched conversation,
//! and pumps each conversation's inbound messages and connection signals
//! into its session from a dedicated task. That task is the only caller of
//! the session's handlers, so everything a session observes arrives
//! serially.

use crate::media::{CaptureSettings, DeviceSource, MediaController, SyntheticDeviceSource};
use crate::peer_connection::{
    DirectBackend, NegotiationBackend, PeerConnectionConfig, PeerConnectionManager,
};
use crate::session::{CallSession, SessionError, SessionSnapshot};
use crate::signaling::{SignalingChannel, SignalingChannelConfig, SignalingError, SignalingTransport};
use crate::types::{CallEvent, CallId, CallPhase, ConversationId, MediaConstraints};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// The conversation has no session; watch it first
    #[error("Conversation not watched: {0}")]
    NotWatched(ConversationId),

    /// Concurrent call ceiling reached
    #[error("Maximum concurrent calls reached ({0})")]
    TooManyCalls(usize),
}

/// Call service configuration
#[derive(Debug, Clone)]
pub struct CallServiceConfig {
    /// Maximum number of simultaneously active calls
    pub max_concurrent_calls: usize,
    /// Constraints used when a call is started without explicit ones
    pub default_constraints: MediaConstraints,
    /// Capacity of the shared call event stream
    pub event_capacity: usize,
    /// Peer connection configuration
    pub connection: PeerConnectionConfig,
    /// Capture settings for local media
    pub capture: CaptureSettings,
    /// Signaling channel configuration
    pub channel: SignalingChannelConfig,
}

impl Default for CallServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            default_constraints: MediaConstraints::default(),
            event_capacity: 256,
            connection: PeerConnectionConfig::default(),
            capture: CaptureSettings::default(),
            channel: SignalingChannelConfig::default(),
        }
    }
}

struct ConversationEntry<T: SignalingTransport> {
    session: Arc<CallSession<T>>,
    pump: JoinHandle<()>,
}

/// Main call service
///
/// One instance per local identity. Watch a conversation to participate in
/// its calls; user intents and status queries are addressed by conversation.
pub struct CallService<T: SignalingTransport> {
    channel: Arc<SignalingChannel<T>>,
    connections: Arc<PeerConnectionManager>,
    devices: Arc<dyn DeviceSource>,
    config: CallServiceConfig,
    conversations: RwLock<HashMap<ConversationId, ConversationEntry<T>>>,
    admission: Mutex<()>,
    events: broadcast::Sender<CallEvent<T::PeerId>>,
}

impl<T: SignalingTransport> CallService<T> {
    /// Create a service over a transport
    pub fn new(
        transport: Arc<T>,
        local: T::PeerId,
        backend: Arc<dyn NegotiationBackend>,
        devices: Arc<dyn DeviceSource>,
        config: CallServiceConfig,
    ) -> Self {
        let channel = Arc::new(SignalingChannel::with_config(
            transport,
            local,
            config.channel.clone(),
        ));
        let connections = Arc::new(PeerConnectionManager::new(backend, config.connection.clone()));
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            channel,
            connections,
            devices,
            config,
            conversations: RwLock::new(HashMap::new()),
            admission: Mutex::new(()),
            events,
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(transport: Arc<T>, local: T::PeerId) -> CallServiceBuilder<T> {
        CallServiceBuilder::new(transport, local)
    }

    /// The identity this service signs its messages with
    pub fn local(&self) -> &T::PeerId {
        self.channel.local()
    }

    /// The signaling channel the service publishes through
    pub fn channel(&self) -> &Arc<SignalingChannel<T>> {
        &self.channel
    }

    /// Get service configuration
    #[must_use]
    pub fn config(&self) -> &CallServiceConfig {
        &self.config
    }

    /// Whether the signaling transport currently reports ready
    pub fn is_ready(&self) -> bool {
        self.channel.is_ready()
    }

    /// Subscribe to call events from every watched conversation
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<T::PeerId>> {
        self.events.subscribe()
    }

    /// Start watching a conversation for calls
    ///
    /// Subscribes to the conversation's signaling topic and spawns the pump
    /// that feeds its session. Watching an already watched conversation
    /// returns the existing session.
    ///
    /// # Errors
    ///
    /// Returns error if the signaling subscription fails.
    #[tracing::instrument(skip(self), fields(conversation = %conversation))]
    pub async fn watch_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<Arc<CallSession<T>>, ServiceError> {
        let mut conversations = self.conversations.write().await;
        if let Some(entry) = conversations.get(conversation) {
            return Ok(Arc::clone(&entry.session));
        }

        let mut messages = self.channel.open(conversation).await?;
        let media = Arc::new(MediaController::new(
            Arc::clone(&self.devices),
            self.config.capture.clone(),
        ));
        let (session, mut signals) = CallSession::new(
            conversation.clone(),
            Arc::clone(&self.channel),
            media,
            Arc::clone(&self.connections),
            self.config.default_constraints.clone(),
            self.events.clone(),
        );
        let session = Arc::new(session);

        let pump_session = Arc::clone(&session);
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = messages.recv() => match message {
                        Some(message) => pump_session.handle_message(message).await,
                        None => break,
                    },
                    signal = signals.recv() => match signal {
                        Some(signal) => pump_session.handle_connection_signal(signal).await,
                        None => break,
                    },
                }
            }
            tracing::debug!(
                conversation = %pump_session.conversation_id(),
                "Conversation pump stopped"
            );
        });

        conversations.insert(
            conversation.clone(),
            ConversationEntry {
                session: Arc::clone(&session),
                pump,
            },
        );
        tracing::info!("Watching conversation");
        Ok(session)
    }

    /// Stop watching a conversation
    ///
    /// Ends any active call in it, stops the pump and unsubscribes from the
    /// signaling topic. Unwatching a conversation that was never watched
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the signaling unsubscribe fails.
    #[tracing::instrument(skip(self), fields(conversation = %conversation))]
    pub async fn unwatch_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<(), ServiceError> {
        let entry = self.conversations.write().await.remove(conversation);
        let Some(entry) = entry else {
            tracing::debug!("Unwatch for a conversation that was not watched");
            return Ok(());
        };

        if let Err(e) = entry.session.hang_up().await {
            tracing::warn!(error = %e, "Hangup during unwatch failed");
        }
        entry.pump.abort();
        self.channel.close(conversation).await?;
        tracing::info!("Stopped watching conversation");
        Ok(())
    }

    /// Start an outgoing call in a conversation
    ///
    /// Watches the conversation first if it is not watched yet. With no
    /// explicit constraints the service default applies.
    ///
    /// # Errors
    ///
    /// Returns error if the concurrent call ceiling is reached, the
    /// conversation cannot be watched, or the session refuses to start.
    #[tracing::instrument(skip(self, constraints), fields(conversation = %conversation, peer = %peer))]
    pub async fn start_call(
        &self,
        conversation: &ConversationId,
        peer: T::PeerId,
        constraints: Option<MediaConstraints>,
    ) -> Result<CallId, ServiceError> {
        // Ceiling check and start are one admission step; the session has
        // left Idle by the time the lock releases, so the next caller
        // counts this call
        let _admission = self.admission.lock().await;
        if self.active_calls().await >= self.config.max_concurrent_calls {
            return Err(ServiceError::TooManyCalls(self.config.max_concurrent_calls));
        }

        let session = self.watch_conversation(conversation).await?;
        let constraints =
            constraints.unwrap_or_else(|| self.config.default_constraints.clone());
        Ok(session.start(peer, constraints).await?)
    }

    /// Accept the incoming call in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if the conversation is not watched or no call is
    /// incoming.
    #[tracing::instrument(skip(self), fields(conversation = %conversation))]
    pub async fn accept_call(&self, conversation: &ConversationId) -> Result<(), ServiceError> {
        Ok(self.session(conversation).await?.accept().await?)
    }

    /// Reject the incoming call in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if the conversation is not watched or no call is
    /// incoming.
    #[tracing::instrument(skip(self), fields(conversation = %conversation))]
    pub async fn reject_call(&self, conversation: &ConversationId) -> Result<(), ServiceError> {
        Ok(self.session(conversation).await?.reject().await?)
    }

    /// End the active call in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if the conversation is not watched.
    #[tracing::instrument(skip(self), fields(conversation = %conversation))]
    pub async fn hang_up(&self, conversation: &ConversationId) -> Result<(), ServiceError> {
        Ok(self.session(conversation).await?.hang_up().await?)
    }

    /// Toggle the microphone for a conversation's call
    ///
    /// # Errors
    ///
    /// Returns error if the conversation is not watched or has no stream.
    pub async fn toggle_mute(&self, conversation: &ConversationId) -> Result<bool, ServiceError> {
        Ok(self.session(conversation).await?.toggle_mute().await?)
    }

    /// Switch cameras for a conversation's call
    ///
    /// # Errors
    ///
    /// Returns error if the conversation is not watched, has no stream, or
    /// has no alternate camera.
    pub async fn switch_camera(
        &self,
        conversation: &ConversationId,
    ) -> Result<String, ServiceError> {
        Ok(self.session(conversation).await?.switch_camera().await?)
    }

    /// Current phase of a conversation's call
    pub async fn phase(&self, conversation: &ConversationId) -> Option<CallPhase> {
        let conversations = self.conversations.read().await;
        conversations.get(conversation).map(|e| e.session.phase())
    }

    /// Observe a conversation's phase changes
    pub async fn phase_watch(
        &self,
        conversation: &ConversationId,
    ) -> Option<watch::Receiver<CallPhase>> {
        let conversations = self.conversations.read().await;
        conversations
            .get(conversation)
            .map(|e| e.session.phase_watch())
    }

    /// Point-in-time view of a conversation's session
    pub async fn snapshot(
        &self,
        conversation: &ConversationId,
    ) -> Option<SessionSnapshot<T::PeerId>> {
        let session = {
            let conversations = self.conversations.read().await;
            conversations
                .get(conversation)
                .map(|e| Arc::clone(&e.session))
        };
        match session {
            Some(session) => Some(session.snapshot().await),
            None => None,
        }
    }

    /// Number of calls currently in a non-idle phase
    pub async fn active_calls(&self) -> usize {
        self.conversations
            .read()
            .await
            .values()
            .filter(|e| e.session.is_active())
            .count()
    }

    /// End all calls and stop watching every conversation
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let entries: Vec<(ConversationId, ConversationEntry<T>)> =
            self.conversations.write().await.drain().collect();

        let hangups = entries.iter().map(|(_, entry)| entry.session.hang_up());
        for result in futures::future::join_all(hangups).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Hangup during shutdown failed");
            }
        }

        for (conversation, entry) in entries {
            entry.pump.abort();
            if let Err(e) = self.channel.close(&conversation).await {
                tracing::debug!(
                    conversation = %conversation,
                    error = %e,
                    "Unsubscribe during shutdown failed"
                );
            }
        }
        tracing::info!("Call service shut down");
    }

    async fn session(
        &self,
        conversation: &ConversationId,
    ) -> Result<Arc<CallSession<T>>, ServiceError> {
        self.conversations
            .read()
            .await
            .get(conversation)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| ServiceError::NotWatched(conversation.clone()))
    }
}

/// Call service builder
pub struct CallServiceBuilder<T: SignalingTransport> {
    transport: Arc<T>,
    local: T::PeerId,
    backend: Option<Arc<dyn NegotiationBackend>>,
    devices: Option<Arc<dyn DeviceSource>>,
    config: CallServiceConfig,
}

impl<T: SignalingTransport> CallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<T>, local: T::PeerId) -> Self {
        Self {
            transport,
            local,
            backend: None,
            devices: None,
            config: CallServiceConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the negotiation backend
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn NegotiationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the capture device source
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn DeviceSource>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Build the service
    ///
    /// Defaults to the in-process negotiation backend and synthetic capture
    /// devices when none were provided.
    #[must_use]
    pub fn build(self) -> CallService<T> {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(DirectBackend::new()));
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(SyntheticDeviceSource::new()));
        CallService::new(self.transport, self.local, backend, devices, self.config)
    }
}
