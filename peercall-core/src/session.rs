//! Call session state machine
//!
//! A [`CallSession`] owns everything about one conversation's call: the
//! current phase, the peer identity, the peer connection, and the local
//! media. It is the single writer of all of that state, per the phase
//! machine below:
//!
//! ```text
//!                    ┌──────── start() ────────┐
//!                    │                         ▼
//!     Idle ──────────┤                    Connecting ──── offer published ───► Ringing
//!       ▲            │                         ▲                                 │
//!       │            └── remote offer ──┐      │                          remote answer
//!       │                               ▼      │                                 │
//!       │                           Incoming ──┘ accept()                        │
//!       │                               │                                        ▼
//!       │                            reject()                               Connecting
//!       │                               │                                        │
//!       │                               │                                 connected event
//!       │                               │                                        │
//!       │                               ▼                                        ▼
//!       └◄──── hangup / failure ── (teardown) ◄───────────────────────────── InCall
//! ```
//!
//! Every inbound message and connection signal funnels through one handler
//! pair ([`handle_message`], [`handle_connection_signal`]), and every
//! transition re-checks the current phase first, so duplicate delivery and
//! message reordering cannot corrupt the machine. Teardown resets the
//! session to a fresh `Idle`; the same session can carry the conversation's
//! next call.
//!
//! [`handle_message`]: CallSession::handle_message
//! [`handle_connection_signal`]: CallSession::handle_connection_signal

use crate::candidates::CandidateBuffer;
use crate::media::{MediaController, MediaError, MediaTrack};
use crate::peer_connection::{
    ConnectionState, PeerConnectionError, PeerConnectionHandle, PeerConnectionManager,
};
use crate::signaling::{SignalingChannel, SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallPhase, ConversationId, HangupReason, IceCandidate, MediaConstraints,
    MediaType,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

/// Call session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The intent is not valid in the current phase
    #[error("Cannot {operation} while {phase}")]
    InvalidPhase {
        /// Intent that was refused
        operation: &'static str,
        /// Phase the session was in
        phase: CallPhase,
    },

    /// Local media failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Peer connection failed
    #[error("Connection error: {0}")]
    Connection(#[from] PeerConnectionError),

    /// Signaling failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// The session was torn down while the operation was in flight
    #[error("Session torn down mid-operation")]
    Cancelled,
}

/// Driver-side notifications routed back into the session
///
/// Observer tasks forward these into the receiver returned by
/// [`CallSession::new`]; whoever owns the session must pump that receiver
/// into [`CallSession::handle_connection_signal`].
#[derive(Debug, Clone)]
pub enum ConnectionSignal {
    /// Transport-level connection state changed
    StateChanged(ConnectionState),
    /// The remote side attached a track
    RemoteTrack(MediaType),
    /// A locally gathered candidate must be forwarded to the peer
    LocalCandidate(IceCandidate),
}

/// Point-in-time view of a session for status surfaces
#[derive(Debug, Clone)]
pub struct SessionSnapshot<I> {
    /// Conversation the session serves
    pub conversation_id: ConversationId,
    /// Current phase
    pub phase: CallPhase,
    /// Remote participant, when a call is active
    pub peer: Option<I>,
    /// Identifier of the active call attempt
    pub call_id: Option<CallId>,
    /// How long media has been flowing
    pub connected_for: Option<Duration>,
    /// Local microphone mute state
    pub muted: bool,
}

/// Check whether a phase transition is allowed
///
/// # Valid Transitions
///
/// - **Outgoing**: Idle → Connecting → Ringing → Connecting → InCall
/// - **Incoming**: Idle → Incoming → Connecting → InCall
/// - **Teardown**: any active phase → Idle
#[must_use]
pub fn is_valid_phase_transition(from: CallPhase, to: CallPhase) -> bool {
    matches!(
        (from, to),
        // Starting a call, either direction
        (CallPhase::Idle, CallPhase::Connecting)
            | (CallPhase::Idle, CallPhase::Incoming)
            // Outgoing leg
            | (CallPhase::Connecting, CallPhase::Ringing)
            | (CallPhase::Ringing, CallPhase::Connecting)
            // Incoming leg
            | (CallPhase::Incoming, CallPhase::Connecting)
            // Media starts flowing
            | (CallPhase::Connecting, CallPhase::InCall)
            // Teardown from any active phase
            | (CallPhase::Connecting, CallPhase::Idle)
            | (CallPhase::Ringing, CallPhase::Idle)
            | (CallPhase::Incoming, CallPhase::Idle)
            | (CallPhase::InCall, CallPhase::Idle)
    )
}

/// Offer held while the session waits for accept or reject
struct PendingOffer<I> {
    from: I,
    sdp: String,
}

/// Everything mutable about the session, behind one lock
struct SessionState<I> {
    phase: CallPhase,
    call_id: Option<CallId>,
    peer: Option<I>,
    connection: Option<Arc<PeerConnectionHandle>>,
    incoming: Option<PendingOffer<I>>,
    early_candidates: CandidateBuffer,
    answer_applied: bool,
    connected_at: Option<Instant>,
    observers: Vec<JoinHandle<()>>,
    // Bumped on every teardown so in-flight async completions from the
    // previous call recognize they are stale
    epoch: u64,
}

impl<I> SessionState<I> {
    fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            call_id: None,
            peer: None,
            connection: None,
            incoming: None,
            early_candidates: CandidateBuffer::new(),
            answer_applied: false,
            connected_at: None,
            observers: Vec::new(),
            epoch: 0,
        }
    }
}

/// One conversation's call state machine
///
/// The session is the exclusive owner of its peer connection and local
/// media stream. User intents (`start`, `accept`, `reject`, `hang_up`,
/// `toggle_mute`, `switch_camera`) and inbound signaling both mutate state
/// through this one object.
pub struct CallSession<T: SignalingTransport> {
    conversation_id: ConversationId,
    channel: Arc<SignalingChannel<T>>,
    media: Arc<MediaController>,
    connections: Arc<PeerConnectionManager>,
    constraints: MediaConstraints,
    state: RwLock<SessionState<T::PeerId>>,
    phase_tx: watch::Sender<CallPhase>,
    phase_rx: watch::Receiver<CallPhase>,
    events: broadcast::Sender<CallEvent<T::PeerId>>,
    signal_tx: mpsc::Sender<ConnectionSignal>,
}

impl<T: SignalingTransport> CallSession<T> {
    /// Create an idle session for one conversation
    ///
    /// Returns the session and the connection-signal receiver. The caller
    /// must pump the receiver into [`handle_connection_signal`], alongside
    /// the conversation's signaling messages into [`handle_message`];
    /// without that pump no call ever reaches `InCall`.
    ///
    /// [`handle_connection_signal`]: CallSession::handle_connection_signal
    /// [`handle_message`]: CallSession::handle_message
    pub fn new(
        conversation_id: ConversationId,
        channel: Arc<SignalingChannel<T>>,
        media: Arc<MediaController>,
        connections: Arc<PeerConnectionManager>,
        constraints: MediaConstraints,
        events: broadcast::Sender<CallEvent<T::PeerId>>,
    ) -> (Self, mpsc::Receiver<ConnectionSignal>) {
        let (phase_tx, phase_rx) = watch::channel(CallPhase::Idle);
        let (signal_tx, signal_rx) = mpsc::channel(64);
        let session = Self {
            conversation_id,
            channel,
            media,
            connections,
            constraints,
            state: RwLock::new(SessionState::new()),
            phase_tx,
            phase_rx,
            events,
            signal_tx,
        };
        (session, signal_rx)
    }

    /// Conversation this session serves
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Current phase
    pub fn phase(&self) -> CallPhase {
        *self.phase_rx.borrow()
    }

    /// Observe phase changes without consuming events
    pub fn phase_watch(&self) -> watch::Receiver<CallPhase> {
        self.phase_rx.clone()
    }

    /// Whether a call is active in any phase
    pub fn is_active(&self) -> bool {
        self.phase() != CallPhase::Idle
    }

    /// Remote participant of the active call
    pub async fn remote_peer(&self) -> Option<T::PeerId> {
        self.state.read().await.peer.clone()
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<T::PeerId>> {
        self.events.subscribe()
    }

    /// Point-in-time view of the session
    pub async fn snapshot(&self) -> SessionSnapshot<T::PeerId> {
        let state = self.state.read().await;
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            phase: state.phase,
            peer: state.peer.clone(),
            call_id: state.call_id,
            connected_for: state.connected_at.map(|at| at.elapsed()),
            muted: self.media.is_muted(),
        }
    }

    // ========================================================================
    // User intents
    // ========================================================================

    /// Start an outgoing call to `peer`
    ///
    /// Acquires local media, creates the peer connection, publishes the
    /// offer (with an advisory ring alongside it) and moves the session to
    /// `Ringing`. Any step failing tears the session back down to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns error if a call is already active, media acquisition fails,
    /// or the offer cannot be published.
    #[tracing::instrument(skip(self, constraints), fields(conversation = %self.conversation_id, peer = %peer))]
    pub async fn start(
        &self,
        peer: T::PeerId,
        constraints: MediaConstraints,
    ) -> Result<CallId, SessionError> {
        let (call_id, epoch) = {
            let mut state = self.state.write().await;
            if state.phase != CallPhase::Idle {
                return Err(SessionError::InvalidPhase {
                    operation: "start a call",
                    phase: state.phase,
                });
            }
            let call_id = CallId::new();
            state.call_id = Some(call_id);
            state.peer = Some(peer.clone());
            self.set_phase(&mut state, CallPhase::Connecting);
            (call_id, state.epoch)
        };

        tracing::info!(call_id = %call_id, "Starting outgoing call");
        match self.negotiate_outgoing(&peer, call_id, &constraints, epoch).await {
            Ok(()) => Ok(call_id),
            Err(e) => {
                tracing::warn!(error = %e, "Outgoing call failed during setup");
                self.teardown_if_current(epoch).await;
                Err(e)
            }
        }
    }

    /// Accept the pending incoming call
    ///
    /// Creates the peer connection (deferred until now so rejected calls
    /// never consume capture devices), applies the stored offer, hands over
    /// any candidates that arrived early, and publishes the answer.
    ///
    /// # Errors
    ///
    /// Returns error if no call is incoming, media acquisition fails, or
    /// the answer cannot be published.
    #[tracing::instrument(skip(self), fields(conversation = %self.conversation_id))]
    pub async fn accept(&self) -> Result<(), SessionError> {
        let (pending, call_id, epoch) = {
            let mut state = self.state.write().await;
            if state.phase != CallPhase::Incoming {
                return Err(SessionError::InvalidPhase {
                    operation: "accept",
                    phase: state.phase,
                });
            }
            // Incoming implies both were stored by the offer handler
            let (Some(pending), Some(call_id)) = (state.incoming.take(), state.call_id) else {
                return Err(SessionError::InvalidPhase {
                    operation: "accept",
                    phase: state.phase,
                });
            };
            self.set_phase(&mut state, CallPhase::Connecting);
            (pending, call_id, state.epoch)
        };

        tracing::info!(call_id = %call_id, from = %pending.from, "Accepting incoming call");
        match self.negotiate_incoming(&pending, call_id, epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed during setup");
                self.teardown_if_current(epoch).await;
                Err(e)
            }
        }
    }

    /// Reject the pending incoming call
    ///
    /// Publishes a best-effort hangup with reason `rejected` and tears the
    /// session down. No capture device is ever touched.
    ///
    /// # Errors
    ///
    /// Returns error if no call is incoming.
    #[tracing::instrument(skip(self), fields(conversation = %self.conversation_id))]
    pub async fn reject(&self) -> Result<(), SessionError> {
        let peer = {
            let state = self.state.read().await;
            if state.phase != CallPhase::Incoming {
                return Err(SessionError::InvalidPhase {
                    operation: "reject",
                    phase: state.phase,
                });
            }
            state.peer.clone()
        };

        tracing::info!("Rejecting incoming call");
        if let Some(to) = peer {
            let message = SignalingMessage::Hangup {
                conversation_id: self.conversation_id.clone(),
                from: self.channel.local().clone(),
                to,
                reason: HangupReason::Rejected,
                timestamp: Utc::now(),
            };
            // Best effort; the caller gives up on its own if this is lost
            if let Err(e) = self.channel.publish(message).await {
                tracing::warn!(error = %e, "Reject notification failed to publish");
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// End the active call, whatever phase it is in
    ///
    /// Publishes a best-effort hangup (reason `left` for established calls,
    /// `rejected` for unanswered incoming ones, `hangup` otherwise) and
    /// tears down. Calling with no active call does nothing.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for transports that
    /// must flush on hangup.
    #[tracing::instrument(skip(self), fields(conversation = %self.conversation_id))]
    pub async fn hang_up(&self) -> Result<(), SessionError> {
        let (phase, peer) = {
            let state = self.state.read().await;
            (state.phase, state.peer.clone())
        };
        if phase == CallPhase::Idle {
            tracing::debug!("Hang up with no active call, ignoring");
            return Ok(());
        }

        let reason = match phase {
            CallPhase::InCall => HangupReason::Left,
            CallPhase::Incoming => HangupReason::Rejected,
            _ => HangupReason::Hangup,
        };
        tracing::info!(reason = %reason, "Hanging up");

        if let Some(to) = peer {
            let message = SignalingMessage::Hangup {
                conversation_id: self.conversation_id.clone(),
                from: self.channel.local().clone(),
                to,
                reason,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.channel.publish(message).await {
                tracing::warn!(error = %e, "Hangup failed to publish, tearing down anyway");
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// Toggle the local microphone, returning the new mute state
    ///
    /// # Errors
    ///
    /// Returns error if no media stream is active.
    pub async fn toggle_mute(&self) -> Result<bool, SessionError> {
        let connection = self.state.read().await.connection.clone();
        let muted = self.media.toggle_mute(connection.as_deref()).await?;
        self.emit(CallEvent::MuteChanged {
            conversation_id: self.conversation_id.clone(),
            muted,
        });
        Ok(muted)
    }

    /// Switch to the next camera, returning the new device ID
    ///
    /// # Errors
    ///
    /// Returns error if no stream is active or no alternate camera exists.
    pub async fn switch_camera(&self) -> Result<String, SessionError> {
        let connection = self.state.read().await.connection.clone();
        let device_id = self.media.switch_camera(connection.as_deref()).await?;
        self.emit(CallEvent::CameraSwitched {
            conversation_id: self.conversation_id.clone(),
            device_id: device_id.clone(),
        });
        Ok(device_id)
    }

    // ========================================================================
    // Inbound signaling and connection signals
    // ========================================================================

    /// Feed one inbound signaling message into the state machine
    ///
    /// Never fails: races and duplicates resolve to no-ops internally, and
    /// terminal failures surface through the event stream instead.
    #[tracing::instrument(skip(self, message), fields(conversation = %self.conversation_id))]
    pub async fn handle_message(&self, message: SignalingMessage<T::PeerId>) {
        match message {
            SignalingMessage::Offer { from, sdp, .. } => self.on_offer(from, sdp).await,
            SignalingMessage::Ring { from, .. } => self.on_ring(from),
            SignalingMessage::Answer { sdp, .. } => self.on_answer(&sdp).await,
            SignalingMessage::IceCandidate { candidate, .. } => self.on_candidate(candidate).await,
            SignalingMessage::Hangup { reason, .. } => self.on_hangup(reason).await,
        }
    }

    /// Feed one connection signal into the state machine
    pub async fn handle_connection_signal(&self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::StateChanged(ConnectionState::Connected) => {
                let mut state = self.state.write().await;
                if state.connection.is_some() && self.set_phase(&mut state, CallPhase::InCall) {
                    state.connected_at.get_or_insert_with(Instant::now);
                }
            }
            ConnectionSignal::StateChanged(ConnectionState::Failed) => {
                if self.state.read().await.connection.is_none() {
                    return;
                }
                tracing::warn!(conversation = %self.conversation_id, "Connection failed");
                self.emit(CallEvent::ConnectionFailed {
                    conversation_id: self.conversation_id.clone(),
                    error: "Transport connectivity failed".to_string(),
                });
                self.teardown().await;
            }
            ConnectionSignal::StateChanged(other) => {
                tracing::trace!(state = ?other, "Connection state changed");
            }
            ConnectionSignal::RemoteTrack(media_type) => {
                self.emit(CallEvent::RemoteTrackAdded {
                    conversation_id: self.conversation_id.clone(),
                    media_type,
                });
            }
            ConnectionSignal::LocalCandidate(candidate) => {
                self.forward_local_candidate(candidate).await;
            }
        }
    }

    // ========================================================================
    // Message handlers
    // ========================================================================

    async fn on_offer(&self, from: T::PeerId, sdp: String) {
        let mut state = self.state.write().await;
        match state.phase {
            CallPhase::Idle => {
                state.call_id = Some(CallId::new());
                state.peer = Some(from.clone());
                state.incoming = Some(PendingOffer {
                    from: from.clone(),
                    sdp,
                });
                self.set_phase(&mut state, CallPhase::Incoming);
                drop(state);
                tracing::info!(from = %from, "Incoming call");
                self.emit(CallEvent::IncomingCall {
                    conversation_id: self.conversation_id.clone(),
                    from,
                });
            }
            CallPhase::Incoming => {
                tracing::debug!("Duplicate offer while already incoming, ignoring");
            }
            other => {
                // Glare or a stale retransmission; the active call wins
                tracing::debug!(phase = %other, "Offer ignored during active call");
            }
        }
    }

    fn on_ring(&self, from: T::PeerId) {
        tracing::debug!(from = %from, "Remote device is ringing");
        self.emit(CallEvent::RingReceived {
            conversation_id: self.conversation_id.clone(),
            from,
        });
    }

    async fn on_answer(&self, sdp: &str) {
        // Claim the answer under the lock, apply it outside. The claim is
        // what keeps duplicates from ever reaching the driver twice.
        let (connection, epoch) = {
            let mut state = self.state.write().await;
            if !matches!(state.phase, CallPhase::Connecting | CallPhase::Ringing) {
                tracing::debug!(phase = %state.phase, "Answer outside an outgoing call, ignoring");
                return;
            }
            if state.answer_applied {
                tracing::debug!("Duplicate answer, ignoring");
                return;
            }
            let Some(connection) = state.connection.clone() else {
                tracing::debug!("Answer without a connection, ignoring");
                return;
            };
            state.answer_applied = true;
            (connection, state.epoch)
        };

        match connection.apply_remote_answer(sdp).await {
            Ok(()) => {
                let mut state = self.state.write().await;
                if state.epoch == epoch {
                    self.set_phase(&mut state, CallPhase::Connecting);
                }
            }
            Err(e) => {
                // Treated as a lost message; a retransmitted answer may
                // still land, so the claim is released
                tracing::warn!(error = %e, "Remote answer dropped");
                let mut state = self.state.write().await;
                if state.epoch == epoch {
                    state.answer_applied = false;
                }
            }
        }
    }

    async fn on_candidate(&self, candidate: IceCandidate) {
        let connection = {
            let mut state = self.state.write().await;
            if let Some(connection) = state.connection.clone() {
                connection
            } else if matches!(state.phase, CallPhase::Incoming | CallPhase::Connecting) {
                // A call is pending or still setting up; the candidate
                // waits for the connection install
                state.early_candidates.push(candidate);
                tracing::debug!(
                    queued = state.early_candidates.len(),
                    "Buffered candidate ahead of the connection install"
                );
                return;
            } else {
                tracing::trace!("Candidate with no active call, ignoring");
                return;
            }
        };

        match connection.add_remote_candidate(candidate).await {
            Ok(disposition) => {
                tracing::trace!(?disposition, "Handled remote candidate");
                if let Some(failures) = connection.candidate_warning() {
                    self.emit(CallEvent::MediaWarning {
                        conversation_id: self.conversation_id.clone(),
                        detail: format!("{failures} consecutive candidate failures"),
                    });
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Candidate arrived for a closed connection");
            }
        }
    }

    async fn on_hangup(&self, reason: HangupReason) {
        if !self.is_active() {
            tracing::debug!("Hangup with no active call, ignoring");
            return;
        }
        tracing::info!(reason = %reason, "Remote peer ended the call");
        self.emit(CallEvent::RemoteHangup {
            conversation_id: self.conversation_id.clone(),
            reason,
        });
        self.teardown().await;
    }

    // ========================================================================
    // Negotiation legs
    // ========================================================================

    async fn negotiate_outgoing(
        &self,
        peer: &T::PeerId,
        call_id: CallId,
        constraints: &MediaConstraints,
        epoch: u64,
    ) -> Result<(), SessionError> {
        let tracks = self.media.acquire(constraints).await?;
        let connection = match self.connections.create(call_id, &tracks).await {
            Ok(connection) => connection,
            Err(e) => {
                self.media.release_tracks(&tracks).await;
                return Err(e.into());
            }
        };
        // Observers must exist before the offer commits; candidate
        // gathering starts at local commit
        let observers = self.spawn_observers(&connection);

        if !self
            .install_connection(&connection, observers, &tracks, epoch)
            .await
        {
            return Err(SessionError::Cancelled);
        }

        let offer = connection.create_offer().await?;
        self.channel
            .publish(SignalingMessage::Offer {
                conversation_id: self.conversation_id.clone(),
                from: self.channel.local().clone(),
                to: peer.clone(),
                sdp: offer,
                timestamp: Utc::now(),
            })
            .await?;
        self.emit(CallEvent::OutgoingCall {
            conversation_id: self.conversation_id.clone(),
            to: peer.clone(),
        });

        // Advisory; its loss must not fail the call
        let ring = SignalingMessage::Ring {
            conversation_id: self.conversation_id.clone(),
            from: self.channel.local().clone(),
            to: peer.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.channel.publish(ring).await {
            tracing::warn!(error = %e, "Ring failed to publish, continuing");
        }

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return Err(SessionError::Cancelled);
        }
        self.set_phase(&mut state, CallPhase::Ringing);
        Ok(())
    }

    async fn negotiate_incoming(
        &self,
        pending: &PendingOffer<T::PeerId>,
        call_id: CallId,
        epoch: u64,
    ) -> Result<(), SessionError> {
        let tracks = self.media.acquire(&self.constraints).await?;
        let connection = match self.connections.create(call_id, &tracks).await {
            Ok(connection) => connection,
            Err(e) => {
                self.media.release_tracks(&tracks).await;
                return Err(e.into());
            }
        };
        let observers = self.spawn_observers(&connection);

        if !self
            .install_connection(&connection, observers, &tracks, epoch)
            .await
        {
            return Err(SessionError::Cancelled);
        }

        connection.apply_remote_offer(&pending.sdp).await?;
        let answer = connection.create_answer().await?;
        self.channel
            .publish(SignalingMessage::Answer {
                conversation_id: self.conversation_id.clone(),
                from: self.channel.local().clone(),
                to: pending.from.clone(),
                sdp: answer,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Store the connection and its observers, and hand any candidates
    /// that arrived before accept over to the connection in arrival order.
    ///
    /// Returns `false` when the session was torn down underneath the
    /// caller, in which case everything this attempt created is cleaned up
    /// here. Only the attempt's own tracks are stopped; a stream acquired
    /// by a call started in the meantime stays live.
    async fn install_connection(
        &self,
        connection: &Arc<PeerConnectionHandle>,
        observers: Vec<JoinHandle<()>>,
        tracks: &[Arc<MediaTrack>],
        epoch: u64,
    ) -> bool {
        let mut state = self.state.write().await;
        if state.epoch != epoch || state.phase != CallPhase::Connecting {
            drop(state);
            tracing::debug!("Session gone before the connection installed, discarding it");
            for observer in observers {
                observer.abort();
            }
            if let Err(e) = connection.close().await {
                tracing::warn!(error = %e, "Failed to close orphaned connection");
            }
            self.media.release_tracks(tracks).await;
            return false;
        }

        state.connection = Some(Arc::clone(connection));
        state.observers = observers;

        // The transfer happens under the session lock so a candidate
        // delivered right now cannot slip in ahead of the earlier ones
        let early = state.early_candidates.drain();
        for candidate in early {
            let _ = connection.add_remote_candidate(candidate).await;
        }
        true
    }

    async fn forward_local_candidate(&self, candidate: IceCandidate) {
        let peer = self.state.read().await.peer.clone();
        let Some(to) = peer else {
            tracing::trace!("Local candidate with no peer, dropping");
            return;
        };
        let message = SignalingMessage::IceCandidate {
            conversation_id: self.conversation_id.clone(),
            from: self.channel.local().clone(),
            to,
            candidate,
            timestamp: Utc::now(),
        };
        // Candidates are individually non-critical
        if let Err(e) = self.channel.publish(message).await {
            tracing::debug!(error = %e, "Candidate failed to publish");
        }
    }

    fn spawn_observers(&self, connection: &Arc<PeerConnectionHandle>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let mut connection_rx = connection.connection_state();
        let tx = self.signal_tx.clone();
        handles.push(tokio::spawn(async move {
            while connection_rx.changed().await.is_ok() {
                let next = *connection_rx.borrow_and_update();
                if tx.send(ConnectionSignal::StateChanged(next)).await.is_err() {
                    break;
                }
            }
        }));

        let mut candidates_rx = connection.local_candidates();
        let tx = self.signal_tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match candidates_rx.recv().await {
                    Ok(candidate) => {
                        if tx
                            .send(ConnectionSignal::LocalCandidate(candidate))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Candidate observer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut tracks_rx = connection.remote_tracks();
        let tx = self.signal_tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match tracks_rx.recv().await {
                    Ok(media_type) => {
                        if tx
                            .send(ConnectionSignal::RemoteTrack(media_type))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Track observer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        handles
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release everything and reset to a fresh `Idle`
    ///
    /// Safe to call from any phase, any number of times.
    async fn teardown(&self) {
        let (connection, observers, was_active) = {
            let mut state = self.state.write().await;
            if state.phase == CallPhase::Idle && state.connection.is_none() {
                return;
            }
            let connection = state.connection.take();
            let observers = std::mem::take(&mut state.observers);
            let was_active = state.phase != CallPhase::Idle;
            state.call_id = None;
            state.peer = None;
            state.incoming = None;
            state.early_candidates.clear();
            state.answer_applied = false;
            state.connected_at = None;
            state.epoch += 1;
            if was_active {
                state.phase = CallPhase::Idle;
                let _ = self.phase_tx.send(CallPhase::Idle);
            }
            (connection, observers, was_active)
        };

        for observer in observers {
            observer.abort();
        }
        // Only a call whose connection installed owns the controller's
        // stream; an attempt still negotiating cleans up after itself
        let stopped = match connection {
            Some(connection) => {
                if let Err(e) = connection.close().await {
                    tracing::warn!(error = %e, "Connection close failed during teardown");
                }
                self.media.release().await
            }
            None => 0,
        };
        tracing::debug!(conversation = %self.conversation_id, stopped, "Session torn down");

        if was_active {
            self.emit(CallEvent::PhaseChanged {
                conversation_id: self.conversation_id.clone(),
                phase: CallPhase::Idle,
            });
            self.emit(CallEvent::CallEnded {
                conversation_id: self.conversation_id.clone(),
            });
        }
    }

    /// Tear down only if no other teardown happened since `epoch`
    async fn teardown_if_current(&self, epoch: u64) {
        if self.state.read().await.epoch != epoch {
            return;
        }
        self.teardown().await;
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Move to `to` if the transition is allowed, notifying observers.
    /// Re-entering the current phase is a silent no-op.
    fn set_phase(&self, state: &mut SessionState<T::PeerId>, to: CallPhase) -> bool {
        let from = state.phase;
        if from == to {
            return true;
        }
        if !is_valid_phase_transition(from, to) {
            tracing::warn!(
                conversation = %self.conversation_id,
                from = %from,
                to = %to,
                "Phase transition refused"
            );
            return false;
        }
        state.phase = to;
        let _ = self.phase_tx.send(to);
        tracing::debug!(conversation = %self.conversation_id, from = %from, to = %to, "Phase changed");
        self.emit(CallEvent::PhaseChanged {
            conversation_id: self.conversation_id.clone(),
            phase: to,
        });
        true
    }

    fn emit(&self, event: CallEvent<T::PeerId>) {
        let _ = self.events.send(event);
    }
}
