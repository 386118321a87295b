//! Peer connection lifecycle and negotiation state
//!
//! A [`PeerConnectionHandle`] owns the negotiation object for exactly one
//! call and guards every mutation against the reordering and duplication the
//! signaling channel allows: candidates that beat the remote description are
//! buffered, duplicate descriptions become no-ops, and answers that arrive
//! before the local offer has committed are retried with bounded backoff.
//!
//! The actual negotiation work happens behind the [`NegotiationDriver`]
//! trait. [`DirectDriver`] implements it for transports with built-in
//! connectivity; the `webrtc-driver` feature adds a driver backed by real
//! ICE/DTLS/SRTP peer connections.

use crate::candidates::CandidateBuffer;
use crate::media::MediaTrack;
use crate::types::{CallId, IceCandidate, MediaType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use uuid::Uuid;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerConnectionError {
    /// The negotiation object rejected an operation
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Operation arrived in a state that cannot accept it
    #[error("Invalid negotiation state: {0:?}")]
    InvalidState(NegotiationState),

    /// Remote answer could not be applied within the retry budget
    #[error("Answer not applied after {0} attempts")]
    AnswerRetriesExhausted(u32),

    /// The connection was closed
    #[error("Peer connection closed")]
    Closed,
}

/// Where the handle stands in the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    /// No description committed yet
    New,
    /// Local offer committed, waiting for the remote answer
    HaveLocalOffer,
    /// Remote offer committed, waiting to produce an answer
    HaveRemoteOffer,
    /// Both descriptions committed
    Stable,
    /// Torn down, no further mutation allowed
    Closed,
}

/// Transport-level connection state reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing happened yet
    New,
    /// Connectivity checks in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity was lost or never established
    Failed,
    /// Shut down locally
    Closed,
}

/// Which kind of session description is being committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    /// Remote offer
    Offer,
    /// Remote answer
    Answer,
}

/// What happened to a candidate handed to the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Applied to the negotiation object immediately
    Applied,
    /// Queued until the remote description lands
    Buffered,
    /// The driver rejected it; the failure was logged and swallowed
    Dropped,
}

/// Configuration for peer connections
#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    /// Connectivity server URLs handed to the negotiation object
    pub connectivity_servers: Vec<String>,
    /// Attempts to apply a remote answer before dropping it
    pub answer_retry_attempts: u32,
    /// First answer-retry delay, doubled on every attempt
    pub answer_retry_base_delay: Duration,
    /// Upper bound for a single answer-retry delay
    pub answer_retry_max_delay: Duration,
    /// Consecutive candidate failures before a warning is raised
    pub candidate_failure_warn_threshold: u32,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            connectivity_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            answer_retry_attempts: 10,
            answer_retry_base_delay: Duration::from_millis(100),
            answer_retry_max_delay: Duration::from_secs(2),
            candidate_failure_warn_threshold: 5,
        }
    }
}

/// The negotiation object behind a peer connection
///
/// Implementations perform the actual description and candidate work.
/// Drivers are bound to a single call and discarded with it; nothing here
/// is reused across calls.
#[async_trait]
pub trait NegotiationDriver: Send + Sync {
    /// Generate an offer description and commit it locally
    async fn create_offer(&self) -> Result<String, PeerConnectionError>;

    /// Generate an answer description and commit it locally
    async fn create_answer(&self) -> Result<String, PeerConnectionError>;

    /// Commit a remote description
    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), PeerConnectionError>;

    /// Whether a remote description has been committed
    async fn has_remote_description(&self) -> bool;

    /// Apply a connectivity candidate
    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerConnectionError>;

    /// Attach a local track for sending
    async fn attach_track(&self, track: &MediaTrack) -> Result<(), PeerConnectionError>;

    /// Swap the outbound track of the given kind without renegotiating
    async fn replace_track(
        &self,
        media_type: MediaType,
        track: &MediaTrack,
    ) -> Result<(), PeerConnectionError>;

    /// Observe transport-level connection state
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Locally gathered candidates that must be forwarded to the peer
    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate>;

    /// Notifications for inbound remote tracks
    fn remote_tracks(&self) -> broadcast::Receiver<MediaType>;

    /// Close the negotiation object; must be idempotent
    async fn close(&self) -> Result<(), PeerConnectionError>;

    /// Driver name for logs
    fn driver_type(&self) -> &'static str;
}

/// Factory for negotiation drivers
#[async_trait]
pub trait NegotiationBackend: Send + Sync {
    /// Create a fresh negotiation object for one call
    async fn create_driver(
        &self,
        config: &PeerConnectionConfig,
    ) -> Result<Arc<dyn NegotiationDriver>, PeerConnectionError>;
}

/// Creates peer connections with local tracks already attached
pub struct PeerConnectionManager {
    backend: Arc<dyn NegotiationBackend>,
    config: PeerConnectionConfig,
}

impl PeerConnectionManager {
    /// Create a manager over the given backend
    #[must_use]
    pub fn new(backend: Arc<dyn NegotiationBackend>, config: PeerConnectionConfig) -> Self {
        Self { backend, config }
    }

    /// Create a connection for one call and attach the local tracks.
    ///
    /// Callers must have acquired local media first; a connection without
    /// outbound tracks would negotiate a call nobody can hear.
    ///
    /// # Errors
    ///
    /// Returns error if the driver cannot be created or a track cannot be
    /// attached.
    #[tracing::instrument(skip(self, tracks), fields(call_id = %call_id, track_count = tracks.len()))]
    pub async fn create(
        &self,
        call_id: CallId,
        tracks: &[Arc<MediaTrack>],
    ) -> Result<Arc<PeerConnectionHandle>, PeerConnectionError> {
        let driver = self.backend.create_driver(&self.config).await?;
        tracing::debug!(driver = driver.driver_type(), "Created negotiation driver");

        for track in tracks {
            driver.attach_track(track).await?;
        }

        Ok(Arc::new(PeerConnectionHandle::new(
            call_id,
            driver,
            self.config.clone(),
        )))
    }

    /// The connection configuration used for new calls
    pub fn config(&self) -> &PeerConnectionConfig {
        &self.config
    }
}

/// Owns the negotiation object for one call
///
/// All mutation goes through this handle, which serializes description and
/// candidate work so signaling reordering can never corrupt the underlying
/// negotiation object.
pub struct PeerConnectionHandle {
    call_id: CallId,
    driver: Arc<dyn NegotiationDriver>,
    negotiation: RwLock<NegotiationState>,
    candidates: Mutex<CandidateBuffer>,
    candidate_failures: AtomicU32,
    candidate_warned: AtomicBool,
    config: PeerConnectionConfig,
}

impl PeerConnectionHandle {
    fn new(call_id: CallId, driver: Arc<dyn NegotiationDriver>, config: PeerConnectionConfig) -> Self {
        Self {
            call_id,
            driver,
            negotiation: RwLock::new(NegotiationState::New),
            candidates: Mutex::new(CandidateBuffer::new()),
            candidate_failures: AtomicU32::new(0),
            candidate_warned: AtomicBool::new(false),
            config,
        }
    }

    /// The call this connection belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Current negotiation state
    pub async fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.read().await
    }

    /// Number of candidates waiting for the remote description
    pub async fn buffered_candidates(&self) -> usize {
        self.candidates.lock().await.len()
    }

    /// Observe transport-level connection state
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.driver.connection_state()
    }

    /// Locally gathered candidates that must be forwarded over signaling
    pub fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.driver.local_candidates()
    }

    /// Notifications for inbound remote tracks
    pub fn remote_tracks(&self) -> broadcast::Receiver<MediaType> {
        self.driver.remote_tracks()
    }

    /// Generate and commit the local offer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if any negotiation already happened on this
    /// connection.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn create_offer(&self) -> Result<String, PeerConnectionError> {
        let mut state = self.negotiation.write().await;
        if *state != NegotiationState::New {
            return Err(PeerConnectionError::InvalidState(*state));
        }

        let sdp = self.driver.create_offer().await?;
        *state = NegotiationState::HaveLocalOffer;
        tracing::debug!("Local offer committed");
        Ok(sdp)
    }

    /// Commit a remote offer
    ///
    /// No-op when a remote description is already present, so duplicated
    /// offer messages cannot corrupt the exchange. Buffered candidates are
    /// applied in arrival order once the description commits.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or the driver rejects the
    /// description.
    #[tracing::instrument(skip(self, sdp), fields(call_id = %self.call_id))]
    pub async fn apply_remote_offer(&self, sdp: &str) -> Result<(), PeerConnectionError> {
        let mut state = self.negotiation.write().await;
        if *state == NegotiationState::Closed {
            return Err(PeerConnectionError::Closed);
        }
        if self.driver.has_remote_description().await {
            tracing::debug!("Remote description already set, ignoring duplicate offer");
            return Ok(());
        }

        match *state {
            NegotiationState::New => {
                self.driver
                    .set_remote_description(DescriptionKind::Offer, sdp)
                    .await?;
                *state = NegotiationState::HaveRemoteOffer;
                tracing::debug!("Remote offer committed");
                self.flush_candidates().await;
                Ok(())
            }
            other => {
                tracing::warn!(state = ?other, "Offer arrived in unexpected state, ignoring");
                Ok(())
            }
        }
    }

    /// Generate and commit the local answer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a remote offer was applied first.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn create_answer(&self) -> Result<String, PeerConnectionError> {
        let mut state = self.negotiation.write().await;
        if *state != NegotiationState::HaveRemoteOffer {
            return Err(PeerConnectionError::InvalidState(*state));
        }

        let sdp = self.driver.create_answer().await?;
        *state = NegotiationState::Stable;
        tracing::debug!("Local answer committed");
        Ok(sdp)
    }

    /// Commit a remote answer, retrying with bounded backoff while the
    /// local offer has not committed yet
    ///
    /// An answer can overtake the tail of our own offer path on an
    /// unordered channel. Rather than dropping it, the apply is retried on
    /// a doubling delay until the local offer lands or the budget runs out.
    /// Once stable, further answers are ignored.
    ///
    /// # Errors
    ///
    /// Returns `AnswerRetriesExhausted` if the negotiation never became
    /// ready, or `Closed` if the connection was torn down mid-retry.
    #[tracing::instrument(skip(self, sdp), fields(call_id = %self.call_id))]
    pub async fn apply_remote_answer(&self, sdp: &str) -> Result<(), PeerConnectionError> {
        let attempts = self.config.answer_retry_attempts.max(1);
        let mut delay = self.config.answer_retry_base_delay;

        for attempt in 1..=attempts {
            {
                let mut state = self.negotiation.write().await;
                match *state {
                    NegotiationState::HaveLocalOffer => {
                        self.driver
                            .set_remote_description(DescriptionKind::Answer, sdp)
                            .await?;
                        *state = NegotiationState::Stable;
                        tracing::debug!(attempt, "Remote answer committed");
                        self.flush_candidates().await;
                        return Ok(());
                    }
                    NegotiationState::Stable => {
                        tracing::debug!("Already stable, ignoring duplicate answer");
                        return Ok(());
                    }
                    NegotiationState::Closed => return Err(PeerConnectionError::Closed),
                    NegotiationState::New | NegotiationState::HaveRemoteOffer => {}
                }
            }

            if attempt < attempts {
                tracing::trace!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Negotiation not ready for answer, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(self.config.answer_retry_max_delay);
            }
        }

        tracing::warn!(attempts, "Gave up applying remote answer");
        Err(PeerConnectionError::AnswerRetriesExhausted(attempts))
    }

    /// Hand a remote candidate to the connection
    ///
    /// Applied immediately when the remote description is present, buffered
    /// otherwise. Individual apply failures never surface; they are logged
    /// and counted toward [`candidate_warning`].
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the connection was torn down.
    ///
    /// [`candidate_warning`]: PeerConnectionHandle::candidate_warning
    #[tracing::instrument(skip(self, candidate), fields(call_id = %self.call_id))]
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, PeerConnectionError> {
        let state = self.negotiation.read().await;
        if *state == NegotiationState::Closed {
            return Err(PeerConnectionError::Closed);
        }

        if self.driver.has_remote_description().await {
            let applied = self.apply_candidate_now(&candidate).await;
            return Ok(if applied {
                CandidateDisposition::Applied
            } else {
                CandidateDisposition::Dropped
            });
        }

        let mut buffer = self.candidates.lock().await;
        buffer.push(candidate);
        tracing::debug!(queued = buffer.len(), "Buffered early candidate");
        Ok(CandidateDisposition::Buffered)
    }

    /// Fires once when consecutive candidate failures cross the configured
    /// threshold, returning the failure count. Successful applies reset the
    /// streak and re-arm the warning.
    pub fn candidate_warning(&self) -> Option<u32> {
        let failures = self.candidate_failures.load(Ordering::Relaxed);
        if failures >= self.config.candidate_failure_warn_threshold
            && !self.candidate_warned.swap(true, Ordering::Relaxed)
        {
            return Some(failures);
        }
        None
    }

    /// Swap the outbound track of the given kind without renegotiating
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or the driver rejects the
    /// replacement.
    #[tracing::instrument(skip(self, track), fields(call_id = %self.call_id, media_type = %media_type))]
    pub async fn replace_outbound_track(
        &self,
        media_type: MediaType,
        track: &MediaTrack,
    ) -> Result<(), PeerConnectionError> {
        let state = self.negotiation.read().await;
        if *state == NegotiationState::Closed {
            return Err(PeerConnectionError::Closed);
        }
        drop(state);

        self.driver.replace_track(media_type, track).await
    }

    /// Close the connection, discarding buffered candidates
    ///
    /// Idempotent: closing twice does nothing the second time.
    ///
    /// # Errors
    ///
    /// Returns error if the driver fails to shut down.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn close(&self) -> Result<(), PeerConnectionError> {
        let mut state = self.negotiation.write().await;
        if *state == NegotiationState::Closed {
            tracing::debug!("Peer connection already closed");
            return Ok(());
        }
        *state = NegotiationState::Closed;
        self.candidates.lock().await.clear();
        drop(state);

        self.driver.close().await
    }

    /// Apply every buffered candidate in arrival order. Callers must hold
    /// the negotiation write lock so nothing can interleave new candidates.
    async fn flush_candidates(&self) {
        let queued = self.candidates.lock().await.drain();
        if queued.is_empty() {
            return;
        }

        tracing::debug!(count = queued.len(), "Applying buffered candidates");
        for candidate in queued {
            self.apply_candidate_now(&candidate).await;
        }
    }

    async fn apply_candidate_now(&self, candidate: &IceCandidate) -> bool {
        match self.driver.add_candidate(candidate).await {
            Ok(()) => {
                self.candidate_failures.store(0, Ordering::Relaxed);
                self.candidate_warned.store(false, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let failures = self.candidate_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error = %e, failures, "Failed to apply candidate");
                false
            }
        }
    }
}

/// Negotiation driver for transports with built-in connectivity
///
/// Descriptions are plain capability records: each attached track adds a
/// media line, and the connection counts as established once both sides
/// have committed descriptions. No connectivity servers are contacted. One
/// synthetic host candidate is emitted per committed local description so
/// the candidate path stays exercised end to end.
pub struct DirectDriver {
    local_description: RwLock<Option<String>>,
    remote_description: RwLock<Option<String>>,
    attached: Mutex<Vec<(MediaType, String)>>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    remote_sets: AtomicU32,
    close_calls: AtomicU32,
    fail_candidates: AtomicBool,
    connection_tx: watch::Sender<ConnectionState>,
    connection_rx: watch::Receiver<ConnectionState>,
    candidates_tx: broadcast::Sender<IceCandidate>,
    tracks_tx: broadcast::Sender<MediaType>,
}

impl DirectDriver {
    /// Create a driver with no descriptions committed
    #[must_use]
    pub fn new() -> Self {
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::New);
        let (candidates_tx, _) = broadcast::channel(16);
        let (tracks_tx, _) = broadcast::channel(8);
        Self {
            local_description: RwLock::new(None),
            remote_description: RwLock::new(None),
            attached: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
            remote_sets: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            fail_candidates: AtomicBool::new(false),
            connection_tx,
            connection_rx,
            candidates_tx,
            tracks_tx,
        }
    }

    /// Make every subsequent candidate apply fail, for driving the
    /// degraded-connectivity path
    pub fn set_candidate_failures(&self, fail: bool) {
        self.fail_candidates.store(fail, Ordering::Relaxed);
    }

    /// Force the connection into the failed state
    pub fn fail_connection(&self) {
        let _ = self.connection_tx.send(ConnectionState::Failed);
    }

    /// Candidates applied so far, in application order
    pub async fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().await.clone()
    }

    /// How many times a remote description was committed
    pub fn remote_description_sets(&self) -> u32 {
        self.remote_sets.load(Ordering::Relaxed)
    }

    /// How many times close reached the driver
    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        *self.connection_rx.borrow() == ConnectionState::Closed
    }

    async fn render_description(&self) -> String {
        let mut sdp = format!("v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=peercall\r\nt=0 0\r\n", Uuid::new_v4());
        for (media_type, _) in self.attached.lock().await.iter() {
            let kind = match media_type {
                MediaType::Audio => "audio",
                MediaType::Video | MediaType::ScreenShare => "video",
            };
            sdp.push_str(&format!("m={kind} 9 UDP/QUIC 0\r\n"));
        }
        sdp
    }

    async fn after_description_change(&self) {
        let local = self.local_description.read().await.is_some();
        let remote = self.remote_description.read().await.is_some();
        let next = match (local, remote) {
            (true, true) => ConnectionState::Connected,
            (false, false) => return,
            _ => ConnectionState::Connecting,
        };
        if !self.is_closed() {
            let _ = self.connection_tx.send(next);
        }
    }

    async fn commit_local(&self) -> Result<String, PeerConnectionError> {
        if self.is_closed() {
            return Err(PeerConnectionError::Closed);
        }
        let sdp = self.render_description().await;
        *self.local_description.write().await = Some(sdp.clone());
        self.after_description_change().await;

        // Gathering starts at local commit
        let _ = self.candidates_tx.send(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        Ok(sdp)
    }
}

impl Default for DirectDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NegotiationDriver for DirectDriver {
    async fn create_offer(&self) -> Result<String, PeerConnectionError> {
        self.commit_local().await
    }

    async fn create_answer(&self) -> Result<String, PeerConnectionError> {
        if self.remote_description.read().await.is_none() {
            return Err(PeerConnectionError::Negotiation(
                "Cannot answer without a remote offer".to_string(),
            ));
        }
        self.commit_local().await
    }

    async fn set_remote_description(
        &self,
        _kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), PeerConnectionError> {
        if self.is_closed() {
            return Err(PeerConnectionError::Closed);
        }
        if sdp.is_empty() {
            return Err(PeerConnectionError::Negotiation(
                "Empty remote description".to_string(),
            ));
        }

        *self.remote_description.write().await = Some(sdp.to_string());
        self.remote_sets.fetch_add(1, Ordering::Relaxed);

        for line in sdp.lines() {
            if line.starts_with("m=audio") {
                let _ = self.tracks_tx.send(MediaType::Audio);
            } else if line.starts_with("m=video") {
                let _ = self.tracks_tx.send(MediaType::Video);
            }
        }

        self.after_description_change().await;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_description.read().await.is_some()
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerConnectionError> {
        if self.is_closed() {
            return Err(PeerConnectionError::Closed);
        }
        if self.fail_candidates.load(Ordering::Relaxed) {
            return Err(PeerConnectionError::Negotiation(
                "Candidate rejected".to_string(),
            ));
        }
        self.applied_candidates.lock().await.push(candidate.clone());
        Ok(())
    }

    async fn attach_track(&self, track: &MediaTrack) -> Result<(), PeerConnectionError> {
        if self.is_closed() {
            return Err(PeerConnectionError::Closed);
        }
        self.attached
            .lock()
            .await
            .push((track.media_type(), track.id().to_string()));
        Ok(())
    }

    async fn replace_track(
        &self,
        media_type: MediaType,
        track: &MediaTrack,
    ) -> Result<(), PeerConnectionError> {
        if self.is_closed() {
            return Err(PeerConnectionError::Closed);
        }
        let mut attached = self.attached.lock().await;
        let slot = attached
            .iter_mut()
            .find(|(kind, _)| *kind == media_type)
            .ok_or_else(|| {
                PeerConnectionError::Negotiation(format!("No {media_type} sender to replace"))
            })?;
        slot.1 = track.id().to_string();
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_rx.clone()
    }

    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidates_tx.subscribe()
    }

    fn remote_tracks(&self) -> broadcast::Receiver<MediaType> {
        self.tracks_tx.subscribe()
    }

    async fn close(&self) -> Result<(), PeerConnectionError> {
        if self.is_closed() {
            return Ok(());
        }
        self.close_calls.fetch_add(1, Ordering::Relaxed);
        let _ = self.connection_tx.send(ConnectionState::Closed);
        Ok(())
    }

    fn driver_type(&self) -> &'static str {
        "direct"
    }
}

/// Backend producing [`DirectDriver`] instances
///
/// Keeps every driver it created, even after close, so connectivity can be
/// inspected or failed from the outside, which the loopback demo and the
/// test suite rely on. The list is never pruned; a process that places
/// calls indefinitely wants a production backend instead.
#[derive(Default)]
pub struct DirectBackend {
    created: Mutex<Vec<Arc<DirectDriver>>>,
    fail_candidates: AtomicBool,
}

impl DirectBackend {
    /// Create a backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make drivers created from now on reject every candidate
    pub fn set_candidate_failures(&self, fail: bool) {
        self.fail_candidates.store(fail, Ordering::Relaxed);
    }

    /// Every driver created so far, in creation order
    pub async fn drivers(&self) -> Vec<Arc<DirectDriver>> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl NegotiationBackend for DirectBackend {
    async fn create_driver(
        &self,
        _config: &PeerConnectionConfig,
    ) -> Result<Arc<dyn NegotiationDriver>, PeerConnectionError> {
        let driver = Arc::new(DirectDriver::new());
        if self.fail_candidates.load(Ordering::Relaxed) {
            driver.set_candidate_failures(true);
        }
        self.created.lock().await.push(Arc::clone(&driver));
        Ok(driver)
    }
}
