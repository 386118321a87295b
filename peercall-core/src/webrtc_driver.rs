//! WebRTC negotiation driver
//!
//! Implements [`NegotiationDriver`] on top of webrtc-rs peer connections:
//! real SDP, real ICE gathering, real DTLS/SRTP transport. The driver only
//! negotiates; feeding samples into the outbound tracks is the embedding
//! application's capture pipeline's job.

use crate::media::MediaTrack;
use crate::peer_connection::{
    ConnectionState, DescriptionKind, NegotiationBackend, NegotiationDriver,
    PeerConnectionConfig, PeerConnectionError,
};
use crate::types::{IceCandidate, MediaType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Stream label shared by all outbound tracks of one connection
const STREAM_ID: &str = "peercall";

fn negotiation_error(context: &str, e: impl std::fmt::Display) -> PeerConnectionError {
    PeerConnectionError::Negotiation(format!("{context}: {e}"))
}

fn codec_for(media_type: MediaType) -> RTCRtpCodecCapability {
    match media_type {
        MediaType::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaType::Video | MediaType::ScreenShare => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

/// Negotiation driver backed by a webrtc-rs peer connection
pub struct WebRtcDriver {
    pc: Arc<RTCPeerConnection>,
    senders: RwLock<HashMap<MediaType, Arc<RTCRtpSender>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    candidates_tx: broadcast::Sender<IceCandidate>,
    tracks_tx: broadcast::Sender<MediaType>,
}

impl WebRtcDriver {
    /// Build a peer connection with the default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if the media engine or peer connection cannot be built
    pub async fn connect(config: &PeerConnectionConfig) -> Result<Self, PeerConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation_error("Failed to register codecs", e))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| negotiation_error("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .connectivity_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| negotiation_error("Failed to create peer connection", e))?,
        );

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        let (candidates_tx, _) = broadcast::channel(64);
        let (tracks_tx, _) = broadcast::channel(16);

        let tx = Arc::clone(&state_tx);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = Arc::clone(&tx);
            Box::pin(async move {
                let mapped = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    // Disconnected often recovers; ICE escalates to Failed
                    // on its own when it does not
                    _ => None,
                };
                if let Some(state) = mapped {
                    tracing::debug!(state = ?state, "Peer connection state changed");
                    let _ = tx.send(state);
                }
            })
        }));

        let gathered = candidates_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let gathered = gathered.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(json) => {
                            let _ = gathered.send(IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Candidate serialize error");
                        }
                    },
                    None => {
                        tracing::debug!("Candidate gathering complete");
                    }
                }
            })
        }));

        let inbound = tracks_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let inbound = inbound.clone();
            Box::pin(async move {
                let media_type = match track.kind() {
                    RTPCodecType::Audio => MediaType::Audio,
                    RTPCodecType::Video => MediaType::Video,
                    _ => return,
                };
                tracing::info!(media_type = %media_type, "Remote track added");
                let _ = inbound.send(media_type);
            })
        }));

        Ok(Self {
            pc,
            senders: RwLock::new(HashMap::new()),
            state_tx,
            state_rx,
            candidates_tx,
            tracks_tx,
        })
    }

    async fn commit_local(&self, description: RTCSessionDescription) -> Result<String, PeerConnectionError> {
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| negotiation_error("Failed to set local description", e))?;

        // Read it back so the returned SDP is the committed one
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| {
                PeerConnectionError::Negotiation("No local description after commit".to_string())
            })?;
        Ok(local.sdp)
    }
}

#[async_trait]
impl NegotiationDriver for WebRtcDriver {
    async fn create_offer(&self) -> Result<String, PeerConnectionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error("Failed to create offer", e))?;
        self.commit_local(offer).await
    }

    async fn create_answer(&self) -> Result<String, PeerConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error("Failed to create answer", e))?;
        self.commit_local(answer).await
    }

    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), PeerConnectionError> {
        let description = match kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            DescriptionKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| negotiation_error("Failed to parse description", e))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| negotiation_error("Failed to set remote description", e))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| negotiation_error("Failed to add candidate", e))
    }

    async fn attach_track(&self, track: &MediaTrack) -> Result<(), PeerConnectionError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.media_type()),
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| negotiation_error("Failed to add track", e))?;

        self.senders.write().await.insert(track.media_type(), sender);
        Ok(())
    }

    async fn replace_track(
        &self,
        media_type: MediaType,
        track: &MediaTrack,
    ) -> Result<(), PeerConnectionError> {
        let sender = {
            let senders = self.senders.read().await;
            senders.get(&media_type).cloned().ok_or_else(|| {
                PeerConnectionError::Negotiation(format!("No outbound {media_type} sender"))
            })?
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(media_type),
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| negotiation_error("Failed to replace track", e))
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidates_tx.subscribe()
    }

    fn remote_tracks(&self) -> broadcast::Receiver<MediaType> {
        self.tracks_tx.subscribe()
    }

    async fn close(&self) -> Result<(), PeerConnectionError> {
        self.pc
            .close()
            .await
            .map_err(|e| negotiation_error("Failed to close peer connection", e))?;
        let _ = self.state_tx.send(ConnectionState::Closed);
        Ok(())
    }

    fn driver_type(&self) -> &'static str {
        "webrtc"
    }
}

/// Factory for [`WebRtcDriver`] connections
#[derive(Debug, Default)]
pub struct WebRtcBackend;

impl WebRtcBackend {
    /// Create the backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NegotiationBackend for WebRtcBackend {
    async fn create_driver(
        &self,
        config: &PeerConnectionConfig,
    ) -> Result<Arc<dyn NegotiationDriver>, PeerConnectionError> {
        Ok(Arc::new(WebRtcDriver::connect(config).await?))
    }
}
