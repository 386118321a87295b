//! Peercall - one-to-one call signaling and peer-connection lifecycle
//!
//! This library negotiates audio/video calls over an unreliable, unordered,
//! fan-out pub/sub signaling channel. It features:
//!
//! - **Transport-agnostic signaling**: Any fan-out pub/sub layer works; a
//!   QUIC mesh and an in-process hub ship in the box
//! - **Loss-tolerant protocol**: Duplicate, reordered, and echoed messages
//!   are absorbed by idempotent state transitions
//! - **Pluggable negotiation**: WebRTC by default, or any SDP/ICE engine
//!   behind the driver trait
//! - **Per-conversation sessions**: Independent call state machines keyed
//!   by conversation, driven through a single service
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::{CallService, ConversationId, LoopbackHub, MediaConstraints, PeerIdentityString};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! // In-process hub; swap in QuicMeshTransport for a real deployment
//! let hub = Arc::new(LoopbackHub::<PeerIdentityString>::new());
//! let service = CallService::builder(hub, PeerIdentityString::new("alice-bob-carol-dave")).build();
//!
//! // Watch the conversation so inbound offers surface as events
//! let conversation = ConversationId::new("weekly-sync");
//! service.watch_conversation(&conversation).await?;
//!
//! // Initiate a video call
//! let call_id = service
//!     .start_call(
//!         &conversation,
//!         PeerIdentityString::new("eve-frank-grace-henry"),
//!         Some(MediaConstraints::video_call()),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Peer identity abstraction
pub mod identity;

/// Ordered buffering for early ICE candidates
pub mod candidates;

/// Signaling protocol, validation, and the per-conversation channel
pub mod signaling;

/// Local media capture and device management
pub mod media;

/// Peer connection lifecycle over pluggable negotiation drivers
pub mod peer_connection;

/// Per-conversation call state machine
pub mod session;

/// Call service orchestrating sessions across conversations
pub mod service;

/// Signaling transports: in-process hub and QUIC mesh
pub mod transport;

/// WebRTC negotiation driver (requires the `webrtc-driver` feature)
#[cfg(feature = "webrtc-driver")]
pub mod webrtc_driver;

// Re-export main types at crate root
pub use candidates::CandidateBuffer;
pub use identity::{PeerIdentity, PeerIdentityString};
pub use media::{
    AudioDevice, CaptureSettings, DeviceSource, FacingMode, LocalMediaStream, MediaController,
    MediaError, MediaEvent, MediaTrack, SyntheticDeviceSource, VideoDevice,
};
pub use peer_connection::{
    CandidateDisposition, ConnectionState, DescriptionKind, DirectBackend, DirectDriver,
    NegotiationBackend, NegotiationDriver, NegotiationState, PeerConnectionConfig,
    PeerConnectionError, PeerConnectionHandle, PeerConnectionManager,
};
pub use service::{CallService, CallServiceBuilder, CallServiceConfig, ServiceError};
pub use session::{
    is_valid_phase_transition, CallSession, ConnectionSignal, SessionError, SessionSnapshot,
};
pub use signaling::{
    validate_message, SignalingChannel, SignalingChannelConfig, SignalingError, SignalingMessage,
    SignalingTransport, MAX_CONVERSATION_ID_LENGTH, MAX_SDP_LENGTH, MAX_SIGNALING_MESSAGE_SIZE,
};
pub use transport::LoopbackHub;
#[cfg(feature = "quic-mesh")]
pub use transport::{MeshConfig, QuicMeshTransport, TransportError};
pub use types::*;
#[cfg(feature = "webrtc-driver")]
pub use webrtc_driver::{WebRtcBackend, WebRtcDriver};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::media::{MediaController, MediaEvent, SyntheticDeviceSource};
    pub use crate::peer_connection::{ConnectionState, DirectBackend, PeerConnectionConfig};
    pub use crate::service::{CallService, CallServiceBuilder, CallServiceConfig, ServiceError};
    pub use crate::session::{CallSession, SessionError, SessionSnapshot};
    pub use crate::signaling::{SignalingChannel, SignalingMessage, SignalingTransport};
    pub use crate::transport::LoopbackHub;
    #[cfg(feature = "quic-mesh")]
    pub use crate::transport::{MeshConfig, QuicMeshTransport};
    pub use crate::types::{
        CallEvent, CallId, CallPhase, ConversationId, HangupReason, IceCandidate,
        MediaConstraints, MediaType,
    };
    #[cfg(feature = "webrtc-driver")]
    pub use crate::webrtc_driver::WebRtcBackend;
}
