//! Call types and data structures

use crate::identity::PeerIdentity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a single call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the conversation a call belongs to.
///
/// Doubles as the pub/sub topic name on the signaling transport, so both
/// participants of a conversation always see each other's messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Create a conversation ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw topic string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
    /// Enable screen sharing
    pub screen_share: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            screen_share: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            screen_share: false,
        }
    }

    /// Screen share with audio
    pub fn screen_share() -> Self {
        Self {
            audio: true,
            video: false,
            screen_share: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video || self.screen_share
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Types of media tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    /// Audio track
    Audio,
    /// Video track
    Video,
    /// Screen share track
    ScreenShare,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::ScreenShare => write!(f, "screen-share"),
        }
    }
}

/// Phase of a call as seen by the local participant.
///
/// `Idle` means no call is active for the conversation. `Incoming` is the
/// callee-side counterpart of `Ringing`: an offer has arrived and the user
/// has not yet accepted or rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallPhase {
    /// No active call
    Idle,
    /// Local negotiation in progress
    Connecting,
    /// Offer published, waiting for the remote answer
    Ringing,
    /// Remote offer received, waiting for local accept or reject
    Incoming,
    /// Media is flowing
    InCall,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ringing => write!(f, "ringing"),
            Self::Incoming => write!(f, "incoming"),
            Self::InCall => write!(f, "in-call"),
        }
    }
}

/// Why a call ended, carried in hangup messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HangupReason {
    /// Callee declined the incoming call
    Rejected,
    /// Participant left an established call
    Left,
    /// Caller cancelled before the call was established
    Hangup,
}

impl std::fmt::Display for HangupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected"),
            Self::Left => write!(f, "left"),
            Self::Hangup => write!(f, "hangup"),
        }
    }
}

/// A connectivity candidate exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media line identifier
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

/// Events emitted while calls progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub enum CallEvent<I: PeerIdentity> {
    /// A remote offer arrived and the session is waiting for accept/reject
    IncomingCall {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Calling peer
        from: I,
    },
    /// A local offer was published
    OutgoingCall {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Called peer
        to: I,
    },
    /// The remote side signalled that its device is ringing
    RingReceived {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Ringing peer
        from: I,
    },
    /// The call moved to a new phase
    PhaseChanged {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// New phase
        phase: CallPhase,
    },
    /// A remote media track became available
    RemoteTrackAdded {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Kind of track the remote side attached
        media_type: MediaType,
    },
    /// The remote side ended the call
    RemoteHangup {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Reason carried in the hangup message
        reason: HangupReason,
    },
    /// The call reached its terminal state and all resources were released
    CallEnded {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
    },
    /// Negotiation or transport failed and the call was torn down
    ConnectionFailed {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Failure description
        error: String,
    },
    /// Degraded media connectivity, the call continues
    MediaWarning {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Warning description
        detail: String,
    },
    /// Local microphone mute state changed
    MuteChanged {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// New mute state
        muted: bool,
    },
    /// Local camera switched to a different device
    CameraSwitched {
        /// Conversation the call belongs to
        conversation_id: ConversationId,
        /// Device now capturing
        device_id: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique() {
        let a = CallId::new();
        let b = CallId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn conversation_id_round_trips_through_strings() {
        let id = ConversationId::new("conv-42");
        assert_eq!(id.as_str(), "conv-42");
        assert_eq!(id.to_string(), "conv-42");
        assert_eq!(ConversationId::from("conv-42"), id);
    }

    #[test]
    fn audio_only_constraints() {
        let constraints = MediaConstraints::audio_only();
        assert!(constraints.has_audio());
        assert!(!constraints.has_video());
    }

    #[test]
    fn video_call_constraints() {
        let constraints = MediaConstraints::video_call();
        assert!(constraints.has_audio());
        assert!(constraints.has_video());
    }

    #[test]
    fn screen_share_counts_as_video() {
        let constraints = MediaConstraints::screen_share();
        assert!(constraints.has_video());
        assert!(!constraints.video);
    }

    #[test]
    fn hangup_reason_uses_lowercase_wire_names() {
        let json = serde_json::to_string(&HangupReason::Rejected).unwrap();
        assert_eq!(json, "\"rejected\"");
        let json = serde_json::to_string(&HangupReason::Left).unwrap();
        assert_eq!(json, "\"left\"");
    }

    #[test]
    fn call_phase_display_names() {
        assert_eq!(CallPhase::InCall.to_string(), "in-call");
        assert_eq!(CallPhase::Idle.to_string(), "idle");
    }
}
