//! Signaling validation, wire format, and channel edge case tests

use chrono::Utc;
use peercall_core::{
    validate_message, ConversationId, HangupReason, IceCandidate, LoopbackHub,
    PeerIdentityString, SignalingChannel, SignalingChannelConfig, SignalingError,
    SignalingMessage, SignalingTransport, MAX_CONVERSATION_ID_LENGTH, MAX_SDP_LENGTH,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

type Message = SignalingMessage<PeerIdentityString>;

fn offer(conversation: &str, sdp: String) -> Message {
    SignalingMessage::Offer {
        conversation_id: ConversationId::new(conversation),
        from: PeerIdentityString::new("alice"),
        to: PeerIdentityString::new("bob"),
        sdp,
        timestamp: Utc::now(),
    }
}

fn all_variants() -> Vec<Message> {
    let conversation_id = ConversationId::new("conv-1");
    let from = PeerIdentityString::new("alice");
    let to = PeerIdentityString::new("bob");
    vec![
        SignalingMessage::Offer {
            conversation_id: conversation_id.clone(),
            from: from.clone(),
            to: to.clone(),
            sdp: "v=0".to_string(),
            timestamp: Utc::now(),
        },
        SignalingMessage::Ring {
            conversation_id: conversation_id.clone(),
            from: from.clone(),
            to: to.clone(),
            timestamp: Utc::now(),
        },
        SignalingMessage::Answer {
            conversation_id: conversation_id.clone(),
            from: from.clone(),
            to: to.clone(),
            sdp: "v=0".to_string(),
            timestamp: Utc::now(),
        },
        SignalingMessage::IceCandidate {
            conversation_id: conversation_id.clone(),
            from: from.clone(),
            to: to.clone(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
            timestamp: Utc::now(),
        },
        SignalingMessage::Hangup {
            conversation_id,
            from,
            to,
            reason: HangupReason::Rejected,
            timestamp: Utc::now(),
        },
    ]
}

#[test]
fn oversized_sdp_fails_validation() {
    let message = offer("conv-1", "a".repeat(MAX_SDP_LENGTH + 1));
    let result = validate_message(&message);
    assert!(
        matches!(result, Err(SignalingError::InvalidMessage(ref msg)) if msg.contains("SDP too long"))
    );
}

#[test]
fn oversized_conversation_id_fails_validation() {
    let message = offer(&"c".repeat(MAX_CONVERSATION_ID_LENGTH + 1), "v=0".to_string());
    let result = validate_message(&message);
    assert!(
        matches!(result, Err(SignalingError::InvalidMessage(ref msg)) if msg.contains("Conversation ID too long"))
    );
}

#[test]
fn oversized_candidate_fails_validation() {
    let message = SignalingMessage::IceCandidate {
        conversation_id: ConversationId::new("conv-1"),
        from: PeerIdentityString::new("alice"),
        to: PeerIdentityString::new("bob"),
        candidate: IceCandidate {
            candidate: "c".repeat(MAX_SDP_LENGTH + 1),
            sdp_mid: None,
            sdp_mline_index: None,
        },
        timestamp: Utc::now(),
    };
    let result = validate_message(&message);
    assert!(
        matches!(result, Err(SignalingError::InvalidMessage(ref msg)) if msg.contains("Candidate too long"))
    );
}

#[test]
fn boundary_sizes_pass_validation() {
    let message = offer(
        &"c".repeat(MAX_CONVERSATION_ID_LENGTH),
        "a".repeat(MAX_SDP_LENGTH),
    );
    assert!(validate_message(&message).is_ok());
}

#[test]
fn wire_tags_are_stable() {
    let tags: Vec<String> = all_variants()
        .iter()
        .map(|m| {
            serde_json::to_value(m).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(tags, ["offer", "ring", "answer", "ice-candidate", "hangup"]);

    let hangup = serde_json::to_value(all_variants().pop().unwrap()).unwrap();
    assert_eq!(hangup["reason"], "rejected");
    assert_eq!(hangup["conversation_id"], "conv-1");
}

#[test]
fn all_variants_round_trip() {
    for message in all_variants() {
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}

#[test]
fn unknown_message_type_fails_decode() {
    let json = r#"{"type":"wave","conversation_id":"conv-1","from":"alice","to":"bob","timestamp":"2026-01-01T00:00:00Z"}"#;
    let result: Result<Message, _> = serde_json::from_str(json);
    assert!(result.is_err());
}

#[tokio::test]
async fn channel_publish_rejects_invalid_messages() {
    let hub = Arc::new(LoopbackHub::<PeerIdentityString>::new());
    let channel = SignalingChannel::new(Arc::clone(&hub), PeerIdentityString::new("alice"));

    let result = channel
        .publish(offer("conv-1", "a".repeat(MAX_SDP_LENGTH + 1)))
        .await;
    assert!(matches!(result, Err(SignalingError::InvalidMessage(_))));
}

#[tokio::test]
async fn channel_open_drops_self_and_misrouted_messages() {
    let hub = Arc::new(LoopbackHub::<PeerIdentityString>::new());
    let channel = SignalingChannel::new(Arc::clone(&hub), PeerIdentityString::new("bob"));
    let conversation = ConversationId::new("conv-1");
    let mut inbox = channel.open(&conversation).await.unwrap();

    // Self-originated echo
    let own = SignalingMessage::Ring {
        conversation_id: conversation.clone(),
        from: PeerIdentityString::new("bob"),
        to: PeerIdentityString::new("alice"),
        timestamp: Utc::now(),
    };
    hub.publish(&conversation, own).await.unwrap();

    // Published to this topic but stamped for another conversation
    let misrouted = SignalingMessage::Ring {
        conversation_id: ConversationId::new("conv-2"),
        from: PeerIdentityString::new("alice"),
        to: PeerIdentityString::new("bob"),
        timestamp: Utc::now(),
    };
    hub.publish(&conversation, misrouted).await.unwrap();

    let genuine = SignalingMessage::Ring {
        conversation_id: conversation.clone(),
        from: PeerIdentityString::new("alice"),
        to: PeerIdentityString::new("bob"),
        timestamp: Utc::now(),
    };
    hub.publish(&conversation, genuine).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.sender().as_str(), "alice");
    assert_eq!(delivered.conversation_id(), &conversation);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn channel_open_times_out_when_transport_never_ready() {
    let hub = Arc::new(LoopbackHub::<PeerIdentityString>::new());
    hub.set_ready(false);

    let config = SignalingChannelConfig {
        ready_timeout: Duration::from_millis(50),
        ..SignalingChannelConfig::default()
    };
    let channel =
        SignalingChannel::with_config(Arc::clone(&hub), PeerIdentityString::new("bob"), config);

    let result = channel.open(&ConversationId::new("conv-1")).await;
    assert!(matches!(result, Err(SignalingError::NotReady(_))));
}

#[tokio::test]
async fn channel_open_proceeds_once_transport_turns_ready() {
    let hub = Arc::new(LoopbackHub::<PeerIdentityString>::new());
    hub.set_ready(false);

    let channel = SignalingChannel::new(Arc::clone(&hub), PeerIdentityString::new("bob"));
    let conversation = ConversationId::new("conv-1");

    let flipper = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            hub.set_ready(true);
        })
    };

    let inbox = channel.open(&conversation).await;
    assert!(inbox.is_ok());
    flipper.await.unwrap();
}
