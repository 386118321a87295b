//! End-to-end call flow tests across two services on one signaling hub
//!
//! Every message crosses the hub for real: offers, rings, answers,
//! candidates and hangups all leave one service and enter the other
//! through the conversation topic.

use chrono::Utc;
use peercall_core::{
    CallEvent, CallId, CallPhase, CallService, ConversationId, DirectBackend, DirectDriver,
    HangupReason, IceCandidate, LoopbackHub, PeerIdentityString, SignalingMessage,
    SignalingTransport, SyntheticDeviceSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

type Hub = LoopbackHub<PeerIdentityString>;
type Event = CallEvent<PeerIdentityString>;

struct Endpoint {
    service: CallService<Hub>,
    backend: Arc<DirectBackend>,
    devices: Arc<SyntheticDeviceSource>,
}

fn endpoint(name: &str, hub: &Arc<Hub>) -> Endpoint {
    let backend = Arc::new(DirectBackend::new());
    let devices = Arc::new(SyntheticDeviceSource::new());
    let service = CallService::builder(Arc::clone(hub), PeerIdentityString::new(name))
        .with_backend(Arc::clone(&backend) as _)
        .with_devices(Arc::clone(&devices) as _)
        .build();
    Endpoint {
        service,
        backend,
        devices,
    }
}

async fn wait_for_phase(mut phases: watch::Receiver<CallPhase>, want: CallPhase) {
    let result = timeout(Duration::from_secs(2), async {
        while *phases.borrow_and_update() != want {
            if phases.changed().await.is_err() {
                panic!("phase watch closed before reaching {want}");
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for phase {want}");
}

fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn first_driver(backend: &DirectBackend) -> Arc<DirectDriver> {
    backend.drivers().await.first().cloned().unwrap()
}

/// Drive a call from offer to media flowing on both sides
async fn connect_call(
    caller: &Endpoint,
    callee: &Endpoint,
    conversation: &ConversationId,
) -> CallId {
    callee
        .service
        .watch_conversation(conversation)
        .await
        .unwrap();
    let call_id = caller
        .service
        .start_call(conversation, callee.service.local().clone(), None)
        .await
        .unwrap();

    wait_for_phase(
        callee.service.phase_watch(conversation).await.unwrap(),
        CallPhase::Incoming,
    )
    .await;
    callee.service.accept_call(conversation).await.unwrap();

    wait_for_phase(
        caller.service.phase_watch(conversation).await.unwrap(),
        CallPhase::InCall,
    )
    .await;
    wait_for_phase(
        callee.service.phase_watch(conversation).await.unwrap(),
        CallPhase::InCall,
    )
    .await;
    call_id
}

fn offer(
    conversation: &ConversationId,
    from: &str,
    to: &str,
) -> SignalingMessage<PeerIdentityString> {
    SignalingMessage::Offer {
        conversation_id: conversation.clone(),
        from: PeerIdentityString::new(from),
        to: PeerIdentityString::new(to),
        sdp: "v=0\r\nm=audio 9 UDP/QUIC 0\r\n".to_string(),
        timestamp: Utc::now(),
    }
}

fn candidate_message(
    conversation: &ConversationId,
    from: &str,
    to: &str,
    n: u16,
) -> SignalingMessage<PeerIdentityString> {
    SignalingMessage::IceCandidate {
        conversation_id: conversation.clone(),
        from: PeerIdentityString::new(from),
        to: PeerIdentityString::new(to),
        candidate: IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 9 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        },
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn call_connects_end_to_end() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    bob.service
        .watch_conversation(&conversation)
        .await
        .unwrap();
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .start_call(&conversation, PeerIdentityString::new("bob"), None)
        .await
        .unwrap();
    assert_eq!(
        alice.service.phase(&conversation).await,
        Some(CallPhase::Ringing)
    );

    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Incoming,
    )
    .await;
    bob.service.accept_call(&conversation).await.unwrap();

    wait_for_phase(
        alice.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::InCall,
    )
    .await;
    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::InCall,
    )
    .await;

    let alice_snapshot = alice.service.snapshot(&conversation).await.unwrap();
    assert_eq!(alice_snapshot.call_id, Some(call_id));
    assert_eq!(alice_snapshot.peer.unwrap().as_str(), "bob");
    assert!(alice_snapshot.connected_for.is_some());

    let bob_snapshot = bob.service.snapshot(&conversation).await.unwrap();
    assert_eq!(bob_snapshot.peer.unwrap().as_str(), "alice");
    assert!(bob_snapshot.call_id.is_some());

    let events = drain_events(&mut bob_events);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::IncomingCall { from, .. } if from.as_str() == "alice")));
}

#[tokio::test]
async fn callee_reject_clears_both_sides() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    bob.service
        .watch_conversation(&conversation)
        .await
        .unwrap();
    let mut alice_events = alice.service.subscribe_events();

    alice
        .service
        .start_call(&conversation, PeerIdentityString::new("bob"), None)
        .await
        .unwrap();
    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Incoming,
    )
    .await;

    bob.service.reject_call(&conversation).await.unwrap();
    assert_eq!(
        bob.service.phase(&conversation).await,
        Some(CallPhase::Idle)
    );
    // Rejecting never touches the callee's capture devices
    assert_eq!(bob.devices.open_count(), 0);

    wait_for_phase(
        alice.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Idle,
    )
    .await;
    let events = drain_events(&mut alice_events);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RemoteHangup {
            reason: HangupReason::Rejected,
            ..
        }
    )));
}

#[tokio::test]
async fn caller_cancels_before_answer() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    bob.service
        .watch_conversation(&conversation)
        .await
        .unwrap();
    let mut bob_events = bob.service.subscribe_events();

    alice
        .service
        .start_call(&conversation, PeerIdentityString::new("bob"), None)
        .await
        .unwrap();
    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Incoming,
    )
    .await;

    alice.service.hang_up(&conversation).await.unwrap();
    assert_eq!(
        alice.service.phase(&conversation).await,
        Some(CallPhase::Idle)
    );

    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Idle,
    )
    .await;
    let events = drain_events(&mut bob_events);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RemoteHangup {
            reason: HangupReason::Hangup,
            ..
        }
    )));
}

#[tokio::test]
async fn remote_hangup_ends_an_established_call() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    let mut alice_events = alice.service.subscribe_events();
    connect_call(&alice, &bob, &conversation).await;

    bob.service.hang_up(&conversation).await.unwrap();

    wait_for_phase(
        alice.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Idle,
    )
    .await;
    let events = drain_events(&mut alice_events);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RemoteHangup {
            reason: HangupReason::Left,
            ..
        }
    )));

    // Each side closed its own negotiation driver exactly once
    assert_eq!(first_driver(&alice.backend).await.close_calls(), 1);
    assert_eq!(first_driver(&bob.backend).await.close_calls(), 1);
}

#[tokio::test]
async fn second_call_reconnects_after_hangup() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    connect_call(&alice, &bob, &conversation).await;
    alice.service.hang_up(&conversation).await.unwrap();
    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Idle,
    )
    .await;

    // Roles swap: the former callee calls back on the same conversation
    bob.service
        .start_call(&conversation, PeerIdentityString::new("alice"), None)
        .await
        .unwrap();
    wait_for_phase(
        alice.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Incoming,
    )
    .await;
    alice.service.accept_call(&conversation).await.unwrap();

    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::InCall,
    )
    .await;
    wait_for_phase(
        alice.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::InCall,
    )
    .await;

    assert_eq!(alice.backend.drivers().await.len(), 2);
    assert_eq!(bob.backend.drivers().await.len(), 2);
}

#[tokio::test]
async fn busy_callee_ignores_a_third_offer() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let carol = endpoint("carol", &hub);
    let conversation = ConversationId::new("group-topic");

    connect_call(&alice, &bob, &conversation).await;
    let mut bob_events = bob.service.subscribe_events();

    carol
        .service
        .start_call(&conversation, PeerIdentityString::new("bob"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        bob.service.phase(&conversation).await,
        Some(CallPhase::InCall)
    );
    let snapshot = bob.service.snapshot(&conversation).await.unwrap();
    assert_eq!(snapshot.peer.unwrap().as_str(), "alice");

    let events = drain_events(&mut bob_events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::IncomingCall { .. })));
}

// ============================================================================
// Loss-tolerance: duplicated and reordered delivery
// ============================================================================

#[tokio::test]
async fn duplicate_offers_surface_one_incoming_call() {
    let hub = Arc::new(Hub::new());
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    bob.service
        .watch_conversation(&conversation)
        .await
        .unwrap();
    let mut bob_events = bob.service.subscribe_events();

    // At-least-once delivery: the same offer lands three times
    for _ in 0..3 {
        hub.publish(&conversation, offer(&conversation, "alice", "bob"))
            .await
            .unwrap();
    }

    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Incoming,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let incoming = drain_events(&mut bob_events)
        .iter()
        .filter(|e| matches!(e, Event::IncomingCall { .. }))
        .count();
    assert_eq!(incoming, 1);
    assert_eq!(
        bob.service.phase(&conversation).await,
        Some(CallPhase::Incoming)
    );
}

#[tokio::test]
async fn candidate_arriving_before_accept_reaches_the_driver() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    bob.service
        .watch_conversation(&conversation)
        .await
        .unwrap();
    alice
        .service
        .start_call(&conversation, PeerIdentityString::new("bob"), None)
        .await
        .unwrap();
    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::Incoming,
    )
    .await;

    // Arrives while the callee has no connection yet; must be buffered
    hub.publish(&conversation, candidate_message(&conversation, "alice", "bob", 7))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    bob.service.accept_call(&conversation).await.unwrap();
    wait_for_phase(
        bob.service.phase_watch(&conversation).await.unwrap(),
        CallPhase::InCall,
    )
    .await;

    let applied = first_driver(&bob.backend).await.applied_candidates().await;
    assert!(applied.iter().any(|c| c.candidate.contains("10.0.0.7")));
}

#[tokio::test]
async fn callee_candidates_reach_the_caller_driver() {
    let hub = Arc::new(Hub::new());
    let alice = endpoint("alice", &hub);
    let bob = endpoint("bob", &hub);
    let conversation = ConversationId::new("alice+bob");

    connect_call(&alice, &bob, &conversation).await;

    // The callee gathers one host candidate when its answer commits
    let driver = first_driver(&alice.backend).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let applied = driver.applied_candidates().await;
        if applied.iter().any(|c| c.candidate.contains("127.0.0.1")) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "caller never received the callee's candidate"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
