//! Two participants over real WebRTC peer connections in one process
//!
//! Host candidates only, no STUN. The media path test is ignored by default
//! because sandboxed CI hosts often have no usable interface.

use saorsa_mesh_core::prelude::*;
use saorsa_mesh_core::testing::RecordingSink;
use saorsa_mesh_core::ParticipantId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn host_only() -> MeshConfig {
    MeshConfig {
        ice_servers: vec![],
        ..MeshConfig::default()
    }
}

async fn participant(relay: &Arc<LocalRelay>, id: &str) -> CallService {
    let service = CallService::builder(id, CallId::new("loopback"), relay.clone())
        .with_config(host_only())
        .build()
        .await
        .expect("Failed to build service");
    relay.register(&service);
    service
        .initialize(false, true)
        .await
        .expect("Failed to capture audio");
    service
}

fn errors(events: &mut broadcast::Receiver<CallEvent>) -> Vec<String> {
    let mut found = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CallEvent::Error { error, .. } = event {
            found.push(error.to_string());
        }
    }
    found
}

#[tokio::test]
async fn test_real_links_negotiate_without_errors() {
    let relay = LocalRelay::new();
    let alice = participant(&relay, "alice").await;
    let bob = participant(&relay, "bob").await;
    let mut alice_events = alice.subscribe_events();
    let mut bob_events = bob.subscribe_events();

    alice.join_meeting(vec![]).await.expect("alice join");
    bob.join_meeting(vec![ParticipantId::new("alice")])
        .await
        .expect("bob join");

    let bob_id = ParticipantId::new("bob");
    let mut retries = 0;
    loop {
        let state = alice.connection_state(&bob_id).await;
        if matches!(
            state,
            Some(ConnectionState::Connecting | ConnectionState::Connected)
        ) {
            break;
        }
        retries += 1;
        assert!(retries < 100, "alice never started connecting: {:?}", state);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(errors(&mut alice_events).is_empty());
    assert!(errors(&mut bob_events).is_empty());
    assert_eq!(alice.participants().await, vec![bob_id]);

    bob.leave().await;
    alice.leave().await;
}

async fn unrelayed(id: &str) -> (CallService, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let service = CallService::builder(id, CallId::new("loopback"), sink.clone())
        .with_config(host_only())
        .build()
        .await
        .expect("Failed to build service");
    service
        .initialize(false, true)
        .await
        .expect("Failed to capture audio");
    (service, sink)
}

fn take(sink: &RecordingSink, kind: EnvelopeKind) -> Envelope {
    sink.take()
        .into_iter()
        .find(|e| e.kind == kind)
        .expect("expected envelope was not sent")
}

#[tokio::test]
async fn test_crossed_offers_on_real_links_are_answered() {
    let alice_id = ParticipantId::new("alice");
    let bob_id = ParticipantId::new("bob");
    let (alice, alice_sink) = unrelayed("alice").await;
    let (bob, bob_sink) = unrelayed("bob").await;
    let mut alice_events = alice.subscribe_events();
    let mut bob_events = bob.subscribe_events();

    alice.join_meeting(vec![bob_id.clone()]).await.expect("alice join");
    bob.join_meeting(vec![alice_id.clone()]).await.expect("bob join");
    let alice_offer = take(&alice_sink, EnvelopeKind::Offer);
    let bob_offer = take(&bob_sink, EnvelopeKind::Offer);

    // Both offers are pending when the other side's arrives.
    alice.handle_envelope(bob_offer).await;
    bob.handle_envelope(alice_offer).await;
    let alice_answer = take(&alice_sink, EnvelopeKind::Answer);
    let bob_answer = take(&bob_sink, EnvelopeKind::Answer);
    assert!(errors(&mut alice_events).is_empty());
    assert!(errors(&mut bob_events).is_empty());

    alice.handle_envelope(bob_answer).await;
    bob.handle_envelope(alice_answer).await;
    let fresh = take(&alice_sink, EnvelopeKind::Offer);
    bob.handle_envelope(fresh).await;
    let answer = take(&bob_sink, EnvelopeKind::Answer);
    alice.handle_envelope(answer).await;

    assert!(errors(&mut alice_events).is_empty());
    assert!(errors(&mut bob_events).is_empty());
    assert_eq!(alice.participants().await, vec![bob_id]);
    assert_eq!(bob.participants().await, vec![alice_id]);

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
#[ignore] // Needs a routable host interface
async fn test_real_links_reach_connected() {
    let relay = LocalRelay::new();
    let alice = participant(&relay, "alice").await;
    let bob = participant(&relay, "bob").await;

    alice.join_meeting(vec![]).await.expect("alice join");
    bob.join_meeting(vec![ParticipantId::new("alice")])
        .await
        .expect("bob join");

    let mut retries = 0;
    while retries < 100 {
        if alice.connected_participants().await.len() == 1
            && bob.connected_participants().await.len() == 1
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        retries += 1;
    }
    assert_eq!(
        bob.connection_state(&ParticipantId::new("alice")).await,
        Some(ConnectionState::Connected)
    );

    alice.leave().await;
    bob.leave().await;
}
