//! Property tests: one live link per participant, roster and links converge

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use saorsa_mesh_core::testing::{MockConnector, RecordingSink};
use saorsa_mesh_core::{CallId, CallService, Envelope, ParticipantId, SessionDescription};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Inbound {
    Joined(u8),
    Left(u8),
    Offer(u8),
    Answer(u8),
}

fn inbound() -> impl Strategy<Value = Inbound> {
    prop_oneof![
        (0u8..4).prop_map(Inbound::Joined),
        (0u8..4).prop_map(Inbound::Left),
        (0u8..4).prop_map(Inbound::Offer),
        (0u8..4).prop_map(Inbound::Answer),
    ]
}

fn peer(n: u8) -> ParticipantId {
    ParticipantId::new(format!("peer-{}", n))
}

fn envelope(op: &Inbound) -> Envelope {
    let call = CallId::new("prop");
    let me = ParticipantId::new("me");
    match op {
        Inbound::Joined(n) => Envelope::joined(call, peer(*n)),
        Inbound::Left(n) => Envelope::left(call, peer(*n)),
        Inbound::Offer(n) => Envelope::offer(
            call,
            peer(*n),
            me,
            SessionDescription::offer(format!("offer-from-{}", n)),
        ),
        Inbound::Answer(n) => Envelope::answer(
            call,
            peer(*n),
            me,
            SessionDescription::answer(format!("answer-from-{}", n)),
        ),
    }
}

proptest! {
    #[test]
    fn prop_at_most_one_live_link_per_participant(
        seed in proptest::collection::vec(0u8..4, 0..3),
        ops in proptest::collection::vec(inbound(), 0..40),
    ) {
        tokio_test::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let service = CallService::builder("me", CallId::new("prop"), Arc::new(RecordingSink::new()))
                .with_connector(connector.clone())
                .build()
                .await
                .unwrap();

            let roster: Vec<_> = seed.iter().map(|n| peer(*n)).collect();
            service.join_meeting(roster).await.unwrap();
            for op in &ops {
                service.handle_envelope(envelope(op)).await;
            }

            let mut live: BTreeMap<ParticipantId, usize> = BTreeMap::new();
            for link in connector.links().iter().filter(|l| !l.is_closed()) {
                *live.entry(link.participant().clone()).or_default() += 1;
            }
            for (participant, count) in &live {
                prop_assert!(*count <= 1, "{} has {} live links", participant, count);
            }

            // Every participant we know about has a link and vice versa.
            let linked: BTreeSet<_> = live.keys().cloned().collect();
            let members: BTreeSet<_> = service.participants().await.into_iter().collect();
            prop_assert_eq!(linked, members);

            service.leave().await;
            prop_assert!(connector.links().iter().all(|l| l.is_closed()));
            Ok(())
        })?;
    }

    #[test]
    fn prop_envelopes_survive_json(
        from in "[a-z]{1,8}",
        to in proptest::option::of("[a-z]{1,8}"),
        sdp in ".{0,64}",
    ) {
        let mut envelope = Envelope::offer(
            CallId::new("room"),
            ParticipantId::new(from),
            ParticipantId::new("x"),
            SessionDescription::offer(sdp),
        );
        envelope.to = to.map(ParticipantId::new);
        let back = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        prop_assert_eq!(back, envelope);
    }
}
