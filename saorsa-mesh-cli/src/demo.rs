//! Loopback mesh demo
//!
//! Builds several participants in one process, connects them through a
//! [`LocalRelay`] with the real WebRTC connector, and walks through the call
//! lifecycle: join one after another, mute, screen share, leave.

use anyhow::Result;
use bytes::Bytes;
use saorsa_mesh_core::prelude::*;
use saorsa_mesh_core::Sample;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Opus frame carrying 20 ms of silence
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const FRAME: Duration = Duration::from_millis(20);
const JOIN_SETTLE: Duration = Duration::from_millis(500);

/// Demo parameters
pub struct DemoOptions {
    pub identity: String,
    pub participants: usize,
    pub video: bool,
    pub audio: bool,
    pub duration: Duration,
    pub config: MeshConfig,
}

struct Participant {
    service: CallService,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Participant {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Participant ids for the demo; the first one is `identity`
fn participant_ids(identity: &str, count: usize) -> Vec<ParticipantId> {
    std::iter::once(ParticipantId::new(identity))
        .chain((1..count).map(|i| ParticipantId::new(format!("{}-{}", identity, i))))
        .collect()
}

fn describe(id: &ParticipantId, event: &CallEvent) -> String {
    match event {
        CallEvent::RemoteStream {
            participant,
            stream,
        } => format!(
            "🎥 {}: media from {} (audio: {}, video: {})",
            id,
            participant,
            stream.has_audio(),
            stream.has_video()
        ),
        CallEvent::ParticipantJoined { participant } => format!("👋 {}: {} joined", id, participant),
        CallEvent::ParticipantLeft { participant } => format!("🚪 {}: {} left", id, participant),
        CallEvent::ConnectionStateChanged { participant, state } => {
            format!("🔌 {}: link to {} is {}", id, participant, state)
        }
        CallEvent::Error { participant, error } => match participant {
            Some(p) => format!("⚠️  {}: error with {}: {}", id, p, error),
            None => format!("⚠️  {}: {}", id, error),
        },
    }
}

fn spawn_event_printer(service: &CallService) -> JoinHandle<()> {
    let mut events = service.subscribe_events();
    let id = service.self_id().clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", describe(&id, &event)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(participant = %id, skipped = n, "Event printer lagged");
                }
                Err(_) => break,
            }
        }
    })
}

/// Feed silence into the current microphone track until aborted
fn spawn_audio_pump(service: &CallService) -> JoinHandle<()> {
    let service = service.downgrade();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME);
        loop {
            ticker.tick().await;
            let Some(service) = service.upgrade() else {
                break;
            };
            let Some(track) = service.local_tracks().await.audio else {
                continue;
            };
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: FRAME,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!("Failed to write audio sample: {}", e);
            }
        }
    })
}

/// Run the demo
pub async fn run(options: DemoOptions) -> Result<()> {
    let relay = LocalRelay::new();
    let call_id = CallId::generate();
    let ids = participant_ids(&options.identity, options.participants);
    println!("📞 Call {} with {} participants", call_id, ids.len());

    let mut participants = Vec::with_capacity(ids.len());
    for id in &ids {
        let service = CallService::builder(id.clone(), call_id.clone(), relay.clone())
            .with_config(options.config.clone())
            .build()
            .await?;
        relay.register(&service);

        if options.video || options.audio {
            let state = service.initialize(options.video, options.audio).await?;
            println!(
                "🎙️  {}: capturing (muted: {}, video: {})",
                id, state.muted, state.video_enabled
            );
        }

        let tasks = vec![spawn_event_printer(&service), spawn_audio_pump(&service)];
        participants.push(Participant { service, tasks });
    }

    // Each newcomer knows everybody who joined before it.
    for (i, participant) in participants.iter().enumerate() {
        let roster = ids[..i].to_vec();
        participant.service.join_meeting(roster).await?;
        println!("✅ {} joined", ids[i]);
        tokio::time::sleep(JOIN_SETTLE).await;
    }

    let Some(host) = participants.first() else {
        return Ok(());
    };

    if options.audio {
        let muted = host.service.toggle_mute().await;
        println!("🔇 {} muted: {}", host.service.self_id(), muted);
        let muted = host.service.toggle_mute().await;
        println!("🔈 {} muted: {}", host.service.self_id(), muted);
    }

    match host.service.start_screen_share().await {
        Ok(()) => println!("🖥️  {} is sharing the screen", host.service.self_id()),
        Err(e) => println!("⚠️  Screen share failed: {}", e),
    }

    tokio::time::sleep(options.duration).await;

    if host.service.stop_screen_share().await {
        println!("🖥️  {} stopped sharing", host.service.self_id());
    }

    println!();
    println!("📊 Mesh summary");
    for participant in &participants {
        let connected = participant.service.connected_participants().await;
        println!(
            "   {}: {} of {} peers connected",
            participant.service.self_id(),
            connected.len(),
            ids.len() - 1
        );
    }

    for participant in participants.iter().rev() {
        participant.service.leave().await;
        relay.unregister(participant.service.self_id());
    }
    println!("📞 Call ended");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_ids_are_unique_and_start_with_identity() {
        let ids = participant_ids("alpha-bravo-charlie-delta", 3);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].as_str(), "alpha-bravo-charlie-delta");
        assert_eq!(ids[2].as_str(), "alpha-bravo-charlie-delta-2");
        let unique: std::collections::BTreeSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_describe_events() {
        let me = ParticipantId::new("alice");
        let text = describe(
            &me,
            &CallEvent::ConnectionStateChanged {
                participant: ParticipantId::new("bob"),
                state: ConnectionState::Connected,
            },
        );
        assert_eq!(text, "🔌 alice: link to bob is connected");
    }
}
