//! Call session orchestration
//!
//! [`CallService`] is the only type the embedding application needs. It owns
//! the negotiation engine (and through it the peer registry) and the local
//! media controller behind a single async mutex, so application calls,
//! inbound envelopes and platform events are applied one at a time.
//!
//! Platform callbacks are queued and drained by a driver task spawned in
//! [`CallServiceBuilder::build`]. The task only holds a weak reference and is
//! aborted when the last service handle is dropped.

use crate::connection::{PeerConnector, PlatformEvent, RtcConnector};
use crate::identity::ParticipantId;
use crate::media::{CaptureDevices, LocalMedia, MediaError, OutgoingTracks, SampleCapture};
use crate::negotiation::{NegotiationEngine, NegotiationError};
use crate::registry::PeerRegistry;
use crate::signaling::{Envelope, EnvelopeSender, SignalingError, SignalingSink};
use crate::types::{
    CallEvent, CallId, ConnectionState, GlarePolicy, IceServer, LocalMediaState, RemoteStream,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Call errors
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// Signaling failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Capture failure
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Negotiation failure
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Service could not be built
    #[error("Initialization error: {0}")]
    InitError(String),

    /// `join_meeting` called twice without `leave`
    #[error("Already joined call")]
    AlreadyJoined,
}

/// Mesh configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Traversal servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
    /// Offer collision handling
    pub glare_policy: GlarePolicy,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            glare_policy: GlarePolicy::default(),
            event_capacity: 256,
        }
    }
}

struct SessionState {
    joined: bool,
    engine: NegotiationEngine,
    media: LocalMedia,
}

struct Inner {
    self_id: ParticipantId,
    call_id: CallId,
    state: Mutex<SessionState>,
    events: broadcast::Sender<CallEvent>,
    driver: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

/// Multi-party mesh call session
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct CallService {
    inner: Arc<Inner>,
}

impl CallService {
    /// Create a builder
    #[must_use]
    pub fn builder(
        self_id: impl Into<ParticipantId>,
        call_id: CallId,
        sink: Arc<dyn SignalingSink>,
    ) -> CallServiceBuilder {
        CallServiceBuilder::new(self_id, call_id, sink)
    }

    /// Non-owning handle, for holders the service itself references
    #[must_use]
    pub fn downgrade(&self) -> WeakCallService {
        WeakCallService(Arc::downgrade(&self.inner))
    }

    /// Our participant id
    pub fn self_id(&self) -> &ParticipantId {
        &self.inner.self_id
    }

    /// Call this session belongs to
    pub fn call_id(&self) -> &CallId {
        &self.inner.call_id
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Acquire camera and/or microphone and attach them to every live peer
    ///
    /// # Errors
    ///
    /// Returns error if capture acquisition fails; the previous capture is
    /// kept and an error event is emitted as well.
    #[tracing::instrument(skip(self), fields(me = %self.inner.self_id))]
    pub async fn initialize(&self, video: bool, audio: bool) -> Result<LocalMediaState, CallError> {
        let mut guard = self.inner.state.lock().await;
        let SessionState { engine, media, .. } = &mut *guard;

        let update = match media.initialize(video, audio, engine.registry_mut()).await {
            Ok(update) => update,
            Err(e) => return Err(self.capture_failed(e)),
        };
        engine.apply_track_update(update, &media.outgoing()).await;
        Ok(media.state())
    }

    /// Join the call: offer to every participant in `roster` and announce
    /// ourselves to the room
    ///
    /// # Errors
    ///
    /// Returns error if already joined
    #[tracing::instrument(skip(self, roster), fields(me = %self.inner.self_id, call_id = %self.inner.call_id))]
    pub async fn join_meeting(&self, roster: Vec<ParticipantId>) -> Result<(), CallError> {
        let mut guard = self.inner.state.lock().await;
        if guard.joined {
            return Err(CallError::AlreadyJoined);
        }
        guard.joined = true;

        let SessionState { engine, media, .. } = &mut *guard;
        engine.join(roster, &media.outgoing()).await;
        tracing::info!("Joined call");
        Ok(())
    }

    /// Feed one envelope delivered by the relay
    ///
    /// Envelopes arriving before `join_meeting` or after `leave` are ignored.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        let mut guard = self.inner.state.lock().await;
        if !guard.joined {
            tracing::debug!(kind = %envelope.kind, from = %envelope.from, "Not in call, ignoring envelope");
            return;
        }
        let SessionState { engine, media, .. } = &mut *guard;
        engine.handle_envelope(envelope, &media.outgoing()).await;
    }

    /// Flip the microphone; returns true if now muted
    pub async fn toggle_mute(&self) -> bool {
        self.inner.state.lock().await.media.toggle_mute()
    }

    /// Flip the camera; returns true if video is now enabled
    pub async fn toggle_video(&self) -> bool {
        self.inner.state.lock().await.media.toggle_video()
    }

    /// Share the screen in place of the camera on every peer
    ///
    /// # Errors
    ///
    /// Returns error if screen capture acquisition fails
    #[tracing::instrument(skip(self), fields(me = %self.inner.self_id))]
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let mut guard = self.inner.state.lock().await;
        let SessionState { engine, media, .. } = &mut *guard;

        let update = match media.start_screen_share(engine.registry_mut()).await {
            Ok(update) => update,
            Err(e) => return Err(self.capture_failed(e)),
        };
        engine.apply_track_update(update, &media.outgoing()).await;
        Ok(())
    }

    /// Stop sharing and restore the camera; returns false if not sharing
    #[tracing::instrument(skip(self), fields(me = %self.inner.self_id))]
    pub async fn stop_screen_share(&self) -> bool {
        let mut guard = self.inner.state.lock().await;
        let SessionState { engine, media, .. } = &mut *guard;
        match media.stop_screen_share(engine.registry_mut()).await {
            Some(update) => {
                engine.apply_track_update(update, &media.outgoing()).await;
                true
            }
            None => false,
        }
    }

    /// Leave the call
    ///
    /// Broadcasts LEFT (if joined), closes every peer connection, stops all
    /// capture and resets the session. Safe to call at any time, any number
    /// of times.
    #[tracing::instrument(skip(self), fields(me = %self.inner.self_id, call_id = %self.inner.call_id))]
    pub async fn leave(&self) {
        let mut guard = self.inner.state.lock().await;
        let SessionState {
            joined,
            engine,
            media,
        } = &mut *guard;

        if *joined {
            engine.leave().await;
        } else {
            engine.registry_mut().close_all().await;
        }
        media.stop_all();
        *joined = false;
        tracing::info!("Left call");
    }

    /// Whether `join_meeting` has been called since the last `leave`
    pub async fn is_joined(&self) -> bool {
        self.inner.state.lock().await.joined
    }

    /// Participants believed to be in the call
    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.inner
            .state
            .lock()
            .await
            .engine
            .roster()
            .iter()
            .cloned()
            .collect()
    }

    /// Participants whose connection is currently up
    pub async fn connected_participants(&self) -> Vec<ParticipantId> {
        let guard = self.inner.state.lock().await;
        let registry = guard.engine.registry();
        registry
            .participants()
            .into_iter()
            .filter(|p| {
                registry
                    .get(p)
                    .is_some_and(|e| e.link.connection_state() == ConnectionState::Connected)
            })
            .collect()
    }

    /// Connection state of the link to `participant`
    pub async fn connection_state(&self, participant: &ParticipantId) -> Option<ConnectionState> {
        let guard = self.inner.state.lock().await;
        guard
            .engine
            .registry()
            .get(participant)
            .map(|e| e.link.connection_state())
    }

    /// Media received from `participant` so far
    pub async fn remote_stream(&self, participant: &ParticipantId) -> Option<RemoteStream> {
        let guard = self.inner.state.lock().await;
        guard
            .engine
            .registry()
            .get(participant)
            .and_then(|e| e.remote_stream().cloned())
    }

    /// Local capture flags
    pub async fn local_media_state(&self) -> LocalMediaState {
        self.inner.state.lock().await.media.state()
    }

    /// Tracks currently feeding outgoing senders
    ///
    /// Write encoded samples to these with
    /// [`LocalTrack::write_sample`](crate::media::LocalTrack::write_sample).
    pub async fn local_tracks(&self) -> OutgoingTracks {
        self.inner.state.lock().await.media.outgoing()
    }

    fn capture_failed(&self, error: MediaError) -> CallError {
        let error = CallError::Media(error);
        let _ = self.inner.events.send(CallEvent::Error {
            participant: None,
            error: error.clone(),
        });
        error
    }

    async fn handle_platform(&self, event: PlatformEvent) {
        let mut guard = self.inner.state.lock().await;
        let SessionState { engine, media, .. } = &mut *guard;
        match event {
            PlatformEvent::LocalCandidate {
                participant,
                link_id,
                candidate,
            } => engine.on_local_candidate(&participant, link_id, candidate).await,
            PlatformEvent::StateChanged {
                participant,
                link_id,
                state,
            } => engine.on_state_change(&participant, link_id, state).await,
            PlatformEvent::RemoteTrack {
                participant,
                link_id,
                track,
            } => engine.on_remote_track(&participant, link_id, track),
            PlatformEvent::ScreenShareEnded { track_id } => {
                if !media.is_current_screen(&track_id) {
                    return;
                }
                tracing::info!(track_id = %track_id, "Screen share ended by platform, falling back");
                if let Some(update) = media.stop_screen_share(engine.registry_mut()).await {
                    engine.apply_track_update(update, &media.outgoing()).await;
                }
            }
        }
    }
}

/// Weak reference to a [`CallService`]
#[derive(Clone)]
pub struct WeakCallService(Weak<Inner>);

impl WeakCallService {
    /// The service, if it is still alive
    pub fn upgrade(&self) -> Option<CallService> {
        self.0.upgrade().map(|inner| CallService { inner })
    }
}

/// Call service builder
pub struct CallServiceBuilder {
    self_id: ParticipantId,
    call_id: CallId,
    sink: Arc<dyn SignalingSink>,
    config: MeshConfig,
    connector: Option<Arc<dyn PeerConnector>>,
    capture: Option<Arc<dyn CaptureDevices>>,
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(
        self_id: impl Into<ParticipantId>,
        call_id: CallId,
        sink: Arc<dyn SignalingSink>,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            call_id,
            sink,
            config: MeshConfig::default(),
            connector: None,
            capture: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom peer connector instead of [`RtcConnector`]
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use custom capture devices instead of [`SampleCapture`]
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn CaptureDevices>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Build the service and start its event driver
    ///
    /// # Errors
    ///
    /// Returns error if the participant id is empty or the WebRTC API cannot
    /// be created
    pub async fn build(self) -> Result<CallService, CallError> {
        if self.self_id.is_empty() {
            return Err(CallError::InitError(
                "Participant id cannot be empty".to_string(),
            ));
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(RtcConnector::new()?),
        };
        let capture = self
            .capture
            .unwrap_or_else(|| Arc::new(SampleCapture::default()));

        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));

        let registry = PeerRegistry::new(connector, self.config.ice_servers, platform_tx.clone());
        let engine = NegotiationEngine::new(
            self.self_id.clone(),
            self.call_id.clone(),
            self.config.glare_policy,
            registry,
            EnvelopeSender::new(self.sink),
            events.clone(),
        );
        let media = LocalMedia::new(capture, platform_tx);

        let inner = Arc::new(Inner {
            self_id: self.self_id,
            call_id: self.call_id,
            state: Mutex::new(SessionState {
                joined: false,
                engine,
                media,
            }),
            events,
            driver: parking_lot::Mutex::new(None),
        });

        let handle = tokio::spawn(drive(WeakCallService(Arc::downgrade(&inner)), platform_rx));
        *inner.driver.lock() = Some(handle);

        tracing::debug!(me = %inner.self_id, call_id = %inner.call_id, "Call service built");
        Ok(CallService { inner })
    }
}

async fn drive(service: WeakCallService, mut rx: mpsc::UnboundedReceiver<PlatformEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        service.handle_platform(event).await;
    }
    tracing::trace!("Platform event driver stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::EnvelopeKind;
    use crate::testing::{MockCapture, MockConnector, RecordingSink};
    use crate::types::TrackSource;
    use std::time::Duration;

    struct Fixture {
        service: CallService,
        connector: Arc<MockConnector>,
        capture: Arc<MockCapture>,
        sink: Arc<RecordingSink>,
    }

    async fn fixture(me: &str) -> Fixture {
        let connector = Arc::new(MockConnector::new());
        let capture = Arc::new(MockCapture::new());
        let sink = Arc::new(RecordingSink::new());
        let service = CallService::builder(me, CallId::new("room"), sink.clone())
            .with_connector(connector.clone())
            .with_capture(capture.clone())
            .build()
            .await
            .unwrap();
        Fixture {
            service,
            connector,
            capture,
            sink,
        }
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<CallEvent>, f: F) -> CallEvent
    where
        F: Fn(&CallEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let ev = rx.recv().await.unwrap();
                if f(&ev) {
                    return ev;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_builder_rejects_empty_id() {
        let res = CallService::builder("", CallId::new("room"), Arc::new(RecordingSink::new()))
            .with_connector(Arc::new(MockConnector::new()))
            .build()
            .await;
        assert!(matches!(res, Err(CallError::InitError(_))));
    }

    #[test]
    fn test_mesh_config_defaults_and_partial_json() {
        let config = MeshConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.event_capacity, 256);

        let parsed: MeshConfig = serde_json::from_str(r#"{"glare_policy":"lower_id_wins"}"#).unwrap();
        assert_eq!(parsed.glare_policy, GlarePolicy::LowerIdWins);
        assert_eq!(parsed.ice_servers, config.ice_servers);
    }

    #[tokio::test]
    async fn test_join_twice_is_rejected() {
        let f = fixture("alice").await;
        f.service.join_meeting(vec![]).await.unwrap();
        assert!(matches!(
            f.service.join_meeting(vec![]).await,
            Err(CallError::AlreadyJoined)
        ));
    }

    #[tokio::test]
    async fn test_envelopes_before_join_are_ignored() {
        let f = fixture("alice").await;
        f.service
            .handle_envelope(Envelope::joined(CallId::new("room"), ParticipantId::new("bob")))
            .await;
        assert!(f.sink.sent().is_empty());
        assert!(f.service.participants().await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_while_connecting() {
        let f = fixture("alice").await;
        f.service.initialize(true, true).await.unwrap();
        f.service
            .join_meeting(vec![ParticipantId::new("carol")])
            .await
            .unwrap();
        let carol = ParticipantId::new("carol");
        assert_eq!(
            f.service.connection_state(&carol).await,
            Some(ConnectionState::Connecting)
        );
        f.sink.take();

        f.service.leave().await;

        let sent = f.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::Left);
        assert!(sent[0].is_broadcast());
        assert!(f.connector.link(&carol).unwrap().is_closed());
        assert!(f.service.connection_state(&carol).await.is_none());
        assert!(!f.service.is_joined().await);
        assert_eq!(f.service.local_media_state().await, LocalMediaState::default());

        // Idempotent, and fine without a join.
        f.service.leave().await;
        assert!(f.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_capture_failure_reports_and_preserves_state() {
        let f = fixture("alice").await;
        let mut events = f.service.subscribe_events();
        f.service.initialize(false, true).await.unwrap();

        f.capture
            .fail_with(MediaError::PermissionDenied("screen".to_string()));
        let res = f.service.start_screen_share().await;
        assert!(matches!(res, Err(CallError::Media(MediaError::PermissionDenied(_)))));
        assert!(!f.service.local_media_state().await.screen_sharing);

        next_matching(&mut events, |e| {
            matches!(e, CallEvent::Error { participant: None, error: CallError::Media(_) })
        })
        .await;
    }

    #[tokio::test]
    async fn test_platform_state_changes_reach_subscribers() {
        let f = fixture("alice").await;
        let mut events = f.service.subscribe_events();
        let bob = ParticipantId::new("bob");
        f.service.join_meeting(vec![bob.clone()]).await.unwrap();

        f.connector
            .link(&bob)
            .unwrap()
            .emit_state(ConnectionState::Connected);
        next_matching(&mut events, |e| {
            matches!(e, CallEvent::ConnectionStateChanged { state: ConnectionState::Connected, .. })
        })
        .await;
        assert_eq!(f.service.connected_participants().await, vec![bob]);
    }

    #[tokio::test]
    async fn test_local_candidates_are_trickled() {
        let f = fixture("alice").await;
        let bob = ParticipantId::new("bob");
        f.service.join_meeting(vec![bob.clone()]).await.unwrap();
        f.sink.take();

        f.connector.link(&bob).unwrap().emit_candidate(crate::signaling::IceCandidate {
            candidate: "candidate:1 1 udp 1 192.168.1.2 40000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if f.sink.sent().iter().any(|e| e.kind == EnvelopeKind::Candidate) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_platform_ended_screen_share_falls_back_to_camera() {
        let f = fixture("alice").await;
        let bob = ParticipantId::new("bob");
        f.service.initialize(true, true).await.unwrap();
        f.service.join_meeting(vec![bob.clone()]).await.unwrap();
        let camera = f.service.local_tracks().await.video.unwrap();

        f.service.start_screen_share().await.unwrap();
        let screen = f.service.local_tracks().await.video.unwrap();
        assert_eq!(screen.source(), TrackSource::Screen);

        // User pressed the platform's "stop sharing" button.
        screen.stop();

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.service.local_media_state().await.screen_sharing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let link = f.connector.link(&bob).unwrap();
        assert!(link
            .sender_tracks()
            .contains(&Some(camera.id().to_string())));
        assert_eq!(f.service.local_tracks().await.video.unwrap().id(), camera.id());
    }

    #[tokio::test]
    async fn test_service_drop_stops_driver() {
        let f = fixture("alice").await;
        let weak = Arc::downgrade(&f.service.inner);
        drop(f.service);
        assert!(weak.upgrade().is_none());
    }
}
