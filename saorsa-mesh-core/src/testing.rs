//! Test doubles for the mesh
//!
//! Enabled for unit tests and, through the `test-utils` feature, for
//! integration tests and downstream crates.
//!
//! [`MockLink`] models the offer/answer state machine closely enough for the
//! negotiation engine: applying a local offer moves it to `HaveLocalOffer` and
//! `Connecting`, answering an offer returns it to `Stable`, and descriptions
//! are opaque strings. Like webrtc-rs it refuses a remote offer while its own
//! offer is pending. Platform events are raised explicitly by the test.

#![allow(missing_docs)]

use crate::connection::{PeerConnector, PeerEvents, PeerLink, SenderId};
use crate::identity::ParticipantId;
use crate::media::{CaptureDevices, LocalStream, LocalTrack, MediaError, SampleCapture};
use crate::negotiation::NegotiationError;
use crate::signaling::{Envelope, IceCandidate, SdpType, SessionDescription, SignalingError, SignalingSink};
use crate::types::{ConnectionState, IceServer, RemoteTrack, SignalingState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct LinkState {
    connection: Option<ConnectionState>,
    signaling: Option<SignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    senders: Vec<Option<String>>,
    added: Vec<String>,
    replace_count: usize,
    offers: usize,
    ice_restarts: usize,
}

/// In-memory [`PeerLink`]
pub struct MockLink {
    serial: u64,
    participant: ParticipantId,
    events: PeerEvents,
    fail_add_track: AtomicBool,
    fail_offers: AtomicBool,
    state: Mutex<LinkState>,
}

impl MockLink {
    fn new(serial: u64, participant: ParticipantId, events: PeerEvents, fail_add_track: bool) -> Self {
        Self {
            serial,
            participant,
            events,
            fail_add_track: AtomicBool::new(fail_add_track),
            fail_offers: AtomicBool::new(false),
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Set the connection state and report it like the platform would
    pub fn emit_state(&self, state: ConnectionState) {
        self.state.lock().connection = Some(state);
        self.events.state_changed(state);
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        self.events.local_candidate(candidate);
    }

    pub fn emit_remote_track(&self, track: RemoteTrack) {
        self.events.remote_track(track);
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.state.lock().added.clone()
    }

    /// Track id currently feeding each sender
    pub fn sender_tracks(&self) -> Vec<Option<String>> {
        self.state.lock().senders.clone()
    }

    pub fn replace_count(&self) -> usize {
        self.state.lock().replace_count
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub fn ice_restarts(&self) -> usize {
        self.state.lock().ice_restarts
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == Some(SignalingState::Closed)
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(NegotiationError::Sdp("offer refused".to_string()));
        }
        let mut state = self.state.lock();
        if state.signaling == Some(SignalingState::Closed) {
            return Err(NegotiationError::Connection("link closed".to_string()));
        }
        state.offers += 1;
        if ice_restart {
            state.ice_restarts += 1;
        }
        Ok(SessionDescription::offer(format!(
            "mock-offer-{}-{}",
            self.serial, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock();
        if state.signaling != Some(SignalingState::HaveRemoteOffer) {
            return Err(NegotiationError::Sdp("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.serial)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        let next = match (description.sdp_type, current) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::Sdp(format!(
                    "cannot apply local {:?} in {:?}",
                    kind, current
                )))
            }
        };
        state.signaling = Some(next);
        if state.connection.is_none() {
            state.connection = Some(ConnectionState::Connecting);
        }
        state.local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if description.sdp.trim().is_empty() {
            return Err(NegotiationError::Sdp(
                "Session description cannot be empty".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        let next = match (description.sdp_type, current) {
            // No implicit rollback: a remote offer is only accepted when stable.
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::Sdp(format!(
                    "cannot apply remote {:?} in {:?}",
                    kind, current
                )))
            }
        };
        state.signaling = Some(next);
        state.remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(NegotiationError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError> {
        if self.fail_add_track.load(Ordering::SeqCst) {
            return Err(NegotiationError::Track("add_track refused".to_string()));
        }
        let mut state = self.state.lock();
        state.added.push(track.id().to_string());
        state.senders.push(Some(track.id().to_string()));
        Ok(SenderId(state.senders.len() - 1))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&LocalTrack>,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        let slot = state
            .senders
            .get_mut(sender.0)
            .ok_or_else(|| NegotiationError::Track(format!("Unknown sender {}", sender.0)))?;
        *slot = track.map(|t| t.id().to_string());
        state.replace_count += 1;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection.unwrap_or(ConnectionState::New)
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling.unwrap_or(SignalingState::Stable)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        let already = {
            let mut state = self.state.lock();
            let already = state.signaling == Some(SignalingState::Closed);
            state.signaling = Some(SignalingState::Closed);
            state.connection = Some(ConnectionState::Closed);
            already
        };
        if !already {
            self.events.state_changed(ConnectionState::Closed);
        }
        Ok(())
    }
}

/// [`PeerConnector`] handing out [`MockLink`]s and remembering them
#[derive(Default)]
pub struct MockConnector {
    links: Mutex<Vec<Arc<MockLink>>>,
    next_serial: AtomicU64,
    fail_add_track: AtomicBool,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// New links refuse `add_track`
    pub fn fail_add_track(&self, fail: bool) {
        self.fail_add_track.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Participants links were created for, in creation order
    pub fn created(&self) -> Vec<ParticipantId> {
        self.links
            .lock()
            .iter()
            .map(|l| l.participant.clone())
            .collect()
    }

    /// Most recent link created for `participant`
    pub fn link(&self, participant: &ParticipantId) -> Option<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|l| &l.participant == participant)
            .cloned()
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        participant: &ParticipantId,
        _ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(NegotiationError::Connection("connect refused".to_string()));
        }
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Arc::new(MockLink::new(
            serial,
            participant.clone(),
            events,
            self.fail_add_track.load(Ordering::SeqCst),
        ));
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

/// [`SignalingSink`] that records every envelope
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Return and forget everything sent so far
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl SignalingSink for RecordingSink {
    async fn send_envelope(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::TransportError("sink offline".to_string()));
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}

/// [`SampleCapture`] that can be told to fail
#[derive(Default)]
pub struct MockCapture {
    inner: SampleCapture,
    failure: Mutex<Option<MediaError>>,
    user_media_calls: AtomicUsize,
    display_media_calls: AtomicUsize,
}

impl MockCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following acquisition fails with `error`
    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock() = Some(error);
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    pub fn display_media_calls(&self) -> usize {
        self.display_media_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevices for MockCapture {
    async fn user_media(&self, video: bool, audio: bool) -> Result<LocalStream, MediaError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.failure.lock().clone();
        if let Some(e) = failure {
            return Err(e);
        }
        self.inner.user_media(video, audio).await
    }

    async fn display_media(&self) -> Result<LocalStream, MediaError> {
        self.display_media_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.failure.lock().clone();
        if let Some(e) = failure {
            return Err(e);
        }
        self.inner.display_media().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_mock_link_refuses_offer_while_own_offer_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = ParticipantId::new("bob");
        let link = MockConnector::new()
            .connect(&bob, &[], PeerEvents::new(bob.clone(), 1, tx))
            .await
            .unwrap();
        let offer = link.create_offer(false).await.unwrap();
        link.set_local_description(offer).await.unwrap();

        let res = link
            .set_remote_description(SessionDescription::offer("v=0 bob"))
            .await;
        assert!(matches!(res, Err(NegotiationError::Sdp(_))));
        assert_eq!(link.signaling_state(), SignalingState::HaveLocalOffer);
    }
}
