//! Peer connection abstraction
//!
//! The registry and the negotiation engine only talk to peer connections
//! through [`PeerLink`], and create them through a [`PeerConnector`]. The
//! default connector, [`RtcConnector`], is backed by the `webrtc` crate.
//!
//! Platform callbacks (local candidate gathered, connection state changed,
//! remote track arrived) must never touch call state directly. Connectors
//! forward them through the [`PeerEvents`] handle they are given, which posts
//! them onto the session's event queue.

use crate::identity::ParticipantId;
use crate::media::LocalTrack;
use crate::negotiation::NegotiationError;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::types::{ConnectionState, IceServer, MediaKind, RemoteTrack, SignalingState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Handle of an outgoing sender created by [`PeerLink::add_track`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub usize);

/// Events posted from platform callbacks into the session
#[derive(Debug)]
pub(crate) enum PlatformEvent {
    LocalCandidate {
        participant: ParticipantId,
        link_id: u64,
        candidate: IceCandidate,
    },
    StateChanged {
        participant: ParticipantId,
        link_id: u64,
        state: ConnectionState,
    },
    RemoteTrack {
        participant: ParticipantId,
        link_id: u64,
        track: RemoteTrack,
    },
    ScreenShareEnded {
        track_id: String,
    },
}

/// Callback handle given to a connector for one peer link
///
/// Every event is tagged with the link generation so that late events from a
/// connection that has since been replaced are discarded.
#[derive(Clone)]
pub struct PeerEvents {
    participant: ParticipantId,
    link_id: u64,
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl PeerEvents {
    pub(crate) fn new(
        participant: ParticipantId,
        link_id: u64,
        tx: mpsc::UnboundedSender<PlatformEvent>,
    ) -> Self {
        Self {
            participant,
            link_id,
            tx,
        }
    }

    /// Remote participant this link belongs to
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// A local candidate was gathered and must be trickled to the peer
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.post(PlatformEvent::LocalCandidate {
            participant: self.participant.clone(),
            link_id: self.link_id,
            candidate,
        });
    }

    /// The connection state changed
    pub fn state_changed(&self, state: ConnectionState) {
        self.post(PlatformEvent::StateChanged {
            participant: self.participant.clone(),
            link_id: self.link_id,
            state,
        });
    }

    /// A remote track arrived
    pub fn remote_track(&self, track: RemoteTrack) {
        self.post(PlatformEvent::RemoteTrack {
            participant: self.participant.clone(),
            link_id: self.link_id,
            track,
        });
    }

    fn post(&self, event: PlatformEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(participant = %self.participant, "Session gone, dropping platform event");
        }
    }
}

/// One peer-to-peer connection to a remote participant
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer; `ice_restart` renegotiates transport paths in place
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer for the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a local description
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply a remote description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Add a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Attach a local track, creating a new outgoing sender
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError>;

    /// Swap the track feeding an existing sender without renegotiation
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&LocalTrack>,
    ) -> Result<(), NegotiationError>;

    /// Currently applied local description
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Currently applied remote description
    async fn remote_description(&self) -> Option<SessionDescription>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Current offer/answer state
    fn signaling_state(&self) -> SignalingState;

    /// Close the connection
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Factory for peer links
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a link to `participant`, wiring its callbacks to `events`
    async fn connect(
        &self,
        participant: &ParticipantId,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}

// ============================================================================
// webrtc-rs implementation
// ============================================================================

/// Connector backed by the `webrtc` crate
pub struct RtcConnector {
    api: webrtc::api::API,
}

impl RtcConnector {
    /// Build the WebRTC API with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| NegotiationError::Connection(format!("Failed to register codecs: {}", e)))?;

        // NACKs, RTCP reports and TWCC are provided by the default interceptors.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media).map_err(|e| {
            NegotiationError::Connection(format!("Failed to register interceptors: {}", e))
        })?;

        Ok(Self {
            api: APIBuilder::new()
                .with_media_engine(media)
                .with_interceptor_registry(registry)
                .build(),
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    #[tracing::instrument(skip(self, ice_servers, events), fields(participant = %participant))]
    async fn connect(
        &self,
        participant: &ParticipantId,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(|e| {
            tracing::error!("Failed to create peer connection: {}", e);
            NegotiationError::Connection(format!("Failed to create peer connection: {}", e))
        })?);

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!(
                participant = %state_events.participant(),
                state = %s,
                "Peer connection state changed"
            );
            if let Some(state) = map_connection_state(s) {
                state_events.state_changed(state);
            }
            Box::pin(futures::future::ready(()))
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => candidate_events.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Audio,
                };
                track_events.remote_track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    track: Some(track),
                });
                Box::pin(futures::future::ready(()))
            },
        ));

        tracing::debug!("Created peer connection");
        Ok(Arc::new(RtcLink {
            pc,
            senders: Mutex::new(Vec::new()),
            rtcp_readers: Mutex::new(Vec::new()),
        }))
    }
}

/// [`PeerLink`] over an `RTCPeerConnection`
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    rtcp_readers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RtcLink {
    /// Underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, NegotiationError> {
        self.senders
            .lock()
            .get(id.0)
            .cloned()
            .ok_or_else(|| NegotiationError::Track(format!("Unknown sender {}", id.0)))
    }
}

impl Drop for RtcLink {
    fn drop(&mut self) {
        for handle in self.rtcp_readers.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = ice_restart.then_some(RTCOfferOptions {
            voice_activity_detection: false,
            ice_restart: true,
        });
        let offer = self.pc.create_offer(options).await.map_err(|e| {
            tracing::error!("Failed to create offer: {}", e);
            NegotiationError::Sdp(format!("Failed to create offer: {}", e))
        })?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(|e| {
            tracing::error!("Failed to create answer: {}", e);
            NegotiationError::Sdp(format!("Failed to create answer: {}", e))
        })?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc_description(description)?;
        self.pc.set_local_description(desc).await.map_err(|e| {
            NegotiationError::Sdp(format!("Failed to set local description: {}", e))
        })
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
        let desc = to_rtc_description(description)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            NegotiationError::Sdp(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Candidate(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError> {
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track().clone();
        let sender = self
            .pc
            .add_track(rtc)
            .await
            .map_err(|e| NegotiationError::Track(format!("Failed to add track: {}", e)))?;

        // Incoming RTCP must be drained for the interceptors (NACK, reports) to run.
        let reader = sender.clone();
        let handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while reader.read(&mut rtcp_buf).await.is_ok() {}
            tracing::trace!("RTCP reader finished");
        });
        self.rtcp_readers.lock().push(handle);

        let mut senders = self.senders.lock();
        senders.push(sender);
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&LocalTrack>,
    ) -> Result<(), NegotiationError> {
        let rtp_sender = self.sender(sender)?;
        let rtc = track.map(|t| {
            let rtc: Arc<dyn TrackLocal + Send + Sync> = t.rtc_track().clone();
            rtc
        });
        rtp_sender
            .replace_track(rtc)
            .await
            .map_err(|e| NegotiationError::Track(format!("Failed to replace track: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc_description)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.and_then(from_rtc_description)
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        for handle in self.rtcp_readers.lock().drain(..) {
            handle.abort();
        }
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::Connection(format!("Failed to close: {}", e)))
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Unspecified => None,
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|e| NegotiationError::Sdp(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Option<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => Some(SessionDescription::answer(desc.sdp)),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(map_connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Closed),
            Some(ConnectionState::Closed)
        );
    }

    #[test]
    fn test_garbage_sdp_is_rejected() {
        let res = to_rtc_description(SessionDescription::answer("not-an-sdp"));
        assert!(matches!(res, Err(NegotiationError::Sdp(_))));
    }

    #[tokio::test]
    async fn test_peer_events_tag_link_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = PeerEvents::new(ParticipantId::new("bob"), 7, tx);
        events.state_changed(ConnectionState::Connecting);

        match rx.recv().await.unwrap() {
            PlatformEvent::StateChanged {
                participant,
                link_id,
                state,
            } => {
                assert_eq!(participant.as_str(), "bob");
                assert_eq!(link_id, 7);
                assert_eq!(state, ConnectionState::Connecting);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rtc_connector_creates_new_link() {
        let connector = RtcConnector::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = ParticipantId::new("bob");
        let link = connector
            .connect(&bob, &[], PeerEvents::new(bob.clone(), 1, tx))
            .await
            .unwrap();

        assert_eq!(link.connection_state(), ConnectionState::New);
        assert_eq!(link.signaling_state(), SignalingState::Stable);
        assert!(link.local_description().await.is_none());
        link.close().await.unwrap();
    }
}
