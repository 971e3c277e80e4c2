//! Mesh call types and data structures

use crate::identity::ParticipantId;
use crate::service::CallError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::track::track_remote::TrackRemote;

/// Identifier of a call (the relay room the envelopes are scoped to)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Wrap an application-supplied call id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random call ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Capture source a local track originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    /// Microphone
    Microphone,
    /// Camera
    Camera,
    /// Screen capture
    Screen,
}

impl TrackSource {
    /// Media kind produced by this source
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }
}

/// Connection state of a single peer link
///
/// Mirrors the WebRTC `RTCPeerConnectionState` values the registry reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Freshly created, nothing negotiated yet
    New,
    /// Transport negotiation in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Transport lost, may recover
    Disconnected,
    /// Transport failed
    Failed,
    /// Connection closed, terminal
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Offer/answer state of a single peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    /// No negotiation in flight
    Stable,
    /// Local offer applied, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
    /// Link closed
    Closed,
}

/// Network traversal (STUN/TURN) server descriptor
///
/// Passed through unmodified to every new peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: String,
    /// TURN credential
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// How simultaneous offers between the same two participants are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlarePolicy {
    /// A second offer re-runs the offer path; the last description applied wins
    #[default]
    LastWriterWins,
    /// The lower participant id keeps its own offer, the higher id yields
    LowerIdWins,
}

/// A track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track identifier as announced by the sender
    pub id: String,
    /// Stream the sender grouped this track into
    pub stream_id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// Underlying WebRTC track, absent for non-WebRTC connectors
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("rtc", &self.track.is_some())
            .finish()
    }
}

/// Media received from one remote participant
#[derive(Debug, Clone)]
pub struct RemoteStream {
    /// Sending participant
    pub participant: ParticipantId,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Create an empty stream for a participant
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            tracks: Vec::new(),
        }
    }

    /// Add or replace a track (matched by id)
    pub fn upsert(&mut self, track: RemoteTrack) {
        if let Some(existing) = self.tracks.iter_mut().find(|t| t.id == track.id) {
            *existing = track;
        } else {
            self.tracks.push(track);
        }
    }

    /// Check if the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }

    /// Check if the stream carries audio
    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Audio)
    }
}

/// Snapshot of the local capture flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalMediaState {
    /// Camera+microphone capture held
    pub capturing: bool,
    /// Microphone muted
    pub muted: bool,
    /// Camera video enabled
    pub video_enabled: bool,
    /// Screen share active
    pub screen_sharing: bool,
}

/// Events produced by a call session
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Media arrived (or changed) on a participant's connection
    RemoteStream {
        /// Sending participant
        participant: ParticipantId,
        /// Current remote stream
        stream: RemoteStream,
    },
    /// A participant announced itself
    ParticipantJoined {
        /// New participant
        participant: ParticipantId,
    },
    /// A participant left the call
    ParticipantLeft {
        /// Departed participant
        participant: ParticipantId,
    },
    /// Connection state of a peer link changed
    ConnectionStateChanged {
        /// Remote participant
        participant: ParticipantId,
        /// New state
        state: ConnectionState,
    },
    /// An operation failed; the session keeps running
    Error {
        /// Participant the failure relates to, if any
        participant: Option<ParticipantId>,
        /// The failure
        error: CallError,
    },
}
