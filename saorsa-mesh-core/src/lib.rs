//! Saorsa Mesh - multi-party WebRTC calls over a full mesh
//!
//! Every participant holds one direct peer connection to every other
//! participant. Session descriptions and network candidates travel through a
//! signaling relay supplied by the embedding application; this crate never
//! touches the wire itself.
//!
//! - **Signaling envelopes**: OFFER / ANSWER / CANDIDATE / JOINED / LEFT,
//!   directed or broadcast to a call room
//! - **Peer registry**: one connection per participant, ICE restart on
//!   transport failure
//! - **Local media**: mute and video-off without renegotiation, screen share
//!   by in-place track substitution
//! - **Call service**: the single facade the application drives
//!
//! # Examples
//!
//! ```rust,no_run
//! use saorsa_mesh_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! // Hand outbound envelopes to your relay (websocket, pub/sub, ...)
//! let sink = Arc::new(sink_fn(|envelope: Envelope| {
//!     println!("{}", envelope.to_json()?);
//!     Ok(())
//! }));
//!
//! let service = CallService::builder("alice", CallId::new("standup"), sink)
//!     .build()
//!     .await?;
//!
//! service.initialize(true, true).await?;
//! service.join_meeting(vec![ParticipantId::new("bob")]).await?;
//!
//! // For every message the relay delivers:
//! // service.handle_envelope(Envelope::from_json(&text)?).await;
//!
//! service.leave().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]

/// Core mesh types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Signaling envelopes and the outbound sink
pub mod signaling;

/// Peer connection abstraction and the WebRTC-backed implementation
pub mod connection;

/// One peer connection per remote participant
pub mod registry;

/// Local capture and track substitution
pub mod media;

/// Offer/answer/candidate state machine
pub mod negotiation;

/// Call session facade
pub mod service;

/// In-process signaling relay
pub mod relay;

/// Mock collaborators for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use connection::{PeerConnector, PeerEvents, PeerLink, RtcConnector, RtcLink, SenderId};
pub use identity::ParticipantId;
pub use media::{
    CaptureDevices, LocalMedia, LocalStream, LocalTrack, MediaError, OutgoingTracks, SampleCapture,
};
pub use negotiation::{NegotiationEngine, NegotiationError};
pub use registry::{PeerRegistry, StateAction, TrackUpdate};
pub use relay::LocalRelay;
pub use service::{CallError, CallService, CallServiceBuilder, MeshConfig, WeakCallService};
pub use signaling::{
    sink_fn, Envelope, EnvelopeKind, EnvelopeSender, IceCandidate, Payload, SdpType,
    SessionDescription, SignalingError, SignalingSink,
};
pub use types::*;

/// Encoded media sample fed to a [`LocalTrack`]
pub use webrtc::media::Sample;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::ParticipantId;
    pub use crate::media::{CaptureDevices, LocalTrack, MediaError, SampleCapture};
    pub use crate::relay::LocalRelay;
    pub use crate::service::{CallError, CallService, CallServiceBuilder, MeshConfig};
    pub use crate::signaling::{sink_fn, Envelope, EnvelopeKind, SignalingSink};
    pub use crate::types::{
        CallEvent, CallId, ConnectionState, GlarePolicy, IceServer, LocalMediaState, RemoteStream,
    };
}
