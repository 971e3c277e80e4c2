//! Mesh signaling protocol
//!
//! Envelopes carry SDP offers/answers, ICE candidates and room membership
//! announcements between participants. The crate never touches the wire:
//! outgoing envelopes go through an injected [`SignalingSink`], incoming ones
//! are handed to [`CallService::handle_envelope`](crate::service::CallService::handle_envelope).

use crate::identity::ParticipantId;
use crate::types::CallId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    /// Envelope could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// The sink failed to hand the envelope to the relay
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged in OFFER/ANSWER envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate exchanged in CANDIDATE envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid
    pub sdp_mid: Option<String>,
    /// SDP mline index
    pub sdp_mline_index: Option<u16>,
}

/// Envelope payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Session description (OFFER, ANSWER)
    Description(SessionDescription),
    /// Network candidate (CANDIDATE)
    Candidate(IceCandidate),
}

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// ICE candidate
    Candidate,
    /// Sender entered the room
    Joined,
    /// Sender left the room
    Left,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offer => "OFFER",
            Self::Answer => "ANSWER",
            Self::Candidate => "CANDIDATE",
            Self::Joined => "JOINED",
            Self::Left => "LEFT",
        };
        f.write_str(s)
    }
}

/// Signaling envelope
///
/// `to == None` means broadcast to every participant of `call_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind
    pub kind: EnvelopeKind,
    /// Call (room) the message belongs to
    pub call_id: CallId,
    /// Sender
    pub from: ParticipantId,
    /// Recipient, `None` for broadcast
    #[serde(default)]
    pub to: Option<ParticipantId>,
    /// Description or candidate
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl Envelope {
    /// OFFER addressed to `to`
    pub fn offer(
        call_id: CallId,
        from: ParticipantId,
        to: ParticipantId,
        description: SessionDescription,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Offer,
            call_id,
            from,
            to: Some(to),
            payload: Some(Payload::Description(description)),
        }
    }

    /// ANSWER addressed to `to`
    pub fn answer(
        call_id: CallId,
        from: ParticipantId,
        to: ParticipantId,
        description: SessionDescription,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Answer,
            call_id,
            from,
            to: Some(to),
            payload: Some(Payload::Description(description)),
        }
    }

    /// CANDIDATE addressed to `to`
    pub fn candidate(
        call_id: CallId,
        from: ParticipantId,
        to: ParticipantId,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Candidate,
            call_id,
            from,
            to: Some(to),
            payload: Some(Payload::Candidate(candidate)),
        }
    }

    /// Broadcast JOINED
    pub fn joined(call_id: CallId, from: ParticipantId) -> Self {
        Self {
            kind: EnvelopeKind::Joined,
            call_id,
            from,
            to: None,
            payload: None,
        }
    }

    /// Broadcast LEFT
    pub fn left(call_id: CallId, from: ParticipantId) -> Self {
        Self {
            kind: EnvelopeKind::Left,
            call_id,
            from,
            to: None,
            payload: None,
        }
    }

    /// Session description carried by the envelope, if any
    #[must_use]
    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            Some(Payload::Description(d)) => Some(d),
            _ => None,
        }
    }

    /// Candidate carried by the envelope, if any
    #[must_use]
    pub fn ice_candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            Some(Payload::Candidate(c)) => Some(c),
            _ => None,
        }
    }

    /// True if the envelope is a broadcast
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// True if `participant` should process this envelope
    #[must_use]
    pub fn is_addressed_to(&self, participant: &ParticipantId) -> bool {
        self.to.as_ref().map_or(true, |to| to == participant)
    }

    /// Encode as the JSON relay format
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Codec(e.to_string()))
    }

    /// Decode from the JSON relay format
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid envelope
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Codec(e.to_string()))
    }
}

/// Outgoing side of the relay
///
/// Implement this for your transport (websocket, pub/sub topic, gossip, ...).
/// Delivery is fire-and-forget; the engine tolerates lost or duplicated
/// envelopes.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Hand an envelope to the relay
    async fn send_envelope(&self, envelope: Envelope) -> Result<(), SignalingError>;
}

/// Sink backed by a plain function
pub struct FnSink<F>(F);

/// Wrap a synchronous send function as a [`SignalingSink`]
pub fn sink_fn<F>(f: F) -> FnSink<F>
where
    F: Fn(Envelope) -> Result<(), SignalingError> + Send + Sync,
{
    FnSink(f)
}

#[async_trait]
impl<F> SignalingSink for FnSink<F>
where
    F: Fn(Envelope) -> Result<(), SignalingError> + Send + Sync,
{
    async fn send_envelope(&self, envelope: Envelope) -> Result<(), SignalingError> {
        (self.0)(envelope)
    }
}

/// Outbound envelope path with logging and failure accounting
#[derive(Clone)]
pub struct EnvelopeSender {
    sink: Arc<dyn SignalingSink>,
    error_count: Arc<AtomicU32>,
}

impl EnvelopeSender {
    /// Create new sender
    #[must_use]
    pub fn new(sink: Arc<dyn SignalingSink>) -> Self {
        Self {
            sink,
            error_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Send an envelope through the sink
    ///
    /// # Errors
    ///
    /// Returns error if the sink rejects the envelope
    #[tracing::instrument(skip(self, envelope), fields(kind = %envelope.kind, to = ?envelope.to))]
    pub async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling envelope");
        match self.sink.send_envelope(envelope).await {
            Ok(()) => {
                self.error_count.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error_count = count, error = %e, "Signaling sink rejected envelope");
                Err(e)
            }
        }
    }

    /// Consecutive send failures so far
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn call() -> CallId {
        CallId::new("room-1")
    }

    #[test]
    fn test_envelope_addressing() {
        let alice = ParticipantId::new("alice");
        let bob = ParticipantId::new("bob");
        let carol = ParticipantId::new("carol");

        let offer = Envelope::offer(
            call(),
            alice.clone(),
            bob.clone(),
            SessionDescription::offer("v=0"),
        );
        assert!(offer.is_addressed_to(&bob));
        assert!(!offer.is_addressed_to(&carol));
        assert!(!offer.is_broadcast());

        let joined = Envelope::joined(call(), alice);
        assert!(joined.is_broadcast());
        assert!(joined.is_addressed_to(&carol));
        assert!(joined.description().is_none());
    }

    #[test]
    fn test_envelope_payload_accessors() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let env = Envelope::candidate(call(), "a".into(), "b".into(), c.clone());
        assert_eq!(env.ice_candidate(), Some(&c));
        assert!(env.description().is_none());
    }

    #[test]
    fn test_envelope_json_shape() {
        let env = Envelope::answer(
            call(),
            "bob".into(),
            "alice".into(),
            SessionDescription::answer("v=0\r\n"),
        );
        let json = env.to_json().unwrap();
        assert!(json.contains("\"kind\":\"answer\""));
        assert!(json.contains("\"type\":\"description\""));
        assert!(json.contains("\"sdp_type\":\"answer\""));
        assert_eq!(Envelope::from_json(&json).unwrap(), env);
    }

    #[test]
    fn test_envelope_without_payload_field_decodes() {
        let env =
            Envelope::from_json(r#"{"kind":"left","call_id":"room-1","from":"carol"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Left);
        assert!(env.to.is_none());
        assert!(env.payload.is_none());
    }

    #[test]
    fn test_envelope_garbage_is_codec_error() {
        let res = Envelope::from_json("{not json");
        assert!(matches!(res, Err(SignalingError::Codec(_))));
    }

    #[tokio::test]
    async fn test_envelope_sender_counts_failures() {
        let fail = Arc::new(Mutex::new(true));
        let flag = fail.clone();
        let sender = EnvelopeSender::new(Arc::new(sink_fn(move |_env| {
            if *flag.lock().unwrap() {
                Err(SignalingError::TransportError("relay down".to_string()))
            } else {
                Ok(())
            }
        })));

        let env = Envelope::left(call(), "alice".into());
        assert!(sender.send(env.clone()).await.is_err());
        assert!(sender.send(env.clone()).await.is_err());
        assert_eq!(sender.consecutive_errors(), 2);

        *fail.lock().unwrap() = false;
        assert!(sender.send(env).await.is_ok());
        assert_eq!(sender.consecutive_errors(), 0);
    }
}
