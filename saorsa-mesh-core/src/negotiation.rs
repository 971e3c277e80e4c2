//! Negotiation engine
//!
//! Turns inbound signaling envelopes and link state changes into
//! offer/answer/candidate operations on the registry's links, and emits the
//! resulting envelopes through the outbound sink.
//!
//! | Kind      | Action                                                       |
//! |-----------|--------------------------------------------------------------|
//! | OFFER     | get-or-create link, apply remote offer, answer               |
//! | ANSWER    | apply remote answer if our offer is pending                  |
//! | CANDIDATE | add candidate if a link exists                               |
//! | JOINED    | add sender to roster, create link and offer unless linked    |
//! | LEFT      | remove sender from roster, close link                        |
//!
//! Envelopes from ourselves, for somebody else, or for another call are
//! ignored. A failing step is reported as a [`CallEvent::Error`] and never
//! stops processing of later envelopes.
//!
//! # Offer collisions
//!
//! webrtc-rs cannot roll back a pending local offer, so an OFFER that
//! arrives while ours is outstanding is answered on a replacement link. With
//! [`GlarePolicy::LastWriterWins`] both sides do this and each then receives
//! an ANSWER for an offer it has already dropped. On that ANSWER the lower
//! participant id closes its link and offers again on a fresh one; the higher
//! id replaces its link when that offer arrives. [`GlarePolicy::LowerIdWins`]
//! skips the round trip: the lower id ignores the colliding offer.

use crate::identity::ParticipantId;
use crate::media::OutgoingTracks;
use crate::registry::{GlareState, PeerRegistry, StateAction, TrackUpdate};
use crate::service::CallError;
use crate::signaling::{
    Envelope, EnvelopeKind, EnvelopeSender, IceCandidate, SessionDescription, SignalingError,
};
use crate::types::{CallEvent, CallId, ConnectionState, GlarePolicy, RemoteTrack, SignalingState};
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::broadcast;

/// Negotiation errors
#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    /// Session description could not be created or applied
    #[error("Session description error: {0}")]
    Sdp(String),

    /// Candidate could not be applied
    #[error("ICE candidate error: {0}")]
    Candidate(String),

    /// Track could not be attached or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// Peer connection could not be created or closed
    #[error("Connection error: {0}")]
    Connection(String),

    /// No link exists for the participant
    #[error("No connection to participant {0}")]
    NoConnection(ParticipantId),

    /// Outbound envelope was rejected
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Per-call negotiation state machine
pub struct NegotiationEngine {
    self_id: ParticipantId,
    call_id: CallId,
    glare_policy: GlarePolicy,
    roster: BTreeSet<ParticipantId>,
    registry: PeerRegistry,
    outbox: EnvelopeSender,
    events: broadcast::Sender<CallEvent>,
}

impl NegotiationEngine {
    pub(crate) fn new(
        self_id: ParticipantId,
        call_id: CallId,
        glare_policy: GlarePolicy,
        registry: PeerRegistry,
        outbox: EnvelopeSender,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            self_id,
            call_id,
            glare_policy,
            roster: BTreeSet::new(),
            registry,
            outbox,
            events,
        }
    }

    /// Our participant id
    pub fn self_id(&self) -> &ParticipantId {
        &self.self_id
    }

    /// Call the engine negotiates for
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Participants believed to be in the call
    pub fn roster(&self) -> &BTreeSet<ParticipantId> {
        &self.roster
    }

    /// Peer links
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut PeerRegistry {
        &mut self.registry
    }

    /// Offer to every participant in `roster`, then announce ourselves
    #[tracing::instrument(skip(self, roster, tracks), fields(call_id = %self.call_id, me = %self.self_id))]
    pub async fn join(&mut self, roster: Vec<ParticipantId>, tracks: &OutgoingTracks) {
        let peers: BTreeSet<ParticipantId> = roster
            .into_iter()
            .filter(|p| !p.is_empty() && *p != self.self_id)
            .collect();
        self.roster.extend(peers.iter().cloned());
        tracing::info!(peers = peers.len(), "Joining call");

        for peer in peers {
            if let Err(e) = self.send_offer(&peer, tracks, false).await {
                self.roster.remove(&peer);
                self.report(Some(peer), e);
            }
        }

        let joined = Envelope::joined(self.call_id.clone(), self.self_id.clone());
        if let Err(e) = self.outbox.send(joined).await {
            self.report(None, e.into());
        }
    }

    /// Dispatch one inbound envelope
    #[tracing::instrument(
        skip(self, envelope, tracks),
        fields(kind = %envelope.kind, from = %envelope.from, me = %self.self_id)
    )]
    pub async fn handle_envelope(&mut self, envelope: Envelope, tracks: &OutgoingTracks) {
        if envelope.call_id != self.call_id {
            tracing::debug!(call_id = %envelope.call_id, "Ignoring envelope for another call");
            return;
        }
        if envelope.from == self.self_id || !envelope.is_addressed_to(&self.self_id) {
            tracing::trace!("Ignoring envelope not meant for us");
            return;
        }
        if envelope.from.is_empty() {
            tracing::warn!("Ignoring envelope without sender");
            return;
        }

        let from = envelope.from.clone();
        let result = match envelope.kind {
            EnvelopeKind::Offer => match envelope.description() {
                Some(desc) => self.on_offer(&from, desc.clone(), tracks).await,
                None => {
                    tracing::warn!("OFFER without session description, dropping");
                    Ok(())
                }
            },
            EnvelopeKind::Answer => match envelope.description() {
                Some(desc) => self.on_answer(&from, desc.clone(), tracks).await,
                None => {
                    tracing::warn!("ANSWER without session description, dropping");
                    Ok(())
                }
            },
            EnvelopeKind::Candidate => match envelope.ice_candidate() {
                Some(candidate) => self.on_candidate(&from, candidate.clone()).await,
                None => {
                    tracing::warn!("CANDIDATE without candidate, dropping");
                    Ok(())
                }
            },
            EnvelopeKind::Joined => self.on_joined(&from, tracks).await,
            EnvelopeKind::Left => {
                self.on_left(&from).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to handle envelope");
            self.report(Some(from), e);
        }
    }

    async fn on_offer(
        &mut self,
        from: &ParticipantId,
        description: SessionDescription,
        tracks: &OutgoingTracks,
    ) -> Result<(), NegotiationError> {
        let current = self
            .registry
            .get(from)
            .map(|entry| (entry.link.signaling_state(), entry.glare));
        let mut yielded = false;
        match current {
            Some((SignalingState::HaveLocalOffer, _)) => {
                if self.glare_policy == GlarePolicy::LowerIdWins && self.self_id < *from {
                    tracing::debug!("Offer collision, keeping our own offer");
                    return Ok(());
                }
                tracing::debug!("Offer collision, answering on a replacement link");
                self.registry.close(from).await;
                yielded = true;
            }
            Some((SignalingState::Stable, GlareState::Clear | GlareState::Yielded)) | None => {}
            Some((state, glare)) => {
                tracing::debug!(?state, ?glare, "Link cannot take this offer, replacing it");
                self.registry.close(from).await;
            }
        }

        self.admit(from);

        let link = self.registry.get_or_create(from, tracks).await?;
        if yielded {
            self.registry.set_glare(from, GlareState::Yielded);
        }
        link.set_remote_description(description).await?;
        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;

        tracing::debug!("Sending answer");
        self.outbox
            .send(Envelope::answer(
                self.call_id.clone(),
                self.self_id.clone(),
                from.clone(),
                answer,
            ))
            .await?;
        Ok(())
    }

    async fn on_answer(
        &mut self,
        from: &ParticipantId,
        description: SessionDescription,
        tracks: &OutgoingTracks,
    ) -> Result<(), NegotiationError> {
        let Some((link, glare)) = self
            .registry
            .get(from)
            .map(|entry| (entry.link.clone(), entry.glare))
        else {
            tracing::debug!("ANSWER for unknown connection, ignoring");
            return Ok(());
        };
        if link.signaling_state() == SignalingState::HaveLocalOffer {
            link.set_remote_description(description).await?;
            self.registry.set_glare(from, GlareState::Clear);
            return Ok(());
        }
        if glare == GlareState::Yielded {
            return self.resolve_crossed_offers(from, tracks).await;
        }
        tracing::debug!("ANSWER without a pending offer, ignoring");
        Ok(())
    }

    /// Both sides answered each other's colliding offers on replacement
    /// links, so neither link has a live counterpart
    async fn resolve_crossed_offers(
        &mut self,
        from: &ParticipantId,
        tracks: &OutgoingTracks,
    ) -> Result<(), NegotiationError> {
        if self.self_id < *from {
            tracing::info!("Offers crossed, offering again on a fresh link");
            self.registry.close(from).await;
            self.send_offer(from, tracks, false).await
        } else {
            tracing::info!("Offers crossed, waiting for a fresh offer");
            self.registry.set_glare(from, GlareState::AwaitingOffer);
            Ok(())
        }
    }

    async fn on_candidate(
        &mut self,
        from: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let Some(link) = self.registry.link(from) else {
            tracing::debug!("CANDIDATE for unknown connection, ignoring");
            return Ok(());
        };
        link.add_ice_candidate(candidate).await
    }

    async fn on_joined(
        &mut self,
        from: &ParticipantId,
        tracks: &OutgoingTracks,
    ) -> Result<(), NegotiationError> {
        self.admit(from);
        if self.registry.contains(from) {
            // Their offer to us is already in flight or applied.
            tracing::debug!("JOINED from connected participant, not re-offering");
            return Ok(());
        }
        self.send_offer(from, tracks, false).await
    }

    async fn on_left(&mut self, from: &ParticipantId) {
        let was_member = self.roster.remove(from);
        let had_link = self.registry.close(from).await;
        if was_member || had_link {
            tracing::info!(participant = %from, "Participant left");
            self.emit(CallEvent::ParticipantLeft {
                participant: from.clone(),
            });
        }
    }

    /// Add to the roster, announcing newcomers
    fn admit(&mut self, participant: &ParticipantId) {
        if self.roster.insert(participant.clone()) {
            tracing::info!(participant = %participant, "Participant joined");
            self.emit(CallEvent::ParticipantJoined {
                participant: participant.clone(),
            });
        }
    }

    async fn send_offer(
        &mut self,
        to: &ParticipantId,
        tracks: &OutgoingTracks,
        ice_restart: bool,
    ) -> Result<(), NegotiationError> {
        let link = self.registry.get_or_create(to, tracks).await?;
        let offer = link.create_offer(ice_restart).await?;
        link.set_local_description(offer.clone()).await?;

        tracing::debug!(participant = %to, ice_restart, "Sending offer");
        self.outbox
            .send(Envelope::offer(
                self.call_id.clone(),
                self.self_id.clone(),
                to.clone(),
                offer,
            ))
            .await?;
        Ok(())
    }

    /// Re-run path discovery on the existing link to `participant`
    ///
    /// If the restart cannot even be started the link is closed.
    ///
    /// # Errors
    ///
    /// Returns error if there is no link or the restart offer fails
    #[tracing::instrument(skip(self), fields(participant = %participant))]
    pub async fn restart_ice(&mut self, participant: &ParticipantId) -> Result<(), NegotiationError> {
        let Some(link) = self.registry.link(participant) else {
            return Err(NegotiationError::NoConnection(participant.clone()));
        };

        let restart = async {
            let offer = link.create_offer(true).await?;
            link.set_local_description(offer.clone()).await?;
            self.outbox
                .send(Envelope::offer(
                    self.call_id.clone(),
                    self.self_id.clone(),
                    participant.clone(),
                    offer,
                ))
                .await?;
            Ok::<(), NegotiationError>(())
        };

        let result = restart.await;
        match result {
            Ok(()) => {
                tracing::info!("ICE restart offered");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "ICE restart failed, closing link");
                self.close_failed(participant).await;
                Err(e)
            }
        }
    }

    /// Send fresh offers to peers that gained a sender and report failures
    pub async fn apply_track_update(&mut self, update: TrackUpdate, tracks: &OutgoingTracks) {
        for (participant, e) in update.failures {
            self.report(Some(participant), e);
        }
        for participant in update.renegotiate {
            tracing::debug!(participant = %participant, "Renegotiating for new sender");
            if let Err(e) = self.send_offer(&participant, tracks, false).await {
                self.report(Some(participant), e);
            }
        }
    }

    pub(crate) async fn on_state_change(
        &mut self,
        participant: &ParticipantId,
        link_id: u64,
        state: ConnectionState,
    ) {
        let Some(action) = self.registry.on_state_change(participant, link_id, state) else {
            tracing::trace!(participant = %participant, link_id, "Stale state change");
            return;
        };
        self.emit(CallEvent::ConnectionStateChanged {
            participant: participant.clone(),
            state,
        });

        match action {
            StateAction::Nothing => {}
            StateAction::Removed => {
                // Closed underneath us; only LEFT announces a departure.
                self.roster.remove(participant);
            }
            StateAction::RestartIce => {
                if let Err(e) = self.restart_ice(participant).await {
                    self.report(Some(participant.clone()), e);
                }
            }
            StateAction::Close => {
                tracing::warn!(participant = %participant, "Link did not recover, closing");
                self.close_failed(participant).await;
            }
        }
    }

    pub(crate) async fn on_local_candidate(
        &mut self,
        participant: &ParticipantId,
        link_id: u64,
        candidate: IceCandidate,
    ) {
        if !self.registry.is_current(participant, link_id) {
            return;
        }
        let envelope = Envelope::candidate(
            self.call_id.clone(),
            self.self_id.clone(),
            participant.clone(),
            candidate,
        );
        if let Err(e) = self.outbox.send(envelope).await {
            self.report(Some(participant.clone()), e.into());
        }
    }

    pub(crate) fn on_remote_track(
        &mut self,
        participant: &ParticipantId,
        link_id: u64,
        track: RemoteTrack,
    ) {
        if let Some(stream) = self.registry.add_remote_track(participant, link_id, track) {
            tracing::debug!(participant = %participant, tracks = stream.tracks.len(), "Remote stream updated");
            self.emit(CallEvent::RemoteStream {
                participant: participant.clone(),
                stream,
            });
        }
    }

    /// Announce departure and tear down every link
    pub async fn leave(&mut self) {
        let left = Envelope::left(self.call_id.clone(), self.self_id.clone());
        if let Err(e) = self.outbox.send(left).await {
            tracing::warn!(error = %e, "Failed to announce departure");
        }
        self.registry.close_all().await;
        self.roster.clear();
    }

    /// Close a link that cannot recover and forget the participant
    /// without announcing a departure
    async fn close_failed(&mut self, participant: &ParticipantId) {
        self.roster.remove(participant);
        if self.registry.close(participant).await {
            self.emit(CallEvent::ConnectionStateChanged {
                participant: participant.clone(),
                state: ConnectionState::Closed,
            });
        }
    }

    fn report(&self, participant: Option<ParticipantId>, error: NegotiationError) {
        self.emit(CallEvent::Error {
            participant,
            error: CallError::Negotiation(error),
        });
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
