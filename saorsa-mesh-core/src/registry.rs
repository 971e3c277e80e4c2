//! Peer connection registry
//!
//! Owns exactly one [`PeerLink`] per remote participant. Entries are created
//! lazily by [`PeerRegistry::get_or_create`] and removed exactly once, either
//! explicitly ([`PeerRegistry::close`]) or when the link reports `Closed`.
//!
//! Every link gets a fresh generation number (`link_id`). Platform events
//! carry it, so events from a link that has been replaced are dropped
//! instead of being applied to its successor.

use crate::connection::{PeerConnector, PeerEvents, PeerLink, PlatformEvent, SenderId};
use crate::identity::ParticipantId;
use crate::media::{LocalTrack, OutgoingTracks};
use crate::negotiation::NegotiationError;
use crate::types::{ConnectionState, IceServer, RemoteStream, RemoteTrack};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a link stands after an offer collision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum GlareState {
    /// No collision
    #[default]
    Clear,
    /// Created to answer an offer that collided with ours
    Yielded,
    /// Both sides yielded; the link has no counterpart and is replaced by
    /// the next offer
    AwaitingOffer,
}

/// Registry entry for one remote participant
pub struct PeerEntry {
    /// Remote participant
    pub participant: ParticipantId,
    /// Live link
    pub link: Arc<dyn PeerLink>,
    /// Generation of this link
    pub link_id: u64,
    audio_sender: Option<SenderId>,
    video_sender: Option<SenderId>,
    remote_stream: Option<RemoteStream>,
    pending_restart: Option<ConnectionState>,
    pub(crate) glare: GlareState,
}

impl PeerEntry {
    /// Media received from this participant so far
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Whether a video sender has been negotiated on this link
    pub fn has_video_sender(&self) -> bool {
        self.video_sender.is_some()
    }

    /// Attach the outgoing tracks, reusing existing senders where possible.
    /// Returns true if a new sender was added and the link must renegotiate.
    async fn attach(&mut self, tracks: &OutgoingTracks) -> Result<bool, NegotiationError> {
        let audio = Self::attach_one(&self.link, &mut self.audio_sender, tracks.audio.as_ref()).await?;
        let video = Self::attach_one(&self.link, &mut self.video_sender, tracks.video.as_ref()).await?;
        Ok(audio || video)
    }

    async fn attach_one(
        link: &Arc<dyn PeerLink>,
        sender: &mut Option<SenderId>,
        track: Option<&LocalTrack>,
    ) -> Result<bool, NegotiationError> {
        match (*sender, track) {
            (Some(id), track) => {
                link.replace_track(id, track).await?;
                Ok(false)
            }
            (None, Some(track)) => {
                *sender = Some(link.add_track(track).await?);
                Ok(true)
            }
            (None, None) => Ok(false),
        }
    }
}

/// What the negotiation engine must do after a connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    /// Nothing to do
    Nothing,
    /// Run an in-place ICE restart
    RestartIce,
    /// The link reported `Closed`; its entry is gone
    Removed,
    /// A restart did not recover the link; close it
    Close,
}

/// Outcome of pushing local tracks to every peer
#[derive(Debug, Default)]
pub struct TrackUpdate {
    /// Peers that gained a sender and need a fresh offer
    pub renegotiate: Vec<ParticipantId>,
    /// Peers whose sender could not be updated
    pub failures: Vec<(ParticipantId, NegotiationError)>,
}

/// One link per remote participant
pub struct PeerRegistry {
    connector: Arc<dyn PeerConnector>,
    ice_servers: Vec<IceServer>,
    entries: BTreeMap<ParticipantId, PeerEntry>,
    next_link_id: u64,
    platform_tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl PeerRegistry {
    pub(crate) fn new(
        connector: Arc<dyn PeerConnector>,
        ice_servers: Vec<IceServer>,
        platform_tx: mpsc::UnboundedSender<PlatformEvent>,
    ) -> Self {
        Self {
            connector,
            ice_servers,
            entries: BTreeMap::new(),
            next_link_id: 1,
            platform_tx,
        }
    }

    /// Return the live link for `participant`, creating it if needed
    ///
    /// A new link gets `tracks` attached before it is registered. Calling this
    /// repeatedly for the same participant returns the same link.
    ///
    /// # Errors
    ///
    /// Returns error if the link cannot be created or the tracks cannot be
    /// attached; nothing is registered in that case.
    #[tracing::instrument(skip(self, tracks), fields(participant = %participant))]
    pub async fn get_or_create(
        &mut self,
        participant: &ParticipantId,
        tracks: &OutgoingTracks,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        if let Some(entry) = self.entries.get(participant) {
            return Ok(entry.link.clone());
        }

        let link_id = self.next_link_id;
        self.next_link_id += 1;

        let events = PeerEvents::new(participant.clone(), link_id, self.platform_tx.clone());
        let link = self
            .connector
            .connect(participant, &self.ice_servers, events)
            .await?;

        let mut entry = PeerEntry {
            participant: participant.clone(),
            link: link.clone(),
            link_id,
            audio_sender: None,
            video_sender: None,
            remote_stream: None,
            pending_restart: None,
            glare: GlareState::Clear,
        };
        if let Err(e) = entry.attach(tracks).await {
            tracing::error!(error = %e, "Failed to attach local tracks to new link");
            if let Err(close_err) = link.close().await {
                tracing::debug!(error = %close_err, "Close after failed attach");
            }
            return Err(e);
        }

        tracing::debug!(link_id, "Registered peer link");
        self.entries.insert(participant.clone(), entry);
        Ok(link)
    }

    /// Close and remove the link for `participant`
    ///
    /// Returns false if there was no entry.
    #[tracing::instrument(skip(self), fields(participant = %participant))]
    pub async fn close(&mut self, participant: &ParticipantId) -> bool {
        let Some(entry) = self.entries.remove(participant) else {
            return false;
        };
        if let Err(e) = entry.link.close().await {
            tracing::warn!(error = %e, "Error while closing peer link");
        }
        tracing::debug!(link_id = entry.link_id, "Closed peer link");
        true
    }

    /// Close every link and clear the registry
    pub async fn close_all(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        for (participant, entry) in entries {
            if let Err(e) = entry.link.close().await {
                tracing::warn!(participant = %participant, error = %e, "Error while closing peer link");
            }
        }
    }

    /// Apply a connection state change reported by link `link_id`
    ///
    /// Returns `None` if the event belongs to a link that is no longer
    /// registered.
    ///
    /// A `Disconnected` link gets one restart. A `Failed` link gets one
    /// restart; failing again after that restart closes it.
    pub fn on_state_change(
        &mut self,
        participant: &ParticipantId,
        link_id: u64,
        state: ConnectionState,
    ) -> Option<StateAction> {
        let entry = self
            .entries
            .get_mut(participant)
            .filter(|e| e.link_id == link_id)?;

        let action = match state {
            ConnectionState::New | ConnectionState::Connecting => StateAction::Nothing,
            ConnectionState::Connected => {
                entry.pending_restart = None;
                entry.glare = GlareState::Clear;
                StateAction::Nothing
            }
            ConnectionState::Disconnected => {
                if entry.pending_restart.is_some() {
                    StateAction::Nothing
                } else {
                    entry.pending_restart = Some(ConnectionState::Disconnected);
                    StateAction::RestartIce
                }
            }
            ConnectionState::Failed => {
                if entry.pending_restart == Some(ConnectionState::Failed) {
                    StateAction::Close
                } else {
                    entry.pending_restart = Some(ConnectionState::Failed);
                    StateAction::RestartIce
                }
            }
            ConnectionState::Closed => {
                self.entries.remove(participant);
                StateAction::Removed
            }
        };
        tracing::debug!(participant = %participant, link_id, state = %state, ?action, "Link state change");
        Some(action)
    }

    /// Record a remote track and return the updated stream
    pub fn add_remote_track(
        &mut self,
        participant: &ParticipantId,
        link_id: u64,
        track: RemoteTrack,
    ) -> Option<RemoteStream> {
        let entry = self
            .entries
            .get_mut(participant)
            .filter(|e| e.link_id == link_id)?;
        let stream = entry
            .remote_stream
            .get_or_insert_with(|| RemoteStream::new(participant.clone()));
        stream.upsert(track);
        Some(stream.clone())
    }

    /// Put `track` on every peer's outgoing video sender
    ///
    /// Existing senders are switched in place. Peers without a video sender
    /// get one added and are listed for renegotiation.
    pub async fn substitute_video(&mut self, track: Option<&LocalTrack>) -> TrackUpdate {
        let mut update = TrackUpdate::default();
        for entry in self.entries.values_mut() {
            match PeerEntry::attach_one(&entry.link, &mut entry.video_sender, track).await {
                Ok(true) => update.renegotiate.push(entry.participant.clone()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(participant = %entry.participant, error = %e, "Video substitution failed");
                    update.failures.push((entry.participant.clone(), e));
                }
            }
        }
        update
    }

    /// Put the given tracks on every live peer
    pub async fn attach(&mut self, tracks: &OutgoingTracks) -> TrackUpdate {
        let mut update = TrackUpdate::default();
        for entry in self.entries.values_mut() {
            match entry.attach(tracks).await {
                Ok(true) => update.renegotiate.push(entry.participant.clone()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(participant = %entry.participant, error = %e, "Track attach failed");
                    update.failures.push((entry.participant.clone(), e));
                }
            }
        }
        update
    }

    /// Entry for `participant`
    pub fn get(&self, participant: &ParticipantId) -> Option<&PeerEntry> {
        self.entries.get(participant)
    }

    pub(crate) fn set_glare(&mut self, participant: &ParticipantId, glare: GlareState) {
        if let Some(entry) = self.entries.get_mut(participant) {
            entry.glare = glare;
        }
    }

    /// Live link for `participant`
    pub fn link(&self, participant: &ParticipantId) -> Option<Arc<dyn PeerLink>> {
        self.entries.get(participant).map(|e| e.link.clone())
    }

    /// Check if a link exists for `participant`
    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.entries.contains_key(participant)
    }

    /// True if `link_id` is the current link for `participant`
    pub fn is_current(&self, participant: &ParticipantId, link_id: u64) -> bool {
        self.entries
            .get(participant)
            .is_some_and(|e| e.link_id == link_id)
    }

    /// Number of live links
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no links
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Participants with a live link, in id order
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.entries.keys().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use crate::types::{MediaKind, TrackSource};

    fn registry() -> (PeerRegistry, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        (PeerRegistry::new(connector.clone(), Vec::new(), tx), connector)
    }

    fn camera_tracks() -> OutgoingTracks {
        OutgoingTracks {
            audio: Some(LocalTrack::new_sample(TrackSource::Microphone, "s")),
            video: Some(LocalTrack::new_sample(TrackSource::Camera, "s")),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (mut registry, connector) = registry();
        let bob = ParticipantId::new("bob");
        let a = registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        let b = registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(connector.created().len(), 1);
    }

    #[tokio::test]
    async fn test_new_link_gets_local_tracks() {
        let (mut registry, connector) = registry();
        let bob = ParticipantId::new("bob");
        registry.get_or_create(&bob, &camera_tracks()).await.unwrap();

        let link = connector.link(&bob).unwrap();
        assert_eq!(link.added_tracks().len(), 2);
        assert!(registry.get(&bob).unwrap().has_video_sender());
    }

    #[tokio::test]
    async fn test_failed_attach_registers_nothing() {
        let (mut registry, connector) = registry();
        connector.fail_add_track(true);
        let bob = ParticipantId::new("bob");

        let res = registry.get_or_create(&bob, &camera_tracks()).await;
        assert!(matches!(res, Err(NegotiationError::Track(_))));
        assert!(registry.is_empty());
        assert!(connector.link(&bob).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_allows_recreate() {
        let (mut registry, connector) = registry();
        let bob = ParticipantId::new("bob");
        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        let first_id = registry.get(&bob).unwrap().link_id;

        assert!(registry.close(&bob).await);
        assert!(!registry.close(&bob).await);
        assert!(connector.link(&bob).unwrap().is_closed());

        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        assert_ne!(registry.get(&bob).unwrap().link_id, first_id);
        assert!(!registry.is_current(&bob, first_id));
    }

    #[tokio::test]
    async fn test_restart_policy() {
        let (mut registry, _) = registry();
        let bob = ParticipantId::new("bob");
        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        let id = registry.get(&bob).unwrap().link_id;

        assert_eq!(
            registry.on_state_change(&bob, id, ConnectionState::Disconnected),
            Some(StateAction::RestartIce)
        );
        // Restart already in flight.
        assert_eq!(
            registry.on_state_change(&bob, id, ConnectionState::Disconnected),
            Some(StateAction::Nothing)
        );
        assert_eq!(
            registry.on_state_change(&bob, id, ConnectionState::Failed),
            Some(StateAction::RestartIce)
        );
        assert_eq!(
            registry.on_state_change(&bob, id, ConnectionState::Failed),
            Some(StateAction::Close)
        );
    }

    #[tokio::test]
    async fn test_connected_clears_pending_restart() {
        let (mut registry, _) = registry();
        let bob = ParticipantId::new("bob");
        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        let id = registry.get(&bob).unwrap().link_id;

        registry.on_state_change(&bob, id, ConnectionState::Failed);
        registry.on_state_change(&bob, id, ConnectionState::Connected);
        assert_eq!(
            registry.on_state_change(&bob, id, ConnectionState::Failed),
            Some(StateAction::RestartIce)
        );
    }

    #[tokio::test]
    async fn test_connected_clears_glare_mark() {
        let (mut registry, _) = registry();
        let bob = ParticipantId::new("bob");
        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        let id = registry.get(&bob).unwrap().link_id;

        registry.set_glare(&bob, GlareState::Yielded);
        assert_eq!(registry.get(&bob).unwrap().glare, GlareState::Yielded);
        registry.on_state_change(&bob, id, ConnectionState::Connected);
        assert_eq!(registry.get(&bob).unwrap().glare, GlareState::Clear);
    }

    #[tokio::test]
    async fn test_closed_state_removes_entry_and_stale_events_are_ignored() {
        let (mut registry, _) = registry();
        let bob = ParticipantId::new("bob");
        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        let id = registry.get(&bob).unwrap().link_id;

        assert_eq!(registry.on_state_change(&bob, id + 100, ConnectionState::Closed), None);
        assert!(registry.contains(&bob));
        assert_eq!(
            registry.on_state_change(&bob, id, ConnectionState::Closed),
            Some(StateAction::Removed)
        );
        assert!(!registry.contains(&bob));
    }

    #[tokio::test]
    async fn test_remote_tracks_accumulate() {
        let (mut registry, _) = registry();
        let bob = ParticipantId::new("bob");
        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        let id = registry.get(&bob).unwrap().link_id;

        let track = |id: &str, kind| RemoteTrack {
            id: id.to_string(),
            stream_id: "bob-stream".to_string(),
            kind,
            track: None,
        };
        registry.add_remote_track(&bob, id, track("a", MediaKind::Audio)).unwrap();
        let stream = registry
            .add_remote_track(&bob, id, track("v", MediaKind::Video))
            .unwrap();
        assert!(stream.has_audio() && stream.has_video());
        assert!(registry.add_remote_track(&bob, id + 1, track("x", MediaKind::Video)).is_none());

        registry.close(&bob).await;
        registry.get_or_create(&bob, &OutgoingTracks::default()).await.unwrap();
        assert!(registry.get(&bob).unwrap().remote_stream().is_none());
    }

    #[tokio::test]
    async fn test_substitute_video_replaces_or_adds() {
        let (mut registry, connector) = registry();
        let bob = ParticipantId::new("bob");
        let carol = ParticipantId::new("carol");
        registry.get_or_create(&bob, &camera_tracks()).await.unwrap();
        registry.get_or_create(&carol, &OutgoingTracks::default()).await.unwrap();

        let screen = LocalTrack::new_sample(TrackSource::Screen, "screen");
        let update = registry.substitute_video(Some(&screen)).await;

        assert_eq!(update.renegotiate, vec![carol.clone()]);
        assert!(update.failures.is_empty());
        assert_eq!(connector.link(&bob).unwrap().replace_count(), 1);
        assert_eq!(connector.link(&carol).unwrap().added_tracks().len(), 1);
    }
}
