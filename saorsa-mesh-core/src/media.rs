//! Local media management
//!
//! This module owns the local capture: one camera+microphone stream and,
//! independently, an optional screen-capture stream.
//!
//! # Mute and video-off
//!
//! Muting never removes a track from a peer connection. Each [`LocalTrack`]
//! carries an enabled flag; [`LocalTrack::write_sample`] drops samples while
//! the flag is cleared, so the outgoing sender stays negotiated and the
//! remote side simply stops receiving media.
//!
//! # Screen share
//!
//! Starting a screen share substitutes the screen track on every peer's
//! outgoing video sender (`replace_track`, no renegotiation). Stopping it
//! substitutes the camera track back.

use crate::connection::PlatformEvent;
use crate::registry::{PeerRegistry, TrackUpdate};
use crate::types::{LocalMediaState, MediaKind, TrackSource};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media-related errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The user or platform refused access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// A locally captured track shared by every peer connection
///
/// Cloning is cheap; all clones share the enabled and ended flags.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    ended: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl LocalTrack {
    /// Create a sample-fed track for `source`, grouped into `stream_id`
    ///
    /// Audio uses Opus, camera and screen use VP8 so either can feed the same
    /// sender.
    pub fn new_sample(source: TrackSource, stream_id: &str) -> Self {
        let codec = match source.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
        };
        let prefix = match source {
            TrackSource::Microphone => "audio",
            TrackSource::Camera => "video",
            TrackSource::Screen => "screen",
        };
        let id = format!("{}-{}", prefix, Uuid::new_v4());
        tracing::debug!(track_id = %id, codec = %codec.mime_type, "Creating local track");

        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            id,
            source,
            rtc,
            enabled: Arc::new(AtomicBool::new(true)),
            ended: Arc::new(ended),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Capture source
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Audio or video
    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    /// Underlying WebRTC track
    pub fn rtc_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.rtc
    }

    /// Whether samples are currently forwarded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable the track in place
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Stop the track. Also used by the platform when the user ends a
    /// capture from outside the application (e.g. the OS "stop sharing" bar).
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    /// Whether the track has been stopped
    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the track is stopped
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Feed a captured sample to every peer this track is attached to
    ///
    /// Samples written while the track is disabled or stopped are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the WebRTC track rejects the sample
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(());
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::StreamError(format!("Failed to write sample: {}", e)))
    }
}

/// A captured stream (camera+microphone, or screen)
#[derive(Debug, Clone)]
pub struct LocalStream {
    /// Stream identifier
    pub id: String,
    /// Tracks in the stream
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// First audio track
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Video)
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Platform capture capability
///
/// Acquisition failures are reported as-is; the controller never retries.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// Acquire camera and/or microphone
    async fn user_media(&self, video: bool, audio: bool) -> Result<LocalStream, MediaError>;

    /// Acquire a screen capture
    async fn display_media(&self) -> Result<LocalStream, MediaError>;
}

/// Capture devices whose tracks are fed by the embedding application
///
/// The application encodes frames itself and pushes them with
/// [`LocalTrack::write_sample`].
#[derive(Debug, Clone)]
pub struct SampleCapture {
    /// Microphone present
    pub microphone: bool,
    /// Camera present
    pub camera: bool,
    /// Screen capture permitted
    pub screen: bool,
}

impl Default for SampleCapture {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
            screen: true,
        }
    }
}

#[async_trait]
impl CaptureDevices for SampleCapture {
    async fn user_media(&self, video: bool, audio: bool) -> Result<LocalStream, MediaError> {
        if !video && !audio {
            return Err(MediaError::ConfigError(
                "At least one of audio or video must be requested".to_string(),
            ));
        }
        if audio && !self.microphone {
            return Err(MediaError::DeviceNotFound("microphone".to_string()));
        }
        if video && !self.camera {
            return Err(MediaError::DeviceNotFound("camera".to_string()));
        }

        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if audio {
            tracks.push(LocalTrack::new_sample(TrackSource::Microphone, &stream_id));
        }
        if video {
            tracks.push(LocalTrack::new_sample(TrackSource::Camera, &stream_id));
        }
        Ok(LocalStream {
            id: stream_id,
            tracks,
        })
    }

    async fn display_media(&self) -> Result<LocalStream, MediaError> {
        if !self.screen {
            return Err(MediaError::PermissionDenied("screen capture".to_string()));
        }
        let stream_id = Uuid::new_v4().to_string();
        Ok(LocalStream {
            tracks: vec![LocalTrack::new_sample(TrackSource::Screen, &stream_id)],
            id: stream_id,
        })
    }
}

/// Tracks currently feeding outgoing senders
#[derive(Debug, Clone, Default)]
pub struct OutgoingTracks {
    /// Microphone track
    pub audio: Option<LocalTrack>,
    /// Camera or screen track, whichever is active
    pub video: Option<LocalTrack>,
}

/// Local media controller
///
/// Only this controller mutates local tracks; peer connections merely
/// consume them through their senders.
pub struct LocalMedia {
    devices: Arc<dyn CaptureDevices>,
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
    muted: bool,
    video_enabled: bool,
    screen_watch: Option<tokio::task::JoinHandle<()>>,
    platform_tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl LocalMedia {
    pub(crate) fn new(
        devices: Arc<dyn CaptureDevices>,
        platform_tx: mpsc::UnboundedSender<PlatformEvent>,
    ) -> Self {
        Self {
            devices,
            camera: None,
            screen: None,
            muted: false,
            video_enabled: false,
            screen_watch: None,
            platform_tx,
        }
    }

    /// Acquire camera+microphone and attach the tracks to every live peer
    ///
    /// On failure nothing changes.
    ///
    /// # Errors
    ///
    /// Returns error if capture acquisition fails
    #[tracing::instrument(skip(self, registry))]
    pub async fn initialize(
        &mut self,
        video: bool,
        audio: bool,
        registry: &mut PeerRegistry,
    ) -> Result<TrackUpdate, MediaError> {
        let stream = self.devices.user_media(video, audio).await.map_err(|e| {
            tracing::warn!(error = %e, "Camera/microphone acquisition failed");
            e
        })?;

        if let Some(previous) = self.camera.take() {
            tracing::debug!(stream_id = %previous.id, "Replacing previous capture");
            previous.stop();
        }

        self.muted = stream.audio_track().is_none();
        self.video_enabled = stream.video_track().is_some();
        tracing::info!(
            stream_id = %stream.id,
            audio = !self.muted,
            video = self.video_enabled,
            "Local capture initialized"
        );
        self.camera = Some(stream);

        Ok(registry.attach(&self.outgoing()).await)
    }

    /// Flip the microphone's enabled flag; returns the new muted state
    ///
    /// Without a microphone track the state is left as is.
    pub fn toggle_mute(&mut self) -> bool {
        let Some(track) = self.camera.as_ref().and_then(LocalStream::audio_track) else {
            tracing::debug!(muted = self.muted, "No microphone to toggle");
            return self.muted;
        };
        self.muted = !self.muted;
        track.set_enabled(!self.muted);
        tracing::debug!(muted = self.muted, "Microphone toggled");
        self.muted
    }

    /// Flip the camera's enabled flag; returns the new video-enabled state
    ///
    /// Without a camera track the state is left as is.
    pub fn toggle_video(&mut self) -> bool {
        let Some(track) = self.camera.as_ref().and_then(LocalStream::video_track) else {
            tracing::debug!(video_enabled = self.video_enabled, "No camera to toggle");
            return self.video_enabled;
        };
        self.video_enabled = !self.video_enabled;
        track.set_enabled(self.video_enabled);
        tracing::debug!(video_enabled = self.video_enabled, "Camera toggled");
        self.video_enabled
    }

    /// Start (or restart) a screen share and substitute it on every peer
    ///
    /// # Errors
    ///
    /// Returns error if screen capture acquisition fails
    #[tracing::instrument(skip(self, registry))]
    pub async fn start_screen_share(
        &mut self,
        registry: &mut PeerRegistry,
    ) -> Result<TrackUpdate, MediaError> {
        let stream = self.devices.display_media().await.map_err(|e| {
            tracing::warn!(error = %e, "Screen capture acquisition failed");
            e
        })?;
        let track = match stream.video_track() {
            Some(track) => track.clone(),
            None => {
                stream.stop();
                return Err(MediaError::StreamError(
                    "Screen capture produced no video track".to_string(),
                ));
            }
        };

        self.drop_screen();

        let update = registry.substitute_video(Some(&track)).await;

        let watched = track.clone();
        let tx = self.platform_tx.clone();
        self.screen_watch = Some(tokio::spawn(async move {
            watched.ended().await;
            let _ = tx.send(PlatformEvent::ScreenShareEnded {
                track_id: watched.id().to_string(),
            });
        }));
        tracing::info!(track_id = %track.id(), "Screen share started");
        self.screen = Some(stream);
        Ok(update)
    }

    /// Stop the screen share and restore the camera on every peer
    ///
    /// Returns `None` if no share was active.
    #[tracing::instrument(skip(self, registry))]
    pub async fn stop_screen_share(&mut self, registry: &mut PeerRegistry) -> Option<TrackUpdate> {
        if self.screen.is_none() {
            return None;
        }
        self.drop_screen();

        let camera = self.camera_video().cloned();
        if let Some(track) = &camera {
            track.set_enabled(self.video_enabled);
        }
        tracing::info!(camera_restored = camera.is_some(), "Screen share stopped");
        Some(registry.substitute_video(camera.as_ref()).await)
    }

    /// True if `track_id` is the active screen track
    pub fn is_current_screen(&self, track_id: &str) -> bool {
        self.screen
            .as_ref()
            .and_then(LocalStream::video_track)
            .is_some_and(|t| t.id() == track_id)
    }

    /// Stop every capture and reset the flags
    pub fn stop_all(&mut self) {
        self.drop_screen();
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        self.muted = false;
        self.video_enabled = false;
    }

    /// Tracks that should feed outgoing senders right now
    pub fn outgoing(&self) -> OutgoingTracks {
        let screen = self.screen.as_ref().and_then(LocalStream::video_track);
        OutgoingTracks {
            audio: self
                .camera
                .as_ref()
                .and_then(LocalStream::audio_track)
                .cloned(),
            video: screen.or_else(|| self.camera_video()).cloned(),
        }
    }

    /// Snapshot of the capture flags
    pub fn state(&self) -> LocalMediaState {
        LocalMediaState {
            capturing: self.camera.is_some(),
            muted: self.muted,
            video_enabled: self.video_enabled,
            screen_sharing: self.screen.is_some(),
        }
    }

    /// Camera+microphone stream, if acquired
    pub fn camera_stream(&self) -> Option<&LocalStream> {
        self.camera.as_ref()
    }

    /// Screen stream, if sharing
    pub fn screen_stream(&self) -> Option<&LocalStream> {
        self.screen.as_ref()
    }

    fn camera_video(&self) -> Option<&LocalTrack> {
        self.camera.as_ref().and_then(LocalStream::video_track)
    }

    fn drop_screen(&mut self) {
        if let Some(handle) = self.screen_watch.take() {
            handle.abort();
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if let Some(handle) = self.screen_watch.take() {
            handle.abort();
        }
    }
}
