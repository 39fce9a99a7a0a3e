//! Local media acquisition and track lifecycle
//!
//! This module handles camera, microphone and screen-capture streams.
//!
//! # Architecture
//!
//! The module provides a `MediaDevices` trait that abstracts the platform
//! capture layer:
//! - `VirtualMediaDevices` - in-process synthetic devices with scriptable
//!   failures (tests, demos, headless hosts)
//!
//! `MediaDeviceManager` sits on top of a backend and owns the acquire/release
//! bookkeeping. Tracks are shared handles: cloning a `MediaTrack` or a
//! `MediaStream` refers to the same underlying capture, never a duplicate.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused capture access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture hardware
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The platform has no such capture capability
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The user dismissed the capture picker
    #[error("Capture cancelled by user")]
    UserCancelled,
}

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Where a track's media comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSource {
    /// Local microphone
    Microphone,
    /// Local camera
    Camera,
    /// Local screen, window or tab capture
    Screen,
    /// Received from the remote party
    Remote,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    live: AtomicBool,
    ended: watch::Sender<bool>,
}

/// A single audio or video track
///
/// Disabling a track mutes it while keeping the device reserved; stopping it
/// releases the device for good.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                ended,
            }),
        }
    }

    /// Create a track representing inbound remote media
    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::new(id, kind, TrackSource::Remote)
    }

    /// Track id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Capture source
    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    /// Whether media flows (not muted)
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track still holds its device
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop the track and release its device
    ///
    /// Application-initiated; does not fire the ended notification.
    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }

    /// End the track from outside the application
    ///
    /// Models the platform tearing the capture down (e.g. the browser's
    /// "stop sharing" button or an unplugged camera). Fires [`Self::ended`].
    pub fn end(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
        self.inner.ended.send_replace(true);
    }

    /// Resolve once the platform has ended this track
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

/// A container of tracks
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &*self.tracks.read())
            .finish()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl MediaStream {
    /// Create a stream from tracks
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(tracks)),
        }
    }

    /// Create an empty stream with a random id
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Uuid::new_v4().to_string(), Vec::new())
    }

    /// Stream id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the tracks
    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.read().clone()
    }

    /// Number of tracks
    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }

    /// Tracks of one kind
    #[must_use]
    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// First video track, if any
    #[must_use]
    pub fn video_track(&self) -> Option<MediaTrack> {
        self.tracks_of(TrackKind::Video).into_iter().next()
    }

    /// Append a track unless one with the same id is present
    pub fn add_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    /// Remove a track by id
    pub fn remove_track(&self, track_id: &str) -> Option<MediaTrack> {
        let mut tracks = self.tracks.write();
        let pos = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(pos))
    }

    /// Swap one track for another in place, keeping track order
    pub fn replace_track(&self, old_id: &str, new: MediaTrack) -> Option<MediaTrack> {
        let mut tracks = self.tracks.write();
        let slot = tracks.iter_mut().find(|t| t.id() == old_id)?;
        Some(std::mem::replace(slot, new))
    }

    /// Whether any track still holds a device
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.tracks.read().iter().any(MediaTrack::is_live)
    }
}

/// Media events
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A capture stream was acquired
    StreamAcquired {
        /// Stream id
        stream_id: String,
    },
    /// A capture stream was released
    StreamReleased {
        /// Stream id
        stream_id: String,
    },
    /// A track was muted or unmuted
    TrackToggled {
        /// Track id
        track_id: String,
        /// New enabled flag
        enabled: bool,
    },
}

/// Platform capture backend
///
/// Implement this over the host's camera/microphone/screen APIs.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open camera and microphone as one stream
    async fn camera_and_microphone(&self) -> Result<MediaStream, MediaError>;

    /// Open a fresh camera track
    async fn camera(&self) -> Result<MediaTrack, MediaError>;

    /// Open a screen, window or tab capture
    async fn screen(&self) -> Result<MediaStream, MediaError>;
}

/// Media device manager
///
/// Acquires and releases local streams and toggles their tracks.
pub struct MediaDeviceManager {
    devices: Arc<dyn MediaDevices>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaDeviceManager {
    /// Create a manager over a capture backend
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices,
            event_sender,
        }
    }

    /// Request camera and microphone access
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if the platform
    /// refuses or lacks hardware
    #[tracing::instrument(skip(self))]
    pub async fn acquire_camera_and_mic(&self) -> Result<MediaStream, MediaError> {
        tracing::debug!("Requesting camera and microphone");
        let stream = self.devices.camera_and_microphone().await.map_err(|e| {
            tracing::warn!(error = %e, "Camera/microphone acquisition failed");
            e
        })?;
        tracing::info!(
            stream_id = %stream.id(),
            tracks = stream.track_count(),
            "Camera and microphone acquired"
        );
        let _ = self.event_sender.send(MediaEvent::StreamAcquired {
            stream_id: stream.id().to_string(),
        });
        Ok(stream)
    }

    /// Request a fresh camera track
    ///
    /// # Errors
    ///
    /// Returns error if the camera cannot be opened
    pub async fn acquire_camera(&self) -> Result<MediaTrack, MediaError> {
        let track = self.devices.camera().await?;
        tracing::debug!(track_id = %track.id(), "Camera re-acquired");
        Ok(track)
    }

    /// Request screen capture
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if the platform cannot capture the screen and
    /// `UserCancelled` if the picker was dismissed
    #[tracing::instrument(skip(self))]
    pub async fn acquire_screen(&self) -> Result<MediaStream, MediaError> {
        tracing::debug!("Requesting screen capture");
        let stream = self.devices.screen().await?;
        tracing::info!(stream_id = %stream.id(), "Screen capture acquired");
        let _ = self.event_sender.send(MediaEvent::StreamAcquired {
            stream_id: stream.id().to_string(),
        });
        Ok(stream)
    }

    /// Stop every track of a stream. Idempotent.
    pub fn release(&self, stream: &MediaStream) {
        let mut stopped = 0usize;
        for track in stream.tracks() {
            if track.is_live() {
                track.stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            tracing::debug!(stream_id = %stream.id(), stopped, "Stream released");
            let _ = self.event_sender.send(MediaEvent::StreamReleased {
                stream_id: stream.id().to_string(),
            });
        }
    }

    /// Enable or disable every track of `kind` in `stream`
    ///
    /// Returns `true` if at least one track matched.
    pub fn toggle_track(&self, stream: &MediaStream, kind: TrackKind, enabled: bool) -> bool {
        let tracks = stream.tracks_of(kind);
        for track in &tracks {
            track.set_enabled(enabled);
            let _ = self.event_sender.send(MediaEvent::TrackToggled {
                track_id: track.id().to_string(),
                enabled,
            });
        }
        tracing::debug!(?kind, enabled, matched = tracks.len(), "Tracks toggled");
        !tracks.is_empty()
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }
}

// ============================================================================
// Virtual devices
// ============================================================================

/// What the screen picker does when asked for a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScreenPicker {
    /// User picks a screen
    #[default]
    Accept,
    /// User dismisses the picker
    Cancel,
    /// Platform refuses capture
    Deny,
}

/// Behaviour of [`VirtualMediaDevices`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDeviceConfig {
    /// Camera and microphone exist
    pub hardware_present: bool,
    /// Capture permission is granted
    pub permission_granted: bool,
    /// Screen capture is available on this platform
    pub screen_capture_supported: bool,
    /// Picker outcome
    pub screen_picker: ScreenPicker,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            hardware_present: true,
            permission_granted: true,
            screen_capture_supported: true,
            screen_picker: ScreenPicker::Accept,
        }
    }
}

/// Synthetic capture devices
///
/// Every acquired track is remembered so callers can check that nothing
/// leaks.
#[derive(Default)]
pub struct VirtualMediaDevices {
    config: Mutex<VirtualDeviceConfig>,
    issued: Mutex<Vec<MediaTrack>>,
}

impl VirtualMediaDevices {
    /// Devices that grant everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices with a specific behaviour
    #[must_use]
    pub fn with_config(config: VirtualDeviceConfig) -> Self {
        Self {
            config: Mutex::new(config),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Change behaviour at runtime
    pub fn update(&self, f: impl FnOnce(&mut VirtualDeviceConfig)) {
        f(&mut self.config.lock());
    }

    /// All tracks handed out so far
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().clone()
    }

    /// Tracks handed out and not yet stopped
    #[must_use]
    pub fn live_tracks(&self) -> Vec<MediaTrack> {
        self.issued
            .lock()
            .iter()
            .filter(|t| t.is_live())
            .cloned()
            .collect()
    }

    fn check_camera_access(&self) -> Result<(), MediaError> {
        let config = self.config.lock();
        if !config.permission_granted {
            return Err(MediaError::PermissionDenied(
                "camera/microphone access denied".to_string(),
            ));
        }
        if !config.hardware_present {
            return Err(MediaError::DeviceUnavailable(
                "no camera or microphone found".to_string(),
            ));
        }
        Ok(())
    }

    fn issue(&self, kind: TrackKind, source: TrackSource) -> MediaTrack {
        let prefix = match source {
            TrackSource::Microphone => "mic",
            TrackSource::Camera => "camera",
            TrackSource::Screen => "screen",
            TrackSource::Remote => "remote",
        };
        let track = MediaTrack::new(format!("{}-{}", prefix, Uuid::new_v4()), kind, source);
        self.issued.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for VirtualMediaDevices {
    async fn camera_and_microphone(&self) -> Result<MediaStream, MediaError> {
        self.check_camera_access()?;
        let audio = self.issue(TrackKind::Audio, TrackSource::Microphone);
        let video = self.issue(TrackKind::Video, TrackSource::Camera);
        Ok(MediaStream::new(
            format!("local-{}", Uuid::new_v4()),
            vec![audio, video],
        ))
    }

    async fn camera(&self) -> Result<MediaTrack, MediaError> {
        self.check_camera_access()?;
        Ok(self.issue(TrackKind::Video, TrackSource::Camera))
    }

    async fn screen(&self) -> Result<MediaStream, MediaError> {
        let (supported, picker) = {
            let config = self.config.lock();
            (config.screen_capture_supported, config.screen_picker)
        };
        if !supported {
            return Err(MediaError::NotSupported(
                "screen capture unavailable".to_string(),
            ));
        }
        match picker {
            ScreenPicker::Cancel => Err(MediaError::UserCancelled),
            ScreenPicker::Deny => Err(MediaError::PermissionDenied(
                "screen capture denied".to_string(),
            )),
            ScreenPicker::Accept => {
                let video = self.issue(TrackKind::Video, TrackSource::Screen);
                Ok(MediaStream::new(
                    format!("screen-{}", Uuid::new_v4()),
                    vec![video],
                ))
            }
        }
    }
}
