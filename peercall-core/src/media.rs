//! Local media acquisition and live track control
//!
//! This module owns everything about the local capture side of a call.
//!
//! # Architecture
//!
//! The [`DeviceSource`] trait abstracts platform capture: enumerating
//! devices and opening tracks on them. [`SyntheticDeviceSource`] implements
//! it with in-memory fake devices so the whole call stack runs without
//! hardware; real integrations plug in at the same seam.
//!
//! Each call session owns one [`MediaController`], which in turn owns the
//! [`LocalMediaStream`] for the active call. Mid-call control (mute, camera
//! switch) goes through the controller so track state and any live peer
//! connection stay consistent.

use crate::peer_connection::PeerConnectionHandle;
use crate::types::{MediaConstraints, MediaType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Capture could not be started
    #[error("Acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No stream is active for this call
    #[error("No active media stream")]
    NoActiveStream,

    /// Track operation failed
    #[error("Track error: {0}")]
    TrackError(String),
}

/// Which way a camera points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacingMode {
    /// Toward the user
    User,
    /// Away from the user
    Environment,
}

impl FacingMode {
    /// The other direction
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Environment => write!(f, "environment"),
        }
    }
}

/// Capture settings applied when opening devices
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Requested frame width
    pub width: u32,
    /// Requested frame height
    pub height: u32,
    /// Requested frame rate
    pub frame_rate: u32,
    /// Enable acoustic echo cancellation
    pub echo_cancellation: bool,
    /// Enable noise suppression
    pub noise_suppression: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Video device
#[derive(Debug, Clone)]
pub struct VideoDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
    /// Which way the camera points, when the platform reports it
    pub facing: Option<FacingMode>,
}

// ============================================================================
// Tracks and Streams
// ============================================================================

/// One live capture track
///
/// `enabled` is the mute flag: a disabled track keeps its device open but
/// sends silence. `stop` releases the device and is permanent.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    media_type: MediaType,
    device_id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    /// Create an enabled track capturing from the given device
    #[must_use]
    pub fn new(media_type: MediaType, device_id: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", media_type, Uuid::new_v4()),
            media_type,
            device_id: device_id.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind of media this track carries
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Device the track captures from
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the track is currently producing media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable the track without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Release the capture device. Returns `true` only for the call that
    /// actually stopped the track, so teardown paths can count real stops.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::Relaxed)
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

// Ensure MediaTrack is Send + Sync at compile time
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<MediaTrack>();
};

/// The local media stream for one call
#[derive(Debug, Default)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalMediaStream {
    /// Create an empty stream
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: format!("stream-{}", Uuid::new_v4()),
            tracks: Vec::new(),
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a track to the stream
    pub fn add_track(&mut self, track: Arc<MediaTrack>) {
        self.tracks.push(track);
    }

    /// All tracks in the stream
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// All audio tracks
    pub fn audio_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .iter()
            .filter(|t| t.media_type() == MediaType::Audio)
            .cloned()
            .collect()
    }

    /// All video tracks, screen shares included
    pub fn video_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .iter()
            .filter(|t| t.media_type() != MediaType::Audio)
            .cloned()
            .collect()
    }

    /// Remove and return the first track of the given kind
    pub fn take_track(&mut self, media_type: MediaType) -> Option<Arc<MediaTrack>> {
        let index = self
            .tracks
            .iter()
            .position(|t| t.media_type() == media_type)?;
        Some(self.tracks.remove(index))
    }

    /// Stop every track, returning how many this call actually stopped
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Media events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Stream started
    StreamStarted {
        /// Stream identifier
        stream_id: String,
    },
    /// Stream stopped
    StreamStopped {
        /// Stream identifier
        stream_id: String,
    },
    /// An outbound track was swapped for another
    TrackReplaced {
        /// Track that stopped sending
        old_track_id: String,
        /// Track now sending
        new_track_id: String,
    },
    /// Local mute state changed
    MuteToggled {
        /// New mute state
        muted: bool,
    },
}

// ============================================================================
// Device Sources
// ============================================================================

/// Capture device abstraction
///
/// Implementations enumerate the devices the platform offers and open live
/// tracks on them.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// List available audio capture devices
    async fn enumerate_audio(&self) -> Result<Vec<AudioDevice>, MediaError>;

    /// List available video capture devices
    async fn enumerate_video(&self) -> Result<Vec<VideoDevice>, MediaError>;

    /// Open an audio capture track on the given device
    async fn open_audio(
        &self,
        device_id: &str,
        settings: &CaptureSettings,
    ) -> Result<Arc<MediaTrack>, MediaError>;

    /// Open a video capture track on the given device
    async fn open_video(
        &self,
        device_id: &str,
        settings: &CaptureSettings,
    ) -> Result<Arc<MediaTrack>, MediaError>;
}

/// In-memory device source with fake devices
///
/// Ships one audio device and a front/rear camera pair so call flows,
/// including camera switching, run end to end without hardware.
pub struct SyntheticDeviceSource {
    audio: Vec<AudioDevice>,
    video: Vec<VideoDevice>,
    deny: AtomicBool,
    opens: AtomicU32,
    opened: Mutex<Vec<Arc<MediaTrack>>>,
}

impl SyntheticDeviceSource {
    /// Create a source with the default fake devices
    #[must_use]
    pub fn new() -> Self {
        Self::with_devices(
            vec![AudioDevice {
                id: "default-audio".to_string(),
                name: "Default Audio Device".to_string(),
            }],
            vec![
                VideoDevice {
                    id: "front-camera".to_string(),
                    name: "Front Camera".to_string(),
                    facing: Some(FacingMode::User),
                },
                VideoDevice {
                    id: "rear-camera".to_string(),
                    name: "Rear Camera".to_string(),
                    facing: Some(FacingMode::Environment),
                },
            ],
        )
    }

    /// Create a source with explicit devices
    #[must_use]
    pub fn with_devices(audio: Vec<AudioDevice>, video: Vec<VideoDevice>) -> Self {
        Self {
            audio,
            video,
            deny: AtomicBool::new(false),
            opens: AtomicU32::new(0),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent open fail, as a revoked capture permission
    /// would
    pub fn deny_acquisition(&self, deny: bool) {
        self.deny.store(deny, Ordering::Relaxed);
    }

    /// How many tracks were opened over the source's lifetime
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Every track this source ever opened, in open order
    pub async fn opened_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.opened.lock().await.clone()
    }

    async fn open(
        &self,
        media_type: MediaType,
        device_id: &str,
    ) -> Result<Arc<MediaTrack>, MediaError> {
        if self.deny.load(Ordering::Relaxed) {
            return Err(MediaError::AcquisitionFailed(
                "Capture permission denied".to_string(),
            ));
        }
        let track = Arc::new(MediaTrack::new(media_type, device_id));
        self.opens.fetch_add(1, Ordering::Relaxed);
        self.opened.lock().await.push(Arc::clone(&track));
        Ok(track)
    }
}

impl Default for SyntheticDeviceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceSource for SyntheticDeviceSource {
    async fn enumerate_audio(&self) -> Result<Vec<AudioDevice>, MediaError> {
        Ok(self.audio.clone())
    }

    async fn enumerate_video(&self) -> Result<Vec<VideoDevice>, MediaError> {
        Ok(self.video.clone())
    }

    async fn open_audio(
        &self,
        device_id: &str,
        _settings: &CaptureSettings,
    ) -> Result<Arc<MediaTrack>, MediaError> {
        if !self.audio.iter().any(|d| d.id == device_id) {
            return Err(MediaError::DeviceNotFound(device_id.to_string()));
        }
        self.open(MediaType::Audio, device_id).await
    }

    async fn open_video(
        &self,
        device_id: &str,
        _settings: &CaptureSettings,
    ) -> Result<Arc<MediaTrack>, MediaError> {
        if !self.video.iter().any(|d| d.id == device_id) {
            return Err(MediaError::DeviceNotFound(device_id.to_string()));
        }
        self.open(MediaType::Video, device_id).await
    }
}

// ============================================================================
// Media Controller
// ============================================================================

/// Owns the local media stream for one call session
///
/// Acquisition is all or nothing: when any requested track cannot be
/// opened, everything already opened is stopped and the error surfaces, so
/// a failed call never leaves a device captured.
pub struct MediaController {
    source: Arc<dyn DeviceSource>,
    settings: CaptureSettings,
    stream: RwLock<Option<LocalMediaStream>>,
    facing: RwLock<FacingMode>,
    video_device: RwLock<Option<String>>,
    muted: AtomicBool,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaController {
    /// Create a controller over the given device source
    #[must_use]
    pub fn new(source: Arc<dyn DeviceSource>, settings: CaptureSettings) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            source,
            settings,
            stream: RwLock::new(None),
            facing: RwLock::new(FacingMode::User),
            video_device: RwLock::new(None),
            muted: AtomicBool::new(false),
            event_sender,
        }
    }

    /// Subscribe to media events
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }

    /// Whether a stream is currently active
    pub async fn has_stream(&self) -> bool {
        self.stream.read().await.is_some()
    }

    /// Whether local audio is muted
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// The camera direction currently preferred
    pub async fn current_facing(&self) -> FacingMode {
        *self.facing.read().await
    }

    /// Acquire capture devices per the constraints and build the stream
    ///
    /// Returns the opened tracks so they can be attached to a peer
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns error if any requested device is missing or refuses to open.
    /// Tracks opened before the failure are stopped.
    #[tracing::instrument(skip(self, constraints), fields(audio = constraints.has_audio(), video = constraints.has_video()))]
    pub async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, MediaError> {
        let mut guard = self.stream.write().await;
        if let Some(stale) = guard.take() {
            tracing::warn!(stream_id = %stale.id(), "Releasing stale stream before acquiring");
            stale.stop_all();
        }

        let mut stream = LocalMediaStream::new();

        if constraints.has_audio() {
            if let Err(e) = self.acquire_audio(&mut stream).await {
                stream.stop_all();
                return Err(e);
            }
        }

        if constraints.has_video() {
            if let Err(e) = self.acquire_video(&mut stream).await {
                stream.stop_all();
                return Err(e);
            }
        }

        let tracks = stream.tracks().to_vec();
        tracing::info!(
            stream_id = %stream.id(),
            track_count = tracks.len(),
            "Local media stream acquired"
        );
        let _ = self.event_sender.send(MediaEvent::StreamStarted {
            stream_id: stream.id().to_string(),
        });

        self.muted.store(false, Ordering::Relaxed);
        *guard = Some(stream);
        Ok(tracks)
    }

    /// Toggle the microphone, returning the new mute state
    ///
    /// Flips `enabled` on every audio track. When a live connection is
    /// given, its audio sender is re-pointed at the current track as well,
    /// covering senders left holding a stale track by an earlier
    /// replacement.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveStream` without a stream, or `TrackError` if the
    /// sender replacement fails.
    #[tracing::instrument(skip(self, connection))]
    pub async fn toggle_mute(
        &self,
        connection: Option<&PeerConnectionHandle>,
    ) -> Result<bool, MediaError> {
        let guard = self.stream.read().await;
        let stream = guard.as_ref().ok_or(MediaError::NoActiveStream)?;

        let muted = !self.muted.load(Ordering::Relaxed);
        let audio_tracks = stream.audio_tracks();
        for track in &audio_tracks {
            track.set_enabled(!muted);
        }
        self.muted.store(muted, Ordering::Relaxed);

        if let Some(connection) = connection {
            for track in &audio_tracks {
                connection
                    .replace_outbound_track(MediaType::Audio, track)
                    .await
                    .map_err(|e| MediaError::TrackError(e.to_string()))?;
            }
        }

        tracing::debug!(muted, "Toggled microphone");
        let _ = self.event_sender.send(MediaEvent::MuteToggled { muted });
        Ok(muted)
    }

    /// Switch to the next camera, returning the new device ID
    ///
    /// Tries the camera facing the opposite direction first; when facing
    /// information is missing or that open fails, falls back to the next
    /// device in enumeration order. The swap is ordered so the call never
    /// loses video: the new track starts sending before the old one is
    /// removed and stopped, and any failure leaves the old track running.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` when no alternate camera exists,
    /// `TrackError` when the sender refuses the replacement, or the open
    /// failure of the chosen device.
    #[tracing::instrument(skip(self, connection))]
    pub async fn switch_camera(
        &self,
        connection: Option<&PeerConnectionHandle>,
    ) -> Result<String, MediaError> {
        let (old_track, current_device) = {
            let guard = self.stream.read().await;
            let stream = guard.as_ref().ok_or(MediaError::NoActiveStream)?;
            let old = stream
                .video_tracks()
                .into_iter()
                .next()
                .ok_or_else(|| MediaError::TrackError("No active video track".to_string()))?;
            let device = old.device_id().to_string();
            (old, device)
        };

        let target = self.facing.read().await.opposite();
        let devices = self.source.enumerate_video().await?;
        let new_track = self
            .open_switch_target(&devices, &current_device, target)
            .await?;
        let new_device = new_track.device_id().to_string();
        let new_facing = devices
            .iter()
            .find(|d| d.id == new_device)
            .and_then(|d| d.facing)
            .unwrap_or(target);

        if let Some(connection) = connection {
            if let Err(e) = connection
                .replace_outbound_track(MediaType::Video, &new_track)
                .await
            {
                new_track.stop();
                return Err(MediaError::TrackError(e.to_string()));
            }
        }

        {
            let mut guard = self.stream.write().await;
            let Some(stream) = guard.as_mut() else {
                new_track.stop();
                return Err(MediaError::NoActiveStream);
            };
            stream.take_track(old_track.media_type());
            stream.add_track(Arc::clone(&new_track));
        }
        old_track.stop();

        *self.facing.write().await = new_facing;
        *self.video_device.write().await = Some(new_device.clone());

        tracing::info!(
            old_device = %current_device,
            new_device = %new_device,
            facing = %new_facing,
            "Switched camera"
        );
        let _ = self.event_sender.send(MediaEvent::TrackReplaced {
            old_track_id: old_track.id().to_string(),
            new_track_id: new_track.id().to_string(),
        });
        Ok(new_device)
    }

    /// Stop every track and drop the stream, returning how many tracks
    /// this call actually stopped
    ///
    /// Idempotent: a second release finds nothing and returns zero.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self) -> usize {
        let taken = self.stream.write().await.take();
        match taken {
            Some(stream) => {
                let stopped = stream.stop_all();
                tracing::debug!(stream_id = %stream.id(), stopped, "Released media stream");
                let _ = self.event_sender.send(MediaEvent::StreamStopped {
                    stream_id: stream.id().to_string(),
                });
                stopped
            }
            None => 0,
        }
    }

    /// Stop the given tracks, dropping the stream as well when it is the
    /// one they belong to
    ///
    /// An acquisition whose call went away cleans up with this instead of
    /// [`release`](Self::release): a stream acquired by a later call is
    /// left untouched. Returns how many tracks this call actually stopped.
    #[tracing::instrument(skip(self, tracks))]
    pub async fn release_tracks(&self, tracks: &[Arc<MediaTrack>]) -> usize {
        let mut guard = self.stream.write().await;
        let holds_any = guard.as_ref().is_some_and(|stream| {
            stream
                .tracks()
                .iter()
                .any(|held| tracks.iter().any(|track| Arc::ptr_eq(held, track)))
        });
        if !holds_any {
            drop(guard);
            // Already displaced from the controller, stop stragglers only
            return tracks.iter().filter(|track| track.stop()).count();
        }
        match guard.take() {
            Some(stream) => {
                drop(guard);
                let stopped = stream.stop_all();
                tracing::debug!(stream_id = %stream.id(), stopped, "Released media stream");
                let _ = self.event_sender.send(MediaEvent::StreamStopped {
                    stream_id: stream.id().to_string(),
                });
                stopped
            }
            None => 0,
        }
    }

    async fn acquire_audio(&self, stream: &mut LocalMediaStream) -> Result<(), MediaError> {
        let devices = self.source.enumerate_audio().await?;
        let device = devices
            .first()
            .ok_or_else(|| MediaError::DeviceNotFound("No audio capture device".to_string()))?;
        let track = self.source.open_audio(&device.id, &self.settings).await?;
        stream.add_track(track);
        Ok(())
    }

    async fn acquire_video(&self, stream: &mut LocalMediaStream) -> Result<(), MediaError> {
        let devices = self.source.enumerate_video().await?;
        let facing = *self.facing.read().await;
        let device = devices
            .iter()
            .find(|d| d.facing == Some(facing))
            .or_else(|| devices.first())
            .ok_or_else(|| MediaError::DeviceNotFound("No video capture device".to_string()))?;
        let track = self.source.open_video(&device.id, &self.settings).await?;
        *self.video_device.write().await = Some(device.id.clone());
        stream.add_track(track);
        Ok(())
    }

    /// Pick and open the camera to switch to: opposite facing first, then
    /// the next device in enumeration order
    async fn open_switch_target(
        &self,
        devices: &[VideoDevice],
        current_device: &str,
        target: FacingMode,
    ) -> Result<Arc<MediaTrack>, MediaError> {
        if let Some(device) = devices
            .iter()
            .find(|d| d.facing == Some(target) && d.id != current_device)
        {
            match self.source.open_video(&device.id, &self.settings).await {
                Ok(track) => return Ok(track),
                Err(e) => {
                    tracing::warn!(
                        device = %device.id,
                        error = %e,
                        "Facing-mode camera failed to open, falling back to enumeration"
                    );
                }
            }
        }

        let current_index = devices.iter().position(|d| d.id == current_device);
        let next = match current_index {
            Some(index) if !devices.is_empty() => &devices[(index + 1) % devices.len()],
            _ => devices
                .first()
                .ok_or_else(|| MediaError::DeviceNotFound("No video capture device".to_string()))?,
        };
        if next.id == current_device {
            return Err(MediaError::DeviceNotFound(
                "No alternate camera".to_string(),
            ));
        }
        self.source.open_video(&next.id, &self.settings).await
    }
}
