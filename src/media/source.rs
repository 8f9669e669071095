use crate::errors::DeviceError;
use crate::media::devices::{diff_devices, CaptureBackend, DeviceEvent};
use crate::media::MediaConstraints;
use crate::types::{DeviceDescriptor, DeviceKind, MediaStream, TrackKind};
use serde::Serialize;
use std::sync::Arc;

/// Observable state of the local capture
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaSourceState {
    pub capture_stream: Option<MediaStream>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub audio_devices: Vec<DeviceDescriptor>,
    pub video_devices: Vec<DeviceDescriptor>,
    pub selected_audio: Option<DeviceDescriptor>,
    pub selected_video: Option<DeviceDescriptor>,
}

impl Default for MediaSourceState {
    fn default() -> Self {
        Self {
            capture_stream: None,
            audio_enabled: true,
            video_enabled: true,
            audio_devices: Vec::new(),
            video_devices: Vec::new(),
            selected_audio: None,
            selected_video: None,
        }
    }
}

/// Owner of the local camera/microphone capture.
///
/// At most one capture stream is held at a time; every replaced track is
/// stopped before it is dropped.
pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    state: MediaSourceState,
    enumerated: bool,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            state: MediaSourceState::default(),
            enumerated: false,
        }
    }

    pub fn state(&self) -> &MediaSourceState {
        &self.state
    }

    pub fn capture_stream(&self) -> Option<&MediaStream> {
        self.state.capture_stream.as_ref()
    }

    /// True when a capture stream exists and still has a live track
    pub fn has_live_capture(&self) -> bool {
        self.state
            .capture_stream
            .as_ref()
            .is_some_and(MediaStream::is_active)
    }

    /// Enumerate devices and acquire capture with `defaults`, preferring the
    /// selected devices.
    pub async fn initialize(&mut self, defaults: &MediaConstraints) -> Result<&MediaStream, DeviceError> {
        self.enumerate_devices().await?;

        let constraints = defaults
            .clone()
            .prefer_device(
                DeviceKind::AudioInput,
                self.state.selected_audio.as_ref().map(|d| d.id.as_str()),
            )
            .prefer_device(
                DeviceKind::VideoInput,
                self.state.selected_video.as_ref().map(|d| d.id.as_str()),
            );

        self.acquire(&constraints).await?;

        // Labels may only become visible once permission has been granted.
        if let Err(e) = self.enumerate_devices().await {
            log::warn!("Device enumeration after capture failed: {}", e);
        }

        self.state
            .capture_stream
            .as_ref()
            .ok_or_else(|| DeviceError::Backend("capture stream vanished".to_string()))
    }

    /// Replace the capture stream with one matching `constraints`.
    ///
    /// The previous stream is stopped before the request is made, so on failure
    /// no capture is held.
    pub async fn acquire(&mut self, constraints: &MediaConstraints) -> Result<&MediaStream, DeviceError> {
        if !constraints.requests_any() {
            return Err(DeviceError::NotFound(
                "neither audio nor video requested".to_string(),
            ));
        }

        self.stop();

        let stream = self.backend.open(constraints).await.map_err(|e| {
            log::warn!("Capture acquisition failed: {}", e);
            e
        })?;
        self.apply_enabled_flags(&stream);

        log::info!(
            "Acquired capture stream {} ({} audio, {} video tracks)",
            stream.id(),
            stream.audio_tracks().count(),
            stream.video_tracks().count()
        );
        let stream: &MediaStream = self.state.capture_stream.insert(stream);
        Ok(stream)
    }

    /// Enumerate input devices, defaulting the selection to the first device
    /// of each kind when nothing (still present) is selected.
    pub async fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        self.refresh_devices().await?;
        let mut devices = self.state.audio_devices.clone();
        devices.extend(self.state.video_devices.iter().cloned());
        Ok(devices)
    }

    /// Enumerate and report what changed since the previous enumeration
    pub async fn refresh_devices(&mut self) -> Result<Vec<DeviceEvent>, DeviceError> {
        let devices = self.backend.enumerate_devices().await?;

        let previous: Vec<DeviceDescriptor> = self
            .state
            .audio_devices
            .iter()
            .chain(self.state.video_devices.iter())
            .cloned()
            .collect();
        let events = if self.enumerated {
            diff_devices(&previous, &devices)
        } else {
            Vec::new()
        };
        self.enumerated = true;

        let (audio, video): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|d| d.kind == DeviceKind::AudioInput);

        self.state.selected_audio = reselect(self.state.selected_audio.take(), &audio);
        self.state.selected_video = reselect(self.state.selected_video.take(), &video);
        self.state.audio_devices = audio;
        self.state.video_devices = video;

        log::debug!(
            "Enumerated {} audio and {} video inputs",
            self.state.audio_devices.len(),
            self.state.video_devices.len()
        );
        Ok(events)
    }

    /// Switch the tracks of `kind` to exactly `device_id`.
    ///
    /// The new device is opened before the old tracks are stopped; on failure
    /// the current stream is left untouched.
    pub async fn switch_device(
        &mut self,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<&MediaStream, DeviceError> {
        let constraints = MediaConstraints::exact_device(kind, device_id);
        let fresh = self.backend.open(&constraints).await?;

        let track_kind = kind.track_kind();
        let mut replacement = Vec::new();
        for track in fresh.tracks() {
            if track.kind() == track_kind {
                replacement.push(track.clone());
            } else {
                track.stop();
            }
        }
        if replacement.is_empty() {
            return Err(DeviceError::NotFound(format!(
                "device {} produced no {} track",
                device_id, track_kind
            )));
        }

        let enabled = self.enabled_for(track_kind);
        let mut tracks = Vec::new();
        if let Some(old) = self.state.capture_stream.take() {
            for track in old.tracks() {
                if track.kind() == track_kind {
                    track.stop();
                } else {
                    tracks.push(track.clone());
                }
            }
        }
        for track in &replacement {
            track.set_enabled(enabled);
        }
        tracks.extend(replacement);

        let selected = self
            .devices_of(kind)
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .unwrap_or_else(|| {
                let label = tracks
                    .iter()
                    .find(|t| t.kind() == track_kind)
                    .map(|t| t.label().to_string())
                    .unwrap_or_default();
                DeviceDescriptor::new(device_id, kind, label)
            });
        match kind {
            DeviceKind::AudioInput => self.state.selected_audio = Some(selected),
            DeviceKind::VideoInput => self.state.selected_video = Some(selected),
        }

        let stream = MediaStream::new(tracks);
        log::info!("Switched {} to device {} (stream {})", kind, device_id, stream.id());
        let stream: &MediaStream = self.state.capture_stream.insert(stream);
        Ok(stream)
    }

    /// Flip the audio enabled bit in place. Returns the new value.
    pub fn toggle_audio(&mut self) -> bool {
        self.state.audio_enabled = !self.state.audio_enabled;
        self.apply_enabled(TrackKind::Audio, self.state.audio_enabled);
        self.state.audio_enabled
    }

    /// Flip the video enabled bit in place. Returns the new value.
    pub fn toggle_video(&mut self) -> bool {
        self.state.video_enabled = !self.state.video_enabled;
        self.apply_enabled(TrackKind::Video, self.state.video_enabled);
        self.state.video_enabled
    }

    /// Stop every capture track and drop the stream
    pub fn stop(&mut self) {
        if let Some(stream) = self.state.capture_stream.take() {
            log::debug!("Releasing capture stream {}", stream.id());
            stream.stop_all();
        }
    }

    fn devices_of(&self, kind: DeviceKind) -> &[DeviceDescriptor] {
        match kind {
            DeviceKind::AudioInput => &self.state.audio_devices,
            DeviceKind::VideoInput => &self.state.video_devices,
        }
    }

    fn enabled_for(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.state.audio_enabled,
            TrackKind::Video => self.state.video_enabled,
        }
    }

    fn apply_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(stream) = &self.state.capture_stream {
            for track in stream.tracks_of(kind) {
                track.set_enabled(enabled);
            }
        }
    }

    fn apply_enabled_flags(&self, stream: &MediaStream) {
        for track in stream.tracks() {
            track.set_enabled(self.enabled_for(track.kind()));
        }
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reselect(
    current: Option<DeviceDescriptor>,
    available: &[DeviceDescriptor],
) -> Option<DeviceDescriptor> {
    match current {
        Some(selected) if available.iter().any(|d| d.id == selected.id) => Some(selected),
        _ => available.first().cloned(),
    }
}
