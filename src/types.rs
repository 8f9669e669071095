//! Shared media and session types
//!
//! Tracks carry their `enabled` bit and liveness in shared state so every clone
//! (the capture stream owned by [`MediaSource`](crate::media::MediaSource) and
//! the tracks attached to a peer session) observes the same stop/enable.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Kind of a capture device, named the way device enumeration reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    #[serde(rename = "audioinput")]
    AudioInput,
    #[serde(rename = "videoinput")]
    VideoInput,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::AudioInput => "audioinput",
            DeviceKind::VideoInput => "videoinput",
        }
    }

    /// Track kind produced by a device of this kind
    pub fn track_kind(&self) -> TrackKind {
        match self {
            DeviceKind::AudioInput => TrackKind::Audio,
            DeviceKind::VideoInput => TrackKind::Video,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audioinput" | "audio" => Some(DeviceKind::AudioInput),
            "videoinput" | "video" => Some(DeviceKind::VideoInput),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of one capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, kind: DeviceKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
        }
    }
}

/// Media kind of a single track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct TrackState {
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// One audio or video track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    device_id: Option<String>,
    state: Arc<TrackState>,
}

impl MediaTrack {
    /// Create a live, enabled track with a fresh id
    pub fn new(kind: TrackKind, label: impl Into<String>, device_id: Option<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label, device_id)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        label: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            device_id,
            state: Arc::new(TrackState {
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Capture device this track was opened from, `None` for remote tracks
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.state.ended.load(Ordering::SeqCst)
    }

    /// Stop the track and release its source. Idempotent.
    pub fn stop(&self) {
        if !self.state.ended.swap(true, Ordering::SeqCst) {
            log::debug!("Stopped {} track {}", self.kind, self.id);
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaTrack {}

impl Serialize for MediaTrack {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("MediaTrack", 5)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("label", &self.label)?;
        s.serialize_field("enabled", &self.is_enabled())?;
        s.serialize_field("live", &self.is_live())?;
        s.end()
    }
}

/// A bundle of tracks captured or received together
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    /// A stream is active while at least one of its tracks is live
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Append a track unless one with the same id is already present
    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.contains(&track) {
            self.tracks.push(track);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Room membership of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MembershipState {
    #[default]
    NotJoined,
    Joining,
    Joined,
}
