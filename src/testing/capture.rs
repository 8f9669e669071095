//! Synthetic capture backend
//!
//! Behaves like a permission-gated camera/microphone layer without touching
//! hardware: devices can be added and unplugged, permission can be revoked, and
//! every open request is recorded.

use crate::errors::DeviceError;
use crate::media::{CaptureBackend, MediaConstraints};
use crate::types::{DeviceDescriptor, DeviceKind, MediaStream, MediaTrack};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
struct CaptureState {
    devices: Vec<DeviceDescriptor>,
    denied: bool,
    requests: Vec<MediaConstraints>,
    opened: Vec<MediaTrack>,
}

/// In-memory [`CaptureBackend`]
#[derive(Default)]
pub struct SyntheticCapture {
    state: Mutex<CaptureState>,
}

impl SyntheticCapture {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            state: Mutex::new(CaptureState {
                devices,
                ..Default::default()
            }),
        }
    }

    /// Two microphones (`mic1`, `mic2`) and two cameras (`cam1`, `cam2`)
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            DeviceDescriptor::new("mic1", DeviceKind::AudioInput, "Synthetic Microphone 1"),
            DeviceDescriptor::new("mic2", DeviceKind::AudioInput, "Synthetic Microphone 2"),
            DeviceDescriptor::new("cam1", DeviceKind::VideoInput, "Synthetic Camera 1"),
            DeviceDescriptor::new("cam2", DeviceKind::VideoInput, "Synthetic Camera 2"),
        ])
    }

    /// Refuse every subsequent open request
    pub fn deny_permission(&self, denied: bool) {
        self.state.lock().expect("lock poisoned").denied = denied;
    }

    pub fn add_device(&self, device: DeviceDescriptor) {
        self.state.lock().expect("lock poisoned").devices.push(device);
    }

    /// Unplug a device; its open tracks end
    pub fn remove_device(&self, id: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.devices.retain(|d| d.id != id);
        for track in state.opened.iter().filter(|t| t.device_id() == Some(id)) {
            track.stop();
        }
        state.opened.retain(MediaTrack::is_live);
    }

    /// Every constraint set passed to `open`, oldest first
    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.state.lock().expect("lock poisoned").requests.clone()
    }

    /// Tracks handed out that are still live
    pub fn live_tracks(&self) -> usize {
        self.state
            .lock()
            .expect("lock poisoned")
            .opened
            .iter()
            .filter(|t| t.is_live())
            .count()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self.state.lock().expect("lock poisoned").devices.clone())
    }

    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, DeviceError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.requests.push(constraints.clone());

        if state.denied {
            return Err(DeviceError::PermissionDenied(
                "capture permission revoked".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        for kind in [DeviceKind::AudioInput, DeviceKind::VideoInput] {
            let Some(wanted) = constraints.constraint_for(kind.track_kind()) else {
                continue;
            };
            let device = match &wanted.device_id {
                Some(id) => state.devices.iter().find(|d| d.kind == kind && &d.id == id),
                None => state.devices.iter().find(|d| d.kind == kind),
            }
            .cloned()
            .ok_or_else(|| {
                DeviceError::NotFound(match &wanted.device_id {
                    Some(id) => format!("no {} device with id {}", kind, id),
                    None => format!("no {} device available", kind),
                })
            })?;

            tracks.push(MediaTrack::new(
                kind.track_kind(),
                device.label.clone(),
                Some(device.id.clone()),
            ));
        }

        state.opened.retain(MediaTrack::is_live);
        state.opened.extend(tracks.iter().cloned());
        Ok(MediaStream::new(tracks))
    }
}
