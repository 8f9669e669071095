use crate::config::MediaConfig;
use crate::types::{DeviceKind, TrackKind};
use serde::{Deserialize, Serialize};

/// Request for one kind of track
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackConstraints {
    /// Exact device id; any device of the kind when `None`
    pub device_id: Option<String>,
    pub ideal_width: Option<u32>,
    pub ideal_height: Option<u32>,
    pub ideal_frame_rate: Option<u32>,
}

impl TrackConstraints {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn exact(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }
}

/// Capture request. A `None` kind is explicitly not requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<TrackConstraints>,
    pub video: Option<TrackConstraints>,
}

impl MediaConstraints {
    pub fn from_config(config: &MediaConfig) -> Self {
        Self {
            audio: config.audio.then(TrackConstraints::any),
            video: config.video.then(|| TrackConstraints {
                device_id: None,
                ideal_width: Some(config.ideal_width),
                ideal_height: Some(config.ideal_height),
                ideal_frame_rate: Some(config.ideal_frame_rate),
            }),
        }
    }

    /// Request exactly one device; the opposite kind is disabled so already
    /// granted permissions are not prompted again.
    pub fn exact_device(kind: DeviceKind, device_id: &str) -> Self {
        match kind {
            DeviceKind::AudioInput => Self {
                audio: Some(TrackConstraints::exact(device_id)),
                video: None,
            },
            DeviceKind::VideoInput => Self {
                audio: None,
                video: Some(TrackConstraints::exact(device_id)),
            },
        }
    }

    pub fn constraint_for(&self, kind: TrackKind) -> Option<&TrackConstraints> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn requests_any(&self) -> bool {
        self.audio.is_some() || self.video.is_some()
    }

    /// Pin each requested kind that has no explicit device to `device_id`
    pub fn prefer_device(mut self, kind: DeviceKind, device_id: Option<&str>) -> Self {
        let slot = match kind {
            DeviceKind::AudioInput => &mut self.audio,
            DeviceKind::VideoInput => &mut self.video,
        };
        if let (Some(constraint), Some(id)) = (slot.as_mut(), device_id) {
            if constraint.device_id.is_none() {
                constraint.device_id = Some(id.to_string());
            }
        }
        self
    }
}
