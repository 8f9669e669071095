//! Capture device bookkeeping
//!
//! Detects connect/disconnect between two enumerations so the session can react
//! to devices appearing or vanishing while a call is running.

use crate::errors::DeviceError;
use crate::media::MediaConstraints;
use crate::types::{DeviceDescriptor, MediaStream};
use async_trait::async_trait;

/// Platform capture layer (camera/microphone access and enumeration)
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// List currently available input devices
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Open a capture stream matching `constraints`. May wait on a permission prompt.
    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, DeviceError>;
}

/// Device event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(DeviceDescriptor),
    Disconnected(DeviceDescriptor),
}

/// Compute connect/disconnect events between two device lists
pub fn diff_devices(previous: &[DeviceDescriptor], current: &[DeviceDescriptor]) -> Vec<DeviceEvent> {
    let mut events = Vec::new();

    for old in previous {
        if !current.iter().any(|d| d.id == old.id && d.kind == old.kind) {
            log::info!("Device disconnected: {} ({})", old.id, old.kind);
            events.push(DeviceEvent::Disconnected(old.clone()));
        }
    }

    for device in current {
        if !previous.iter().any(|d| d.id == device.id && d.kind == device.kind) {
            log::info!("Device connected: {} ({})", device.id, device.kind);
            events.push(DeviceEvent::Connected(device.clone()));
        }
    }

    events
}
