//! Local capture: constraints, device enumeration and the [`MediaSource`] owner

pub mod constraints;
pub mod devices;
pub mod source;

pub use constraints::{MediaConstraints, TrackConstraints};
pub use devices::{diff_devices, CaptureBackend, DeviceEvent};
pub use source::{MediaSource, MediaSourceState};
