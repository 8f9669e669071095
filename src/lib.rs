//! PeerRoom: two-party audio/video room sessions
//!
//! A client joins a named room on a signaling relay, acquires local camera and
//! microphone capture, negotiates a peer connection with the one other member
//! and exposes the local and remote streams through observable session state.
//!
//! # Features
//! - Local capture with device enumeration, switching and mute toggles
//! - Offer/answer/ICE exchange with candidate buffering and renegotiation
//! - Big/small stream routing for a two-tile view
//! - In-process relay, synthetic capture and loopback peers for offline runs
//! - `webrtc`: real peer connections via webrtc-rs
//! - `ws-signaling`: WebSocket transport to a relay
//!
//! # Usage
//! ```rust,ignore
//! use peerroom::{PeerRoomConfig, RoomSession};
//!
//! let session = RoomSession::new(config, capture, connector, signaling);
//! session.join("42").await?;
//! let mut state = session.subscribe();
//! while state.changed().await.is_ok() {
//!     println!("{:?}", state.borrow().routing);
//! }
//! ```
pub mod config;
pub mod errors;
pub mod media;
pub mod session;
pub mod signaling;
pub mod testing;
pub mod types;
pub mod webrtc;

// Re-exports for convenience
pub use config::PeerRoomConfig;
pub use errors::{DeviceError, ErrorKind, SessionError};
pub use media::{CaptureBackend, DeviceEvent, MediaConstraints, MediaSource, MediaSourceState};
pub use session::{RoomSession, SessionErrorRecord, SessionSnapshot};
pub use signaling::{MemoryRelay, SignalingChannel};
pub use types::{DeviceDescriptor, DeviceKind, MediaStream, MediaTrack, MembershipState, TrackKind};
pub use webrtc::{
    route, ConnectionState, IceConnectionState, PeerConnector, PeerRole, RTCConfiguration,
    SessionNegotiator, StreamRouting,
};

#[cfg(feature = "ws-signaling")]
pub use signaling::WsSignalingChannel;
#[cfg(feature = "webrtc")]
pub use webrtc::RtcConnector;

/// Initialize logging for the session stack
pub fn init_logging() {
    init_logging_with("peerroom=info");
}

/// Initialize logging with `filter` unless `RUST_LOG` is set
pub fn init_logging_with(filter: &str) {
    let env = env_logger::Env::default().default_filter_or(filter);
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        features: enabled_features(),
    }
}

fn enabled_features() -> Vec<String> {
    let mut features = Vec::new();
    if cfg!(feature = "webrtc") {
        features.push("webrtc".to_string());
    }
    if cfg!(feature = "ws-signaling") {
        features.push("ws-signaling".to_string());
    }
    features
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub features: Vec<String>,
}
