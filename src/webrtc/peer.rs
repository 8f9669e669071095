use crate::errors::SessionError;
use crate::types::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Public STUN endpoints used for candidate gathering
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// WebRTC peer connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RTCConfiguration {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RTCConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            }],
        }
    }
}

/// ICE server configuration. Only credential-less STUN servers are supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
}

/// WebRTC peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// ICE transport state, tracked independently of [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// SDP (Session Description Protocol) type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description, serialized as `{type, sdp}` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse a signaling payload into a description
    pub fn from_payload(payload: serde_json::Value) -> Result<Self, SessionError> {
        serde_json::from_value(payload)
            .map_err(|e| SessionError::negotiation(format!("malformed session description: {}", e)))
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Cheap syntactic check of the `candidate:` attribute line
    /// (foundation, component, transport, priority, address, port, `typ`, type).
    pub fn is_well_formed(&self) -> bool {
        let line = self.candidate.trim();
        let Some(body) = line.strip_prefix("candidate:") else {
            return false;
        };
        let fields: Vec<&str> = body.split_whitespace().collect();
        fields.len() >= 8
            && fields[1].parse::<u16>().is_ok()
            && fields[3].parse::<u32>().is_ok()
            && fields[5].parse::<u16>().is_ok()
            && fields[6] == "typ"
    }
}

/// Which side of the offer/answer exchange this peer session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Joined, waiting for either `ready` or a remote offer
    #[default]
    Pending,
    Offerer,
    Answerer,
}

/// Reception capabilities requested when creating a description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

/// Callback surfaced by a peer transport
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    ConnectionStateChanged(ConnectionState),
    RemoteTrack {
        track: MediaTrack,
        streams: Vec<MediaStream>,
    },
}

/// One underlying peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track, bundled under `stream_id`
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), SessionError>;

    /// Declare receive-only capability for `kind`
    async fn add_recv_transceiver(&self, kind: TrackKind) -> Result<(), SessionError>;

    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, SessionError>;

    async fn create_answer(&self, options: &OfferOptions) -> Result<SessionDescription, SessionError>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError>;

    /// Release the transport. Idempotent.
    async fn close(&self) -> Result<(), SessionError>;
}

/// A freshly created peer connection and the stream of its callbacks
pub struct PeerHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Factory for peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, config: &RTCConfiguration) -> Result<PeerHandle, SessionError>;
}
