use crate::errors::{ErrorKind, SessionError};
use crate::media::MediaSourceState;
use crate::types::{MembershipState, MediaStream};
use crate::webrtc::{ConnectionState, IceConnectionState, PeerRole, StreamRouting};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Last error surfaced by a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SessionErrorRecord {
    pub fn new(error: &SessionError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

/// Everything a renderer needs to draw the room
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionSnapshot {
    pub room_id: Option<String>,
    pub membership: MembershipState,
    pub role: PeerRole,
    pub has_peer_session: bool,
    pub connection_state: ConnectionState,
    pub ice_state: IceConnectionState,
    pub remote_stream: Option<MediaStream>,
    #[serde(flatten)]
    pub routing: StreamRouting,
    pub local_is_big: bool,
    pub is_loading: bool,
    pub last_error: Option<SessionErrorRecord>,
    pub media: MediaSourceState,
}

impl SessionSnapshot {
    /// Connected only when both the connection and ICE layers say so
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
            && self.ice_state == IceConnectionState::Connected
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.media.capture_stream.as_ref()
    }

    pub fn has_remote_video(&self) -> bool {
        self.routing.has_remote_video
    }

    pub fn is_joined(&self) -> bool {
        self.membership == MembershipState::Joined
    }
}
