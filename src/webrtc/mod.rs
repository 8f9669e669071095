pub mod negotiator;
pub mod peer;
pub mod router;
/// webrtc-rs backed peer connections
#[cfg(feature = "webrtc")]
pub mod rtc;

pub use negotiator::{PeerSession, PeerSignal, PeerStatus, SessionNegotiator};
pub use peer::{
    ConnectionState, IceCandidate, IceConnectionState, IceServer, OfferOptions, PeerConnector,
    PeerEvent, PeerHandle, PeerRole, PeerTransport, RTCConfiguration, SdpType,
    SessionDescription, DEFAULT_STUN_SERVERS,
};
pub use router::{route, StreamRouting};
#[cfg(feature = "webrtc")]
pub use rtc::RtcConnector;
