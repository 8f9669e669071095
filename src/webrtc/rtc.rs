//! webrtc-rs backed [`PeerConnector`]
//!
//! Local tracks are `TrackLocalStaticSample`s declared with the default Opus
//! and VP8 codecs. This adapter only negotiates them: encoded samples have to
//! be written by the capture side, and until something does the peer receives
//! silent audio and black video.

use crate::errors::SessionError;
use crate::types::{MediaStream, MediaTrack, TrackKind};
use crate::webrtc::peer::{
    ConnectionState, IceCandidate, IceConnectionState, OfferOptions, PeerConnector, PeerEvent,
    PeerHandle, PeerTransport, RTCConfiguration, SdpType, SessionDescription,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration as WebRtcConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => IceConnectionState::New,
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
        }
    }
}

impl TryFrom<&SessionDescription> for RTCSessionDescription {
    type Error = SessionError;

    fn try_from(desc: &SessionDescription) -> Result<Self, Self::Error> {
        let sdp = desc.sdp.clone();
        match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
            SdpType::Rollback => {
                return Err(SessionError::negotiation("rollback descriptions are not supported"))
            }
        }
        .map_err(|e| SessionError::negotiation(format!("invalid SDP: {}", e)))
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

/// Creates webrtc-rs peer connections with the default codec set
#[derive(Debug, Default, Clone)]
pub struct RtcConnector;

impl RtcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, config: &RTCConfiguration) -> Result<PeerHandle, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::negotiation(format!("Failed to register codecs: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| SessionError::negotiation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = WebRtcConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            SessionError::negotiation(format!("Failed to create peer connection: {}", e))
        })?);

        let (tx, events) = mpsc::unbounded_channel();
        register_callbacks(&peer_connection, tx);

        Ok(PeerHandle {
            transport: Arc::new(RtcTransport {
                peer_connection,
                local_tracks: Mutex::new(Vec::new()),
            }),
            events,
        })
    }
}

fn forward(tx: &mpsc::UnboundedSender<PeerEvent>, event: PeerEvent) {
    if let Err(e) = tx.send(event) {
        log::debug!("Peer connection closed, dropping {:?}", e.0);
    }
}

fn register_callbacks(peer_connection: &RTCPeerConnection, tx: mpsc::UnboundedSender<PeerEvent>) {
    let candidates = tx.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    forward(&candidates, PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => log::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let ice = tx.clone();
    peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        forward(&ice, PeerEvent::IceStateChanged(state.into()));
        Box::pin(async {})
    }));

    let connection = tx.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        forward(&connection, PeerEvent::ConnectionStateChanged(state.into()));
        Box::pin(async {})
    }));

    // Tracks of one remote stream arrive one callback at a time
    let streams: Arc<Mutex<HashMap<String, MediaStream>>> = Arc::new(Mutex::new(HashMap::new()));
    peer_connection.on_track(Box::new(
        move |remote: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match remote.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let track = MediaTrack::with_id(remote.id(), kind, format!("remote {}", kind), None);
            let stream_id = remote.stream_id();

            let stream = {
                let mut streams = streams.lock().expect("lock poisoned");
                let stream = streams
                    .entry(stream_id.clone())
                    .or_insert_with(|| MediaStream::with_id(stream_id, Vec::new()));
                stream.add_track(track.clone());
                stream.clone()
            };
            forward(&tx, PeerEvent::RemoteTrack {
                track,
                streams: vec![stream],
            });
            Box::pin(async {})
        },
    ));
}

/// A webrtc-rs peer connection
pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), SessionError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            stream_id.to_string(),
        ));
        self.peer_connection
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SessionError::negotiation(format!("Failed to add {} track: {}", track.kind(), e)))?;
        self.local_tracks.lock().expect("lock poisoned").push(local);
        Ok(())
    }

    async fn add_recv_transceiver(&self, kind: TrackKind) -> Result<(), SessionError> {
        self.peer_connection
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map(|_| ())
            .map_err(|e| SessionError::negotiation(format!("Failed to add {} transceiver: {}", kind, e)))
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, SessionError> {
        log::debug!(
            "Creating offer (receive audio: {}, receive video: {})",
            options.offer_to_receive_audio,
            options.offer_to_receive_video
        );
        self.peer_connection
            .create_offer(None)
            .await
            .map(|desc| SessionDescription::offer(desc.sdp))
            .map_err(|e| SessionError::negotiation(format!("Failed to create offer: {}", e)))
    }

    async fn create_answer(&self, _options: &OfferOptions) -> Result<SessionDescription, SessionError> {
        self.peer_connection
            .create_answer(None)
            .await
            .map(|desc| SessionDescription::answer(desc.sdp))
            .map_err(|e| SessionError::negotiation(format!("Failed to create answer: {}", e)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        self.peer_connection
            .set_local_description(desc.try_into()?)
            .await
            .map_err(|e| SessionError::negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        self.peer_connection
            .set_remote_description(desc.try_into()?)
            .await
            .map_err(|e| SessionError::negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| SessionError::negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.local_tracks.lock().expect("lock poisoned").clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| SessionError::negotiation(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_after_receiver_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward(&tx, PeerEvent::IceStateChanged(RTCIceConnectionState::Checking.into()));
        assert!(matches!(
            rx.try_recv(),
            Ok(PeerEvent::IceStateChanged(IceConnectionState::Checking))
        ));

        drop(rx);
        forward(&tx, PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_offer_carries_local_and_receive_sections() {
        let handle = RtcConnector::new()
            .connect(&RTCConfiguration::default())
            .await
            .unwrap();
        let track = MediaTrack::new(TrackKind::Video, "cam", None);
        handle.transport.add_track(&track, "local").await.unwrap();
        handle
            .transport
            .add_recv_transceiver(TrackKind::Audio)
            .await
            .unwrap();

        let offer = handle
            .transport
            .create_offer(&OfferOptions::default())
            .await
            .unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=audio"));

        handle.transport.close().await.unwrap();
    }

    #[test]
    fn test_state_conversions() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Disconnected),
            IceConnectionState::Disconnected
        );
    }
}
