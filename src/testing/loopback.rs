//! In-memory peer network
//!
//! Peer connections created through a [`LoopbackNetwork`] negotiate with fake
//! but checked session descriptions. A peer "connects" once it holds a local
//! and a remote description and has applied at least one remote candidate; it
//! then reports the usual state progression and surfaces the counterpart's
//! tracks as remote tracks. Closing a connected peer hangs up on the other side.

use crate::errors::SessionError;
use crate::types::{MediaStream, MediaTrack, TrackKind};
use crate::webrtc::{
    ConnectionState, IceCandidate, IceConnectionState, OfferOptions, PeerConnector, PeerEvent,
    PeerHandle, PeerTransport, RTCConfiguration, SdpType, SessionDescription,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, Notify, Semaphore};

const PEER_ATTRIBUTE: &str = "a=loopback-peer:";

/// Parks offer creation until released; lets tests act while an offer is in flight
pub struct OfferGate {
    entered: Notify,
    permits: Semaphore,
}

impl OfferGate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            permits: Semaphore::new(0),
        }
    }

    /// Resolves once an offer creation is parked at the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let one parked (or future) offer creation through
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
    next_id: AtomicU64,
    next_port: AtomicU16,
    gate: Mutex<Option<Arc<OfferGate>>>,
    refusing: AtomicBool,
}

impl NetworkInner {
    fn find(&self, id: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    fn gate(&self) -> Option<Arc<OfferGate>> {
        self.gate.lock().expect("lock poisoned").clone()
    }

    fn port(&self) -> u16 {
        40000 + self.next_port.fetch_add(1, Ordering::Relaxed) % 20000
    }
}

/// Shared fabric that every loopback peer connection lives on
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose peers are tagged with `label`
    pub fn connector(&self, label: impl Into<String>) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
            label: label.into(),
        }
    }

    /// Every peer created under `label`, oldest first
    pub fn peers(&self, label: &str) -> Vec<Arc<LoopbackPeer>> {
        self.inner
            .peers
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|p| p.label == label)
            .cloned()
            .collect()
    }

    pub fn latest(&self, label: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers(label).pop()
    }

    /// Peers under `label` that have not been closed
    pub fn open_peers(&self, label: &str) -> usize {
        self.peers(label).iter().filter(|p| !p.is_closed()).count()
    }

    /// Park every following offer creation at the returned gate
    pub fn hold_offers(&self) -> Arc<OfferGate> {
        let gate = Arc::new(OfferGate::new());
        *self.inner.gate.lock().expect("lock poisoned") = Some(gate.clone());
        gate
    }

    /// Make every following connect fail, as if the WebRTC stack were unavailable
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn release_offers(&self) {
        if let Some(gate) = self.inner.gate.lock().expect("lock poisoned").take() {
            gate.permits.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }
}

/// [`PeerConnector`] handing out loopback peers
#[derive(Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
    label: String,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(&self, config: &RTCConfiguration) -> Result<PeerHandle, SessionError> {
        let inner = &self.network.inner;
        if inner.refusing.load(Ordering::SeqCst) {
            return Err(SessionError::negotiation(format!(
                "peer connection for {} refused",
                self.label
            )));
        }
        let id = format!(
            "{}-{}",
            self.label,
            inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        let (tx, events) = mpsc::unbounded_channel();
        let peer = Arc::new(LoopbackPeer {
            id: id.clone(),
            label: self.label.clone(),
            network: Arc::downgrade(inner),
            events: tx,
            state: Mutex::new(PeerState::default()),
        });
        inner.peers.lock().expect("lock poisoned").push(peer.clone());
        log::debug!(
            "Loopback peer {} created ({} ICE servers)",
            id,
            config.ice_servers.len()
        );

        Ok(PeerHandle {
            transport: peer,
            events,
        })
    }
}

#[derive(Default)]
struct PeerState {
    local_tracks: Vec<(MediaTrack, String)>,
    recv_kinds: Vec<TrackKind>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_peer: Option<String>,
    applied_candidates: Vec<IceCandidate>,
    received: Vec<MediaTrack>,
    connected: bool,
    closed: bool,
}

/// One loopback peer connection
pub struct LoopbackPeer {
    id: String,
    label: String,
    network: Weak<NetworkInner>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.lock().local_tracks.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn recv_kinds(&self) -> Vec<TrackKind> {
        self.lock().recv_kinds.clone()
    }

    /// Remote candidates applied to the transport, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied_candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote_description.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Deliver a transport callback as if the connection produced it
    pub fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Loopback peer {} has no listener", self.id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().expect("lock poisoned")
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.lock().closed {
            return Err(SessionError::negotiation(format!(
                "peer connection {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn describe(&self, sdp_type: SdpType, options: &OfferOptions) -> SessionDescription {
        let state = self.lock();
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\n",
            uuid::Uuid::new_v4().as_u128() % 1_000_000_000,
            PEER_ATTRIBUTE,
            self.id
        );
        for (kind, receive) in [
            (TrackKind::Audio, options.offer_to_receive_audio),
            (TrackKind::Video, options.offer_to_receive_video),
        ] {
            let sending: Vec<&(MediaTrack, String)> = state
                .local_tracks
                .iter()
                .filter(|(t, _)| t.kind() == kind)
                .collect();
            let receiving = receive || state.recv_kinds.contains(&kind);
            let direction = match (sending.is_empty(), receiving) {
                (false, true) => "sendrecv",
                (false, false) => "sendonly",
                (true, true) => "recvonly",
                (true, false) => "inactive",
            };
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na={}\r\n", kind, direction));
            for (track, stream_id) in sending {
                sdp.push_str(&format!("a=msid:{} {}\r\n", stream_id, track.id()));
            }
        }
        SessionDescription { sdp_type, sdp }
    }

    fn maybe_connect(&self) {
        let remote_id = {
            let mut state = self.lock();
            if state.closed
                || state.connected
                || state.local_description.is_none()
                || state.remote_description.is_none()
                || state.applied_candidates.is_empty()
            {
                return;
            }
            state.connected = true;
            state.remote_peer.clone()
        };

        self.emit(PeerEvent::IceStateChanged(IceConnectionState::Checking));
        self.emit(PeerEvent::ConnectionStateChanged(ConnectionState::Connecting));
        self.emit(PeerEvent::IceStateChanged(IceConnectionState::Connected));
        self.emit(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
        log::debug!("Loopback peer {} connected", self.id);

        let Some(remote) = remote_id.and_then(|id| self.network.upgrade()?.find(&id)) else {
            return;
        };
        let outgoing = remote.lock().local_tracks.clone();

        let mut streams: Vec<MediaStream> = Vec::new();
        let mut received = Vec::new();
        for (track, stream_id) in outgoing {
            let copy = MediaTrack::with_id(track.id(), track.kind(), track.label(), None);
            match streams.iter_mut().find(|s| s.id() == stream_id) {
                Some(stream) => stream.add_track(copy.clone()),
                None => streams.push(MediaStream::with_id(stream_id, vec![copy.clone()])),
            }
            received.push(copy);
        }
        self.lock().received.extend(received.iter().cloned());

        for track in received {
            let Some(stream) = streams
                .iter()
                .find(|s| s.tracks().contains(&track))
                .cloned()
            else {
                continue;
            };
            self.emit(PeerEvent::RemoteTrack {
                track,
                streams: vec![stream],
            });
        }
    }

    /// The counterpart went away
    fn hang_up(&self, from: &str) {
        {
            let mut state = self.lock();
            if state.closed || !state.connected || state.remote_peer.as_deref() != Some(from) {
                return;
            }
            state.connected = false;
            for track in state.received.drain(..) {
                track.stop();
            }
        }
        self.emit(PeerEvent::IceStateChanged(IceConnectionState::Disconnected));
        self.emit(PeerEvent::ConnectionStateChanged(ConnectionState::Disconnected));
    }
}

fn peer_of(desc: &SessionDescription) -> Option<&str> {
    desc.sdp
        .lines()
        .find_map(|line| line.trim().strip_prefix(PEER_ATTRIBUTE))
        .filter(|id| !id.is_empty())
}

#[async_trait]
impl PeerTransport for LoopbackPeer {
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.lock()
            .local_tracks
            .push((track.clone(), stream_id.to_string()));
        Ok(())
    }

    async fn add_recv_transceiver(&self, kind: TrackKind) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.lock().recv_kinds.push(kind);
        Ok(())
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        if let Some(gate) = self.network.upgrade().and_then(|n| n.gate()) {
            gate.pass().await;
        }
        self.ensure_open()?;
        Ok(self.describe(SdpType::Offer, options))
    }

    async fn create_answer(&self, options: &OfferOptions) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let has_offer = self
            .lock()
            .remote_description
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(SessionError::negotiation("cannot answer without a remote offer"));
        }
        Ok(self.describe(SdpType::Answer, options))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        self.ensure_open()?;
        if peer_of(desc) != Some(self.id.as_str()) {
            return Err(SessionError::negotiation(
                "local description was not created by this peer",
            ));
        }
        self.lock().local_description = Some(desc.clone());

        let port = self.network.upgrade().map_or(9, |n| n.port());
        self.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 UDP 2122260223 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        self.ensure_open()?;
        let remote = peer_of(desc)
            .ok_or_else(|| SessionError::negotiation("unrecognised session description"))?
            .to_string();
        {
            let mut state = self.lock();
            if desc.sdp_type == SdpType::Answer
                && state.local_description.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer)
            {
                return Err(SessionError::negotiation(
                    "received an answer without a pending local offer",
                ));
            }
            state.remote_description = Some(desc.clone());
            state.remote_peer = Some(remote);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !candidate.is_well_formed() {
            return Err(SessionError::negotiation(format!(
                "malformed candidate {:?}",
                candidate.candidate
            )));
        }
        {
            let mut state = self.lock();
            if state.remote_description.is_none() {
                return Err(SessionError::negotiation(
                    "candidate added before a remote description",
                ));
            }
            state.applied_candidates.push(candidate.clone());
        }
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let remote = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            for track in state.received.drain(..) {
                track.stop();
            }
            let remote = state.remote_peer.clone().filter(|_| state.connected);
            state.connected = false;
            remote
        };
        log::debug!("Loopback peer {} closed", self.id);

        if let Some(peer) = remote.and_then(|id| self.network.upgrade()?.find(&id)) {
            peer.hang_up(&self.id);
        }
        Ok(())
    }
}
