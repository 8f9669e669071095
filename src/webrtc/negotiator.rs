//! Offer/answer driver for the room's peer session
//!
//! [`SessionNegotiator`] owns at most one [`PeerSession`]. Every session gets a
//! fresh generation number; transport callbacks are forwarded tagged with it so
//! the consumer can hand them back through [`SessionNegotiator::handle_peer_event`]
//! and anything from a replaced session is ignored. Description creation runs
//! without holding the session lock and its result is discarded when the
//! session it was started on is gone by the time it resolves.

use crate::errors::SessionError;
use crate::signaling::{events, CandidatePayload, SignalingChannel};
use crate::types::{MediaStream, TrackKind};
use crate::webrtc::peer::{
    ConnectionState, IceCandidate, IceConnectionState, OfferOptions, PeerConnector, PeerEvent,
    PeerHandle, PeerRole, PeerTransport, RTCConfiguration, SdpType, SessionDescription,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Transport callback tagged with the session generation that produced it
#[derive(Debug, Clone)]
pub struct PeerSignal {
    pub generation: u64,
    pub event: PeerEvent,
}

/// One negotiated peer connection
pub struct PeerSession {
    generation: u64,
    room: String,
    role: PeerRole,
    transport: Arc<dyn PeerTransport>,
    connection_state: ConnectionState,
    ice_state: IceConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    remote_stream: Option<MediaStream>,
    forwarder: JoinHandle<()>,
}

impl PeerSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice_state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
            && self.ice_state == IceConnectionState::Connected
    }

    fn status(&self) -> PeerStatus {
        PeerStatus {
            generation: Some(self.generation),
            role: self.role,
            connection_state: self.connection_state,
            ice_state: self.ice_state,
            has_local_description: self.local_description.is_some(),
            has_remote_description: self.remote_description.is_some(),
            pending_candidates: self.pending_candidates.len(),
            remote_stream: self.remote_stream.clone(),
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Point-in-time view of the negotiator, used to build session snapshots
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PeerStatus {
    pub generation: Option<u64>,
    pub role: PeerRole,
    pub connection_state: ConnectionState,
    pub ice_state: IceConnectionState,
    pub has_local_description: bool,
    pub has_remote_description: bool,
    pub pending_candidates: usize,
    pub remote_stream: Option<MediaStream>,
}

/// Drives offer/answer/candidate exchange for one room membership
pub struct SessionNegotiator {
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingChannel>,
    config: RTCConfiguration,
    sink: mpsc::UnboundedSender<PeerSignal>,
    generation: AtomicU64,
    session: Mutex<Option<PeerSession>>,
    // Orders outgoing descriptions before the candidates they produce
    outbound: Mutex<()>,
}

impl SessionNegotiator {
    /// Transport callbacks of every opened session are delivered to `sink`.
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingChannel>,
        config: RTCConfiguration,
        sink: mpsc::UnboundedSender<PeerSignal>,
    ) -> Self {
        Self {
            connector,
            signaling,
            config,
            sink,
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
            outbound: Mutex::new(()),
        }
    }

    /// Open a fresh peer session, closing the current one first.
    ///
    /// Every live track of `local` is attached and receive-only audio and video
    /// are declared. Returns the new session's generation.
    pub async fn open(
        &self,
        room: &str,
        local: Option<&MediaStream>,
        role: PeerRole,
    ) -> Result<u64, SessionError> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            release(previous).await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let PeerHandle {
            transport,
            mut events,
        } = self.connector.connect(&self.config).await?;

        if let Err(e) = attach_media(transport.as_ref(), local).await {
            log::warn!("Failed to prepare peer session {}: {}", generation, e);
            if let Err(close_err) = transport.close().await {
                log::warn!("Failed to close peer session {}: {}", generation, close_err);
            }
            return Err(e);
        }

        let sink = self.sink.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = sink.send(PeerSignal { generation, event }) {
                    log::debug!("Negotiator gone, dropping {:?}", e.0.event);
                    break;
                }
            }
        });

        log::info!(
            "Opened peer session {} for room {} ({:?}, {} local tracks)",
            generation,
            room,
            role,
            local.map_or(0, |s| s.tracks().len())
        );

        *slot = Some(PeerSession {
            generation,
            room: room.to_string(),
            role,
            transport,
            connection_state: ConnectionState::New,
            ice_state: IceConnectionState::New,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            remote_stream: None,
            forwarder,
        });
        Ok(generation)
    }

    /// Create an offer, install it locally and send it to the room.
    ///
    /// Returns `Ok(false)` when the session was closed or replaced while the
    /// offer was being created; nothing is installed or sent in that case.
    pub async fn create_and_send_offer(&self) -> Result<bool, SessionError> {
        self.create_and_send(SdpType::Offer).await
    }

    /// Answer counterpart of [`create_and_send_offer`](Self::create_and_send_offer)
    pub async fn create_and_send_answer(&self) -> Result<bool, SessionError> {
        self.create_and_send(SdpType::Answer).await
    }

    async fn create_and_send(&self, sdp_type: SdpType) -> Result<bool, SessionError> {
        let (generation, transport) = {
            let slot = self.session.lock().await;
            let session = slot
                .as_ref()
                .ok_or_else(|| SessionError::negotiation("no peer session open"))?;
            (session.generation, session.transport.clone())
        };

        let options = OfferOptions::default();
        let created = match sdp_type {
            SdpType::Offer => transport.create_offer(&options).await,
            _ => transport.create_answer(&options).await,
        };

        let _outbound = self.outbound.lock().await;
        let (room, desc) = {
            let mut slot = self.session.lock().await;
            let session = match slot.as_mut() {
                Some(session) if session.generation == generation => session,
                _ => {
                    log::info!(
                        "Discarding {:?} created for closed peer session {}",
                        sdp_type,
                        generation
                    );
                    return Ok(false);
                }
            };
            let desc = created?;
            session.transport.set_local_description(&desc).await?;
            session.local_description = Some(desc.clone());
            session.role = match sdp_type {
                SdpType::Offer => PeerRole::Offerer,
                _ => PeerRole::Answerer,
            };
            (session.room.clone(), desc)
        };

        let event = match sdp_type {
            SdpType::Offer => events::OFFER,
            _ => events::ANSWER,
        };
        let payload = serde_json::to_value(&desc)
            .map_err(|e| SessionError::negotiation(format!("failed to encode {}: {}", event, e)))?;
        self.signaling.send(event, &room, payload).await?;
        log::info!("Sent {} for room {} (session {})", event, room, generation);
        Ok(true)
    }

    /// Install the remote description, then apply buffered candidates in
    /// arrival order. A rejected description leaves the session as it was.
    pub async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        let mut slot = self.session.lock().await;
        let session = slot
            .as_mut()
            .ok_or_else(|| SessionError::negotiation("no peer session open"))?;

        session.transport.set_remote_description(&desc).await?;
        if desc.sdp_type == SdpType::Offer {
            session.role = PeerRole::Answerer;
        }
        log::info!(
            "Applied remote {:?} to peer session {}",
            desc.sdp_type,
            session.generation
        );
        session.remote_description = Some(desc);

        let pending = std::mem::take(&mut session.pending_candidates);
        if !pending.is_empty() {
            log::debug!("Flushing {} buffered ICE candidates", pending.len());
        }
        for candidate in pending {
            if let Err(e) = session.transport.add_ice_candidate(&candidate).await {
                log::warn!("Dropping buffered ICE candidate: {}", e);
            }
        }
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until a remote description exists.
    /// Malformed or rejected candidates are logged and dropped.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        if !candidate.is_well_formed() {
            log::warn!("Dropping malformed ICE candidate {:?}", candidate.candidate);
            return Ok(());
        }

        let mut slot = self.session.lock().await;
        let session = slot
            .as_mut()
            .ok_or_else(|| SessionError::negotiation("no peer session open"))?;

        if session.remote_description.is_none() {
            session.pending_candidates.push(candidate);
            log::debug!(
                "Buffered ICE candidate ({} pending)",
                session.pending_candidates.len()
            );
            return Ok(());
        }

        if let Err(e) = session.transport.add_ice_candidate(&candidate).await {
            log::warn!("Dropping rejected ICE candidate: {}", e);
        }
        Ok(())
    }

    /// Apply one forwarded transport callback.
    ///
    /// Returns whether observable state changed. Callbacks from a replaced
    /// session are ignored. ICE `failed` is reported as [`SessionError::IceFailure`].
    pub async fn handle_peer_event(&self, signal: PeerSignal) -> Result<bool, SessionError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot
            .as_mut()
            .filter(|s| s.generation == signal.generation)
        else {
            log::debug!(
                "Ignoring event from stale peer session {}",
                signal.generation
            );
            return Ok(false);
        };

        match signal.event {
            PeerEvent::LocalCandidate(candidate) => {
                let room = session.room.clone();
                drop(slot);
                let _outbound = self.outbound.lock().await;
                let payload = serde_json::to_value(CandidatePayload::from(candidate))
                    .map_err(|e| SessionError::signaling(format!("failed to encode candidate: {}", e)))?;
                self.signaling
                    .send(events::ICE_CANDIDATE, &room, payload)
                    .await?;
                Ok(false)
            }
            PeerEvent::IceStateChanged(state) => {
                log::info!(
                    "Peer session {} ICE state: {} -> {}",
                    session.generation,
                    session.ice_state,
                    state
                );
                session.ice_state = state;
                match state {
                    IceConnectionState::Disconnected => {
                        if session.remote_stream.take().is_some() {
                            log::info!("Remote media lost on peer session {}", session.generation);
                        }
                    }
                    IceConnectionState::Failed => {
                        return Err(SessionError::IceFailure(format!(
                            "ICE failed on peer session {}",
                            session.generation
                        )));
                    }
                    _ => {}
                }
                Ok(true)
            }
            PeerEvent::ConnectionStateChanged(state) => {
                log::info!(
                    "Peer session {} connection state: {} -> {}",
                    session.generation,
                    session.connection_state,
                    state
                );
                session.connection_state = state;
                Ok(true)
            }
            PeerEvent::RemoteTrack { track, streams } => match streams.into_iter().next() {
                Some(stream) => {
                    log::info!(
                        "Remote {} track {} on stream {}",
                        track.kind(),
                        track.id(),
                        stream.id()
                    );
                    session.remote_stream = Some(stream);
                    Ok(true)
                }
                None => {
                    log::debug!("Remote track {} arrived without a stream", track.id());
                    Ok(false)
                }
            },
        }
    }

    /// Close the current session. Returns whether one was open.
    pub async fn close(&self) -> bool {
        let previous = self.session.lock().await.take();
        match previous {
            Some(session) => {
                release(session).await;
                true
            }
            None => false,
        }
    }

    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// True when the current session already took part in an exchange, so a
    /// new offer must go to a fresh session.
    pub async fn needs_fresh_session(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.local_description.is_some() || s.remote_description.is_some())
    }

    pub async fn status(&self) -> PeerStatus {
        self.session
            .lock()
            .await
            .as_ref()
            .map(PeerSession::status)
            .unwrap_or_default()
    }
}

async fn attach_media(
    transport: &dyn PeerTransport,
    local: Option<&MediaStream>,
) -> Result<(), SessionError> {
    if let Some(stream) = local {
        for track in stream.tracks().iter().filter(|t| t.is_live()) {
            transport.add_track(track, stream.id()).await?;
        }
    }
    transport.add_recv_transceiver(TrackKind::Audio).await?;
    transport.add_recv_transceiver(TrackKind::Video).await?;
    Ok(())
}

async fn release(session: PeerSession) {
    if let Err(e) = session.transport.close().await {
        log::warn!("Failed to close peer session {}: {}", session.generation, e);
    }
    log::info!("Closed peer session {}", session.generation);
}
