//! Room membership lifecycle
//!
//! A [`RoomSession`] composes the local [`MediaSource`], the signaling channel
//! and the [`SessionNegotiator`]. Signaling handlers and transport callbacks only
//! enqueue; a single actor task applies them one at a time under the session
//! lock, the same lock every user operation takes. Queued signals carry the
//! membership epoch they were received under and are dropped once that
//! membership has ended.

use crate::config::PeerRoomConfig;
use crate::errors::SessionError;
use crate::media::{CaptureBackend, DeviceEvent, MediaSource};
use crate::session::state::{SessionErrorRecord, SessionSnapshot};
use crate::signaling::{events, CandidatePayload, SignalingChannel, Subscription};
use crate::types::{DeviceDescriptor, DeviceKind, MembershipState};
use crate::webrtc::{
    route, PeerConnector, PeerRole, PeerSignal, SessionDescription, SessionNegotiator,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Signaling event waiting for the actor
#[derive(Debug)]
struct Signal {
    epoch: u64,
    event: &'static str,
    payload: Value,
}

enum Input {
    Signal(Signal),
    Peer(PeerSignal),
}

struct Core {
    room_id: String,
    // Room the relay still lists us in; outlives a reset caused by `bye`
    relay_room: Option<String>,
    membership: MembershipState,
    media: MediaSource,
    subscriptions: Vec<Subscription>,
    local_is_big: bool,
    is_loading: bool,
    last_error: Option<SessionErrorRecord>,
}

struct Inner {
    core: Mutex<Core>,
    negotiator: SessionNegotiator,
    signaling: Arc<dyn SignalingChannel>,
    config: PeerRoomConfig,
    signals: mpsc::UnboundedSender<Signal>,
    epoch: AtomicU64,
    state: watch::Sender<SessionSnapshot>,
    actor: JoinHandle<()>,
}

/// One client's membership in a two-party room.
///
/// Cloning yields another handle to the same session. Must be created inside a
/// tokio runtime. Call [`leave`](Self::leave) before dropping the last handle
/// so the relay and the peer connection are released.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<Inner>,
}

impl RoomSession {
    pub fn new(
        config: PeerRoomConfig,
        capture: Arc<dyn CaptureBackend>,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionSnapshot::default());
        let negotiator = SessionNegotiator::new(
            connector,
            signaling.clone(),
            config.rtc_configuration(),
            peer_tx,
        );

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            core: Mutex::new(Core {
                room_id: String::new(),
                relay_room: None,
                membership: MembershipState::NotJoined,
                media: MediaSource::new(capture),
                subscriptions: Vec::new(),
                local_is_big: false,
                is_loading: false,
                last_error: None,
            }),
            negotiator,
            signaling,
            config,
            signals: signal_tx,
            epoch: AtomicU64::new(0),
            state,
            actor: tokio::spawn(run(weak.clone(), signal_rx, peer_rx)),
        });

        Self { inner }
    }

    /// Join `room_id`: acquire local media if none is live, open a peer
    /// session, subscribe to the room's signaling and announce ourselves.
    ///
    /// A blank room id is ignored, as is a join while already in a room.
    /// Membership becomes `Joined` without waiting for the relay.
    pub async fn join(&self, room_id: &str) -> Result<(), SessionError> {
        let room = room_id.trim();
        if room.is_empty() {
            log::debug!("Ignoring join with a blank room id");
            return Ok(());
        }

        let inner = &self.inner;
        let mut core = inner.core.lock().await;
        if core.membership != MembershipState::NotJoined {
            log::warn!(
                "Already in room {}, ignoring join to {}",
                core.room_id,
                room
            );
            return Ok(());
        }

        log::info!("Joining room {}", room);
        core.membership = MembershipState::Joining;
        core.room_id = room.to_string();
        core.is_loading = true;
        core.last_error = None;
        inner.publish(&core).await;

        if !core.media.has_live_capture() {
            let defaults = inner.config.default_constraints();
            if let Err(e) = core.media.initialize(&defaults).await.map(|_| ()) {
                let error = SessionError::from(e);
                core.membership = MembershipState::NotJoined;
                core.room_id.clear();
                core.is_loading = false;
                inner.record(&mut core, &error);
                inner.publish(&core).await;
                return Err(error);
            }
        }

        let stale = core.relay_room.clone().filter(|r| r != room);
        if let Some(previous) = stale {
            core.relay_room = None;
            let _ = inner.leave_relay(&previous).await;
        }

        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let local = core.media.capture_stream().cloned();
        if let Err(e) = inner
            .negotiator
            .open(room, local.as_ref(), PeerRole::Pending)
            .await
        {
            return Err(inner.fail_membership(&mut core, e).await);
        }

        core.subscriptions = inner.subscribe(epoch);
        if let Err(e) = inner
            .signaling
            .send(events::JOIN, room, Value::String(room.to_string()))
            .await
        {
            return Err(inner.fail_membership(&mut core, e).await);
        }

        core.relay_room = Some(room.to_string());
        core.membership = MembershipState::Joined;
        core.is_loading = false;
        log::info!("Joined room {}", room);
        inner.publish(&core).await;
        Ok(())
    }

    /// Stop local capture, tell the relay and reset.
    ///
    /// Capture is stopped even when not in a room. The relay is told about the
    /// last joined room as long as it still lists us, which is the case after
    /// the peer's `bye` has already reset the membership.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let mut core = inner.core.lock().await;
        core.media.stop();

        let registered = core.relay_room.take();
        if core.membership == MembershipState::NotJoined && registered.is_none() {
            log::debug!("leave() while not in a room");
            inner.publish(&core).await;
            return Ok(());
        }

        let room = registered.unwrap_or_else(|| core.room_id.clone());
        let sent = inner.leave_relay(&room).await;
        inner.reset_locked(&mut core).await;
        log::info!("Left room {}", room);
        inner.publish(&core).await;
        sent
    }

    /// Tear the membership down: close the peer session, drop signaling
    /// subscriptions and clear transient state. Local capture is kept.
    pub async fn reset(&self) {
        let mut core = self.inner.core.lock().await;
        self.inner.reset_locked(&mut core).await;
        self.inner.publish(&core).await;
    }

    /// Switch the capture device of `kind`. While joined, the switch is
    /// followed by a fresh peer session and a new offer; if that session
    /// cannot be opened the membership is reset.
    pub async fn switch_device(&self, kind: DeviceKind, device_id: &str) -> Result<(), SessionError> {
        let inner = &self.inner;
        let mut core = inner.core.lock().await;
        core.is_loading = true;
        inner.publish(&core).await;

        let switched = core
            .media
            .switch_device(kind, device_id)
            .await
            .map(|_| ())
            .map_err(SessionError::from);
        core.is_loading = false;
        if let Err(e) = switched {
            inner.record(&mut core, &e);
            inner.publish(&core).await;
            return Err(e);
        }

        if core.membership != MembershipState::Joined {
            inner.publish(&core).await;
            return Ok(());
        }

        let epoch = inner.epoch.load(Ordering::SeqCst);
        let local = core.media.capture_stream().cloned();
        if let Err(e) = inner
            .negotiator
            .open(&core.room_id, local.as_ref(), PeerRole::Offerer)
            .await
        {
            return Err(inner.fail_membership(&mut core, e).await);
        }
        log::info!("Renegotiating room {} after {} switch", core.room_id, kind);
        inner.publish(&core).await;
        drop(core);

        let result = inner.negotiator.create_and_send_offer().await;
        inner.settle(epoch, &result).await;
        result.map(|_| ())
    }

    pub async fn toggle_audio(&self) -> bool {
        let mut core = self.inner.core.lock().await;
        let enabled = core.media.toggle_audio();
        self.inner.publish(&core).await;
        enabled
    }

    pub async fn toggle_video(&self) -> bool {
        let mut core = self.inner.core.lock().await;
        let enabled = core.media.toggle_video();
        self.inner.publish(&core).await;
        enabled
    }

    /// Exchange the big and small roles. Returns whether local is now big.
    pub async fn swap_streams(&self) -> bool {
        let mut core = self.inner.core.lock().await;
        core.local_is_big = !core.local_is_big;
        self.inner.publish(&core).await;
        core.local_is_big
    }

    pub async fn set_local_big(&self, local_is_big: bool) {
        let mut core = self.inner.core.lock().await;
        core.local_is_big = local_is_big;
        self.inner.publish(&core).await;
    }

    /// Enumerate devices and acquire capture with the configured defaults
    pub async fn initialize_local_devices(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let mut core = inner.core.lock().await;
        core.is_loading = true;
        core.last_error = None;
        inner.publish(&core).await;

        let defaults = inner.config.default_constraints();
        let result = core
            .media
            .initialize(&defaults)
            .await
            .map(|_| ())
            .map_err(SessionError::from);
        core.is_loading = false;
        if let Err(e) = &result {
            inner.record(&mut core, e);
        }
        inner.publish(&core).await;
        result
    }

    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, SessionError> {
        let mut core = self.inner.core.lock().await;
        let devices = core.media.enumerate_devices().await?;
        self.inner.publish(&core).await;
        Ok(devices)
    }

    /// Re-enumerate devices and report what was plugged or unplugged
    pub async fn refresh_devices(&self) -> Result<Vec<DeviceEvent>, SessionError> {
        let mut core = self.inner.core.lock().await;
        let changes = core.media.refresh_devices().await?;

        for change in &changes {
            if let DeviceEvent::Disconnected(device) = change {
                let in_use = core
                    .media
                    .capture_stream()
                    .is_some_and(|s| s.tracks().iter().any(|t| t.device_id() == Some(device.id.as_str())));
                if in_use {
                    log::warn!("Capture device {} ({}) was unplugged", device.label, device.id);
                }
            }
        }
        self.inner.publish(&core).await;
        Ok(changes)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }
}

impl Inner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, core: &Core, epoch: u64) -> bool {
        core.membership != MembershipState::NotJoined && epoch == self.current_epoch()
    }

    async fn publish(&self, core: &Core) {
        let peer = self.negotiator.status().await;
        let routing = route(
            core.media.capture_stream(),
            peer.remote_stream.as_ref(),
            core.local_is_big,
        );
        self.state.send_replace(SessionSnapshot {
            room_id: (!core.room_id.is_empty()).then(|| core.room_id.clone()),
            membership: core.membership,
            role: peer.role,
            has_peer_session: peer.generation.is_some(),
            connection_state: peer.connection_state,
            ice_state: peer.ice_state,
            remote_stream: peer.remote_stream,
            routing,
            local_is_big: core.local_is_big,
            is_loading: core.is_loading,
            last_error: core.last_error.clone(),
            media: core.media.state().clone(),
        });
    }

    fn record(&self, core: &mut Core, error: &SessionError) {
        log::warn!("Session error ({:?}): {}", error.kind(), error);
        core.last_error = Some(SessionErrorRecord::new(error));
    }

    /// Single teardown path
    async fn reset_locked(&self, core: &mut Core) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for subscription in core.subscriptions.drain(..) {
            self.signaling.off(&subscription);
        }
        self.negotiator.close().await;

        core.membership = MembershipState::NotJoined;
        core.room_id.clear();
        core.is_loading = false;
        core.last_error = None;
        log::info!("Session reset");
    }

    /// Reset after an error that leaves no usable peer session
    async fn fail_membership(&self, core: &mut Core, error: SessionError) -> SessionError {
        log::warn!("Giving up room {}: {}", core.room_id, error);
        self.reset_locked(core).await;
        self.record(core, &error);
        self.publish(core).await;
        error
    }

    async fn leave_relay(&self, room: &str) -> Result<(), SessionError> {
        let sent = self
            .signaling
            .send(events::LEAVE, room, Value::String(room.to_string()))
            .await;
        if let Err(e) = &sent {
            log::warn!("Failed to notify the relay about leaving {}: {}", room, e);
        }
        sent
    }

    fn subscribe(&self, epoch: u64) -> Vec<Subscription> {
        events::INBOUND
            .iter()
            .map(|&event| {
                let queue = self.signals.clone();
                self.signaling.on(
                    event,
                    Arc::new(move |payload: Value| {
                        if queue.send(Signal { epoch, event, payload }).is_err() {
                            log::debug!("Session gone, dropping '{}'", event);
                        }
                    }),
                )
            })
            .collect()
    }

    /// Record the outcome of a negotiation step that ran without the session
    /// lock, unless the membership it belonged to is over.
    async fn settle(&self, epoch: u64, result: &Result<bool, SessionError>) {
        let mut core = self.core.lock().await;
        if !self.is_current(&core, epoch) {
            if let Err(e) = result {
                log::debug!("Discarding error from an ended membership: {}", e);
            }
            return;
        }
        if let Err(e) = result {
            self.record(&mut core, e);
        }
        self.publish(&core).await;
    }

    /// Make sure a session that has not negotiated yet is open. Resets the
    /// membership when none can be opened.
    async fn ensure_fresh_session(&self, core: &mut Core, role: PeerRole) -> bool {
        if self.negotiator.is_open().await && !self.negotiator.needs_fresh_session().await {
            return true;
        }
        let local = core.media.capture_stream().cloned();
        match self.negotiator.open(&core.room_id, local.as_ref(), role).await {
            Ok(_) => true,
            Err(e) => {
                self.fail_membership(core, e).await;
                false
            }
        }
    }

    async fn on_signal(&self, signal: Signal) {
        let mut core = self.core.lock().await;
        if !self.is_current(&core, signal.epoch) {
            log::debug!("Dropping stale '{}' signal", signal.event);
            return;
        }
        log::debug!("Received '{}' in room {}", signal.event, core.room_id);

        match signal.event {
            events::READY => {
                if !self.ensure_fresh_session(&mut core, PeerRole::Offerer).await {
                    return;
                }
                self.publish(&core).await;
                drop(core);
                let result = self.negotiator.create_and_send_offer().await;
                self.settle(signal.epoch, &result).await;
            }
            events::OFFER => {
                let desc = match SessionDescription::from_payload(signal.payload) {
                    Ok(desc) => desc,
                    Err(e) => {
                        self.record(&mut core, &e);
                        self.publish(&core).await;
                        return;
                    }
                };
                if self.negotiator.needs_fresh_session().await {
                    log::info!("Remote peer renegotiates room {}", core.room_id);
                }
                if !self.ensure_fresh_session(&mut core, PeerRole::Answerer).await {
                    return;
                }
                if let Err(e) = self.negotiator.apply_remote_description(desc).await {
                    self.record(&mut core, &e);
                    self.publish(&core).await;
                    return;
                }
                self.publish(&core).await;
                drop(core);
                let result = self.negotiator.create_and_send_answer().await;
                self.settle(signal.epoch, &result).await;
            }
            events::ANSWER => {
                let applied = match SessionDescription::from_payload(signal.payload) {
                    Ok(desc) => self.negotiator.apply_remote_description(desc).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = applied {
                    self.record(&mut core, &e);
                }
                self.publish(&core).await;
            }
            events::ICE_CANDIDATE => {
                match serde_json::from_value::<CandidatePayload>(signal.payload) {
                    Ok(payload) => {
                        if let Err(e) = self.negotiator.add_remote_candidate(payload.into()).await {
                            log::warn!("Dropping ICE candidate: {}", e);
                        }
                    }
                    Err(e) => log::warn!("Dropping malformed ice_candidate payload: {}", e),
                }
            }
            events::LEAVED | events::BYE => {
                log::info!("'{}' received, leaving room {}", signal.event, core.room_id);
                if signal.event == events::LEAVED {
                    core.relay_room = None;
                }
                self.reset_locked(&mut core).await;
                self.publish(&core).await;
            }
            events::FULL => {
                let error = SessionError::signaling(format!("room {} is full", core.room_id));
                core.relay_room = None;
                self.reset_locked(&mut core).await;
                self.record(&mut core, &error);
                self.publish(&core).await;
            }
            other => log::debug!("Ignoring unexpected signaling event '{}'", other),
        }
    }

    async fn on_peer_event(&self, signal: PeerSignal) {
        let mut core = self.core.lock().await;
        match self.negotiator.handle_peer_event(signal).await {
            Ok(true) => self.publish(&core).await,
            Ok(false) => {}
            Err(e) => {
                self.record(&mut core, &e);
                self.publish(&core).await;
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.actor.abort();
        let core = self.core.get_mut();
        for subscription in core.subscriptions.drain(..) {
            self.signaling.off(&subscription);
        }
    }
}

async fn run(
    inner: Weak<Inner>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut peers: mpsc::UnboundedReceiver<PeerSignal>,
) {
    loop {
        let input = tokio::select! {
            Some(signal) = signals.recv() => Input::Signal(signal),
            Some(event) = peers.recv() => Input::Peer(event),
            else => break,
        };
        let Some(session) = inner.upgrade() else {
            break;
        };
        match input {
            Input::Signal(signal) => session.on_signal(signal).await,
            Input::Peer(event) => session.on_peer_event(event).await,
        }
    }
    log::debug!("Session actor stopped");
}
