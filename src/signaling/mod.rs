//! Signaling relay access
//!
//! The session only needs a narrow named-event interface: send an event scoped
//! to a room, and register/unregister handlers per event name. Concrete
//! transports implement [`SignalingChannel`]; [`MemoryRelay`] provides an
//! in-process relay with the same room semantics as the real one.

pub mod memory;
#[cfg(feature = "ws-signaling")]
pub mod websocket;

pub use memory::{MemoryChannel, MemoryRelay, RelayRecord};
#[cfg(feature = "ws-signaling")]
pub use websocket::WsSignalingChannel;

use crate::errors::SessionError;
use crate::webrtc::IceCandidate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Wire event names
pub mod events {
    pub const JOIN: &str = "join";
    pub const READY: &str = "ready";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice_candidate";
    pub const LEAVE: &str = "leave";
    pub const LEAVED: &str = "leaved";
    pub const BYE: &str = "bye";
    pub const FULL: &str = "full";

    /// Events a joined session listens for
    pub const INBOUND: &[&str] = &[READY, OFFER, ANSWER, ICE_CANDIDATE, LEAVED, BYE, FULL];
}

/// Callback invoked with the payload of a received event
pub type SignalHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handle returned by [`SignalingChannel::on`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    event: String,
}

impl Subscription {
    pub fn new(id: u64, event: impl Into<String>) -> Self {
        Self {
            id,
            event: event.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Bidirectional named-event transport to the relay.
///
/// Delivery is treated as reliable and ordered per event name; reconnection is
/// the implementation's concern.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, event: &str, room: &str, payload: Value) -> Result<(), SessionError>;

    fn on(&self, event: &str, handler: SignalHandler) -> Subscription;

    fn off(&self, subscription: &Subscription);
}

/// `ice_candidate` payload as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub label: Option<u16>,
    pub id: Option<String>,
    pub candidate: String,
}

impl From<IceCandidate> for CandidatePayload {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            label: candidate.sdp_mline_index,
            id: candidate.sdp_mid,
            candidate: candidate.candidate,
        }
    }
}

impl From<CandidatePayload> for IceCandidate {
    fn from(payload: CandidatePayload) -> Self {
        IceCandidate {
            candidate: payload.candidate,
            sdp_mid: payload.id,
            sdp_mline_index: payload.label,
        }
    }
}

/// Per-event handler table shared by the channel implementations
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(u64, SignalHandler)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, handler: SignalHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handlers
            .lock()
            .expect("lock poisoned")
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        Subscription::new(id, event)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut handlers = self.handlers.lock().expect("lock poisoned");
        if let Some(list) = handlers.get_mut(subscription.event()) {
            list.retain(|(id, _)| *id != subscription.id());
            if list.is_empty() {
                handlers.remove(subscription.event());
            }
        }
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .expect("lock poisoned")
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler registered for `event`. Handlers run outside the lock.
    pub fn dispatch(&self, event: &str, payload: &Value) {
        let targets: Vec<SignalHandler> = self
            .handlers
            .lock()
            .expect("lock poisoned")
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if targets.is_empty() {
            log::debug!("No handler for signaling event '{}'", event);
        }
        for handler in targets {
            handler(payload.clone());
        }
    }
}
