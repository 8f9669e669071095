//! In-process signaling relay
//!
//! Mirrors the behavior of the room relay: two participants per room, `ready`
//! to the other member when the second joins (or a member joins again),
//! `full` for a third, message forwarding to the other member, and
//! `leaved`/`bye` on leave.

use super::{events, HandlerRegistry, SignalHandler, SignalingChannel, Subscription};
use crate::errors::SessionError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const ROOM_CAPACITY: usize = 2;

/// One event accepted by the relay
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRecord {
    pub client: String,
    pub event: String,
    pub room: String,
    pub payload: Value,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, Vec<String>>,
    clients: HashMap<String, Arc<HandlerRegistry>>,
    log: Vec<RelayRecord>,
}

/// Shared relay; hand out one [`MemoryChannel`] per client
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    failing: Arc<AtomicBool>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and return its channel
    pub fn connect(&self, client_id: impl Into<String>) -> MemoryChannel {
        let client_id = client_id.into();
        let handlers = Arc::new(HandlerRegistry::new());
        self.state
            .lock()
            .expect("lock poisoned")
            .clients
            .insert(client_id.clone(), handlers.clone());
        log::debug!("Relay client {} connected", client_id);

        MemoryChannel {
            client_id,
            relay: self.clone(),
            handlers,
        }
    }

    /// Every event accepted so far, in order
    pub fn records(&self) -> Vec<RelayRecord> {
        self.state.lock().expect("lock poisoned").log.clone()
    }

    /// Number of `event` messages sent by `client`
    pub fn count(&self, client: &str, event: &str) -> usize {
        self.state
            .lock()
            .expect("lock poisoned")
            .log
            .iter()
            .filter(|r| r.client == client && r.event == event)
            .count()
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every subsequent send fail, as if the transport were down
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn route(&self, client: &str, event: &str, room: &str, payload: Value) -> Result<(), SessionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SessionError::signaling(format!(
                "relay unreachable while sending '{}'",
                event
            )));
        }

        let mut deliveries: Vec<(Arc<HandlerRegistry>, &'static str, Value)> = Vec::new();
        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.log.push(RelayRecord {
                client: client.to_string(),
                event: event.to_string(),
                room: room.to_string(),
                payload: payload.clone(),
            });

            let registry_of = |state: &RelayState, id: &str| state.clients.get(id).cloned();

            match event {
                events::JOIN => {
                    let members = state.rooms.entry(room.to_string()).or_default();
                    let rejoined = members.iter().any(|m| m == client);
                    if !rejoined && members.len() >= ROOM_CAPACITY {
                        log::info!("Room {} is full, rejecting {}", room, client);
                        if let Some(reg) = registry_of(&state, client) {
                            deliveries.push((reg, events::FULL, Value::Null));
                        }
                    } else {
                        // A repeated join restarts negotiation like a fresh one
                        if rejoined {
                            log::info!("Client {} re-joined room {}", client, room);
                        } else {
                            members.push(client.to_string());
                            log::info!("Client {} joined room {}", client, room);
                        }
                        let others: Vec<String> =
                            members.iter().filter(|m| *m != client).cloned().collect();
                        for other in others {
                            if let Some(reg) = registry_of(&state, &other) {
                                deliveries.push((reg, events::READY, Value::Null));
                            }
                        }
                    }
                }
                events::LEAVE => {
                    let (was_member, remaining) = match state.rooms.get_mut(room) {
                        Some(members) => {
                            let before = members.len();
                            members.retain(|m| m != client);
                            (members.len() < before, members.clone())
                        }
                        None => (false, Vec::new()),
                    };
                    if remaining.is_empty() {
                        state.rooms.remove(room);
                    }
                    log::info!("Client {} left room {}", client, room);
                    if let Some(reg) = registry_of(&state, client) {
                        deliveries.push((reg, events::LEAVED, Value::Null));
                    }
                    if was_member {
                        for other in remaining {
                            if let Some(reg) = registry_of(&state, &other) {
                                deliveries.push((reg, events::BYE, Value::Null));
                            }
                        }
                    } else {
                        log::debug!("Client {} was not a member of room {}", client, room);
                    }
                }
                _ => {
                    let members = state.rooms.get(room).cloned().unwrap_or_default();
                    if !members.iter().any(|m| m == client) {
                        log::warn!(
                            "Dropping '{}' from {}: not a member of room {}",
                            event,
                            client,
                            room
                        );
                        return Ok(());
                    }
                    let forward = forwarded_name(event);
                    for other in members.iter().filter(|m| *m != client) {
                        if let (Some(reg), Some(name)) = (registry_of(&state, other), forward) {
                            deliveries.push((reg, name, payload.clone()));
                        }
                    }
                }
            }
        }

        for (registry, name, payload) in deliveries {
            registry.dispatch(name, &payload);
        }
        Ok(())
    }
}

fn forwarded_name(event: &str) -> Option<&'static str> {
    match event {
        events::OFFER => Some(events::OFFER),
        events::ANSWER => Some(events::ANSWER),
        events::ICE_CANDIDATE => Some(events::ICE_CANDIDATE),
        _ => None,
    }
}

/// One client's connection to a [`MemoryRelay`]
pub struct MemoryChannel {
    client_id: String,
    relay: MemoryRelay,
    handlers: Arc<HandlerRegistry>,
}

impl MemoryChannel {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Handlers currently registered for `event`
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.handler_count(event)
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn send(&self, event: &str, room: &str, payload: Value) -> Result<(), SessionError> {
        log::debug!("{} -> relay: '{}' in room {}", self.client_id, event, room);
        self.relay.route(&self.client_id, event, room, payload)
    }

    fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        self.handlers.subscribe(event, handler)
    }

    fn off(&self, subscription: &Subscription) {
        self.handlers.unsubscribe(subscription);
    }
}
