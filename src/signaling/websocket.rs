//! WebSocket transport for the signaling relay
//!
//! Every frame is a JSON text message `{"event", "room", "payload"}`. A sender
//! task drains an outgoing queue into the socket; a receiver task parses
//! incoming frames and dispatches them to the registered handlers.

use super::{HandlerRegistry, SignalHandler, SignalingChannel, Subscription};
use crate::errors::SessionError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One signaling frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    pub event: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub payload: Value,
}

/// [`SignalingChannel`] over a WebSocket connection to the relay
pub struct WsSignalingChannel {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    handlers: Arc<HandlerRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsSignalingChannel {
    /// Connect to `url` (ws:// or wss://) and start the socket tasks
    pub async fn connect(url: &str) -> Result<Self, SessionError> {
        log::info!("Connecting to signaling relay {}", url);
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| SessionError::signaling(format!("failed to connect to {}: {}", url, e)))?;
        log::info!("Connected to signaling relay {}", url);

        let (write, read) = stream.split();
        let (outgoing, queue) = mpsc::unbounded_channel();
        let handlers = Arc::new(HandlerRegistry::new());

        let tasks = vec![
            tokio::spawn(sender_task(write, queue)),
            tokio::spawn(receiver_task(read, handlers.clone())),
        ];

        Ok(Self {
            url: url.to_string(),
            outgoing,
            handlers,
            tasks,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// False once the socket has closed
    pub fn is_connected(&self) -> bool {
        !self.outgoing.is_closed()
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&self, event: &str, room: &str, payload: Value) -> Result<(), SessionError> {
        let text = encode_frame(event, room, payload)?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| SessionError::signaling(format!("relay connection to {} is closed", self.url)))?;
        log::debug!("Queued '{}' for room {}", event, room);
        Ok(())
    }

    fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        self.handlers.subscribe(event, handler)
    }

    fn off(&self, subscription: &Subscription) {
        self.handlers.unsubscribe(subscription);
    }
}

fn encode_frame(event: &str, room: &str, payload: Value) -> Result<String, SessionError> {
    let frame = SignalFrame {
        event: event.to_string(),
        room: room.to_string(),
        payload,
    };
    serde_json::to_string(&frame)
        .map_err(|e| SessionError::signaling(format!("failed to encode '{}': {}", event, e)))
}

fn decode_frame(text: &str) -> Result<SignalFrame, SessionError> {
    serde_json::from_str(text)
        .map_err(|e| SessionError::signaling(format!("malformed signaling frame: {}", e)))
}

async fn sender_task(mut write: SplitSink<WsStream, Message>, mut queue: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = write.send(message).await {
            log::error!("Failed to write to signaling relay: {}", e);
            break;
        }
    }
    log::debug!("Signaling sender stopped");
}

async fn receiver_task(mut read: SplitStream<WsStream>, handlers: Arc<HandlerRegistry>) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => match decode_frame(&text) {
                Ok(frame) => {
                    log::debug!("Relay delivered '{}' for room {}", frame.event, frame.room);
                    handlers.dispatch(&frame.event, &frame.payload);
                }
                Err(e) => log::warn!("{}", e),
            },
            Ok(Message::Close(_)) => {
                log::info!("Signaling relay closed the connection");
                break;
            }
            Err(e) => {
                log::error!("Signaling relay error: {}", e);
                break;
            }
            _ => {}
        }
    }
    log::debug!("Signaling receiver stopped");
}
