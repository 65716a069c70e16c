//! WebSocket broker bridge.
//!
//! [`WsBridge`] is how robots and agents outside the process reach the
//! context manager.  Clients exchange JSON text frames:
//!
//! | direction | frame |
//! |-----------|-------|
//! | in  | `{"type":"notify","source":"AMR_LIFT1","data":"(robotPosition …)"}` |
//! | in  | `{"type":"query","id":"q1","sender":"TaskManager","pattern":"(context …)"}` |
//! | out | `{"type":"result","id":"q1","result":"(result …)"}` |
//! | out | `{"type":"error","id":"q1","message":"…"}` |
//! | out | `{"type":"alert","component":"…","code":502,"message":"…"}` |
//!
//! Notifications are published on [`Topic::Perception`]; queries are
//! forwarded through a [`QueryClient`] and answered on the same connection.
//! Queries from one client run concurrently, so answers may arrive out of
//! request order; clients correlate them by `id`.  Malformed frames are
//! logged and ignored.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use robocm_types::{CmError, EventPayload};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::query::QueryClient;

/// Frames accepted from clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Notify { source: String, data: String },
    Query { id: String, sender: String, pattern: String },
}

/// Frames sent to clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Result { id: String, result: String },
    Error { id: String, message: String },
    Alert { component: String, code: u32, message: String },
}

/// Outbound frames buffered per connection.
const OUTBOUND_CAPACITY: usize = 64;

/// Bridge between WebSocket clients and the in-process bus.
#[derive(Clone)]
pub struct WsBridge {
    bus: Arc<EventBus>,
    queries: QueryClient,
}

impl WsBridge {
    pub fn new(bus: Arc<EventBus>, queries: QueryClient) -> Self {
        Self { bus, queries }
    }

    /// Bind `addr` and serve clients until the listener fails.
    ///
    /// # Errors
    ///
    /// [`CmError::Channel`] if the listener cannot be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), CmError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CmError::Channel(format!("ws bind error on {addr}: {e}")))?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve clients from an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(local) = listener.local_addr() {
            info!(addr = %local, "broker bridge listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "ws accept error"),
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), CmError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| CmError::Channel(format!("ws handshake from {peer}: {e}")))?;
        debug!(peer = %peer, "ws client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut alerts = self.bus.subscribe_to(Topic::SystemAlerts);
        let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_CAPACITY);

        loop {
            let frame = tokio::select! {
                Some(frame) = out_rx.recv() => frame,
                event = alerts.next() => match event {
                    Some(event) => match event.payload {
                        EventPayload::SystemAlert { component, code, message } => {
                            ServerFrame::Alert { component, code, message }
                        }
                        EventPayload::Notification(_) => continue,
                    },
                    None => break,
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_incoming(text.as_str(), &out_tx);
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                },
            };
            let json = serde_json::to_string(&frame).map_err(|e| CmError::Channel(e.to_string()))?;
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        debug!(peer = %peer, "ws client disconnected");
        Ok(())
    }

    /// Route one inbound text frame.
    fn handle_incoming(&self, text: &str, out: &mpsc::Sender<ServerFrame>) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame");
                return;
            }
        };
        match frame {
            ClientFrame::Notify { source, data } => {
                if let Err(e) = self.bus.notify(source, data) {
                    warn!(error = %e, "notification not delivered");
                }
            }
            ClientFrame::Query { id, sender, pattern } => {
                let queries = self.queries.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let frame = match queries.ask(sender, pattern).await {
                        Ok(result) => ServerFrame::Result { id, result },
                        Err(e) => ServerFrame::Error {
                            id,
                            message: e.to_string(),
                        },
                    };
                    let _ = out.send(frame).await;
                });
            }
        }
    }
}
