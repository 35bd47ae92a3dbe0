//! WebSocket Surface
//!
//! One receive loop per connection. Outbound frames never go through this
//! loop: request tasks send through the supervisor, which owns the sink via
//! [`AxumTransport`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, Instrument};

use gateway_core::{
    CloseReason, ConnectionId, ErrorCode, StreamEvent, Transport, TransportError,
};

use crate::server::AppState;

/// Send half of an axum WebSocket
pub struct AxumTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl AxumTransport {
    /// Wrap the send half of a socket
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Whether [`Transport::close`] was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the transport has been closed
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }
}

#[async_trait]
impl Transport for AxumTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Text(text.into())).await {
            Ok(()) => Ok(()),
            Err(_) if self.is_closed() => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the receive loop even if it is not waiting yet
        self.close_notify.notify_one();

        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

/// `GET /api/v1/completion/ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, peer: SocketAddr) {
    let (sink, stream) = socket.split();
    let transport = Arc::new(AxumTransport::new(sink));
    let connection_id = state.supervisor.accept(transport.clone(), Some(peer));

    let span = tracing::info_span!("connection", %connection_id);
    receive_loop(state, transport, connection_id, stream)
        .instrument(span)
        .await;
}

async fn receive_loop(
    state: Arc<AppState>,
    transport: Arc<AxumTransport>,
    connection_id: ConnectionId,
    mut stream: SplitStream<WebSocket>,
) {
    state.orchestrator.welcome(&connection_id).await;

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            () = transport.closed() => {
                debug!("Connection closed by supervisor");
                break;
            }
        };

        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        };

        if !state.supervisor.record_activity(&connection_id) {
            break;
        }

        match message {
            Message::Text(text) => {
                state
                    .orchestrator
                    .handle_frame(&connection_id, text.as_str())
                    .await;
            }
            Message::Binary(_) => {
                state
                    .supervisor
                    .send(
                        &connection_id,
                        &StreamEvent::error(
                            ErrorCode::InvalidRequest,
                            "Binary frames are not supported",
                        ),
                    )
                    .await;
            }
            // Pings are answered by axum
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    if state
        .supervisor
        .close(&connection_id, CloseReason::ClientDisconnect)
        .await
    {
        info!("Client disconnected");
    }
}
