use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::Message;
use crate::transport::{Connection, ConnectionEvent, TransportAdapter};

/// In-process channel adapter. [`MemoryAdapter::pair`] yields the adapter
/// plus a server-side handle that accepts connections, reads the client's
/// outbound messages, injects inbound frames, and closes with a chosen
/// code. Used by the integration tests and for local loopback setups.
pub struct MemoryAdapter {
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
    reachable: AtomicBool,
}

/// Accept side of a [`MemoryAdapter`].
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
}

/// One accepted connection, seen from the server.
pub struct ServerConnection {
    /// The token the client advertised on open, if it had a session.
    pub session_token: Option<String>,
    to_client: mpsc::UnboundedSender<ConnectionEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryAdapter {
    pub fn pair() -> (Arc<MemoryAdapter>, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Arc::new(MemoryAdapter {
                accept_tx,
                reachable: AtomicBool::new(true),
            }),
            MemoryServer { accept_rx },
        )
    }

    /// Flips the reachability probe, holding the reconnect loop off.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportAdapter for MemoryAdapter {
    async fn open(&self, session_token: Option<String>) -> Result<Connection, TransportError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.accept_tx
            .send(ServerConnection {
                session_token,
                to_client: inbound_tx,
                from_client: outbound_rx,
            })
            .map_err(|_| TransportError::ConnectFailed("listener dropped".to_owned()))?;
        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    async fn reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

impl MemoryServer {
    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.recv().await
    }
}

impl ServerConnection {
    /// Next raw frame the client wrote, or `None` once the client side
    /// closed.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next decoded message. Frames that decode to nothing are skipped.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let frame = self.recv_frame().await?;
            if let Some(message) = Message::decode_batch(&frame).into_iter().next() {
                return Some(message);
            }
        }
    }

    /// Injects one message into the client's inbound stream.
    pub fn send(&self, message: &Message) {
        if let Ok(frame) = serde_json::to_string(message) {
            let _ = self.to_client.send(ConnectionEvent::Frame(frame));
        }
    }

    /// Injects a raw frame, valid JSON or not.
    pub fn send_frame(&self, raw: impl Into<String>) {
        let _ = self.to_client.send(ConnectionEvent::Frame(raw.into()));
    }

    /// Closes the connection towards the client with an optional close
    /// code.
    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(ConnectionEvent::Closed(code));
    }
}
