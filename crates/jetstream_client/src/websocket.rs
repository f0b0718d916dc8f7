use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{Connection, ConnectionEvent, TransportAdapter};

/// Header carrying the session token on (re)connect.
pub const SESSION_TOKEN_HEADER: &str = "X-Jetstream-SessionToken";

/// WebSocket channel adapter. Frames are text messages; the session token
/// rides in the [`SESSION_TOKEN_HEADER`] request header.
pub struct WebSocketAdapter {
    url: String,
}

impl WebSocketAdapter {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(WebSocketAdapter { url: url.into() })
    }
}

#[async_trait]
impl TransportAdapter for WebSocketAdapter {
    async fn open(&self, session_token: Option<String>) -> Result<Connection, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        if let Some(token) = session_token {
            let value = HeaderValue::from_str(&token)
                .map_err(|_| TransportError::ConnectFailed("invalid session token".to_owned()))?;
            request.headers_mut().insert(SESSION_TOKEN_HEADER, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ConnectionEvent>();

        // Write pump: drains the outbound queue into the socket; closing
        // the queue closes the socket.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::text(frame)).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Read pump: hops socket frames onto the transport's channel.
        tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(WsMessage::Text(text)) => {
                        if inbound_tx
                            .send(ConnectionEvent::Frame(text.as_str().to_owned()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        let _ = inbound_tx.send(ConnectionEvent::Closed(code));
                        return;
                    }
                    // Pings and pongs are answered by tungstenite itself;
                    // binary frames are not part of this protocol.
                    Ok(other) => debug!("Ignoring non-text frame: {:?}", other),
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(ConnectionEvent::Closed(None));
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
