use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::message::Message;
use crate::transport::Transport;

/// Per-connection identity: the opaque token handed back by the server, the
/// outbound index space, and the inbound high-water mark.
///
/// The index counter is created by the client before the session exists
/// (the `SessionCreate` message itself occupies index 1) and shared into
/// the session on creation, so the space stays contiguous.
#[derive(Debug)]
pub struct Session {
    token: String,
    next_index: Arc<AtomicU64>,
    server_index: Arc<AtomicU64>,
}

impl Session {
    pub(crate) fn new(
        token: String,
        next_index: Arc<AtomicU64>,
        server_index: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Arc::new(Session {
            token,
            next_index,
            server_index,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Atomically reserves the next outbound message index. Indices are
    /// strictly monotonic for the life of the session.
    pub fn index_for_message(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest index observed on any inbound server message.
    pub fn server_index(&self) -> u64 {
        self.server_index.load(Ordering::SeqCst)
    }

    /// Sends a `ScopeFetch` for `name` and decodes the reply into the
    /// granted scope index or the server's structured rejection.
    pub async fn fetch(
        &self,
        transport: &Transport,
        name: &str,
        params: JsonValue,
    ) -> Result<u64, FetchError> {
        let index = self.index_for_message();
        debug!("Fetching scope `{}` with message index {}", name, index);
        let message = Message::ScopeFetch {
            index,
            name: name.to_owned(),
            params,
        };
        let reply = transport.send_with_reply(&message)?;
        match reply.await {
            Ok(Message::Reply {
                result: Some(true),
                scope_index: Some(scope_index),
                ..
            }) => Ok(scope_index),
            Ok(Message::Reply {
                error: Some(error), ..
            }) => Err(FetchError::Rejected {
                code: error.code,
                message: error.message,
            }),
            Ok(other) => {
                warn!("Malformed fetch reply: {:?}", other);
                Err(FetchError::Rejected {
                    code: 0,
                    message: "malformed fetch reply".to_owned(),
                })
            }
            Err(_) => Err(FetchError::ConnectionLost),
        }
    }
}
