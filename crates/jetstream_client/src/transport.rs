use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::lock;
use crate::message::Message;
use crate::session::Session;

/// Server-signalled close codes that put the transport in `Fatal`.
pub const CLOSE_CODE_DENIED: u16 = 4096;
pub const CLOSE_CODE_CLOSED: u16 = 4097;

const RECONNECT_DELAY: Duration = Duration::from_millis(100);
const PING_MIN_MS: u64 = 9_000;
const PING_MAX_MS: u64 = 11_000;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Closed,
    Connecting,
    Connected,
    Fatal,
}

/// What an adapter's read side yields.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// One UTF-8 JSON frame.
    Frame(String),
    /// The channel closed, with the close code when the peer sent one.
    Closed(Option<u16>),
}

/// An open channel: frames written to `outbound` reach the server, frames
/// the server sends arrive on `inbound`. Dropping `outbound` closes the
/// channel.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// The opaque in-order message pipe the core consumes. A WebSocket
/// implementation lives in [`websocket`](crate::websocket); an in-process
/// pair for tests lives in [`memory`](crate::memory).
#[async_trait]
pub trait TransportAdapter: Send + Sync + 'static {
    /// Opens the channel, advertising the session token out-of-band when
    /// one exists.
    async fn open(&self, session_token: Option<String>) -> Result<Connection, TransportError>;

    /// Cheap reachability probe consulted before each reconnect attempt.
    async fn reachable(&self) -> bool {
        true
    }
}

/// Connection lifecycle, reply correlation, the non-acked resend buffer,
/// and the keep-alive ping, on top of a pluggable adapter.
pub struct Transport {
    adapter: Arc<dyn TransportAdapter>,
    status_tx: watch::Sender<TransportStatus>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    server_index: Arc<AtomicU64>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    waiting_reply: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    /// Verbatim frames by index, so resends are byte-identical.
    non_acked: Mutex<BTreeMap<u64, String>>,
    session: Mutex<Option<Arc<Session>>>,
    user_closed: AtomicBool,
    running: AtomicBool,
    shutdown: Notify,
}

impl Transport {
    /// Builds the transport. Returns the inbound message stream (already
    /// demultiplexed: pings and claimed replies are consumed internally)
    /// and the status watch.
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        server_index: Arc<AtomicU64>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Message>,
        watch::Receiver<TransportStatus>,
    ) {
        let (status_tx, status_rx) = watch::channel(TransportStatus::Closed);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport {
            adapter,
            status_tx,
            inbound_tx,
            server_index,
            outbound: Mutex::new(None),
            waiting_reply: Mutex::new(HashMap::new()),
            non_acked: Mutex::new(BTreeMap::new()),
            session: Mutex::new(None),
            user_closed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        (transport, inbound_rx, status_rx)
    }

    pub fn status(&self) -> TransportStatus {
        *self.status_tx.borrow()
    }

    pub fn set_session(&self, session: Arc<Session>) {
        *lock(&self.session) = Some(session);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    /// Starts the connection loop. Subsequent calls are no-ops while the
    /// loop is alive.
    pub fn connect(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Transport already running");
            return;
        }
        tokio::spawn(async move {
            self.run().await;
        });
    }

    /// User-initiated disconnect: suppresses the reconnect loop and
    /// abandons in-flight replies.
    pub fn disconnect(&self) {
        self.user_closed.store(true, Ordering::SeqCst);
        *lock(&self.outbound) = None;
        lock(&self.waiting_reply).clear();
        self.shutdown.notify_one();
    }

    /// Drops the current connection and lets the loop re-open it, session
    /// token and all.
    pub fn reconnect(&self) {
        debug!("Reconnect requested");
        self.shutdown.notify_one();
    }

    /// Serializes and sends a message. Non-ping messages sent while a
    /// session exists enter the non-acked buffer first, so a later resend
    /// re-transmits the identical frame even when the write itself is
    /// skipped because the channel is down.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let frame = serde_json::to_string(message)?;
        if !message.is_ping() && lock(&self.session).is_some() {
            lock(&self.non_acked).insert(message.index(), frame.clone());
        }
        self.write_frame(frame);
        Ok(())
    }

    /// Sends a message and registers a reply waiter for its index. The
    /// waiter fires at most once; it is abandoned on disconnect.
    pub fn send_with_reply(
        &self,
        message: &Message,
    ) -> Result<oneshot::Receiver<Message>, TransportError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiting_reply).insert(message.index(), tx);
        if let Err(e) = self.send(message) {
            lock(&self.waiting_reply).remove(&message.index());
            return Err(e);
        }
        Ok(rx)
    }

    fn write_frame(&self, frame: String) {
        match &*lock(&self.outbound) {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!("Outbound channel gone; frame dropped");
                }
            }
            None => debug!("Not connected; frame not written"),
        }
    }

    fn set_status(&self, status: TransportStatus) {
        if *self.status_tx.borrow() != status {
            info!("Transport status: {:?}", status);
            let _ = self.status_tx.send(status);
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.user_closed.load(Ordering::SeqCst) {
                self.set_status(TransportStatus::Closed);
                return;
            }
            self.set_status(TransportStatus::Connecting);

            while !self.adapter.reachable().await {
                if self.user_closed.load(Ordering::SeqCst) {
                    self.set_status(TransportStatus::Closed);
                    return;
                }
                sleep(RECONNECT_DELAY).await;
            }

            // The session token rides along out-of-band so the server can
            // resume the existing session.
            let token = lock(&self.session).as_ref().map(|s| s.token().to_owned());
            let mut connection = match self.adapter.open(token).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Failed to open channel: {}", e);
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            *lock(&self.outbound) = Some(connection.outbound.clone());
            self.set_status(TransportStatus::Connected);

            let fatal = self.drive(&mut connection).await;

            *lock(&self.outbound) = None;
            // Disconnect drops outstanding replies.
            lock(&self.waiting_reply).clear();

            if fatal {
                warn!("Server signalled a fatal close; transport is done");
                self.set_status(TransportStatus::Fatal);
                return;
            }
            if self.user_closed.load(Ordering::SeqCst) {
                self.set_status(TransportStatus::Closed);
                return;
            }
            self.set_status(TransportStatus::Closed);
        }
    }

    /// Pumps one open connection: inbound frames and the jittered
    /// keep-alive cadence. Returns whether the close was fatal.
    async fn drive(&self, connection: &mut Connection) -> bool {
        let mut next_ping = Instant::now() + self.ping_interval();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return false,
                event = connection.inbound.recv() => match event {
                    Some(ConnectionEvent::Frame(raw)) => self.handle_frame(&raw),
                    Some(ConnectionEvent::Closed(code)) => {
                        debug!("Channel closed with code {:?}", code);
                        return matches!(code, Some(CLOSE_CODE_DENIED) | Some(CLOSE_CODE_CLOSED));
                    }
                    None => {
                        debug!("Channel dropped");
                        return false;
                    }
                },
                _ = sleep_until(next_ping) => {
                    self.send_keepalive();
                    // Fixed jittered cadence; sends and receives do not
                    // reset it.
                    next_ping = Instant::now() + self.ping_interval();
                }
            }
        }
    }

    fn ping_interval(&self) -> Duration {
        Duration::from_millis(rand::rng().random_range(PING_MIN_MS..=PING_MAX_MS))
    }

    fn send_keepalive(&self) {
        let Some(session) = lock(&self.session).clone() else {
            return;
        };
        let ping = Message::Ping {
            index: session.index_for_message(),
            ack: self.server_index.load(Ordering::SeqCst),
            resend_missing: None,
        };
        if let Err(e) = self.send(&ping) {
            warn!("Failed to send keep-alive: {}", e);
        }
    }

    fn handle_frame(&self, raw: &str) {
        for message in Message::decode_batch(raw) {
            self.server_index
                .fetch_max(message.index(), Ordering::SeqCst);
            match message {
                Message::Ping {
                    ack,
                    resend_missing,
                    ..
                } => self.handle_ack(ack, resend_missing == Some(true)),
                other => {
                    if let Some(reply_to) = other.reply_to() {
                        if let Some(waiter) = lock(&self.waiting_reply).remove(&reply_to) {
                            let _ = waiter.send(other);
                            continue;
                        }
                        // Unclaimed (or duplicate) replies flow up to the
                        // client, which treats them as no-ops.
                    }
                    if self.inbound_tx.send(other).is_err() {
                        debug!("Inbound consumer gone; message dropped");
                    }
                }
            }
        }
    }

    /// Prunes everything the server has seen; when asked, re-transmits the
    /// remainder verbatim in index order.
    fn handle_ack(&self, ack: u64, resend_missing: bool) {
        let remaining: Vec<(u64, String)> = {
            let mut buffer = lock(&self.non_acked);
            let keep = buffer.split_off(&(ack + 1));
            *buffer = keep;
            if resend_missing {
                buffer.iter().map(|(i, f)| (*i, f.clone())).collect()
            } else {
                Vec::new()
            }
        };
        for (index, frame) in remaining {
            debug!("Resending unacknowledged message {}", index);
            self.write_frame(frame);
        }
    }

    /// Indices still awaiting a server acknowledgement.
    pub fn non_acked_indices(&self) -> Vec<u64> {
        lock(&self.non_acked).keys().copied().collect()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("status", &self.status())
            .field("non_acked", &lock(&self.non_acked).len())
            .field("waiting_reply", &lock(&self.waiting_reply).len())
            .finish()
    }
}
