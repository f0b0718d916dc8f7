use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use jetstream_model::scope::Scope;
use jetstream_model::signal::Signal;

use crate::error::ClientError;
use crate::lock;
use crate::message::{Message, PROTOCOL_VERSION};
use crate::session::Session;
use crate::transport::{Transport, TransportAdapter, TransportStatus};

/// Application-visible connection state, derived from the transport:
/// `Connected` maps to `Online`, everything else to `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Offline,
    Online,
}

/// Top-level coordinator: owns the transport and session, routes inbound
/// scope batches to attached scopes, and forwards scope flushes outward.
///
/// All message application and status handling runs on the client's
/// dispatcher task, so scopes and model objects only ever see protocol
/// effects from one logical thread.
pub struct Client {
    transport: Arc<Transport>,
    session: Mutex<Option<Arc<Session>>>,
    next_index: Arc<AtomicU64>,
    server_index: Arc<AtomicU64>,
    scopes: DashMap<u64, Arc<Scope>>,
    on_session: Signal<String>,
    on_session_denied: Signal<()>,
    on_status: Signal<ClientStatus>,
    closed: AtomicBool,
    denied: AtomicBool,
}

impl Client {
    pub fn new(adapter: Arc<dyn TransportAdapter>) -> Arc<Client> {
        let server_index = Arc::new(AtomicU64::new(0));
        let (transport, inbound, status) = Transport::new(adapter, server_index.clone());
        let client = Arc::new(Client {
            transport,
            session: Mutex::new(None),
            next_index: Arc::new(AtomicU64::new(1)),
            server_index,
            scopes: DashMap::new(),
            on_session: Signal::new(),
            on_session_denied: Signal::new(),
            on_status: Signal::new(),
            closed: AtomicBool::new(false),
            denied: AtomicBool::new(false),
        });
        let dispatcher = client.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(inbound, status).await;
        });
        client
    }

    /// Starts the transport's connection loop.
    pub fn connect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Ignoring connect on a closed client");
            return;
        }
        self.transport.clone().connect();
    }

    /// Clean shutdown: flush outstanding scope changes while the channel
    /// may still be up, stop forwarding, disconnect, and refuse further
    /// operations. In-flight reply waiters are abandoned silently.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing client");
        for entry in self.scopes.iter() {
            entry.value().flush_now();
            entry.value().clear_change_observer();
        }
        self.scopes.clear();
        self.transport.disconnect();
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Fired with the token once a session is established.
    pub fn on_session(&self) -> &Signal<String> {
        &self.on_session
    }

    /// Fired once if the server refuses the handshake. No automatic retry
    /// follows.
    pub fn on_session_denied(&self) -> &Signal<()> {
        &self.on_session_denied
    }

    pub fn on_status(&self) -> &Signal<ClientStatus> {
        &self.on_status
    }

    /// Attaches a scope: sends `ScopeFetch`, records the granted scope
    /// index, and forwards every subsequent change flush as a `ScopeSync`.
    pub async fn attach_scope(&self, scope: &Arc<Scope>) -> Result<u64, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let session = lock(&self.session).clone().ok_or(ClientError::NoSession)?;
        let scope_index = session
            .fetch(&self.transport, scope.name(), json!({}))
            .await?;
        self.scopes.insert(scope_index, scope.clone());

        let transport = self.transport.clone();
        let forward_session = session.clone();
        scope.observe_changes(move |fragments| {
            if fragments.is_empty() {
                return;
            }
            let message = Message::ScopeSync {
                index: forward_session.index_for_message(),
                scope_index,
                sync_fragments: fragments,
            };
            if let Err(e) = transport.send(&message) {
                warn!("Failed to send scope sync: {}", e);
            }
        });
        info!("Scope `{}` attached at index {}", scope.name(), scope_index);
        Ok(scope_index)
    }

    /// The dispatcher task: the single logical thread on which inbound
    /// batches and status changes take effect.
    async fn dispatch(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Message>,
        mut status: watch::Receiver<TransportStatus>,
    ) {
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *status.borrow_and_update();
                    self.handle_status(current);
                }
                message = inbound.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
            }
        }
        debug!("Client dispatcher stopped");
    }

    fn handle_status(&self, status: TransportStatus) {
        match status {
            TransportStatus::Connected => {
                info!("Client online");
                self.on_status.fire(&ClientStatus::Online);
                let session = lock(&self.session).clone();
                match session {
                    Some(session) => {
                        // Resume: ask the server to replay whatever it has
                        // not acknowledged.
                        let ping = Message::Ping {
                            index: session.index_for_message(),
                            ack: self.server_index.load(Ordering::SeqCst),
                            resend_missing: Some(true),
                        };
                        if let Err(e) = self.transport.send(&ping) {
                            warn!("Failed to send resume ping: {}", e);
                        }
                    }
                    None if !self.denied.load(Ordering::SeqCst)
                        && !self.closed.load(Ordering::SeqCst) =>
                    {
                        let create = Message::SessionCreate {
                            index: self.next_index.fetch_add(1, Ordering::SeqCst),
                            version: PROTOCOL_VERSION.to_owned(),
                        };
                        if let Err(e) = self.transport.send(&create) {
                            warn!("Failed to send session create: {}", e);
                        }
                    }
                    None => {}
                }
            }
            other => {
                debug!("Client offline (transport {:?})", other);
                self.on_status.fire(&ClientStatus::Offline);
            }
        }
    }

    fn handle_message(&self, message: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match message {
            Message::SessionCreateResponse {
                success,
                session_token,
                ..
            } => self.handle_session_response(success, session_token),
            Message::ScopeState {
                scope_index,
                root_fragment,
                sync_fragments,
                ..
            } => match self.scopes.get(&scope_index) {
                Some(scope) => {
                    if let Err(e) = scope.apply_root_fragment(&root_fragment, &sync_fragments) {
                        error!("Failed to apply scope state: {}", e);
                    }
                }
                None => warn!("ScopeState for unattached scope index {}", scope_index),
            },
            Message::ScopeSync {
                scope_index,
                sync_fragments,
                ..
            } => {
                if sync_fragments.is_empty() {
                    debug!("Ignoring empty ScopeSync for scope index {}", scope_index);
                    return;
                }
                match self.scopes.get(&scope_index) {
                    Some(scope) => {
                        if let Err(e) = scope.apply_sync_fragments(&sync_fragments) {
                            error!("Failed to apply scope sync: {}", e);
                        }
                    }
                    None => warn!("ScopeSync for unattached scope index {}", scope_index),
                }
            }
            Message::Reply { reply_to, .. } => {
                debug!("Unclaimed reply to {}; ignoring", reply_to);
            }
            other => warn!("Unexpected message: {:?}", other),
        }
    }

    fn handle_session_response(&self, success: bool, session_token: Option<String>) {
        if lock(&self.session).is_some() {
            debug!("Duplicate session response; ignoring");
            return;
        }
        match (success, session_token) {
            (true, Some(token)) => {
                let session = Session::new(
                    token.clone(),
                    self.next_index.clone(),
                    self.server_index.clone(),
                );
                *lock(&self.session) = Some(session.clone());
                self.transport.set_session(session);
                info!("Session established");
                self.on_session.fire(&token);
            }
            _ => {
                if !self.denied.swap(true, Ordering::SeqCst) {
                    warn!("Session denied by server");
                    self.on_session_denied.fire(&());
                }
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("scopes", &self.scopes.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
