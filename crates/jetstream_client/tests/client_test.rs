use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use jetstream_client::client::Client;
use jetstream_client::error::ClientError;
use jetstream_client::memory::{MemoryAdapter, MemoryServer, ServerConnection};
use jetstream_client::message::{Message, PROTOCOL_VERSION};
use jetstream_client::transport::TransportStatus;
use jetstream_model::fragment::{FragmentKind, SyncFragment};
use jetstream_model::model_class;
use jetstream_model::scope::Scope;
use jetstream_model::value::PropertyValue;

model_class! {
    pub struct Board {
        title: string,
        items: array,
    }
}

model_class! {
    pub struct Item {
        label: string,
        weight: int,
    }
}

fn props(entries: Vec<(&str, serde_json::Value)>) -> serde_json::Map<String, serde_json::Value> {
    entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

/// Drives the handshake: accepts the connection, answers `SessionCreate`
/// with a token, and returns the server connection.
async fn establish(server: &mut MemoryServer, client: &Client) -> ServerConnection {
    let (session_tx, mut session_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    client.on_session().listen("establish", move |token| {
        let _ = session_tx.send(token.clone());
    });
    client.connect();

    let mut conn = server.accept().await.unwrap();
    assert!(conn.session_token.is_none());

    match conn.recv().await.unwrap() {
        Message::SessionCreate { index, version } => {
            assert_eq!(index, 1);
            assert_eq!(version, PROTOCOL_VERSION);
        }
        other => panic!("expected SessionCreate, got {:?}", other),
    }
    conn.send(&Message::SessionCreateResponse {
        index: 1,
        reply_to: 1,
        success: true,
        session_token: Some("t".to_owned()),
    });

    assert_eq!(session_rx.recv().await.unwrap(), "t");
    client.on_session().remove_listener("establish");
    conn
}

/// Answers the next `ScopeFetch` with the given scope index.
async fn grant_fetch(conn: &mut ServerConnection, reply_index: u64, scope_index: u64) -> u64 {
    match conn.recv().await.unwrap() {
        Message::ScopeFetch { index, .. } => {
            conn.send(&Message::Reply {
                index: reply_index,
                reply_to: index,
                result: Some(true),
                scope_index: Some(scope_index),
                error: None,
            });
            index
        }
        other => panic!("expected ScopeFetch, got {:?}", other),
    }
}

/// Happy path: handshake at index 1, fetch at index 2, state install, and
/// a local edit flowing out as exactly one ScopeSync at index 3.
#[tokio::test]
async fn attach_state_and_local_edit() {
    Board::register();
    Item::register();
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let mut conn = establish(&mut server, &client).await;

    let scope = Scope::new("S");
    let (attach, fetch_index) = tokio::join!(client.attach_scope(&scope), async {
        grant_fetch(&mut conn, 2, 1).await
    });
    assert_eq!(fetch_index, 2);
    assert_eq!(attach.unwrap(), 1);

    // Full state dump from the server.
    let u0 = Uuid::new_v4();
    let u1 = Uuid::new_v4();
    conn.send(&Message::ScopeState {
        index: 3,
        scope_index: 1,
        root_fragment: SyncFragment {
            kind: FragmentKind::Root,
            uuid: u0,
            cls: Some("Board".to_owned()),
            properties: Some(props(vec![
                ("title", json!("server")),
                ("items", json!([u1.to_string()])),
            ])),
        },
        sync_fragments: vec![SyncFragment {
            kind: FragmentKind::Add,
            uuid: u1,
            cls: Some("Item".to_owned()),
            properties: Some(props(vec![("label", json!("x")), ("weight", json!(255))])),
        }],
    });
    sleep(Duration::from_millis(20)).await;

    assert_eq!(scope.root_model().unwrap().uuid(), u0);
    let item = scope.get_object_by_uuid(&u1).unwrap();
    assert_eq!(item.value("weight"), PropertyValue::Int(255));

    // One local write -> one ScopeSync with the monotonically next index.
    item.set_value("weight", PropertyValue::Int(20)).unwrap();
    match conn.recv().await.unwrap() {
        Message::ScopeSync {
            index,
            scope_index,
            sync_fragments,
        } => {
            assert_eq!(index, 3);
            assert_eq!(scope_index, 1);
            assert_eq!(sync_fragments.len(), 1);
            assert_eq!(sync_fragments[0].kind, FragmentKind::Change);
            assert_eq!(sync_fragments[0].uuid, u1);
            assert_eq!(
                sync_fragments[0].properties.as_ref().unwrap()["weight"],
                json!(20)
            );
        }
        other => panic!("expected ScopeSync, got {:?}", other),
    }
}

/// A denied handshake fires `on_session_denied` once, creates no session,
/// and later mutations produce no outbound traffic.
#[tokio::test]
async fn denied_session_goes_quiet() {
    Board::register();
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);

    let denied = Arc::new(AtomicUsize::new(0));
    let counter = denied.clone();
    client.on_session_denied().listen("test", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.connect();
    let mut conn = server.accept().await.unwrap();
    match conn.recv().await.unwrap() {
        Message::SessionCreate { .. } => {}
        other => panic!("expected SessionCreate, got {:?}", other),
    }
    conn.send(&Message::SessionCreateResponse {
        index: 1,
        reply_to: 1,
        success: false,
        session_token: None,
    });
    sleep(Duration::from_millis(20)).await;

    assert_eq!(denied.load(Ordering::SeqCst), 1);
    assert!(client.session().is_none());

    // No session: attach refuses, and scope mutations stay local.
    let scope = Scope::new("S");
    assert!(matches!(
        client.attach_scope(&scope).await,
        Err(ClientError::NoSession)
    ));
    let board = Board::new();
    scope.attach_root(board.model().clone());
    board.set_title("quiet");
    assert!(timeout(Duration::from_millis(100), conn.recv()).await.is_err());
}

/// Disconnect before an ack: on reconnect the client advertises its token,
/// resumes with `Ping(resendMissing)`, and re-transmits the unacked frame
/// verbatim when the server asks. Acked entries leave the buffer.
#[tokio::test]
async fn reconnect_resends_unacked_messages() {
    Board::register();
    Item::register();
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let mut conn = establish(&mut server, &client).await;

    let scope = Scope::new("S");
    let (attach, _) = tokio::join!(client.attach_scope(&scope), async {
        grant_fetch(&mut conn, 2, 1).await
    });
    attach.unwrap();

    let u0 = Uuid::new_v4();
    conn.send(&Message::ScopeState {
        index: 3,
        scope_index: 1,
        root_fragment: SyncFragment {
            kind: FragmentKind::Root,
            uuid: u0,
            cls: Some("Board".to_owned()),
            properties: None,
        },
        sync_fragments: vec![],
    });
    sleep(Duration::from_millis(20)).await;

    // Index 3: a local edit the server will never ack on this connection.
    let root = scope.root_model().unwrap();
    root.set_value("title", PropertyValue::String("local".to_owned()))
        .unwrap();
    let original_frame = conn.recv_frame().await.unwrap();
    let parsed = Message::decode_batch(&original_frame);
    assert!(matches!(parsed[0], Message::ScopeSync { index: 3, .. }));
    assert_eq!(client.transport().non_acked_indices(), vec![2, 3]);

    // Drop the connection mid-flight.
    conn.close(None);
    drop(conn);

    // The reconnect advertises the session token out-of-band.
    let mut conn = server.accept().await.unwrap();
    assert_eq!(conn.session_token.as_deref(), Some("t"));

    // Resume primitive: a ping asking the server to resend what it misses.
    match conn.recv().await.unwrap() {
        Message::Ping {
            ack,
            resend_missing,
            ..
        } => {
            assert_eq!(ack, 3);
            assert_eq!(resend_missing, Some(true));
        }
        other => panic!("expected resume Ping, got {:?}", other),
    }

    // Server acks through index 2 and asks for the rest.
    conn.send(&Message::Ping {
        index: 4,
        ack: 2,
        resend_missing: Some(true),
    });
    let resent = conn.recv_frame().await.unwrap();
    assert_eq!(resent, original_frame);

    // Acking index 3 empties the buffer.
    conn.send(&Message::Ping {
        index: 5,
        ack: 3,
        resend_missing: None,
    });
    sleep(Duration::from_millis(20)).await;
    assert!(client.transport().non_acked_indices().is_empty());
}

/// A duplicate reply fires the fetch waiter only once; the extra copy is a
/// top-level no-op and the client keeps working.
#[tokio::test]
async fn duplicate_replies_fire_once() {
    Board::register();
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let mut conn = establish(&mut server, &client).await;

    let scope = Scope::new("S");
    let (attach, _) = tokio::join!(client.attach_scope(&scope), async {
        match conn.recv().await.unwrap() {
            Message::ScopeFetch { index, .. } => {
                let reply = Message::Reply {
                    index: 2,
                    reply_to: index,
                    result: Some(true),
                    scope_index: Some(1),
                    error: None,
                };
                conn.send(&reply);
                conn.send(&reply);
            }
            other => panic!("expected ScopeFetch, got {:?}", other),
        }
    });
    assert_eq!(attach.unwrap(), 1);
    sleep(Duration::from_millis(20)).await;

    // Still alive: a second scope attaches normally.
    let second = Scope::new("S2");
    let (attach, _) = tokio::join!(client.attach_scope(&second), async {
        grant_fetch(&mut conn, 3, 2).await
    });
    assert_eq!(attach.unwrap(), 2);
}

/// A rejecting fetch reply surfaces the structured error.
#[tokio::test]
async fn fetch_rejection_surfaces_error() {
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let mut conn = establish(&mut server, &client).await;

    let scope = Scope::new("S");
    let (attach, _) = tokio::join!(client.attach_scope(&scope), async {
        match conn.recv().await.unwrap() {
            Message::ScopeFetch { index, .. } => conn.send(&Message::Reply {
                index: 2,
                reply_to: index,
                result: Some(false),
                scope_index: None,
                error: Some(jetstream_client::message::ErrorPayload {
                    code: 404,
                    message: "no such scope".to_owned(),
                }),
            }),
            other => panic!("expected ScopeFetch, got {:?}", other),
        }
    });
    match attach {
        Err(ClientError::Fetch(jetstream_client::error::FetchError::Rejected {
            code,
            message,
        })) => {
            assert_eq!(code, 404);
            assert_eq!(message, "no such scope");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

/// A fatal close code suppresses the reconnect loop for good.
#[tokio::test]
async fn fatal_close_suppresses_reconnect() {
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let conn = establish(&mut server, &client).await;

    conn.close(Some(4096));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(client.transport().status(), TransportStatus::Fatal);
    assert!(timeout(Duration::from_millis(150), server.accept())
        .await
        .is_err());
}

/// Malformed frames, unknown message types, and empty sync batches are
/// dropped without killing the connection.
#[tokio::test]
async fn malformed_input_is_dropped_quietly() {
    Board::register();
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let mut conn = establish(&mut server, &client).await;

    let scope = Scope::new("S");
    let (attach, _) = tokio::join!(client.attach_scope(&scope), async {
        grant_fetch(&mut conn, 2, 1).await
    });
    attach.unwrap();

    conn.send_frame("this is not json");
    conn.send_frame(r#"{"type":"Bogus","index":7}"#);
    conn.send(&Message::ScopeSync {
        index: 8,
        scope_index: 1,
        sync_fragments: vec![],
    });

    // The connection survived: a real state dump still applies.
    let u0 = Uuid::new_v4();
    conn.send(&Message::ScopeState {
        index: 9,
        scope_index: 1,
        root_fragment: SyncFragment {
            kind: FragmentKind::Root,
            uuid: u0,
            cls: Some("Board".to_owned()),
            properties: Some(props(vec![("title", json!("ok"))])),
        },
        sync_fragments: vec![],
    });
    sleep(Duration::from_millis(20)).await;
    assert_eq!(scope.root_model().unwrap().uuid(), u0);
}

/// Batch frames (a JSON array of messages) apply in order.
#[tokio::test]
async fn batch_frames_apply_in_order() {
    Board::register();
    Item::register();
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let mut conn = establish(&mut server, &client).await;

    let scope = Scope::new("S");
    let (attach, _) = tokio::join!(client.attach_scope(&scope), async {
        grant_fetch(&mut conn, 2, 1).await
    });
    attach.unwrap();

    let u0 = Uuid::new_v4();
    let u1 = Uuid::new_v4();
    let state = Message::ScopeState {
        index: 3,
        scope_index: 1,
        root_fragment: SyncFragment {
            kind: FragmentKind::Root,
            uuid: u0,
            cls: Some("Board".to_owned()),
            properties: None,
        },
        sync_fragments: vec![SyncFragment {
            kind: FragmentKind::Add,
            uuid: u1,
            cls: Some("Item".to_owned()),
            properties: Some(props(vec![("weight", json!(1))])),
        }],
    };
    let sync = Message::ScopeSync {
        index: 4,
        scope_index: 1,
        sync_fragments: vec![SyncFragment {
            kind: FragmentKind::Change,
            uuid: u1,
            cls: None,
            properties: Some(props(vec![("weight", json!(2))])),
        }],
    };
    conn.send_frame(serde_json::to_string(&vec![state, sync]).unwrap());
    sleep(Duration::from_millis(20)).await;

    let item = scope.get_object_by_uuid(&u1).unwrap();
    assert_eq!(item.value("weight"), PropertyValue::Int(2));
}

/// A requested reconnect re-opens the channel advertising the session
/// token and resumes with a ping.
#[tokio::test]
async fn manual_reconnect_readvertises_the_session() {
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let _old = establish(&mut server, &client).await;

    client.transport().reconnect();
    let mut conn = server.accept().await.unwrap();
    assert_eq!(conn.session_token.as_deref(), Some("t"));
    match conn.recv().await.unwrap() {
        Message::Ping { resend_missing, .. } => assert_eq!(resend_missing, Some(true)),
        other => panic!("expected resume Ping, got {:?}", other),
    }
}

/// `close` refuses further operations and drops the connection without a
/// reconnect.
#[tokio::test]
async fn close_is_terminal() {
    let (adapter, mut server) = MemoryAdapter::pair();
    let client = Client::new(adapter);
    let mut conn = establish(&mut server, &client).await;

    client.close();
    sleep(Duration::from_millis(50)).await;

    let scope = Scope::new("S");
    assert!(matches!(
        client.attach_scope(&scope).await,
        Err(ClientError::Closed)
    ));
    // The server sees the channel go away and nobody reconnects.
    assert!(conn.recv_frame().await.is_none());
    assert!(timeout(Duration::from_millis(150), server.accept())
        .await
        .is_err());
}
