//! End-to-end tests over TCP loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rpcwire::protocol::PrefixFramer;
use rpcwire::{
    Auth, ClaimsSigner, Client, ClientState, Connection, Endpoint, ErrorObject, Event, Message,
    RpcError, Server,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loopback() -> Endpoint {
    Endpoint::tcp("127.0.0.1:0")
}

/// Answers `echo` with its params, `square` with params squared after a
/// delay that shrinks as the input grows, and `sleep` after `params` ms.
/// Notifications are forwarded to `seen`.
async fn serve(conn: Connection, seen: mpsc::UnboundedSender<Message>) {
    let Ok(mut inbound) = conn.incoming() else {
        return;
    };
    while let Some(Ok(msg)) = inbound.next().await {
        if msg.is_notification() {
            let _ = seen.send(msg);
            continue;
        }
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = conn
                .handle_request(msg, |m| async move {
                    let params = m.params().cloned().unwrap_or(Value::Null);
                    match m.method() {
                        Some("echo") => Ok(params),
                        Some("square") => {
                            let n = params.as_u64().unwrap_or(0);
                            tokio::time::sleep(Duration::from_millis(10 * (5 - n.min(5)))).await;
                            Ok(json!(n * n))
                        }
                        Some("sleep") => {
                            tokio::time::sleep(Duration::from_millis(params.as_u64().unwrap_or(0)))
                                .await;
                            Ok(json!("late"))
                        }
                        _ => Err(ErrorObject::method_not_found(None)),
                    }
                })
                .await;
        });
    }
}

async fn echo_server() -> (Server, Endpoint, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::builder()
        .bind(&loopback(), move |conn: Connection| serve(conn, tx.clone()))
        .await
        .unwrap();
    let endpoint = server.local_endpoint().unwrap();
    (server, endpoint, rx)
}

fn assert_close(delay: Duration, secs: f64) {
    assert!(
        (delay.as_secs_f64() - secs).abs() < 1e-6,
        "{:?} != {}s",
        delay,
        secs
    );
}

async fn next_event<F>(events: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen in time")
}

#[tokio::test]
async fn test_echo_with_ordered_notifications() {
    init_tracing();
    let (server, endpoint, mut seen) = echo_server().await;
    let client = Client::builder().connect(endpoint);

    for n in 1..=3 {
        client.notification("hello", json!(n)).unwrap();
    }
    let reply = client.request("echo", json!({"a": 4})).await.unwrap();
    assert_eq!(reply, json!({"a": 4}));

    for n in 1..=3 {
        let msg = seen.recv().await.unwrap();
        assert_eq!(msg.method(), Some("hello"));
        assert_eq!(msg.params(), Some(&json!(n)));
    }

    let err = client.request("nope", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorObject::METHOD_NOT_FOUND));

    client.close();
    client.closed().await;
    server.close().await;
}

#[tokio::test]
async fn test_authenticated_session() {
    init_tracing();
    let auth = Auth::new("top-secret").unwrap();
    let (tx, mut sessions) = mpsc::unbounded_channel();
    let server = Server::builder()
        .authenticator(auth.clone())
        .bind(&loopback(), move |conn: Connection| {
            let _ = tx.send(conn.session().cloned());
            async move {
                let Ok(mut inbound) = conn.incoming() else {
                    return;
                };
                while let Some(Ok(msg)) = inbound.next().await {
                    let session = conn.session().cloned().unwrap_or(Value::Null);
                    let _ = conn
                        .handle_request(msg, |_| async move { Ok::<_, ErrorObject>(session["user"].clone()) })
                        .await;
                }
            }
        })
        .await
        .unwrap();

    let client = Client::builder()
        .signer(ClaimsSigner::new(auth, json!({"user": "ada"})))
        .connect(server.local_endpoint().unwrap());
    let mut events = client.subscribe();

    assert_eq!(client.request("whoami", Value::Null).await.unwrap(), json!("ada"));
    let session = sessions.recv().await.unwrap().unwrap();
    assert_eq!(session["user"], "ada");
    assert!(session["exp"].as_i64().unwrap() > 0);

    match next_event(&mut events, |e| matches!(e, Event::Auth(_))).await {
        Event::Auth(reply) => assert_eq!(reply, json!("OK")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(client.state(), ClientState::Connected);

    client.close();
    server.close().await;
}

#[tokio::test]
async fn test_unauthorized_client() {
    init_tracing();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let server = Server::builder()
        .authenticator(Auth::new("right").unwrap())
        .bind(&loopback(), move |_conn: Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await
        .unwrap();
    let mut server_events = server.subscribe();

    let forged = Auth::new("wrong").unwrap();
    let client = Client::builder()
        .retry_delay(Duration::from_millis(5))
        .signer(ClaimsSigner::new(forged, json!({})))
        .connect(server.local_endpoint().unwrap());
    let mut events = client.subscribe();

    let call = client.start_request("echo", json!([1])).unwrap();

    let (mut rejected, mut closed) = (false, false);
    while !(rejected && closed) {
        match next_event(&mut events, |e| matches!(e, Event::Error(_) | Event::Close { .. })).await {
            Event::Error(e) => match &*e {
                RpcError::Remote(obj) => {
                    assert_eq!(obj.code, 401);
                    assert_eq!(obj.message, "Unauthorized");
                    assert_eq!(obj.data, Some(json!("Invalid signature")));
                    rejected = true;
                }
                other => panic!("unexpected {:?}", other),
            },
            _ => closed = true,
        }
    }
    next_event(&mut server_events, |e| matches!(e, Event::Warn(_))).await;

    client.closed().await;
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(client.attempts(), 0);
    assert!(call.await.unwrap_err().is_reset());
    assert_eq!(served.load(Ordering::SeqCst), 0);

    server.close().await;
}

#[tokio::test]
async fn test_pull_iteration_ends_with_reset() {
    init_tracing();
    let (tx, mut accepted) = mpsc::unbounded_channel();
    let server = Server::builder()
        .bind(&loopback(), move |conn: Connection| {
            let _ = tx.send(conn);
            async {}
        })
        .await
        .unwrap();

    let client = Client::builder().connect(server.local_endpoint().unwrap());
    let mut client_inbound = client.incoming().unwrap();
    assert!(matches!(client.incoming(), Err(RpcError::IncomingAttached)));

    let peer = accepted.recv().await.unwrap();
    let mut server_inbound = peer.incoming().unwrap();

    client.notification("up", json!(1)).unwrap();
    peer.notification("down", json!(2)).unwrap();

    let up = server_inbound.next().await.unwrap().unwrap();
    assert_eq!(up.method(), Some("up"));
    let down = client_inbound.next().await.unwrap().unwrap();
    assert_eq!(down.method(), Some("down"));

    client.close();

    assert!(server_inbound.next().await.unwrap().unwrap_err().is_reset());
    assert!(server_inbound.next().await.is_none());
    assert!(client_inbound.next().await.unwrap().unwrap_err().is_reset());
    assert!(client_inbound.next().await.is_none());

    server.close().await;
}

#[tokio::test]
async fn test_reconnect_after_peer_drop() {
    init_tracing();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    let (tx, _seen) = mpsc::unbounded_channel();
    let server = Server::builder()
        .bind(&loopback(), move |conn: Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            serve(conn, tx.clone())
        })
        .await
        .unwrap();

    let client = Client::builder()
        .retry_delay(Duration::from_millis(20))
        .connect(server.local_endpoint().unwrap());
    let mut events = client.subscribe();

    for n in 0..3 {
        assert_eq!(client.request("echo", json!(n)).await.unwrap(), json!(n));
    }
    let first = client.connection().unwrap();

    for conn in server.connections() {
        conn.destroy();
    }

    match next_event(&mut events, |e| matches!(e, Event::Reconnecting { .. })).await {
        Event::Reconnecting { attempts, delay } => {
            assert_eq!(attempts, 1);
            assert_close(delay, 0.024);
        }
        other => panic!("unexpected {:?}", other),
    }
    next_event(&mut events, |e| matches!(e, Event::Connect)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, Event::Reconnecting { .. }));
    }

    assert_eq!(client.request("echo", json!("again")).await.unwrap(), json!("again"));
    let second = client.connection().unwrap();
    assert_ne!(first, second);
    assert!(first.is_closed());
    assert_eq!(client.attempts(), 0);
    assert_eq!(accepts.load(Ordering::SeqCst), 2);

    client.close();
    server.close().await;
}

#[tokio::test]
async fn test_out_of_order_responses() {
    init_tracing();
    let (server, endpoint, _seen) = echo_server().await;
    let client = Client::builder().connect(endpoint);

    let calls: Vec<_> = (0..5)
        .map(|n| client.start_request("square", json!(n)).unwrap())
        .collect();
    let ids: Vec<String> = calls.iter().map(|c| c.id().to_string()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), json!(n * n));
    }
    assert_eq!(client.pending_requests(), 0);

    client.close();
    server.close().await;
}

#[tokio::test]
async fn test_timeout_then_late_response() {
    init_tracing();
    let (server, endpoint, _seen) = echo_server().await;
    let client = Client::builder()
        .request_timeout(Duration::from_millis(50))
        .connect(endpoint);
    let mut inbound = client.incoming().unwrap();

    let err = client.request("sleep", json!(150)).await.unwrap_err();
    match err {
        RpcError::Timeout { ref id, ref frame } => {
            assert!(!id.is_empty());
            assert!(!frame.is_empty());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(client.pending_requests(), 0);

    let late = tokio::time::timeout(Duration::from_secs(2), inbound.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(late.is_response());
    assert_eq!(late, Message::success(late.id().cloned().unwrap(), json!("late")));

    client.close();
    server.close().await;
}

#[tokio::test]
async fn test_backoff_gives_up() {
    init_tracing();
    let server = Server::builder()
        .bind(&loopback(), |_conn: Connection| async {})
        .await
        .unwrap();
    let endpoint = server.local_endpoint().unwrap();
    server.close().await;

    let client = Client::builder()
        .retry_delay(Duration::from_millis(2))
        .max_retry_delay(Duration::from_millis(3))
        .max_attempts(4)
        .connect(endpoint);
    let mut events = client.subscribe();
    let call = client.start_request("echo", json!(1)).unwrap();

    client.closed().await;
    assert!(call.await.unwrap_err().is_reset());

    let mut delays = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::Reconnecting { delay, attempts } = event {
            delays.push((attempts, delay));
        }
    }
    let attempts: Vec<u32> = delays.iter().map(|(a, _)| *a).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    assert_close(delays[0].1, 0.0024);
    assert_close(delays[1].1, 0.00288);
    assert_eq!(delays[2].1, Duration::from_millis(3));
    assert_eq!(delays[3].1, Duration::from_millis(3));
    assert!(client.connected().await.is_err());
}

#[tokio::test]
async fn test_replay_pending_after_reconnect() {
    init_tracing();
    let (tx, mut accepted) = mpsc::unbounded_channel();
    let server = Server::builder()
        .bind(&loopback(), move |conn: Connection| {
            let _ = tx.send(conn);
            async {}
        })
        .await
        .unwrap();

    let client = Client::builder()
        .retry_delay(Duration::from_millis(5))
        .connect(server.local_endpoint().unwrap());
    let mut events = client.subscribe();

    let call = client.start_request("work", json!(["job"])).unwrap();
    let first = accepted.recv().await.unwrap();
    let mut inbound = first.incoming().unwrap();
    let original = inbound.next().await.unwrap().unwrap();
    first.destroy();

    next_event(&mut events, |e| matches!(e, Event::Connect)).await;
    assert_eq!(client.pending_requests(), 1);
    assert_eq!(client.replay_pending().unwrap(), 1);

    let second = accepted.recv().await.unwrap();
    let mut inbound = second.incoming().unwrap();
    let replayed = inbound.next().await.unwrap().unwrap();
    assert_eq!(replayed, original);

    second
        .success(replayed.id().cloned().unwrap(), json!("done"))
        .unwrap();
    assert_eq!(call.await.unwrap(), json!("done"));

    client.close();
    server.close().await;
}

#[tokio::test]
async fn test_prefix_framing_end_to_end() {
    init_tracing();
    let (tx, _seen) = mpsc::unbounded_channel();
    let server = Server::builder()
        .framer(Arc::new(PrefixFramer))
        .codec(Arc::new(rpcwire::codec::MsgPackCodec))
        .bind(&loopback(), move |conn: Connection| serve(conn, tx.clone()))
        .await
        .unwrap();

    let client = Client::builder()
        .framer(Arc::new(PrefixFramer))
        .codec(Arc::new(rpcwire::codec::MsgPackCodec))
        .connect(server.local_endpoint().unwrap());

    let payload = json!({"nested": {"list": [1, 2, 3], "text": "héllo"}});
    assert_eq!(client.request("echo", payload.clone()).await.unwrap(), payload);

    client.close();
    server.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_transport() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("rpcwire-it-{}.sock", std::process::id()));
    let (tx, _seen) = mpsc::unbounded_channel();
    let server = Server::builder()
        .bind(&Endpoint::unix(&path), move |conn: Connection| serve(conn, tx.clone()))
        .await
        .unwrap();

    let client = Client::builder().connect(Endpoint::unix(&path));
    assert_eq!(client.request("echo", json!("unix")).await.unwrap(), json!("unix"));

    client.close();
    server.close().await;
}
