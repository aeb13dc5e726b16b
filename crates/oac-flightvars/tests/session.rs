//! Client sessions against a scripted peer speaking raw frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use oac_flightvars::{
    ClientConfig, CommunicationError, ConnectionState, FlightVarsClient, FlightVarsError, ProtocolError,
    SubscriptionStatus, VariableId, VariableValue,
};
use oac_proto::{codec, Message, RingBuffer, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct FakePeer {
    stream: TcpStream,
    ring: RingBuffer,
}

impl FakePeer {
    async fn recv(&mut self) -> Message {
        loop {
            if !self.ring.is_empty() {
                self.ring.set_mark();
                match codec::decode(&mut self.ring) {
                    Ok(msg) => {
                        self.ring.unset_mark();
                        return msg;
                    }
                    Err(e) if e.is_incomplete() => self.ring.reset(),
                    Err(e) => panic!("peer received garbage: {e}"),
                }
            }
            let mut buf = [0u8; 512];
            let n = timeout(WAIT, self.stream.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0, "client hung up");
            assert_eq!(self.ring.write(&buf[..n]), n);
        }
    }

    async fn send(&mut self, msg: &Message) {
        let frame = codec::encode_to_bytes(msg).unwrap();
        self.send_raw(&frame).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

fn offset() -> VariableId {
    VariableId::new("FSUIPC/Offset", "0x200")
}

async fn connected(request_timeout: Duration) -> (FlightVarsClient, FakePeer) {
    connected_with(|cfg| cfg.request_timeout_ms = request_timeout.as_millis() as u64).await
}

async fn connected_with(tune: impl FnOnce(&mut ClientConfig)) -> (FlightVarsClient, FakePeer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut cfg = ClientConfig::new("127.0.0.1", port).with_request_timeout(WAIT);
    tune(&mut cfg);
    let client = FlightVarsClient::new(cfg);

    let (res, accepted) = tokio::join!(client.connect(), listener.accept());
    res.unwrap();
    let (stream, _) = accepted.unwrap();
    let mut peer = FakePeer { stream, ring: RingBuffer::new(4096) };

    match peer.recv().await {
        Message::BeginSession { protocol_version, .. } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("expected BeginSession, got {other:?}"),
    }
    assert!(client.state().is_established());
    (client, peer)
}

type Updates = mpsc::UnboundedReceiver<(VariableId, VariableValue)>;

/// Subscribes to `var` and answers the request with `id`.
async fn subscribe(
    client: &FlightVarsClient,
    peer: &mut FakePeer,
    var: &VariableId,
    id: u32,
) -> Updates {
    let (tx, rx) = mpsc::unbounded_channel();
    subscribe_with(client, peer, var, id, move |var, value| {
        let _ = tx.send((var.clone(), *value));
    })
    .await;
    rx
}

async fn subscribe_with<F>(client: &FlightVarsClient, peer: &mut FakePeer, var: &VariableId, id: u32, handler: F)
where
    F: Fn(&VariableId, &VariableValue) + Send + Sync + 'static,
{
    let task = {
        let client = client.clone();
        let var = var.clone();
        tokio::spawn(async move { client.subscribe(&var, handler).await })
    };
    assert_eq!(peer.recv().await, Message::subscription_request(var));
    peer.send(&Message::subscription_reply(SubscriptionStatus::Subscribed, var, id, "")).await;
    assert_eq!(task.await.unwrap().unwrap(), id);
}

#[tokio::test]
async fn subscription_lifecycle() {
    let (client, mut peer) = connected(WAIT).await;
    let _updates = subscribe(&client, &mut peer, &offset(), 42).await;

    assert_eq!(client.subscriptions().await, vec![(offset(), 42)]);
    assert_eq!(offset().group(), "fsuipc/offset");
}

#[tokio::test]
async fn updates_reach_the_bound_handler_only() {
    let (client, mut peer) = connected(WAIT).await;
    let mut updates = subscribe(&client, &mut peer, &offset(), 42).await;

    peer.send(&Message::VarUpdate { subscription_id: 99, value: VariableValue::Byte(7) }).await;
    peer.send(&Message::VarUpdate { subscription_id: 42, value: VariableValue::Word(1200) }).await;

    let got = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(got, (offset(), VariableValue::Word(1200)));
    assert!(updates.try_recv().is_err());
    assert!(client.state().is_established());
}

#[tokio::test]
async fn split_frames_are_reassembled() {
    let (client, mut peer) = connected(WAIT).await;
    let mut updates = subscribe(&client, &mut peer, &offset(), 42).await;

    let frame = codec::encode_to_bytes(&Message::VarUpdate {
        subscription_id: 42,
        value: VariableValue::Float(3.1415),
    })
    .unwrap();
    for chunk in frame.chunks(3) {
        peer.send_raw(chunk).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (_, value) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    let VariableValue::Float(v) = value else { panic!("expected a float, got {value:?}") };
    assert!((v - 3.1415).abs() / 3.1415 < 1e-6);
}

#[tokio::test]
async fn subscribe_times_out_and_late_grant_is_released() {
    let (client, mut peer) = connected(Duration::from_millis(1)).await;

    let started = Instant::now();
    let err = client.subscribe(&offset(), |_, _| {}).await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(started.elapsed() < WAIT);
    assert!(matches!(
        err,
        FlightVarsError::Communication(CommunicationError::Timeout(ref t)) if t.timeout == Duration::from_millis(1)
    ));

    assert_eq!(peer.recv().await, Message::subscription_request(&offset()));
    peer.send(&Message::subscription_reply(SubscriptionStatus::Subscribed, &offset(), 7, "")).await;
    assert_eq!(peer.recv().await, Message::UnsubscriptionRequest { subscription_id: 7 });
    assert!(client.subscriptions().await.is_empty());
    assert!(client.state().is_established());
}

#[tokio::test]
async fn every_observer_sees_graceful_end() {
    let (client, mut peer) = connected(WAIT).await;

    let first = tokio::spawn(client.disconnection());
    let second = tokio::spawn(client.disconnection());
    peer.send(&Message::EndSession { cause: "server shutdown".into() }).await;

    assert!(timeout(WAIT, first).await.unwrap().unwrap().is_ok());
    assert!(timeout(WAIT, second).await.unwrap().unwrap().is_ok());
    assert!(timeout(Duration::from_millis(50), client.disconnection()).await.unwrap().is_ok());
    assert!(matches!(client.state(), ConnectionState::Closed(Ok(()))));

    let err = client.subscribe(&offset(), |_, _| {}).await.unwrap_err();
    assert!(matches!(err, FlightVarsError::Communication(CommunicationError::Closed)));
}

#[tokio::test]
async fn lost_connection_fails_pending_requests() {
    let (client, mut peer) = connected(WAIT).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe(&offset(), |_, _| {}).await })
    };
    assert_eq!(peer.recv().await, Message::subscription_request(&offset()));
    drop(peer);

    let err = timeout(WAIT, pending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, FlightVarsError::Communication(CommunicationError::ConnectionLost(_))), "{err}");
    let outcome = timeout(WAIT, client.disconnection()).await.unwrap();
    assert!(matches!(outcome, Err(CommunicationError::ConnectionLost(_))));
}

#[tokio::test]
async fn garbage_tears_the_session_down() {
    let (client, mut peer) = connected(WAIT).await;
    peer.send_raw(&[0x12, 0x34, 0x0d, 0x0a]).await;

    let outcome = timeout(WAIT, client.disconnection()).await.unwrap();
    assert!(matches!(outcome, Err(CommunicationError::Protocol(_))), "{outcome:?}");
    assert!(client.subscriptions().await.is_empty());
}

#[tokio::test]
async fn client_side_messages_from_peer_are_protocol_errors() {
    let (client, mut peer) = connected(WAIT).await;
    peer.send(&Message::subscription_request(&offset())).await;

    let outcome = timeout(WAIT, client.disconnection()).await.unwrap();
    assert!(matches!(outcome, Err(CommunicationError::Protocol(_))), "{outcome:?}");
}

#[tokio::test]
async fn peer_rejections_map_to_typed_errors() {
    let (client, mut peer) = connected(WAIT).await;
    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe(&offset(), |_, _| {}).await })
    };
    assert_eq!(peer.recv().await, Message::subscription_request(&offset()));
    peer.send(&Message::subscription_reply(SubscriptionStatus::NoSuchVar, &offset(), 0, "unknown")).await;

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, FlightVarsError::NoSuchVariable(ref v) if *v == offset()), "{err}");
    assert!(client.subscriptions().await.is_empty());
}

#[tokio::test]
async fn duplicate_subscribe_is_refused_locally() {
    let (client, mut peer) = connected(WAIT).await;
    let _updates = subscribe(&client, &mut peer, &offset(), 42).await;

    let err = client.subscribe(&offset(), |_, _| {}).await.unwrap_err();
    assert!(matches!(err, FlightVarsError::AlreadySubscribed(_)), "{err}");
}

#[tokio::test]
async fn unsubscribe_and_update_round() {
    let (client, mut peer) = connected(WAIT).await;
    let _updates = subscribe(&client, &mut peer, &offset(), 42).await;

    client.update(42, VariableValue::Word(5)).await.unwrap();
    assert_eq!(
        peer.recv().await,
        Message::VarUpdate { subscription_id: 42, value: VariableValue::Word(5) }
    );

    let err = client.update(42, VariableValue::Float(f64::NAN)).await.unwrap_err();
    assert!(matches!(err, FlightVarsError::IllegalValue(_)), "{err}");
    let err = client.update(9, VariableValue::Byte(1)).await.unwrap_err();
    assert!(matches!(err, FlightVarsError::NoSuchSubscription(9)), "{err}");

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.unsubscribe(42).await })
    };
    assert_eq!(peer.recv().await, Message::UnsubscriptionRequest { subscription_id: 42 });
    peer.send(&Message::UnsubscriptionReply {
        status: SubscriptionStatus::Unsubscribed,
        subscription_id: 42,
        cause: String::new(),
    })
    .await;
    task.await.unwrap().unwrap();
    assert!(client.subscriptions().await.is_empty());

    let err = client.unsubscribe(42).await.unwrap_err();
    assert!(matches!(err, FlightVarsError::NoSuchSubscription(42)), "{err}");
}

#[tokio::test]
async fn local_disconnect_says_goodbye_once() {
    let (client, mut peer) = connected(WAIT).await;

    assert!(client.disconnect("done").await.is_ok());
    assert_eq!(peer.recv().await, Message::EndSession { cause: "done".into() });
    assert!(client.disconnect("again").await.is_ok());

    let mut rest = Vec::new();
    let n = timeout(WAIT, peer.stream.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(n, 0, "unexpected trailing bytes {rest:?}");
}

#[tokio::test]
async fn floats_without_wire_form_are_refused() {
    let (client, mut peer) = connected(WAIT).await;
    let _updates = subscribe(&client, &mut peer, &offset(), 1).await;

    for bad in [0.0, -0.0, -2.0, -0.001, f64::INFINITY] {
        let err = client.update(1, VariableValue::Float(bad)).await.unwrap_err();
        assert!(matches!(err, FlightVarsError::IllegalValue(_)), "{bad}: {err}");
    }

    client.update(1, VariableValue::Float(2.5)).await.unwrap();
    match peer.recv().await {
        Message::VarUpdate { subscription_id: 1, value: VariableValue::Float(v) } => {
            assert!((v - 2.5).abs() / 2.5 < 1e-6, "{v}");
        }
        other => panic!("expected the 2.5 update first, got {other:?}"),
    }
    assert!(client.state().is_established());
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_session() {
    let (client, mut peer) = connected(WAIT).await;
    let (tx, mut updates) = mpsc::unbounded_channel();
    let first = AtomicBool::new(true);
    subscribe_with(&client, &mut peer, &offset(), 42, move |_, value| {
        if first.swap(false, Ordering::SeqCst) {
            panic!("handler failure");
        }
        let _ = tx.send(*value);
    })
    .await;

    peer.send(&Message::VarUpdate { subscription_id: 42, value: VariableValue::Word(1) }).await;
    peer.send(&Message::VarUpdate { subscription_id: 42, value: VariableValue::Word(2) }).await;

    assert_eq!(timeout(WAIT, updates.recv()).await.unwrap(), Some(VariableValue::Word(2)));
    assert!(client.state().is_established());
    assert_eq!(client.subscriptions().await, vec![(offset(), 42)]);
}

#[tokio::test]
async fn frame_larger_than_receive_buffer_ends_the_session() {
    let (client, mut peer) = connected_with(|cfg| cfg.recv_buffer_bytes = 64).await;

    let cause = "x".repeat(200);
    peer.send(&Message::subscription_reply(SubscriptionStatus::Subscribed, &offset(), 42, cause)).await;

    let outcome = timeout(WAIT, client.disconnection()).await.unwrap();
    assert!(
        matches!(outcome, Err(CommunicationError::Protocol(ProtocolError::ReceiveBufferOverflow(64)))),
        "{outcome:?}"
    );
}

#[tokio::test]
async fn late_release_is_forgotten_locally() {
    let (client, mut peer) = connected(WAIT).await;
    let _updates = subscribe(&client, &mut peer, &offset(), 42).await;

    // as if an unsubscribe had already timed out on this side
    peer.send(&Message::UnsubscriptionReply {
        status: SubscriptionStatus::Unsubscribed,
        subscription_id: 42,
        cause: String::new(),
    })
    .await;

    let deadline = Instant::now() + WAIT;
    while !client.subscriptions().await.is_empty() {
        assert!(Instant::now() < deadline, "subscription 42 still registered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let err = client.update(42, VariableValue::Word(1)).await.unwrap_err();
    assert!(matches!(err, FlightVarsError::NoSuchSubscription(42)), "{err}");
    assert!(client.state().is_established());
}
