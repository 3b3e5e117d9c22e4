mod common;

use common::{start_relay, wait_members, EventLog, STEP};
use futures_util::{SinkExt, StreamExt};
use pairchat_lib::config::OFFER_JITTER;
use pairchat_lib::peer::{ChannelEvent, LoopbackTransport};
use pairchat_lib::protocol::{FileChunk, Frame};
use pairchat_lib::signaling::SignalMessage;
use pairchat_lib::transfer::split_into_chunks;
use pairchat_lib::{
    ChatLine, ClientConfig, DataChannel, FileReady, LoopbackNetwork, Phase, SessionHandle,
    TransportAdapter, UiEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

fn client_config(url: &str, dir: &std::path::Path) -> ClientConfig {
    ClientConfig::default()
        .with_signal_url(url)
        .with_room("one")
        .with_received_dir(dir)
        .with_offer_jitter(Duration::from_millis(50))
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn two_sessions_chat_and_transfer_a_file() {
    let (url, rooms) = start_relay().await;
    let net = LoopbackNetwork::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let (alice, events_a) =
        SessionHandle::spawn(client_config(&url, dir_a.path()), Arc::new(net.transport()));
    let mut log_a = EventLog::new(events_a);
    log_a.wait_status("Joined room 'one'").await;
    alice.set_username("alice");
    log_a.wait_status("Username set to: alice").await;

    // ready от alice уходит в пустую комнату, offer сможет отправить только она
    alice.click_ready();
    assert!(timeout(STEP, alice.wait_for_phase(|p| p == Phase::WaitingPeer))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // до открытия канала сообщения копятся в очереди
    alice.send_message("first");
    alice.send_message("");
    alice.send_message("second");
    alice.send_message("third");

    let (bob, events_b) =
        SessionHandle::spawn(client_config(&url, dir_b.path()), Arc::new(net.transport()));
    let mut log_b = EventLog::new(events_b);
    log_b.wait_status("Joined room 'one'").await;
    wait_members(&rooms, "one", 2).await;
    bob.set_username("bob");
    bob.click_ready();

    log_a.wait_status("Peer is ready.").await;
    log_a.wait_status("Offer sent – waiting for answer…").await;
    log_b.wait_status("Answer sent – awaiting channel open…").await;
    log_a.wait_status("Answer accepted – awaiting channel open…").await;
    log_a.wait_status("-- channel open --").await;
    log_b.wait_status("-- channel open --").await;
    assert_eq!(alice.phase(), Phase::Open);

    log_b.wait_status("Peer's username: alice").await;
    log_a.wait_status("Peer's username: bob").await;
    log_b
        .wait_for("third message", |e| {
            matches!(e, UiEvent::Chat(ChatLine::Message { msg, .. }) if msg == "third")
        })
        .await;
    let expected: Vec<(String, String)> = ["first", "second", "third"]
        .iter()
        .map(|m| ("alice".to_string(), m.to_string()))
        .collect();
    assert_eq!(log_b.chat_messages(), expected);

    // после открытия сообщение уходит сразу
    bob.send_message("hi alice");
    let reply = log_a
        .wait_for("reply", |e| matches!(e, UiEvent::Chat(ChatLine::Message { .. })))
        .await;
    assert_eq!(
        reply,
        UiEvent::Chat(ChatLine::Message {
            username: "bob".into(),
            msg: "hi alice".into()
        })
    );

    // 130000 байт: три куска 64000 + 64000 + 2000
    let source = dir_a.path().join("report.pdf");
    let bytes = sample(130_000);
    std::fs::write(&source, &bytes).unwrap();
    alice.send_file(&source);

    let mut percents = Vec::new();
    while percents.last() != Some(&100) {
        percents.push(next_percent(&mut log_b, "report.pdf").await);
    }
    assert_eq!(percents, vec![33, 67, 100]);

    let file = log_b
        .wait_for("file event", |e| matches!(e, UiEvent::File(_)))
        .await;
    let UiEvent::File(FileReady { name, ext, path }) = file else {
        unreachable!()
    };
    assert_eq!(name, "report.pdf");
    assert_eq!(ext, ".pdf");
    let path = path.unwrap();
    assert_eq!(path, dir_b.path().join("report.pdf"));
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    assert!(log_b.chat_messages().contains(&(
        "Peer".to_string(),
        "[file] 'report.pdf' received. Download link available.".to_string()
    )));

    // повторный disconnect ничего не делает
    alice.disconnect();
    alice.disconnect();
    log_a.drain().await;
    assert_eq!(log_a.count_status("Disconnected"), 1);
    assert_eq!(log_a.count_chat_text("----disconnected----"), 1);
    assert!(!alice.send_message("too late"));

    log_b.wait_status("Peer disconnected").await;
    log_b.wait_status("Data channel closed with peer.").await;
    assert_eq!(log_b.count_chat_text("----disconnected----"), 1);
    assert!(!log_b
        .chat_messages()
        .iter()
        .any(|(_, msg)| msg.is_empty() || msg == "too late"));

    bob.disconnect();
    log_b.drain().await;
}

#[tokio::test]
async fn file_errors_surface_as_status() {
    let (url, _rooms) = start_relay().await;
    let net = LoopbackNetwork::new();
    let dir = tempfile::tempdir().unwrap();

    let (session, events) =
        SessionHandle::spawn(client_config(&url, dir.path()), Arc::new(net.transport()));
    let mut log = EventLog::new(events);
    log.wait_status("Joined room 'one'").await;

    let missing = dir.path().join("nope.txt");
    session.send_file(&missing);
    log.wait_status(&format!(
        "Error: File not found for sending: {}",
        missing.display()
    ))
    .await;

    let empty = dir.path().join("empty.txt");
    std::fs::write(&empty, b"").unwrap();
    session.send_file(&empty);
    log.wait_status(&format!("File is empty, nothing sent: {}", empty.display()))
        .await;

    let real = dir.path().join("notes.txt");
    std::fs::write(&real, b"hello").unwrap();
    session.send_file(&real);
    log.wait_status(&format!("Channel not open, file not sent: {}", real.display()))
        .await;

    session.disconnect();
    log.drain().await;
}

#[tokio::test]
async fn unreachable_relay_moves_to_error_and_ready_reconnects() {
    // занимаем порт и сразу освобождаем: соединение получит отказ
    let spare = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = spare.local_addr().unwrap();
    drop(spare);

    let net = LoopbackNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let url = format!("ws://{addr}");
    let (session, events) =
        SessionHandle::spawn(client_config(&url, dir.path()), Arc::new(net.transport()));
    let mut log = EventLog::new(events);

    log.wait_status_prefix("Signalling error: ").await;
    log.wait_status("Signalling connection closed").await;
    assert!(timeout(STEP, session.wait_for_phase(|p| p == Phase::Error))
        .await
        .unwrap());

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let rooms = pairchat_lib::RoomRegistry::new();
    tokio::spawn(pairchat_lib::relay::serve(listener, rooms.clone()));

    session.click_ready();
    log.wait_status("Joined room 'one'").await;
    assert!(timeout(STEP, session.wait_for_phase(|p| p == Phase::WaitingPeer))
        .await
        .unwrap());
    wait_members(&rooms, "one", 1).await;

    session.disconnect();
    log.drain().await;
}

#[tokio::test]
async fn malformed_relay_frame_is_a_signalling_failure() {
    let (url, rooms) = start_relay().await;
    let net = LoopbackNetwork::new();
    let dir = tempfile::tempdir().unwrap();

    let (session, events) =
        SessionHandle::spawn(client_config(&url, dir.path()), Arc::new(net.transport()));
    let mut log = EventLog::new(events);
    log.wait_status("Joined room 'one'").await;

    let (mut raw, _) = connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Text(r#"{"type":"join","room":"one"}"#.into()))
        .await
        .unwrap();
    wait_members(&rooms, "one", 2).await;
    raw.send(Message::Text(r#"{"type":"answer","room":"one"}"#.into()))
        .await
        .unwrap();

    log.wait_status_prefix("Signalling error: ").await;
    log.wait_status("Signalling connection closed").await;
    assert!(timeout(STEP, session.wait_for_phase(|p| p == Phase::Error))
        .await
        .unwrap());

    session.disconnect();
    log.drain().await;
}

/// Пир, которым тест управляет вручную: свой websocket и свой loopback транспорт
#[tokio::test]
async fn bad_peer_frames_become_system_chat() {
    let (url, rooms) = start_relay().await;
    let net = LoopbackNetwork::new();
    let dir = tempfile::tempdir().unwrap();

    let (mut raw, _) = connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Text(r#"{"type":"join","room":"one"}"#.into()))
        .await
        .unwrap();
    wait_members(&rooms, "one", 1).await;

    let (session, events) =
        SessionHandle::spawn(client_config(&url, dir.path()), Arc::new(net.transport()));
    let mut log = EventLog::new(events);
    log.wait_status("Joined room 'one'").await;
    session.set_username("alice");
    session.click_ready();

    let next_signal = |text: String| SignalMessage::decode(&text).unwrap();

    // ready от сессии
    let frame = read_text(&mut raw).await;
    assert!(matches!(next_signal(frame), SignalMessage::Ready { .. }));
    raw.send(Message::Text(r#"{"type":"ready","room":"one"}"#.into()))
        .await
        .unwrap();

    let frame = read_text(&mut raw).await;
    let SignalMessage::Offer { data: offer, .. } = next_signal(frame) else {
        panic!("expected offer");
    };

    let peer = net.transport();
    let (dc_tx, mut dc_rx) = mpsc::unbounded_channel::<Arc<dyn DataChannel>>();
    peer.on_incoming_channel(Box::new(move |dc| {
        let _ = dc_tx.send(dc);
    }));
    peer.set_remote_description(offer).await.unwrap();
    let answer = peer.create_answer().await.unwrap();
    let answer = peer.set_local_description(answer).await.unwrap();
    let answer = SignalMessage::Answer {
        room: "one".into(),
        data: answer,
    };
    raw.send(Message::Text(serde_json::to_string(&answer).unwrap()))
        .await
        .unwrap();

    let dc = timeout(STEP, dc_rx.recv()).await.unwrap().unwrap();
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    dc.on_event(Box::new(move |event| {
        let _ = ev_tx.send(event);
    }));
    log.wait_status("-- channel open --").await;

    // первым кадром сессия представляется
    loop {
        match timeout(STEP, ev_rx.recv()).await.unwrap().unwrap() {
            ChannelEvent::Message(raw_frame) => {
                let value: serde_json::Value = serde_json::from_slice(&raw_frame).unwrap();
                assert_eq!(
                    value,
                    serde_json::json!({"type": "username_announce", "username_announce": "alice"})
                );
                break;
            }
            _ => continue,
        }
    }

    dc.send_text("definitely not json".into()).await.unwrap();
    dc.send_text(
        r#"{"type":"file_chunk","filename":"x.bin","ext":".bin","chunk_id":5,"total_chunks":2,"data":"","timestamp":0.0}"#
            .into(),
    )
    .await
    .unwrap();
    dc.send_text(r#"{"username":"legacy","msg":"untagged"}"#.into())
        .await
        .unwrap();
    dc.send_text(r#"{"type":"chat","username":"peer","msg":"still alive"}"#.into())
        .await
        .unwrap();

    log.wait_for("valid chat", |e| {
        matches!(e, UiEvent::Chat(ChatLine::Message { msg, .. }) if msg == "still alive")
    })
    .await;
    let errors: Vec<_> = log
        .chat_messages()
        .into_iter()
        .filter(|(user, msg)| user == "System" && msg.starts_with("[Error processing peer message: "))
        .collect();
    assert_eq!(errors.len(), 3);
    assert_eq!(session.phase(), Phase::Open);

    session.disconnect();
    log.drain().await;
    let bye = match timeout(STEP, ev_rx.recv()).await.unwrap().unwrap() {
        ChannelEvent::Message(bye) => bye,
        other => panic!("expected disconnect frame, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_slice(&bye).unwrap();
    assert_eq!(value, serde_json::json!({"type": "system", "system": "disconnect"}));
}

const OFFER_SENT: &str = "Offer sent – waiting for answer…";

/// Оба пира готовы почти одновременно: каждый получает чужой ready,
/// будучи готовым сам, и запускает таймер. Offer отправляет только один.
#[tokio::test]
async fn simultaneous_ready_sends_a_single_offer() {
    for _ in 0..5 {
        let (url, rooms) = start_relay().await;
        let net = LoopbackNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::default()
            .with_signal_url(&url)
            .with_room("one")
            .with_received_dir(dir.path());
        assert_eq!(config.offer_jitter, OFFER_JITTER);

        let (alice, events_a) = SessionHandle::spawn(config.clone(), Arc::new(net.transport()));
        let (bob, events_b) = SessionHandle::spawn(config, Arc::new(net.transport()));
        let mut log_a = EventLog::new(events_a);
        let mut log_b = EventLog::new(events_b);
        log_a.wait_status("Joined room 'one'").await;
        log_b.wait_status("Joined room 'one'").await;
        wait_members(&rooms, "one", 2).await;

        alice.click_ready();
        bob.click_ready();

        for session in [&alice, &bob] {
            assert!(timeout(STEP, session.wait_for_phase(|p| p == Phase::Open))
                .await
                .unwrap());
        }

        alice.disconnect();
        bob.disconnect();
        log_a.drain().await;
        log_b.drain().await;
        assert_eq!(log_a.count_status(OFFER_SENT) + log_b.count_status(OFFER_SENT), 1);
        assert!(!log_a
            .seen
            .iter()
            .chain(log_b.seen.iter())
            .any(|e| matches!(e, UiEvent::Status(s) if s.starts_with("Negotiation error"))));
    }
}

type RawSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Пир-offerer на отдельном loopback транспорте: offer уходит через сервер,
/// answer сессии применяется и канал открывается
async fn open_channel_from(
    peer: &LoopbackTransport,
    raw: &mut RawSocket,
) -> Arc<dyn DataChannel> {
    let dc = peer.create_channel("chat").await.unwrap();
    let offer = peer.create_offer().await.unwrap();
    let offer = peer.set_local_description(offer).await.unwrap();
    let offer = SignalMessage::Offer {
        room: "one".into(),
        data: offer,
    };
    raw.send(Message::Text(offer.encode().unwrap())).await.unwrap();

    let SignalMessage::Answer { data: answer, .. } =
        SignalMessage::decode(&read_text(raw).await).unwrap()
    else {
        panic!("expected answer");
    };
    peer.set_remote_description(answer).await.unwrap();
    dc
}

async fn send_chunk(dc: &Arc<dyn DataChannel>, chunk: &FileChunk) {
    let frame = Frame::FileChunk(chunk.clone()).encode().unwrap();
    dc.send_text(frame).await.unwrap();
}

async fn next_percent(log: &mut EventLog, filename: &str) -> u32 {
    let prefix = format!("Receiving {filename}: ");
    let line = log.wait_status_prefix(&prefix).await;
    line.trim_start_matches(&prefix)
        .split('%')
        .next()
        .unwrap()
        .parse()
        .unwrap()
}

#[tokio::test]
async fn closed_channel_discards_partial_transfer() {
    let (url, rooms) = start_relay().await;
    let net = LoopbackNetwork::new();
    let dir = tempfile::tempdir().unwrap();

    let (mut raw, _) = connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Text(r#"{"type":"join","room":"one"}"#.into()))
        .await
        .unwrap();
    wait_members(&rooms, "one", 1).await;

    let (session, events) =
        SessionHandle::spawn(client_config(&url, dir.path()), Arc::new(net.transport()));
    let mut log = EventLog::new(events);
    log.wait_status("Joined room 'one'").await;
    wait_members(&rooms, "one", 2).await;

    let bytes = sample(300);
    let chunks = split_into_chunks("partial.bin", &bytes, 100, 0.0);
    assert_eq!(chunks.len(), 3);

    let first_peer = net.transport();
    let dc = open_channel_from(&first_peer, &mut raw).await;
    log.wait_status("Answer sent – awaiting channel open…").await;
    log.wait_status("-- channel open --").await;

    send_chunk(&dc, &chunks[0]).await;
    assert_eq!(next_percent(&mut log, "partial.bin").await, 33);

    dc.close().await.unwrap();
    log.wait_status("Data channel closed with peer.").await;
    assert!(timeout(STEP, session.wait_for_phase(|p| p == Phase::Closed))
        .await
        .unwrap());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

    // тот же файл по новому каналу собирается с нуля
    let second_peer = net.transport();
    let dc = open_channel_from(&second_peer, &mut raw).await;
    log.wait_status("-- channel open --").await;
    assert_eq!(session.phase(), Phase::Open);

    let mut percents = Vec::new();
    for i in [1, 2, 0] {
        send_chunk(&dc, &chunks[i]).await;
        percents.push(next_percent(&mut log, "partial.bin").await);
    }
    assert_eq!(percents, vec![33, 67, 100]);

    log.wait_for("file event", |e| matches!(e, UiEvent::File(_))).await;
    assert_eq!(std::fs::read(dir.path().join("partial.bin")).unwrap(), bytes);

    session.disconnect();
    log.drain().await;
}

async fn read_text(ws: &mut RawSocket) -> String {
    loop {
        match timeout(STEP, ws.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return text,
            _ => continue,
        }
    }
}
