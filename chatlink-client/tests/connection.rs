mod common;

use std::time::Duration;

use chatlink_client::{
    ConnectionHandle, ConnectionState, EventBus, LinkEvent, LinkSettings, OutboundFrame,
    TransportEvent,
};
use chatlink_core::{ChatFrame, Envelope, Id, LocalId, MAX_FRAME_BYTES, MessageKind, Payload};
use common::{ScriptedConnector, Step, credentials, new_message, next_link_event, push, within};

fn settings(queue_limit: Option<usize>) -> LinkSettings {
    LinkSettings {
        server_url: "ws://chat.test/ws".to_owned(),
        reconnect_base_delay: Duration::from_millis(100),
        reconnect_max_delay: Duration::from_millis(300),
        max_reconnect_attempts: 5,
        connect_timeout: Duration::from_secs(1),
        queue_limit,
    }
}

fn typing(chat: u64) -> Envelope {
    Envelope::typing(Id::Num(chat), true)
}

fn sent_chat(frame: OutboundFrame) -> Id {
    let OutboundFrame::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    let envelope = Envelope::decode(&text).unwrap();
    envelope.chat_id().cloned().expect("frame carries a chat id")
}

fn is_state(wanted: ConnectionState) -> impl FnMut(&LinkEvent) -> bool {
    move |event| *event == LinkEvent::State(wanted)
}

#[tokio::test(start_paused = true)]
async fn queued_envelopes_flush_in_order_on_connect() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());

    for chat in 1..=3 {
        handle.send(typing(chat));
    }
    assert_eq!(handle.stats().await.unwrap().queued, 3);

    handle.connect(credentials(1));
    let mut remote = within(remotes.recv()).await.unwrap();
    for chat in 1..=3 {
        let frame = within(remote.from_client.recv()).await.unwrap();
        assert_eq!(sent_chat(frame), Id::Num(chat));
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.state, ConnectionState::Connected);
    assert_eq!(stats.queued, 0);
    assert_eq!(
        connector.endpoints()[0].as_str(),
        "ws://chat.test/ws?token=secret-token"
    );
}

#[tokio::test(start_paused = true)]
async fn full_queue_evicts_oldest_and_reports_it() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector, settings(Some(2)), EventBus::new());
    let mut events = handle.subscribe();

    for chat in 1..=3 {
        handle.send(typing(chat));
    }
    let evicted = next_link_event(&mut events, |event| matches!(event, LinkEvent::QueueOverflow(_))).await;
    let LinkEvent::QueueOverflow(evicted) = evicted else {
        unreachable!();
    };
    assert_eq!(evicted.chat_id(), Some(&Id::Num(1)));

    handle.connect(credentials(1));
    let mut remote = within(remotes.recv()).await.unwrap();
    assert_eq!(sent_chat(within(remote.from_client.recv()).await.unwrap()), Id::Num(2));
    assert_eq!(sent_chat(within(remote.from_client.recv()).await.unwrap()), Id::Num(3));
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_exponentially_up_to_the_cap() {
    let plan = [Step::Refuse, Step::Refuse, Step::Refuse, Step::Accept];
    let (connector, mut remotes) = ScriptedConnector::new(plan, Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());
    let mut events = handle.subscribe();

    handle.connect(credentials(1));
    let _remote = within(remotes.recv()).await.unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Connected)).await;

    let opened = connector.opened_at();
    assert_eq!(opened.len(), 4);
    let gaps: Vec<Duration> = opened.windows(2).map(|pair| pair[1] - pair[0]).collect();
    for (gap, expected) in gaps.iter().zip([100, 200, 300]) {
        let expected = Duration::from_millis(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(5),
            "gap {gap:?}, expected {expected:?}"
        );
    }
    assert_eq!(handle.stats().await.unwrap().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_wait_for_an_explicit_connect() {
    let plan = [Step::Refuse; 5];
    let (connector, mut remotes) = ScriptedConnector::new(plan, Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());
    let mut events = handle.subscribe();

    handle.connect(credentials(1));
    let exhausted =
        next_link_event(&mut events, |event| matches!(event, LinkEvent::ReconnectExhausted { .. })).await;
    assert_eq!(exhausted, LinkEvent::ReconnectExhausted { attempts: 5 });
    next_link_event(&mut events, is_state(ConnectionState::Disconnected)).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 5);
    assert_eq!(handle.state(), ConnectionState::Disconnected);

    handle.connect(credentials(1));
    let _remote = within(remotes.recv()).await.unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Connected)).await;
    assert_eq!(connector.opens(), 6);
}

#[tokio::test(start_paused = true)]
async fn normal_close_from_server_does_not_reconnect() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());
    let mut events = handle.subscribe();

    handle.connect(credentials(1));
    let remote = within(remotes.recv()).await.unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Connected)).await;

    remote
        .to_client
        .send(TransportEvent::Closed {
            code: Some(1000),
            reason: "bye".to_owned(),
        })
        .unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Disconnected)).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn local_close_sends_normal_close_frame() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());
    let mut events = handle.subscribe();

    handle.connect(credentials(1));
    let mut remote = within(remotes.recv()).await.unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Connected)).await;

    handle.close();
    let frame = within(remote.from_client.recv()).await.unwrap();
    assert_eq!(
        frame,
        OutboundFrame::Close {
            code: 1000,
            reason: "Client disconnecting".to_owned()
        }
    );
    next_link_event(&mut events, is_state(ConnectionState::Disconnecting)).await;
    next_link_event(&mut events, is_state(ConnectionState::Disconnected)).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn unclean_drop_reconnects_and_delivers_what_was_queued() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());
    let mut events = handle.subscribe();

    handle.connect(credentials(1));
    let first = within(remotes.recv()).await.unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Connected)).await;

    first
        .to_client
        .send(TransportEvent::Closed {
            code: Some(1006),
            reason: String::new(),
        })
        .unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Errored)).await;
    handle.send(typing(42));

    let mut second = within(remotes.recv()).await.unwrap();
    assert_eq!(sent_chat(within(second.from_client.recv()).await.unwrap()), Id::Num(42));
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_and_batches_split() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector, settings(None), EventBus::new());
    let mut events = handle.subscribe();

    handle.connect(credentials(1));
    let remote = within(remotes.recv()).await.unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Connected)).await;

    remote
        .to_client
        .send(TransportEvent::Message("{not json".to_owned()))
        .unwrap();
    let batch = format!(
        "{}\n{}",
        new_message(1, 5, 2, 100).encode().unwrap(),
        new_message(2, 5, 2, 200).encode().unwrap()
    );
    remote.to_client.send(TransportEvent::Message(batch)).unwrap();
    push(&remote, &new_message(3, 5, 2, 300));

    let mut ids = Vec::new();
    while ids.len() < 3 {
        let event = next_link_event(&mut events, |event| matches!(event, LinkEvent::Inbound(_))).await;
        if let LinkEvent::Inbound(Envelope {
            payload: Payload::NewMessage(record),
            ..
        }) = event
        {
            ids.push(record.id);
        }
    }
    assert_eq!(ids, vec![Id::Num(1), Id::Num(2), Id::Num(3)]);
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_while_active_is_ignored() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());

    handle.connect(credentials(1));
    let _remote = within(remotes.recv()).await.unwrap();
    handle.connect(credentials(1));
    handle.connect(credentials(1));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.state, ConnectionState::Connected);
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_left_unwritten_by_a_dropped_link_go_out_on_the_next() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector.clone(), settings(None), EventBus::new());
    let mut events = handle.subscribe();

    for chat in 1..=3 {
        handle.send(typing(chat));
    }
    handle.connect(credentials(1));
    let mut first = within(remotes.recv()).await.unwrap();
    assert_eq!(sent_chat(within(first.from_client.recv()).await.unwrap()), Id::Num(1));

    first
        .to_client
        .send(TransportEvent::Closed {
            code: Some(1006),
            reason: String::new(),
        })
        .unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Errored)).await;
    drop(first);

    let mut second = within(remotes.recv()).await.unwrap();
    assert_eq!(sent_chat(within(second.from_client.recv()).await.unwrap()), Id::Num(2));
    assert_eq!(sent_chat(within(second.from_client.recv()).await.unwrap()), Id::Num(3));
    assert_eq!(handle.stats().await.unwrap().queued, 0);
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn oversized_envelope_is_reported_not_sent() {
    let (connector, mut remotes) = ScriptedConnector::new([], Step::Accept);
    let (handle, _task) = ConnectionHandle::spawn(connector, settings(None), EventBus::new());
    let mut events = handle.subscribe();

    handle.connect(credentials(1));
    let mut remote = within(remotes.recv()).await.unwrap();
    next_link_event(&mut events, is_state(ConnectionState::Connected)).await;

    let oversized = Envelope::new(Payload::Chat(ChatFrame {
        chat_id: Id::Num(5),
        content: "x".repeat(MAX_FRAME_BYTES),
        message_type: MessageKind::Text,
        local_id: Some(LocalId::from("too-big")),
        reply_to_id: None,
    }));
    handle.send(oversized.clone());
    handle.send(typing(7));

    let reported =
        next_link_event(&mut events, |event| matches!(event, LinkEvent::Undeliverable(_))).await;
    assert_eq!(reported, LinkEvent::Undeliverable(oversized));
    assert_eq!(sent_chat(within(remote.from_client.recv()).await.unwrap()), Id::Num(7));
    assert_eq!(handle.state(), ConnectionState::Connected);
}
