//! Link behaviour over in-memory streams

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use smptt::network::{Link, LinkEvent, LinkRole, LinkSet, LinkSettings};
use smptt::tunnel::{EventType, Frame, FrameCodec};

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> LinkSettings {
    LinkSettings {
        ping_max: Duration::from_secs(30),
        read_buffer_size: 1024,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("event channel closed")
}

async fn next_frame(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Frame {
    loop {
        match next_event(events).await {
            LinkEvent::Frame { frame, .. } => return frame,
            LinkEvent::Up(_) => continue,
            LinkEvent::Disconnected { reason, .. } => panic!("link disconnected: {}", reason),
        }
    }
}

struct Pair {
    client: Arc<Link>,
    client_events: mpsc::UnboundedReceiver<LinkEvent>,
    server: Arc<Link>,
    server_events: mpsc::UnboundedReceiver<LinkEvent>,
}

fn link_pair() -> Pair {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (client_tx, client_events) = mpsc::unbounded_channel();
    let (server_tx, server_events) = mpsc::unbounded_channel();
    let client = Link::spawn(a, "server".into(), LinkRole::Client, &settings(), client_tx);
    let server = Link::spawn(b, "client".into(), LinkRole::Server, &settings(), server_tx);
    Pair {
        client,
        client_events,
        server,
        server_events,
    }
}

#[tokio::test]
async fn test_spawn_announces_link_first() {
    let mut pair = link_pair();
    match next_event(&mut pair.client_events).await {
        LinkEvent::Up(link) => assert_eq!(link.id(), pair.client.id()),
        other => panic!("expected Up, got {:?}", other),
    }
    assert_eq!(pair.client.role(), LinkRole::Client);
    assert_eq!(pair.server.role(), LinkRole::Server);
}

#[tokio::test]
async fn test_frames_cross_link_in_order() {
    let mut pair = link_pair();

    for index in 1..=20u32 {
        let body = Bytes::from(format!("packet {}", index));
        assert!(pair.client.send(&Frame::data(42, index, body)));
    }

    for index in 1..=20u32 {
        let frame = next_frame(&mut pair.server_events).await;
        assert_eq!(frame.event(), EventType::Data);
        assert_eq!(frame.conn_id(), 42);
        assert_eq!(frame.index(), index);
        assert_eq!(frame.body(), format!("packet {}", index).as_bytes());
    }
    assert!(pair.client.bytes_sent() > 0);
    assert_eq!(pair.client.bytes_sent(), pair.server.bytes_received());
}

#[tokio::test]
async fn test_ping_pong_updates_rtt() {
    let mut pair = link_pair();
    assert!(pair.client.ping());
    assert_eq!(pair.client.average_rtt(), Duration::from_secs(30));

    let ping = next_frame(&mut pair.server_events).await;
    assert_eq!(ping.event(), EventType::Ping);
    pair.server.send(&Frame::pong(ping.index()));

    let pong = next_frame(&mut pair.client_events).await;
    assert_eq!(pong.event(), EventType::Pong);
    pair.client.record_pong(pong.index());

    assert!(pair.client.average_rtt() < Duration::from_secs(1));
    assert!(!pair.client.ping_overdue(tokio::time::Instant::now() + Duration::from_secs(60)));
}

#[tokio::test]
async fn test_garbage_before_frame_is_skipped() {
    let (mut raw, stream) = tokio::io::duplex(4096);
    let (tx, mut events) = mpsc::unbounded_channel();
    let _link = Link::spawn(stream, "raw".into(), LinkRole::Server, &settings(), tx);

    let mut bytes = BytesMut::from(&b"\x00\x01garbage"[..]);
    Frame::open(7, "127.0.0.1:22").encode(&mut bytes);
    raw.write_all(&bytes).await.unwrap();

    let frame = next_frame(&mut events).await;
    assert_eq!(frame.event(), EventType::Open);
    assert_eq!(frame.body_str().unwrap(), "127.0.0.1:22");
}

#[tokio::test]
async fn test_unknown_event_destroys_link() {
    let (mut raw, stream) = tokio::io::duplex(4096);
    let (tx, mut events) = mpsc::unbounded_channel();
    let link = Link::spawn(stream, "raw".into(), LinkRole::Server, &settings(), tx);

    let mut header = Vec::new();
    header.extend_from_slice(&0xABCDu16.to_le_bytes());
    header.extend_from_slice(&99u16.to_le_bytes());
    header.extend_from_slice(&[0u8; 12]);
    raw.write_all(&header).await.unwrap();

    loop {
        if let LinkEvent::Disconnected { link: gone, .. } = next_event(&mut events).await {
            assert_eq!(gone.id(), link.id());
            break;
        }
    }
    assert!(link.is_closed());
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_closes_peer() {
    let mut pair = link_pair();

    pair.client.destroy("test");
    pair.client.destroy("again");
    assert!(!pair.client.send(&Frame::ping(1)));
    timeout(WAIT, pair.client.closed()).await.unwrap();

    let mut disconnects = 0;
    while let Ok(Some(event)) =
        timeout(Duration::from_millis(200), pair.client_events.recv()).await
    {
        if let LinkEvent::Disconnected { reason, .. } = event {
            assert_eq!(reason, "test");
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);

    // The far side reads end of stream and tears itself down.
    loop {
        if let LinkEvent::Disconnected { .. } = next_event(&mut pair.server_events).await {
            break;
        }
    }
    assert!(pair.server.is_closed());
}

#[tokio::test]
async fn test_written_bytes_are_plain_frames() {
    let (mut raw, stream) = tokio::io::duplex(4096);
    let (tx, _events) = mpsc::unbounded_channel();
    let link = Link::spawn(stream, "raw".into(), LinkRole::Client, &settings(), tx);

    link.send(&Frame::ack(3, 8));
    let mut buf = BytesMut::new();
    let mut codec = FrameCodec::new();
    let frame = loop {
        timeout(WAIT, raw.read_buf(&mut buf)).await.unwrap().unwrap();
        if let Some(frame) = codec.decode(&mut buf).unwrap() {
            break frame;
        }
    };
    assert_eq!(frame.event(), EventType::Ack);
    assert_eq!((frame.conn_id(), frame.index()), (3, 8));
}

#[tokio::test]
async fn test_link_set_membership() {
    let pair = link_pair();
    let set = LinkSet::new();

    set.insert(pair.client.clone()).await;
    set.insert(pair.client.clone()).await;
    set.insert(pair.server.clone()).await;
    assert_eq!(set.len().await, 2);
    assert_eq!(set.by_role(LinkRole::Client).await.len(), 1);
    assert!(set.random().await.is_some());

    assert!(set.remove(pair.server.id()).await.is_some());
    assert!(set.remove(pair.server.id()).await.is_none());

    set.clear("test").await;
    assert!(set.is_empty().await);
    assert!(pair.client.is_closed());
}
