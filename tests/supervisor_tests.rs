//! Dialer reconnect policy and acceptor behaviour

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

use smptt::network::{
    Acceptor, Backoff, Connector, Dialer, Link, LinkEvent, LinkRole, LinkSettings,
};

/// Fails the first `failures` attempts, then hands out in-memory streams.
#[derive(Clone)]
struct ScriptedConnector {
    attempts: Arc<Mutex<Vec<Instant>>>,
    failures: usize,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl ScriptedConnector {
    fn new(failures: usize) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            attempts: Arc::new(Mutex::new(Vec::new())),
            failures,
            peers,
        };
        (connector, rx)
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            attempts.len()
        };
        if attempt <= self.failures {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let (local, remote) = tokio::io::duplex(4096);
        let _ = self.peers.send(remote);
        Ok(local)
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Never completes a connection.
struct BlackholeConnector;

impl Connector for BlackholeConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        std::future::pending().await
    }

    fn describe(&self) -> String {
        "blackhole".to_string()
    }
}

async fn wait_up(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Arc<Link> {
    loop {
        match events.recv().await.expect("event channel closed") {
            LinkEvent::Up(link) => return link,
            _ => continue,
        }
    }
}

fn assert_gap(earlier: Instant, later: Instant, expected: Duration) {
    let gap = later - earlier;
    assert!(
        gap >= expected && gap < expected + Duration::from_millis(50),
        "expected a gap of {:?}, got {:?}",
        expected,
        gap
    );
}

#[tokio::test(start_paused = true)]
async fn test_dialer_backs_off_then_connects() {
    let (connector, _peers) = ScriptedConnector::new(3);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dialer = Dialer::new(
        connector.clone(),
        Backoff::default(),
        Duration::from_secs(30),
        LinkSettings::default(),
        events_tx,
    );
    let task = tokio::spawn(dialer.run(shutdown_rx));

    let link = wait_up(&mut events).await;
    assert_eq!(link.role(), LinkRole::Client);
    assert_eq!(link.remote_addr(), "scripted");

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 4);
    assert_gap(attempts[0], attempts[1], Duration::from_secs(2));
    assert_gap(attempts[1], attempts[2], Duration::from_secs(4));
    assert_gap(attempts[2], attempts[3], Duration::from_secs(8));

    shutdown_tx.send_replace(true);
    task.await.unwrap();
    assert!(link.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_dialer_reconnects_at_floor_after_close() {
    let (connector, mut peers) = ScriptedConnector::new(1);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dialer = Dialer::new(
        connector.clone(),
        Backoff::default(),
        Duration::from_secs(30),
        LinkSettings::default(),
        events_tx,
    );
    let task = tokio::spawn(dialer.run(shutdown_rx));

    let first = wait_up(&mut events).await;
    let remote = peers.recv().await.unwrap();
    drop(remote);

    let second = wait_up(&mut events).await;
    assert_ne!(first.id(), second.id());
    assert!(first.is_closed());

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 3);
    assert_gap(attempts[0], attempts[1], Duration::from_secs(2));
    // A successful connection resets the delay to the floor.
    assert!(attempts[2] - attempts[1] >= Duration::from_secs(1));

    shutdown_tx.send_replace(true);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dialer_stops_while_connecting() {
    let (events_tx, _events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dialer = Dialer::new(
        BlackholeConnector,
        Backoff::default(),
        Duration::from_secs(3600),
        LinkSettings::default(),
        events_tx,
    );
    let task = tokio::spawn(dialer.run(shutdown_rx));
    tokio::time::sleep(Duration::from_secs(10)).await;

    shutdown_tx.send_replace(true);
    timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_acceptor_spawns_server_links() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let acceptor = Acceptor::new(
        listener,
        None,
        Duration::from_secs(5),
        LinkSettings::default(),
        events_tx,
    );
    let addr = acceptor.local_addr().unwrap();
    let task = tokio::spawn(acceptor.run(shutdown_rx));

    let _client = TcpStream::connect(addr).await.unwrap();
    let link = timeout(Duration::from_secs(5), wait_up(&mut events))
        .await
        .unwrap();
    assert_eq!(link.role(), LinkRole::Server);

    shutdown_tx.send_replace(true);
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
