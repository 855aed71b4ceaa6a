//! The task that owns one logical connection's local socket.
//!
//! Every other component talks to it through [`ConnHandle`], so the
//! sequencing state in [`Connection`] has a single writer.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

use super::connection::{format_id, Connection, ConnectionConfig, Rescue};
use super::frame::Frame;
use super::timer::{sleep_until, Debounce, Throttle};
use crate::network::{selection, BoxedStream, Link};

/// Where the local end of a connection comes from.
pub enum Origin {
    /// A socket accepted on this side. `announce` is the target re-sent in
    /// `open` frames whenever a new client link comes up.
    Accepted {
        stream: BoxedStream,
        announce: Option<String>,
    },
    /// Dial this address; the far side accepted the socket.
    Dial(String),
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Accepted { announce, .. } => f
                .debug_struct("Accepted")
                .field("announce", announce)
                .finish_non_exhaustive(),
            Origin::Dial(target) => f.debug_tuple("Dial").field(target).finish(),
        }
    }
}

#[derive(Debug)]
pub enum ConnCommand {
    Data { index: u32, body: Bytes },
    Rescue(u32),
    Ack(u32),
    AddLink(Arc<Link>),
    RemoveLink(u64),
    Destroy,
}

#[derive(Debug)]
struct Shared {
    last_active: Mutex<Instant>,
    destroyed: AtomicBool,
    last_index: AtomicU32,
    next_expected: AtomicU32,
}

/// Cheap, cloneable face of a running connection task.
#[derive(Debug)]
pub struct ConnHandle {
    id: u32,
    announce: Option<String>,
    tx: mpsc::UnboundedSender<ConnCommand>,
    shared: Arc<Shared>,
}

impl ConnHandle {
    /// Starts the connection task.
    pub fn spawn(id: u32, origin: Origin, config: ConnectionConfig) -> Arc<ConnHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let shared = Arc::new(Shared {
            last_active: Mutex::new(now),
            destroyed: AtomicBool::new(false),
            last_index: AtomicU32::new(0),
            next_expected: AtomicU32::new(1),
        });
        let announce = match &origin {
            Origin::Accepted { announce, .. } => announce.clone(),
            Origin::Dial(_) => None,
        };

        let forwarder = Forwarder {
            flush: Throttle::new(config.flush_interval),
            request: Debounce::new(config.request_delay),
            conn: Connection::new(id, config, now),
            rx,
            links: Vec::new(),
            shared: shared.clone(),
        };
        tokio::spawn(forwarder.run(origin));

        Arc::new(ConnHandle {
            id,
            announce,
            tx,
            shared,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    pub fn last_active(&self) -> Instant {
        self.shared
            .last_active
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active()) > idle_timeout
    }

    /// Highest outbound index assigned so far.
    pub fn last_index(&self) -> u32 {
        self.shared.last_index.load(Ordering::Relaxed)
    }

    pub fn next_expected(&self) -> u32 {
        self.shared.next_expected.load(Ordering::Relaxed)
    }

    fn command(&self, cmd: ConnCommand) {
        // The task is gone once destroyed; late frames are dropped.
        let _ = self.tx.send(cmd);
    }

    pub fn deliver(&self, index: u32, body: Bytes) {
        self.command(ConnCommand::Data { index, body });
    }

    pub fn rescue(&self, index: u32) {
        self.command(ConnCommand::Rescue(index));
    }

    pub fn acknowledge(&self, index: u32) {
        self.command(ConnCommand::Ack(index));
    }

    pub fn add_link(&self, link: Arc<Link>) {
        self.command(ConnCommand::AddLink(link));
    }

    pub fn remove_link(&self, link_id: u64) {
        self.command(ConnCommand::RemoveLink(link_id));
    }

    pub fn destroy(&self) {
        self.shared.destroyed.store(true, Ordering::Release);
        self.command(ConnCommand::Destroy);
    }
}

enum Step {
    Continue,
    Stop,
}

struct Forwarder {
    conn: Connection,
    rx: mpsc::UnboundedReceiver<ConnCommand>,
    links: Vec<Arc<Link>>,
    flush: Throttle,
    request: Debounce<u32>,
    shared: Arc<Shared>,
}

impl Forwarder {
    async fn run(mut self, origin: Origin) {
        let id = format_id(self.conn.id());
        let stream = match origin {
            Origin::Accepted { stream, .. } => stream,
            Origin::Dial(target) => {
                let connect_timeout = self.conn.config().connect_timeout;
                match timeout(connect_timeout, TcpStream::connect(&target)).await {
                    Ok(Ok(stream)) => {
                        let _ = stream.set_nodelay(true);
                        tracing::debug!(conn = %id, "connected to {}", target);
                        Box::new(stream) as BoxedStream
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(conn = %id, "failed to connect to {}: {}", target, e);
                        self.abort();
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(conn = %id, "connecting to {} timed out", target);
                        self.abort();
                        return;
                    }
                }
            }
        };

        let (mut reader, mut writer) = tokio::io::split(stream);
        let read_size = self.conn.config().read_buffer_size;
        let mut buf = BytesMut::with_capacity(read_size);

        loop {
            let reading = !self.conn.is_paused() && !self.conn.is_local_closed();
            buf.reserve(read_size);

            let step = tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd, &mut writer).await,
                    None => Step::Stop,
                },
                result = reader.read_buf(&mut buf), if reading => {
                    match result {
                        Ok(0) => self.local_closed("end of stream"),
                        Ok(_) => {
                            let now = Instant::now();
                            let index = self.conn.push(buf.split().freeze(), now);
                            self.shared.last_index.store(index, Ordering::Relaxed);
                            self.touch();
                            self.flush.arm(now);
                        }
                        Err(e) => self.local_closed(&e.to_string()),
                    }
                    Step::Continue
                }
                _ = sleep_until(self.flush.deadline()) => {
                    self.flush.fire(Instant::now());
                    self.flush_outbound();
                    Step::Continue
                }
                _ = sleep_until(self.request.deadline()) => {
                    let now = Instant::now();
                    if let Some(index) = self.request.fire(now) {
                        self.send_request(index, now);
                    }
                    Step::Continue
                }
            };

            if let Step::Stop = step {
                break;
            }
        }

        let _ = writer.shutdown().await;
        self.shared.destroyed.store(true, Ordering::Release);
        let stats = self.conn.stats();
        tracing::debug!(
            conn = %id,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            packets_sent = stats.packets_sent,
            rescued = stats.packets_rescued,
            evicted = stats.packets_evicted,
            "destroy"
        );
    }

    async fn handle(&mut self, cmd: ConnCommand, writer: &mut WriteHalf<BoxedStream>) -> Step {
        match cmd {
            ConnCommand::Data { index, body } => {
                let now = Instant::now();
                let delivery = self.conn.receive(index, body, now);
                self.touch();
                self.shared
                    .next_expected
                    .store(self.conn.next_expected(), Ordering::Relaxed);

                for chunk in &delivery.writes {
                    if let Err(e) = writer.write_all(chunk).await {
                        self.local_closed(&e.to_string());
                        break;
                    }
                }
                if !delivery.writes.is_empty() {
                    self.request.arm(now, self.conn.next_expected());
                } else if self.conn.reorder_len() > 0 && !self.request.is_armed() {
                    self.request.arm(now, self.conn.next_expected());
                }
                for ack in delivery.acks {
                    self.send_frame(&Frame::ack(self.conn.id(), ack));
                }
                if delivery.closed {
                    tracing::debug!(conn = %format_id(self.conn.id()), "closed by remote");
                    self.flush_outbound();
                    return Step::Stop;
                }
            }
            ConnCommand::Rescue(index) => self.rescue(index),
            ConnCommand::Ack(index) => {
                self.conn.acknowledge(index, Instant::now());
                self.touch();
            }
            ConnCommand::AddLink(link) => {
                self.add_link(link);
                if self.conn.has_unsent() {
                    self.flush.arm(Instant::now());
                }
            }
            ConnCommand::RemoveLink(link_id) => {
                self.links.retain(|l| l.id() != link_id);
            }
            ConnCommand::Destroy => {
                self.conn.finish();
                self.flush_outbound();
                return Step::Stop;
            }
        }
        Step::Continue
    }

    fn add_link(&mut self, link: Arc<Link>) {
        self.conn.touch(Instant::now());
        self.touch();
        if !self.links.iter().any(|l| l.id() == link.id()) {
            self.links.push(link);
        }
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.shared.last_active.lock() {
            *guard = self.conn.last_active();
        }
    }

    /// Local socket ended: send end-of-stream unless the remote ended first.
    /// The task stays up to answer `req` until the remote closes or the
    /// connection idles out.
    fn local_closed(&mut self, reason: &str) {
        if let Some(index) = self.conn.finish() {
            tracing::debug!(
                conn = %format_id(self.conn.id()),
                "local side closed ({}), end of stream at {}",
                reason,
                index
            );
            self.shared.last_index.store(index, Ordering::Relaxed);
            self.flush.arm(Instant::now());
        }
    }

    /// Local connect failed: collect any links already announced, tell the
    /// far side the stream is over and stop.
    fn abort(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                ConnCommand::AddLink(link) => self.add_link(link),
                ConnCommand::RemoveLink(link_id) => self.links.retain(|l| l.id() != link_id),
                _ => {}
            }
        }
        self.conn.finish();
        self.flush_outbound();
        self.shared.destroyed.store(true, Ordering::Release);
    }

    fn select_link(&mut self) -> Option<Arc<Link>> {
        self.links.retain(|l| !l.is_closed());
        selection::select(&self.links, self.conn.config().max_rtt).cloned()
    }

    fn send_frame(&mut self, frame: &Frame) -> bool {
        match self.select_link() {
            Some(link) => link.send(frame),
            None => false,
        }
    }

    fn flush_outbound(&mut self) {
        let id = self.conn.id();
        while self.conn.has_unsent() {
            let Some(link) = self.select_link() else {
                tracing::trace!(conn = %format_id(id), "no link available, holding packets");
                break;
            };
            let Some(packet) = self.conn.next_unsent() else {
                break;
            };
            if link.send(&Frame::data(id, packet.index, packet.body.clone())) {
                self.conn.mark_sent();
            }
        }

        let eviction = self.conn.trim();
        if eviction.evicted > 0 {
            tracing::warn!(
                conn = %format_id(id),
                "retransmission buffer full, evicted {} packets ({} never sent)",
                eviction.evicted,
                eviction.unsent
            );
        }
    }

    fn rescue(&mut self, index: u32) {
        let id = self.conn.id();
        match self.conn.rescue(index) {
            Rescue::Found(packet) => {
                if self.send_frame(&Frame::data(id, packet.index, packet.body)) {
                    tracing::debug!(conn = %format_id(id), "rescue {}", index);
                }
            }
            Rescue::Evicted { oldest } => {
                tracing::warn!(
                    conn = %format_id(id),
                    "can not rescue {} (oldest buffered {:?}, newest {})",
                    index,
                    oldest,
                    self.conn.last_index()
                );
            }
            Rescue::Unknown => {
                tracing::trace!(conn = %format_id(id), "ignoring request for {}", index);
            }
        }
    }

    fn send_request(&mut self, index: u32, now: Instant) {
        let id = self.conn.id();
        if self.send_frame(&Frame::req(id, index)) {
            tracing::debug!(conn = %format_id(id), "request {}", index);
        }
        // Keep asking while later packets wait behind the gap.
        if self.conn.reorder_len() > 0 {
            self.request.arm(now, self.conn.next_expected());
        }
    }
}
