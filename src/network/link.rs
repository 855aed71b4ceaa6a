use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{Duration, Instant};

use super::AsyncStream;
use crate::monitor::LinkSnapshot;
use crate::tunnel::frame::{Frame, FrameCodec, FrameError};

const RTT_WINDOW: usize = 5;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("Closed by peer")]
    Eof,

    #[error("Ping timed out after {0:?}")]
    PingTimeout(Duration),

    #[error("Shutting down")]
    Shutdown,
}

/// Which side of the tunnel established the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Dialed by this process.
    Client,
    /// Accepted by this process.
    Server,
}

impl LinkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRole::Client => "client",
            LinkRole::Server => "server",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// RTT assumed before the first pong, and while a ping is in flight.
    pub ping_max: Duration,
    pub read_buffer_size: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            ping_max: Duration::from_secs(30),
            read_buffer_size: 16 * 1024,
        }
    }
}

/// Everything a link reports to the tunnel, in per-link order.
#[derive(Debug)]
pub enum LinkEvent {
    Up(Arc<Link>),
    Frame { link: Arc<Link>, frame: Frame },
    Disconnected { link: Arc<Link>, reason: String },
}

#[derive(Debug)]
struct RttWindow {
    samples: VecDeque<f64>,
    average_ms: f64,
}

impl RttWindow {
    fn new(initial_ms: f64) -> Self {
        Self {
            samples: VecDeque::with_capacity(RTT_WINDOW),
            average_ms: initial_ms,
        }
    }

    fn record(&mut self, sample_ms: f64) {
        if self.samples.len() == RTT_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
        self.average_ms = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
    }
}

/// Milliseconds since the epoch, folded into the 32-bit index field.
pub fn timestamp_ms() -> u32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    (millis % 0xffff_ffff) as u32
}

/// One transport stream carrying frames for any number of connections.
///
/// A writer task drains queued frames into the stream and a reader task
/// decodes inbound bytes into [`LinkEvent::Frame`]s. `send` never blocks.
#[derive(Debug)]
pub struct Link {
    id: u64,
    role: LinkRole,
    remote_addr: String,
    started_at: DateTime<Utc>,
    ping_max: Duration,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    outstanding: AtomicUsize,
    last_active: Mutex<Instant>,
    rtt: Mutex<RttWindow>,
    /// When the oldest unanswered ping was sent.
    pending_ping: Mutex<Option<Instant>>,

    tx: mpsc::UnboundedSender<Bytes>,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Link {
    /// Wraps `stream`, announces the link with [`LinkEvent::Up`] and starts
    /// its reader and writer tasks.
    pub fn spawn<S>(
        stream: S,
        remote_addr: String,
        role: LinkRole,
        settings: &LinkSettings,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<Link>
    where
        S: AsyncStream + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let ping_max_ms = settings.ping_max.as_secs_f64() * 1000.0;

        let link = Arc::new(Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            role,
            remote_addr,
            started_at: Utc::now(),
            ping_max: settings.ping_max,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
            rtt: Mutex::new(RttWindow::new(ping_max_ms)),
            pending_ping: Mutex::new(None),
            tx,
            events,
            closed: AtomicBool::new(false),
            shutdown,
        });

        let _ = link.events.send(LinkEvent::Up(link.clone()));

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(write_loop(link.clone(), writer, rx));
        tokio::spawn(read_loop(link.clone(), reader, settings.read_buffer_size));
        link
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes queued for the stream but not yet written.
    pub fn outstanding_write_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_active.lock() {
            *guard = Instant::now();
        }
    }

    pub fn average_rtt(&self) -> Duration {
        Duration::try_from_secs_f64(self.average_rtt_ms().max(0.0) / 1000.0)
            .unwrap_or(Duration::MAX)
    }

    pub fn average_rtt_ms(&self) -> f64 {
        self.rtt
            .lock()
            .map(|rtt| rtt.average_ms)
            .unwrap_or(f64::MAX)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues one frame. Returns false when the link is already gone.
    pub fn send(&self, frame: &Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        let bytes = frame.to_bytes();
        let len = bytes.len();
        self.outstanding.fetch_add(len, Ordering::Relaxed);
        if self.tx.send(bytes).is_err() {
            self.outstanding.fetch_sub(len, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Sends a ping and treats the link as slow until the pong returns.
    pub fn ping(&self) -> bool {
        let stamp = timestamp_ms();
        if let Ok(mut pending) = self.pending_ping.lock() {
            pending.get_or_insert_with(Instant::now);
        }
        if let Ok(mut rtt) = self.rtt.lock() {
            rtt.average_ms = self.ping_max.as_secs_f64() * 1000.0;
        }
        self.send(&Frame::ping(stamp))
    }

    /// Folds the echoed timestamp of a pong into the RTT window.
    pub fn record_pong(&self, stamp: u32) -> Duration {
        self.record_pong_at(stamp, timestamp_ms())
    }

    fn record_pong_at(&self, stamp: u32, now: u32) -> Duration {
        let sample_ms = now.wrapping_sub(stamp);
        if let Ok(mut rtt) = self.rtt.lock() {
            rtt.record(sample_ms as f64);
        }
        if let Ok(mut pending) = self.pending_ping.lock() {
            *pending = None;
        }
        Duration::from_millis(sample_ms as u64)
    }

    /// True when a ping has been in flight for longer than `ping_max`.
    pub fn ping_overdue(&self, now: Instant) -> bool {
        self.pending_ping
            .lock()
            .ok()
            .and_then(|pending| {
                (*pending).map(|sent_at| now.saturating_duration_since(sent_at) > self.ping_max)
            })
            .unwrap_or(false)
    }

    /// Tears the link down. Only the first call emits
    /// [`LinkEvent::Disconnected`].
    pub fn destroy(self: &Arc<Self>, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        tracing::debug!(link = %self.remote_addr, "link destroyed: {}", reason);
        let _ = self.events.send(LinkEvent::Disconnected {
            link: self.clone(),
            reason: reason.to_string(),
        });
    }

    /// Resolves once the link has been destroyed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            addr: self.remote_addr.clone(),
            average_rtt_ms: self.average_rtt_ms(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            started_at: self.started_at,
        }
    }
}

async fn write_loop<W>(link: Arc<Link>, mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(bytes) = next else { break };
                let len = bytes.len();
                let result = writer.write_all(&bytes).await;
                link.outstanding.fetch_sub(len, Ordering::Relaxed);
                match result {
                    Ok(()) => {
                        link.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
                        link.touch();
                    }
                    Err(e) => {
                        link.destroy(&LinkError::Io(e).to_string());
                        break;
                    }
                }
            }
            _ = link.closed() => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(link: Arc<Link>, mut reader: R, buffer_size: usize)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut acc = BytesMut::with_capacity(buffer_size);

    let error = loop {
        acc.reserve(buffer_size);
        tokio::select! {
            result = reader.read_buf(&mut acc) => match result {
                Ok(0) => break LinkError::Eof,
                Ok(n) => {
                    link.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    link.touch();
                    if let Err(e) = dispatch_frames(&link, &mut codec, &mut acc) {
                        break e;
                    }
                }
                Err(e) => break LinkError::Io(e),
            },
            _ = link.closed() => break LinkError::Shutdown,
        }
    };

    if codec.skipped_bytes() > 0 {
        tracing::warn!(
            link = %link.remote_addr,
            "skipped {} bytes of unframed data",
            codec.skipped_bytes()
        );
    }
    link.destroy(&error.to_string());
}

fn dispatch_frames(
    link: &Arc<Link>,
    codec: &mut FrameCodec,
    acc: &mut BytesMut,
) -> Result<(), LinkError> {
    while let Some(frame) = codec.decode(acc)? {
        let event = LinkEvent::Frame {
            link: link.clone(),
            frame,
        };
        if link.events.send(event).is_err() {
            return Err(LinkError::Shutdown);
        }
    }
    Ok(())
}

/// The set of live links, shared between the dispatcher, the prober and the
/// monitoring endpoint.
#[derive(Debug, Default)]
pub struct LinkSet {
    links: RwLock<Vec<Arc<Link>>>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, link: Arc<Link>) {
        let mut links = self.links.write().await;
        if !links.iter().any(|l| l.id() == link.id()) {
            links.push(link);
        }
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<Link>> {
        let mut links = self.links.write().await;
        let pos = links.iter().position(|l| l.id() == id)?;
        Some(links.swap_remove(pos))
    }

    pub async fn snapshot(&self) -> Vec<Arc<Link>> {
        self.links.read().await.clone()
    }

    pub async fn by_role(&self, role: LinkRole) -> Vec<Arc<Link>> {
        self.links
            .read()
            .await
            .iter()
            .filter(|l| l.role() == role)
            .cloned()
            .collect()
    }

    /// Picks one live link uniformly at random.
    pub async fn random(&self) -> Option<Arc<Link>> {
        let links = self.links.read().await;
        let live: Vec<&Arc<Link>> = links.iter().filter(|l| !l.is_closed()).collect();
        if live.is_empty() {
            return None;
        }
        let pick = rand::rng().random_range(0..live.len());
        Some(live[pick].clone())
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    /// Destroys and forgets every link.
    pub async fn clear(&self, reason: &str) {
        let links: Vec<Arc<Link>> = self.links.write().await.drain(..).collect();
        for link in links {
            link.destroy(reason);
        }
    }
}
