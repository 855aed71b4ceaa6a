use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::connection::{format_id, ConnectionConfig};
use super::forwarder::Origin;
use super::frame::{EventType, Frame};
use super::pool::Pool;
use super::reverse::{Registration, ReverseRegistry};
use super::TunnelError;
use crate::config::{Config, TunnelConfig};
use crate::monitor::{LinkSnapshot, StatusReport};
use crate::network::link::LinkError;
use crate::network::tls::{self, TlsFiles};
use crate::network::{
    Acceptor, Backoff, Dialer, ForwardSpec, Link, LinkEvent, LinkRole, LinkSet, LinkSettings,
    ListenAddr, PeerAddr, TcpConnector, TlsConnector, stopped,
};

const STOP_GRACE: Duration = Duration::from_secs(1);

/// One tunnel endpoint: dials peers, accepts links, forwards local ports and
/// routes every frame to the logical connection it belongs to.
#[derive(Clone)]
pub struct TunnelNode {
    config: Arc<Config>,
    pool: Arc<Pool>,
    links: Arc<LinkSet>,
    reverse: Arc<ReverseRegistry>,
    link_settings: LinkSettings,
    tls_server: Option<Arc<rustls::ServerConfig>>,
    tls_client: Option<Arc<rustls::ClientConfig>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    server_addrs: Arc<RwLock<Vec<SocketAddr>>>,
    forward_addrs: Arc<RwLock<Vec<SocketAddr>>>,
}

impl TunnelNode {
    pub fn new(config: Config) -> Result<Self, TunnelError> {
        let tunnel = &config.tunnel;
        let pool = Arc::new(Pool::new(
            ConnectionConfig::from(tunnel),
            tunnel.idle_timeout(),
        ));
        let (shutdown, _) = watch::channel(false);
        let reverse = Arc::new(ReverseRegistry::new(pool.clone(), shutdown.subscribe()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let files = config.tls.as_ref().map(|t| TlsFiles {
            ca_cert: t.ca_cert_path.clone(),
            cert: t.cert_path.clone(),
            key: t.key_path.clone(),
        });
        let tls_server = match &files {
            Some(files) if !config.listen.is_empty() => Some(tls::server_config(files)?),
            _ => None,
        };
        let tls_client = match &files {
            Some(files) if !config.peer.is_empty() => Some(tls::client_config(files)?),
            _ => None,
        };

        Ok(Self {
            link_settings: link_settings(tunnel),
            config: Arc::new(config),
            pool,
            links: Arc::new(LinkSet::new()),
            reverse,
            tls_server,
            tls_client,
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(Mutex::new(Vec::new())),
            server_addrs: Arc::new(RwLock::new(Vec::new())),
            forward_addrs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Binds every listener, starts the dialers and background tasks.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let events_rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(TunnelError::AlreadyStarted)?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().dispatch_loop(events_rx)));

        for spec in &self.config.listen {
            let addr = spec.parse::<ListenAddr>()?.bind_addr();
            let listener = bind(&addr).await?;
            let local = listener.local_addr()?;
            tracing::info!("[server] listening on {}", local);
            self.server_addrs.write().await.push(local);

            let acceptor = Acceptor::new(
                listener,
                self.tls_server.clone(),
                self.config.tunnel.connect_timeout(),
                self.link_settings.clone(),
                self.events_tx.clone(),
            );
            tasks.push(tokio::spawn(acceptor.run(self.shutdown.subscribe())));
        }

        for spec in &self.config.forward {
            let spec: ForwardSpec = spec.parse()?;
            let listener = bind(&spec.bind.bind_addr()).await?;
            let local = listener.local_addr()?;
            tracing::info!("forwarding {} to {}", local, spec.target());
            self.forward_addrs.write().await.push(local);
            tasks.push(tokio::spawn(self.clone().forward_loop(
                listener,
                spec.target(),
                self.shutdown.subscribe(),
            )));
        }

        for spec in &self.config.peer {
            let peer: PeerAddr = spec.parse()?;
            tasks.push(self.spawn_dialer(&peer)?);
        }

        tasks.push(tokio::spawn(self.clone().probe_loop(self.shutdown.subscribe())));
        tasks.push(
            self.pool
                .start_sweep_task(self.config.tunnel.sweep_interval(), self.shutdown.subscribe()),
        );

        self.tasks.lock().await.extend(tasks);
        Ok(())
    }

    fn spawn_dialer(&self, peer: &PeerAddr) -> Result<JoinHandle<()>, TunnelError> {
        let tunnel = &self.config.tunnel;
        let backoff = Backoff::new(tunnel.retry_floor(), tunnel.retry_cap());
        let shutdown = self.shutdown.subscribe();

        let handle = match &self.tls_client {
            Some(client) => {
                let connector = TlsConnector::new(
                    peer.socket_addr(),
                    tls::server_name(&peer.server_name)?,
                    client.clone(),
                );
                let dialer = Dialer::new(
                    connector,
                    backoff,
                    tunnel.connect_timeout(),
                    self.link_settings.clone(),
                    self.events_tx.clone(),
                );
                tokio::spawn(dialer.run(shutdown))
            }
            None => {
                let dialer = Dialer::new(
                    TcpConnector::new(peer.socket_addr()),
                    backoff,
                    tunnel.connect_timeout(),
                    self.link_settings.clone(),
                    self.events_tx.clone(),
                );
                tokio::spawn(dialer.run(shutdown))
            }
        };
        Ok(handle)
    }

    /// Stops every task and destroys all links and connections.
    pub async fn stop(&self) {
        tracing::info!("Stopping tunnel node");
        self.shutdown.send_replace(true);
        self.reverse.close_all().await;
        self.links.clear("shutdown").await;
        self.pool.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn links(&self) -> &Arc<LinkSet> {
        &self.links
    }

    pub fn reverse(&self) -> &Arc<ReverseRegistry> {
        &self.reverse
    }

    /// Bound link listener addresses, in `listen` order.
    pub async fn server_addrs(&self) -> Vec<SocketAddr> {
        self.server_addrs.read().await.clone()
    }

    /// Bound forward listener addresses, in `forward` order.
    pub async fn forward_addrs(&self) -> Vec<SocketAddr> {
        self.forward_addrs.read().await.clone()
    }

    pub async fn status_report(&self) -> StatusReport {
        let snapshot = |links: Vec<Arc<Link>>| -> Vec<LinkSnapshot> {
            links.iter().map(|l| l.snapshot()).collect()
        };
        StatusReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ping_max_ms: self.config.tunnel.ping_max().as_millis() as u64,
            server: snapshot(self.links.by_role(LinkRole::Server).await),
            client: snapshot(self.links.by_role(LinkRole::Client).await),
            connections: self.pool.len().await,
        }
    }

    async fn dispatch_loop(self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = stopped(&mut shutdown) => break,
            }
        }
    }

    async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Up(link) => self.link_up(link).await,
            LinkEvent::Frame { link, frame } => self.handle_frame(link, frame).await,
            LinkEvent::Disconnected { link, reason } => {
                self.links.remove(link.id()).await;
                for handle in self.pool.handles().await {
                    handle.remove_link(link.id());
                }
                tracing::info!(
                    "[{}] link {} closed: {}",
                    link.role().as_str(),
                    link.remote_addr(),
                    reason
                );
            }
        }
    }

    async fn link_up(&self, link: Arc<Link>) {
        if link.is_closed() {
            return;
        }
        self.links.insert(link.clone()).await;
        // Forwards and reverse requests only travel upstream, over dialed links.
        if link.role() != LinkRole::Client {
            return;
        }

        let mut announced = 0;
        for handle in self.pool.handles().await {
            if handle.is_destroyed() {
                continue;
            }
            if let Some(target) = handle.announce() {
                link.send(&Frame::open(handle.id(), target));
                handle.add_link(link.clone());
                announced += 1;
            }
        }
        for spec in &self.config.reverse {
            link.send(&Frame::listen(spec));
        }
        tracing::debug!(
            link = %link.remote_addr(),
            "link up, {} connections announced, {} reverse requests sent",
            announced,
            self.config.reverse.len()
        );
    }

    async fn handle_frame(&self, link: Arc<Link>, frame: Frame) {
        let id = frame.conn_id();
        match frame.event() {
            EventType::Ping => {
                link.send(&Frame::pong(frame.index()));
            }
            EventType::Pong => {
                let rtt = link.record_pong(frame.index());
                tracing::trace!(link = %link.remote_addr(), "rtt {:?}", rtt);
            }
            EventType::Open => match frame.body_str() {
                Ok(target) => {
                    let handle = self.pool.open(id, Origin::Dial(target.to_string())).await;
                    handle.add_link(link);
                }
                Err(e) => tracing::warn!(link = %link.remote_addr(), "bad open: {}", e),
            },
            EventType::Listen => match frame.body_str() {
                Ok(spec) => match self.reverse.register(link.clone(), spec).await {
                    Ok(Registration::Bound(addr)) => {
                        tracing::debug!(link = %link.remote_addr(), "reverse bound {}", addr);
                    }
                    Ok(registration) => {
                        tracing::trace!(link = %link.remote_addr(), "reverse {:?}", registration);
                    }
                    Err(e) => {
                        tracing::warn!(link = %link.remote_addr(), "listen {} failed: {}", spec, e);
                    }
                },
                Err(e) => tracing::warn!(link = %link.remote_addr(), "bad listen: {}", e),
            },
            EventType::Data | EventType::Req | EventType::Ack => {
                let Some(handle) = self.pool.get(id).await else {
                    tracing::trace!(
                        conn = %format_id(id),
                        "{} for unknown connection",
                        frame.event().name()
                    );
                    return;
                };
                match frame.event() {
                    EventType::Data => handle.deliver(frame.index(), frame.into_body()),
                    EventType::Req => handle.rescue(frame.index()),
                    _ => handle.acknowledge(frame.index()),
                }
            }
        }
    }

    async fn forward_loop(
        self,
        listener: TcpListener,
        target: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.open_forward(stream, peer, &target).await,
                    Err(e) => tracing::error!("forward accept error: {}", e),
                },
                _ = stopped(&mut shutdown) => break,
            }
        }
    }

    async fn open_forward(&self, stream: TcpStream, peer: SocketAddr, target: &str) {
        let _ = stream.set_nodelay(true);
        let id = rand::random::<u32>();
        let handle = self
            .pool
            .open(
                id,
                Origin::Accepted {
                    stream: Box::new(stream),
                    announce: Some(target.to_string()),
                },
            )
            .await;

        let open = Frame::open(id, target);
        let links = self.links.by_role(LinkRole::Client).await;
        for link in &links {
            link.send(&open);
            handle.add_link(link.clone());
        }
        tracing::debug!(
            conn = %format_id(id),
            "accepted {} for {} over {} client links",
            peer,
            target,
            links.len()
        );
    }

    async fn probe_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tunnel.ping_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(link) = self.links.random().await {
                        link.ping();
                    }
                    self.expire_pings(Instant::now()).await;
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
    }

    /// Destroys dialed links whose ping has gone unanswered past `ping_max`
    /// and returns how many were dropped. Accepted links are left to the
    /// peer's own prober.
    pub async fn expire_pings(&self, now: Instant) -> usize {
        let ping_max = self.config.tunnel.ping_max();
        let mut expired = 0;
        for link in self.links.by_role(LinkRole::Client).await {
            if !link.is_closed() && link.ping_overdue(now) {
                tracing::warn!("[client] ping timeout on {}", link.remote_addr());
                link.destroy(&LinkError::PingTimeout(ping_max).to_string());
                expired += 1;
            }
        }
        expired
    }
}

fn link_settings(tunnel: &TunnelConfig) -> LinkSettings {
    LinkSettings {
        ping_max: tunnel.ping_max(),
        read_buffer_size: tunnel.read_buffer_size,
    }
}

async fn bind(addr: &str) -> Result<TcpListener, TunnelError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| TunnelError::Bind {
            addr: addr.to_string(),
            source,
        })
}
