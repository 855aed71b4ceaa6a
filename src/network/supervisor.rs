use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

use super::link::{Link, LinkEvent, LinkRole, LinkSettings};
use super::{stopped, AsyncStream};

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Doubles the delay (capped) and returns the new value.
    pub fn fail(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.cap);
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerEvent {
    Start,
    Connected,
    Failed,
    TimedOut,
    Closed,
    RetryElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerAction {
    Dial,
    Wait(Duration),
    /// Connected; nothing to do until the link closes.
    Hold,
    Ignore,
}

/// Reconnect policy of one dialer as an explicit transition function.
#[derive(Debug)]
pub struct DialerMachine {
    state: DialerState,
    backoff: Backoff,
}

impl DialerMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: DialerState::Disconnected,
            backoff,
        }
    }

    pub fn state(&self) -> DialerState {
        self.state
    }

    pub fn handle(&mut self, event: DialerEvent) -> DialerAction {
        use DialerEvent as E;
        use DialerState as S;

        let (next, action) = match (self.state, event) {
            (S::Disconnected, E::Start | E::RetryElapsed) => (S::Connecting, DialerAction::Dial),
            (S::Connecting, E::Connected) => {
                self.backoff.reset();
                (S::Connected, DialerAction::Hold)
            }
            (S::Connecting, E::Failed | E::TimedOut) => {
                (S::Disconnected, DialerAction::Wait(self.backoff.fail()))
            }
            (S::Connected, E::Closed) => {
                (S::Disconnected, DialerAction::Wait(self.backoff.current()))
            }
            (state, _) => (state, DialerAction::Ignore),
        };

        if action == DialerAction::Ignore {
            tracing::trace!("dialer ignored {:?} in {:?}", event, self.state);
        }
        self.state = next;
        action
    }
}

/// Opens the byte stream a dialed link runs over.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncStream + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Label used for logs and monitoring.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

#[derive(Clone)]
pub struct TlsConnector {
    addr: String,
    server_name: rustls::pki_types::ServerName<'static>,
    connector: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(
        addr: impl Into<String>,
        server_name: rustls::pki_types::ServerName<'static>,
        config: Arc<rustls::ClientConfig>,
    ) -> Self {
        Self {
            addr: addr.into(),
            server_name,
            connector: tokio_rustls::TlsConnector::from(config),
        }
    }
}

impl Connector for TlsConnector {
    type Stream = ClientTlsStream<TcpStream>;

    async fn connect(&self) -> io::Result<Self::Stream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// Keeps one link to a peer alive, reconnecting with backoff until shutdown.
pub struct Dialer<C: Connector> {
    connector: C,
    machine: DialerMachine,
    connect_timeout: Duration,
    settings: LinkSettings,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl<C: Connector> Dialer<C> {
    pub fn new(
        connector: C,
        backoff: Backoff,
        connect_timeout: Duration,
        settings: LinkSettings,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            connector,
            machine: DialerMachine::new(backoff),
            connect_timeout,
            settings,
            events,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let addr = self.connector.describe();
        let mut action = self.machine.handle(DialerEvent::Start);

        loop {
            let event = match action {
                DialerAction::Dial => {
                    tracing::debug!("[client] connecting to {}", addr);
                    let attempt = timeout(self.connect_timeout, self.connector.connect());
                    let result = tokio::select! {
                        result = attempt => result,
                        _ = stopped(&mut shutdown) => return,
                    };
                    match result {
                        Ok(Ok(stream)) => {
                            let link = Link::spawn(
                                stream,
                                addr.clone(),
                                LinkRole::Client,
                                &self.settings,
                                self.events.clone(),
                            );
                            tracing::info!("[client] connected to {}", addr);
                            self.machine.handle(DialerEvent::Connected);

                            tokio::select! {
                                _ = link.closed() => {}
                                _ = stopped(&mut shutdown) => {
                                    link.destroy("shutdown");
                                    return;
                                }
                            }
                            tracing::info!("[client] disconnected from {}", addr);
                            DialerEvent::Closed
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("[client] failed to connect to {}: {}", addr, e);
                            DialerEvent::Failed
                        }
                        Err(_) => {
                            tracing::warn!(
                                "[client] connecting to {} timed out after {:?}",
                                addr,
                                self.connect_timeout
                            );
                            DialerEvent::TimedOut
                        }
                    }
                }
                DialerAction::Wait(delay) => {
                    tracing::debug!("[client] retrying {} in {:?}", addr, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => DialerEvent::RetryElapsed,
                        _ = stopped(&mut shutdown) => return,
                    }
                }
                DialerAction::Hold | DialerAction::Ignore => return,
            };
            action = self.machine.handle(event);
        }
    }
}

/// Accepts link connections on one listener, with an optional TLS handshake
/// per socket.
pub struct Acceptor {
    listener: TcpListener,
    tls: Option<tokio_rustls::TlsAcceptor>,
    handshake_timeout: Duration,
    settings: LinkSettings,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        tls: Option<Arc<rustls::ServerConfig>>,
        handshake_timeout: Duration,
        settings: LinkSettings,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            listener,
            tls: tls.map(tokio_rustls::TlsAcceptor::from),
            handshake_timeout,
            settings,
            events,
        }
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let addr = peer.to_string();
                        let settings = self.settings.clone();
                        let events = self.events.clone();
                        match &self.tls {
                            Some(tls) => {
                                let tls = tls.clone();
                                let handshake_timeout = self.handshake_timeout;
                                tokio::spawn(async move {
                                    match timeout(handshake_timeout, tls.accept(stream)).await {
                                        Ok(Ok(stream)) => {
                                            accept_link::<ServerTlsStream<TcpStream>>(
                                                stream, addr, &settings, events,
                                            );
                                        }
                                        Ok(Err(e)) => {
                                            tracing::warn!("[server] TLS handshake with {} failed: {}", addr, e);
                                        }
                                        Err(_) => {
                                            tracing::warn!("[server] TLS handshake with {} timed out", addr);
                                        }
                                    }
                                });
                            }
                            None => accept_link(stream, addr, &settings, events),
                        }
                    }
                    Err(e) => {
                        tracing::error!("[server] accept error: {}", e);
                    }
                },
                _ = stopped(&mut shutdown) => break,
            }
        }
    }
}

fn accept_link<S: AsyncStream + 'static>(
    stream: S,
    addr: String,
    settings: &LinkSettings,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    tracing::info!("[server] connection from {}", addr);
    Link::spawn(stream, addr, LinkRole::Server, settings, events);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.fail().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_machine_transitions() {
        let mut machine = DialerMachine::new(Backoff::default());
        assert_eq!(machine.state(), DialerState::Disconnected);

        assert_eq!(machine.handle(DialerEvent::Start), DialerAction::Dial);
        assert_eq!(machine.state(), DialerState::Connecting);

        assert_eq!(
            machine.handle(DialerEvent::Failed),
            DialerAction::Wait(Duration::from_secs(2))
        );
        assert_eq!(machine.handle(DialerEvent::RetryElapsed), DialerAction::Dial);
        assert_eq!(
            machine.handle(DialerEvent::TimedOut),
            DialerAction::Wait(Duration::from_secs(4))
        );
        assert_eq!(machine.handle(DialerEvent::RetryElapsed), DialerAction::Dial);

        assert_eq!(machine.handle(DialerEvent::Connected), DialerAction::Hold);
        assert_eq!(machine.state(), DialerState::Connected);

        // Success resets the delay to the floor.
        assert_eq!(
            machine.handle(DialerEvent::Closed),
            DialerAction::Wait(Duration::from_secs(1))
        );
        assert_eq!(machine.state(), DialerState::Disconnected);
    }

    #[test]
    fn test_machine_ignores_out_of_state_events() {
        let mut machine = DialerMachine::new(Backoff::default());
        assert_eq!(machine.handle(DialerEvent::Closed), DialerAction::Ignore);
        assert_eq!(machine.handle(DialerEvent::Connected), DialerAction::Ignore);
        assert_eq!(machine.state(), DialerState::Disconnected);
    }
}
