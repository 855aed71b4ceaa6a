//! Listeners opened on behalf of the far side (`listen` frames).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::forwarder::Origin;
use super::frame::Frame;
use super::pool::Pool;
use super::TunnelError;
use crate::network::{stopped, ForwardSpec, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new listener was bound.
    Bound(SocketAddr),
    /// The link joined the subscribers of an existing listener.
    Subscribed,
    /// The target changed; the link is now the only subscriber.
    Replaced,
}

#[derive(Debug)]
struct Subscription {
    target: String,
    subscribers: Vec<Arc<Link>>,
}

impl Subscription {
    fn live(&mut self) -> Vec<Arc<Link>> {
        self.subscribers.retain(|l| !l.is_closed());
        self.subscribers.clone()
    }
}

struct ReverseListener {
    local_addr: SocketAddr,
    subscription: Arc<Mutex<Subscription>>,
    task: JoinHandle<()>,
}

pub struct ReverseRegistry {
    listeners: Mutex<HashMap<u16, ReverseListener>>,
    pool: Arc<Pool>,
    shutdown: watch::Receiver<bool>,
}

impl ReverseRegistry {
    pub fn new(pool: Arc<Pool>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            pool,
            shutdown,
        }
    }

    /// Handles one `listen` request received on `link`.
    pub async fn register(&self, link: Arc<Link>, spec: &str) -> Result<Registration, TunnelError> {
        let spec: ForwardSpec = spec.parse()?;
        let target = spec.target();
        let mut listeners = self.listeners.lock().await;

        if let Some(existing) = listeners.get(&spec.bind.port) {
            let mut subscription = existing.subscription.lock().await;
            subscription.subscribers.retain(|l| !l.is_closed());
            if subscription.target == target {
                if !subscription.subscribers.iter().any(|l| l.id() == link.id()) {
                    subscription.subscribers.push(link);
                }
                return Ok(Registration::Subscribed);
            }
            tracing::info!(
                "reverse {} now forwards to {} (was {})",
                existing.local_addr,
                target,
                subscription.target
            );
            subscription.target = target;
            subscription.subscribers = vec![link];
            return Ok(Registration::Replaced);
        }

        let bind_addr = spec.bind.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("reverse listening on {} for {}", local_addr, target);

        let subscription = Arc::new(Mutex::new(Subscription {
            target,
            subscribers: vec![link],
        }));
        let task = tokio::spawn(accept_loop(
            listener,
            subscription.clone(),
            self.pool.clone(),
            self.shutdown.clone(),
        ));
        listeners.insert(
            spec.bind.port,
            ReverseListener {
                local_addr,
                subscription,
                task,
            },
        );
        Ok(Registration::Bound(local_addr))
    }

    pub async fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners.lock().await.get(&port).map(|l| l.local_addr)
    }

    /// Live subscribers of the listener registered for `port`.
    pub async fn subscribers(&self, port: u16) -> Vec<Arc<Link>> {
        match self.listeners.lock().await.get(&port) {
            Some(listener) => listener.subscription.lock().await.live(),
            None => Vec::new(),
        }
    }

    pub async fn close_all(&self) {
        for (_, listener) in self.listeners.lock().await.drain() {
            listener.task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    subscription: Arc<Mutex<Subscription>>,
    pool: Arc<Pool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    forward_accepted(stream, peer, &subscription, &pool).await;
                }
                Err(e) => tracing::error!("reverse accept error: {}", e),
            },
            _ = stopped(&mut shutdown) => break,
        }
    }
}

async fn forward_accepted(
    stream: TcpStream,
    peer: SocketAddr,
    subscription: &Mutex<Subscription>,
    pool: &Pool,
) {
    let (target, links) = {
        let mut subscription = subscription.lock().await;
        let links = subscription.live();
        (subscription.target.clone(), links)
    };
    if links.is_empty() {
        tracing::debug!("no live link for {}, closing {}", target, peer);
        return;
    }

    let _ = stream.set_nodelay(true);
    let id = rand::random::<u32>();
    let handle = pool
        .open(
            id,
            Origin::Accepted {
                stream: Box::new(stream),
                announce: None,
            },
        )
        .await;
    let open = Frame::open(id, &target);
    for link in links {
        link.send(&open);
        handle.add_link(link);
    }
}
