use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::connection::{format_id, ConnectionConfig};
use super::forwarder::{ConnHandle, Origin};
use crate::network::stopped;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: usize,
    pub timed_out: usize,
}

/// All logical connections of a node, keyed by connection id.
pub struct Pool {
    conns: RwLock<HashMap<u32, Arc<ConnHandle>>>,
    config: ConnectionConfig,
    idle_timeout: Duration,
}

impl Pool {
    pub fn new(config: ConnectionConfig, idle_timeout: Duration) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            config,
            idle_timeout,
        }
    }

    /// Returns the connection for `id`, starting it from `origin` if it does
    /// not exist yet. An unused origin is dropped.
    pub async fn open(&self, id: u32, origin: Origin) -> Arc<ConnHandle> {
        let mut conns = self.conns.write().await;
        if let Some(existing) = conns.get(&id) {
            return existing.clone();
        }

        let handle = ConnHandle::spawn(id, origin, self.config.clone());
        conns.insert(id, handle.clone());
        tracing::debug!(conn = %format_id(id), "open ({} total)", conns.len());
        handle
    }

    pub async fn has(&self, id: u32) -> bool {
        self.conns.read().await.contains_key(&id)
    }

    pub async fn get(&self, id: u32) -> Option<Arc<ConnHandle>> {
        self.conns.read().await.get(&id).cloned()
    }

    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ConnHandle>),
    {
        for handle in self.conns.read().await.values() {
            f(handle);
        }
    }

    pub async fn handles(&self) -> Vec<Arc<ConnHandle>> {
        self.conns.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }

    /// Destroys and removes finished and idle connections.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut conns = self.conns.write().await;
        conns.retain(|id, handle| {
            let reason = if handle.is_destroyed() {
                report.closed += 1;
                "close"
            } else if handle.is_idle(now, self.idle_timeout) {
                report.timed_out += 1;
                "timeout"
            } else {
                return true;
            };
            handle.destroy();
            tracing::debug!(conn = %format_id(*id), "removed ({})", reason);
            false
        });
        if report.closed + report.timed_out > 0 {
            tracing::debug!(
                "sweep removed {} closed, {} idle; {} remaining",
                report.closed,
                report.timed_out,
                conns.len()
            );
        }
        report
    }

    pub fn start_sweep_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.sweep(Instant::now()).await;
                    }
                    _ = stopped(&mut shutdown) => break,
                }
            }
        })
    }

    /// Destroys every connection.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<ConnHandle>> = self.conns.write().await.drain().map(|(_, h)| h).collect();
        for handle in &conns {
            handle.destroy();
        }
        if !conns.is_empty() {
            tracing::info!("destroyed {} connections", conns.len());
        }
    }
}
