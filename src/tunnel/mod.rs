pub mod connection;
pub mod forwarder;
pub mod frame;
pub mod node;
pub mod pool;
pub mod reverse;
pub mod timer;

use thiserror::Error;

use crate::network::{AddrError, TlsError};

pub use connection::{
    format_id, Connection, ConnectionConfig, ConnectionStats, Delivery, Eviction, Packet, Rescue,
};
pub use forwarder::{ConnCommand, ConnHandle, Origin};
pub use frame::{EventType, Frame, FrameCodec, FrameError, FRAME_HEADER_SIZE, MAGIC, MAX_BODY_SIZE};
pub use node::TunnelNode;
pub use pool::{Pool, SweepReport};
pub use reverse::{Registration, ReverseRegistry};
pub use timer::{Debounce, Throttle};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Address error: {0}")]
    Addr(#[from] AddrError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Tunnel already started")]
    AlreadyStarted,
}
