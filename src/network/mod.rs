pub mod addr;
pub mod link;
pub mod selection;
pub mod supervisor;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

pub use addr::{AddrError, ForwardSpec, ListenAddr, PeerAddr};
pub use link::{Link, LinkEvent, LinkRole, LinkSet, LinkSettings};
pub use selection::{select, Candidate};
pub use supervisor::{
    Acceptor, Backoff, Connector, Dialer, DialerAction, DialerEvent, DialerMachine, DialerState,
    TcpConnector, TlsConnector,
};
pub use tls::TlsError;

/// Any bidirectional byte stream a link or a local endpoint can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Resolves once `shutdown` reads `true` or its sender is gone.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
