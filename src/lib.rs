//! smptt - multi-path bonded TCP tunnel
//!
//! Bonds several plain or TLS TCP links between two endpoints into one
//! tunnel. Forwarded TCP connections are split into sequenced packets,
//! striped over the healthiest links, reordered on arrival, retransmitted on
//! request and flow-controlled with cumulative acknowledgements.

pub mod config;
pub mod monitor;
pub mod network;
pub mod tunnel;

pub use config::{load_config, parse_config, Config};
pub use monitor::{LinkSnapshot, StatusReport};
pub use tunnel::{TunnelError, TunnelNode};
