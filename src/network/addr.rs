//! Colon-separated address specs accepted on the command line and in config.
//!
//! IPv6 literals are not supported since `:` is the field separator.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ANY_HOST: &str = "0.0.0.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("Invalid port in '{spec}': {port}")]
    InvalidPort { spec: String, port: String },

    #[error("Malformed address spec '{0}'")]
    Malformed(String),
}

fn parse_port(spec: &str, port: &str) -> Result<u16, AddrError> {
    port.parse::<u16>().map_err(|_| AddrError::InvalidPort {
        spec: spec.to_string(),
        port: port.to_string(),
    })
}

fn non_empty(part: Option<&str>) -> Option<String> {
    part.filter(|s| !s.is_empty()).map(str::to_string)
}

/// `[servername:]host:port`, the address a client dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub server_name: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = spec.split(':').collect();
        if parts.len() > 3 {
            return Err(AddrError::Malformed(spec.to_string()));
        }
        let port = parse_port(spec, parts.pop().unwrap_or_default())?;
        let host = non_empty(parts.pop()).unwrap_or_else(|| "localhost".to_string());
        let server_name = non_empty(parts.pop()).unwrap_or_else(|| host.clone());
        Ok(Self {
            server_name,
            host,
            port,
        })
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.server_name == self.host {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}:{}", self.server_name, self.host, self.port)
        }
    }
}

/// `[host:]port`, a local bind address. The host defaults to all interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: Option<String>,
    pub port: u16,
}

impl ListenAddr {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or(ANY_HOST), self.port)
    }
}

impl FromStr for ListenAddr {
    type Err = AddrError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = spec.split(':').collect();
        if parts.len() > 2 {
            return Err(AddrError::Malformed(spec.to_string()));
        }
        let port = parse_port(spec, parts.pop().unwrap_or_default())?;
        Ok(Self {
            host: non_empty(parts.pop()),
            port,
        })
    }
}

/// `[bindHost:]bindPort:host:port`.
///
/// Used both for local forwards (listen here, dial `host:port` on the far
/// side) and for reverse requests (the far side listens, we dial).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub bind: ListenAddr,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardSpec {
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

impl FromStr for ForwardSpec {
    type Err = AddrError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = spec.split(':').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(AddrError::Malformed(spec.to_string()));
        }
        let target_port = parse_port(spec, parts.pop().unwrap_or_default())?;
        let target_host =
            non_empty(parts.pop()).ok_or_else(|| AddrError::Malformed(spec.to_string()))?;
        let bind_port = parse_port(spec, parts.pop().unwrap_or_default())?;
        let bind_host = non_empty(parts.pop());
        Ok(Self {
            bind: ListenAddr {
                host: bind_host,
                port: bind_port,
            },
            target_host,
            target_port,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.bind.host {
            write!(f, "{}:", host)?;
        }
        write!(
            f,
            "{}:{}:{}",
            self.bind.port, self.target_host, self.target_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_forms() {
        let full: PeerAddr = "tunnel.example:10.0.0.1:8443".parse().unwrap();
        assert_eq!(full.server_name, "tunnel.example");
        assert_eq!(full.host, "10.0.0.1");
        assert_eq!(full.port, 8443);
        assert_eq!(full.socket_addr(), "10.0.0.1:8443");

        let short: PeerAddr = "example.com:443".parse().unwrap();
        assert_eq!(short.server_name, "example.com");
        assert_eq!(short.to_string(), "example.com:443");

        let bare: PeerAddr = "9000".parse().unwrap();
        assert_eq!(bare.host, "localhost");
    }

    #[test]
    fn test_listen_addr() {
        let any: ListenAddr = "8443".parse().unwrap();
        assert_eq!(any.bind_addr(), "0.0.0.0:8443");

        let local: ListenAddr = "127.0.0.1:8443".parse().unwrap();
        assert_eq!(local.bind_addr(), "127.0.0.1:8443");

        assert!("a:b:c".parse::<ListenAddr>().is_err());
        assert!(matches!(
            "host:99999".parse::<ListenAddr>(),
            Err(AddrError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_forward_spec() {
        let spec: ForwardSpec = "2222:10.1.1.1:22".parse().unwrap();
        assert_eq!(spec.bind.host, None);
        assert_eq!(spec.bind.port, 2222);
        assert_eq!(spec.target(), "10.1.1.1:22");
        assert_eq!(spec.to_string(), "2222:10.1.1.1:22");

        let bound: ForwardSpec = "127.0.0.1:2222:db:5432".parse().unwrap();
        assert_eq!(bound.bind.bind_addr(), "127.0.0.1:2222");
        assert_eq!(bound.to_string(), "127.0.0.1:2222:db:5432");

        assert!("db:5432".parse::<ForwardSpec>().is_err());
        assert!("1:2:3:4:5".parse::<ForwardSpec>().is_err());
    }
}
