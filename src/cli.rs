use clap::{Parser, Subcommand};
use std::path::PathBuf;

use smptt::config::{Config, TlsConfig};

#[derive(Parser)]
#[command(name = "smptt")]
#[command(author, version, about = "Multi-path bonded TCP tunnel", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level or filter directives (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, plain)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a tunnel endpoint
    Run(RunArgs),

    /// Print link status from a running endpoint
    Status(StatusArgs),

    /// Show version information
    Version,
}

#[derive(clap::Args, Default)]
pub struct RunArgs {
    /// Peer to dial, [servername:]host:port (repeatable)
    #[arg(short = 'p', long = "peer")]
    pub peer: Vec<String>,

    /// Local forward, [localHost:]localPort:host:port (repeatable)
    #[arg(short = 'f', long = "forward")]
    pub forward: Vec<String>,

    /// Listener to open on the far side, [remoteHost:]remotePort:host:port (repeatable)
    #[arg(short = 'r', long = "reverse")]
    pub reverse: Vec<String>,

    /// Accept links on [host:]port (repeatable)
    #[arg(short = 'l', long = "listen")]
    pub listen: Vec<String>,

    /// Serve /status.json and /metrics on [host:]port
    #[arg(long = "api")]
    pub api: Option<String>,

    /// CA certificate used to verify the other side
    #[arg(long, requires_all = ["cert", "key"])]
    pub ca: Option<PathBuf>,

    /// Certificate presented to the other side
    #[arg(long, requires_all = ["ca", "key"])]
    pub cert: Option<PathBuf>,

    /// Private key of the certificate (mode 0600)
    #[arg(long, requires_all = ["ca", "cert"])]
    pub key: Option<PathBuf>,

    /// Override ping_max_secs
    #[arg(long)]
    pub ping_max: Option<u64>,

    /// Override idle_timeout_secs
    #[arg(long)]
    pub idle_timeout: Option<u64>,
}

impl RunArgs {
    /// Appends address lists and replaces scalar settings in `config`.
    pub fn apply(&self, config: &mut Config) {
        config.peer.extend(self.peer.iter().cloned());
        config.forward.extend(self.forward.iter().cloned());
        config.reverse.extend(self.reverse.iter().cloned());
        config.listen.extend(self.listen.iter().cloned());

        if let Some(api) = &self.api {
            config.api_address = Some(api.clone());
        }
        if let (Some(ca), Some(cert), Some(key)) = (&self.ca, &self.cert, &self.key) {
            config.tls = Some(TlsConfig {
                ca_cert_path: ca.clone(),
                cert_path: cert.clone(),
                key_path: key.clone(),
            });
        }
        if let Some(secs) = self.ping_max {
            config.tunnel.ping_max_secs = secs;
        }
        if let Some(secs) = self.idle_timeout {
            config.tunnel.idle_timeout_secs = secs;
        }
    }
}

#[derive(clap::Args)]
pub struct StatusArgs {
    /// Status endpoint (HTTP)
    #[arg(long, default_value = "http://localhost:9000/status.json")]
    pub endpoint: String,

    /// Timeout in seconds
    #[arg(long, default_value = "5")]
    pub timeout: u64,

    /// Print the raw JSON report
    #[arg(long)]
    pub json: bool,
}
