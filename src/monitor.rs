//! Link statistics exposed over the monitoring endpoint.

use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub addr: String,
    pub average_rtt_ms: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub version: String,
    pub ping_max_ms: u64,
    /// Links accepted by this node.
    pub server: Vec<LinkSnapshot>,
    /// Links dialed by this node.
    pub client: Vec<LinkSnapshot>,
    pub connections: usize,
}

impl StatusReport {
    /// Renders the report in the Prometheus text exposition format.
    pub fn render_metrics(&self) -> Result<String, prometheus::Error> {
        let registry = Registry::new();
        for (kind, links) in [("client", &self.client), ("server", &self.server)] {
            let ping = gauge(
                &registry,
                &format!("smptt_{}_ping_milliseconds", kind),
                "Average link round trip time",
            )?;
            let sent = gauge(
                &registry,
                &format!("smptt_{}_sent_bytes", kind),
                "Bytes written to the link",
            )?;
            let recv = gauge(
                &registry,
                &format!("smptt_{}_recv_bytes", kind),
                "Bytes read from the link",
            )?;

            for link in links {
                let labels = [link.addr.as_str()];
                ping.with_label_values(&labels).set(link.average_rtt_ms);
                sent.with_label_values(&labels).set(link.bytes_sent as f64);
                recv.with_label_values(&labels).set(link.bytes_received as f64);
            }
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec, prometheus::Error> {
    let gauge = GaugeVec::new(Opts::new(name, help), &["addr"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(addr: &str, rtt: f64, sent: u64, recv: u64) -> LinkSnapshot {
        LinkSnapshot {
            addr: addr.to_string(),
            average_rtt_ms: rtt,
            bytes_sent: sent,
            bytes_received: recv,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_metrics_text() {
        let report = StatusReport {
            version: "0.0.0".into(),
            ping_max_ms: 30000,
            server: vec![link("10.0.0.9:5000", 3.5, 7, 8)],
            client: vec![link("10.0.0.1:8443", 12.0, 100, 200)],
            connections: 0,
        };
        let text = report.render_metrics().unwrap();

        assert!(text.contains(r#"smptt_client_ping_milliseconds{addr="10.0.0.1:8443"} 12"#));
        assert!(text.contains(r#"smptt_client_sent_bytes{addr="10.0.0.1:8443"} 100"#));
        assert!(text.contains(r#"smptt_client_recv_bytes{addr="10.0.0.1:8443"} 200"#));
        assert!(text.contains(r#"smptt_server_ping_milliseconds{addr="10.0.0.9:5000"} 3.5"#));
    }

    #[test]
    fn test_status_json_roundtrip() {
        let report = StatusReport {
            version: "1.2.3".into(),
            ping_max_ms: 1000,
            server: vec![],
            client: vec![link("a:1", 1.0, 2, 3)],
            connections: 4,
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: StatusReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
