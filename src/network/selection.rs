//! Per-packet choice of the link to send on.

use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;

use super::link::Link;

/// Penalty applied to links whose average RTT exceeds the configured maximum.
pub const SLOW_LINK_PENALTY: f64 = 1e9;

/// Upper bound (exclusive) of the random tie-breaker.
pub const MAX_JITTER: f64 = 0.1;

/// What selection needs to know about a link.
pub trait Candidate {
    fn outstanding_write_bytes(&self) -> usize;
    fn average_rtt_ms(&self) -> f64;
    fn is_usable(&self) -> bool;
}

impl Candidate for Link {
    fn outstanding_write_bytes(&self) -> usize {
        Link::outstanding_write_bytes(self)
    }

    fn average_rtt_ms(&self) -> f64 {
        Link::average_rtt_ms(self)
    }

    fn is_usable(&self) -> bool {
        !self.is_closed()
    }
}

/// Lower is better. Sub-millisecond RTTs count as 1 ms.
pub fn score(outstanding: usize, average_rtt_ms: f64, max_rtt: Duration, jitter: f64) -> f64 {
    let penalty = if average_rtt_ms > max_rtt.as_secs_f64() * 1000.0 {
        SLOW_LINK_PENALTY
    } else {
        average_rtt_ms.max(1.0)
    };
    (outstanding as f64 + 1.0 + jitter) * penalty
}

/// Returns the usable candidate with the lowest score.
pub fn select<C: Candidate>(candidates: &[Arc<C>], max_rtt: Duration) -> Option<&Arc<C>> {
    let mut rng = rand::rng();
    candidates
        .iter()
        .filter(|c| c.is_usable())
        .map(|c| {
            let jitter = rng.random::<f64>() * MAX_JITTER;
            (
                score(c.outstanding_write_bytes(), c.average_rtt_ms(), max_rtt, jitter),
                c,
            )
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c)
}
