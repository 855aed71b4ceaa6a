use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use tokio::time::{Duration, Instant};

use crate::config::TunnelConfig;

/// Per-connection knobs, derived from the `[tunnel]` config section.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub buffer_high: usize,
    pub buffer_low: usize,
    pub ack_interval: u32,
    pub ack_window: u32,
    pub flush_interval: Duration,
    pub request_delay: Duration,
    pub connect_timeout: Duration,
    pub max_rtt: Duration,
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&TunnelConfig::default())
    }
}

impl From<&TunnelConfig> for ConnectionConfig {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            buffer_high: config.buffer_high,
            buffer_low: config.buffer_low,
            ack_interval: config.ack_interval,
            ack_window: config.ack_window,
            flush_interval: config.flush_interval(),
            request_delay: config.request_delay(),
            connect_timeout: config.connect_timeout(),
            max_rtt: config.max_rtt(),
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// One sequenced payload. An empty body marks end of stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub index: u32,
    pub body: Bytes,
}

/// What a batch of inbound data produced for the local side.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Payloads to write to the local socket, in order.
    pub writes: Vec<Bytes>,
    /// Cumulative acknowledgements to send back.
    pub acks: Vec<u32>,
    /// The remote end of stream was reached.
    pub closed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Rescue {
    Found(Packet),
    /// Older than anything still buffered.
    Evicted { oldest: Option<u32> },
    /// Not yet produced locally.
    Unknown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub evicted: usize,
    /// Evicted packets that had never been sent.
    pub unsent: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub packets_sent: u64,
    pub packets_rescued: u64,
    pub packets_evicted: u64,
    pub duplicates: u64,
}

/// Sequencing state of one logical connection.
///
/// Pure state machine: the forwarder task feeds it local reads and remote
/// frames and performs whatever I/O the return values ask for.
#[derive(Debug)]
pub struct Connection {
    id: u32,
    config: ConnectionConfig,

    // outbound
    outbound: VecDeque<Packet>,
    sent: usize,
    last_index: u32,
    max_acked: u32,
    paused: bool,
    local_closed: bool,

    // inbound
    reorder: BTreeMap<u32, Bytes>,
    next_expected: u32,
    remote_closed: bool,

    last_active: Instant,
    stats: ConnectionStats,
}

impl Connection {
    pub fn new(id: u32, config: ConnectionConfig, now: Instant) -> Self {
        Self {
            id,
            config,
            outbound: VecDeque::new(),
            sent: 0,
            last_index: 0,
            max_acked: 0,
            paused: false,
            local_closed: false,
            reorder: BTreeMap::new(),
            next_expected: 1,
            remote_closed: false,
            last_active: now,
            stats: ConnectionStats::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > timeout
    }

    /// Queues a chunk read from the local socket and returns its index.
    pub fn push(&mut self, body: Bytes, now: Instant) -> u32 {
        self.touch(now);
        self.stats.bytes_read += body.len() as u64;
        self.append(body)
    }

    fn append(&mut self, body: Bytes) -> u32 {
        self.last_index = self.last_index.wrapping_add(1);
        let index = self.last_index;
        self.outbound.push_back(Packet { index, body });

        if !self.paused && self.ack_gap() > self.config.ack_window {
            self.paused = true;
            tracing::debug!(
                conn = %format_id(self.id),
                "pausing local reads, {} packets unacknowledged",
                self.ack_gap()
            );
        }
        index
    }

    /// Queues the end-of-stream marker. Returns `None` when the stream was
    /// already finished locally or ended by the remote side.
    pub fn finish(&mut self) -> Option<u32> {
        if self.local_closed || self.remote_closed {
            return None;
        }
        self.local_closed = true;
        Some(self.append(Bytes::new()))
    }

    pub fn next_unsent(&self) -> Option<&Packet> {
        self.outbound.get(self.sent)
    }

    pub fn has_unsent(&self) -> bool {
        self.sent < self.outbound.len()
    }

    /// Advances the send cursor past the packet returned by `next_unsent`.
    pub fn mark_sent(&mut self) {
        if self.sent < self.outbound.len() {
            self.sent += 1;
            self.stats.packets_sent += 1;
        }
    }

    /// Evicts the oldest packets down to `buffer_low` once the buffer has
    /// grown past `buffer_high`.
    pub fn trim(&mut self) -> Eviction {
        if self.outbound.len() <= self.config.buffer_high {
            return Eviction::default();
        }
        let evicted = self.outbound.len() - self.config.buffer_low;
        self.outbound.drain(..evicted);
        let unsent = evicted.saturating_sub(self.sent);
        self.sent = self.sent.saturating_sub(evicted);
        self.stats.packets_evicted += evicted as u64;
        Eviction { evicted, unsent }
    }

    pub fn rescue(&mut self, index: u32) -> Rescue {
        if index == 0 || index > self.last_index {
            return Rescue::Unknown;
        }
        match self.outbound.front().map(|p| p.index) {
            Some(oldest) if index >= oldest => {
                let offset = (index - oldest) as usize;
                match self.outbound.get(offset) {
                    Some(packet) => {
                        self.stats.packets_rescued += 1;
                        Rescue::Found(packet.clone())
                    }
                    None => Rescue::Unknown,
                }
            }
            oldest => Rescue::Evicted { oldest },
        }
    }

    /// Applies a cumulative acknowledgement. Returns true when local reads
    /// should resume.
    pub fn acknowledge(&mut self, index: u32, now: Instant) -> bool {
        self.touch(now);
        if index > self.last_index || index <= self.max_acked {
            return false;
        }
        self.max_acked = index;

        // Acknowledged packets were delivered and will never be requested.
        while self.sent > 0 {
            match self.outbound.front() {
                Some(packet) if packet.index <= index => {
                    self.outbound.pop_front();
                    self.sent -= 1;
                }
                _ => break,
            }
        }

        if self.paused && self.ack_gap() < self.config.ack_window {
            self.paused = false;
            tracing::debug!(conn = %format_id(self.id), "resuming local reads");
            return true;
        }
        false
    }

    /// Accepts one remote packet and drains everything now contiguous.
    pub fn receive(&mut self, index: u32, body: Bytes, now: Instant) -> Delivery {
        self.touch(now);
        let mut delivery = Delivery::default();
        if self.remote_closed {
            return delivery;
        }

        // Legacy immediate-close marker.
        if index == 0 {
            if body.is_empty() {
                self.remote_closed = true;
                delivery.closed = true;
            }
            return delivery;
        }

        if index < self.next_expected || self.reorder.contains_key(&index) {
            self.stats.duplicates += 1;
            return delivery;
        }
        self.reorder.insert(index, body);

        while let Some(body) = self.reorder.remove(&self.next_expected) {
            if body.is_empty() {
                self.remote_closed = true;
                self.reorder.clear();
                delivery.closed = true;
                break;
            }
            let delivered = self.next_expected;
            self.next_expected = self.next_expected.wrapping_add(1);
            self.stats.bytes_written += body.len() as u64;
            delivery.writes.push(body);
            if delivered % self.config.ack_interval == 0 {
                delivery.acks.push(delivered);
            }
        }
        delivery
    }

    fn ack_gap(&self) -> u32 {
        self.last_index.saturating_sub(self.max_acked)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_local_closed(&self) -> bool {
        self.local_closed
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed
    }

    pub fn last_index(&self) -> u32 {
        self.last_index
    }

    pub fn max_acked(&self) -> u32 {
        self.max_acked
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.outbound.len()
    }

    pub fn reorder_len(&self) -> usize {
        self.reorder.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }
}

/// Connection ids are logged as fixed-width hex.
pub fn format_id(id: u32) -> String {
    format!("{:08x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            buffer_high: 8,
            buffer_low: 4,
            ack_interval: 4,
            ack_window: 6,
            ..ConnectionConfig::default()
        }
    }

    fn conn() -> Connection {
        Connection::new(0x1234, config(), Instant::now())
    }

    fn send_all(conn: &mut Connection) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(packet) = conn.next_unsent().cloned() {
            conn.mark_sent();
            out.push(packet);
        }
        out
    }

    fn permutations(items: &[u32]) -> Vec<Vec<u32>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut all = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                all.push(tail);
            }
        }
        all
    }

    #[test]
    fn test_indices_start_at_one() {
        let mut c = conn();
        let now = Instant::now();
        assert_eq!(c.push(Bytes::from_static(b"a"), now), 1);
        assert_eq!(c.push(Bytes::from_static(b"b"), now), 2);
        assert_eq!(c.finish(), Some(3));
        assert_eq!(c.finish(), None);

        let sent = send_all(&mut c);
        assert_eq!(sent.len(), 3);
        assert!(sent[2].body.is_empty());
        assert!(!c.has_unsent());
    }

    #[test]
    fn test_out_of_order_scenario() {
        let mut c = conn();
        let now = Instant::now();

        let d = c.receive(3, Bytes::new(), now);
        assert!(d.writes.is_empty());
        assert!(!d.closed);

        let d = c.receive(1, Bytes::from_static(b"AB"), now);
        assert_eq!(d.writes, vec![Bytes::from_static(b"AB")]);
        assert!(!d.closed);

        let d = c.receive(2, Bytes::from_static(b"CD"), now);
        assert_eq!(d.writes, vec![Bytes::from_static(b"CD")]);
        assert!(d.closed);
        assert!(c.is_remote_closed());

        // No end-of-stream echo after a remote close.
        assert_eq!(c.finish(), None);
    }

    #[test]
    fn test_in_order_delivery_for_every_permutation() {
        let indices = [1u32, 2, 3, 4, 5];
        for order in permutations(&indices) {
            let mut c = conn();
            let now = Instant::now();
            let mut written = Vec::new();
            for index in &order {
                let body = Bytes::from(format!("<{}>", index));
                written.extend(c.receive(*index, body, now).writes);
            }
            let joined: Vec<u8> = written.iter().flat_map(|b| b.to_vec()).collect();
            assert_eq!(joined, b"<1><2><3><4><5>", "order {:?}", order);
            assert_eq!(c.next_expected(), 6);
            assert_eq!(c.reorder_len(), 0);
        }
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut c = conn();
        let now = Instant::now();
        assert_eq!(c.receive(1, Bytes::from_static(b"x"), now).writes.len(), 1);
        assert!(c.receive(1, Bytes::from_static(b"x"), now).writes.is_empty());

        c.receive(3, Bytes::from_static(b"z"), now);
        c.receive(3, Bytes::from_static(b"z"), now);
        let d = c.receive(2, Bytes::from_static(b"y"), now);
        assert_eq!(d.writes.len(), 2);
        assert_eq!(c.stats().duplicates, 2);
    }

    #[test]
    fn test_ack_every_nth_delivery() {
        let mut c = conn();
        let now = Instant::now();
        let mut acks = Vec::new();
        for index in [2, 3, 4, 1, 5, 6, 7, 8, 9] {
            acks.extend(c.receive(index, Bytes::from_static(b"."), now).acks);
        }
        assert_eq!(acks, vec![4, 8]);
    }

    #[test]
    fn test_legacy_zero_index_close() {
        let mut c = conn();
        let d = c.receive(0, Bytes::new(), Instant::now());
        assert!(d.closed);
        assert!(c.is_remote_closed());
    }

    #[test]
    fn test_rescue_and_eviction() {
        let mut c = conn();
        let now = Instant::now();
        for i in 0..9u8 {
            c.push(Bytes::from(vec![i]), now);
        }
        send_all(&mut c);

        assert_eq!(
            c.rescue(3),
            Rescue::Found(Packet {
                index: 3,
                body: Bytes::from(vec![2u8]),
            })
        );

        let eviction = c.trim();
        assert_eq!(eviction, Eviction { evicted: 5, unsent: 0 });
        assert_eq!(c.buffered(), 4);
        assert_eq!(c.rescue(3), Rescue::Evicted { oldest: Some(6) });
        assert!(matches!(c.rescue(6), Rescue::Found(p) if p.index == 6));
        assert_eq!(c.rescue(10), Rescue::Unknown);
        assert_eq!(c.stats().packets_evicted, 5);
    }

    #[test]
    fn test_eviction_moves_send_cursor() {
        let mut c = conn();
        let now = Instant::now();
        for i in 0..9u8 {
            c.push(Bytes::from(vec![i]), now);
        }
        c.mark_sent();
        c.mark_sent();

        let eviction = c.trim();
        assert_eq!(eviction, Eviction { evicted: 5, unsent: 3 });
        assert_eq!(c.next_unsent().map(|p| p.index), Some(6));
    }

    #[test]
    fn test_backpressure_pause_and_resume() {
        let mut c = conn();
        let now = Instant::now();
        for _ in 0..6 {
            c.push(Bytes::from_static(b"."), now);
        }
        assert!(!c.is_paused());

        c.push(Bytes::from_static(b"."), now);
        assert!(c.is_paused());
        send_all(&mut c);

        // Gap 7 - 1 = 6 is not below the window yet.
        assert!(!c.acknowledge(1, now));
        assert!(c.is_paused());

        assert!(c.acknowledge(4, now));
        assert!(!c.is_paused());
        assert_eq!(c.max_acked(), 4);
    }

    #[test]
    fn test_ack_releases_buffer() {
        let mut c = conn();
        let now = Instant::now();
        for _ in 0..5 {
            c.push(Bytes::from_static(b"."), now);
        }
        c.mark_sent();
        c.mark_sent();
        c.mark_sent();

        c.acknowledge(4, now);
        // Packet 4 was never sent, so it stays queued.
        assert_eq!(c.buffered(), 2);
        assert_eq!(c.next_unsent().map(|p| p.index), Some(4));

        // Stale and future acks are ignored.
        assert!(!c.acknowledge(2, now));
        assert!(!c.acknowledge(50, now));
        assert_eq!(c.max_acked(), 4);
    }

    #[test]
    fn test_idle() {
        let start = Instant::now();
        let c = Connection::new(1, config(), start);
        assert!(!c.is_idle(start + Duration::from_secs(30), Duration::from_secs(30)));
        assert!(c.is_idle(start + Duration::from_secs(31), Duration::from_secs(30)));
    }

    #[test]
    fn test_format_id() {
        assert_eq!(format_id(0xbeef), "0000beef");
    }
}
