//! Support for storing tracked TCP connections.

use log::{debug, trace};
use lru::LruCache;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

mod connection;
mod key;
pub use connection::{Connection, PacketSummary, Source, RTT_SAMPLES};
use connection::Entry;
pub use key::{ConnectionKey, Direction};

use crate::kernel::KernelStateSource;
use crate::packet::PacketObservation;
use crate::stat::StoreStats;

/// Represents the default maximum number of tracked connections.
pub const MAX_CONNECTIONS: usize = 4096;
/// Represents the default capacity of the store-wide packet buffer.
pub const PACKET_BUFFER: usize = 1000;
/// Represents the default capacity of the recent packets of a connection.
pub const RECENT_PACKETS: usize = 10;
/// Represents the default idle timeout of a connection.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Represents the default maximum number of probes waiting for acknowledgements per direction.
pub const MAX_PENDING_PROBES: usize = 64;
/// Represents the default number of sequences remembered for retransmission detection per
/// direction.
pub const SEQUENCE_WINDOW: usize = 1024;
/// Represents the default initial congestion window in segments.
pub const INITIAL_CWND: u32 = 10;
/// Represents the default initial slow start threshold in segments.
pub const INITIAL_SSTHRESH: u32 = 64;
/// Represents the default step of congestion window growth in congestion avoidance.
pub const AVOIDANCE_GRANULARITY: u32 = 1;
/// Represents the default maximum age of a kernel hint to be merged.
pub const HINT_MAX_AGE: Duration = Duration::from_secs(5);

/// Represents the configuration of a `ConnectionStore`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreConfig {
    pub max_connections: usize,
    pub packet_buffer: usize,
    pub recent_packets: usize,
    pub idle_timeout: Duration,
    pub max_pending_probes: usize,
    pub sequence_window: usize,
    pub initial_cwnd: u32,
    pub initial_ssthresh: u32,
    pub avoidance_granularity: u32,
    pub hint_max_age: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_connections: MAX_CONNECTIONS,
            packet_buffer: PACKET_BUFFER,
            recent_packets: RECENT_PACKETS,
            idle_timeout: IDLE_TIMEOUT,
            max_pending_probes: MAX_PENDING_PROBES,
            sequence_window: SEQUENCE_WINDOW,
            initial_cwnd: INITIAL_CWND,
            initial_ssthresh: INITIAL_SSTHRESH,
            avoidance_granularity: AVOIDANCE_GRANULARITY,
            hint_max_age: HINT_MAX_AGE,
        }
    }
}

/// Represents an immutable copy of a `ConnectionStore`.
#[derive(Clone, Debug)]
pub struct Snapshot {
    packets: Vec<PacketSummary>,
    connections: Vec<Connection>,
    stats: StoreStats,
    taken_at: SystemTime,
}

impl Snapshot {
    /// Returns the latest packets across all connections, newest first.
    pub fn packets(&self) -> &[PacketSummary] {
        &self.packets
    }

    /// Returns the connections, most recently updated first.
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Returns the statistics of the store.
    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Returns the time the snapshot was taken.
    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }
}

struct Inner {
    connections: LruCache<ConnectionKey, Entry>,
    // Keys ordered by the last seen time of their connections
    last_seen: BTreeSet<(Instant, ConnectionKey)>,
    packets: VecDeque<PacketSummary>,
    stats: StoreStats,
}

impl Inner {
    fn oldest(&self) -> Option<(Instant, ConnectionKey)> {
        self.last_seen.iter().next().copied()
    }

    // Removes the connection with the oldest last seen time.
    fn pop_oldest(&mut self) -> Option<ConnectionKey> {
        let (last_seen, key) = self.oldest()?;
        self.last_seen.remove(&(last_seen, key));
        self.connections.pop(&key);

        Some(key)
    }

    // Evicts connections idle longer than `timeout` at `now`, oldest last seen first.
    fn evict_idle(&mut self, now: Instant, timeout: Duration) -> usize {
        let mut evicted = 0;
        while let Some((last_seen, _)) = self.oldest() {
            if now.saturating_duration_since(last_seen) <= timeout {
                break;
            }

            if let Some(key) = self.pop_oldest() {
                debug!("expire TCP connection {}", key);
                evicted += 1;
            }
        }
        self.stats.expired = self.stats.expired.saturating_add(evicted as u64);

        evicted
    }
}

/// Represents a bounded table of tracked TCP connections.
///
/// `record_packet` is the only way to mutate the table. Readers get independent copies from
/// `snapshot` and never observe a partially updated connection.
pub struct ConnectionStore {
    config: StoreConfig,
    kernel: Option<Arc<dyn KernelStateSource>>,
    inner: RwLock<Inner>,
}

impl ConnectionStore {
    /// Creates a new `ConnectionStore`.
    pub fn new(config: StoreConfig) -> ConnectionStore {
        let capacity = config.max_connections.max(1);
        let packets = config.packet_buffer.min(PACKET_BUFFER);
        ConnectionStore {
            config,
            kernel: None,
            inner: RwLock::new(Inner {
                connections: LruCache::new(capacity),
                last_seen: BTreeSet::new(),
                packets: VecDeque::with_capacity(packets),
                stats: StoreStats::default(),
            }),
        }
    }

    /// Sets the advisory kernel state source of the `ConnectionStore`.
    pub fn with_kernel_source(mut self, source: Arc<dyn KernelStateSource>) -> Self {
        self.kernel = Some(source);
        self
    }

    fn read(&self) -> RwLockReadGuard<Inner> {
        self.inner.read().expect("connection store lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<Inner> {
        self.inner.write().expect("connection store lock poisoned")
    }

    /// Records an observed segment.
    pub fn record_packet(&self, observation: PacketObservation) {
        let now = observation.captured_at();
        let (key, direction) = ConnectionKey::normalize(observation.src(), observation.dst());
        let hint = self.kernel.as_ref().and_then(|source| source.lookup(&key));
        let summary = PacketSummary::new(direction, &observation);
        trace!("record {}", observation);

        let mut guard = self.write();
        let inner = &mut *guard;
        inner.stats.packets = inner.stats.packets.saturating_add(1);

        if !inner.connections.contains(&key) {
            inner.evict_idle(now, self.config.idle_timeout);
            if inner.connections.len() >= inner.connections.cap() {
                if let Some(evicted) = inner.pop_oldest() {
                    inner.stats.evicted = inner.stats.evicted.saturating_add(1);
                    debug!("evict TCP connection {}", evicted);
                }
            }

            let entry = Entry::new(key, &observation, &self.config);
            inner.last_seen.insert((entry.connection().last_seen_at(), key));
            inner.connections.put(key, entry);
            inner.stats.connections = inner.stats.connections.saturating_add(1);
            debug!("track TCP connection {}", key);
        }

        if let Some(entry) = inner.connections.get_mut(&key) {
            let prev_last_seen = entry.connection().last_seen_at();
            entry.update(direction, &observation, &self.config, hint);

            let last_seen = entry.connection().last_seen_at();
            if last_seen != prev_last_seen {
                inner.last_seen.remove(&(prev_last_seen, key));
                inner.last_seen.insert((last_seen, key));
            }
        }

        if self.config.packet_buffer > 0 {
            inner.packets.push_front(summary);
            inner.packets.truncate(self.config.packet_buffer);
        }
    }

    /// Takes a snapshot of the connections and the latest packets.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.read();

        Snapshot {
            packets: inner.packets.iter().cloned().collect(),
            connections: inner
                .connections
                .iter()
                .map(|(_, entry)| entry.connection().clone())
                .collect(),
            stats: inner.stats,
            taken_at: SystemTime::now(),
        }
    }

    /// Evicts connections idle longer than the idle timeout at `now`. Returns the number of
    /// connections evicted.
    pub fn evict_idle(&self, now: Instant) -> usize {
        self.write().evict_idle(now, self.config.idle_timeout)
    }

    /// Returns a copy of the connection of the given key.
    pub fn get(&self, key: &ConnectionKey) -> Option<Connection> {
        self.read()
            .connections
            .peek(key)
            .map(|entry| entry.connection().clone())
    }

    /// Returns the number of tracked connections.
    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    /// Returns if there is no tracked connection.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the statistics of the store.
    pub fn stats(&self) -> StoreStats {
        self.read().stats
    }

    /// Returns the configuration of the store.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl Default for ConnectionStore {
    fn default() -> Self {
        ConnectionStore::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelHint;
    use crate::packet::Flags;
    use crate::tcp::state::TcpState;
    use std::net::SocketAddr;
    use std::thread;

    fn data(src: &str, dst: &str, seq: u32, at: Instant) -> PacketObservation {
        let src: SocketAddr = src.parse().unwrap();
        let dst: SocketAddr = dst.parse().unwrap();

        PacketObservation::new(src, dst, Flags::ACK | Flags::PSH, seq, Some(1), 65535, 100)
            .at(at)
    }

    #[test]
    fn store_merges_directions() {
        let store = ConnectionStore::default();
        let now = Instant::now();
        store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", 1, now));
        store.record_packet(data("10.0.0.2:80", "10.0.0.1:1000", 1, now));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.connections().len(), 1);
        assert_eq!(snapshot.packets().len(), 2);
        assert_eq!(snapshot.packets()[0].direction(), Direction::UpperToLower);

        let connection = &snapshot.connections()[0];
        assert_eq!(connection.packets(Direction::LowerToUpper), 1);
        assert_eq!(connection.packets(Direction::UpperToLower), 1);
        assert_eq!(snapshot.stats().connections, 1);
        assert_eq!(snapshot.stats().packets, 2);
    }

    #[test]
    fn store_packet_buffer() {
        let store = ConnectionStore::new(StoreConfig {
            packet_buffer: 3,
            ..StoreConfig::default()
        });
        let now = Instant::now();
        for i in 0..5u32 {
            store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", i * 100, now));
        }

        let snapshot = store.snapshot();
        let sequences: Vec<u32> = snapshot.packets().iter().map(|p| p.sequence()).collect();
        assert_eq!(sequences, vec![400, 300, 200]);
    }

    #[test]
    fn store_evict_idle() {
        let store = ConnectionStore::new(StoreConfig {
            idle_timeout: Duration::from_secs(10),
            ..StoreConfig::default()
        });
        let start = Instant::now();
        store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", 1, start));
        let later = start + Duration::from_secs(8);
        store.record_packet(data("10.0.0.1:1001", "10.0.0.2:80", 1, later));

        assert_eq!(store.evict_idle(start + Duration::from_secs(5)), 0);
        assert_eq!(store.evict_idle(start + Duration::from_secs(15)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().expired, 1);

        let key = ConnectionKey::new(
            "10.0.0.1:1001".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );
        assert!(store.get(&key).is_some());
    }

    #[test]
    fn store_evict_idle_by_last_seen() {
        let store = ConnectionStore::new(StoreConfig {
            idle_timeout: Duration::from_secs(10),
            ..StoreConfig::default()
        });
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);
        store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", 1, at(1)));
        store.record_packet(data("10.0.0.1:1001", "10.0.0.2:80", 1, at(8)));
        // A reordered segment updates the first connection last without moving its last seen time
        store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", 101, at(0)));

        assert_eq!(store.evict_idle(at(12)), 1);
        let key = ConnectionKey::new(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );
        assert!(store.get(&key).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn store_snapshot_is_a_copy() {
        let store = ConnectionStore::default();
        let now = Instant::now();
        store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", 1, now));
        let snapshot = store.snapshot();
        store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", 101, now));

        assert_eq!(snapshot.connections()[0].packets(Direction::LowerToUpper), 1);
        assert_eq!(store.snapshot().connections()[0].packets(Direction::LowerToUpper), 2);
    }

    struct FixedSource(KernelHint);

    impl KernelStateSource for FixedSource {
        fn lookup(&self, _: &ConnectionKey) -> Option<KernelHint> {
            Some(self.0)
        }
    }

    #[test]
    fn store_kernel_source() {
        let now = Instant::now();
        let hint = KernelHint::new(now).with_state(TcpState::FinWait2);
        let store = ConnectionStore::default().with_kernel_source(Arc::new(FixedSource(hint)));
        store.record_packet(data("10.0.0.1:1000", "10.0.0.2:80", 1, now));

        let snapshot = store.snapshot();
        let connection = &snapshot.connections()[0];
        assert_eq!(connection.state(), TcpState::FinWait2);
        assert_eq!(connection.inferred_state(), TcpState::Established);
    }

    #[test]
    fn store_concurrent_readers() {
        let store = Arc::new(ConnectionStore::default());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let snapshot = store.snapshot();
                        for connection in snapshot.connections() {
                            assert!(connection.first_seen_at() <= connection.last_seen_at());
                        }
                    }
                })
            })
            .collect();

        let start = Instant::now();
        for i in 0..500u32 {
            let src = format!("10.0.{}.{}:{}", i / 250, i % 250, 1000 + i);
            store.record_packet(data(&src, "10.0.0.254:80", i, start));
        }
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(store.len(), 500);
    }
}
