use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tcpscope::{
    ConnectionKey, ConnectionStore, Direction, Flags, PacketObservation, StoreConfig, TcpState,
};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

struct Peer {
    client: SocketAddr,
    server: SocketAddr,
    start: Instant,
}

impl Peer {
    fn new(client: &str, server: &str) -> Peer {
        Peer {
            client: addr(client),
            server: addr(server),
            start: Instant::now(),
        }
    }

    fn client(&self, flags: Flags, seq: u32, ack: u32, len: u32, ms: u64) -> PacketObservation {
        PacketObservation::new(self.client, self.server, flags, seq, Some(ack), 64240, len)
            .at(self.start + Duration::from_millis(ms))
    }

    fn server(&self, flags: Flags, seq: u32, ack: u32, len: u32, ms: u64) -> PacketObservation {
        PacketObservation::new(self.server, self.client, flags, seq, Some(ack), 65160, len)
            .at(self.start + Duration::from_millis(ms))
    }

    fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.client, self.server)
    }
}

#[test]
fn handshake_is_one_connection_with_rtt() {
    let store = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");

    store.record_packet(peer.client(Flags::SYN, 100, 0, 0, 0));
    store.record_packet(peer.server(Flags::SYN | Flags::ACK, 500, 101, 0, 20));

    let snapshot = store.snapshot();
    assert_eq!(snapshot.connections().len(), 1);
    let connection = &snapshot.connections()[0];
    assert_eq!(connection.state(), TcpState::SynReceived);
    assert_eq!(connection.smoothed_rtt(), Some(Duration::from_millis(20)));
    assert_eq!(connection.rtt_variance(), Some(Duration::from_millis(10)));
    assert_eq!(connection.retransmission_timeout(), Some(Duration::from_millis(200)));

    store.record_packet(peer.client(Flags::ACK, 101, 501, 0, 21));
    assert_eq!(
        store.get(&peer.key()).unwrap().state(),
        TcpState::Established
    );
}

#[test]
fn state_follows_handshake_and_reset() {
    let store = ConnectionStore::default();
    let peer = Peer::new("192.168.1.10:51000", "93.184.216.34:443");
    let state = |store: &ConnectionStore| store.get(&peer.key()).unwrap().state();

    store.record_packet(peer.client(Flags::SYN, 7, 0, 0, 0));
    assert_eq!(state(&store), TcpState::SynSent);
    store.record_packet(peer.server(Flags::SYN | Flags::ACK, 900, 8, 0, 30));
    assert_eq!(state(&store), TcpState::SynReceived);
    store.record_packet(peer.client(Flags::ACK, 8, 901, 0, 31));
    assert_eq!(state(&store), TcpState::Established);
    store.record_packet(peer.server(Flags::RST, 901, 0, 0, 40));
    assert_eq!(state(&store), TcpState::Closed);

    // Post close chatter keeps the connection tracked
    store.record_packet(peer.client(Flags::ACK, 8, 901, 0, 41));
    assert_eq!(store.len(), 1);
    assert_eq!(state(&store), TcpState::Closed);
}

#[test]
fn duplicate_segment_counts_as_retransmission() {
    let store = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");
    let mss = 1000;

    for i in 0..100u32 {
        let seq = 1 + i * mss;
        store.record_packet(peer.client(Flags::ACK | Flags::PSH, seq, 1, mss, i as u64 * 2));
        store.record_packet(peer.server(Flags::ACK, 1, seq + mss, 0, i as u64 * 2 + 1));
    }
    let connection = store.get(&peer.key()).unwrap();
    assert_eq!(connection.retransmission_count(), 0);
    assert_eq!(connection.inflight_segments(), 0);
    assert_eq!(connection.bytes(Direction::LowerToUpper), 100 * mss as u64);

    // Resend an already acknowledged segment
    store.record_packet(peer.client(Flags::ACK | Flags::PSH, 1 + 50 * mss, 1, mss, 300));
    let connection = store.get(&peer.key()).unwrap();
    assert_eq!(connection.retransmission_count(), 1);
    assert_eq!(
        connection.estimated_slow_start_threshold(),
        connection.estimated_congestion_window()
    );

    store.record_packet(peer.client(Flags::ACK | Flags::PSH, 1 + 50 * mss, 1, mss, 301));
    assert_eq!(store.get(&peer.key()).unwrap().retransmission_count(), 2);
}

#[test]
fn rtt_smooths_samples() {
    let store = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");

    store.record_packet(peer.client(Flags::ACK | Flags::PSH, 1000, 1, 100, 0));
    store.record_packet(peer.server(Flags::ACK, 1, 1100, 0, 100));
    store.record_packet(peer.client(Flags::ACK | Flags::PSH, 1100, 1, 100, 200));
    store.record_packet(peer.server(Flags::ACK, 1, 1200, 0, 380));

    let connection = store.get(&peer.key()).unwrap();
    // 100 + (180 - 100) / 8
    assert_eq!(connection.smoothed_rtt(), Some(Duration::from_millis(110)));
    assert_eq!(
        connection.rtt_samples().iter().copied().collect::<Vec<_>>(),
        vec![Duration::from_millis(180), Duration::from_millis(100)]
    );
}

#[test]
fn rtt_unknown_without_samples() {
    let store = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");

    // An acknowledgement without a matching segment is ignored
    store.record_packet(peer.server(Flags::ACK, 1, 12345, 0, 0));
    let connection = store.get(&peer.key()).unwrap();
    assert_eq!(connection.smoothed_rtt(), None);
    assert_eq!(connection.retransmission_timeout(), None);
    assert_eq!(connection.state(), TcpState::Established);
}

#[test]
fn sequence_wraparound() {
    let store = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");
    let mss = 1000u32;
    let mut seq = u32::MAX - 2 * mss;

    for i in 0..5u64 {
        store.record_packet(peer.client(Flags::ACK | Flags::PSH, seq, 1, mss, i * 10));
        seq = seq.wrapping_add(mss);
        store.record_packet(peer.server(Flags::ACK, 1, seq, 0, i * 10 + 5));
    }

    let connection = store.get(&peer.key()).unwrap();
    assert_eq!(connection.retransmission_count(), 0);
    assert_eq!(connection.inflight_segments(), 0);
    assert_eq!(connection.smoothed_rtt(), Some(Duration::from_millis(5)));
}

#[test]
fn negative_rtt_is_discarded() {
    let store = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");

    store.record_packet(peer.client(Flags::ACK | Flags::PSH, 1000, 1, 100, 50));
    store.record_packet(peer.server(Flags::ACK, 1, 1100, 0, 10));

    let connection = store.get(&peer.key()).unwrap();
    assert_eq!(connection.smoothed_rtt(), None);
    assert!(connection.first_seen_at() <= connection.last_seen_at());
}

#[test]
fn recent_packets_are_bounded() {
    let config = StoreConfig::default();
    let k = config.recent_packets;
    let store = ConnectionStore::new(config);
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");

    for i in 0..(k + 5) as u32 {
        store.record_packet(peer.client(Flags::ACK | Flags::PSH, i * 10, 1, 10, i as u64));
    }

    let connection = store.get(&peer.key()).unwrap();
    let sequences: Vec<u32> = connection
        .recent_packets()
        .iter()
        .map(|packet| packet.sequence())
        .collect();
    let expected: Vec<u32> = (5..(k + 5) as u32).rev().map(|i| i * 10).collect();
    assert_eq!(sequences, expected);
}

#[test]
fn eviction_removes_oldest() {
    let store = ConnectionStore::new(StoreConfig {
        max_connections: 3,
        ..StoreConfig::default()
    });
    let peers: Vec<Peer> = (0..4)
        .map(|i| Peer::new(&format!("10.0.0.{}:40000", i + 1), "10.0.0.100:80"))
        .collect();

    for (i, peer) in peers.iter().take(3).enumerate() {
        store.record_packet(peer.client(Flags::ACK, 1, 1, 10, i as u64));
    }
    // Refresh the first connection so the second is the oldest
    store.record_packet(peers[0].client(Flags::ACK, 11, 1, 10, 10));
    store.record_packet(peers[3].client(Flags::ACK, 1, 1, 10, 11));

    assert_eq!(store.len(), 3);
    assert!(store.get(&peers[0].key()).is_some());
    assert!(store.get(&peers[1].key()).is_none());
    assert!(store.get(&peers[2].key()).is_some());
    assert!(store.get(&peers[3].key()).is_some());
    assert_eq!(store.stats().evicted, 1);
}

#[test]
fn eviction_follows_last_seen_with_reordered_capture() {
    let store = ConnectionStore::new(StoreConfig {
        max_connections: 2,
        ..StoreConfig::default()
    });
    let start = Instant::now();
    let peers: Vec<Peer> = (0..3)
        .map(|i| Peer {
            start,
            ..Peer::new(&format!("10.0.0.{}:40000", i + 1), "10.0.0.100:80")
        })
        .collect();

    store.record_packet(peers[0].client(Flags::ACK, 1, 1, 10, 10));
    store.record_packet(peers[1].client(Flags::ACK, 1, 1, 10, 20));
    // Delivered late, stamped before anything else
    store.record_packet(peers[0].client(Flags::ACK, 11, 1, 10, 5));
    assert_eq!(
        store.get(&peers[0].key()).unwrap().last_seen_at(),
        start + Duration::from_millis(10)
    );

    store.record_packet(peers[2].client(Flags::ACK, 1, 1, 10, 30));

    assert!(store.get(&peers[0].key()).is_none());
    assert!(store.get(&peers[1].key()).is_some());
    assert!(store.get(&peers[2].key()).is_some());
    assert_eq!(store.stats().evicted, 1);
}

#[test]
fn retransmission_after_timeout_is_not_timed() {
    let store = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");

    store.record_packet(peer.client(Flags::ACK | Flags::PSH, 1000, 1, 100, 0));
    // Resent after the original gave up waiting
    store.record_packet(peer.client(Flags::ACK | Flags::PSH, 1000, 1, 100, 4000));
    store.record_packet(peer.server(Flags::ACK, 1, 1100, 0, 4050));

    let connection = store.get(&peer.key()).unwrap();
    assert_eq!(connection.retransmission_count(), 1);
    assert_eq!(connection.smoothed_rtt(), None);
    assert_eq!(connection.inflight_segments(), 0);
}

#[test]
fn stores_are_independent() {
    let first = ConnectionStore::default();
    let second = ConnectionStore::default();
    let peer = Peer::new("10.0.0.1:40000", "10.0.0.2:443");

    first.record_packet(peer.client(Flags::SYN, 100, 0, 0, 0));
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}
