//! Support for the records of tracked connections.

use log::{debug, trace};
use std::cmp::max;
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use super::{ConnectionKey, Direction, StoreConfig};
use crate::kernel::KernelHint;
use crate::packet::{Flags, PacketObservation};
use crate::stat::Traffic;
use crate::tcp::congestion::{CongestionEstimator, RetransmissionDetector};
use crate::tcp::rtt::{ProbeQueue, RttEstimator};
use crate::tcp::state::{StateMachine, TcpState};

/// Represents the number of RTT samples kept by a connection.
pub const RTT_SAMPLES: usize = 10;

/// Represents a compact summary of an observed segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketSummary {
    direction: Direction,
    src: SocketAddr,
    dst: SocketAddr,
    flags: Flags,
    sequence: u32,
    acknowledgement: Option<u32>,
    window: u16,
    payload_len: u32,
    captured_at: Instant,
    wall_time: SystemTime,
}

impl PacketSummary {
    /// Creates a `PacketSummary` of a segment sent in the given direction.
    pub fn new(direction: Direction, observation: &PacketObservation) -> PacketSummary {
        PacketSummary {
            direction,
            src: observation.src(),
            dst: observation.dst(),
            flags: observation.flags(),
            sequence: observation.sequence(),
            acknowledgement: observation.acknowledgement(),
            window: observation.window(),
            payload_len: observation.payload_len(),
            captured_at: observation.captured_at(),
            wall_time: observation.wall_time(),
        }
    }

    /// Returns the direction of the segment relative to its connection key.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn src(&self) -> SocketAddr {
        self.src
    }

    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn acknowledgement(&self) -> Option<u32> {
        self.acknowledgement
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn payload_len(&self) -> u32 {
        self.payload_len
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn wall_time(&self) -> SystemTime {
        self.wall_time
    }
}

impl Display for PacketSummary {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} -> {} {} seq = {}",
            self.src, self.dst, self.flags, self.sequence
        )?;
        if let Some(ack) = self.acknowledgement {
            write!(f, ", ack = {}", ack)?;
        }
        write!(f, ", wnd = {}, len = {}", self.window, self.payload_len)
    }
}

/// Represents where a reported value comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Source {
    /// Inferred from observed segments.
    Inferred,
    /// Reported by the kernel.
    Kernel,
}

/// Represents a tracked TCP connection as published to readers.
#[derive(Clone, Debug)]
pub struct Connection {
    key: ConnectionKey,
    state: TcpState,
    inferred_state: TcpState,
    state_source: Source,
    traffic: [Traffic; 2],
    srtt: Option<Duration>,
    rttvar: Option<Duration>,
    rto: Option<Duration>,
    rtt_source: Source,
    rtt_samples: VecDeque<Duration>,
    retransmissions: u64,
    cwnd: u32,
    ssthresh: u32,
    congestion_source: Source,
    inflight: u32,
    max_inflight: u32,
    last_sequence: Option<u32>,
    last_acknowledgement: Option<u32>,
    last_window: Option<u16>,
    first_seen: Instant,
    last_seen: Instant,
    first_seen_wall: SystemTime,
    last_seen_wall: SystemTime,
    recent_packets: VecDeque<PacketSummary>,
    kernel: Option<KernelHint>,
}

impl Connection {
    fn new(key: ConnectionKey, observation: &PacketObservation, config: &StoreConfig) -> Connection {
        Connection {
            key,
            state: TcpState::Unknown,
            inferred_state: TcpState::Unknown,
            state_source: Source::Inferred,
            traffic: [Traffic::new(), Traffic::new()],
            srtt: None,
            rttvar: None,
            rto: None,
            rtt_source: Source::Inferred,
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLES),
            retransmissions: 0,
            cwnd: config.initial_cwnd,
            ssthresh: config.initial_ssthresh,
            congestion_source: Source::Inferred,
            inflight: 0,
            max_inflight: 0,
            last_sequence: None,
            last_acknowledgement: None,
            last_window: None,
            first_seen: observation.captured_at(),
            last_seen: observation.captured_at(),
            first_seen_wall: observation.wall_time(),
            last_seen_wall: observation.wall_time(),
            recent_packets: VecDeque::with_capacity(config.recent_packets),
            kernel: None,
        }
    }

    /// Returns the key of the connection.
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Returns the identifier of the connection.
    pub fn id(&self) -> String {
        self.key.id()
    }

    /// Returns the lower endpoint of the connection.
    pub fn lower(&self) -> SocketAddr {
        self.key.lower()
    }

    /// Returns the upper endpoint of the connection.
    pub fn upper(&self) -> SocketAddr {
        self.key.upper()
    }

    /// Returns the state of the connection, which is the kernel's state if a fresh one is known.
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Returns the state of the connection inferred from observed segments only.
    pub fn inferred_state(&self) -> TcpState {
        self.inferred_state
    }

    pub fn state_source(&self) -> Source {
        self.state_source
    }

    /// Returns the traffic sent in the given direction.
    pub fn traffic(&self, direction: Direction) -> Traffic {
        self.traffic[direction.index()]
    }

    /// Returns the payload bytes sent in the given direction.
    pub fn bytes(&self, direction: Direction) -> u64 {
        self.traffic[direction.index()].size()
    }

    /// Returns the segments sent in the given direction.
    pub fn packets(&self, direction: Direction) -> u64 {
        self.traffic[direction.index()].count()
    }

    /// Returns the smoothed RTT of the connection, or `None` if no sample is taken yet.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Returns the RTT variance of the connection.
    pub fn rtt_variance(&self) -> Option<Duration> {
        self.rttvar
    }

    /// Returns the retransmission timeout of the connection.
    pub fn retransmission_timeout(&self) -> Option<Duration> {
        self.rto
    }

    pub fn rtt_source(&self) -> Source {
        self.rtt_source
    }

    /// Returns the latest RTT samples, newest first.
    pub fn rtt_samples(&self) -> &VecDeque<Duration> {
        &self.rtt_samples
    }

    /// Returns the number of retransmissions in both directions.
    pub fn retransmission_count(&self) -> u64 {
        self.retransmissions
    }

    /// Returns the estimated congestion window in segments.
    pub fn estimated_congestion_window(&self) -> u32 {
        self.cwnd
    }

    /// Returns the estimated slow start threshold in segments.
    pub fn estimated_slow_start_threshold(&self) -> u32 {
        self.ssthresh
    }

    pub fn congestion_source(&self) -> Source {
        self.congestion_source
    }

    /// Returns the number of unacknowledged segments carrying payload in both directions.
    pub fn inflight_segments(&self) -> u32 {
        self.inflight
    }

    /// Returns the maximum number of inflight segments ever observed.
    pub fn max_inflight_segments(&self) -> u32 {
        self.max_inflight
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }

    pub fn last_acknowledgement(&self) -> Option<u32> {
        self.last_acknowledgement
    }

    pub fn last_window(&self) -> Option<u16> {
        self.last_window
    }

    /// Returns the time the connection was first seen.
    pub fn first_seen_at(&self) -> Instant {
        self.first_seen
    }

    /// Returns the time the connection was last seen.
    pub fn last_seen_at(&self) -> Instant {
        self.last_seen
    }

    pub fn first_seen_wall(&self) -> SystemTime {
        self.first_seen_wall
    }

    pub fn last_seen_wall(&self) -> SystemTime {
        self.last_seen_wall
    }

    /// Returns the age of the connection.
    pub fn age(&self) -> Duration {
        self.last_seen.saturating_duration_since(self.first_seen)
    }

    /// Returns how long the connection is idle at `now`.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Returns the latest segments of the connection, newest first.
    pub fn recent_packets(&self) -> &VecDeque<PacketSummary> {
        &self.recent_packets
    }

    /// Returns the kernel hint merged into the connection, if any.
    pub fn kernel_hint(&self) -> Option<KernelHint> {
        self.kernel
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let rtt = match self.srtt {
            Some(srtt) => format!("{:.1}ms", srtt.as_secs_f64() * 1000.0),
            None => String::from("-"),
        };
        let rto = match self.rto {
            Some(rto) => format!("{}ms", rto.as_millis()),
            None => String::from("-"),
        };
        let estimated = |source: Source| match source {
            Source::Inferred => " est.",
            Source::Kernel => "",
        };

        write!(
            f,
            "{} {} {:<12} rtt {} rto {} cwnd {}{} ssthresh {}{} inflight {} retrans {} {} {}B/{} {} {}B/{}",
            self.key.id(),
            self.key,
            self.state.name(),
            rtt,
            rto,
            self.cwnd,
            estimated(self.congestion_source),
            self.ssthresh,
            estimated(self.congestion_source),
            self.inflight,
            self.retransmissions,
            Direction::LowerToUpper,
            self.bytes(Direction::LowerToUpper),
            self.packets(Direction::LowerToUpper),
            Direction::UpperToLower,
            self.bytes(Direction::UpperToLower),
            self.packets(Direction::UpperToLower)
        )
    }
}

// Represents the inference state of one sending direction.
struct Flow {
    probes: ProbeQueue,
    detector: RetransmissionDetector,
    cc: CongestionEstimator,
}

impl Flow {
    fn new(config: &StoreConfig) -> Flow {
        Flow {
            probes: ProbeQueue::with_capacity(config.max_pending_probes),
            detector: RetransmissionDetector::with_capacity(config.sequence_window),
            cc: CongestionEstimator::new(
                config.initial_cwnd,
                config.initial_ssthresh,
                config.avoidance_granularity,
            ),
        }
    }
}

/// Represents a connection together with the working state of its inference, as owned by the
/// store.
pub(super) struct Entry {
    connection: Connection,
    flows: [Flow; 2],
    rtt: RttEstimator,
    machine: StateMachine,
}

impl Entry {
    pub(super) fn new(
        key: ConnectionKey,
        observation: &PacketObservation,
        config: &StoreConfig,
    ) -> Entry {
        Entry {
            connection: Connection::new(key, observation, config),
            flows: [Flow::new(config), Flow::new(config)],
            rtt: RttEstimator::new(),
            machine: StateMachine::new(),
        }
    }

    pub(super) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Updates the connection with a segment sent in the given direction.
    pub(super) fn update(
        &mut self,
        direction: Direction,
        observation: &PacketObservation,
        config: &StoreConfig,
        hint: Option<KernelHint>,
    ) {
        let now = observation.captured_at();
        let sender = direction.index();
        let receiver = direction.reverse().index();
        let key = self.connection.key;

        // Timestamps
        if now > self.connection.last_seen {
            self.connection.last_seen = now;
            self.connection.last_seen_wall = observation.wall_time();
        }
        if now < self.connection.first_seen {
            self.connection.first_seen = now;
            self.connection.first_seen_wall = observation.wall_time();
        }

        // Counters
        self.connection.traffic[sender].add(observation.payload_len(), observation.window());
        self.connection.last_sequence = Some(observation.sequence());
        if let Some(ack) = observation.acknowledgement() {
            self.connection.last_acknowledgement = Some(ack);
        }
        self.connection.last_window = Some(observation.window());

        // Give up probes waiting for too long
        let timeout = self.rtt.probe_timeout();
        for flow in self.flows.iter_mut() {
            flow.probes.expire(now, timeout);
        }

        // Retransmission
        let is_retransmission = observation.payload_len() > 0
            && self.flows[sender].detector.observe(observation.sequence());
        if is_retransmission {
            self.flows[sender].cc.retransmission();
            debug!(
                "detect TCP retransmission of {} {} at {}",
                key,
                direction,
                observation.sequence()
            );
        }

        // Probe
        if observation.segment_len() > 0 {
            self.flows[sender].probes.send(
                observation.sequence(),
                observation.sequence_end(),
                observation.payload_len() > 0,
                is_retransmission,
                now,
            );
        }

        // Acknowledgement
        if let Some(ack) = observation.acknowledgement() {
            let acked = self.flows[receiver].probes.acknowledge(ack, now);
            if let Some(sample) = acked.sample {
                self.rtt.update(sample);
                self.connection.rtt_samples.push_front(sample);
                self.connection.rtt_samples.truncate(RTT_SAMPLES);
                trace!(
                    "set TCP SRTT of {} to {:?} with sample {:?}",
                    key,
                    self.rtt.srtt(),
                    sample
                );
            }
            if acked.advanced && acked.segments > 0 {
                self.flows[receiver].cc.acknowledge(acked.segments);
            }
        }

        // State
        let prev_state = self.connection.inferred_state;
        let state = self.machine.advance(direction, observation);
        if state != prev_state {
            debug!("set TCP state of {} from {} to {}", key, prev_state, state);
        }

        self.publish(now, config, hint);

        // History
        self.connection
            .recent_packets
            .push_front(PacketSummary::new(direction, observation));
        self.connection.recent_packets.truncate(config.recent_packets);
    }

    // Copies the working state into the published connection, preferring a fresh kernel hint.
    fn publish(&mut self, now: Instant, config: &StoreConfig, hint: Option<KernelHint>) {
        let connection = &mut self.connection;

        connection.inferred_state = self.machine.state();
        connection.state = connection.inferred_state;
        connection.state_source = Source::Inferred;

        connection.srtt = self.rtt.srtt();
        connection.rttvar = self.rtt.rttvar();
        connection.rto = self.rtt.rto();
        connection.rtt_source = Source::Inferred;

        // The bulk sender's estimate
        let bulk = if connection.traffic[1].size() > connection.traffic[0].size() {
            &self.flows[1]
        } else {
            &self.flows[0]
        };
        connection.cwnd = bulk.cc.cwnd();
        connection.ssthresh = bulk.cc.ssthresh();
        connection.congestion_source = Source::Inferred;

        connection.retransmissions =
            self.flows[0].detector.count() + self.flows[1].detector.count();
        connection.inflight = self.flows[0].probes.inflight() + self.flows[1].probes.inflight();
        connection.max_inflight = max(connection.max_inflight, connection.inflight);

        connection.kernel = hint.filter(|hint| hint.is_fresh(now, config.hint_max_age));
        if let Some(hint) = connection.kernel {
            if let Some(state) = hint.state() {
                connection.state = state;
                connection.state_source = Source::Kernel;
            }
            if let Some(srtt) = hint.srtt() {
                connection.srtt = Some(srtt);
                connection.rtt_source = Source::Kernel;
            }
            if let Some(rto) = hint.rto() {
                connection.rto = Some(rto);
                connection.rtt_source = Source::Kernel;
            }
            if let Some(cwnd) = hint.cwnd() {
                connection.cwnd = cwnd;
                connection.congestion_source = Source::Kernel;
            }
            if let Some(ssthresh) = hint.ssthresh() {
                connection.ssthresh = ssthresh;
                connection.congestion_source = Source::Kernel;
            }
        }
    }
}
