//! Support for estimating the round-trip time of TCP connections from observed segments.

use std::cmp::{max, min};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{seq_le, seq_lt};

/// Represents the minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(200);
/// Represents the maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(60);
/// Represents how long a probe waits for its acknowledgement before any RTT is known.
pub const INITIAL_RTO: Duration = Duration::from_secs(3);

const RTO_K: u32 = 4;
// Gains are applied as integer divisors on nanoseconds, i.e. 1/8 and 1/4.
const RTO_ALPHA_DIV: i128 = 8;
const RTO_BETA_DIV: i128 = 4;

/// Represents the smoothed RTT estimate of a TCP connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Option<Duration>,
    rto: Option<Duration>,
}

impl RttEstimator {
    /// Creates a new `RttEstimator` without any sample.
    pub fn new() -> RttEstimator {
        RttEstimator::default()
    }

    /// Updates the estimate with a RTT sample.
    pub fn update(&mut self, rtt: Duration) {
        let (srtt, rttvar) = match (self.srtt, self.rttvar) {
            (Some(prev_srtt), Some(prev_rttvar)) => {
                let sample = rtt.as_nanos() as i128;
                let prev_srtt = prev_srtt.as_nanos() as i128;
                let prev_rttvar = prev_rttvar.as_nanos() as i128;
                let delta = sample - prev_srtt;

                let srtt = prev_srtt + delta / RTO_ALPHA_DIV;
                let rttvar = prev_rttvar + (delta.abs() - prev_rttvar) / RTO_BETA_DIV;

                (from_nanos(srtt), from_nanos(rttvar))
            }
            _ => (rtt, rtt / 2),
        };

        let rto = rttvar
            .checked_mul(RTO_K)
            .and_then(|var| srtt.checked_add(var))
            .unwrap_or(MAX_RTO);
        let rto = min(MAX_RTO, max(MIN_RTO, rto));

        self.srtt = Some(srtt);
        self.rttvar = Some(rttvar);
        self.rto = Some(rto);
    }

    /// Returns the smoothed RTT.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Returns the RTT variance.
    pub fn rttvar(&self) -> Option<Duration> {
        self.rttvar
    }

    /// Returns the retransmission timeout.
    pub fn rto(&self) -> Option<Duration> {
        self.rto
    }

    /// Returns how long a probe may wait for its acknowledgement before it is given up.
    pub fn probe_timeout(&self) -> Duration {
        self.rto.unwrap_or(INITIAL_RTO)
    }
}

fn from_nanos(nanos: i128) -> Duration {
    Duration::from_nanos(nanos.max(0).min(u64::MAX as i128) as u64)
}

#[derive(Clone, Copy, Debug)]
struct Probe {
    sequence: u32,
    end: u32,
    sent_at: Instant,
    has_payload: bool,
    retransmitted: bool,
}

/// Represents the result of applying an acknowledgement to a `ProbeQueue`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Acknowledged {
    /// If the acknowledgement moved the highest acknowledged sequence forward.
    pub advanced: bool,
    /// The number of segments carrying payload which are newly acknowledged.
    pub segments: u32,
    /// The RTT sample taken from the acknowledgement, if any.
    pub sample: Option<Duration>,
}

/// Represents the segments sent in one direction of a TCP connection which are still waiting for
/// their acknowledgements.
#[derive(Clone, Debug)]
pub struct ProbeQueue {
    probes: VecDeque<Probe>,
    capacity: usize,
    acked: Option<u32>,
}

impl ProbeQueue {
    /// Creates a new `ProbeQueue` which holds at most `capacity` probes.
    pub fn with_capacity(capacity: usize) -> ProbeQueue {
        let capacity = max(1, capacity);
        ProbeQueue {
            probes: VecDeque::with_capacity(min(capacity, 64)),
            capacity,
            acked: None,
        }
    }

    /// Records a segment occupying sequence space `[sequence, end)` sent at `sent_at`. Returns if
    /// the segment is a new probe, or `false` if it repeats one already outstanding or
    /// acknowledged.
    ///
    /// A segment known to be `retransmitted` becomes an ambiguous probe even if its original is no
    /// longer outstanding, so its acknowledgement never yields a sample.
    pub fn send(
        &mut self,
        sequence: u32,
        end: u32,
        has_payload: bool,
        retransmitted: bool,
        sent_at: Instant,
    ) -> bool {
        if let Some(acked) = self.acked {
            if seq_le(end, acked) {
                return false;
            }
        }

        if let Some(probe) = self.probes.iter_mut().find(|probe| probe.sequence == sequence) {
            probe.retransmitted = true;
            return false;
        }

        if self.probes.len() >= self.capacity {
            self.probes.pop_front();
        }
        self.probes.push_back(Probe {
            sequence,
            end,
            sent_at,
            has_payload,
            retransmitted,
        });

        true
    }

    /// Applies a cumulative acknowledgement seen at `now` to the probes.
    ///
    /// Every probe ending at or before `ack` is removed. A RTT sample is taken from the newest of
    /// them only if none of them was retransmitted, and only if the acknowledgement is fresh.
    pub fn acknowledge(&mut self, ack: u32, now: Instant) -> Acknowledged {
        let advanced = match self.acked {
            Some(acked) => seq_lt(acked, ack),
            None => true,
        };
        if !advanced {
            return Acknowledged::default();
        }
        self.acked = Some(ack);

        let mut newest: Option<Probe> = None;
        let mut segments = 0u32;
        let mut ambiguous = false;
        self.probes.retain(|probe| {
            if !seq_le(probe.end, ack) {
                return true;
            }

            if probe.has_payload {
                segments = segments.saturating_add(1);
            }
            ambiguous = ambiguous || probe.retransmitted;
            newest = match newest {
                Some(prev) if seq_le(probe.end, prev.end) => Some(prev),
                _ => Some(*probe),
            };

            false
        });

        let sample = match newest {
            Some(probe) if !ambiguous => now.checked_duration_since(probe.sent_at),
            _ => None,
        };

        Acknowledged {
            advanced,
            segments,
            sample,
        }
    }

    /// Removes probes sent more than `timeout` before `now`. Returns the number of probes removed.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let len = self.probes.len();
        self.probes
            .retain(|probe| now.saturating_duration_since(probe.sent_at) <= timeout);

        len - self.probes.len()
    }

    /// Returns the number of outstanding segments carrying payload.
    pub fn inflight(&self) -> u32 {
        self.probes.iter().filter(|probe| probe.has_payload).count() as u32
    }

    /// Returns the number of outstanding probes.
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Returns if there is no outstanding probe.
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Returns the highest acknowledged sequence.
    pub fn acked(&self) -> Option<u32> {
        self.acked
    }
}

#[test]
fn rtt_first_sample() {
    let mut estimator = RttEstimator::new();
    assert_eq!(estimator.srtt(), None);
    assert_eq!(estimator.rto(), None);

    estimator.update(Duration::from_millis(100));
    assert_eq!(estimator.srtt(), Some(Duration::from_millis(100)));
    assert_eq!(estimator.rttvar(), Some(Duration::from_millis(50)));
    assert_eq!(estimator.rto(), Some(Duration::from_millis(300)));
}

#[test]
fn rtt_smoothing() {
    let mut estimator = RttEstimator::new();
    estimator.update(Duration::from_millis(100));
    estimator.update(Duration::from_millis(180));

    // 100 + (180 - 100) / 8
    assert_eq!(estimator.srtt(), Some(Duration::from_millis(110)));
    // 50 + (80 - 50) / 4
    assert_eq!(estimator.rttvar(), Some(Duration::from_micros(57_500)));
}

#[test]
fn rtt_rto_clamp() {
    let mut estimator = RttEstimator::new();
    estimator.update(Duration::from_micros(100));
    assert_eq!(estimator.rto(), Some(MIN_RTO));

    let mut estimator = RttEstimator::new();
    estimator.update(Duration::from_secs(40));
    assert_eq!(estimator.rto(), Some(MAX_RTO));
}

#[test]
fn probe_sample() {
    let start = Instant::now();
    let mut queue = ProbeQueue::with_capacity(8);

    assert!(queue.send(1000, 1100, true, false, start));
    assert!(queue.send(1100, 1200, true, false, start + Duration::from_millis(5)));
    assert_eq!(queue.inflight(), 2);

    let acked = queue.acknowledge(1200, start + Duration::from_millis(45));
    assert!(acked.advanced);
    assert_eq!(acked.segments, 2);
    assert_eq!(acked.sample, Some(Duration::from_millis(40)));
    assert!(queue.is_empty());
}

#[test]
fn probe_partial_ack() {
    let start = Instant::now();
    let mut queue = ProbeQueue::with_capacity(8);

    queue.send(1000, 1100, true, false, start);
    queue.send(1100, 1200, true, false, start);

    let acked = queue.acknowledge(1150, start + Duration::from_millis(10));
    assert_eq!(acked.segments, 1);
    assert_eq!(queue.inflight(), 1);

    // Duplicate acknowledgements carry no sample
    let acked = queue.acknowledge(1150, start + Duration::from_millis(20));
    assert!(!acked.advanced);
    assert_eq!(acked.sample, None);
}

#[test]
fn probe_retransmitted_is_ambiguous() {
    let start = Instant::now();
    let mut queue = ProbeQueue::with_capacity(8);

    assert!(queue.send(1000, 1100, true, false, start));
    assert!(!queue.send(1000, 1100, true, true, start + Duration::from_millis(300)));

    let acked = queue.acknowledge(1100, start + Duration::from_millis(310));
    assert!(acked.advanced);
    assert_eq!(acked.segments, 1);
    assert_eq!(acked.sample, None);
}

#[test]
fn probe_acked_segment_is_not_tracked_again() {
    let start = Instant::now();
    let mut queue = ProbeQueue::with_capacity(8);

    queue.send(1000, 1100, true, false, start);
    queue.acknowledge(1100, start + Duration::from_millis(10));

    assert!(!queue.send(1000, 1100, true, false, start + Duration::from_millis(20)));
    assert!(queue.is_empty());
}

#[test]
fn probe_expire() {
    let start = Instant::now();
    let mut queue = ProbeQueue::with_capacity(8);

    queue.send(1000, 1100, true, false, start);
    queue.send(1100, 1200, true, false, start + Duration::from_millis(900));

    assert_eq!(
        queue.expire(start + Duration::from_millis(1000), Duration::from_millis(500)),
        1
    );
    assert_eq!(queue.len(), 1);

    let acked = queue.acknowledge(1200, start + Duration::from_millis(1000));
    assert_eq!(acked.sample, Some(Duration::from_millis(100)));
}

#[test]
fn probe_capacity() {
    let start = Instant::now();
    let mut queue = ProbeQueue::with_capacity(2);

    queue.send(0, 10, true, false, start);
    queue.send(10, 20, true, false, start);
    queue.send(20, 30, true, false, start);
    assert_eq!(queue.len(), 2);

    // The oldest probe is gone, so acknowledging it yields no segment
    let acked = queue.acknowledge(10, start);
    assert_eq!(acked.segments, 0);
}

#[test]
fn probe_out_of_order_clock() {
    let start = Instant::now() + Duration::from_secs(1);
    let mut queue = ProbeQueue::with_capacity(8);

    queue.send(1000, 1100, true, false, start);
    let acked = queue.acknowledge(1100, start - Duration::from_millis(10));
    assert!(acked.advanced);
    assert_eq!(acked.sample, None);
}

#[test]
fn resent_segment_after_expiry_is_ambiguous() {
    let start = Instant::now();
    let mut queue = ProbeQueue::with_capacity(8);

    queue.send(1000, 1100, true, false, start);
    assert_eq!(queue.expire(start + INITIAL_RTO * 2, INITIAL_RTO), 1);

    // The original is gone, the resent segment is still ambiguous
    let resent = start + Duration::from_secs(4);
    assert!(queue.send(1000, 1100, true, true, resent));
    let acked = queue.acknowledge(1100, resent + Duration::from_millis(50));
    assert_eq!(acked.segments, 1);
    assert_eq!(acked.sample, None);
}
