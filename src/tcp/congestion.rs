//! Support for inferring retransmissions and congestion windows of TCP connections.
//!
//! The observer never sees the sender's real window, so the estimates here follow a Reno sender
//! which reacts to the retransmissions and acknowledgements it can see on the wire. Windows are
//! counted in segments.

use lru::LruCache;
use std::cmp::{max, min};

/// Represents the minimum slow start threshold.
pub const MIN_SSTHRESH: u32 = 2;

/// Represents a detector which reports segments carrying payload at a sequence already seen.
pub struct RetransmissionDetector {
    seen: LruCache<u32, ()>,
    count: u64,
}

impl RetransmissionDetector {
    /// Creates a new `RetransmissionDetector` which remembers the latest `window` sequences.
    pub fn with_capacity(window: usize) -> RetransmissionDetector {
        RetransmissionDetector {
            seen: LruCache::new(max(1, window)),
            count: 0,
        }
    }

    /// Observes a segment carrying payload at the given sequence. Returns if the segment is a
    /// retransmission.
    pub fn observe(&mut self, sequence: u32) -> bool {
        let is_retransmission = self.seen.contains(&sequence);
        self.seen.put(sequence, ());
        if is_retransmission {
            self.count = self.count.saturating_add(1);
        }

        is_retransmission
    }

    /// Returns the number of retransmissions detected.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Represents an estimate of the congestion state of a Reno sender.
#[derive(Clone, Debug, PartialEq)]
pub struct CongestionEstimator {
    cwnd: u32,
    ssthresh: u32,
    credit: f64,
    granularity: u32,
}

impl CongestionEstimator {
    /// Creates a new `CongestionEstimator`. In congestion avoidance, the window grows in steps of
    /// `granularity` segments once enough acknowledgements are accumulated.
    pub fn new(cwnd: u32, ssthresh: u32, granularity: u32) -> CongestionEstimator {
        CongestionEstimator {
            cwnd: max(1, cwnd),
            ssthresh: max(MIN_SSTHRESH, ssthresh),
            credit: 0.0,
            granularity: max(1, granularity),
        }
    }

    /// Grows the window on acknowledging the given number of segments.
    pub fn acknowledge(&mut self, segments: u32) {
        let mut segments = segments;
        if self.cwnd < self.ssthresh {
            segments = self.slow_start(segments);
        }
        if segments > 0 {
            self.congestion_avoidance(segments);
        }
    }

    fn slow_start(&mut self, segments: u32) -> u32 {
        let remain = self.ssthresh - self.cwnd;
        let delta = min(remain, segments);
        self.cwnd = self.cwnd.saturating_add(delta);

        segments - delta
    }

    fn congestion_avoidance(&mut self, segments: u32) {
        self.credit += segments as f64 / self.cwnd as f64;

        let granularity = self.granularity as f64;
        if self.credit >= granularity {
            let steps = (self.credit / granularity).floor();
            let delta = (steps * granularity).min(u32::MAX as f64) as u32;
            self.cwnd = self.cwnd.saturating_add(delta);
            self.credit -= steps * granularity;
        }
    }

    /// Shrinks the window on a retransmission.
    pub fn retransmission(&mut self) {
        self.ssthresh = max(self.cwnd / 2, MIN_SSTHRESH);
        self.cwnd = self.ssthresh;
        self.credit = 0.0;
    }

    /// Returns the estimated congestion window.
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Returns the estimated slow start threshold.
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }
}

#[test]
fn retransmission_detect() {
    let mut detector = RetransmissionDetector::with_capacity(128);
    for i in 0..100u32 {
        assert!(!detector.observe(i * 1460));
    }
    assert!(detector.observe(50 * 1460));
    assert!(detector.observe(50 * 1460));
    assert_eq!(detector.count(), 2);
}

#[test]
fn retransmission_window_forgets() {
    let mut detector = RetransmissionDetector::with_capacity(4);
    for i in 0..8u32 {
        detector.observe(i);
    }

    // Sequence 0 slid out of the window
    assert!(!detector.observe(0));
    assert!(detector.observe(7));
}

#[test]
fn congestion_slow_start() {
    let mut cc = CongestionEstimator::new(10, 64, 1);
    cc.acknowledge(5);
    assert_eq!(cc.cwnd(), 15);

    // Crossing the threshold spills into avoidance
    cc.acknowledge(60);
    assert_eq!(cc.cwnd(), 64);
}

#[test]
fn congestion_avoidance() {
    let mut cc = CongestionEstimator::new(20, 20, 1);
    cc.acknowledge(19);
    assert_eq!(cc.cwnd(), 20);
    cc.acknowledge(1);
    assert_eq!(cc.cwnd(), 21);
}

#[test]
fn congestion_avoidance_granularity() {
    let mut cc = CongestionEstimator::new(10, 10, 2);
    cc.acknowledge(10);
    assert_eq!(cc.cwnd(), 10);
    cc.acknowledge(10);
    assert_eq!(cc.cwnd(), 12);
}

#[test]
fn congestion_retransmission() {
    let mut cc = CongestionEstimator::new(10, 64, 1);
    cc.retransmission();
    assert_eq!(cc.cwnd(), 5);
    assert_eq!(cc.ssthresh(), 5);

    for _ in 0..5 {
        cc.retransmission();
    }
    assert_eq!(cc.cwnd(), MIN_SSTHRESH);
    assert_eq!(cc.ssthresh(), MIN_SSTHRESH);
}
