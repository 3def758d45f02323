//! Support for statistics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Represents the traffic statistics of one direction of a connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Traffic {
    size: u64,
    count: u64,
    window: Option<u16>,
}

impl Traffic {
    /// Creates a new `Traffic`.
    pub fn new() -> Traffic {
        Traffic::default()
    }

    /// Adds a segment of the given payload size and advertised window to the traffic.
    pub fn add(&mut self, size: u32, window: u16) {
        self.size = self.size.saturating_add(size as u64);
        self.count = self.count.saturating_add(1);
        self.window = Some(window);
    }

    /// Returns the payload size of the traffic.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the segment count of the traffic.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the last advertised window of the traffic.
    pub fn window(&self) -> Option<u16> {
        self.window
    }
}

/// Represents the statistics of a connection store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreStats {
    /// The number of packets recorded.
    pub packets: u64,
    /// The number of connections created.
    pub connections: u64,
    /// The number of connections evicted for capacity.
    pub evicted: u64,
    /// The number of connections expired for idleness.
    pub expired: u64,
}

/// Represents the capture statistics.
#[derive(Clone, Debug, Default)]
pub struct Capture {
    frames: Arc<AtomicUsize>,
    segments: Arc<AtomicUsize>,
}

impl Capture {
    /// Creates a new `Capture`.
    pub fn new() -> Capture {
        Capture::default()
    }

    /// Counts a received frame, and if it decodes into a TCP segment.
    pub fn add(&self, is_segment: bool) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if is_segment {
            self.segments.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the number of frames received.
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::Relaxed)
    }

    /// Returns the number of frames decoded into TCP segments.
    pub fn segments(&self) -> usize {
        self.segments.load(Ordering::Relaxed)
    }
}

#[test]
fn traffic_add() {
    let mut traffic = Traffic::new();
    assert_eq!(traffic.window(), None);

    traffic.add(1460, 502);
    traffic.add(0, 501);
    assert_eq!(traffic.size(), 1460);
    assert_eq!(traffic.count(), 2);
    assert_eq!(traffic.window(), Some(501));
}

#[test]
fn capture_shared() {
    let capture = Capture::new();
    let other = capture.clone();
    other.add(true);
    other.add(false);

    assert_eq!(capture.frames(), 2);
    assert_eq!(capture.segments(), 1);
}
