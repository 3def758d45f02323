//! Support for describing observed TCP segments.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::ops::BitOr;
use std::time::{Instant, SystemTime};

mod decoder;
pub use decoder::{decode, decode_ip};

/// Represents the control flags of a TCP segment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Flags(u8);

impl Flags {
    pub const FIN: Flags = Flags(0x01);
    pub const SYN: Flags = Flags(0x02);
    pub const RST: Flags = Flags(0x04);
    pub const PSH: Flags = Flags(0x08);
    pub const ACK: Flags = Flags(0x10);
    pub const URG: Flags = Flags(0x20);

    /// Creates a `Flags` from the low byte of the TCP flags field.
    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits)
    }

    /// Returns the bits of the flags.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Returns if all the given flags are set.
    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_fin(&self) -> bool {
        self.contains(Flags::FIN)
    }

    pub fn is_syn(&self) -> bool {
        self.contains(Flags::SYN)
    }

    pub fn is_rst(&self) -> bool {
        self.contains(Flags::RST)
    }

    pub fn is_psh(&self) -> bool {
        self.contains(Flags::PSH)
    }

    pub fn is_ack(&self) -> bool {
        self.contains(Flags::ACK)
    }

    pub fn is_urg(&self) -> bool {
        self.contains(Flags::URG)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut s = String::from("[");
        if self.is_urg() {
            s.push('U');
        }
        if self.is_psh() {
            s.push('P');
        }
        if self.is_rst() {
            s.push('R');
        }
        if self.is_syn() {
            s.push('S');
        }
        if self.is_fin() {
            s.push('F');
        }
        if self.is_ack() {
            s.push('.');
        }
        s.push(']');

        write!(f, "{}", s)
    }
}

/// Represents a TCP segment observed on the wire.
#[derive(Clone, Debug)]
pub struct PacketObservation {
    captured_at: Instant,
    wall_time: SystemTime,
    src: SocketAddr,
    dst: SocketAddr,
    flags: Flags,
    sequence: u32,
    acknowledgement: Option<u32>,
    window: u16,
    payload_len: u32,
}

impl PacketObservation {
    /// Creates a new `PacketObservation` captured now. The acknowledgement number is kept only if
    /// the ACK flag is set.
    pub fn new(
        src: SocketAddr,
        dst: SocketAddr,
        flags: Flags,
        sequence: u32,
        acknowledgement: Option<u32>,
        window: u16,
        payload_len: u32,
    ) -> PacketObservation {
        PacketObservation {
            captured_at: Instant::now(),
            wall_time: SystemTime::now(),
            src,
            dst,
            flags,
            sequence,
            acknowledgement: if flags.is_ack() {
                acknowledgement
            } else {
                None
            },
            window,
            payload_len,
        }
    }

    /// Sets the capture time of the `PacketObservation`.
    pub fn with_capture_time(mut self, captured_at: Instant, wall_time: SystemTime) -> Self {
        self.captured_at = captured_at;
        self.wall_time = wall_time;
        self
    }

    /// Sets the monotonic capture time of the `PacketObservation`, keeping its wall-clock time.
    pub fn at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Returns the monotonic time the segment was captured.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Returns the wall-clock time the segment was captured.
    pub fn wall_time(&self) -> SystemTime {
        self.wall_time
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

    /// Returns the acknowledgement number, which exists only if the ACK flag is set.
    pub fn acknowledgement(&self) -> Option<u32> {
        self.acknowledgement
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn payload_len(&self) -> u32 {
        self.payload_len
    }

    /// Returns the length of sequence space the segment occupies, counting SYN and FIN.
    pub fn segment_len(&self) -> u32 {
        let mut len = self.payload_len;
        if self.flags.is_syn() {
            len = len.saturating_add(1);
        }
        if self.flags.is_fin() {
            len = len.saturating_add(1);
        }

        len
    }

    /// Returns the sequence after the segment.
    pub fn sequence_end(&self) -> u32 {
        crate::tcp::seq_add(self.sequence, self.segment_len())
    }
}

impl Display for PacketObservation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut fragments = Vec::new();
        fragments.push(format!("seq = {}", self.sequence));
        if let Some(ack) = self.acknowledgement {
            fragments.push(format!("ack = {}", ack));
        }
        fragments.push(format!("wnd = {}", self.window));
        if self.payload_len > 0 {
            fragments.push(format!("len = {}", self.payload_len));
        }

        write!(
            f,
            "TCP {} -> {} {} {}",
            self.src,
            self.dst,
            self.flags,
            fragments.join(", ")
        )
    }
}

#[test]
fn flags_display() {
    assert_eq!((Flags::SYN | Flags::ACK).to_string(), "[S.]");
    assert_eq!((Flags::PSH | Flags::ACK).to_string(), "[P.]");
    assert_eq!(Flags::RST.to_string(), "[R]");
}

#[test]
fn observation_ack_requires_flag() {
    let src = "10.0.0.1:1000".parse().unwrap();
    let dst = "10.0.0.2:80".parse().unwrap();

    let syn = PacketObservation::new(src, dst, Flags::SYN, 100, Some(0), 64240, 0);
    assert_eq!(syn.acknowledgement(), None);
    assert_eq!(syn.segment_len(), 1);
    assert_eq!(syn.sequence_end(), 101);

    let ack = PacketObservation::new(src, dst, Flags::ACK, 101, Some(501), 64240, 10);
    assert_eq!(ack.acknowledgement(), Some(501));
    assert_eq!(ack.sequence_end(), 111);
}
