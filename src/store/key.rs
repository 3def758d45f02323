//! Support for identifying connections independently of the direction of their segments.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};

/// Represents the direction of a segment relative to the endpoints of a `ConnectionKey`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    LowerToUpper,
    UpperToLower,
}

impl Direction {
    /// Returns the opposite direction.
    pub fn reverse(self) -> Direction {
        match self {
            Direction::LowerToUpper => Direction::UpperToLower,
            Direction::UpperToLower => Direction::LowerToUpper,
        }
    }

    /// Returns the index of the direction for per-direction arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::LowerToUpper => 0,
            Direction::UpperToLower => 1,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Direction::LowerToUpper => write!(f, "->"),
            Direction::UpperToLower => write!(f, "<-"),
        }
    }
}

/// Represents the identity of a TCP connection. Both directions of a connection share the same
/// key.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionKey {
    lower: SocketAddr,
    upper: SocketAddr,
}

impl ConnectionKey {
    /// Creates a `ConnectionKey` of the segment from `src` to `dst`.
    pub fn new(src: SocketAddr, dst: SocketAddr) -> ConnectionKey {
        ConnectionKey::normalize(src, dst).0
    }

    /// Creates a `ConnectionKey` of the segment from `src` to `dst`, together with the direction
    /// of the segment.
    pub fn normalize(src: SocketAddr, dst: SocketAddr) -> (ConnectionKey, Direction) {
        match compare_endpoint(&src, &dst) {
            Ordering::Greater => (
                ConnectionKey {
                    lower: dst,
                    upper: src,
                },
                Direction::UpperToLower,
            ),
            _ => (
                ConnectionKey {
                    lower: src,
                    upper: dst,
                },
                Direction::LowerToUpper,
            ),
        }
    }

    /// Returns the lower endpoint of the connection.
    pub fn lower(&self) -> SocketAddr {
        self.lower
    }

    /// Returns the upper endpoint of the connection.
    pub fn upper(&self) -> SocketAddr {
        self.upper
    }

    /// Returns the source and destination of a segment sent in the given direction.
    pub fn endpoints(&self, direction: Direction) -> (SocketAddr, SocketAddr) {
        match direction {
            Direction::LowerToUpper => (self.lower, self.upper),
            Direction::UpperToLower => (self.upper, self.lower),
        }
    }

    /// Returns the identifier of the connection, a 16 characters string stable across runs.
    pub fn id(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(endpoint_bytes(&self.lower));
        hasher.update(endpoint_bytes(&self.upper));
        let digest = hasher.finalize();

        URL_SAFE.encode(&digest[..12])
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} <-> {}", self.lower, self.upper)
    }
}

// Orders endpoints by address family, address bytes, then port.
fn compare_endpoint(a: &SocketAddr, b: &SocketAddr) -> Ordering {
    let ip = match (a.ip(), b.ip()) {
        (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Less,
        (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Greater,
        (IpAddr::V4(x), IpAddr::V4(y)) => x.octets().cmp(&y.octets()),
        (IpAddr::V6(x), IpAddr::V6(y)) => x.octets().cmp(&y.octets()),
    };

    ip.then(a.port().cmp(&b.port()))
}

fn endpoint_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut bytes = match addr.ip() {
        IpAddr::V4(ip) => {
            let mut v = vec![4];
            v.extend_from_slice(&ip.octets());
            v
        }
        IpAddr::V6(ip) => {
            let mut v = vec![6];
            v.extend_from_slice(&ip.octets());
            v
        }
    };
    bytes.extend_from_slice(&addr.port().to_be_bytes());

    bytes
}
