//! Support for advisory TCP state reported by the kernel.

use log::trace;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::store::ConnectionKey;
use crate::tcp::state::TcpState;

mod ss;
pub use ss::{parse_ss, SsTcpInfo};

/// Represents the TCP state of a connection as reported by the kernel. Any value may be missing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KernelHint {
    state: Option<TcpState>,
    cwnd: Option<u32>,
    ssthresh: Option<u32>,
    srtt: Option<Duration>,
    rto: Option<Duration>,
    observed_at: Instant,
}

impl KernelHint {
    /// Creates a new empty `KernelHint` observed at the given time.
    pub fn new(observed_at: Instant) -> KernelHint {
        KernelHint {
            state: None,
            cwnd: None,
            ssthresh: None,
            srtt: None,
            rto: None,
            observed_at,
        }
    }

    pub fn with_state(mut self, state: TcpState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_cwnd(mut self, cwnd: u32) -> Self {
        self.cwnd = Some(cwnd);
        self
    }

    pub fn with_ssthresh(mut self, ssthresh: u32) -> Self {
        self.ssthresh = Some(ssthresh);
        self
    }

    pub fn with_srtt(mut self, srtt: Duration) -> Self {
        self.srtt = Some(srtt);
        self
    }

    pub fn with_rto(mut self, rto: Duration) -> Self {
        self.rto = Some(rto);
        self
    }

    pub fn state(&self) -> Option<TcpState> {
        self.state
    }

    pub fn cwnd(&self) -> Option<u32> {
        self.cwnd
    }

    pub fn ssthresh(&self) -> Option<u32> {
        self.ssthresh
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rto(&self) -> Option<Duration> {
        self.rto
    }

    /// Returns the time the hint was observed.
    pub fn observed_at(&self) -> Instant {
        self.observed_at
    }

    /// Returns if the hint is no older than `max_age` at `now`.
    pub fn is_fresh(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.observed_at) <= max_age
    }
}

/// Represents a best-effort source of kernel TCP state.
pub trait KernelStateSource: Send + Sync {
    /// Looks up the kernel state of a connection. Returns `None` if the state is unknown.
    fn lookup(&self, key: &ConnectionKey) -> Option<KernelHint>;

    /// Reloads the state from the kernel. Returns the number of known connections.
    ///
    /// Lookups happen on the packet path and should only read cached state, so sources which
    /// cache reload it here, off the packet path.
    fn refresh(&self) -> io::Result<usize> {
        Ok(0)
    }
}

/// Represents the kind of a `KernelStateSource`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// The tables in `/proc/net`, which only carry states.
    Proc,
    /// The internal TCP information printed by `ss`.
    Ss,
}

impl SourceKind {
    /// Creates a source of the kind reading from the default locations.
    pub fn source(self) -> Arc<dyn KernelStateSource> {
        match self {
            SourceKind::Proc => Arc::new(ProcNetTcp::new()),
            SourceKind::Ss => Arc::new(SsTcpInfo::new()),
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proc" => Ok(SourceKind::Proc),
            "ss" => Ok(SourceKind::Ss),
            _ => Err(format!("unknown kernel source {}", s)),
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            SourceKind::Proc => write!(f, "/proc/net/tcp"),
            SourceKind::Ss => write!(f, "ss"),
        }
    }
}

// Represents a cached table of kernel hints which is replaced as a whole.
#[derive(Debug, Default)]
struct Table(RwLock<HashMap<ConnectionKey, KernelHint>>);

impl Table {
    fn replace(&self, table: HashMap<ConnectionKey, KernelHint>) -> usize {
        let len = table.len();
        *self.0.write().expect("kernel TCP table lock poisoned") = table;

        len
    }

    fn get(&self, key: &ConnectionKey) -> Option<KernelHint> {
        self.0
            .read()
            .expect("kernel TCP table lock poisoned")
            .get(key)
            .copied()
    }

    fn len(&self) -> usize {
        self.0.read().expect("kernel TCP table lock poisoned").len()
    }
}

// IPv4 peers of dual stack sockets are printed as IPv4-mapped IPv6 addresses, while the capture
// sees them as IPv4.
fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(ipv6) => match ipv6.octets() {
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, a, b, c, d] => {
                IpAddr::V4(Ipv4Addr::new(a, b, c, d))
            }
            _ => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Represents the default path of the IPv4 TCP table.
pub const PROC_NET_TCP: &str = "/proc/net/tcp";
/// Represents the default path of the IPv6 TCP table.
pub const PROC_NET_TCP6: &str = "/proc/net/tcp6";

/// Represents a `KernelStateSource` reading the TCP tables in `/proc/net`.
///
/// Lookups only read a cached table, which is replaced by `refresh`, so the tables are never read
/// on the packet path.
#[derive(Debug)]
pub struct ProcNetTcp {
    paths: Vec<PathBuf>,
    table: Table,
}

impl ProcNetTcp {
    /// Creates a new `ProcNetTcp` reading the default tables.
    pub fn new() -> ProcNetTcp {
        ProcNetTcp::with_paths(vec![PathBuf::from(PROC_NET_TCP), PathBuf::from(PROC_NET_TCP6)])
    }

    /// Creates a new `ProcNetTcp` reading the given tables.
    pub fn with_paths(paths: Vec<PathBuf>) -> ProcNetTcp {
        ProcNetTcp {
            paths,
            table: Table::default(),
        }
    }

    /// Reads the tables and replaces the cached table. Missing tables are skipped. Returns the
    /// number of connections in the new table.
    pub fn refresh(&self) -> io::Result<usize> {
        let now = Instant::now();

        let mut table = HashMap::new();
        for path in &self.paths {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(io::Error::new(
                        e.kind(),
                        format!("read {}: {}", path.display(), e),
                    ))
                }
            };
            table.extend(parse_table(&text, now));
        }

        let len = self.table.replace(table);
        trace!("refresh kernel TCP table with {} connections", len);

        Ok(len)
    }

    /// Returns the number of connections in the cached table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns if the cached table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcNetTcp {
    fn default() -> Self {
        ProcNetTcp::new()
    }
}

impl KernelStateSource for ProcNetTcp {
    fn lookup(&self, key: &ConnectionKey) -> Option<KernelHint> {
        self.table.get(key)
    }

    fn refresh(&self) -> io::Result<usize> {
        ProcNetTcp::refresh(self)
    }
}

/// Parses the text of a `/proc/net/tcp` or `/proc/net/tcp6` table. Listening sockets and lines
/// which cannot be parsed are skipped.
pub fn parse_table(text: &str, observed_at: Instant) -> Vec<(ConnectionKey, KernelHint)> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let (local, remote, state) = parse_line(line)?;
            let state = TcpState::from_kernel(state)?;
            if remote.port() == 0 {
                return None;
            }

            Some((
                ConnectionKey::new(local, remote),
                KernelHint::new(observed_at).with_state(state),
            ))
        })
        .collect()
}

fn parse_line(line: &str) -> Option<(SocketAddr, SocketAddr, u8)> {
    let mut fields = line.split_whitespace();
    // sl
    fields.next()?;
    let local = parse_address(fields.next()?)?;
    let remote = parse_address(fields.next()?)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;

    Some((local, remote, state))
}

fn parse_address(s: &str) -> Option<SocketAddr> {
    let (ip, port) = s.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match ip.len() {
        8 => IpAddr::V4(Ipv4Addr::from(parse_word(ip)?)),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                chunk.copy_from_slice(&parse_word(ip.get(i * 8..i * 8 + 8)?)?);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(unmap(ip), port))
}

// Words are printed in host byte order, which is little endian on supported platforms.
fn parse_word(s: &str) -> Option<[u8; 4]> {
    let word = u32::from_str_radix(s, 16).ok()?;

    Some(word.to_le_bytes())
}
