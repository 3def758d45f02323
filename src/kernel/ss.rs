//! Support for reading kernel TCP state through `ss`.

use log::trace;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::{unmap, KernelHint, KernelStateSource, Table};
use crate::store::ConnectionKey;
use crate::tcp::state::TcpState;

/// Represents the default program listing sockets.
pub const SS: &str = "ss";

/// Represents a `KernelStateSource` reading the internal TCP information of sockets from `ss -tin`.
///
/// Unlike the tables in `/proc/net`, the information carries the kernel's RTT, RTO and windows.
#[derive(Debug)]
pub struct SsTcpInfo {
    program: PathBuf,
    table: Table,
}

impl SsTcpInfo {
    /// Creates a new `SsTcpInfo` running `ss` from the search path.
    pub fn new() -> SsTcpInfo {
        SsTcpInfo::with_program(PathBuf::from(SS))
    }

    /// Creates a new `SsTcpInfo` running the given program.
    pub fn with_program(program: PathBuf) -> SsTcpInfo {
        SsTcpInfo {
            program,
            table: Table::default(),
        }
    }

    /// Runs the program and replaces the cached table. Returns the number of connections in the
    /// new table.
    pub fn refresh(&self) -> io::Result<usize> {
        let now = Instant::now();

        let output = Command::new(&self.program)
            .arg("-tin")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| {
                io::Error::new(e.kind(), format!("execute {}: {}", self.program.display(), e))
            })?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("execute {}: {}", self.program.display(), output.status),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let table: HashMap<_, _> = parse_ss(&text, now).into_iter().collect();
        let len = self.table.replace(table);
        trace!("refresh kernel TCP information with {} connections", len);

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

impl Default for SsTcpInfo {
    fn default() -> Self {
        SsTcpInfo::new()
    }
}

impl KernelStateSource for SsTcpInfo {
    fn lookup(&self, key: &ConnectionKey) -> Option<KernelHint> {
        self.table.get(key)
    }

    fn refresh(&self) -> io::Result<usize> {
        SsTcpInfo::refresh(self)
    }
}

/// Parses the output of `ss -tin`. Each socket line may be followed by an indented line of
/// internal information. Lines which cannot be parsed are skipped.
pub fn parse_ss(text: &str, observed_at: Instant) -> Vec<(ConnectionKey, KernelHint)> {
    let mut entries = Vec::new();
    let mut current: Option<(ConnectionKey, KernelHint)> = None;
    for line in text.lines() {
        if line.starts_with(char::is_whitespace) {
            if let Some((_, hint)) = current.as_mut() {
                *hint = parse_info(line, *hint);
            }
            continue;
        }

        entries.extend(current.take());
        current = parse_socket(line, observed_at);
    }
    entries.extend(current);

    entries
}

fn parse_socket(line: &str, observed_at: Instant) -> Option<(ConnectionKey, KernelHint)> {
    let mut fields = line.split_whitespace();
    let state = parse_state(fields.next()?)?;
    // Recv-Q and Send-Q
    fields.next()?;
    fields.next()?;
    let local = parse_endpoint(fields.next()?)?;
    let peer = parse_endpoint(fields.next()?)?;

    Some((
        ConnectionKey::new(local, peer),
        KernelHint::new(observed_at).with_state(state),
    ))
}

fn parse_state(s: &str) -> Option<TcpState> {
    match s {
        "ESTAB" => Some(TcpState::Established),
        "SYN-SENT" => Some(TcpState::SynSent),
        "SYN-RECV" => Some(TcpState::SynReceived),
        "FIN-WAIT-1" => Some(TcpState::FinWait1),
        "FIN-WAIT-2" => Some(TcpState::FinWait2),
        "TIME-WAIT" => Some(TcpState::TimeWait),
        "CLOSE" => Some(TcpState::Closed),
        "CLOSE-WAIT" => Some(TcpState::CloseWait),
        "LAST-ACK" => Some(TcpState::LastAck),
        "CLOSING" => Some(TcpState::Closing),
        _ => None,
    }
}

// Endpoints look like 10.0.0.1:443, [::1]:8080 or [fe80::1%eth0]:22.
fn parse_endpoint(s: &str) -> Option<SocketAddr> {
    let (ip, port) = s.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = ip.split('%').next()?.parse().ok()?;

    Some(SocketAddr::new(unmap(ip), port))
}

fn parse_info(line: &str, hint: KernelHint) -> KernelHint {
    line.split_whitespace().fold(hint, |hint, field| {
        let (name, value) = match field.split_once(':') {
            Some(pair) => pair,
            None => return hint,
        };

        match name {
            // Smoothed RTT and its variance
            "rtt" => match value.split('/').next().and_then(parse_millis) {
                Some(srtt) => hint.with_srtt(srtt),
                None => hint,
            },
            "rto" => match parse_millis(value) {
                Some(rto) => hint.with_rto(rto),
                None => hint,
            },
            "cwnd" => match value.parse() {
                Ok(cwnd) => hint.with_cwnd(cwnd),
                Err(_) => hint,
            },
            "ssthresh" => match value.parse() {
                Ok(ssthresh) => hint.with_ssthresh(ssthresh),
                Err(_) => hint,
            },
            _ => hint,
        }
    })
}

fn parse_millis(s: &str) -> Option<Duration> {
    let millis: f64 = s.parse().ok()?;
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }

    Some(Duration::from_nanos((millis * 1_000_000.0).round() as u64))
}
