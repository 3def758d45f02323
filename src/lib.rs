use env_logger::fmt::Color;
use log::{trace, Level, LevelFilter};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};
use structopt::StructOpt;

pub mod args;
pub mod kernel;
pub mod packet;
pub mod pcap;
pub mod stat;
pub mod store;
pub mod tcp;

pub use kernel::{KernelHint, KernelStateSource, ProcNetTcp, SourceKind, SsTcpInfo};
pub use packet::{Flags, PacketObservation};
pub use pcap::Interface;
pub use store::{
    Connection, ConnectionKey, ConnectionStore, Direction, PacketSummary, Snapshot, StoreConfig,
};
pub use tcp::state::TcpState;

/// Parses arguments and returns a `Flags`.
pub fn parse() -> args::Flags {
    args::Flags::from_args()
}

/// Sets the logger.
pub fn set_logger(flags: &args::Flags) {
    let level = match &flags.vverbose {
        true => LevelFilter::Trace,
        false => match flags.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        },
    };
    env_logger::builder()
        .filter_level(level)
        .format(|buf, record| {
            let mut style = buf.style();

            let level = match &record.level() {
                Level::Error => style.set_bold(true).set_color(Color::Red).value("error: "),
                Level::Warn => style
                    .set_bold(true)
                    .set_color(Color::Yellow)
                    .value("warning: "),
                Level::Info => style.set_bold(true).set_color(Color::Green).value(""),
                _ => style.set_color(Color::Rgb(165, 165, 165)).value(""),
            };
            writeln!(buf, "{}{}", level, record.args())
        })
        .init();
}

/// Validates arguments and returns an `Opts`.
pub fn validate(flags: &args::Flags) -> Result<args::Opts, String> {
    args::Opts::validate(flags)
}

/// Gets a list of available network interfaces for the current machine. Loopback interfaces are
/// excluded.
pub fn interfaces() -> Vec<Interface> {
    pcap::interfaces()
        .into_iter()
        .filter(|inter| !inter.is_loopback())
        .collect()
}

/// Gets an available network interface match the name. Loopback interfaces can only be matched
/// by name.
pub fn interface(name: Option<String>) -> Result<Interface, String> {
    match name {
        Some(name) => pcap::interfaces()
            .into_iter()
            .find(|inter| inter.name() == name)
            .ok_or_else(|| format!("unknown interface {}", name)),
        None => {
            let mut inters = interfaces();
            match inters.len() {
                0 => Err(String::from("no available interface")),
                1 => Ok(inters.remove(0)),
                _ => Err(String::from("multiple available interfaces")),
            }
        }
    }
}

/// Captures segments from the receiver into the store until stopped. The receiver must be opened
/// with a read timeout so the stop flag is checked periodically.
pub fn capture(
    rx: &mut pcap::Receiver,
    is_raw_ip: bool,
    store: &ConnectionStore,
    capture_stat: &stat::Capture,
    is_stopped: &AtomicBool,
) -> io::Result<()> {
    while !is_stopped.load(Ordering::Relaxed) {
        match rx.next() {
            Ok(frame) => {
                let (captured_at, wall_time) = (Instant::now(), SystemTime::now());
                let observation = if is_raw_ip {
                    packet::decode_ip(frame, captured_at, wall_time)
                } else {
                    packet::decode(frame, captured_at, wall_time)
                };
                capture_stat.add(observation.is_some());

                if let Some(observation) = observation {
                    trace!("receive from pcap: {}", observation);
                    store.record_packet(observation);
                }
            }
            Err(ref e) => {
                if e.kind() != io::ErrorKind::TimedOut {
                    return Err(io::Error::new(e.kind(), format!("handle pcap: {}", e)));
                }
            }
        }
    }

    Ok(())
}
