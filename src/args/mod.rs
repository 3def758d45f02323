//! Support for parsing and validating command line arguments.

use clap::AppSettings;
use std::time::Duration;
use structopt::StructOpt;

use crate::kernel::SourceKind;
use crate::store::StoreConfig;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "tcpscope",
    about = "Track TCP connections and infer their performance from captured packets.",
    setting = AppSettings::ColoredHelp
)]
pub struct Flags {
    #[structopt(
        long,
        short,
        parse(from_occurrences),
        help = "Prints verbose information, repeat to print segment details"
    )]
    pub verbose: u8,
    #[structopt(long, help = "Prints verbose information with segment details")]
    pub vverbose: bool,
    #[structopt(
        long = "interface",
        short = "i",
        help = "Interface for listening",
        value_name = "INTERFACE"
    )]
    pub inter: Option<String>,
    #[structopt(
        long = "max-connections",
        help = "Maximum number of tracked connections",
        value_name = "COUNT",
        default_value = "4096"
    )]
    pub max_connections: usize,
    #[structopt(
        long = "packet-buffer",
        help = "Number of latest packets kept across all connections",
        value_name = "COUNT",
        default_value = "1000"
    )]
    pub packet_buffer: usize,
    #[structopt(
        long = "recent-packets",
        help = "Number of latest packets kept per connection",
        value_name = "COUNT",
        default_value = "10"
    )]
    pub recent_packets: usize,
    #[structopt(
        long = "idle-timeout",
        help = "Seconds before an idle connection is evicted",
        value_name = "SECONDS",
        default_value = "300"
    )]
    pub idle_timeout: u64,
    #[structopt(
        long = "report-interval",
        help = "Milliseconds between connection reports",
        value_name = "MILLISECONDS",
        default_value = "1000"
    )]
    pub report_interval: u64,
    #[structopt(long = "kernel-hints", help = "Reads TCP state from the kernel")]
    pub kernel_hints: bool,
    #[structopt(
        long = "kernel-source",
        help = "Source of kernel TCP state",
        value_name = "SOURCE",
        possible_values = &["proc", "ss"],
        default_value = "proc"
    )]
    pub kernel_source: SourceKind,
    #[structopt(
        long = "kernel-interval",
        help = "Milliseconds between reads of kernel TCP state",
        value_name = "MILLISECONDS",
        default_value = "1000"
    )]
    pub kernel_interval: u64,
}

pub struct Opts {
    pub inter: Option<String>,
    pub store: StoreConfig,
    pub report_interval: Duration,
    pub kernel_hints: bool,
    pub kernel_source: SourceKind,
    pub kernel_interval: Duration,
}

impl Opts {
    /// Validates flags and creates a new `Opts`.
    pub fn validate(flags: &Flags) -> Result<Opts, String> {
        if flags.max_connections == 0 {
            return Err(format!(
                "validate max connections {}: {}",
                flags.max_connections, "zero capacity"
            ));
        }
        if flags.recent_packets == 0 {
            return Err(format!(
                "validate recent packets {}: {}",
                flags.recent_packets, "zero capacity"
            ));
        }
        if flags.idle_timeout == 0 {
            return Err(format!(
                "validate idle timeout {}: {}",
                flags.idle_timeout, "zero duration"
            ));
        }
        if flags.report_interval == 0 {
            return Err(format!(
                "validate report interval {}: {}",
                flags.report_interval, "zero duration"
            ));
        }
        if flags.kernel_hints && flags.kernel_interval == 0 {
            return Err(format!(
                "validate kernel interval {}: {}",
                flags.kernel_interval, "zero duration"
            ));
        }
        if let Some(inter) = &flags.inter {
            if inter.is_empty() {
                return Err(String::from("validate interface: empty name"));
            }
        }

        let store = StoreConfig {
            max_connections: flags.max_connections,
            packet_buffer: flags.packet_buffer,
            recent_packets: flags.recent_packets,
            idle_timeout: Duration::from_secs(flags.idle_timeout),
            ..StoreConfig::default()
        };

        Ok(Opts {
            inter: flags.inter.clone(),
            store,
            report_interval: Duration::from_millis(flags.report_interval),
            kernel_hints: flags.kernel_hints,
            kernel_source: flags.kernel_source,
            kernel_interval: Duration::from_millis(flags.kernel_interval),
        })
    }
}

#[test]
fn validate_defaults() {
    let flags = Flags::from_iter(vec!["tcpscope"]);
    let opts = Opts::validate(&flags).unwrap();

    assert_eq!(opts.inter, None);
    assert_eq!(opts.store, StoreConfig::default());
    assert_eq!(opts.report_interval, Duration::from_secs(1));
    assert!(!opts.kernel_hints);
    assert_eq!(opts.kernel_source, SourceKind::Proc);
}

#[test]
fn validate_flags() {
    let flags = Flags::from_iter(vec![
        "tcpscope",
        "-i",
        "eth0",
        "-v",
        "--max-connections",
        "16",
        "--idle-timeout",
        "60",
        "--kernel-hints",
        "--kernel-source",
        "ss",
    ]);
    assert_eq!(flags.verbose, 1);
    let opts = Opts::validate(&flags).unwrap();

    assert_eq!(opts.inter, Some(String::from("eth0")));
    assert_eq!(opts.store.max_connections, 16);
    assert_eq!(opts.store.idle_timeout, Duration::from_secs(60));
    assert!(opts.kernel_hints);
    assert_eq!(opts.kernel_source, SourceKind::Ss);
}

#[test]
fn validate_zero_capacity() {
    let flags = Flags::from_iter(vec!["tcpscope", "--max-connections", "0"]);
    assert!(Opts::validate(&flags).is_err());

    let flags = Flags::from_iter(vec!["tcpscope", "--report-interval", "0"]);
    assert!(Opts::validate(&flags).is_err());
}

#[test]
fn parse_verbosity() {
    assert_eq!(Flags::from_iter(vec!["tcpscope"]).verbose, 0);
    assert_eq!(Flags::from_iter(vec!["tcpscope", "-vv"]).verbose, 2);
    assert_eq!(Flags::from_iter(vec!["tcpscope", "-v", "-v"]).verbose, 2);
    assert!(Flags::from_iter(vec!["tcpscope", "--vverbose"]).vverbose);
}
