//! Support for handling pcap interfaces.

use ipnetwork::IpNetwork;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, MacAddr};
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::IpAddr;
use std::time::Duration;

/// Represents the receive half of a pcap device.
pub type Receiver = Box<dyn DataLinkReceiver>;

/// Represents the buffer size of pcap channels.
const BUFFER_SIZE: usize = 256 * 1024;
/// Represents the timeout of a single receive, so a capture loop can be stopped.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Represents a network interface and its associated addresses.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Interface {
    name: String,
    hardware_addr: Option<MacAddr>,
    ip_addrs: Vec<IpAddr>,
    is_up: bool,
    is_loopback: bool,
}

impl Interface {
    /// Constructs a new empty `Interface`.
    pub fn new() -> Interface {
        Interface::default()
    }

    /// Opens the network interface for receiving data.
    pub fn open(&self) -> io::Result<Receiver> {
        let inters = datalink::interfaces();
        let inter = inters
            .into_iter()
            .find(|current_inter| current_inter.name == self.name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "interface not found"))?;

        let config = Config {
            write_buffer_size: BUFFER_SIZE,
            read_buffer_size: BUFFER_SIZE,
            read_timeout: Some(READ_TIMEOUT),
            ..Config::default()
        };
        match datalink::channel(&inter, config)? {
            Channel::Ethernet(_, rx) => Ok(rx),
            _ => Err(io::Error::new(io::ErrorKind::Other, "unknown link type")),
        }
    }

    /// Returns the name of the interface.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the hardware address of the interface.
    pub fn hardware_addr(&self) -> Option<MacAddr> {
        self.hardware_addr
    }

    /// Returns the IP addresses of the interface.
    pub fn ip_addrs(&self) -> &[IpAddr] {
        &self.ip_addrs
    }

    /// Returns if frames received from the interface are raw IP packets without a link header.
    pub fn is_raw_ip(&self) -> bool {
        self.hardware_addr.is_none()
    }

    /// Returns if the interface is up.
    pub fn is_up(&self) -> bool {
        self.is_up
    }

    /// Returns if the interface is a loopback interface.
    pub fn is_loopback(&self) -> bool {
        self.is_loopback
    }
}

impl Display for Interface {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let hardware_addr = match self.hardware_addr {
            Some(hardware_addr) => format!(" [{}]", hardware_addr),
            None => String::new(),
        };

        let ip_addrs = self
            .ip_addrs
            .iter()
            .map(|ip_addr| ip_addr.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let mut flags = String::new();
        if self.is_loopback {
            flags = String::from(" (Loopback)");
        }

        write!(f, "{}{}{}: {}", self.name, hardware_addr, flags, ip_addrs)
    }
}

/// Gets a list of available network interfaces for the current machine.
pub fn interfaces() -> Vec<Interface> {
    datalink::interfaces()
        .iter()
        .filter_map(|inter| {
            let ip_addrs: Vec<IpAddr> = inter
                .ips
                .iter()
                .map(|ip| match ip {
                    IpNetwork::V4(ipv4) => IpAddr::V4(ipv4.ip()),
                    IpNetwork::V6(ipv6) => IpAddr::V6(ipv6.ip()),
                })
                .filter(|ip| !ip.is_unspecified())
                .collect();

            // Exclude interface without any IP address
            if ip_addrs.is_empty() {
                return None;
            }

            // Loopback frames carry a zero Ethernet header, other interfaces without a hardware
            // address deliver raw IP packets
            let hardware_addr = inter
                .mac
                .filter(|mac| *mac != MacAddr::zero() || inter.is_loopback());

            Some(Interface {
                name: inter.name.clone(),
                hardware_addr,
                ip_addrs,
                is_up: inter.is_up(),
                is_loopback: inter.is_loopback(),
            })
        })
        .collect()
}

#[test]
fn interface_display() {
    let inter = Interface {
        name: String::from("eth0"),
        hardware_addr: Some(MacAddr::new(0x02, 0, 0, 0, 0, 0x01)),
        ip_addrs: vec!["192.168.1.10".parse().unwrap(), "fe80::1".parse().unwrap()],
        is_up: true,
        is_loopback: false,
    };
    assert_eq!(
        inter.to_string(),
        "eth0 [02:00:00:00:00:01]: 192.168.1.10, fe80::1"
    );
    assert!(!inter.is_raw_ip());

    let tun = Interface {
        name: String::from("tun0"),
        ip_addrs: vec!["10.8.0.2".parse().unwrap()],
        ..Interface::new()
    };
    assert_eq!(tun.to_string(), "tun0: 10.8.0.2");
    assert!(tun.is_raw_ip());
}
