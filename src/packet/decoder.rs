//! Support for decoding captured frames into TCP segment observations.

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use std::cmp::min;
use std::net::{IpAddr, SocketAddr};
use std::time::{Instant, SystemTime};

use super::{Flags, PacketObservation};

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;

/// Decodes an Ethernet frame. Returns `None` if the frame does not carry a whole TCP segment over
/// IPv4 or IPv6.
pub fn decode(
    frame: &[u8],
    captured_at: Instant,
    wall_time: SystemTime,
) -> Option<PacketObservation> {
    let packet = EthernetPacket::new(frame)?;
    match packet.get_ethertype() {
        EtherTypes::Ipv4 => decode_ipv4(packet.payload(), captured_at, wall_time),
        EtherTypes::Ipv6 => decode_ipv6(packet.payload(), captured_at, wall_time),
        _ => None,
    }
}

/// Decodes a raw IP packet, as captured on interfaces without a link layer.
pub fn decode_ip(
    packet: &[u8],
    captured_at: Instant,
    wall_time: SystemTime,
) -> Option<PacketObservation> {
    match packet.first()? >> 4 {
        4 => decode_ipv4(packet, captured_at, wall_time),
        6 => decode_ipv6(packet, captured_at, wall_time),
        _ => None,
    }
}

fn decode_ipv4(
    buffer: &[u8],
    captured_at: Instant,
    wall_time: SystemTime,
) -> Option<PacketObservation> {
    let packet = Ipv4Packet::new(buffer)?;
    if packet.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    // Fragment
    if packet.get_flags() & Ipv4Flags::MoreFragments != 0 || packet.get_fragment_offset() > 0 {
        return None;
    }

    let header_len = packet.get_header_length() as usize * 4;
    let total_len = packet.get_total_length() as usize;
    if header_len < IPV4_MIN_HEADER_LEN || total_len < header_len || buffer.len() < header_len {
        return None;
    }

    // Frames may be padded past the IP packet, or truncated by the capture
    let segment = &buffer[header_len..min(buffer.len(), total_len)];

    decode_tcp(
        segment,
        total_len - header_len,
        IpAddr::V4(packet.get_source()),
        IpAddr::V4(packet.get_destination()),
        captured_at,
        wall_time,
    )
}

fn decode_ipv6(
    buffer: &[u8],
    captured_at: Instant,
    wall_time: SystemTime,
) -> Option<PacketObservation> {
    let packet = Ipv6Packet::new(buffer)?;
    // Extension headers are not followed
    if packet.get_next_header() != IpNextHeaderProtocols::Tcp {
        return None;
    }

    let payload_len = packet.get_payload_length() as usize;
    let segment = &buffer[IPV6_HEADER_LEN..min(buffer.len(), IPV6_HEADER_LEN + payload_len)];

    decode_tcp(
        segment,
        payload_len,
        IpAddr::V6(packet.get_source()),
        IpAddr::V6(packet.get_destination()),
        captured_at,
        wall_time,
    )
}

fn decode_tcp(
    buffer: &[u8],
    segment_len: usize,
    src: IpAddr,
    dst: IpAddr,
    captured_at: Instant,
    wall_time: SystemTime,
) -> Option<PacketObservation> {
    let packet = TcpPacket::new(buffer)?;

    let header_len = packet.get_data_offset() as usize * 4;
    if header_len < TCP_MIN_HEADER_LEN || header_len > segment_len {
        return None;
    }

    let flags = Flags::from_bits((packet.get_flags() & 0xff) as u8);
    let acknowledgement = if flags.is_ack() {
        Some(packet.get_acknowledgement())
    } else {
        None
    };

    let observation = PacketObservation::new(
        SocketAddr::new(src, packet.get_source()),
        SocketAddr::new(dst, packet.get_destination()),
        flags,
        packet.get_sequence(),
        acknowledgement,
        packet.get_window(),
        (segment_len - header_len) as u32,
    )
    .with_capture_time(captured_at, wall_time);

    Some(observation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ethernet::MutableEthernetPacket;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::ipv6::MutableIpv6Packet;
    use pnet::packet::tcp::{MutableTcpPacket, TcpFlags};
    use std::net::{Ipv4Addr, Ipv6Addr};

    const ETHERNET_HEADER_LEN: usize = 14;

    fn ipv4_frame<F>(payload: &[u8], padding: usize, configure: F) -> Vec<u8>
    where
        F: Fn(&mut MutableTcpPacket),
    {
        let total_len = IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN + payload.len();
        let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + total_len + padding];

        let mut ethernet = MutableEthernetPacket::new(&mut buffer).unwrap();
        ethernet.set_ethertype(EtherTypes::Ipv4);

        let mut ipv4 = MutableIpv4Packet::new(&mut buffer[ETHERNET_HEADER_LEN..]).unwrap();
        ipv4.set_version(4);
        ipv4.set_header_length(5);
        ipv4.set_total_length(total_len as u16);
        ipv4.set_ttl(64);
        ipv4.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ipv4.set_source(Ipv4Addr::new(192, 168, 1, 10));
        ipv4.set_destination(Ipv4Addr::new(93, 184, 216, 34));

        let start = ETHERNET_HEADER_LEN + IPV4_MIN_HEADER_LEN;
        let end = start + TCP_MIN_HEADER_LEN + payload.len();
        let mut tcp = MutableTcpPacket::new(&mut buffer[start..end]).unwrap();
        tcp.set_source(51000);
        tcp.set_destination(443);
        tcp.set_data_offset(5);
        tcp.set_window(29200);
        configure(&mut tcp);
        tcp.set_payload(payload);

        buffer
    }

    #[test]
    fn decode_ipv4_syn() {
        let frame = ipv4_frame(&[], 0, |tcp| {
            tcp.set_flags(TcpFlags::SYN);
            tcp.set_sequence(1000);
            tcp.set_acknowledgement(77);
        });
        let observation = decode(&frame, Instant::now(), SystemTime::now()).unwrap();

        assert_eq!(observation.src(), "192.168.1.10:51000".parse().unwrap());
        assert_eq!(observation.dst(), "93.184.216.34:443".parse().unwrap());
        assert!(observation.flags().is_syn());
        assert_eq!(observation.sequence(), 1000);
        assert_eq!(observation.acknowledgement(), None);
        assert_eq!(observation.window(), 29200);
        assert_eq!(observation.payload_len(), 0);
    }

    #[test]
    fn decode_ipv4_padded_data() {
        let frame = ipv4_frame(&[0xab; 6], 12, |tcp| {
            tcp.set_flags(TcpFlags::ACK | TcpFlags::PSH);
            tcp.set_sequence(5000);
            tcp.set_acknowledgement(9000);
        });
        let observation = decode(&frame, Instant::now(), SystemTime::now()).unwrap();

        assert_eq!(observation.flags(), Flags::ACK | Flags::PSH);
        assert_eq!(observation.acknowledgement(), Some(9000));
        assert_eq!(observation.payload_len(), 6);
    }

    #[test]
    fn decode_ipv4_fragment() {
        let mut frame = ipv4_frame(&[0; 8], 0, |tcp| tcp.set_flags(TcpFlags::ACK));
        {
            let mut ipv4 = MutableIpv4Packet::new(&mut frame[ETHERNET_HEADER_LEN..]).unwrap();
            ipv4.set_flags(Ipv4Flags::MoreFragments);
        }

        assert!(decode(&frame, Instant::now(), SystemTime::now()).is_none());
    }

    #[test]
    fn decode_ipv4_not_tcp() {
        let mut frame = ipv4_frame(&[], 0, |tcp| tcp.set_flags(TcpFlags::ACK));
        {
            let mut ipv4 = MutableIpv4Packet::new(&mut frame[ETHERNET_HEADER_LEN..]).unwrap();
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        }

        assert!(decode(&frame, Instant::now(), SystemTime::now()).is_none());
    }

    #[test]
    fn decode_truncated() {
        let frame = ipv4_frame(&[], 0, |tcp| tcp.set_flags(TcpFlags::ACK));

        assert!(decode(&frame[..30], Instant::now(), SystemTime::now()).is_none());
    }

    #[test]
    fn decode_raw_ipv6() {
        let payload_len = TCP_MIN_HEADER_LEN + 3;
        let mut buffer = vec![0u8; IPV6_HEADER_LEN + payload_len];
        {
            let mut ipv6 = MutableIpv6Packet::new(&mut buffer).unwrap();
            ipv6.set_version(6);
            ipv6.set_payload_length(payload_len as u16);
            ipv6.set_next_header(IpNextHeaderProtocols::Tcp);
            ipv6.set_hop_limit(64);
            ipv6.set_source(Ipv6Addr::LOCALHOST);
            ipv6.set_destination("2001:db8::1".parse().unwrap());
        }
        {
            let mut tcp = MutableTcpPacket::new(&mut buffer[IPV6_HEADER_LEN..]).unwrap();
            tcp.set_source(8080);
            tcp.set_destination(33000);
            tcp.set_data_offset(5);
            tcp.set_flags(TcpFlags::FIN | TcpFlags::ACK);
            tcp.set_sequence(42);
            tcp.set_acknowledgement(43);
        }
        let observation = decode_ip(&buffer, Instant::now(), SystemTime::now()).unwrap();

        assert_eq!(observation.src(), "[::1]:8080".parse().unwrap());
        assert!(observation.flags().is_fin());
        assert_eq!(observation.acknowledgement(), Some(43));
        assert_eq!(observation.payload_len(), 3);
    }
}
