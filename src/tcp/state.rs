//! Support for inferring the TCP state of connections from observed segments.

use std::fmt::{self, Display, Formatter};

use super::seq_ge;
use crate::packet::PacketObservation;
use crate::store::Direction;

/// Represents the state of a TCP connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TcpState {
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
    Closed,
    Unknown,
}

impl TcpState {
    /// Converts a state code of the Linux kernel into a `TcpState`. Listening sockets are not
    /// connections and convert to `None`.
    pub fn from_kernel(code: u8) -> Option<TcpState> {
        match code {
            0x01 => Some(TcpState::Established),
            0x02 => Some(TcpState::SynSent),
            0x03 => Some(TcpState::SynReceived),
            0x04 => Some(TcpState::FinWait1),
            0x05 => Some(TcpState::FinWait2),
            0x06 => Some(TcpState::TimeWait),
            0x07 => Some(TcpState::Closed),
            0x08 => Some(TcpState::CloseWait),
            0x09 => Some(TcpState::LastAck),
            0x0B => Some(TcpState::Closing),
            0x0C => Some(TcpState::SynReceived),
            _ => None,
        }
    }

    /// Returns the conventional name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Closed => "CLOSED",
            TcpState::Unknown => "UNKNOWN",
        }
    }
}

impl Default for TcpState {
    fn default() -> Self {
        TcpState::Unknown
    }
}

impl Display for TcpState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Represents the inferred state of a TCP connection seen from the outside.
///
/// Segments sent by the initiator are outbound. The initiator is the sender of the first
/// SYN-only segment, the receiver of a SYN+ACK seen first, or otherwise the sender of the first
/// segment seen.
#[derive(Clone, Debug, Default)]
pub struct StateMachine {
    state: TcpState,
    initiator: Option<Direction>,
    fins: [Option<u32>; 2],
}

impl StateMachine {
    /// Creates a new `StateMachine` in the unknown state.
    pub fn new() -> StateMachine {
        StateMachine::default()
    }

    /// Advances the state with a segment sent in the given direction. Returns the state after.
    pub fn advance(&mut self, direction: Direction, segment: &PacketObservation) -> TcpState {
        let flags = segment.flags();

        if flags.is_rst() {
            self.state = TcpState::Closed;
            return self.state;
        }

        let is_syn_only = flags.is_syn() && !flags.is_ack();
        let restarts = match self.state {
            TcpState::Unknown | TcpState::Closed | TcpState::TimeWait => is_syn_only,
            _ => false,
        };
        if restarts {
            self.initiator = Some(direction);
            self.fins = [None; 2];
            self.state = TcpState::SynSent;
            return self.state;
        }

        if flags.is_fin() {
            self.fins[direction.index()] = Some(segment.sequence_end());
        }

        let initiator = *self.initiator.get_or_insert(if flags.is_syn() {
            direction.reverse()
        } else {
            direction
        });
        let is_outbound = direction == initiator;
        let acks_fin = self.acks_fin(direction, segment);

        self.state = match self.state {
            TcpState::Unknown if flags.is_syn() => TcpState::SynReceived,
            TcpState::Unknown | TcpState::Established if flags.is_fin() => {
                if is_outbound {
                    TcpState::FinWait1
                } else {
                    TcpState::CloseWait
                }
            }
            TcpState::Unknown => TcpState::Established,
            TcpState::SynSent if !is_outbound && flags.is_syn() => TcpState::SynReceived,
            TcpState::SynSent if is_outbound && flags.is_ack() => TcpState::Established,
            TcpState::SynSent if !is_outbound && segment.payload_len() > 0 => {
                TcpState::Established
            }
            TcpState::SynReceived if flags.is_fin() => {
                if is_outbound {
                    TcpState::FinWait1
                } else {
                    TcpState::CloseWait
                }
            }
            TcpState::SynReceived if !flags.is_syn() && flags.is_ack() => TcpState::Established,
            TcpState::FinWait1 if !is_outbound && flags.is_fin() => {
                if acks_fin {
                    TcpState::TimeWait
                } else {
                    TcpState::Closing
                }
            }
            TcpState::FinWait1 if !is_outbound && acks_fin => TcpState::FinWait2,
            TcpState::FinWait2 if !is_outbound && flags.is_fin() => TcpState::TimeWait,
            TcpState::CloseWait if is_outbound && flags.is_fin() => TcpState::LastAck,
            TcpState::LastAck if !is_outbound && acks_fin => TcpState::Closed,
            TcpState::Closing if acks_fin => TcpState::Closed,
            TcpState::TimeWait if is_outbound && acks_fin => TcpState::Closed,
            state => state,
        };

        self.state
    }

    // Returns if the segment acknowledges the FIN sent in the other direction.
    fn acks_fin(&self, direction: Direction, segment: &PacketObservation) -> bool {
        match (segment.acknowledgement(), self.fins[direction.reverse().index()]) {
            (Some(ack), Some(fin)) => seq_ge(ack, fin),
            _ => false,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Returns the direction of the initiator, if known.
    pub fn initiator(&self) -> Option<Direction> {
        self.initiator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Flags;
    use std::net::SocketAddr;

    fn client() -> SocketAddr {
        "10.0.0.1:40000".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "10.0.0.2:443".parse().unwrap()
    }

    // Client is the lower endpoint, so outbound segments are lower to upper.
    fn from_client(flags: Flags, seq: u32, ack: u32, len: u32) -> (Direction, PacketObservation) {
        let segment = PacketObservation::new(client(), server(), flags, seq, Some(ack), 65535, len);
        (Direction::LowerToUpper, segment)
    }

    fn from_server(flags: Flags, seq: u32, ack: u32, len: u32) -> (Direction, PacketObservation) {
        let segment = PacketObservation::new(server(), client(), flags, seq, Some(ack), 65535, len);
        (Direction::UpperToLower, segment)
    }

    fn run(machine: &mut StateMachine, segment: (Direction, PacketObservation)) -> TcpState {
        machine.advance(segment.0, &segment.1)
    }

    fn handshake(machine: &mut StateMachine) {
        assert_eq!(
            run(machine, from_client(Flags::SYN, 100, 0, 0)),
            TcpState::SynSent
        );
        assert_eq!(
            run(machine, from_server(Flags::SYN | Flags::ACK, 500, 101, 0)),
            TcpState::SynReceived
        );
        assert_eq!(
            run(machine, from_client(Flags::ACK, 101, 501, 0)),
            TcpState::Established
        );
    }

    #[test]
    fn state_handshake() {
        let mut machine = StateMachine::new();
        handshake(&mut machine);
        assert_eq!(machine.initiator(), Some(Direction::LowerToUpper));
    }

    #[test]
    fn state_active_close() {
        let mut machine = StateMachine::new();
        handshake(&mut machine);

        let fin = Flags::FIN | Flags::ACK;
        assert_eq!(
            run(&mut machine, from_client(fin, 101, 501, 0)),
            TcpState::FinWait1
        );
        assert_eq!(
            run(&mut machine, from_server(Flags::ACK, 501, 102, 0)),
            TcpState::FinWait2
        );
        assert_eq!(
            run(&mut machine, from_server(fin, 501, 102, 0)),
            TcpState::TimeWait
        );
        assert_eq!(
            run(&mut machine, from_client(Flags::ACK, 102, 502, 0)),
            TcpState::Closed
        );
    }

    #[test]
    fn state_passive_close() {
        let mut machine = StateMachine::new();
        handshake(&mut machine);

        let fin = Flags::FIN | Flags::ACK;
        assert_eq!(
            run(&mut machine, from_server(fin, 501, 101, 0)),
            TcpState::CloseWait
        );
        assert_eq!(
            run(&mut machine, from_client(Flags::ACK, 101, 502, 0)),
            TcpState::CloseWait
        );
        assert_eq!(
            run(&mut machine, from_client(fin, 101, 502, 0)),
            TcpState::LastAck
        );
        assert_eq!(
            run(&mut machine, from_server(Flags::ACK, 502, 102, 0)),
            TcpState::Closed
        );
    }

    #[test]
    fn state_simultaneous_close() {
        let mut machine = StateMachine::new();
        handshake(&mut machine);

        let fin = Flags::FIN | Flags::ACK;
        run(&mut machine, from_client(fin, 101, 501, 0));
        assert_eq!(
            run(&mut machine, from_server(fin, 501, 101, 0)),
            TcpState::Closing
        );
        assert_eq!(
            run(&mut machine, from_server(Flags::ACK, 502, 102, 0)),
            TcpState::Closed
        );
    }

    #[test]
    fn state_reset() {
        let mut machine = StateMachine::new();
        handshake(&mut machine);
        assert_eq!(
            run(&mut machine, from_server(Flags::RST, 501, 0, 0)),
            TcpState::Closed
        );
    }

    #[test]
    fn state_mid_stream() {
        let mut machine = StateMachine::new();
        assert_eq!(
            run(&mut machine, from_server(Flags::ACK | Flags::PSH, 9000, 300, 100)),
            TcpState::Established
        );
        assert_eq!(machine.initiator(), Some(Direction::UpperToLower));
    }

    #[test]
    fn state_syn_ack_first() {
        let mut machine = StateMachine::new();
        assert_eq!(
            run(&mut machine, from_server(Flags::SYN | Flags::ACK, 500, 101, 0)),
            TcpState::SynReceived
        );
        assert_eq!(machine.initiator(), Some(Direction::LowerToUpper));
        assert_eq!(
            run(&mut machine, from_client(Flags::ACK, 101, 501, 0)),
            TcpState::Established
        );
    }

    #[test]
    fn state_reuse_after_close() {
        let mut machine = StateMachine::new();
        handshake(&mut machine);
        run(&mut machine, from_client(Flags::RST, 101, 0, 0));

        assert_eq!(
            run(&mut machine, from_server(Flags::SYN, 7000, 0, 0)),
            TcpState::SynSent
        );
        assert_eq!(machine.initiator(), Some(Direction::UpperToLower));
    }

    #[test]
    fn state_from_kernel() {
        assert_eq!(TcpState::from_kernel(0x01), Some(TcpState::Established));
        assert_eq!(TcpState::from_kernel(0x06), Some(TcpState::TimeWait));
        assert_eq!(TcpState::from_kernel(0x0A), None);
        assert_eq!(TcpState::TimeWait.to_string(), "TIME_WAIT");
    }
}
