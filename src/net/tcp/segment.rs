//! Outbound segments

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::trace;

use super::{TcpSocketId, TcpState};
use crate::config::TCP_MSS;
use crate::error::Result;
use crate::net::checksum;
use crate::net::header::{Header, TcpHeader, flags};
use crate::net::stack::StackState;

/// Maximum segment size option
const OPTION_MSS: u8 = 2;

/// What a transmission attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Fired {
    /// Nothing to send
    Idle,
    Sent,
    /// TIME-WAIT ran out and the socket is gone
    Deleted,
}

/// Control bits in tcpdump's notation
pub(super) struct Flags(pub u16);

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, char); 6] = [
            (flags::SYN, 'S'),
            (flags::FIN, 'F'),
            (flags::RST, 'R'),
            (flags::PSH, 'P'),
            (flags::ACK, '.'),
            (flags::URG, 'U'),
        ];
        for (flag, name) in NAMES {
            if self.0 & flag != 0 {
                write!(f, "{}", name)?;
            }
        }
        Ok(())
    }
}

impl StackState {
    /// Build and send one segment from `id` to its peer
    ///
    /// The ack field always carries the next byte we expect, which also
    /// becomes the last acknowledgement we sent.
    fn tcp_transmit(
        &mut self,
        id: TcpSocketId,
        seq: u32,
        bits: u16,
        options: Vec<u8>,
        data: &[u8],
    ) -> Result<()> {
        let socket = self.tcp_socket_mut(id)?;
        let iface = socket.bound_iface()?;
        let ack = socket.inbound.seq;
        socket.inbound.ack = ack;
        let header = TcpHeader {
            src_port: socket.local_port,
            dest_port: socket.remote_port,
            seq,
            ack,
            flags: bits,
            window: socket.window(),
            checksum: 0,
            urgent: 0,
            options,
        };
        let (local_port, dest, remote_port) =
            (socket.local_port, socket.remote_addr, socket.remote_port);
        let src = self.ifaces.get(iface)?.address();

        let mut packet = self.alloc_packet()?;
        packet.set_src(src);
        packet.set_dest(dest);
        let slot = packet.append_header(&Header::Tcp(header))?;
        packet.set_data_len(data.len())?;
        packet.data_mut()?[..data.len()].copy_from_slice(data);
        checksum::fill(&mut packet, &slot)?;

        trace!(
            "[TCP] {} -> {}:{} [{}] seq={} ack={} len={}",
            local_port,
            dest,
            remote_port,
            Flags(bits),
            seq,
            ack,
            data.len()
        );
        self.ip_send(packet)
    }

    /// A segment without data; SYNs carry our maximum segment size
    pub(super) fn tcp_send_control(&mut self, id: TcpSocketId, bits: u16, seq: u32) -> Result<()> {
        let options = if bits & flags::SYN != 0 {
            let mss = TCP_MSS.to_be_bytes();
            vec![OPTION_MSS, 4, mss[0], mss[1]]
        } else {
            Vec::new()
        };
        self.tcp_transmit(id, seq, bits, options, &[])
    }

    /// Send whatever the socket owes its peer
    ///
    /// Handshaking sockets resend their SYN. Otherwise one segment goes out
    /// with as much unacknowledged data as the peer's window and one
    /// maximum segment allow, FIN set once all of it fits. Nothing is sent
    /// when there is no data, no FIN and no acknowledgement pending.
    pub(super) fn tcp_fire(&mut self, id: TcpSocketId) -> Result<Fired> {
        let socket = self.tcp_socket(id)?;
        let handshake_seq = socket.outbound.seq.wrapping_sub(1);
        match socket.state {
            TcpState::TimeWait => {
                self.tcp_delete(id);
                return Ok(Fired::Deleted);
            }
            TcpState::Listen | TcpState::Closed => return Ok(Fired::Idle),
            TcpState::SynSent => {
                self.tcp_send_control(id, flags::SYN, handshake_seq)?;
                return Ok(Fired::Sent);
            }
            TcpState::SynReceived => {
                self.tcp_send_control(id, flags::SYN | flags::ACK, handshake_seq)?;
                return Ok(Fired::Sent);
            }
            _ => {}
        }

        let wants_fin = socket.state.sends_fin() && !socket.fin_acked;
        let pending = socket.outbound.len();
        if pending == 0 && socket.inbound.seq == socket.inbound.ack && !wants_fin {
            return Ok(Fired::Idle);
        }

        // A closed window is probed with a single byte.
        let len = pending
            .min((socket.remote_window as usize).max(1))
            .min(TCP_MSS as usize);
        let mut data = vec![0; len];
        socket.outbound.peek(&mut data);
        let fin = wants_fin && len == pending;

        let mut bits = flags::ACK;
        if len > 0 {
            bits |= flags::PSH;
        }
        if fin {
            bits |= flags::FIN;
        }
        let seq = socket.outbound.seq;
        self.tcp_transmit(id, seq, bits, Vec::new(), &data)?;
        if fin {
            self.tcp_socket_mut(id)?.fin_sent = true;
        }
        Ok(Fired::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_flags_display() {
        assert_eq!(Flags(flags::SYN | flags::ACK).to_string(), "S.");
        assert_eq!(Flags(flags::FIN | flags::PSH | flags::ACK).to_string(), "FP.");
    }
}
