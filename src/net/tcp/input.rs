//! Inbound segments and the connection state machine

use log::{debug, info, trace, warn};

use super::segment::Flags;
use super::{TcpSocketId, TcpSocketState, TcpState, seq_lt};
use crate::error::{Error, Result};
use crate::net::checksum;
use crate::net::filter::FilterAction;
use crate::net::header::{HeaderType, TcpHeader, flags};
use crate::net::icmp::unreachable;
use crate::net::iface::IfaceId;
use crate::net::packet::Packet;
use crate::net::stack::StackState;

/// Receive filter installed on every interface with TCP sockets
///
/// Segments for one of our sockets are consumed here; a segment for a port
/// nobody listens on is answered with an ICMP port unreachable.
pub(super) fn tcp_filter(stack: &mut StackState, iface: IfaceId, packet: Packet) -> FilterAction {
    let local = match stack.ifaces.get(iface) {
        Ok(iface) => iface.address(),
        Err(error) => return FilterAction::Error(error),
    };
    if packet.dest() != local {
        return FilterAction::Pass(packet);
    }
    let slot = match packet.seek_header(HeaderType::Tcp) {
        Ok(Some(slot)) => slot,
        Ok(None) => return FilterAction::Pass(packet),
        Err(error) => return FilterAction::Error(error),
    };
    let header = match TcpHeader::decode(slot.bytes(&packet)) {
        Ok(header) => header,
        Err(error) => return FilterAction::Error(error),
    };

    let Some(id) = stack.tcp_seek(iface, header.dest_port, packet.src(), header.src_port) else {
        debug!(
            "[TCP] no socket on port {} for {}:{}",
            header.dest_port,
            packet.src(),
            header.src_port
        );
        if let Err(error) = stack.icmp_send_destination_unreachable(iface, unreachable::PORT, &packet) {
            warn!("[TCP] port unreachable not sent: {}", error);
        }
        return FilterAction::ErrorIcmped;
    };

    match checksum::verify(&packet, &slot) {
        Ok(true) => {}
        Ok(false) => warn!(
            "[TCP] checksum mismatch from {}:{}",
            packet.src(),
            header.src_port
        ),
        Err(error) => warn!("[TCP] checksum of segment from {}: {}", packet.src(), error),
    }
    let data = match packet.data() {
        Ok(data) => data,
        Err(error) => return FilterAction::Error(error),
    };

    match stack.tcp_input(id, iface, &packet, &header, data) {
        Ok(()) => FilterAction::Replied,
        Err(error) => {
            warn!("[TCP] segment from {}:{}: {}", packet.src(), header.src_port, error);
            FilterAction::Error(error)
        }
    }
}

fn trace_options(options: &[u8]) {
    let mut rest = options;
    while let [kind, tail @ ..] = rest {
        match kind {
            0 => break,
            1 => rest = tail,
            _ => {
                let len = tail.first().copied().unwrap_or(0) as usize;
                if len < 2 || len > rest.len() {
                    trace!("[TCP] malformed option {}", kind);
                    break;
                }
                match (kind, &rest[2..len]) {
                    (2, [hi, lo]) => trace!("[TCP] option MSS {}", u16::from_be_bytes([*hi, *lo])),
                    (kind, value) => trace!("[TCP] option {} ({} bytes)", kind, value.len()),
                }
                rest = &rest[len..];
            }
        }
    }
}

impl StackState {
    /// Feed one segment to the socket it belongs to
    fn tcp_input(
        &mut self,
        id: TcpSocketId,
        iface: IfaceId,
        packet: &Packet,
        header: &TcpHeader,
        data: &[u8],
    ) -> Result<()> {
        let time_wait_ticks = self.config.tcp_time_wait_ticks;
        let socket = self.tcp_socket_mut(id)?;
        trace!(
            "[TCP] {}:{} -> {} [{}] seq={} ack={} len={} in {}",
            packet.src(),
            header.src_port,
            header.dest_port,
            Flags(header.flags),
            header.seq,
            header.ack,
            data.len(),
            socket.state
        );
        if let Some(error) = socket.error_that_closed {
            trace!("[TCP] port {} already failed: {}", socket.local_port, error);
            return Ok(());
        }
        if header.has_flag(flags::RST) {
            info!(
                "[TCP] connection {} -> {}:{} reset by peer",
                socket.local_port, socket.remote_addr, socket.remote_port
            );
            socket.error_that_closed = Some(Error::ConnectionResetByPeer);
            return Ok(());
        }
        trace_options(&header.options);
        socket.remote_window = header.window as u32;

        let state = socket.state;
        match state {
            TcpState::Listen => self.tcp_listen_input(id, iface, packet, header),
            TcpState::SynSent => self.tcp_syn_sent_input(id, header),
            TcpState::SynReceived => {
                if !header.has_flag(flags::ACK) {
                    debug!("[TCP] SYN-RECEIVED, segment without ACK");
                    return Ok(());
                }
                if header.ack != socket.outbound.seq {
                    warn!(
                        "[TCP] SYN-RECEIVED, bad ACK {} (expected {})",
                        header.ack, socket.outbound.seq
                    );
                    return Ok(());
                }
                socket.outbound.ack = header.ack;
                socket.state = TcpState::Established;
                info!(
                    "[TCP] connection {} <- {}:{} established",
                    socket.local_port, socket.remote_addr, socket.remote_port
                );
                self.tcp_connected_input(id, header, data)
            }
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing
            | TcpState::LastAck => self.tcp_connected_input(id, header, data),
            TcpState::TimeWait => {
                if header.has_flag(flags::FIN) {
                    // Our last ACK got lost; send it again and start over.
                    socket.ticks_left = time_wait_ticks;
                    let seq = socket.outbound.seq;
                    self.tcp_send_control(id, flags::ACK, seq)?;
                }
                Ok(())
            }
            TcpState::Closed => Ok(()),
        }
    }

    /// A SYN on a listening socket spawns a child in SYN-RECEIVED
    fn tcp_listen_input(
        &mut self,
        id: TcpSocketId,
        iface: IfaceId,
        packet: &Packet,
        header: &TcpHeader,
    ) -> Result<()> {
        if !header.has_flag(flags::SYN) || header.has_flag(flags::ACK) {
            debug!("[TCP] LISTEN, segment is not a SYN");
            return Ok(());
        }
        let listener = self.tcp_socket(id)?;
        if let Some(pending) = listener.waiting_to_accept {
            warn!(
                "[TCP] port {}: {:?} not accepted yet; dropping SYN from {}:{}",
                listener.local_port,
                pending,
                packet.src(),
                header.src_port
            );
            return Ok(());
        }

        let mut child = TcpSocketState::new(&self.config);
        child.state = TcpState::SynReceived;
        child.iface = Some(iface);
        child.local_port = listener.local_port;
        child.remote_addr = packet.src();
        child.remote_port = header.src_port;
        child.remote_window = header.window as u32;
        child.accepted_from = Some(id);
        child.inbound.seq = header.seq.wrapping_add(1);
        child.inbound.ack = header.seq;
        let isn = self.config.isn.generate();
        child.outbound.seq = isn;
        child.outbound.ack = isn.wrapping_sub(1);

        let child_id = self.tcp_sockets.insert(child);
        self.tcp_context_mut(iface)?.sockets.push(child_id);
        if let Err(error) = self.tcp_send_control(child_id, flags::SYN | flags::ACK, isn) {
            self.tcp_delete(child_id);
            return Err(error);
        }
        self.tcp_socket_mut(child_id)?.outbound.seq = isn.wrapping_add(1);
        self.tcp_socket_mut(id)?.waiting_to_accept = Some(child_id);
        debug!(
            "[TCP] SYN from {}:{}, child {:?} in SYN-RECEIVED",
            packet.src(),
            header.src_port,
            child_id
        );
        Ok(())
    }

    fn tcp_syn_sent_input(&mut self, id: TcpSocketId, header: &TcpHeader) -> Result<()> {
        let socket = self.tcp_socket_mut(id)?;
        if !header.has_flag(flags::SYN) {
            debug!("[TCP] SYN-SENT, segment without SYN");
            return Ok(());
        }
        if header.has_flag(flags::ACK) && header.ack != socket.outbound.seq {
            warn!(
                "[TCP] SYN-SENT, bad ACK {} (expected {})",
                header.ack, socket.outbound.seq
            );
            return Ok(());
        }
        socket.inbound.seq = header.seq.wrapping_add(1);
        socket.inbound.ack = header.seq;
        if header.has_flag(flags::ACK) {
            socket.outbound.ack = header.ack;
            socket.state = TcpState::Established;
            info!(
                "[TCP] connection {} -> {}:{} established",
                socket.local_port, socket.remote_addr, socket.remote_port
            );
        } else {
            // Simultaneous open: both sides sent a SYN.
            socket.state = TcpState::SynReceived;
        }
        let seq = socket.outbound.seq;
        self.tcp_send_control(id, flags::ACK, seq)
    }

    /// ACK, data and FIN processing once the connection is synchronized
    fn tcp_connected_input(&mut self, id: TcpSocketId, header: &TcpHeader, data: &[u8]) -> Result<()> {
        let time_wait_ticks = self.config.tcp_time_wait_ticks;
        let socket = self.tcp_socket_mut(id)?;

        if header.has_flag(flags::ACK) {
            socket.record_ack(header.ack);
            if socket.fin_acked {
                match socket.state {
                    TcpState::FinWait1 => socket.state = TcpState::FinWait2,
                    TcpState::Closing => {
                        socket.state = TcpState::TimeWait;
                        socket.ticks_left = time_wait_ticks;
                    }
                    TcpState::LastAck => {
                        self.tcp_delete(id);
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }

        if !data.is_empty() && socket.state.accepts_data() {
            if seq_lt(socket.inbound.seq, header.seq) {
                warn!(
                    "[TCP] segment at {} ahead of {}; out of order delivery not supported",
                    header.seq, socket.inbound.seq
                );
            } else {
                let overlap = socket.inbound.seq.wrapping_sub(header.seq) as usize;
                if overlap < data.len() {
                    match socket.inbound.enqueue(&data[overlap..]) {
                        Ok(n) => socket.inbound.seq = socket.inbound.seq.wrapping_add(n as u32),
                        Err(error) => {
                            warn!("[TCP] port {} receive queue: {}", socket.local_port, error)
                        }
                    }
                }
            }
        }

        // Data is acknowledged even when it was a duplicate or did not fit.
        let mut send_ack = !data.is_empty();
        if header.has_flag(flags::FIN) {
            let fin_seq = header.seq.wrapping_add(data.len() as u32);
            if fin_seq == socket.inbound.seq {
                socket.inbound.seq = socket.inbound.seq.wrapping_add(1);
                match socket.state {
                    TcpState::Established => socket.state = TcpState::CloseWait,
                    TcpState::FinWait1 => socket.state = TcpState::Closing,
                    TcpState::FinWait2 => {
                        socket.state = TcpState::TimeWait;
                        socket.ticks_left = time_wait_ticks;
                    }
                    _ => {}
                }
                debug!(
                    "[TCP] FIN from {}:{}, now {}",
                    socket.remote_addr, socket.remote_port, socket.state
                );
                send_ack = true;
            } else if fin_seq.wrapping_add(1) == socket.inbound.seq {
                // Retransmitted FIN: the peer missed our ACK.
                send_ack = true;
            } else {
                debug!("[TCP] FIN at {} while expecting {}", fin_seq, socket.inbound.seq);
            }
        }

        if send_ack {
            let seq = socket.outbound.seq;
            self.tcp_send_control(id, flags::ACK, seq)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_options_stops_on_garbage() {
        trace_options(&[2, 4, 0x05, 0xb4, 1, 0]);
        trace_options(&[1, 1, 8, 0]);
        trace_options(&[3]);
    }
}
