//! TCP (RFC 793)
//!
//! A bound socket belongs to an interface. Every interface with TCP
//! sockets carries a [`TcpContext`]: the receive filter that feeds inbound
//! segments to the state machine, and the timer that drives
//! retransmission and TIME-WAIT expiry. The timer service lives in the
//! scheduling context, so the scheduler's own interfaces get no timer and
//! must be ticked by hand with [`StackState::tcp_tick`].
//!
//! Limitations: segments that arrive ahead of the next expected byte are
//! dropped (no reassembly), there is no congestion control, and unacked
//! data is resent from the front on every retransmission tick.

use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use log::{debug, info, warn};

use crate::arena::Handle;
use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::net::addr::Address;
use crate::net::filter::{Filter, FilterId};
use crate::net::header::HeaderType;
use crate::net::iface::IfaceId;
use crate::net::stack::StackState;
use crate::net::udp::{self, UdpSocketId};
use crate::timer::{self, Timer};

mod bytes;
mod input;
mod segment;
mod socket;
mod state;

pub use bytes::{ByteQueue, seq_le, seq_lt};
pub use socket::TcpSocket;
pub use state::TcpState;

pub type TcpSocketId = Handle<TcpSocketState>;

lazy_static! {
    static ref TCP_FILTER: Filter = Arc::new(input::tcp_filter);
}

/// TCP state hung off one interface
pub struct TcpContext {
    timer_socket: Option<UdpSocketId>,
    timer: Option<Timer>,
    sockets: Vec<TcpSocketId>,
    filter: FilterId,
}

impl TcpContext {
    pub fn sockets(&self) -> &[TcpSocketId] {
        &self.sockets
    }

    /// Whether ticks arrive from the timer service
    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

pub struct TcpSocketState {
    state: TcpState,
    /// Set once the peer reset the connection or became unreachable
    error_that_closed: Option<Error>,
    iface: Option<IfaceId>,
    local_port: u16,
    remote_addr: Address,
    remote_port: u16,
    remote_window: u32,
    inbound: ByteQueue,
    outbound: ByteQueue,
    fin_sent: bool,
    fin_acked: bool,
    /// Child handshaking or established, not yet accepted (listeners only)
    waiting_to_accept: Option<TcpSocketId>,
    /// Listener this socket was spawned by
    accepted_from: Option<TcpSocketId>,
    ticks_left: i32,
    retransmit_ticks: i32,
}

impl TcpSocketState {
    fn new(config: &StackConfig) -> Self {
        Self {
            state: TcpState::Closed,
            error_that_closed: None,
            iface: None,
            local_port: 0,
            remote_addr: Address::ZERO,
            remote_port: 0,
            remote_window: 0,
            inbound: ByteQueue::new(config.tcp_queue_size),
            outbound: ByteQueue::new(config.tcp_queue_size),
            fin_sent: false,
            fin_acked: false,
            waiting_to_accept: None,
            accepted_from: None,
            ticks_left: config.tcp_retransmit_ticks,
            retransmit_ticks: config.tcp_retransmit_ticks,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    fn bound_iface(&self) -> Result<IfaceId> {
        match (self.iface, self.local_port) {
            (Some(iface), port) if port != 0 => Ok(iface),
            _ => Err(Error::SocketNotBound),
        }
    }

    /// Receive window we advertise
    fn window(&self) -> u16 {
        self.inbound.room().min(u16::MAX as usize) as u16
    }

    /// Drop whatever the peer's `ack` covers from the outbound queue
    ///
    /// Stale and duplicate acknowledgements change nothing. An ack one past
    /// the last queued byte also covers our FIN once it has been sent.
    fn record_ack(&mut self, ack: u32) {
        let advance = ack.wrapping_sub(self.outbound.seq);
        if advance == 0 || advance >= 0x8000_0000 {
            return;
        }
        let queued = self.outbound.len();
        let advance = advance as usize;
        if advance > queued {
            self.outbound.drop_front(queued);
            self.outbound.seq = self.outbound.seq.wrapping_add(queued as u32);
            if self.fin_sent && advance == queued + 1 {
                self.outbound.seq = self.outbound.seq.wrapping_add(1);
                self.fin_acked = true;
            }
        } else {
            self.outbound.drop_front(advance);
            self.outbound.seq = self.outbound.seq.wrapping_add(advance as u32);
        }
        self.outbound.ack = ack;
    }
}

impl core::fmt::Debug for TcpSocketState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpSocketState")
            .field("state", &self.state)
            .field("local_port", &self.local_port)
            .field("remote_addr", &self.remote_addr)
            .field("remote_port", &self.remote_port)
            .field("in", &self.inbound.len())
            .field("out", &self.outbound.len())
            .finish()
    }
}

impl StackState {
    fn tcp_socket(&self, id: TcpSocketId) -> Result<&TcpSocketState> {
        self.tcp_sockets.get(id).ok_or(Error::InvalidArg)
    }

    fn tcp_socket_mut(&mut self, id: TcpSocketId) -> Result<&mut TcpSocketState> {
        self.tcp_sockets.get_mut(id).ok_or(Error::InvalidArg)
    }

    fn tcp_context_mut(&mut self, iface: IfaceId) -> Result<&mut TcpContext> {
        self.ifaces
            .get_mut(iface)?
            .tcp
            .as_mut()
            .ok_or(Error::DoesNotExist)
    }

    pub fn tcp_context(&self, iface: IfaceId) -> Result<&TcpContext> {
        self.ifaces
            .get(iface)?
            .tcp
            .as_ref()
            .ok_or(Error::DoesNotExist)
    }

    /// Set up TCP on `iface` unless it already is
    ///
    /// Away from the scheduler the context also opens a repeating timer;
    /// its ticks arrive on a private UDP socket.
    fn tcp_init_context(&mut self, iface: IfaceId) -> Result<()> {
        let address = {
            let iface = self.ifaces.get(iface)?;
            if iface.tcp.is_some() {
                return Ok(());
            }
            iface.address()
        };

        let mut timer_socket = None;
        let mut timer = None;
        if address != self.scheduler_address() {
            let socket = self.udp_open();
            let usec = self.config.tcp_timer_usec;
            let opened = match self.udp_bind(socket, Address::ZERO, 0) {
                Ok(_) => Timer::open(self, socket, 0, usec, iface.index(), true),
                Err(error) => Err(error),
            };
            match opened {
                Ok(opened) => {
                    timer_socket = Some(socket);
                    timer = Some(opened);
                }
                Err(error) => {
                    warn!("[TCP] no timer for {}: {}", address, error);
                    let _ = self.udp_close(socket);
                    return Err(error);
                }
            }
        }

        let filter = match self.install_filter(iface, TCP_FILTER.clone()) {
            Ok(filter) => filter,
            Err(error) => {
                if let Some(socket) = timer_socket {
                    let _ = self.udp_close(socket);
                }
                return Err(error);
            }
        };
        self.ifaces.get_mut(iface)?.tcp = Some(TcpContext {
            timer_socket,
            timer,
            sockets: Vec::new(),
            filter,
        });
        debug!(
            "[TCP] context on {} ({})",
            address,
            if timer_socket.is_some() { "timer" } else { "manual ticks" }
        );
        Ok(())
    }

    /// Tear down TCP on `iface`, deleting every socket bound there
    pub(crate) fn tcp_close_context(&mut self, iface: IfaceId) -> Result<()> {
        let Some(context) = self.ifaces.get_mut(iface)?.tcp.take() else {
            return Ok(());
        };
        for id in &context.sockets {
            self.tcp_sockets.remove(*id);
        }
        if let Some(timer) = context.timer {
            let id = timer.id();
            if let Err(error) = timer.close() {
                debug!("[TCP] timer {} left running: {}", id, error);
            }
        }
        if let Some(socket) = context.timer_socket {
            self.udp_close(socket)?;
        }
        self.uninstall_filter(iface, context.filter)?;
        debug!("[TCP] closed context ({} sockets)", context.sockets.len());
        Ok(())
    }

    /// Socket on `iface` bound to `port`, in any state
    fn tcp_seek_port(&self, iface: IfaceId, port: u16) -> Option<TcpSocketId> {
        let context = self.ifaces.get(iface).ok()?.tcp.as_ref()?;
        context.sockets.iter().copied().find(|id| {
            self.tcp_sockets
                .get(*id)
                .is_some_and(|socket| socket.local_port == port)
        })
    }

    /// Socket an inbound segment belongs to
    ///
    /// An exact connection match wins; otherwise a listener on the port.
    fn tcp_seek(
        &self,
        iface: IfaceId,
        local_port: u16,
        remote_addr: Address,
        remote_port: u16,
    ) -> Option<TcpSocketId> {
        let context = self.ifaces.get(iface).ok()?.tcp.as_ref()?;
        let connected = context.sockets.iter().copied().find(|id| {
            self.tcp_sockets.get(*id).is_some_and(|socket| {
                !matches!(socket.state, TcpState::Listen | TcpState::Closed)
                    && socket.local_port == local_port
                    && socket.remote_port == remote_port
                    && socket.remote_addr == remote_addr
            })
        });
        connected.or_else(|| {
            context.sockets.iter().copied().find(|id| {
                self.tcp_sockets.get(*id).is_some_and(|socket| {
                    socket.state == TcpState::Listen && socket.local_port == local_port
                })
            })
        })
    }

    /// Remove a socket for good
    fn tcp_delete(&mut self, id: TcpSocketId) {
        let Some(socket) = self.tcp_sockets.remove(id) else {
            return;
        };
        if let Some(iface) = socket.iface {
            if let Ok(context) = self.tcp_context_mut(iface) {
                context.sockets.retain(|other| *other != id);
            }
        }
        if let Some(listener) = socket.accepted_from.and_then(|l| self.tcp_sockets.get_mut(l)) {
            if listener.waiting_to_accept == Some(id) {
                listener.waiting_to_accept = None;
            }
        }
        debug!(
            "[TCP] deleted {} -> {}:{} in {}",
            socket.local_port, socket.remote_addr, socket.remote_port, socket.state
        );
    }

    /// One timer tick for every socket on `iface`
    ///
    /// Sockets whose countdown runs out transmit (or, in TIME-WAIT,
    /// disappear). A failed transmission is logged and retried next round.
    pub fn tcp_tick(&mut self, iface: IfaceId) -> Result<()> {
        let sockets = match self.ifaces.get(iface)?.tcp.as_ref() {
            Some(context) => context.sockets.clone(),
            None => return Ok(()),
        };
        for id in sockets {
            let Some(socket) = self.tcp_sockets.get_mut(id) else {
                continue;
            };
            if socket.state == TcpState::Listen {
                continue;
            }
            socket.ticks_left -= 1;
            if socket.ticks_left > 0 {
                continue;
            }
            let port = socket.local_port;
            match self.tcp_fire(id) {
                Ok(segment::Fired::Deleted) => continue,
                Ok(_) => {}
                Err(error) => warn!("[TCP] retransmission from port {} failed: {}", port, error),
            }
            if let Some(socket) = self.tcp_sockets.get_mut(id) {
                socket.ticks_left = socket.retransmit_ticks;
            }
        }
        Ok(())
    }

    /// Run the receive path of `iface` until nothing is left
    ///
    /// Segments are consumed by the filter on the way. With a timer socket
    /// the loop also turns timer replies into ticks.
    fn tcp_check_packets(&mut self, iface: IfaceId) -> Result<()> {
        let timer_socket = match self.ifaces.get(iface)?.tcp.as_ref() {
            Some(context) => context.timer_socket,
            None => return Ok(()),
        };

        match timer_socket {
            Some(socket) => loop {
                match self.udp_try_receive(socket, true) {
                    Ok(packet) => match timer::read_reply(&packet) {
                        Ok(reply) if reply.is_tick() => self.tcp_tick(iface)?,
                        Ok(reply) => warn!("[TCP] timer reply {:?}", reply.error),
                        Err(error) => warn!("[TCP] bad timer reply from {}: {}", packet.src(), error),
                    },
                    Err(Error::QueueEmpty) => return Ok(()),
                    Err(error) if error.is_transient() => {}
                    Err(error) if udp::ends_receive(error) => return Err(error),
                    Err(error) => debug!("[TCP] receive: {}", error),
                }
            },
            None => loop {
                match self.ip_receive_on(iface, Some(HeaderType::Tcp), false) {
                    Ok(Some(packet)) => {
                        debug!("[TCP] dropping unclaimed segment from {}", packet.src())
                    }
                    Ok(None) => {}
                    Err(Error::QueueEmpty) => return Ok(()),
                    Err(error) if error.is_transient() => {}
                    Err(error) if udp::ends_receive(error) => return Err(error),
                    Err(error) => debug!("[TCP] receive: {}", error),
                }
            },
        }
    }

    /// One receive round on the first interface
    pub fn tcp_poll(&mut self) -> Result<()> {
        let iface = self.ifaces.first()?;
        self.tcp_check_packets(iface)
    }

    /// Fail the connection an ICMP error quoted one of our segments from
    ///
    /// Returns whether such a connection exists.
    pub(crate) fn tcp_report_unreachable(
        &mut self,
        local_port: u16,
        remote_addr: Address,
        remote_port: u16,
    ) -> bool {
        let found = self.tcp_sockets.iter().find(|(_, socket)| {
            socket.state != TcpState::Listen
                && socket.local_port == local_port
                && socket.remote_port == remote_port
                && socket.remote_addr == remote_addr
        });
        let Some((id, _)) = found else {
            return false;
        };
        if let Some(socket) = self.tcp_sockets.get_mut(id) {
            if socket.error_that_closed.is_none() {
                info!("[TCP] {}:{} unreachable", remote_addr, remote_port);
                socket.error_that_closed = Some(Error::DestinationUnreachable);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_with_outbound(seq: u32, data: &[u8]) -> TcpSocketState {
        let mut socket = TcpSocketState::new(&StackConfig::default());
        socket.outbound.seq = seq;
        socket.outbound.enqueue(data).unwrap();
        socket
    }

    #[test]
    fn test_record_ack_drops_acked_bytes() {
        let mut socket = socket_with_outbound(100, b"0123456789");
        socket.record_ack(104);
        assert_eq!(socket.outbound.len(), 6);
        assert_eq!(socket.outbound.seq, 104);

        // Duplicate and stale acks change nothing.
        socket.record_ack(104);
        socket.record_ack(90);
        assert_eq!(socket.outbound.len(), 6);
        assert_eq!(socket.outbound.seq, 104);
    }

    #[test]
    fn test_record_ack_across_wraparound() {
        let mut socket = socket_with_outbound(0xffff_fffc, b"abcdefgh");
        socket.record_ack(2);
        assert_eq!(socket.outbound.len(), 2);
        assert_eq!(socket.outbound.seq, 2);
    }

    #[test]
    fn test_record_ack_covers_fin() {
        let mut socket = socket_with_outbound(10, b"abc");
        socket.record_ack(14);
        assert!(!socket.fin_acked);
        assert!(socket.outbound.is_empty());

        let mut socket = socket_with_outbound(10, b"abc");
        socket.fin_sent = true;
        socket.record_ack(14);
        assert!(socket.fin_acked);
        assert_eq!(socket.outbound.seq, 14);
    }

    #[test]
    fn test_window_is_receive_room() {
        let mut socket = TcpSocketState::new(&StackConfig::default());
        assert_eq!(socket.window() as usize, crate::config::TCP_QUEUE_SIZE);
        socket.inbound.enqueue(&[0; 100]).unwrap();
        assert_eq!(socket.window() as usize, crate::config::TCP_QUEUE_SIZE - 100);
    }
}
