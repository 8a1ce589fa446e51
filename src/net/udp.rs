//! UDP (RFC 768)
//!
//! A UDP socket is a local port and a queue of datagrams already received
//! for it. Receiving on one socket may pull in datagrams for another; those
//! are parked on the other socket's queue, or answered with an ICMP port
//! unreachable when no socket has the port. Datagrams sent to our own
//! address skip the network and land straight on the destination socket's
//! queue.

use log::{debug, trace, warn};

use crate::arena::Handle;
use crate::error::{Error, Result};
use crate::net::addr::Address;
use crate::net::checksum;
use crate::net::header::{Header, HeaderType, UDP_HEADER_SIZE, UdpHeader};
use crate::net::icmp::unreachable;
use crate::net::iface::IfaceId;
use crate::net::iter::HeaderSlot;
use crate::net::packet::Packet;
use crate::net::queue::PacketQueue;
use crate::net::stack::{NetStack, StackState};
use crate::task::yield_now;

pub type UdpSocketId = Handle<UdpSocketState>;

pub struct UdpSocketState {
    iface: Option<IfaceId>,
    addr: Address,
    /// Zero until bound
    port: u16,
    queue: PacketQueue,
}

impl UdpSocketState {
    fn bound_port(&self) -> Result<u16> {
        match self.port {
            0 => Err(Error::SocketNotBound),
            port => Ok(port),
        }
    }
}

/// The UDP header of `packet`, which must have one
pub fn seek_header(packet: &Packet) -> Result<(HeaderSlot, UdpHeader)> {
    let slot = packet
        .seek_header(HeaderType::Udp)?
        .ok_or(Error::WrongProtocol)?;
    let header = UdpHeader::decode(slot.bytes(packet))?;
    Ok((slot, header))
}

/// Point a datagram at `port`; the socket fills in the rest when sending
pub fn set_dest_port(packet: &mut Packet, port: u16) -> Result<()> {
    let (slot, mut header) = seek_header(packet)?;
    header.dest_port = port;
    packet.write_header(&slot, &Header::Udp(header))
}

/// Errors after which waiting for a datagram is pointless
pub(crate) fn ends_receive(error: Error) -> bool {
    matches!(
        error,
        Error::SocketNotBound
            | Error::InvalidArg
            | Error::IfaceNotRegistered
            | Error::DoesNotExist
            | Error::ContextFinished
            | Error::YieldedToBlocked
    )
}

impl StackState {
    pub fn udp_open(&mut self) -> UdpSocketId {
        let queue = PacketQueue::new(self.config.queue_len);
        self.udp_sockets.insert(UdpSocketState {
            iface: None,
            addr: Address::ZERO,
            port: 0,
            queue,
        })
    }

    fn udp_socket(&self, id: UdpSocketId) -> Result<&UdpSocketState> {
        self.udp_sockets.get(id).ok_or(Error::InvalidArg)
    }

    fn udp_socket_mut(&mut self, id: UdpSocketId) -> Result<&mut UdpSocketState> {
        self.udp_sockets.get_mut(id).ok_or(Error::InvalidArg)
    }

    /// Socket bound to `port` that accepts datagrams for `addr`
    ///
    /// A zero address on either side matches any address.
    pub fn udp_seek(&self, addr: Address, port: u16) -> Option<UdpSocketId> {
        if port == 0 {
            return None;
        }
        self.udp_sockets
            .iter()
            .find(|(_, socket)| {
                socket.port == port
                    && (socket.addr.is_zero() || addr.is_zero() || socket.addr == addr)
            })
            .map(|(id, _)| id)
    }

    /// Bind to `addr` and `port`
    ///
    /// A zero address accepts datagrams on every interface; a zero port
    /// picks the next free anonymous port. Returns the bound port.
    pub fn udp_bind(&mut self, id: UdpSocketId, addr: Address, port: u16) -> Result<u16> {
        if self.udp_socket(id)?.port != 0 {
            return Err(Error::InvalidArg);
        }
        let iface = if addr.is_zero() {
            None
        } else {
            Some(self.ifaces.lookup_receive(addr)?)
        };

        let port = if port == 0 {
            let anon_iface = match iface {
                Some(iface) => iface,
                None => self.ifaces.first()?,
            };
            self.anon_port(anon_iface, HeaderType::Udp, |stack, port| {
                stack.udp_seek(addr, port).is_some()
            })?
        } else {
            if self.udp_seek(addr, port).is_some() {
                return Err(Error::PortAlreadyBound);
            }
            port
        };

        let socket = self.udp_socket_mut(id)?;
        socket.iface = iface;
        socket.addr = addr;
        socket.port = port;
        debug!("[UDP] bound {}:{}", addr, port);
        Ok(port)
    }

    pub fn udp_local_port(&self, id: UdpSocketId) -> Result<u16> {
        self.udp_socket(id)?.bound_port()
    }

    /// A datagram from this socket with room for `data_len` bytes
    ///
    /// The source address is the socket's interface, or the first
    /// interface for a socket bound to every address.
    pub fn udp_new_packet(&mut self, id: UdpSocketId, data_len: usize) -> Result<Packet> {
        let socket = self.udp_socket(id)?;
        let port = socket.bound_port()?;
        let length = u16::try_from(data_len + UDP_HEADER_SIZE).map_err(|_| Error::InvalidArg)?;
        let src = match socket.iface {
            Some(iface) => self.ifaces.get(iface)?.address(),
            None => match self.ifaces.first() {
                Ok(first) => self.ifaces.get(first)?.address(),
                Err(_) => Address::ZERO,
            },
        };

        let mut packet = self.alloc_packet()?;
        packet.set_src(src);
        packet.append_header(&Header::Udp(UdpHeader {
            src_port: port,
            dest_port: 0,
            length,
            checksum: 0,
        }))?;
        packet.set_data_len(data_len)?;
        Ok(packet)
    }

    /// Stamp the source port and checksum and send
    pub fn udp_send(&mut self, id: UdpSocketId, mut packet: Packet) -> Result<()> {
        let socket = self.udp_socket(id)?;
        let port = socket.bound_port()?;
        let iface = socket.iface;

        let (slot, mut header) = seek_header(&packet)?;
        if header.dest_port == 0 {
            return Err(Error::NoDestPort);
        }
        header.src_port = port;
        header.checksum = 0;
        packet.write_header(&slot, &Header::Udp(header))?;
        checksum::fill(&mut packet, &slot)?;

        if packet.src() == packet.dest() {
            let other = self
                .udp_seek(packet.dest(), header.dest_port)
                .ok_or(Error::NoDestPort)?;
            trace!("[UDP] loopback {} -> {}", port, header.dest_port);
            return self
                .udp_socket_mut(other)?
                .queue
                .enqueue(packet)
                .map_err(|(error, _)| error);
        }

        match iface {
            Some(iface) => self.ip_send_via(iface, packet),
            None => self.ip_send(packet),
        }
    }

    /// One non-blocking receive attempt
    ///
    /// Returns `QueueEmpty` when nothing is waiting. With `stop_when_other`
    /// the attempt ends with `StoppedForOtherSocket` after handling one
    /// datagram that was for a different socket.
    pub fn udp_try_receive(&mut self, id: UdpSocketId, stop_when_other: bool) -> Result<Packet> {
        let socket = self.udp_socket_mut(id)?;
        let port = socket.bound_port()?;
        let socket_iface = socket.iface;
        match socket.queue.dequeue(Some(HeaderType::Udp)) {
            Err(Error::QueueEmpty) => {}
            done => return done,
        }

        let mut first = true;
        loop {
            if !first && stop_when_other {
                return Err(Error::StoppedForOtherSocket);
            }
            first = false;

            let received = match socket_iface {
                Some(iface) => self
                    .ip_receive_on(iface, Some(HeaderType::Udp), false)
                    .map(|packet| packet.map(|packet| (iface, packet))),
                None => self
                    .ip_receive(Some(HeaderType::Udp), stop_when_other)
                    .map(Some),
            };
            let (iface, packet) = match received {
                Ok(Some(received)) => received,
                Ok(None) | Err(Error::PacketFilteredOut) | Err(Error::ContextYieldedBack) => {
                    continue;
                }
                Err(error) => return Err(error),
            };

            let Ok((slot, header)) = seek_header(&packet) else {
                debug!("[UDP] dropping non-UDP packet from {}", packet.src());
                continue;
            };
            match checksum::verify(&packet, &slot) {
                Ok(true) => {}
                Ok(false) => warn!(
                    "[UDP] checksum mismatch from {}:{}",
                    packet.src(),
                    header.src_port
                ),
                Err(error) => warn!("[UDP] checksum of datagram from {}: {}", packet.src(), error),
            }

            if header.dest_port == port {
                return Ok(packet);
            }
            match self.udp_seek(packet.dest(), header.dest_port) {
                Some(other) => {
                    if let Err((error, _)) = self.udp_socket_mut(other)?.queue.enqueue(packet) {
                        warn!("[UDP] dropping datagram for port {}: {}", header.dest_port, error);
                    }
                }
                None => {
                    debug!("[UDP] port {} unreachable", header.dest_port);
                    if let Err(error) =
                        self.icmp_send_destination_unreachable(iface, unreachable::PORT, &packet)
                    {
                        warn!("[UDP] port unreachable not sent: {}", error);
                    }
                }
            }
        }
    }

    /// Whether a datagram is already queued for this socket
    pub fn udp_receive_pending(&self, id: UdpSocketId) -> Result<bool> {
        Ok(!self.udp_socket(id)?.queue.is_empty())
    }

    /// Release the socket and anything queued on it
    pub fn udp_close(&mut self, id: UdpSocketId) -> Result<()> {
        let socket = self.udp_sockets.remove(id).ok_or(Error::InvalidArg)?;
        if socket.port != 0 {
            debug!("[UDP] closed port {} ({} queued)", socket.port, socket.queue.len());
        }
        Ok(())
    }
}

/// A UDP socket owned by a task
///
/// Dropping the handle leaks the socket; call [`close`](UdpSocket::close).
pub struct UdpSocket {
    stack: NetStack,
    id: UdpSocketId,
}

impl UdpSocket {
    pub fn new(stack: &NetStack) -> Self {
        let id = stack.lock().udp_open();
        Self {
            stack: stack.clone(),
            id,
        }
    }

    pub fn id(&self) -> UdpSocketId {
        self.id
    }

    pub fn stack(&self) -> &NetStack {
        &self.stack
    }

    pub fn bind(&self, addr: Address, port: u16) -> Result<u16> {
        self.stack.lock().udp_bind(self.id, addr, port)
    }

    pub fn local_port(&self) -> Result<u16> {
        self.stack.lock().udp_local_port(self.id)
    }

    pub fn new_packet(&self, data_len: usize) -> Result<Packet> {
        self.stack.lock().udp_new_packet(self.id, data_len)
    }

    /// Send `data` to `dest`:`port` in one datagram
    pub fn send_to(&self, dest: Address, port: u16, data: &[u8]) -> Result<()> {
        let mut stack = self.stack.lock();
        let mut packet = stack.udp_new_packet(self.id, data.len())?;
        packet.set_dest(dest);
        set_dest_port(&mut packet, port)?;
        packet.data_mut()?[..data.len()].copy_from_slice(data);
        stack.udp_send(self.id, packet)
    }

    pub fn send(&self, packet: Packet) -> Result<()> {
        self.stack.lock().udp_send(self.id, packet)
    }

    pub fn try_receive(&self, stop_when_other: bool) -> Result<Packet> {
        self.stack.lock().udp_try_receive(self.id, stop_when_other)
    }

    /// Wait for the next datagram
    pub async fn receive(&self) -> Result<Packet> {
        loop {
            match self.try_receive(false) {
                Ok(packet) => return Ok(packet),
                Err(error) if error.is_transient() => {}
                Err(error) if ends_receive(error) => return Err(error),
                Err(error) => debug!("[UDP] receive: {}", error),
            }
            yield_now().await;
        }
    }

    pub fn receive_pending(&self) -> Result<bool> {
        self.stack.lock().udp_receive_pending(self.id)
    }

    pub fn close(self) -> Result<()> {
        self.stack.lock().udp_close(self.id)
    }
}
