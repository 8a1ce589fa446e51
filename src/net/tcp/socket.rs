//! Connection control and the task-facing socket handle

use log::{debug, info, warn};

use super::{TcpSocketId, TcpSocketState, TcpState};
use crate::config::TCP_SEND_THRESHOLD;
use crate::error::{Error, Result};
use crate::net::addr::Address;
use crate::net::header::{HeaderType, flags};
use crate::net::stack::{NetStack, StackState};
use crate::task::yield_now;

impl StackState {
    pub fn tcp_open(&mut self) -> TcpSocketId {
        let socket = TcpSocketState::new(&self.config);
        self.tcp_sockets.insert(socket)
    }

    /// State of `id`; a deleted socket reads as closed
    pub fn tcp_state(&self, id: TcpSocketId) -> TcpState {
        self.tcp_sockets
            .get(id)
            .map_or(TcpState::Closed, |socket| socket.state)
    }

    pub fn tcp_peer_address(&self, id: TcpSocketId) -> Result<(Address, u16)> {
        let socket = self.tcp_socket(id)?;
        if socket.remote_port == 0 {
            return Err(Error::DoesNotExist);
        }
        Ok((socket.remote_addr, socket.remote_port))
    }

    pub fn tcp_local_port(&self, id: TcpSocketId) -> Result<u16> {
        let socket = self.tcp_socket(id)?;
        socket.bound_iface()?;
        Ok(socket.local_port)
    }

    /// Bind to `port` on the interface owning `addr`
    ///
    /// Port 0 picks an anonymous port. Returns the bound port.
    pub fn tcp_bind(&mut self, id: TcpSocketId, addr: Address, port: u16) -> Result<u16> {
        let socket = self.tcp_socket(id)?;
        if socket.local_port != 0 {
            return Err(Error::InvalidArg);
        }
        if addr.is_zero() {
            warn!("[TCP] binding to every interface is not implemented");
            return Err(Error::NotImplemented);
        }
        let accepted_from = socket.accepted_from;
        let iface = self.ifaces.lookup_receive(addr)?;
        self.tcp_init_context(iface)?;

        let port = if port == 0 {
            self.anon_port(iface, HeaderType::Tcp, |stack, port| {
                stack.tcp_seek_port(iface, port).is_some()
            })?
        } else {
            if let Some(other) = self.tcp_seek_port(iface, port) {
                // Only a listener's own children may share its port.
                let listening = self
                    .tcp_sockets
                    .get(other)
                    .is_some_and(|other| other.state == TcpState::Listen);
                if !(listening && accepted_from == Some(other)) {
                    return Err(Error::PortAlreadyBound);
                }
            }
            port
        };

        let socket = self.tcp_socket_mut(id)?;
        socket.iface = Some(iface);
        socket.local_port = port;
        self.tcp_context_mut(iface)?.sockets.push(id);
        debug!("[TCP] bound {}:{}", addr, port);
        Ok(port)
    }

    pub fn tcp_listen(&mut self, id: TcpSocketId) -> Result<()> {
        let socket = self.tcp_socket_mut(id)?;
        if socket.state != TcpState::Closed {
            return Err(Error::SocketAlreadyInUse);
        }
        socket.bound_iface()?;
        socket.state = TcpState::Listen;
        debug!("[TCP] listening on port {}", socket.local_port);
        Ok(())
    }

    /// Send the SYN that opens a connection to `addr`:`port`
    pub fn tcp_connect(&mut self, id: TcpSocketId, addr: Address, port: u16) -> Result<()> {
        let socket = self.tcp_socket(id)?;
        socket.bound_iface()?;
        if socket.state != TcpState::Closed {
            return Err(Error::SocketAlreadyInUse);
        }

        let isn = self.config.isn.generate();
        let socket = self.tcp_socket_mut(id)?;
        socket.remote_addr = addr;
        socket.remote_port = port;
        socket.outbound.seq = isn;
        socket.outbound.ack = isn.wrapping_sub(1);
        self.tcp_send_control(id, flags::SYN, isn)?;

        let socket = self.tcp_socket_mut(id)?;
        socket.outbound.seq = isn.wrapping_add(1);
        socket.state = TcpState::SynSent;
        info!("[TCP] port {} connecting to {}:{}", socket.local_port, addr, port);
        Ok(())
    }

    /// One step of waiting for the handshake: true once established
    pub fn tcp_poll_connect(&mut self, id: TcpSocketId) -> Result<bool> {
        let iface = self.tcp_socket(id)?.bound_iface()?;
        self.tcp_check_packets(iface)?;
        let socket = self
            .tcp_sockets
            .get(id)
            .ok_or(Error::ConnectionClosed)?;
        if let Some(error) = socket.error_that_closed {
            return Err(error);
        }
        match socket.state {
            TcpState::SynSent | TcpState::SynReceived => Ok(false),
            TcpState::Established => Ok(true),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// The listener's established child, handed over at most once
    fn tcp_take_child(&mut self, id: TcpSocketId) -> Result<Option<TcpSocketId>> {
        let Some(child) = self.tcp_socket(id)?.waiting_to_accept else {
            return Ok(None);
        };
        if !self.tcp_state(child).is_open() {
            return Ok(None);
        }
        self.tcp_socket_mut(id)?.waiting_to_accept = None;
        Ok(Some(child))
    }

    /// One step of waiting for a connection on a listener
    pub fn tcp_poll_accept(&mut self, id: TcpSocketId) -> Result<Option<TcpSocketId>> {
        let socket = self.tcp_socket(id)?;
        if socket.state != TcpState::Listen {
            return Err(Error::SocketNotListening);
        }
        let iface = socket.bound_iface()?;
        if let Some(child) = self.tcp_take_child(id)? {
            return Ok(Some(child));
        }
        self.tcp_check_packets(iface)?;
        if let Some(error) = self.tcp_socket(id)?.error_that_closed {
            return Err(error);
        }
        self.tcp_take_child(id)
    }

    /// Whether an established connection is waiting on the listener
    pub fn tcp_accept_pending(&self, id: TcpSocketId) -> Result<bool> {
        let socket = self.tcp_socket(id)?;
        if socket.state != TcpState::Listen {
            return Err(Error::SocketNotListening);
        }
        Ok(socket
            .waiting_to_accept
            .is_some_and(|child| self.tcp_state(child).is_open()))
    }

    /// Queue `data` for sending; returns how much fit
    ///
    /// Nothing goes out until a full segment's worth is queued or the next
    /// retransmission tick.
    pub fn tcp_send(&mut self, id: TcpSocketId, data: &[u8]) -> Result<usize> {
        let socket = self.tcp_socket_mut(id)?;
        socket.bound_iface()?;
        if let Some(error) = socket.error_that_closed {
            return Err(error);
        }
        if !socket.state.is_open() {
            debug!("[TCP] send on port {} in {}", socket.local_port, socket.state);
            return Err(Error::ConnectionClosed);
        }
        let queued = socket.outbound.enqueue(data)?;
        if socket.outbound.len() >= TCP_SEND_THRESHOLD {
            if let Err(error) = self.tcp_fire(id) {
                warn!("[TCP] send: {}", error);
            }
        }
        Ok(queued)
    }

    /// Transmit queued data now instead of at the next tick
    pub fn tcp_flush(&mut self, id: TcpSocketId) -> Result<()> {
        self.tcp_fire(id).map(|_| ())
    }

    fn tcp_take_received(&mut self, id: TcpSocketId, buf: &mut [u8]) -> Result<Option<usize>> {
        let socket = self.tcp_socket_mut(id)?;
        if socket.inbound.is_empty() {
            return Ok(None);
        }
        Ok(Some(socket.inbound.dequeue(buf)))
    }

    /// One step of waiting for data
    ///
    /// Data already received is returned even after the peer closed.
    /// Afterwards the end of the stream shows up as `ConnectionClosed`.
    pub fn tcp_poll_receive(&mut self, id: TcpSocketId, buf: &mut [u8]) -> Result<Option<usize>> {
        if buf.is_empty() {
            return Ok(Some(0));
        }
        let iface = self.tcp_socket(id)?.bound_iface()?;
        if let Some(n) = self.tcp_take_received(id, buf)? {
            return Ok(Some(n));
        }
        let socket = self.tcp_socket(id)?;
        if let Some(error) = socket.error_that_closed {
            return Err(error);
        }
        if socket.state != TcpState::Established {
            return Err(Error::ConnectionClosed);
        }

        self.tcp_check_packets(iface)?;
        if !self.tcp_sockets.contains(id) {
            return Err(Error::ConnectionClosed);
        }
        if let Some(n) = self.tcp_take_received(id, buf)? {
            return Ok(Some(n));
        }
        match self.tcp_socket(id)?.error_that_closed {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }

    /// Whether received data is waiting
    pub fn tcp_receive_pending(&self, id: TcpSocketId) -> Result<bool> {
        let socket = self.tcp_socket(id)?;
        socket.bound_iface()?;
        if !socket.state.is_open() && socket.inbound.is_empty() {
            return Err(Error::ConnectionClosed);
        }
        Ok(!socket.inbound.is_empty())
    }

    /// Start closing the connection
    ///
    /// Queued data still goes out ahead of our FIN. Sockets that never got
    /// as far as a connection, listeners included, are deleted on the spot
    /// along with any child not yet accepted.
    pub fn tcp_close(&mut self, id: TcpSocketId) -> Result<()> {
        let socket = self.tcp_socket_mut(id)?;
        let state = socket.state;
        match state {
            TcpState::Listen => {
                if let Some(child) = socket.waiting_to_accept.take() {
                    self.tcp_delete(child);
                }
                self.tcp_delete(id);
                Ok(())
            }
            TcpState::Closed | TcpState::SynSent => {
                self.tcp_delete(id);
                Ok(())
            }
            TcpState::SynReceived | TcpState::Established => {
                socket.state = TcpState::FinWait1;
                self.tcp_fire(id).map(|_| ())
            }
            TcpState::CloseWait => {
                socket.state = TcpState::LastAck;
                self.tcp_fire(id).map(|_| ())
            }
            TcpState::FinWait1 | TcpState::FinWait2 => self.tcp_fire(id).map(|_| ()),
            TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => Ok(()),
        }
    }
}

/// A TCP socket owned by a task
///
/// Dropping the handle leaves the connection as it is; call
/// [`close`](TcpSocket::close).
pub struct TcpSocket {
    stack: NetStack,
    id: TcpSocketId,
}

impl TcpSocket {
    pub fn new(stack: &NetStack) -> Self {
        let id = stack.lock().tcp_open();
        Self {
            stack: stack.clone(),
            id,
        }
    }

    pub fn id(&self) -> TcpSocketId {
        self.id
    }

    pub fn state(&self) -> TcpState {
        self.stack.lock().tcp_state(self.id)
    }

    pub fn peer_address(&self) -> Result<(Address, u16)> {
        self.stack.lock().tcp_peer_address(self.id)
    }

    pub fn local_port(&self) -> Result<u16> {
        self.stack.lock().tcp_local_port(self.id)
    }

    pub fn bind(&self, addr: Address, port: u16) -> Result<u16> {
        self.stack.lock().tcp_bind(self.id, addr, port)
    }

    pub fn listen(&self) -> Result<()> {
        self.stack.lock().tcp_listen(self.id)
    }

    /// Wait for the next established connection
    pub async fn accept(&self) -> Result<TcpSocket> {
        loop {
            if let Some(child) = self.stack.lock().tcp_poll_accept(self.id)? {
                return Ok(TcpSocket {
                    stack: self.stack.clone(),
                    id: child,
                });
            }
            yield_now().await;
        }
    }

    pub fn accept_pending(&self) -> Result<bool> {
        self.stack.lock().tcp_accept_pending(self.id)
    }

    /// Open a connection and wait until it is established
    pub async fn connect(&self, addr: Address, port: u16) -> Result<()> {
        self.stack.lock().tcp_connect(self.id, addr, port)?;
        loop {
            if self.stack.lock().tcp_poll_connect(self.id)? {
                return Ok(());
            }
            yield_now().await;
        }
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.stack.lock().tcp_send(self.id, data)
    }

    /// Queue all of `data`, waiting for the peer to drain the queue as needed
    pub async fn send_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let queued = {
                let mut stack = self.stack.lock();
                match stack.tcp_send(self.id, data) {
                    Ok(queued) => queued,
                    Err(Error::QueueFull) => {
                        let iface = stack.tcp_socket(self.id)?.bound_iface()?;
                        stack.tcp_check_packets(iface)?;
                        0
                    }
                    Err(error) => return Err(error),
                }
            };
            data = &data[queued..];
            if queued == 0 {
                yield_now().await;
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.stack.lock().tcp_flush(self.id)
    }

    /// Wait for data; `ConnectionClosed` once the peer has closed and
    /// everything it sent has been read
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(n) = self.stack.lock().tcp_poll_receive(self.id, buf)? {
                return Ok(n);
            }
            yield_now().await;
        }
    }

    pub fn receive_pending(&self) -> Result<bool> {
        self.stack.lock().tcp_receive_pending(self.id)
    }

    /// Process whatever arrived on the stack's first interface
    pub fn poll(&self) -> Result<()> {
        self.stack.lock().tcp_poll()
    }

    pub fn close(self) -> Result<()> {
        self.stack.lock().tcp_close(self.id)
    }
}

impl core::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
