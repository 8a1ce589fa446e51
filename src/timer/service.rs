//! Timer service
//!
//! Runs in the scheduling context on the well-known timer port. Clients
//! wait in a delta list: each entry stores its ticks relative to the entry
//! before it, so one tick only ever touches the head.

use alloc::collections::VecDeque;

use log::{debug, info, warn};

use crate::config::{TIMER_PORT, TIMER_PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::net::addr::Address;
use crate::net::packet::Packet;
use crate::net::stack::{NetStack, StackState};
use crate::net::udp::{self, UdpSocketId};
use crate::task::yield_now;
use crate::timer::protocol::{REPLY_SIZE, TimerCommand, TimerReply, TimerRequest, ticks};

/// Values ordered by when they expire, stored as deltas
#[derive(Debug)]
pub struct DeltaList<T> {
    entries: VecDeque<(u32, T)>,
}

impl<T> DeltaList<T> {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Schedule `value` to expire `ticks` from now
    ///
    /// Entries due at the same tick expire in insertion order.
    pub fn insert(&mut self, mut ticks: u32, value: T) {
        let mut index = 0;
        while let Some((delta, _)) = self.entries.get(index) {
            if *delta > ticks {
                break;
            }
            ticks -= delta;
            index += 1;
        }
        if let Some((next, _)) = self.entries.get_mut(index) {
            *next -= ticks;
        }
        self.entries.insert(index, (ticks, value));
    }

    /// Move time forward one tick
    pub fn advance(&mut self) {
        if let Some((delta, _)) = self.entries.front_mut() {
            *delta = delta.saturating_sub(1);
        }
    }

    /// Take the head if it is due
    pub fn pop_expired(&mut self) -> Option<T> {
        match self.entries.front() {
            Some((0, _)) => self.entries.pop_front().map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with their absolute ticks until expiry
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries.iter().scan(0u32, |total, (delta, value)| {
            *total += delta;
            Some((*total, value))
        })
    }
}

impl<T> Default for DeltaList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerClient {
    addr: Address,
    port: u16,
    id: u32,
    request_id: u16,
    repeat: bool,
    interval: u32,
}

#[derive(Debug)]
pub struct TimerService {
    socket: UdpSocketId,
    address: Address,
    clients: DeltaList<TimerClient>,
}

impl TimerService {
    /// Bind the timer port on every interface of `stack`
    pub fn new(stack: &mut StackState) -> Result<Self> {
        let socket = stack.udp_open();
        if let Err(error) = stack.udp_bind(socket, Address::ZERO, TIMER_PORT) {
            warn!("[TIMER] cannot bind port {}: {}", TIMER_PORT, error);
            let _ = stack.udp_close(socket);
            return Err(error);
        }
        info!("[TIMER] service bound to port {}", TIMER_PORT);
        Ok(Self {
            socket,
            address: stack.address(),
            clients: DeltaList::new(),
        })
    }

    pub fn socket(&self) -> UdpSocketId {
        self.socket
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// `(id, ticks until the next tick)` for every client, soonest first
    pub fn pending(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.clients.iter().map(|(ticks, client)| (client.id, ticks))
    }

    /// Forget every client and release the port
    pub fn close(self, stack: &mut StackState) -> Result<()> {
        if !self.clients.is_empty() {
            debug!("[TIMER] dropping {} clients", self.clients.len());
        }
        stack.udp_close(self.socket)
    }

    fn send_reply(
        &self,
        stack: &mut StackState,
        dest: Address,
        port: u16,
        reply: &TimerReply,
    ) -> Result<()> {
        let mut packet = stack.udp_new_packet(self.socket, REPLY_SIZE)?;
        packet.set_src(self.address);
        packet.set_dest(dest);
        udp::set_dest_port(&mut packet, port)?;
        reply.encode(packet.data_mut()?)?;
        stack.udp_send(self.socket, packet)
    }

    fn send_error(
        &self,
        stack: &mut StackState,
        dest: Address,
        port: u16,
        request: &TimerRequest,
        error: Error,
    ) {
        let reply = TimerReply::failure(request, error);
        if let Err(send_error) = self.send_reply(stack, dest, port, &reply) {
            warn!("[TIMER] error reply to {}:{} not sent: {}", dest, port, send_error);
        }
    }

    /// Act on one request from `src`:`src_port`
    ///
    /// Bad requests are answered with an error reply; a wrong version or an
    /// unusable interval is also returned to the caller.
    pub fn handle_request(
        &mut self,
        stack: &mut StackState,
        src: Address,
        src_port: u16,
        request: &TimerRequest,
    ) -> Result<()> {
        if request.version != TIMER_PROTOCOL_VERSION {
            self.send_error(stack, src, src_port, request, Error::WrongProtocolVersion);
            return Err(Error::WrongProtocolVersion);
        }
        match request.command() {
            Some(TimerCommand::Open) => {
                let interval = ticks(request.sec, request.usec);
                if interval == 0 {
                    self.send_error(stack, src, src_port, request, Error::InvalidArg);
                    return Err(Error::InvalidArg);
                }
                debug!(
                    "[TIMER] {}:{} every {} ticks (id {})",
                    src, src_port, interval, request.id
                );
                self.clients.insert(
                    interval,
                    TimerClient {
                        addr: src,
                        port: src_port,
                        id: request.id,
                        request_id: request.request_id,
                        repeat: request.repeat,
                        interval,
                    },
                );
                Ok(())
            }
            Some(TimerCommand::Close) => Ok(()),
            Some(TimerCommand::Invalid) | Some(TimerCommand::Tick) | None => {
                self.send_error(stack, src, src_port, request, Error::BadProtocolCmd);
                Ok(())
            }
        }
    }

    fn handle_packet(&mut self, stack: &mut StackState, packet: &Packet) -> Result<()> {
        let (_, header) = udp::seek_header(packet)?;
        let request = TimerRequest::decode(packet.data()?)?;
        self.handle_request(stack, packet.src(), header.src_port, &request)
    }

    /// Handle every request already waiting; returns how many there were
    pub fn poll(&mut self, stack: &mut StackState) -> Result<usize> {
        let mut handled = 0;
        loop {
            let packet = match stack.udp_try_receive(self.socket, true) {
                Ok(packet) => packet,
                Err(error) if error.is_transient() => return Ok(handled),
                Err(error) => return Err(error),
            };
            handled += 1;
            if let Err(error) = self.handle_packet(stack, &packet) {
                warn!("[TIMER] request from {}: {}", packet.src(), error);
            }
        }
    }

    /// Advance time one tick and notify every client that came due
    ///
    /// A client that can no longer be reached is dropped.
    pub fn tick(&mut self, stack: &mut StackState) {
        self.clients.advance();
        while let Some(client) = self.clients.pop_expired() {
            let reply = TimerReply::tick(client.id, client.request_id);
            match self.send_reply(stack, client.addr, client.port, &reply) {
                Ok(()) => {}
                Err(Error::AddressUnreachable) => {
                    debug!("[TIMER] {} is gone; dropping timer {}", client.addr, client.id);
                    continue;
                }
                Err(error) => {
                    warn!(
                        "[TIMER] tick to {}:{} failed: {}; dropping timer {}",
                        client.addr, client.port, error, client.id
                    );
                    continue;
                }
            }
            if client.repeat {
                self.clients.insert(client.interval, client);
            }
        }
    }

    /// Serve requests and tick once per scheduling pass, forever
    pub async fn run(mut self, stack: NetStack) -> Result<()> {
        loop {
            {
                let mut state = stack.lock();
                self.poll(&mut state)?;
                self.tick(&mut state);
            }
            yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_delta_list_orders_by_expiry() {
        let mut list = DeltaList::new();
        list.insert(5, 'a');
        list.insert(2, 'b');
        list.insert(9, 'c');
        list.insert(5, 'd');

        let order: Vec<_> = list.iter().map(|(ticks, value)| (ticks, *value)).collect();
        assert_eq!(order, [(2, 'b'), (5, 'a'), (5, 'd'), (9, 'c')]);
    }

    #[test]
    fn test_delta_list_expiry() {
        let mut list = DeltaList::new();
        list.insert(1, 1);
        list.insert(1, 2);
        list.insert(3, 3);

        assert_eq!(list.pop_expired(), None);
        list.advance();
        assert_eq!(list.pop_expired(), Some(1));
        assert_eq!(list.pop_expired(), Some(2));
        assert_eq!(list.pop_expired(), None);
        list.advance();
        assert_eq!(list.pop_expired(), None);
        list.advance();
        assert_eq!(list.pop_expired(), Some(3));
        assert!(list.is_empty());
    }

    #[test]
    fn test_insert_in_front_shortens_successor() {
        let mut list = DeltaList::new();
        list.insert(10, "late");
        list.insert(4, "early");
        for _ in 0..4 {
            list.advance();
        }
        assert_eq!(list.pop_expired(), Some("early"));
        assert_eq!(list.iter().next(), Some((6, &"late")));
    }
}
