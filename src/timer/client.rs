//! Timer client
//!
//! A context asks the scheduler for ticks by sending one open request from
//! a bound UDP socket; the ticks then arrive on that socket as
//! [`TimerReply`] datagrams. There is no confirmation, so a refused request
//! only shows up as an error reply on the same socket.

use log::debug;

use crate::config::TIMER_PORT;
use crate::error::{Error, Result};
use crate::net::packet::Packet;
use crate::net::stack::StackState;
use crate::net::udp::{self, UdpSocket, UdpSocketId};
use crate::timer::protocol::{REQUEST_SIZE, TimerReply, TimerRequest};

#[derive(Debug)]
pub struct Timer {
    socket: UdpSocketId,
    id: u32,
    repeat: bool,
}

impl Timer {
    /// Request ticks every `sec` seconds plus `usec` microseconds on `socket`
    pub fn open(
        stack: &mut StackState,
        socket: UdpSocketId,
        sec: u32,
        usec: u32,
        id: u32,
        repeat: bool,
    ) -> Result<Self> {
        let mut packet = stack.udp_new_packet(socket, REQUEST_SIZE)?;
        packet.set_src(stack.address());
        packet.set_dest(stack.scheduler_address());
        udp::set_dest_port(&mut packet, TIMER_PORT)?;
        TimerRequest::open(id, sec, usec, repeat).encode(packet.data_mut()?)?;
        stack.udp_send(socket, packet)?;

        debug!(
            "[TIMER] requested {}.{:06}s ticks, id {}{}",
            sec,
            usec,
            id,
            if repeat { ", repeating" } else { "" }
        );
        Ok(Self { socket, id, repeat })
    }

    /// [`Timer::open`] for a socket handle
    pub fn start(socket: &UdpSocket, sec: u32, usec: u32, id: u32, repeat: bool) -> Result<Self> {
        let mut stack = socket.stack().lock();
        Self::open(&mut stack, socket.id(), sec, usec, id, repeat)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn socket(&self) -> UdpSocketId {
        self.socket
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
    }

    /// Cancelling a timer is not supported by the service
    pub fn close(self) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

/// Decode a datagram that arrived on a timer socket
pub fn read_reply(packet: &Packet) -> Result<TimerReply> {
    TimerReply::decode(packet.data()?)
}
