//! Bounded circular queue of owned packets
//!
//! Each interface and each UDP socket buffers pending packets here. Plain
//! dequeue is FIFO; a protocol-filtered dequeue pulls the earliest matching
//! packet forward and keeps the remaining packets in arrival order.

use alloc::vec::Vec;

use crate::config::PACKET_QUEUE_LEN;
use crate::error::{Error, Result};
use crate::net::header::HeaderType;
use crate::net::packet::Packet;

pub struct PacketQueue {
    slots: Vec<Option<Packet>>,
    head: usize,
    count: usize,
}

impl PacketQueue {
    /// A queue holding at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            count: 0,
        }
    }

    fn slot(&self, position: usize) -> usize {
        (self.head + position) % self.slots.len()
    }

    /// Add a packet at the tail
    ///
    /// On a full queue the packet is handed back with the error so the
    /// caller decides whether to drop it.
    pub fn enqueue(&mut self, packet: Packet) -> core::result::Result<(), (Error, Packet)> {
        if self.is_full() {
            return Err((Error::QueueFull, packet));
        }
        let tail = self.slot(self.count);
        self.slots[tail] = Some(packet);
        self.count += 1;
        Ok(())
    }

    /// Remove the oldest packet, or the oldest whose protocol is `expected`
    pub fn dequeue(&mut self, expected: Option<HeaderType>) -> Result<Packet> {
        let position = match expected {
            None if self.count > 0 => 0,
            None => return Err(Error::QueueEmpty),
            Some(protocol) => (0..self.count)
                .find(|&position| {
                    let at = self.slot(position);
                    self.slots[at]
                        .as_ref()
                        .is_some_and(|packet| packet.protocol() == Ok(protocol))
                })
                .ok_or(Error::QueueEmpty)?,
        };

        let at = self.slot(position);
        let packet = self.slots[at]
            .take()
            .ok_or(Error::QueueEmpty)?;

        if position == 0 {
            self.head = self.slot(1);
        } else {
            // Close the gap by shifting later entries down.
            for i in position..self.count - 1 {
                let from = self.slot(i + 1);
                let next = self.slots[from].take();
                let here = self.slot(i);
                self.slots[here] = next;
            }
        }
        self.count -= 1;
        if self.count == 0 {
            self.head = 0;
        }
        Ok(packet)
    }

    /// Drop every queued packet
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(PACKET_QUEUE_LEN)
    }
}

impl core::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("len", &self.count)
            .field("capacity", &self.slots.len())
            .finish()
    }
}
