//! In-memory packet substrate
//!
//! A [`SimKernel`] plays the part of the context-switching kernel for hosted
//! builds and tests: every attached context gets a bounded inbox, and a send
//! moves the packet into the inbox named by its transport-level destination.
//! Nothing is copied; the packet value itself changes hands.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crossbeam_queue::ArrayQueue;
use log::trace;
use spin::Mutex;

use crate::config::PACKET_QUEUE_LEN;
use crate::error::{Error, Result};
use crate::kernel::PacketPort;
use crate::net::addr::{Address, AddressMask};
use crate::net::packet::Packet;

type Inbox = Arc<ArrayQueue<Packet>>;

/// The simulated kernel shared by all contexts of one system
pub struct SimKernel {
    scheduler: Address,
    mask: AddressMask,
    inbox_len: usize,
    contexts: Mutex<BTreeMap<Address, Inbox>>,
}

impl SimKernel {
    /// A system whose contexts live under `mask`, scheduled by `scheduler`
    pub fn new(scheduler: Address, mask: AddressMask) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            mask,
            inbox_len: PACKET_QUEUE_LEN,
            contexts: Mutex::new(BTreeMap::new()),
        })
    }

    /// Create a context at `address` and return its port
    pub fn attach(self: &Arc<Self>, address: Address) -> Result<Arc<SimPort>> {
        let mut contexts = self.contexts.lock();
        if contexts.contains_key(&address) {
            return Err(Error::InvalidArg);
        }
        let inbox = Arc::new(ArrayQueue::new(self.inbox_len));
        contexts.insert(address, inbox.clone());
        trace!("[SIM] attached context {}", address);
        Ok(Arc::new(SimPort {
            kernel: self.clone(),
            address,
            inbox,
        }))
    }

    /// Remove the context at `address`; later sends to it are unreachable
    pub fn detach(&self, address: Address) {
        if self.contexts.lock().remove(&address).is_some() {
            trace!("[SIM] detached context {}", address);
        }
    }

    /// Packets waiting in the inbox of `address`
    pub fn pending(&self, address: Address) -> usize {
        self.contexts
            .lock()
            .get(&address)
            .map_or(0, |inbox| inbox.len())
    }

    pub fn is_attached(&self, address: Address) -> bool {
        self.contexts.lock().contains_key(&address)
    }

    fn deliver(&self, packet: Packet) -> Result<()> {
        let dest = packet.transport_dest();
        let inbox = self
            .contexts
            .lock()
            .get(&dest)
            .cloned()
            .ok_or(Error::AddressUnreachable)?;
        inbox.push(packet).map_err(|_| Error::QueueFull)?;
        trace!("[SIM] delivered packet to {}", dest);
        Ok(())
    }
}

/// A context attached to a [`SimKernel`]
pub struct SimPort {
    kernel: Arc<SimKernel>,
    address: Address,
    inbox: Inbox,
}

impl SimPort {
    pub fn kernel(&self) -> &Arc<SimKernel> {
        &self.kernel
    }
}

impl PacketPort for SimPort {
    fn address(&self) -> Address {
        self.address
    }

    fn system_mask(&self) -> AddressMask {
        self.kernel.mask
    }

    fn scheduler_address(&self) -> Address {
        self.kernel.scheduler
    }

    fn send(&self, packet: Packet, yield_to_recipient: bool) -> Result<()> {
        if yield_to_recipient {
            trace!("[SIM] {} yields to {}", self.address, packet.transport_dest());
        }
        self.kernel.deliver(packet)
    }

    fn try_receive(&self) -> Result<Packet> {
        self.inbox.pop().ok_or(Error::QueueEmpty)
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        let mut contexts = self.kernel.contexts.lock();
        let ours = contexts
            .get(&self.address)
            .is_some_and(|inbox| Arc::ptr_eq(inbox, &self.inbox));
        if ours {
            contexts.remove(&self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u16) -> Address {
        Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, last])
    }

    fn kernel() -> Arc<SimKernel> {
        SimKernel::new(addr(1), AddressMask::new(addr(0), 16))
    }

    #[test]
    fn test_delivery_moves_packet_to_inbox() {
        let kernel = kernel();
        let a = kernel.attach(addr(2)).unwrap();
        let b = kernel.attach(addr(3)).unwrap();

        let mut packet = a.alloc().unwrap();
        packet.set_transport_dest(addr(3));
        packet.set_hop_limit(9);
        a.send(packet, true).unwrap();

        assert_eq!(kernel.pending(addr(3)), 1);
        assert_eq!(b.try_receive().unwrap().hop_limit(), 9);
        assert_eq!(b.try_receive(), Err(Error::QueueEmpty));
    }

    #[test]
    fn test_unknown_destination_is_unreachable() {
        let kernel = kernel();
        let a = kernel.attach(addr(2)).unwrap();
        let mut packet = Packet::new();
        packet.set_transport_dest(addr(99));
        assert_eq!(a.send(packet, false), Err(Error::AddressUnreachable));
    }

    #[test]
    fn test_full_inbox() {
        let kernel = kernel();
        let a = kernel.attach(addr(2)).unwrap();
        let _b = kernel.attach(addr(3)).unwrap();
        for _ in 0..PACKET_QUEUE_LEN {
            let mut packet = Packet::new();
            packet.set_transport_dest(addr(3));
            a.send(packet, false).unwrap();
        }
        let mut packet = Packet::new();
        packet.set_transport_dest(addr(3));
        assert_eq!(a.send(packet, false), Err(Error::QueueFull));
    }

    #[test]
    fn test_dropping_port_detaches() {
        let kernel = kernel();
        let a = kernel.attach(addr(2)).unwrap();
        let b = kernel.attach(addr(3)).unwrap();
        assert!(kernel.attach(addr(3)).is_err());
        drop(b);
        assert!(!kernel.is_attached(addr(3)));

        let mut packet = Packet::new();
        packet.set_transport_dest(addr(3));
        assert_eq!(a.send(packet, false), Err(Error::AddressUnreachable));
    }
}
