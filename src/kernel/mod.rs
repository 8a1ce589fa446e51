//! The packet substrate the stack runs on
//!
//! The kernel owns context addressing and delivery; the stack only ever
//! allocates buffers, sends them to an address and takes whatever is waiting
//! in its own inbox. [`PacketPort`] is that contract.

use crate::error::Result;
use crate::net::addr::{Address, AddressMask};
use crate::net::packet::Packet;

#[cfg(feature = "sim")]
pub mod sim;

/// One context's view of the kernel's packet delivery
pub trait PacketPort: Send + Sync {
    /// Address the kernel delivers this context's packets to
    fn address(&self) -> Address;

    /// Prefix shared by every context on this system
    fn system_mask(&self) -> AddressMask;

    /// Address of the scheduling context, home of the timer service
    fn scheduler_address(&self) -> Address;

    /// A fresh buffer
    fn alloc(&self) -> Result<Packet> {
        Ok(Packet::new())
    }

    /// Deliver `packet` to its transport-level destination
    ///
    /// The packet is consumed even on failure: `AddressUnreachable` when no
    /// context has that address, `QueueFull` when its inbox is full.
    fn send(&self, packet: Packet, yield_to_recipient: bool) -> Result<()>;

    /// Take the oldest packet from this context's inbox, `QueueEmpty` if none
    fn try_receive(&self) -> Result<Packet>;
}
