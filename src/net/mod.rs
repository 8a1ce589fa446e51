//! Network stack
//!
//! An IPv6-shaped stack for contexts that exchange whole packets through the
//! kernel: packets and their header chain, interfaces with receive filters,
//! and UDP, ICMP and TCP on top.

pub mod addr;
pub mod checksum;
pub mod filter;
pub mod header;
pub mod icmp;
pub mod iface;
pub mod iter;
pub mod packet;
pub mod queue;
pub mod stack;
pub mod tcp;
pub mod udp;

pub use addr::{Address, AddressMask};
pub use packet::Packet;
pub use stack::{NetStack, StackState};
