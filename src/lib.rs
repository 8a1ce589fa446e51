#![cfg_attr(not(test), no_std)]

//! Packet-level networking for a minimal multi-context operating system
//!
//! Contexts talk to each other only through kernel-delivered packets. This
//! crate is the per-context network stack built on that: an IPv6-shaped
//! packet model, interfaces with receive filters, UDP, ICMP and TCP, plus
//! the tick service TCP needs for retransmission.

extern crate alloc;

pub mod arena;
pub mod config;
pub mod error;

// Kernel packet substrate (and the in-memory one for hosted builds)
pub mod kernel;

// Networking infrastructure
pub mod net;

// Scheduler tick service
pub mod timer;

// Cooperative tasks
pub mod task;

pub use config::StackConfig;
pub use error::{Error, Result};
pub use net::{Address, AddressMask, NetStack, Packet};
