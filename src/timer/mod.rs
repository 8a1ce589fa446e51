//! Tick service for the cooperative scheduler
//!
//! The scheduling context runs a [`TimerService`]; other contexts open a
//! [`Timer`] and receive ticks as UDP datagrams.

pub mod client;
pub mod protocol;
pub mod service;

pub use client::{Timer, read_reply};
pub use protocol::{TimerCommand, TimerReply, TimerRequest};
pub use service::{DeltaList, TimerService};
