//! Packet buffers
//!
//! A packet is one fixed-size substrate buffer laid out as:
//!
//! ```text
//!  0      16     32                72
//!  +------+------+-----------------+---------------------+------+
//!  | tsrc | tdst | IPv6 fixed hdr  | ext/transport hdrs  | data |
//!  +------+------+-----------------+---------------------+------+
//! ```
//!
//! `tsrc`/`tdst` are the addresses the kernel delivers between; the rest is
//! a byte-for-byte IPv6 datagram. All fields stay in network byte order in
//! the buffer and are converted on every access.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

use crate::config::{DEFAULT_HOP_LIMIT, PACKET_CAPACITY};
use crate::net::addr::Address;
use crate::net::header::HeaderType;

/// Offset of the transport-level (kernel delivery) source address
pub const TRANSPORT_SRC_OFFSET: usize = 0;
/// Offset of the transport-level (kernel delivery) destination address
pub const TRANSPORT_DEST_OFFSET: usize = 16;
/// Offset of the IPv6 fixed header
pub const IPV6_OFFSET: usize = 32;
/// Size of the IPv6 fixed header
pub const IPV6_HEADER_SIZE: usize = 40;
/// First byte after the fixed header
pub const HEADERS_OFFSET: usize = IPV6_OFFSET + IPV6_HEADER_SIZE;

const VTFL_OFFSET: usize = IPV6_OFFSET;
const PAYLOAD_LEN_OFFSET: usize = IPV6_OFFSET + 4;
const NEXT_HEADER_OFFSET: usize = IPV6_OFFSET + 6;
const HOP_LIMIT_OFFSET: usize = IPV6_OFFSET + 7;
const SRC_OFFSET: usize = IPV6_OFFSET + 8;
const DEST_OFFSET: usize = IPV6_OFFSET + 24;

/// An owned packet buffer
///
/// Ownership moves with the value: sending a packet hands it to the
/// substrate, which hands it to the receiver.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Box<[u8]>,
}

impl Packet {
    /// A fresh packet: version 6, empty payload, no next header
    pub fn new() -> Self {
        Self::with_capacity(PACKET_CAPACITY)
    }

    /// A fresh packet backed by a buffer of `capacity` bytes
    ///
    /// The capacity is clamped so the fixed header always fits.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut packet = Self {
            buf: vec![0u8; capacity.max(HEADERS_OFFSET)].into_boxed_slice(),
        };
        packet.set_vtfl(6 << 28);
        packet.set_payload_len(0);
        packet.set_next_header(HeaderType::None as u8);
        packet.set_hop_limit(DEFAULT_HOP_LIMIT);
        packet
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub(crate) fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    pub(crate) fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.buf[offset..offset + 4]);
        u32::from_be_bytes(word)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn read_address(&self, offset: usize) -> Address {
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&self.buf[offset..offset + 16]);
        Address(addr)
    }

    fn write_address(&mut self, offset: usize, addr: Address) {
        self.buf[offset..offset + 16].copy_from_slice(&addr.0);
    }

    // Transport-level (delivery) addresses

    pub fn transport_src(&self) -> Address {
        self.read_address(TRANSPORT_SRC_OFFSET)
    }

    pub fn set_transport_src(&mut self, addr: Address) {
        self.write_address(TRANSPORT_SRC_OFFSET, addr);
    }

    pub fn transport_dest(&self) -> Address {
        self.read_address(TRANSPORT_DEST_OFFSET)
    }

    pub fn set_transport_dest(&mut self, addr: Address) {
        self.write_address(TRANSPORT_DEST_OFFSET, addr);
    }

    // IPv6 fixed header

    fn vtfl(&self) -> u32 {
        self.read_u32(VTFL_OFFSET)
    }

    fn set_vtfl(&mut self, value: u32) {
        self.write_u32(VTFL_OFFSET, value);
    }

    pub fn version(&self) -> u8 {
        (self.vtfl() >> 28) as u8
    }

    pub fn set_version(&mut self, version: u8) {
        let vtfl = (self.vtfl() & 0x0fff_ffff) | (((version & 0x0f) as u32) << 28);
        self.set_vtfl(vtfl);
    }

    pub fn traffic_class(&self) -> u8 {
        (self.vtfl() >> 20) as u8
    }

    pub fn set_traffic_class(&mut self, class: u8) {
        let vtfl = (self.vtfl() & 0xf00f_ffff) | ((class as u32) << 20);
        self.set_vtfl(vtfl);
    }

    pub fn flow_label(&self) -> u32 {
        self.vtfl() & 0x000f_ffff
    }

    pub fn set_flow_label(&mut self, label: u32) {
        let vtfl = (self.vtfl() & 0xfff0_0000) | (label & 0x000f_ffff);
        self.set_vtfl(vtfl);
    }

    /// Bytes following the fixed header: extension headers plus data
    pub fn payload_len(&self) -> u16 {
        self.read_u16(PAYLOAD_LEN_OFFSET)
    }

    pub fn set_payload_len(&mut self, len: u16) {
        self.write_u16(PAYLOAD_LEN_OFFSET, len);
    }

    pub fn next_header(&self) -> u8 {
        self.buf[NEXT_HEADER_OFFSET]
    }

    pub fn set_next_header(&mut self, next: u8) {
        self.buf[NEXT_HEADER_OFFSET] = next;
    }

    pub fn hop_limit(&self) -> u8 {
        self.buf[HOP_LIMIT_OFFSET]
    }

    pub fn set_hop_limit(&mut self, limit: u8) {
        self.buf[HOP_LIMIT_OFFSET] = limit;
    }

    pub fn src(&self) -> Address {
        self.read_address(SRC_OFFSET)
    }

    pub fn set_src(&mut self, addr: Address) {
        self.write_address(SRC_OFFSET, addr);
    }

    pub fn dest(&self) -> Address {
        self.read_address(DEST_OFFSET)
    }

    pub fn set_dest(&mut self, addr: Address) {
        self.write_address(DEST_OFFSET, addr);
    }

    /// Exchange source and destination, as when answering a packet
    pub fn swap_addresses(&mut self) {
        let src = self.src();
        let dest = self.dest();
        self.set_src(dest);
        self.set_dest(src);
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("src", &self.src())
            .field("dest", &self.dest())
            .field("next_header", &self.next_header())
            .field("payload_len", &self.payload_len())
            .field("hop_limit", &self.hop_limit())
            .finish()
    }
}
