//! Extension and transport headers
//!
//! Every header kind that can follow the fixed IPv6 header has a payload
//! struct here with `decode`/`encode` against its standard wire format.
//! Headers are decoded on demand from the packet buffer; nothing in the
//! buffer is ever rewritten into host order.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{Error, Result};

/// IANA next-header numbers the stack understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderType {
    HopByHop = 0,
    Tcp = 6,
    Udp = 17,
    Routing = 43,
    Fragment = 44,
    Esp = 50,
    Auth = 51,
    Icmp = 58,
    /// No next header
    None = 59,
    Destination = 60,
}

impl HeaderType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HeaderType::HopByHop),
            6 => Some(HeaderType::Tcp),
            17 => Some(HeaderType::Udp),
            43 => Some(HeaderType::Routing),
            44 => Some(HeaderType::Fragment),
            50 => Some(HeaderType::Esp),
            51 => Some(HeaderType::Auth),
            58 => Some(HeaderType::Icmp),
            59 => Some(HeaderType::None),
            60 => Some(HeaderType::Destination),
            _ => None,
        }
    }

    /// Position in the canonical header order; transports share the last slot
    pub fn order(self) -> u8 {
        match self {
            HeaderType::HopByHop => 1,
            HeaderType::Destination => 2,
            HeaderType::Routing => 3,
            HeaderType::Fragment => 4,
            HeaderType::Auth => 5,
            HeaderType::Esp => 6,
            HeaderType::Tcp | HeaderType::Udp | HeaderType::Icmp => 7,
            HeaderType::None => 8,
        }
    }

    /// TCP, UDP and ICMP end the header chain
    pub fn is_transport(self) -> bool {
        matches!(self, HeaderType::Tcp | HeaderType::Udp | HeaderType::Icmp)
    }

    /// Size of a header of this kind whose bytes start `bytes`
    ///
    /// Needs at most the first 13 bytes. ESP has no size rule.
    pub fn header_size(self, bytes: &[u8]) -> Result<usize> {
        let byte = |index: usize| bytes.get(index).copied().ok_or(Error::PacketTooShort);
        match self {
            HeaderType::HopByHop | HeaderType::Destination | HeaderType::Routing => {
                Ok(8 * (byte(1)? as usize + 1))
            }
            HeaderType::Fragment => Ok(FRAGMENT_HEADER_SIZE),
            HeaderType::Auth => Ok(4 * (byte(1)? as usize + 2)),
            HeaderType::Udp => Ok(UDP_HEADER_SIZE),
            HeaderType::Icmp => Ok(ICMP_HEADER_SIZE),
            HeaderType::Tcp => {
                let size = (byte(12)? >> 4) as usize * 4;
                if size < TCP_HEADER_SIZE {
                    return Err(Error::PacketTooShort);
                }
                Ok(size)
            }
            HeaderType::Esp | HeaderType::None => Err(Error::NotImplemented),
        }
    }
}

impl fmt::Display for HeaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeaderType::HopByHop => "hop-by-hop",
            HeaderType::Tcp => "TCP",
            HeaderType::Udp => "UDP",
            HeaderType::Routing => "routing",
            HeaderType::Fragment => "fragment",
            HeaderType::Esp => "ESP",
            HeaderType::Auth => "auth",
            HeaderType::Icmp => "ICMPv6",
            HeaderType::None => "none",
            HeaderType::Destination => "destination",
        };
        f.write_str(name)
    }
}

pub const UDP_HEADER_SIZE: usize = 8;
pub const ICMP_HEADER_SIZE: usize = 8;
pub const FRAGMENT_HEADER_SIZE: usize = 8;
/// TCP header without options
pub const TCP_HEADER_SIZE: usize = 20;

/// Offset of the checksum field inside each transport header
pub const UDP_CHECKSUM_OFFSET: usize = 6;
pub const TCP_CHECKSUM_OFFSET: usize = 16;
pub const ICMP_CHECKSUM_OFFSET: usize = 2;

fn be16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn check_len(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        Err(Error::PacketTooShort)
    } else {
        Ok(())
    }
}

/// Hop-by-hop and destination options headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsHeader {
    pub next_header: u8,
    /// Option TLVs, padded so that `2 + options.len()` is a multiple of 8
    pub options: Vec<u8>,
}

impl OptionsHeader {
    /// An empty header padded with a single PadN option
    pub fn empty() -> Self {
        Self {
            next_header: HeaderType::None as u8,
            options: alloc::vec![1, 4, 0, 0, 0, 0],
        }
    }

    pub fn size(&self) -> usize {
        2 + self.options.len()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 2)?;
        let size = 8 * (bytes[1] as usize + 1);
        check_len(bytes, size)?;
        Ok(Self {
            next_header: bytes[0],
            options: bytes[2..size].to_vec(),
        })
    }

    fn encode(&self, out: &mut [u8]) -> Result<()> {
        let size = self.size();
        if size % 8 != 0 {
            return Err(Error::InvalidArg);
        }
        out[0] = self.next_header;
        out[1] = (size / 8 - 1) as u8;
        out[2..size].copy_from_slice(&self.options);
        Ok(())
    }

    /// Iterate the options as `(type, data)` pairs
    pub fn iter_options(&self) -> OptionIter<'_> {
        OptionIter {
            bytes: &self.options,
            offset: 0,
        }
    }
}

/// One TLV inside an options header; Pad1 is reported with empty data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderOption<'a> {
    pub kind: u8,
    pub data: &'a [u8],
}

impl HeaderOption<'_> {
    pub const PAD1: u8 = 0;

    /// Action on an unrecognized option, from the two high bits of the type
    pub fn category(&self) -> u8 {
        self.kind >> 6
    }
}

pub struct OptionIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = Result<HeaderOption<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let kind = *self.bytes.get(self.offset)?;
        if kind == HeaderOption::PAD1 {
            self.offset += 1;
            return Some(Ok(HeaderOption { kind, data: &[] }));
        }
        let Some(&len) = self.bytes.get(self.offset + 1) else {
            self.offset = self.bytes.len();
            return Some(Err(Error::PacketTooShort));
        };
        let start = self.offset + 2;
        let end = start + len as usize;
        if end > self.bytes.len() {
            self.offset = self.bytes.len();
            return Some(Err(Error::PacketTooShort));
        }
        self.offset = end;
        Some(Ok(HeaderOption {
            kind,
            data: &self.bytes[start..end],
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHeader {
    pub next_header: u8,
    pub routing_type: u8,
    pub segments_left: u8,
    /// Type-specific data after the first four bytes
    pub data: Vec<u8>,
}

impl RoutingHeader {
    pub fn size(&self) -> usize {
        4 + self.data.len()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 4)?;
        let size = 8 * (bytes[1] as usize + 1);
        check_len(bytes, size)?;
        Ok(Self {
            next_header: bytes[0],
            routing_type: bytes[2],
            segments_left: bytes[3],
            data: bytes[4..size].to_vec(),
        })
    }

    fn encode(&self, out: &mut [u8]) -> Result<()> {
        let size = self.size();
        if size % 8 != 0 {
            return Err(Error::InvalidArg);
        }
        out[0] = self.next_header;
        out[1] = (size / 8 - 1) as u8;
        out[2] = self.routing_type;
        out[3] = self.segments_left;
        out[4..size].copy_from_slice(&self.data);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub next_header: u8,
    /// Fragment offset (13 bits), reserved bits and the more-fragments flag
    pub offset_and_flags: u16,
    pub identification: u32,
}

impl FragmentHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, FRAGMENT_HEADER_SIZE)?;
        Ok(Self {
            next_header: bytes[0],
            offset_and_flags: be16(bytes, 2),
            identification: be32(bytes, 4),
        })
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.next_header;
        out[1] = 0;
        out[2..4].copy_from_slice(&self.offset_and_flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.identification.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub next_header: u8,
    pub spi: u32,
    pub sequence: u32,
    pub icv: Vec<u8>,
}

impl AuthHeader {
    pub fn size(&self) -> usize {
        12 + self.icv.len()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, 12)?;
        let size = 4 * (bytes[1] as usize + 2);
        check_len(bytes, size)?;
        if size < 12 {
            return Err(Error::PacketTooShort);
        }
        Ok(Self {
            next_header: bytes[0],
            spi: be32(bytes, 4),
            sequence: be32(bytes, 8),
            icv: bytes[12..size].to_vec(),
        })
    }

    fn encode(&self, out: &mut [u8]) -> Result<()> {
        let size = self.size();
        if size % 4 != 0 {
            return Err(Error::InvalidArg);
        }
        out[0] = self.next_header;
        out[1] = (size / 4 - 2) as u8;
        out[2] = 0;
        out[3] = 0;
        out[4..8].copy_from_slice(&self.spi.to_be_bytes());
        out[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        out[12..size].copy_from_slice(&self.icv);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dest_port: u16,
    /// Header plus data
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, UDP_HEADER_SIZE)?;
        Ok(Self {
            src_port: be16(bytes, 0),
            dest_port: be16(bytes, 2),
            length: be16(bytes, 4),
            checksum: be16(bytes, 6),
        })
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dest_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
    }
}

/// TCP control flags, as carried in the low bits of the offset/flags word
pub mod flags {
    pub const FIN: u16 = 0x01; // No more data from sender
    pub const SYN: u16 = 0x02; // Synchronize sequence numbers
    pub const RST: u16 = 0x04; // Reset connection
    pub const PSH: u16 = 0x08; // Push function
    pub const ACK: u16 = 0x10; // Acknowledgment field significant
    pub const URG: u16 = 0x20; // Urgent pointer field significant
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Control bits; the data offset is derived from `options`
    pub flags: u16,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    /// Options, padded to a multiple of four bytes
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub fn size(&self) -> usize {
        TCP_HEADER_SIZE + self.options.len()
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, TCP_HEADER_SIZE)?;
        let offset_and_flags = be16(bytes, 12);
        let size = (offset_and_flags >> 12) as usize * 4;
        if size < TCP_HEADER_SIZE {
            return Err(Error::PacketTooShort);
        }
        check_len(bytes, size)?;
        Ok(Self {
            src_port: be16(bytes, 0),
            dest_port: be16(bytes, 2),
            seq: be32(bytes, 4),
            ack: be32(bytes, 8),
            flags: offset_and_flags & 0x0fff,
            window: be16(bytes, 14),
            checksum: be16(bytes, 16),
            urgent: be16(bytes, 18),
            options: bytes[TCP_HEADER_SIZE..size].to_vec(),
        })
    }

    fn encode(&self, out: &mut [u8]) -> Result<()> {
        let size = self.size();
        if size % 4 != 0 || size > 60 {
            return Err(Error::InvalidArg);
        }
        let offset_and_flags = ((size / 4) as u16) << 12 | (self.flags & 0x0fff);
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dest_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12..14].copy_from_slice(&offset_and_flags.to_be_bytes());
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        out[TCP_HEADER_SIZE..size].copy_from_slice(&self.options);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Type-specific word: identifier and sequence for echo messages
    pub rest: [u8; 4],
}

impl IcmpHeader {
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.rest[0], self.rest[1]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.rest[2], self.rest[3]])
    }

    pub fn set_echo(&mut self, identifier: u16, sequence: u16) {
        self.rest[0..2].copy_from_slice(&identifier.to_be_bytes());
        self.rest[2..4].copy_from_slice(&sequence.to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, ICMP_HEADER_SIZE)?;
        let mut rest = [0u8; 4];
        rest.copy_from_slice(&bytes[4..8]);
        Ok(Self {
            icmp_type: bytes[0],
            code: bytes[1],
            checksum: be16(bytes, 2),
            rest,
        })
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.icmp_type;
        out[1] = self.code;
        out[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        out[4..8].copy_from_slice(&self.rest);
    }
}

/// A decoded header of any supported kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    HopByHop(OptionsHeader),
    Destination(OptionsHeader),
    Routing(RoutingHeader),
    Fragment(FragmentHeader),
    Auth(AuthHeader),
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp(IcmpHeader),
}

impl Header {
    pub fn kind(&self) -> HeaderType {
        match self {
            Header::HopByHop(_) => HeaderType::HopByHop,
            Header::Destination(_) => HeaderType::Destination,
            Header::Routing(_) => HeaderType::Routing,
            Header::Fragment(_) => HeaderType::Fragment,
            Header::Auth(_) => HeaderType::Auth,
            Header::Tcp(_) => HeaderType::Tcp,
            Header::Udp(_) => HeaderType::Udp,
            Header::Icmp(_) => HeaderType::Icmp,
        }
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            Header::HopByHop(h) | Header::Destination(h) => h.size(),
            Header::Routing(h) => h.size(),
            Header::Fragment(_) => FRAGMENT_HEADER_SIZE,
            Header::Auth(h) => h.size(),
            Header::Tcp(h) => h.size(),
            Header::Udp(_) => UDP_HEADER_SIZE,
            Header::Icmp(_) => ICMP_HEADER_SIZE,
        }
    }

    /// Decode a header of `kind` from the start of `bytes`
    pub fn decode(kind: HeaderType, bytes: &[u8]) -> Result<Self> {
        match kind {
            HeaderType::HopByHop => OptionsHeader::decode(bytes).map(Header::HopByHop),
            HeaderType::Destination => OptionsHeader::decode(bytes).map(Header::Destination),
            HeaderType::Routing => RoutingHeader::decode(bytes).map(Header::Routing),
            HeaderType::Fragment => FragmentHeader::decode(bytes).map(Header::Fragment),
            HeaderType::Auth => AuthHeader::decode(bytes).map(Header::Auth),
            HeaderType::Tcp => TcpHeader::decode(bytes).map(Header::Tcp),
            HeaderType::Udp => UdpHeader::decode(bytes).map(Header::Udp),
            HeaderType::Icmp => IcmpHeader::decode(bytes).map(Header::Icmp),
            HeaderType::Esp | HeaderType::None => Err(Error::NotImplemented),
        }
    }

    /// Encode into `out`, which must hold at least [`Header::size`] bytes
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        check_len(out, self.size())?;
        match self {
            Header::HopByHop(h) | Header::Destination(h) => h.encode(out),
            Header::Routing(h) => h.encode(out),
            Header::Fragment(h) => {
                h.encode(out);
                Ok(())
            }
            Header::Auth(h) => h.encode(out),
            Header::Tcp(h) => h.encode(out),
            Header::Udp(h) => {
                h.encode(out);
                Ok(())
            }
            Header::Icmp(h) => {
                h.encode(out);
                Ok(())
            }
        }
    }

    /// Next-header field of an extension header; transports have none
    pub fn next_header(&self) -> Option<u8> {
        match self {
            Header::HopByHop(h) | Header::Destination(h) => Some(h.next_header),
            Header::Routing(h) => Some(h.next_header),
            Header::Fragment(h) => Some(h.next_header),
            Header::Auth(h) => Some(h.next_header),
            Header::Tcp(_) | Header::Udp(_) | Header::Icmp(_) => None,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpHeader> {
        match self {
            Header::Tcp(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_udp(&self) -> Option<&UdpHeader> {
        match self {
            Header::Udp(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_icmp(&self) -> Option<&IcmpHeader> {
        match self {
            Header::Icmp(h) => Some(h),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rules() {
        assert_eq!(HeaderType::HopByHop.header_size(&[0, 0]).unwrap(), 8);
        assert_eq!(HeaderType::Destination.header_size(&[0, 2]).unwrap(), 24);
        assert_eq!(HeaderType::Auth.header_size(&[0, 1]).unwrap(), 12);
        assert_eq!(HeaderType::Udp.header_size(&[]).unwrap(), 8);
        let mut tcp = [0u8; 20];
        tcp[12] = 6 << 4;
        assert_eq!(HeaderType::Tcp.header_size(&tcp).unwrap(), 24);
        assert_eq!(
            HeaderType::Esp.header_size(&tcp),
            Err(Error::NotImplemented)
        );
    }

    #[test]
    fn test_tcp_header_codec() {
        let header = TcpHeader {
            src_port: 1025,
            dest_port: 80,
            seq: 0xfedc_ba98,
            ack: 7,
            flags: flags::SYN | flags::ACK,
            window: 16384,
            checksum: 0,
            urgent: 0,
            options: alloc::vec![2, 4, 0x05, 0xb4],
        };
        let mut bytes = [0u8; 24];
        Header::Tcp(header.clone()).encode(&mut bytes).unwrap();
        assert_eq!(bytes[12], 6 << 4);
        assert_eq!(bytes[13], 0x12);
        assert_eq!(TcpHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_option_iteration() {
        let header = OptionsHeader {
            next_header: 59,
            options: alloc::vec![0, 0x05, 2, 0, 0, 1, 0],
        };
        let options: Vec<_> = header.iter_options().collect::<Result<_>>().unwrap();
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].kind, HeaderOption::PAD1);
        assert_eq!(options[1].kind, 0x05);
        assert_eq!(options[1].data, &[0, 0]);
        assert_eq!(options[2].kind, 1);
        assert_eq!(options[2].category(), 0);
    }

    #[test]
    fn test_order_is_canonical() {
        let chain = [
            HeaderType::HopByHop,
            HeaderType::Destination,
            HeaderType::Routing,
            HeaderType::Fragment,
            HeaderType::Auth,
            HeaderType::Esp,
            HeaderType::Tcp,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].order() < pair[1].order());
        }
        assert_eq!(HeaderType::Udp.order(), HeaderType::Icmp.order());
    }
}
