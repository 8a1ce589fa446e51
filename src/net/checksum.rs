//! Internet checksum over the IPv6 pseudo-header (RFC 2460 §8.1)
//!
//! The sum covers the source and destination addresses, the upper-layer
//! length, the next-header value and the upper-layer segment itself with the
//! checksum field counted as zero.

use crate::error::{Error, Result};
use crate::net::header::{
    HeaderType, ICMP_CHECKSUM_OFFSET, TCP_CHECKSUM_OFFSET, UDP_CHECKSUM_OFFSET, UDP_HEADER_SIZE,
};
use crate::net::iter::HeaderSlot;
use crate::net::packet::{HEADERS_OFFSET, IPV6_OFFSET, Packet};

/// Offset of the checksum field inside a transport header
fn checksum_field(kind: HeaderType) -> Result<usize> {
    match kind {
        HeaderType::Udp => Ok(UDP_CHECKSUM_OFFSET),
        HeaderType::Tcp => Ok(TCP_CHECKSUM_OFFSET),
        HeaderType::Icmp => Ok(ICMP_CHECKSUM_OFFSET),
        _ => Err(Error::InvalidArg),
    }
}

/// Add `bytes` as big-endian 16-bit words; an odd last byte is the high half
fn sum_words(bytes: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Bytes of the upper-layer segment starting at `slot`
fn segment_len(packet: &Packet, slot: &HeaderSlot) -> Result<usize> {
    let before = slot.offset - HEADERS_OFFSET;
    let len = (packet.payload_len() as usize)
        .checked_sub(before)
        .ok_or(Error::InvalidArg)?;
    if slot.offset + len > packet.capacity() || len < slot.size {
        return Err(Error::InvalidArg);
    }
    Ok(len)
}

/// Compute the checksum of the transport segment at `slot`
///
/// Whatever is currently stored in the checksum field is ignored. UDP
/// additionally requires its length field to agree with the packet.
pub fn compute(packet: &Packet, slot: &HeaderSlot) -> Result<u16> {
    let field = checksum_field(slot.kind)?;
    let len = segment_len(packet, slot)?;
    let bytes = packet.bytes();

    if slot.kind == HeaderType::Udp {
        let udp_len = packet.read_u16(slot.offset + 4) as usize;
        if udp_len < UDP_HEADER_SIZE || udp_len != len {
            return Err(Error::InvalidArg);
        }
    }

    // Source and destination addresses: bytes 8..40 of the fixed header.
    let mut sum = sum_words(&bytes[IPV6_OFFSET + 8..HEADERS_OFFSET]);
    sum = sum.wrapping_add((len as u32) >> 16);
    sum = sum.wrapping_add(len as u32 & 0xffff);
    sum = sum.wrapping_add(slot.kind as u32);

    let segment = &bytes[slot.offset..slot.offset + len];
    sum = sum.wrapping_add(sum_words(segment));
    let stored = u16::from_be_bytes([segment[field], segment[field + 1]]);
    // Take the stored value back out so the field counts as zero.
    sum = sum.wrapping_add((!stored) as u32);

    Ok(!fold(sum))
}

/// Compute and store the checksum of the segment at `slot`
pub fn fill(packet: &mut Packet, slot: &HeaderSlot) -> Result<u16> {
    let checksum = compute(packet, slot)?;
    let field = checksum_field(slot.kind)?;
    packet.write_u16(slot.offset + field, checksum);
    Ok(checksum)
}

/// Whether the stored checksum matches the segment
pub fn verify(packet: &Packet, slot: &HeaderSlot) -> Result<bool> {
    let field = checksum_field(slot.kind)?;
    let stored = packet.read_u16(slot.offset + field);
    Ok(compute(packet, slot)? == stored)
}

/// [`fill`] for the packet's transport header
pub fn fill_transport(packet: &mut Packet) -> Result<u16> {
    let slot = packet.last_header()?.ok_or(Error::InvalidArg)?;
    fill(packet, &slot)
}

/// [`verify`] for the packet's transport header
pub fn verify_transport(packet: &Packet) -> Result<bool> {
    let slot = packet.last_header()?.ok_or(Error::InvalidArg)?;
    verify(packet, &slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr::Address;
    use crate::net::header::{Header, IcmpHeader, UdpHeader};

    fn udp_packet(data: &[u8]) -> (Packet, HeaderSlot) {
        let mut packet = Packet::new();
        packet.set_src(Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, 1]));
        packet.set_dest(Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, 2]));
        let header = UdpHeader {
            src_port: 1025,
            dest_port: 9000,
            length: (UDP_HEADER_SIZE + data.len()) as u16,
            checksum: 0,
        };
        let slot = packet.append_header(&Header::Udp(header)).unwrap();
        packet.set_data_len(data.len()).unwrap();
        packet.data_mut().unwrap()[..data.len()].copy_from_slice(data);
        (packet, slot)
    }

    #[test]
    fn test_sum_odd_byte_is_high_half() {
        assert_eq!(sum_words(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
    }

    #[test]
    fn test_fold_carries() {
        assert_eq!(fold(0x0001_fffe), 0xffff);
        assert_eq!(fold(0x0002_ffff), 0x0002);
    }

    #[test]
    fn test_fill_then_verify() {
        let (mut packet, slot) = udp_packet(b"hello, world");
        let checksum = fill(&mut packet, &slot).unwrap();
        assert!(verify(&packet, &slot).unwrap());
        // Recomputing ignores the stored field.
        assert_eq!(compute(&packet, &slot).unwrap(), checksum);

        let offset = packet.data_offset().unwrap();
        packet.bytes_mut()[offset + 3] ^= 0x40;
        assert!(!verify(&packet, &slot).unwrap());
    }

    #[test]
    fn test_udp_length_mismatch_is_rejected() {
        let (mut packet, slot) = udp_packet(b"abc");
        packet.write_u16(slot.offset + 4, 4);
        assert_eq!(compute(&packet, &slot), Err(Error::InvalidArg));
    }

    #[test]
    fn test_icmp_checksum() {
        let mut packet = Packet::new();
        packet.set_src(Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, 1]));
        packet.set_dest(Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, 1]));
        let mut icmp = IcmpHeader {
            icmp_type: 128,
            ..Default::default()
        };
        icmp.set_echo(7, 1);
        let slot = packet.append_header(&Header::Icmp(icmp)).unwrap();
        fill(&mut packet, &slot).unwrap();
        assert!(verify_transport(&packet).unwrap());
    }
}
