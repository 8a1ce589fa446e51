//! Walking the header chain
//!
//! [`HeaderIter`] follows next-header fields from the fixed header until a
//! transport header or "no next header". It yields [`HeaderSlot`]s (kind,
//! offset, size) rather than decoded headers, so callers that only need to
//! classify a packet never copy option bytes out of the buffer.

use crate::error::{Error, Result};
use crate::net::header::{Header, HeaderType};
use crate::net::packet::{HEADERS_OFFSET, Packet};

/// Where one header lives inside a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSlot {
    pub kind: HeaderType,
    pub offset: usize,
    pub size: usize,
}

impl HeaderSlot {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn bytes<'a>(&self, packet: &'a Packet) -> &'a [u8] {
        &packet.bytes()[self.offset..self.end()]
    }

    pub fn decode(&self, packet: &Packet) -> Result<Header> {
        Header::decode(self.kind, self.bytes(packet))
    }
}

/// Lazy walk over a packet's header chain
///
/// Stops after a transport header, at "no next header", or after the first
/// error (an unknown type yields `NotImplemented`). Call [`rewind`] to start
/// over.
///
/// [`rewind`]: HeaderIter::rewind
pub struct HeaderIter<'a> {
    packet: &'a Packet,
    offset: usize,
    next: u8,
}

impl<'a> HeaderIter<'a> {
    pub fn new(packet: &'a Packet) -> Self {
        Self {
            packet,
            offset: HEADERS_OFFSET,
            next: packet.next_header(),
        }
    }

    pub fn has_next(&self) -> bool {
        self.next != HeaderType::None as u8
    }

    pub fn rewind(&mut self) {
        self.offset = HEADERS_OFFSET;
        self.next = self.packet.next_header();
    }

    fn step(&mut self) -> Result<HeaderSlot> {
        let kind = HeaderType::from_u8(self.next).ok_or(Error::NotImplemented)?;
        let bytes = self
            .packet
            .bytes()
            .get(self.offset..)
            .ok_or(Error::PacketTooShort)?;
        let size = kind.header_size(bytes)?;
        if size > bytes.len() {
            return Err(Error::PacketTooShort);
        }

        let slot = HeaderSlot {
            kind,
            offset: self.offset,
            size,
        };
        self.offset += size;
        self.next = if kind.is_transport() {
            HeaderType::None as u8
        } else {
            bytes[0]
        };
        Ok(slot)
    }
}

impl Iterator for HeaderIter<'_> {
    type Item = Result<HeaderSlot>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        let result = self.step();
        if result.is_err() {
            self.next = HeaderType::None as u8;
        }
        Some(result)
    }
}

impl Packet {
    pub fn headers(&self) -> HeaderIter<'_> {
        HeaderIter::new(self)
    }

    /// Validate the whole chain, returning the last header if there is one
    pub fn last_header(&self) -> Result<Option<HeaderSlot>> {
        let mut last = None;
        for slot in self.headers() {
            last = Some(slot?);
        }
        Ok(last)
    }

    /// First header of `kind` in the chain
    pub fn seek_header(&self, kind: HeaderType) -> Result<Option<HeaderSlot>> {
        for slot in self.headers() {
            let slot = slot?;
            if slot.kind == kind {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Kind of the last header, `None` (59) for a bare packet
    pub fn protocol(&self) -> Result<HeaderType> {
        Ok(self
            .last_header()?
            .map_or(HeaderType::None, |slot| slot.kind))
    }

    /// Offset of the first data byte, just past the last header
    pub fn data_offset(&self) -> Result<usize> {
        Ok(self
            .last_header()?
            .map_or(HEADERS_OFFSET, |slot| slot.end()))
    }

    /// Payload bytes after all headers
    pub fn data_len(&self) -> Result<usize> {
        let headers = self.data_offset()? - HEADERS_OFFSET;
        (self.payload_len() as usize)
            .checked_sub(headers)
            .ok_or(Error::PacketTooShort)
    }

    pub fn set_data_len(&mut self, len: usize) -> Result<()> {
        let offset = self.data_offset()?;
        if offset + len > self.capacity() {
            return Err(Error::InvalidArg);
        }
        let payload = offset - HEADERS_OFFSET + len;
        self.set_payload_len(u16::try_from(payload).map_err(|_| Error::InvalidArg)?);
        Ok(())
    }

    pub fn data(&self) -> Result<&[u8]> {
        let offset = self.data_offset()?;
        let len = self.data_len()?;
        self.bytes()
            .get(offset..offset + len)
            .ok_or(Error::PacketTooShort)
    }

    /// The whole data area up to the buffer's capacity
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let offset = self.data_offset()?;
        Ok(&mut self.bytes_mut()[offset..])
    }

    /// Append `header` to the end of the chain
    ///
    /// The header must not come before the current last header in the
    /// canonical order, and nothing may follow a transport header. The
    /// previous header's next-header field (or the fixed header's) is
    /// pointed at the new one and the payload length grows by its size.
    pub fn append_header(&mut self, header: &Header) -> Result<HeaderSlot> {
        let kind = header.kind();
        let size = header.size();

        let last = self.last_header()?;
        let offset = match last {
            Some(last) => {
                if kind.order() < last.kind.order() || last.kind.is_transport() {
                    return Err(Error::HeaderOutOfOrder);
                }
                last.end()
            }
            None => HEADERS_OFFSET,
        };
        if offset + size > self.capacity() {
            return Err(Error::InvalidArg);
        }

        header.encode(&mut self.bytes_mut()[offset..offset + size])?;
        if !kind.is_transport() {
            // The new header ends the chain for now.
            self.bytes_mut()[offset] = HeaderType::None as u8;
        }
        match last {
            Some(last) => self.bytes_mut()[last.offset] = kind as u8,
            None => self.set_next_header(kind as u8),
        }

        let payload = (self.payload_len() as usize + size) as u16;
        self.set_payload_len(payload);
        Ok(HeaderSlot { kind, offset, size })
    }

    /// Re-encode a header in place; the size must not change
    pub fn write_header(&mut self, slot: &HeaderSlot, header: &Header) -> Result<()> {
        if header.kind() != slot.kind || header.size() != slot.size {
            return Err(Error::InvalidArg);
        }
        let next = self.bytes()[slot.offset];
        header.encode(&mut self.bytes_mut()[slot.offset..slot.end()])?;
        if !slot.kind.is_transport() {
            self.bytes_mut()[slot.offset] = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::header::{OptionsHeader, UdpHeader};

    #[test]
    fn test_bare_packet_has_no_headers() {
        let packet = Packet::new();
        assert_eq!(packet.headers().count(), 0);
        assert_eq!(packet.protocol().unwrap(), HeaderType::None);
        assert_eq!(packet.data_offset().unwrap(), HEADERS_OFFSET);
    }

    #[test]
    fn test_append_links_chain() {
        let mut packet = Packet::new();
        packet
            .append_header(&Header::HopByHop(OptionsHeader::empty()))
            .unwrap();
        packet
            .append_header(&Header::Udp(UdpHeader::default()))
            .unwrap();

        assert_eq!(packet.next_header(), HeaderType::HopByHop as u8);
        assert_eq!(packet.bytes()[HEADERS_OFFSET], HeaderType::Udp as u8);
        assert_eq!(packet.payload_len(), 16);

        let kinds: alloc::vec::Vec<_> = packet.headers().map(|slot| slot.unwrap().kind).collect();
        assert_eq!(kinds, [HeaderType::HopByHop, HeaderType::Udp]);
        assert_eq!(packet.data_offset().unwrap(), HEADERS_OFFSET + 16);
    }

    #[test]
    fn test_unknown_type_stops_iteration() {
        let mut packet = Packet::new();
        packet.set_next_header(200);
        let mut iter = packet.headers();
        assert_eq!(iter.next(), Some(Err(Error::NotImplemented)));
        assert_eq!(iter.next(), None);

        iter.rewind();
        assert!(iter.has_next());
    }

    #[test]
    fn test_data_len_round_trip() {
        let mut packet = Packet::new();
        packet
            .append_header(&Header::Udp(UdpHeader::default()))
            .unwrap();
        packet.set_data_len(100).unwrap();
        assert_eq!(packet.payload_len(), 108);
        assert_eq!(packet.data_len().unwrap(), 100);
        assert_eq!(packet.set_data_len(8192), Err(Error::InvalidArg));
    }
}
