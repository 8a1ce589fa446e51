//! ICMPv6 (RFC 4443)
//!
//! Installed as a receive filter on every interface. Echo requests are
//! answered on the spot; destination-unreachable messages about one of our
//! TCP connections mark that socket as failed. Echo replies are passed on
//! to whoever is waiting for them. Error messages about our own packets are
//! generated with [`StackState::icmp_send_error`].

use alloc::sync::Arc;
use core::fmt;

use lazy_static::lazy_static;
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::net::addr::Address;
use crate::net::checksum;
use crate::net::filter::{Filter, FilterAction};
use crate::net::header::{Header, HeaderType, ICMP_HEADER_SIZE, IcmpHeader};
use crate::net::iface::IfaceId;
use crate::net::packet::{HEADERS_OFFSET, IPV6_HEADER_SIZE, IPV6_OFFSET, Packet};
use crate::net::stack::StackState;

/// ICMPv6 message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    /// Destination Unreachable (Type 1)
    DestinationUnreachable,
    /// Packet Too Big (Type 2)
    PacketTooBig,
    /// Time Exceeded (Type 3)
    TimeExceeded,
    /// Parameter Problem (Type 4)
    ParameterProblem,
    /// Echo Request (Type 128)
    EchoRequest,
    /// Echo Reply (Type 129)
    EchoReply,
    /// Unknown type
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            1 => IcmpType::DestinationUnreachable,
            2 => IcmpType::PacketTooBig,
            3 => IcmpType::TimeExceeded,
            4 => IcmpType::ParameterProblem,
            128 => IcmpType::EchoRequest,
            129 => IcmpType::EchoReply,
            other => IcmpType::Unknown(other),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(icmp_type: IcmpType) -> Self {
        match icmp_type {
            IcmpType::DestinationUnreachable => 1,
            IcmpType::PacketTooBig => 2,
            IcmpType::TimeExceeded => 3,
            IcmpType::ParameterProblem => 4,
            IcmpType::EchoRequest => 128,
            IcmpType::EchoReply => 129,
            IcmpType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for IcmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpType::DestinationUnreachable => write!(f, "Destination Unreachable"),
            IcmpType::PacketTooBig => write!(f, "Packet Too Big"),
            IcmpType::TimeExceeded => write!(f, "Time Exceeded"),
            IcmpType::ParameterProblem => write!(f, "Parameter Problem"),
            IcmpType::EchoRequest => write!(f, "Echo Request"),
            IcmpType::EchoReply => write!(f, "Echo Reply"),
            IcmpType::Unknown(val) => write!(f, "Unknown ({})", val),
        }
    }
}

/// Destination Unreachable codes
pub mod unreachable {
    pub const NO_ROUTE: u8 = 0;
    pub const PROHIBITED: u8 = 1;
    pub const OUT_OF_SCOPE: u8 = 2;
    pub const ADDRESS: u8 = 3;
    pub const PORT: u8 = 4;
    pub const FAILED_POLICY: u8 = 5;
    pub const REJECT_ROUTE: u8 = 6;
}

/// Parameter Problem code for an unrecognized option
pub const PARAM_PROBLEM_OPTION: u8 = 2;

lazy_static! {
    static ref ICMP_FILTER: Filter = Arc::new(icmp_filter);
}

fn icmp_filter(stack: &mut StackState, iface: IfaceId, packet: Packet) -> FilterAction {
    let local = match stack.ifaces.get(iface) {
        Ok(iface) => iface.address(),
        Err(error) => return FilterAction::Error(error),
    };
    if packet.dest() != local {
        return FilterAction::Pass(packet);
    }
    let slot = match packet.seek_header(HeaderType::Icmp) {
        Ok(Some(slot)) => slot,
        Ok(None) => return FilterAction::Pass(packet),
        Err(error) => return FilterAction::Error(error),
    };
    let header = match IcmpHeader::decode(slot.bytes(&packet)) {
        Ok(header) => header,
        Err(error) => return FilterAction::Error(error),
    };

    match IcmpType::from(header.icmp_type) {
        IcmpType::EchoRequest => match echo_reply(stack, iface, &packet, &header) {
            Ok(()) => FilterAction::Replied,
            Err(error) => {
                warn!("[ICMP] echo reply to {} failed: {}", packet.src(), error);
                FilterAction::Error(error)
            }
        },
        IcmpType::EchoReply => FilterAction::Pass(packet),
        IcmpType::DestinationUnreachable => destination_unreachable(stack, &packet, header.code),
        other => {
            debug!("[ICMP] unimplemented type {}", other);
            FilterAction::Error(Error::NotImplemented)
        }
    }
}

/// A reply skeleton heading back to where `original` came from
fn reply_to(stack: &StackState, original: &Packet, header: IcmpHeader) -> Result<Packet> {
    let mut reply = stack.alloc_packet()?;
    reply.set_transport_src(original.transport_dest());
    reply.set_transport_dest(original.transport_src());
    reply.set_src(original.dest());
    reply.set_dest(original.src());
    reply.append_header(&Header::Icmp(header))?;
    Ok(reply)
}

/// Copy `data` into the reply's payload, truncated to fit
fn fill_payload(reply: &mut Packet, data: &[u8]) -> Result<()> {
    let room = reply.capacity() - HEADERS_OFFSET - ICMP_HEADER_SIZE;
    let len = room.min(data.len());
    reply.set_data_len(len)?;
    reply.data_mut()?[..len].copy_from_slice(&data[..len]);
    checksum::fill_transport(reply)?;
    Ok(())
}

fn echo_reply(stack: &mut StackState, iface: IfaceId, request: &Packet, header: &IcmpHeader) -> Result<()> {
    let mut reply = reply_to(
        stack,
        request,
        IcmpHeader {
            icmp_type: IcmpType::EchoReply.into(),
            code: 0,
            checksum: 0,
            rest: header.rest,
        },
    )?;
    fill_payload(&mut reply, request.data()?)?;
    debug!(
        "[ICMP] echo reply to {} id={} seq={}",
        request.src(),
        header.identifier(),
        header.sequence()
    );
    stack.ip_send_on(iface, reply)
}

/// Fail the TCP connection the quoted segment belongs to
fn destination_unreachable(stack: &mut StackState, message: &Packet, code: u8) -> FilterAction {
    let quoted = match message.data() {
        Ok(data) => data,
        Err(error) => return FilterAction::Error(error),
    };
    if quoted.len() < IPV6_HEADER_SIZE {
        return FilterAction::Error(Error::PacketTooShort);
    }

    // Rebuild the quoted datagram so its headers can be walked.
    let mut original = Packet::with_capacity(IPV6_OFFSET + quoted.len());
    original.bytes_mut()[IPV6_OFFSET..].copy_from_slice(quoted);

    match original.seek_header(HeaderType::Tcp) {
        Ok(Some(slot)) if slot.end() <= original.capacity() => {
            let bytes = slot.bytes(&original);
            let local_port = u16::from_be_bytes([bytes[0], bytes[1]]);
            let remote_port = u16::from_be_bytes([bytes[2], bytes[3]]);
            if stack.tcp_report_unreachable(local_port, original.dest(), remote_port) {
                info!(
                    "[ICMP] {}:{} unreachable (code {})",
                    original.dest(),
                    remote_port,
                    code
                );
                FilterAction::Replied
            } else {
                FilterAction::Drop
            }
        }
        Ok(_) | Err(_) => {
            debug!("[ICMP] destination unreachable (code {}) for non-TCP packet", code);
            FilterAction::Drop
        }
    }
}

impl StackState {
    /// Install the ICMP filter on `iface`; installing twice is a no-op
    pub fn icmp_install(&mut self, iface: IfaceId) -> Result<()> {
        if self.has_filter(iface, &ICMP_FILTER) {
            return Ok(());
        }
        self.install_filter(iface, ICMP_FILTER.clone())?;
        Ok(())
    }

    /// Report a problem with `original` back to its sender
    ///
    /// The message quotes as much of the original datagram, starting at its
    /// IPv6 header, as fits in one packet.
    pub fn icmp_send_error(
        &mut self,
        iface: IfaceId,
        icmp_type: IcmpType,
        code: u8,
        original: &Packet,
    ) -> Result<()> {
        let mut reply = reply_to(
            self,
            original,
            IcmpHeader {
                icmp_type: icmp_type.into(),
                code,
                checksum: 0,
                rest: [0; 4],
            },
        )?;
        let datagram = &original.bytes()[IPV6_OFFSET..];
        let len = datagram
            .len()
            .min(original.payload_len() as usize + IPV6_HEADER_SIZE);
        fill_payload(&mut reply, &datagram[..len])?;
        self.ip_send_on(iface, reply)?;
        info!("[ICMP] sent {} (code {}) to {}", icmp_type, code, original.src());
        Ok(())
    }

    pub fn icmp_send_destination_unreachable(
        &mut self,
        iface: IfaceId,
        code: u8,
        original: &Packet,
    ) -> Result<()> {
        self.icmp_send_error(iface, IcmpType::DestinationUnreachable, code, original)
    }

    /// Send an echo request to `dest`
    ///
    /// The reply, once it arrives, is handed out by
    /// [`ip_receive`](StackState::ip_receive) with protocol ICMP.
    pub fn icmp_send_echo_request(
        &mut self,
        dest: Address,
        identifier: u16,
        sequence: u16,
        data: &[u8],
    ) -> Result<()> {
        let route = self.ifaces.route(dest)?;
        let mut request = self.alloc_packet()?;
        request.set_src(self.ifaces.get(route.iface)?.address());
        request.set_dest(dest);
        let mut header = IcmpHeader {
            icmp_type: IcmpType::EchoRequest.into(),
            ..Default::default()
        };
        header.set_echo(identifier, sequence);
        request.append_header(&Header::Icmp(header))?;
        fill_payload(&mut request, data)?;
        self.ip_send(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_type_conversion() {
        assert_eq!(IcmpType::from(128), IcmpType::EchoRequest);
        assert_eq!(IcmpType::from(1), IcmpType::DestinationUnreachable);
        assert_eq!(u8::from(IcmpType::EchoReply), 129);
        assert_eq!(IcmpType::from(200), IcmpType::Unknown(200));
    }

    #[test]
    fn test_icmp_type_display() {
        use alloc::string::ToString;
        assert_eq!(IcmpType::ParameterProblem.to_string(), "Parameter Problem");
        assert_eq!(IcmpType::Unknown(7).to_string(), "Unknown (7)");
    }
}
