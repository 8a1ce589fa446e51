//! ip layer tests: interfaces, routing, filters and header validation

mod common;

use std::sync::Arc;

use rustrial_net::net::checksum;
use rustrial_net::net::filter::{Filter, FilterAction};
use rustrial_net::net::header::{FragmentHeader, Header, HeaderType, RoutingHeader, UdpHeader};
use rustrial_net::net::iface::IfaceId;
use rustrial_net::net::stack::StackState;
use rustrial_net::{Address, AddressMask, Error, NetStack, Packet};

fn native(stack: &NetStack) -> IfaceId {
    stack.lock().ifaces().first().unwrap()
}

/// A bare UDP datagram from `src` to `dest`, not yet sent
fn datagram(stack: &NetStack, src: Address, dest: Address) -> Packet {
    let mut packet = stack.lock().alloc_packet().unwrap();
    packet.set_src(src);
    packet.set_dest(dest);
    packet
        .append_header(&Header::Udp(UdpHeader {
            src_port: 1111,
            dest_port: 2222,
            length: 8,
            checksum: 0,
        }))
        .unwrap();
    packet
}

#[test]
fn test_iface_registration() {
    let kernel = common::system();
    let stack = common::context(&kernel, 2);

    assert_eq!(
        stack.open_native_iface(),
        Err(Error::IfaceAlreadyRegistered)
    );
    let extra = stack
        .open_iface(
            Address::from_words([0xfd01, 0, 0, 0, 0, 0, 0, 2]),
            AddressMask::new(Address::from_words([0xfd01, 0, 0, 0, 0, 0, 0, 0]), 64),
        )
        .unwrap();
    assert_eq!(stack.lock().ifaces().len(), 2);
    // Every interface starts out with the ICMP filter.
    assert_eq!(stack.lock().ifaces().get(extra).unwrap().filter_count(), 1);

    stack.close_iface(extra).unwrap();
    assert_eq!(stack.close_iface(extra), Err(Error::IfaceNotRegistered));
    assert_eq!(stack.lock().ifaces().len(), 1);
}

#[test]
fn test_default_route_picks_gateway() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let gateway = common::context(&kernel, 3);
    let outside = Address::from_words([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1]);

    let packet = datagram(&alice, common::addr(2), outside);
    assert_eq!(alice.lock().ip_send(packet), Err(Error::NoRouteToHost));

    alice
        .set_default_route(common::addr(3), native(&alice))
        .unwrap();
    let packet = datagram(&alice, common::addr(2), outside);
    alice.lock().ip_send(packet).unwrap();
    assert_eq!(kernel.pending(common::addr(3)), 1);

    // The gateway sees the original destination in the IPv6 header.
    let iface = native(&gateway);
    let packet = gateway
        .lock()
        .ip_receive_on(iface, Some(HeaderType::Udp), false)
        .unwrap()
        .unwrap();
    assert_eq!(packet.dest(), outside);
    assert_eq!(packet.transport_dest(), common::addr(3));
    assert_eq!(packet.transport_src(), common::addr(2));
}

#[test]
fn test_hop_limit_runs_out() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let _bob = common::context(&kernel, 3);

    let mut packet = datagram(&alice, common::addr(2), common::addr(3));
    packet.set_hop_limit(0);
    assert_eq!(alice.lock().ip_send(packet), Err(Error::HopLimitExceeded));
    assert_eq!(kernel.pending(common::addr(3)), 0);
}

#[test]
fn test_unexpected_protocol_is_parked() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let bob = common::context(&kernel, 3);

    let packet = datagram(&alice, common::addr(2), common::addr(3));
    alice.lock().ip_send(packet).unwrap();

    let iface = native(&bob);
    let mut stack = bob.lock();
    assert_eq!(stack.ip_receive_on(iface, Some(HeaderType::Tcp), false), Ok(None));
    assert_eq!(stack.ifaces().get(iface).unwrap().queued(), 1);
    let (found, packet) = stack.dequeue_from_any(Some(HeaderType::Udp)).unwrap();
    assert_eq!(found, iface);
    assert_eq!(packet.src(), common::addr(2));
    assert!(matches!(
        stack.ip_receive_on(iface, None, false),
        Err(Error::QueueEmpty)
    ));
}

#[test]
fn test_fragments_and_routing_headers_are_refused() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let bob = common::context(&kernel, 3);
    let iface = native(&bob);

    let mut packet = alice.lock().alloc_packet().unwrap();
    packet.set_src(common::addr(2));
    packet.set_dest(common::addr(3));
    packet
        .append_header(&Header::Fragment(FragmentHeader {
            next_header: HeaderType::None as u8,
            offset_and_flags: 1,
            identification: 42,
        }))
        .unwrap();
    alice.lock().ip_send(packet).unwrap();
    assert!(matches!(
        bob.lock().ip_receive_on(iface, None, false),
        Err(Error::FragmentsNotSupported)
    ));

    let routed = || {
        let mut packet = alice.lock().alloc_packet().unwrap();
        packet.set_src(common::addr(2));
        packet.set_dest(common::addr(3));
        packet
            .append_header(&Header::Routing(RoutingHeader {
                next_header: HeaderType::None as u8,
                routing_type: 0,
                segments_left: 0,
                data: vec![0; 4],
            }))
            .unwrap();
        alice.lock().ip_send(packet).unwrap();
    };
    routed();
    assert!(matches!(
        bob.lock().ip_receive_on(iface, None, false),
        Err(Error::RoutingNotSupported)
    ));
    routed();
    assert!(matches!(
        bob.lock().ip_receive_on(iface, None, true),
        Ok(Some(_))
    ));
}

#[test]
fn test_filters_run_in_order() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let bob = common::context(&kernel, 3);
    let iface = native(&bob);

    let dropper: Filter = Arc::new(|_: &mut StackState, _: IfaceId, packet: Packet| {
        if packet.data_len() == Ok(0) {
            FilterAction::Drop
        } else {
            FilterAction::Pass(packet)
        }
    });
    let id = bob.lock().install_filter(iface, dropper.clone()).unwrap();
    assert!(bob.lock().has_filter(iface, &dropper));

    let packet = datagram(&alice, common::addr(2), common::addr(3));
    alice.lock().ip_send(packet).unwrap();
    assert!(matches!(
        bob.lock().ip_receive_on(iface, None, false),
        Err(Error::PacketFilteredOut)
    ));

    bob.lock().uninstall_filter(iface, id).unwrap();
    assert_eq!(
        bob.lock().uninstall_filter(iface, id),
        Err(Error::DoesNotExist)
    );
    let packet = datagram(&alice, common::addr(2), common::addr(3));
    alice.lock().ip_send(packet).unwrap();
    assert!(matches!(
        bob.lock().ip_receive_on(iface, None, false),
        Ok(Some(_))
    ));
}

#[test]
fn test_header_order_is_enforced() {
    let mut packet = Packet::new();
    packet
        .append_header(&Header::Udp(UdpHeader::default()))
        .unwrap();
    assert_eq!(
        packet.append_header(&Header::Fragment(FragmentHeader {
            next_header: HeaderType::None as u8,
            offset_and_flags: 0,
            identification: 0,
        })),
        Err(Error::HeaderOutOfOrder)
    );
}

#[test]
fn test_corrupted_payload_fails_checksum() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);

    let mut packet = datagram(&alice, common::addr(2), common::addr(3));
    packet.set_data_len(5).unwrap();
    packet.data_mut().unwrap()[..5].copy_from_slice(b"abcde");
    let slot = packet.seek_header(HeaderType::Udp).unwrap().unwrap();
    let mut header = UdpHeader::decode(slot.bytes(&packet)).unwrap();
    header.length = 13;
    packet.write_header(&slot, &Header::Udp(header)).unwrap();

    checksum::fill_transport(&mut packet).unwrap();
    assert!(checksum::verify_transport(&packet).unwrap());
    packet.data_mut().unwrap()[2] ^= 0x20;
    assert!(!checksum::verify_transport(&packet).unwrap());
}
