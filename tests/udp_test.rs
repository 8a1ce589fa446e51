//! udp protocol tests

mod common;

use rustrial_net::net::udp::{self, UdpSocket};
use rustrial_net::{Address, Error, StackConfig};

#[test]
fn test_datagram_between_contexts() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let bob = common::context(&kernel, 3);

    let server = UdpSocket::new(&bob);
    assert_eq!(server.bind(Address::ZERO, 9000), Ok(9000));
    let client = UdpSocket::new(&alice);
    let client_port = client.bind(common::addr(2), 0).unwrap();

    client.send_to(common::addr(3), 9000, b"ping").unwrap();
    assert_eq!(kernel.pending(common::addr(3)), 1);

    let packet = server.try_receive(false).unwrap();
    assert_eq!(packet.src(), common::addr(2));
    assert_eq!(packet.data().unwrap(), b"ping");
    let (_, header) = udp::seek_header(&packet).unwrap();
    assert_eq!(header.src_port, client_port);
    assert_eq!(header.dest_port, 9000);
    assert!(matches!(server.try_receive(false), Err(Error::QueueEmpty)));
}

#[test]
fn test_loopback_skips_the_kernel() {
    let kernel = common::system();
    let stack = common::context(&kernel, 2);

    let a = UdpSocket::new(&stack);
    a.bind(Address::ZERO, 9000).unwrap();
    let b = UdpSocket::new(&stack);
    b.bind(Address::ZERO, 0).unwrap();

    b.send_to(common::addr(2), 9000, b"to myself").unwrap();
    assert_eq!(kernel.pending(common::addr(2)), 0);
    assert_eq!(a.receive_pending(), Ok(true));
    let packet = a.try_receive(false).unwrap();
    assert_eq!(packet.data().unwrap(), b"to myself");
}

#[test]
fn test_datagram_for_other_socket_is_parked() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let bob = common::context(&kernel, 3);

    let first = UdpSocket::new(&bob);
    first.bind(Address::ZERO, 7000).unwrap();
    let second = UdpSocket::new(&bob);
    second.bind(Address::ZERO, 7001).unwrap();

    let client = UdpSocket::new(&alice);
    client.bind(Address::ZERO, 0).unwrap();
    client.send_to(common::addr(3), 7001, b"for second").unwrap();
    client.send_to(common::addr(3), 7000, b"for first").unwrap();

    let packet = first.try_receive(false).unwrap();
    assert_eq!(packet.data().unwrap(), b"for first");
    assert_eq!(second.receive_pending(), Ok(true));
    let packet = second.try_receive(false).unwrap();
    assert_eq!(packet.data().unwrap(), b"for second");
}

#[test]
fn test_stop_when_other() {
    let kernel = common::system();
    let alice = common::context(&kernel, 2);
    let bob = common::context(&kernel, 3);

    let first = UdpSocket::new(&bob);
    first.bind(Address::ZERO, 7000).unwrap();
    let second = UdpSocket::new(&bob);
    second.bind(Address::ZERO, 7001).unwrap();

    let client = UdpSocket::new(&alice);
    client.bind(Address::ZERO, 0).unwrap();
    client.send_to(common::addr(3), 7001, b"x").unwrap();
    client.send_to(common::addr(3), 7000, b"y").unwrap();

    assert!(matches!(
        first.try_receive(true),
        Err(Error::StoppedForOtherSocket)
    ));
    assert_eq!(first.try_receive(true).unwrap().data().unwrap(), b"y");
}

#[test]
fn test_bind_conflicts() {
    let kernel = common::system();
    let stack = common::context(&kernel, 2);

    let a = UdpSocket::new(&stack);
    a.bind(common::addr(2), 53).unwrap();
    assert_eq!(a.bind(common::addr(2), 54), Err(Error::InvalidArg));
    assert_eq!(a.local_port(), Ok(53));

    let b = UdpSocket::new(&stack);
    assert_eq!(b.bind(Address::ZERO, 53), Err(Error::PortAlreadyBound));
    assert_eq!(b.local_port(), Err(Error::SocketNotBound));
    a.close().unwrap();
    assert_eq!(b.bind(Address::ZERO, 53), Ok(53));
}

#[test]
fn test_anonymous_ports_run_out() {
    let kernel = common::system();
    let stack = common::context_with(
        &kernel,
        2,
        StackConfig::default().with_anon_ports(2000, 2001),
    );

    let a = UdpSocket::new(&stack);
    let b = UdpSocket::new(&stack);
    let c = UdpSocket::new(&stack);
    assert_eq!(a.bind(Address::ZERO, 0), Ok(2000));
    assert_eq!(b.bind(Address::ZERO, 0), Ok(2001));
    assert_eq!(c.bind(Address::ZERO, 0), Err(Error::AllAnonPortsBound));

    // The search wraps around to the freed port.
    a.close().unwrap();
    assert_eq!(c.bind(Address::ZERO, 0), Ok(2000));
}

#[test]
fn test_send_needs_dest_port() {
    let kernel = common::system();
    let stack = common::context(&kernel, 2);
    let socket = UdpSocket::new(&stack);
    assert!(matches!(socket.new_packet(4), Err(Error::SocketNotBound)));

    socket.bind(Address::ZERO, 0).unwrap();
    let mut packet = socket.new_packet(4).unwrap();
    packet.set_dest(common::addr(3));
    assert_eq!(packet.data_len(), Ok(4));
    assert_eq!(socket.send(packet), Err(Error::NoDestPort));
}

#[test]
fn test_unreachable_context() {
    let kernel = common::system();
    let stack = common::context(&kernel, 2);
    let socket = UdpSocket::new(&stack);
    socket.bind(Address::ZERO, 0).unwrap();
    assert_eq!(
        socket.send_to(common::addr(77), 9, b"anyone?"),
        Err(Error::AddressUnreachable)
    );
}
