//! timer service tests, driven tick by tick from the scheduling context

mod common;

use std::cell::Cell;
use std::rc::Rc;

use rustrial_net::config::PACKET_QUEUE_LEN;
use rustrial_net::net::udp::UdpSocket;
use rustrial_net::task::executor::Executor;
use rustrial_net::timer::{Timer, TimerRequest, TimerService, read_reply};
use rustrial_net::{Address, Error, NetStack};

fn service(scheduler: &NetStack) -> TimerService {
    TimerService::new(&mut scheduler.lock()).unwrap()
}

fn tick_socket(stack: &NetStack) -> UdpSocket {
    let socket = UdpSocket::new(stack);
    socket.bind(Address::ZERO, 0).unwrap();
    socket
}

#[test]
fn test_one_shot_timer() {
    let kernel = common::system();
    let scheduler = common::context(&kernel, common::SCHEDULER_HOST);
    let mut service = service(&scheduler);
    let client = common::context(&kernel, 2);
    let socket = tick_socket(&client);

    let timer = Timer::start(&socket, 0, 300_000, 7, false).unwrap();
    assert_eq!(timer.id(), 7);
    assert!(!timer.is_repeating());
    assert_eq!(service.poll(&mut scheduler.lock()), Ok(1));
    assert_eq!(service.pending().collect::<Vec<_>>(), [(7, 3)]);

    service.tick(&mut scheduler.lock());
    service.tick(&mut scheduler.lock());
    assert_eq!(kernel.pending(common::addr(2)), 0);
    service.tick(&mut scheduler.lock());
    assert_eq!(kernel.pending(common::addr(2)), 1);
    assert_eq!(service.client_count(), 0);

    let reply = read_reply(&socket.try_receive(false).unwrap()).unwrap();
    assert!(reply.is_tick());
    assert_eq!(reply.id, 7);
    assert_eq!(reply.error, None);
}

#[test]
fn test_repeating_timer() {
    let kernel = common::system();
    let scheduler = common::context(&kernel, common::SCHEDULER_HOST);
    let mut service = service(&scheduler);
    let client = common::context(&kernel, 2);
    let socket = tick_socket(&client);

    Timer::start(&socket, 0, 200_000, 1, true).unwrap();
    service.poll(&mut scheduler.lock()).unwrap();
    for _ in 0..6 {
        service.tick(&mut scheduler.lock());
    }
    assert_eq!(kernel.pending(common::addr(2)), 3);
    assert_eq!(service.client_count(), 1);
    assert_eq!(service.pending().collect::<Vec<_>>(), [(1, 2)]);
}

#[test]
fn test_clients_expire_in_order() {
    let kernel = common::system();
    let scheduler = common::context(&kernel, common::SCHEDULER_HOST);
    let mut service = service(&scheduler);
    let client = common::context(&kernel, 2);
    let socket = tick_socket(&client);

    Timer::start(&socket, 1, 0, 10, false).unwrap();
    Timer::start(&socket, 0, 500_000, 5, false).unwrap();
    Timer::start(&socket, 0, 500_000, 6, false).unwrap();
    assert_eq!(service.poll(&mut scheduler.lock()), Ok(3));
    assert_eq!(
        service.pending().collect::<Vec<_>>(),
        [(5, 5), (6, 5), (10, 10)]
    );

    for _ in 0..10 {
        service.tick(&mut scheduler.lock());
    }
    let ids: Vec<u32> = (0..3)
        .map(|_| read_reply(&socket.try_receive(false).unwrap()).unwrap().id)
        .collect();
    assert_eq!(ids, [5, 6, 10]);
}

#[test]
fn test_bad_requests_get_error_replies() {
    let kernel = common::system();
    let scheduler = common::context(&kernel, common::SCHEDULER_HOST);
    let mut service = service(&scheduler);
    let client = common::context(&kernel, 2);
    let socket = tick_socket(&client);
    let port = socket.local_port().unwrap();

    let mut request = TimerRequest::open(3, 1, 0, false);
    request.version = 99;
    assert_eq!(
        service.handle_request(&mut scheduler.lock(), common::addr(2), port, &request),
        Err(Error::WrongProtocolVersion)
    );
    let reply = read_reply(&socket.try_receive(false).unwrap()).unwrap();
    assert_eq!(reply.id, 3);
    assert_eq!(reply.error, Some(Error::WrongProtocolVersion));
    assert!(!reply.is_tick());

    let request = TimerRequest::open(4, 0, 0, false);
    assert_eq!(
        service.handle_request(&mut scheduler.lock(), common::addr(2), port, &request),
        Err(Error::InvalidArg)
    );
    let reply = read_reply(&socket.try_receive(false).unwrap()).unwrap();
    assert_eq!(reply.error, Some(Error::InvalidArg));

    let mut request = TimerRequest::open(5, 1, 0, false);
    request.cmd = 0x77;
    assert_eq!(
        service.handle_request(&mut scheduler.lock(), common::addr(2), port, &request),
        Ok(())
    );
    let reply = read_reply(&socket.try_receive(false).unwrap()).unwrap();
    assert_eq!(reply.error, Some(Error::BadProtocolCmd));
    assert_eq!(service.client_count(), 0);
}

#[test]
fn test_vanished_client_is_dropped() {
    let kernel = common::system();
    let scheduler = common::context(&kernel, common::SCHEDULER_HOST);
    let mut service = service(&scheduler);
    let client = common::context(&kernel, 2);
    let socket = tick_socket(&client);

    Timer::start(&socket, 0, 100_000, 1, true).unwrap();
    service.poll(&mut scheduler.lock()).unwrap();
    drop(socket);
    drop(client);
    assert!(!kernel.is_attached(common::addr(2)));

    service.tick(&mut scheduler.lock());
    assert_eq!(service.client_count(), 0);
}

#[test]
fn test_client_with_full_inbox_is_dropped() {
    let kernel = common::system();
    let scheduler = common::context(&kernel, common::SCHEDULER_HOST);
    let mut service = service(&scheduler);
    let client = common::context(&kernel, 2);
    let socket = tick_socket(&client);

    Timer::start(&socket, 0, 100_000, 1, true).unwrap();
    service.poll(&mut scheduler.lock()).unwrap();

    let other = common::context(&kernel, 3);
    let sender = tick_socket(&other);
    for _ in 0..PACKET_QUEUE_LEN {
        sender.send_to(common::addr(2), 9, b"x").unwrap();
    }
    assert_eq!(kernel.pending(common::addr(2)), PACKET_QUEUE_LEN);

    service.tick(&mut scheduler.lock());
    assert_eq!(service.client_count(), 0);
    assert_eq!(kernel.pending(common::addr(2)), PACKET_QUEUE_LEN);
}

#[test]
fn test_second_service_cannot_bind() {
    let kernel = common::system();
    let scheduler = common::context(&kernel, common::SCHEDULER_HOST);
    let first = service(&scheduler);
    assert_eq!(
        TimerService::new(&mut scheduler.lock()).unwrap_err(),
        Error::PortAlreadyBound
    );
    first.close(&mut scheduler.lock()).unwrap();
    service(&scheduler);
}

#[test]
fn test_ticks_reach_a_waiting_task() {
    let kernel = common::system();
    let mut executor = Executor::new();
    common::scheduler(&kernel, &mut executor);
    let client = common::context(&kernel, 2);
    let ticks = Rc::new(Cell::new(0));

    let seen = ticks.clone();
    executor
        .spawn(async move {
            let socket = tick_socket(&client);
            Timer::start(&socket, 0, 100_000, 42, true).unwrap();
            while seen.get() < 5 {
                let packet = socket.receive().await.unwrap();
                let reply = read_reply(&packet).unwrap();
                assert_eq!(reply.id, 42);
                seen.set(seen.get() + 1);
            }
        })
        .unwrap();
    executor.run_until_complete(10_000).unwrap();
    assert_eq!(ticks.get(), 5);
}
