//! Shared setup: one simulated system per test, contexts under fd00::/64

#![allow(dead_code)]

use std::sync::Arc;

use rustrial_net::kernel::sim::SimKernel;
use rustrial_net::task::executor::Executor;
use rustrial_net::timer::TimerService;
use rustrial_net::{Address, AddressMask, NetStack, StackConfig};

pub const SCHEDULER_HOST: u16 = 1;

pub fn addr(host: u16) -> Address {
    Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, host])
}

pub fn system() -> Arc<SimKernel> {
    SimKernel::new(addr(SCHEDULER_HOST), AddressMask::new(addr(0), 64))
}

/// A context at `host` with its native interface open
pub fn context(kernel: &Arc<SimKernel>, host: u16) -> NetStack {
    context_with(kernel, host, StackConfig::default())
}

pub fn context_with(kernel: &Arc<SimKernel>, host: u16, config: StackConfig) -> NetStack {
    let port = kernel.attach(addr(host)).unwrap();
    let stack = NetStack::new(port, config);
    stack.open_native_iface().unwrap();
    stack
}

/// The scheduling context, with the timer service running in the background
pub fn scheduler(kernel: &Arc<SimKernel>, executor: &mut Executor) -> NetStack {
    let stack = context(kernel, SCHEDULER_HOST);
    let service = TimerService::new(&mut stack.lock()).unwrap();
    let runner = stack.clone();
    executor
        .spawn_background(async move {
            // Only returns on a stack failure; the foreground tasks then stall.
            let _ = service.run(runner).await;
        })
        .unwrap();
    stack
}
