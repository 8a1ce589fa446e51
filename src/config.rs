//! Protocol constants and per-stack tunables

use alloc::boxed::Box;

/// Largest datagram the stack plans for
pub const MTU: usize = 1500;

/// Size of one substrate buffer (a page)
pub const PACKET_CAPACITY: usize = 4096;

/// Packets buffered per interface, socket or context inbox
pub const PACKET_QUEUE_LEN: usize = 16;

/// Anonymous (ephemeral) port range
pub const ANON_PORT_MIN: u16 = 1025;
pub const ANON_PORT_MAX: u16 = 4095;

/// Hop limit stamped on freshly built packets
pub const DEFAULT_HOP_LIMIT: u8 = 255;

/// Well-known UDP port of the timer service
pub const TIMER_PORT: u16 = 4000;
pub const TIMER_PROTOCOL_VERSION: u16 = 1;

/// The timer service counts in tenths of a second
pub const TICKS_PER_SECOND: u32 = 10;
pub const USEC_PER_TICK: u32 = 1_000_000 / TICKS_PER_SECOND;

/// Bytes buffered per direction on a TCP socket
pub const TCP_QUEUE_SIZE: usize = 16384;

/// Ticks between retransmission attempts
pub const TCP_RETRANSMIT_TICKS: i32 = 3;

/// Ticks a socket lingers in TIME-WAIT
pub const TCP_TIME_WAIT_TICKS: i32 = 60;

/// Maximum segment size advertised on SYN (MTU minus the fixed header)
pub const TCP_MSS: u16 = (MTU - 40) as u16;

/// Outgoing data that triggers an immediate transmission
pub const TCP_SEND_THRESHOLD: usize = MTU - 40;

/// TCP ticker interval requested from the timer service
pub const TCP_TIMER_USEC: u32 = 100_000;

/// Chooses the first sequence number of a new connection
pub trait IsnGenerator: Send {
    fn generate(&mut self) -> u32;
}

/// Always hands out the same number; predictable and not attack-resistant
#[derive(Debug, Clone, Copy)]
pub struct FixedIsn(pub u32);

impl Default for FixedIsn {
    fn default() -> Self {
        FixedIsn(0xfedc_ba98)
    }
}

impl IsnGenerator for FixedIsn {
    fn generate(&mut self) -> u32 {
        log::warn!("[TCP] insecure initial sequence number: always {:#010x}", self.0);
        self.0
    }
}

impl<F> IsnGenerator for F
where
    F: FnMut() -> u32 + Send,
{
    fn generate(&mut self) -> u32 {
        self()
    }
}

/// Tunables for one network stack instance
pub struct StackConfig {
    pub queue_len: usize,
    pub anon_port_min: u16,
    pub anon_port_max: u16,
    pub hop_limit: u8,
    pub tcp_queue_size: usize,
    pub tcp_retransmit_ticks: i32,
    pub tcp_time_wait_ticks: i32,
    /// Interval of the TCP ticker, in microseconds
    pub tcp_timer_usec: u32,
    pub isn: Box<dyn IsnGenerator>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            queue_len: PACKET_QUEUE_LEN,
            anon_port_min: ANON_PORT_MIN,
            anon_port_max: ANON_PORT_MAX,
            hop_limit: DEFAULT_HOP_LIMIT,
            tcp_queue_size: TCP_QUEUE_SIZE,
            tcp_retransmit_ticks: TCP_RETRANSMIT_TICKS,
            tcp_time_wait_ticks: TCP_TIME_WAIT_TICKS,
            tcp_timer_usec: TCP_TIMER_USEC,
            isn: Box::new(FixedIsn::default()),
        }
    }
}

impl StackConfig {
    /// Replace the initial sequence number strategy
    pub fn with_isn(mut self, isn: impl IsnGenerator + 'static) -> Self {
        self.isn = Box::new(isn);
        self
    }

    /// Narrow the anonymous port range
    pub fn with_anon_ports(mut self, min: u16, max: u16) -> Self {
        self.anon_port_min = min;
        self.anon_port_max = max;
        self
    }
}

impl core::fmt::Debug for StackConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackConfig")
            .field("queue_len", &self.queue_len)
            .field("anon_port_min", &self.anon_port_min)
            .field("anon_port_max", &self.anon_port_max)
            .field("hop_limit", &self.hop_limit)
            .field("tcp_queue_size", &self.tcp_queue_size)
            .field("tcp_retransmit_ticks", &self.tcp_retransmit_ticks)
            .field("tcp_time_wait_ticks", &self.tcp_time_wait_ticks)
            .field("tcp_timer_usec", &self.tcp_timer_usec)
            .finish()
    }
}
