//! Per-context network stack
//!
//! [`StackState`] is everything one context knows about networking: its
//! kernel port, its interfaces, and every UDP and TCP socket it owns. The
//! IP send and receive paths live here; protocol modules add their own
//! `impl StackState` blocks.
//!
//! [`NetStack`] is the shareable handle tasks hold. It is never locked
//! across an await point, so any number of tasks in the context can block
//! on different sockets at once.

use alloc::sync::Arc;

use log::{debug, info, trace, warn};
use spin::{Mutex, MutexGuard};

use crate::arena::Arena;
use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::kernel::PacketPort;
use crate::net::addr::{Address, AddressMask};
use crate::net::header::{Header, HeaderOption, HeaderType};
use crate::net::icmp::{self, IcmpType};
use crate::net::iface::{Iface, IfaceId, IfaceRegistry};
use crate::net::packet::Packet;
use crate::net::tcp::TcpSocketState;
use crate::net::udp::UdpSocketState;

pub struct StackState {
    port: Arc<dyn PacketPort>,
    pub(crate) config: StackConfig,
    pub(crate) ifaces: IfaceRegistry,
    pub(crate) udp_sockets: Arena<UdpSocketState>,
    pub(crate) tcp_sockets: Arena<TcpSocketState>,
    filter_ids: u32,
}

impl StackState {
    pub fn new(port: Arc<dyn PacketPort>, config: StackConfig) -> Self {
        Self {
            port,
            config,
            ifaces: IfaceRegistry::new(),
            udp_sockets: Arena::new(),
            tcp_sockets: Arena::new(),
            filter_ids: 0,
        }
    }

    /// This context's own address
    pub fn address(&self) -> Address {
        self.port.address()
    }

    pub fn scheduler_address(&self) -> Address {
        self.port.scheduler_address()
    }

    pub fn port(&self) -> &Arc<dyn PacketPort> {
        &self.port
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn ifaces(&self) -> &IfaceRegistry {
        &self.ifaces
    }

    pub(crate) fn next_filter_id(&mut self) -> u32 {
        self.filter_ids = self.filter_ids.wrapping_add(1);
        self.filter_ids
    }

    /// A fresh packet from the kernel, stamped with this stack's hop limit
    pub fn alloc_packet(&self) -> Result<Packet> {
        let mut packet = self.port.alloc()?;
        packet.set_hop_limit(self.config.hop_limit);
        Ok(packet)
    }

    /// Register a new interface and install ICMP on it
    pub fn open_iface(&mut self, address: Address, mask: AddressMask) -> Result<IfaceId> {
        let iface = Iface::new(
            address,
            mask,
            self.config.queue_len,
            self.config.anon_port_min,
        );
        let id = self.ifaces.register(iface)?;
        if let Err(error) = self.icmp_install(id) {
            self.ifaces.unregister(id)?;
            return Err(error);
        }
        info!("[IFACE] opened {} ({})", address, mask);
        Ok(id)
    }

    /// The interface for this context's own kernel address
    pub fn open_native_iface(&mut self) -> Result<IfaceId> {
        let address = self.port.address();
        let mask = self.port.system_mask();
        self.open_iface(address, mask)
    }

    /// Unregister an interface, dropping its filters, queue and TCP state
    pub fn close_iface(&mut self, id: IfaceId) -> Result<()> {
        if !self.ifaces.contains(id) {
            return Err(Error::IfaceNotRegistered);
        }
        self.tcp_close_context(id)?;
        let iface = self.ifaces.unregister(id)?;
        info!(
            "[IFACE] closed {} ({} packets dropped)",
            iface.address(),
            iface.queued()
        );
        Ok(())
    }

    pub fn set_default_route(&mut self, gateway: Address, iface: IfaceId) -> Result<()> {
        self.ifaces.set_default_route(gateway, iface)
    }

    /// Whether sends on `iface` hand the CPU to the receiving context
    pub fn set_yield_to_recipient(&mut self, iface: IfaceId, yield_to_recipient: bool) -> Result<()> {
        self.ifaces.get_mut(iface)?.yield_to_recipient = yield_to_recipient;
        Ok(())
    }

    /// Next free anonymous port for `protocol` on `iface`
    ///
    /// Searches from the interface's cursor to the top of the range, then
    /// wraps to the bottom. The cursor moves past the port handed out.
    pub(crate) fn anon_port(
        &mut self,
        iface: IfaceId,
        protocol: HeaderType,
        in_use: impl Fn(&StackState, u16) -> bool,
    ) -> Result<u16> {
        let (min, max) = (self.config.anon_port_min, self.config.anon_port_max);
        if min == 0 || min > max {
            return Err(Error::InvalidArg);
        }
        let cursor = (*self.ifaces.get_mut(iface)?.anon_cursor(protocol)?).clamp(min, max);

        let port = (cursor..=max)
            .chain(min..cursor)
            .find(|port| !in_use(self, *port))
            .ok_or(Error::AllAnonPortsBound)?;

        let next = if port == max { min } else { port + 1 };
        *self.ifaces.get_mut(iface)?.anon_cursor(protocol)? = next;
        Ok(port)
    }

    /// Put a packet back on an interface's queue, dropping it if full
    pub(crate) fn requeue(&mut self, iface: IfaceId, packet: Packet) -> Result<()> {
        let queue = &mut self.ifaces.get_mut(iface)?.queue;
        if let Err((error, packet)) = queue.enqueue(packet) {
            warn!("[IP] dropping packet from {}: {}", packet.src(), error);
            return Err(error);
        }
        Ok(())
    }

    /// Send `packet` out of `iface` as is
    ///
    /// The hop limit is decremented; a packet that has none left is
    /// discarded with `HopLimitExceeded`. The kernel delivers to the
    /// transport-level destination the caller (or [`ip_send`]) set.
    ///
    /// [`ip_send`]: StackState::ip_send
    pub fn ip_send_on(&mut self, iface: IfaceId, mut packet: Packet) -> Result<()> {
        let iface = self.ifaces.get(iface)?;
        let hop_limit = packet.hop_limit();
        if hop_limit == 0 {
            debug!("[IP] hop limit exceeded for {}", packet.dest());
            return Err(Error::HopLimitExceeded);
        }
        packet.set_hop_limit(hop_limit - 1);
        packet.set_transport_src(iface.address());
        trace!(
            "[IP] {} -> {} via {}",
            packet.src(),
            packet.dest(),
            packet.transport_dest()
        );
        self.port.send(packet, iface.yield_to_recipient)
    }

    /// Send `packet` out of `iface`, picking the next hop as [`ip_send`] would
    ///
    /// Destinations outside the interface's prefix go to the default
    /// route's gateway when that route uses this interface.
    ///
    /// [`ip_send`]: StackState::ip_send
    pub fn ip_send_via(&mut self, iface: IfaceId, mut packet: Packet) -> Result<()> {
        let dest = packet.dest();
        let next_hop = if self.ifaces.get(iface)?.mask().matches(&dest) {
            dest
        } else {
            match self.ifaces.default_route() {
                Ok((gateway, route)) if route == iface => gateway,
                _ => dest,
            }
        };
        packet.set_transport_dest(next_hop);
        self.ip_send_on(iface, packet)
    }

    /// Route `packet` by its IPv6 destination and send it
    pub fn ip_send(&mut self, mut packet: Packet) -> Result<()> {
        let dest = packet.dest();
        let route = self.ifaces.route(dest).inspect_err(|_| {
            warn!("[IP] no route to {}", dest);
        })?;
        packet.set_transport_dest(route.next_hop);
        self.ip_send_on(route.iface, packet)
    }

    /// Take the next packet for `iface`
    ///
    /// Packets already on the interface queue were filtered when they
    /// arrived and are returned as they are. Otherwise one packet is taken
    /// from the kernel, its header chain validated and the interface's
    /// filters applied. A packet whose protocol is not `expected` is queued
    /// on the interface for whoever wants it and `Ok(None)` is returned.
    pub fn ip_receive_on(
        &mut self,
        iface: IfaceId,
        expected: Option<HeaderType>,
        accept_routing: bool,
    ) -> Result<Option<Packet>> {
        match self.ifaces.get_mut(iface)?.queue.dequeue(expected) {
            Ok(packet) => return Ok(Some(packet)),
            Err(Error::QueueEmpty) => {}
            Err(error) => return Err(error),
        }

        let packet = self.port.try_receive()?;
        let protocol = self.validate_chain(iface, &packet, accept_routing)?;
        let packet = self.apply_filters(iface, packet)?;

        if expected.is_some_and(|expected| expected != protocol) {
            // Dropped with a warning when the queue is full.
            let _ = self.requeue(iface, packet);
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// Receive on the interface for this context's address, falling back
    /// to packets parked on any interface
    ///
    /// With `stop_when_other` the call gives up with `StoppedForOtherSocket`
    /// after one kernel packet that was for someone else.
    pub fn ip_receive(
        &mut self,
        expected: Option<HeaderType>,
        stop_when_other: bool,
    ) -> Result<(IfaceId, Packet)> {
        let iface = self.ifaces.lookup_receive(self.port.address())?;
        let mut first = true;
        loop {
            if !first && stop_when_other {
                return Err(Error::StoppedForOtherSocket);
            }
            first = false;

            if let Some(packet) = self.ip_receive_on(iface, expected, false)? {
                return Ok((iface, packet));
            }
            match self.dequeue_from_any(expected) {
                Ok(found) => return Ok(found),
                Err(Error::QueueEmpty) => {}
                Err(error) => return Err(error),
            }
        }
    }

    /// Oldest queued packet matching `expected` across all interfaces
    pub fn dequeue_from_any(&mut self, expected: Option<HeaderType>) -> Result<(IfaceId, Packet)> {
        let ids: alloc::vec::Vec<IfaceId> = self.ifaces.ids().to_vec();
        for id in ids {
            match self.ifaces.get_mut(id)?.queue.dequeue(expected) {
                Ok(packet) => return Ok((id, packet)),
                Err(Error::QueueEmpty) => {}
                Err(error) => return Err(error),
            }
        }
        Err(Error::QueueEmpty)
    }

    /// Check every header of a freshly received packet
    ///
    /// Returns the packet's protocol. Unknown options are handled by their
    /// type's top two bits: skip, discard, or discard and report with an
    /// ICMP parameter problem (never for multicast when the bits are 11).
    fn validate_chain(
        &mut self,
        iface: IfaceId,
        packet: &Packet,
        accept_routing: bool,
    ) -> Result<HeaderType> {
        let mut protocol = HeaderType::None;
        for slot in packet.headers() {
            let slot = slot?;
            protocol = slot.kind;
            match slot.kind {
                HeaderType::HopByHop | HeaderType::Destination => {
                    let options = match slot.decode(packet)? {
                        Header::HopByHop(options) | Header::Destination(options) => options,
                        _ => return Err(Error::InvalidArg),
                    };
                    for option in options.iter_options() {
                        let option = option?;
                        if option.kind == HeaderOption::PAD1 {
                            continue;
                        }
                        debug!(
                            "[IP] {} header: unimplemented option type {}",
                            slot.kind, option.kind
                        );
                        match option.category() {
                            0 => {}
                            1 => return Err(Error::OptionNotSupported),
                            category => {
                                if category == 2 || !packet.dest().is_multicast() {
                                    if let Err(error) = self.icmp_send_error(
                                        iface,
                                        IcmpType::ParameterProblem,
                                        icmp::PARAM_PROBLEM_OPTION,
                                        packet,
                                    ) {
                                        warn!("[IP] parameter problem not sent: {}", error);
                                    }
                                }
                                return Err(Error::OptionNotSupported);
                            }
                        }
                    }
                }
                HeaderType::Routing if !accept_routing => return Err(Error::RoutingNotSupported),
                HeaderType::Routing => {}
                HeaderType::Fragment => return Err(Error::FragmentsNotSupported),
                HeaderType::Tcp | HeaderType::Udp | HeaderType::Icmp => {}
                _ => return Err(Error::NotImplemented),
            }
        }
        Ok(protocol)
    }
}

impl core::fmt::Debug for StackState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackState")
            .field("address", &self.port.address())
            .field("ifaces", &self.ifaces.len())
            .field("udp_sockets", &self.udp_sockets.len())
            .field("tcp_sockets", &self.tcp_sockets.len())
            .finish()
    }
}

/// Shared handle to one context's [`StackState`]
#[derive(Clone)]
pub struct NetStack {
    state: Arc<Mutex<StackState>>,
}

impl NetStack {
    pub fn new(port: Arc<dyn PacketPort>, config: StackConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(StackState::new(port, config))),
        }
    }

    /// Lock the stack; never hold the guard across an await
    pub fn lock(&self) -> MutexGuard<'_, StackState> {
        self.state.lock()
    }

    pub fn address(&self) -> Address {
        self.lock().address()
    }

    pub fn open_iface(&self, address: Address, mask: AddressMask) -> Result<IfaceId> {
        self.lock().open_iface(address, mask)
    }

    pub fn open_native_iface(&self) -> Result<IfaceId> {
        self.lock().open_native_iface()
    }

    pub fn close_iface(&self, iface: IfaceId) -> Result<()> {
        self.lock().close_iface(iface)
    }

    pub fn set_default_route(&self, gateway: Address, iface: IfaceId) -> Result<()> {
        self.lock().set_default_route(gateway, iface)
    }
}

impl core::fmt::Debug for NetStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("NetStack").field(&*self.lock()).finish()
    }
}
