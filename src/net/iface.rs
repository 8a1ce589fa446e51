//! Network interfaces and the per-context interface registry
//!
//! An interface is a local endpoint: an address and prefix, a queue of
//! packets received but not yet claimed, the receive filters installed on
//! it, the next anonymous port per protocol, and lazily the TCP state that
//! lives on it. The registry keeps interfaces in registration order, which
//! is the order send lookups try them in.

use alloc::vec::Vec;

use crate::arena::{Arena, Handle};
use crate::error::{Error, Result};
use crate::net::addr::{Address, AddressMask};
use crate::net::filter::FilterEntry;
use crate::net::header::HeaderType;
use crate::net::queue::PacketQueue;
use crate::net::tcp::TcpContext;

pub type IfaceId = Handle<Iface>;

pub struct Iface {
    address: Address,
    mask: AddressMask,
    pub(crate) queue: PacketQueue,
    pub(crate) filters: Vec<FilterEntry>,
    anon_next_udp: u16,
    anon_next_tcp: u16,
    pub(crate) yield_to_recipient: bool,
    pub(crate) tcp: Option<TcpContext>,
}

impl Iface {
    /// An unregistered interface with an empty queue and no filters
    pub fn new(address: Address, mask: AddressMask, queue_len: usize, anon_port_min: u16) -> Self {
        Self {
            address,
            mask,
            queue: PacketQueue::new(queue_len),
            filters: Vec::new(),
            anon_next_udp: anon_port_min,
            anon_next_tcp: anon_port_min,
            yield_to_recipient: true,
            tcp: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn mask(&self) -> AddressMask {
        self.mask
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Where the anonymous port search for `protocol` starts next
    pub(crate) fn anon_cursor(&mut self, protocol: HeaderType) -> Result<&mut u16> {
        match protocol {
            HeaderType::Udp => Ok(&mut self.anon_next_udp),
            HeaderType::Tcp => Ok(&mut self.anon_next_tcp),
            _ => Err(Error::InvalidArg),
        }
    }
}

impl core::fmt::Debug for Iface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Iface")
            .field("address", &self.address)
            .field("mask", &self.mask)
            .field("queued", &self.queue.len())
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Outbound interface and the address the kernel should deliver to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub iface: IfaceId,
    pub next_hop: Address,
}

#[derive(Default)]
pub struct IfaceRegistry {
    ifaces: Arena<Iface>,
    order: Vec<IfaceId>,
    default_route: Option<(Address, IfaceId)>,
}

impl IfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `iface` at the end of the lookup order
    pub fn register(&mut self, iface: Iface) -> Result<IfaceId> {
        let taken = self
            .order
            .iter()
            .filter_map(|id| self.ifaces.get(*id))
            .any(|existing| existing.address == iface.address);
        if taken {
            return Err(Error::IfaceAlreadyRegistered);
        }
        let id = self.ifaces.insert(iface);
        self.order.push(id);
        Ok(id)
    }

    /// Remove an interface; a default route through it is forgotten
    pub fn unregister(&mut self, id: IfaceId) -> Result<Iface> {
        let iface = self.ifaces.remove(id).ok_or(Error::IfaceNotRegistered)?;
        self.order.retain(|other| *other != id);
        if self.default_route.is_some_and(|(_, route)| route == id) {
            self.default_route = None;
        }
        Ok(iface)
    }

    pub fn get(&self, id: IfaceId) -> Result<&Iface> {
        self.ifaces.get(id).ok_or(Error::IfaceNotRegistered)
    }

    pub fn get_mut(&mut self, id: IfaceId) -> Result<&mut Iface> {
        self.ifaces.get_mut(id).ok_or(Error::IfaceNotRegistered)
    }

    pub fn contains(&self, id: IfaceId) -> bool {
        self.ifaces.contains(id)
    }

    /// Interfaces in registration order
    pub fn ids(&self) -> &[IfaceId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn first(&self) -> Result<IfaceId> {
        self.order.first().copied().ok_or(Error::DoesNotExist)
    }

    /// First interface whose prefix covers `dest`
    pub fn lookup_send(&self, dest: Address) -> Result<IfaceId> {
        self.order
            .iter()
            .copied()
            .find(|id| {
                self.ifaces
                    .get(*id)
                    .is_some_and(|iface| iface.mask.matches(&dest))
            })
            .ok_or(Error::DoesNotExist)
    }

    /// Interface whose own address is exactly `addr`
    pub fn lookup_receive(&self, addr: Address) -> Result<IfaceId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.ifaces.get(*id).is_some_and(|iface| iface.address == addr))
            .ok_or(Error::DoesNotExist)
    }

    pub fn set_default_route(&mut self, addr: Address, iface: IfaceId) -> Result<()> {
        if !self.ifaces.contains(iface) {
            return Err(Error::IfaceNotRegistered);
        }
        self.default_route = Some((addr, iface));
        Ok(())
    }

    pub fn clear_default_route(&mut self) {
        self.default_route = None;
    }

    pub fn default_route(&self) -> Result<(Address, IfaceId)> {
        self.default_route.ok_or(Error::DoesNotExist)
    }

    /// Resolve `dest` to an outbound interface in one step
    ///
    /// A matching interface delivers straight to `dest`; otherwise the
    /// default route's gateway is the next hop. Neither is `NoRouteToHost`.
    pub fn route(&self, dest: Address) -> Result<Route> {
        if let Ok(iface) = self.lookup_send(dest) {
            return Ok(Route {
                iface,
                next_hop: dest,
            });
        }
        match self.default_route {
            Some((gateway, iface)) if self.ifaces.contains(iface) => Ok(Route {
                iface,
                next_hop: gateway,
            }),
            _ => Err(Error::NoRouteToHost),
        }
    }
}
