//! Receive filters
//!
//! Every packet received on an interface is offered to the interface's
//! filters in installation order. A filter either passes the packet on or
//! ends the pipeline: by dropping it, failing, or consuming it itself
//! (an ICMP reply, a TCP segment fed to its socket).

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::net::iface::IfaceId;
use crate::net::packet::Packet;
use crate::net::stack::StackState;

/// What a filter did with a packet
#[derive(Debug)]
pub enum FilterAction {
    /// Not ours; offer it to the next filter
    Pass(Packet),
    /// Discarded without notice
    Drop,
    /// Discarded because of an error
    Error(Error),
    /// Discarded and the sender has been told over ICMP
    ErrorIcmped,
    /// Sent on somewhere else
    Forwarded,
    /// Handled; any answer has already been sent
    Replied,
}

pub type Filter = Arc<dyn Fn(&mut StackState, IfaceId, Packet) -> FilterAction + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterId(u32);

pub(crate) struct FilterEntry {
    pub(crate) id: FilterId,
    pub(crate) filter: Filter,
}

impl StackState {
    /// Append `filter` to the interface's pipeline
    pub fn install_filter(&mut self, iface: IfaceId, filter: Filter) -> Result<FilterId> {
        let id = FilterId(self.next_filter_id());
        self.ifaces
            .get_mut(iface)?
            .filters
            .push(FilterEntry { id, filter });
        debug!("[IP] installed filter {:?} on {:?}", id, iface);
        Ok(id)
    }

    pub fn uninstall_filter(&mut self, iface: IfaceId, id: FilterId) -> Result<()> {
        let filters = &mut self.ifaces.get_mut(iface)?.filters;
        let position = filters
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(Error::DoesNotExist)?;
        filters.remove(position);
        Ok(())
    }

    /// Whether this very filter instance is installed on `iface`
    pub fn has_filter(&self, iface: IfaceId, filter: &Filter) -> bool {
        self.ifaces
            .get(iface)
            .is_ok_and(|iface| iface.filters.iter().any(|entry| Arc::ptr_eq(&entry.filter, filter)))
    }

    /// Run `packet` through the interface's filters
    ///
    /// Returns the packet if every filter passed it. A packet a filter
    /// consumed comes back as `PacketFilteredOut`.
    pub(crate) fn apply_filters(&mut self, iface: IfaceId, packet: Packet) -> Result<Packet> {
        // Filters may install or remove filters, so walk a snapshot.
        let filters: Vec<Filter> = self
            .ifaces
            .get(iface)?
            .filters
            .iter()
            .map(|entry| entry.filter.clone())
            .collect();

        let mut packet = packet;
        for filter in filters {
            match filter(self, iface, packet) {
                FilterAction::Pass(passed) => packet = passed,
                FilterAction::Drop
                | FilterAction::ErrorIcmped
                | FilterAction::Forwarded
                | FilterAction::Replied => return Err(Error::PacketFilteredOut),
                FilterAction::Error(error) => {
                    warn!("[IP] filter failed: {}", error);
                    return Err(error);
                }
            }
        }
        Ok(packet)
    }
}
