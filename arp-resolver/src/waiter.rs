//! # What is it for?
//!
//! A `WaiterGroup` is the handle every caller querying the same unresolved address shares. The
//! address table stores one group per outstanding request; each caller that joins the request
//! clones the group and awaits it. Whoever settles the request (an inbound reply, a local alias,
//! the retry ticker giving up, or a disconnect) calls `resolve` exactly once, and every clone
//! observes the same `Resolution`.

use crate::error::ArpError;
use arp_packets::MacAddr;
use crossbeam::atomic::AtomicCell;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use std::fmt;
use std::sync::Arc;

pub type Resolution = Result<MacAddr, ArpError>;

#[derive(Clone)]
pub struct WaiterGroup {
    resolver: Arc<AtomicCell<Option<oneshot::Sender<Resolution>>>>,
    resolved: Shared<oneshot::Receiver<Resolution>>,
}

impl WaiterGroup {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        WaiterGroup {
            resolver: Arc::new(AtomicCell::new(Some(sender))),
            resolved: receiver.shared(),
        }
    }

    /// Settles the group. Returns `false` if it had already been settled, in which case
    /// `resolution` is discarded.
    pub fn resolve(&self, resolution: Resolution) -> bool {
        match self.resolver.take() {
            Some(sender) => {
                // Every waiter may have given up already; the group is settled regardless.
                let _ = sender.send(resolution);
                true
            }
            None => false,
        }
    }

    /// Suspends until the group is settled. If every copy able to settle it is dropped first,
    /// the engine that owned it is gone and the wait ends with `ArpError::Disconnected`.
    pub async fn wait(self) -> Resolution {
        let WaiterGroup { resolver, resolved } = self;
        drop(resolver);
        resolved.await.unwrap_or(Err(ArpError::Disconnected))
    }
}

impl Default for WaiterGroup {
    fn default() -> Self {
        WaiterGroup::new()
    }
}

impl fmt::Debug for WaiterGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaiterGroup")
            .field("resolved", &self.resolved.peek())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::net::Ipv4Addr;

    #[test]
    fn all_clones_observe_one_resolution() {
        let group = WaiterGroup::new();
        let first = group.clone();
        let second = group.clone();
        let mac = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        assert!(group.resolve(Ok(mac)));
        assert_eq!(block_on(first.wait()), Ok(mac));
        assert_eq!(block_on(second.wait()), Ok(mac));
    }

    #[test]
    fn resolves_only_once() {
        let group = WaiterGroup::new();
        let waiter = group.clone();
        let timeout = Err(ArpError::Timeout(Ipv4Addr::new(10, 0, 0, 50)));

        assert!(group.resolve(timeout));
        assert!(!group.resolve(Ok(MacAddr::new([1, 2, 3, 4, 5, 6]))));
        assert_eq!(block_on(waiter.wait()), timeout);
    }

    #[test]
    fn dropped_group_disconnects_waiters() {
        let group = WaiterGroup::new();
        let waiter = group.clone();
        drop(group);
        assert_eq!(block_on(waiter.wait()), Err(ArpError::Disconnected));
    }
}
