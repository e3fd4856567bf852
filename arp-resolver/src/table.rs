//! The address table: cache, local addresses and outstanding queries, plus the transitions
//! that move it forward.
//!
//! Every transition takes the table by value and hands back the next table together with
//! descriptors of what has to happen outside of it: packets to transmit and waiter groups to
//! settle. Nothing in here performs I/O or reads a clock, which keeps the state machine
//! testable on its own and leaves serialization to whoever owns the table.

use crate::config::ArpConfig;
use arp_packets::{ArpOp, ArpPacket, MacAddr};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;
use tracing::debug;

/// A packet to put on the wire and the hardware address to send it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmit {
    pub destination: MacAddr,
    pub packet: ArpPacket,
}

impl Transmit {
    fn broadcast(packet: ArpPacket) -> Self {
        Transmit {
            destination: MacAddr::BROADCAST,
            packet,
        }
    }
}

/// A pending query that has been answered: `waiters` must be settled with `mac`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wake<W> {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub waiters: W,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome<W> {
    /// Answered from the cache or the local addresses. Nothing to send.
    Mac(MacAddr),
    /// A request for this address is already outstanding; join its waiters.
    Wait(W),
    /// A new request was registered; transmit it, then wait.
    RequestWait(Transmit, W),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputOutcome<W> {
    pub reply: Option<Transmit>,
    pub wake: Option<Wake<W>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome<W> {
    pub retries: Vec<Transmit>,
    pub timeouts: Vec<(Ipv4Addr, W)>,
}

#[derive(Debug, Clone)]
struct PendingQuery<W> {
    waiters: W,
    retries_left: u32,
    next_retry: Instant,
}

#[derive(Debug, Clone)]
pub struct ArpTable<W> {
    mac: MacAddr,
    config: ArpConfig,
    cache: HashMap<Ipv4Addr, MacAddr>,
    locals: Vec<Ipv4Addr>,
    pending: HashMap<Ipv4Addr, PendingQuery<W>>,
}

impl<W: Clone> ArpTable<W> {
    /// An empty table: no bindings, no local addresses, nothing pending.
    pub fn new(mac: MacAddr, config: ArpConfig) -> Self {
        ArpTable {
            mac,
            config,
            cache: HashMap::new(),
            locals: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// Builds the initial table. With `ip`, the address becomes the primary local address and
    /// the RFC 5227 probe claiming it is returned for transmission.
    pub fn create(mac: MacAddr, ip: Option<Ipv4Addr>, config: ArpConfig) -> (Self, Option<Transmit>) {
        let mut table = ArpTable::new(mac, config);
        let probe = ip.map(|ip| {
            table.locals.push(ip);
            Transmit::broadcast(ArpPacket::probe(mac, ip))
        });
        (table, probe)
    }

    /// Adds a secondary local address and announces it. A query waiting on exactly this
    /// address is answered with our own hardware address.
    pub fn alias(mut self, ip: Ipv4Addr) -> (Self, Transmit, Option<Wake<W>>) {
        if !self.locals.contains(&ip) {
            self.locals.push(ip);
        }
        let announce = Transmit::broadcast(ArpPacket::announce(self.mac, ip));
        let wake = self.wake_pending(ip, self.mac);
        (self, announce, wake)
    }

    /// Claims `ip`: the first local address is probed, later ones are announced through
    /// `alias`. Cache and pending queries carry over either way.
    pub fn add_ip(mut self, ip: Ipv4Addr) -> (Self, Transmit, Option<Wake<W>>) {
        if !self.locals.is_empty() {
            return self.alias(ip);
        }
        self.locals.push(ip);
        let probe = Transmit::broadcast(ArpPacket::probe(self.mac, ip));
        let wake = self.wake_pending(ip, self.mac);
        (self, probe, wake)
    }

    /// Stops owning `ip`. Requests for it are no longer answered.
    pub fn remove(mut self, ip: Ipv4Addr) -> Self {
        self.locals.retain(|local| *local != ip);
        self
    }

    pub fn clear_ips(mut self) -> Self {
        self.locals.clear();
        self
    }

    /// Folds an inbound packet into the table.
    ///
    /// Requests for a local address are answered. Any packet carrying a usable sender binding
    /// overwrites the cached binding for that address, and settles a query pending on it.
    pub fn input(mut self, packet: &ArpPacket) -> (Self, InputOutcome<W>) {
        let mut outcome = InputOutcome {
            reply: None,
            wake: None,
        };

        if packet.sender_mac == self.mac {
            debug!(%packet, "ignoring ARP packet sent by this interface");
            return (self, outcome);
        }

        if packet.operation == ArpOp::Request
            && !packet.is_announcement()
            && self.locals.contains(&packet.target_ip)
        {
            let reply = ArpPacket::reply_to(packet, self.mac);
            outcome.reply = Some(Transmit {
                destination: packet.sender_mac,
                packet: reply,
            });
        }

        if !packet.sender_ip.is_unspecified() && !packet.sender_mac.is_broadcast() {
            if let Some(previous) = self.cache.insert(packet.sender_ip, packet.sender_mac) {
                if previous != packet.sender_mac {
                    debug!(ip = %packet.sender_ip, %previous, mac = %packet.sender_mac, "ARP binding changed");
                }
            }
            outcome.wake = self.wake_pending(packet.sender_ip, packet.sender_mac);
        }

        (self, outcome)
    }

    /// Resolves `ip` or registers interest in it.
    ///
    /// `factory` is only called when a new request has to be sent; callers that find a
    /// request outstanding join its existing waiters.
    pub fn query<F>(mut self, ip: Ipv4Addr, now: Instant, factory: F) -> (Self, QueryOutcome<W>)
    where
        F: FnOnce() -> W,
    {
        if let Some(mac) = self.lookup(ip) {
            return (self, QueryOutcome::Mac(mac));
        }

        let request = self.request_for(ip);
        let next_retry = now + self.config.retry_delay;
        let retries_left = self.config.max_retries;
        let outcome = match self.pending.entry(ip) {
            Entry::Occupied(entry) => QueryOutcome::Wait(entry.get().waiters.clone()),
            Entry::Vacant(entry) => {
                let waiters = factory();
                entry.insert(PendingQuery {
                    waiters: waiters.clone(),
                    retries_left,
                    next_retry,
                });
                QueryOutcome::RequestWait(request, waiters)
            }
        };
        (self, outcome)
    }

    /// Advances every pending query whose retry deadline has passed: re-sends its request
    /// while retries remain, otherwise drops it and reports it as timed out.
    pub fn tick(mut self, now: Instant) -> (Self, TickOutcome<W>) {
        let mut due: Vec<Ipv4Addr> = self
            .pending
            .iter()
            .filter(|(_, query)| query.next_retry <= now)
            .map(|(ip, _)| *ip)
            .collect();
        due.sort();

        let mut outcome = TickOutcome {
            retries: Vec::new(),
            timeouts: Vec::new(),
        };
        for ip in due {
            let request = self.request_for(ip);
            let retry_delay = self.config.retry_delay;
            if let Entry::Occupied(mut entry) = self.pending.entry(ip) {
                let query = entry.get_mut();
                if query.retries_left > 0 {
                    query.retries_left -= 1;
                    query.next_retry = now + retry_delay;
                    outcome.retries.push(request);
                } else {
                    outcome.timeouts.push((ip, entry.remove().waiters));
                }
            }
        }
        (self, outcome)
    }

    /// The earliest retry deadline among pending queries: when `tick` next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|query| query.next_retry).min()
    }

    /// Empties the pending table, handing back every waiter group so it can be settled.
    pub fn drain_pending(mut self) -> (Self, Vec<(Ipv4Addr, W)>) {
        let mut drained: Vec<(Ipv4Addr, W)> = self
            .pending
            .drain()
            .map(|(ip, query)| (ip, query.waiters))
            .collect();
        drained.sort_by_key(|(ip, _)| *ip);
        (self, drained)
    }

    /// Answers `ip` without touching the network: our own address for local IPs, otherwise
    /// the cached binding.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        if self.locals.contains(&ip) {
            Some(self.mac)
        } else {
            self.cache.get(&ip).copied()
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn config(&self) -> &ArpConfig {
        &self.config
    }

    /// Local addresses in the order they were added; the first one is primary.
    pub fn ips(&self) -> &[Ipv4Addr] {
        &self.locals
    }

    pub fn cache(&self) -> &HashMap<Ipv4Addr, MacAddr> {
        &self.cache
    }

    pub fn is_pending(&self, ip: Ipv4Addr) -> bool {
        self.pending.contains_key(&ip)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn request_for(&self, ip: Ipv4Addr) -> Transmit {
        let sender_ip = self
            .locals
            .first()
            .copied()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Transmit::broadcast(ArpPacket::request(self.mac, sender_ip, ip))
    }

    fn wake_pending(&mut self, ip: Ipv4Addr, mac: MacAddr) -> Option<Wake<W>> {
        self.pending.remove(&ip).map(|query| Wake {
            ip,
            mac,
            waiters: query.waiters,
        })
    }
}

impl<W> fmt::Display for ArpTable<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "mac {}", self.mac)?;
        let ips: Vec<String> = self.locals.iter().map(|ip| ip.to_string()).collect();
        writeln!(f, "ips [{}]", ips.join(", "))?;

        let mut bindings: Vec<(&Ipv4Addr, &MacAddr)> = self.cache.iter().collect();
        bindings.sort();
        writeln!(f, "cache ({} entries)", bindings.len())?;
        for (ip, mac) in bindings {
            writeln!(f, "  {} at {}", ip, mac)?;
        }

        let mut pending: Vec<(&Ipv4Addr, u32)> = self
            .pending
            .iter()
            .map(|(ip, query)| (ip, query.retries_left))
            .collect();
        pending.sort();
        write!(f, "pending ({} queries)", pending.len())?;
        for (ip, retries_left) in pending {
            write!(f, "\n  {} ({} retries left)", ip, retries_left)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OWN_MAC: MacAddr = MacAddr {
        bytes: [2, 0, 0, 0, 0, 1],
    };
    const PEER_MAC: MacAddr = MacAddr {
        bytes: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
    };

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn empty_table() -> ArpTable<u32> {
        ArpTable::create(OWN_MAC, None, ArpConfig::default()).0
    }

    fn table_with_ip(addr: Ipv4Addr) -> ArpTable<u32> {
        ArpTable::create(OWN_MAC, Some(addr), ArpConfig::default()).0
    }

    fn reply_from(sender_ip: Ipv4Addr, sender_mac: MacAddr) -> ArpPacket {
        ArpPacket {
            operation: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac: OWN_MAC,
            target_ip: ip(1),
        }
    }

    #[test]
    fn create_without_ip_sends_nothing() {
        let (table, probe) = ArpTable::<u32>::create(OWN_MAC, None, ArpConfig::default());
        assert_eq!(probe, None);
        assert_eq!(table.mac(), OWN_MAC);
        assert!(table.ips().is_empty());
        assert!(table.cache().is_empty());
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn create_with_ip_probes_it() {
        let (table, probe) = ArpTable::<u32>::create(OWN_MAC, Some(ip(1)), ArpConfig::default());
        let probe = probe.unwrap();
        assert_eq!(table.ips(), &[ip(1)]);
        assert!(probe.destination.is_broadcast());
        assert_eq!(probe.packet.operation, ArpOp::Request);
        assert_eq!(probe.packet.sender_mac, OWN_MAC);
        assert_eq!(probe.packet.sender_ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(probe.packet.target_ip, ip(1));
    }

    #[test]
    fn alias_announces_and_preserves_order() {
        let (table, announce, wake) = table_with_ip(ip(1)).alias(ip(2));
        assert_eq!(table.ips(), &[ip(1), ip(2)]);
        assert_eq!(announce.packet, ArpPacket::announce(OWN_MAC, ip(2)));
        assert!(announce.destination.is_broadcast());
        assert_eq!(wake, None);

        let (table, _, _) = table.alias(ip(2));
        assert_eq!(table.ips(), &[ip(1), ip(2)]);
    }

    #[test]
    fn alias_answers_pending_query_for_same_ip() {
        let now = Instant::now();
        let (table, _) = table_with_ip(ip(1)).query(ip(2), now, || 7);
        let (table, _) = table.query(ip(3), now, || 8);

        let (table, _, wake) = table.alias(ip(2));
        assert_eq!(
            wake,
            Some(Wake {
                ip: ip(2),
                mac: OWN_MAC,
                waiters: 7
            })
        );
        assert!(!table.is_pending(ip(2)));
        assert!(table.is_pending(ip(3)));
    }

    #[test]
    fn add_ip_probes_first_and_announces_rest() {
        let now = Instant::now();
        let (table, _) = empty_table().query(ip(9), now, || 1);
        let (table, first, _) = table.add_ip(ip(1));
        assert_eq!(first.packet, ArpPacket::probe(OWN_MAC, ip(1)));

        let (table, second, _) = table.add_ip(ip(2));
        assert_eq!(second.packet, ArpPacket::announce(OWN_MAC, ip(2)));
        assert_eq!(table.ips(), &[ip(1), ip(2)]);
        assert!(table.is_pending(ip(9)));
    }

    #[test]
    fn remove_and_clear_keep_cache_and_pending() {
        let now = Instant::now();
        let table = table_with_ip(ip(1)).alias(ip(2)).0;
        let (table, _) = table.input(&reply_from(ip(9), PEER_MAC));
        let (table, _) = table.query(ip(50), now, || 1);

        let table = table.remove(ip(1));
        assert_eq!(table.ips(), &[ip(2)]);

        let table = table.clear_ips();
        assert!(table.ips().is_empty());
        assert_eq!(table.lookup(ip(9)), Some(PEER_MAC));
        assert!(table.is_pending(ip(50)));
    }

    #[test]
    fn request_for_local_ip_is_answered() {
        let table = table_with_ip(ip(1));
        let request = ArpPacket::request(PEER_MAC, ip(9), ip(1));

        let (table, outcome) = table.input(&request);
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.destination, PEER_MAC);
        assert_eq!(reply.packet, ArpPacket::reply_to(&request, OWN_MAC));
        assert_eq!(outcome.wake, None);
        // The requester's binding is learned on the way.
        assert_eq!(table.lookup(ip(9)), Some(PEER_MAC));
    }

    #[test]
    fn request_for_removed_ip_is_not_answered() {
        let table = table_with_ip(ip(1)).alias(ip(2)).0.remove(ip(2));
        let (_, outcome) = table.input(&ArpPacket::request(PEER_MAC, ip(9), ip(2)));
        assert_eq!(outcome.reply, None);
    }

    #[test]
    fn request_for_foreign_ip_is_not_answered() {
        let (_, outcome) = table_with_ip(ip(1)).input(&ArpPacket::request(PEER_MAC, ip(9), ip(3)));
        assert_eq!(outcome.reply, None);
    }

    #[test]
    fn probe_for_local_ip_is_defended() {
        let (table, outcome) = table_with_ip(ip(1)).input(&ArpPacket::probe(PEER_MAC, ip(1)));
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.destination, PEER_MAC);
        assert_eq!(reply.packet.sender_ip, ip(1));
        assert_eq!(reply.packet.target_ip, Ipv4Addr::UNSPECIFIED);
        // Probes carry no binding.
        assert!(table.cache().is_empty());
    }

    #[test]
    fn announcement_updates_cache_without_reply() {
        let (table, outcome) = table_with_ip(ip(1)).input(&ArpPacket::announce(PEER_MAC, ip(9)));
        assert_eq!(outcome.reply, None);
        assert_eq!(table.lookup(ip(9)), Some(PEER_MAC));
    }

    #[test]
    fn announcement_of_local_ip_is_not_answered() {
        let (_, outcome) = table_with_ip(ip(1)).input(&ArpPacket::announce(PEER_MAC, ip(1)));
        assert_eq!(outcome.reply, None);
    }

    #[test]
    fn reply_overwrites_stale_binding() {
        let newer = MacAddr::new([0xaa, 0, 0, 0, 0, 2]);
        let (table, _) = empty_table().input(&reply_from(ip(9), PEER_MAC));
        let (table, _) = table.input(&reply_from(ip(9), newer));
        assert_eq!(table.lookup(ip(9)), Some(newer));
    }

    #[test]
    fn reply_wakes_exactly_the_pending_sender() {
        let now = Instant::now();
        let (table, _) = empty_table().query(ip(9), now, || 9);
        let (table, _) = table.query(ip(10), now, || 10);

        let (table, outcome) = table.input(&reply_from(ip(9), PEER_MAC));
        assert_eq!(
            outcome.wake,
            Some(Wake {
                ip: ip(9),
                mac: PEER_MAC,
                waiters: 9
            })
        );
        assert!(!table.is_pending(ip(9)));
        assert!(table.is_pending(ip(10)));
    }

    #[test]
    fn own_packets_are_ignored() {
        let (table, outcome) = table_with_ip(ip(1)).input(&ArpPacket::request(OWN_MAC, ip(1), ip(1)));
        assert_eq!(outcome.reply, None);
        assert!(table.cache().is_empty());
    }

    #[test]
    fn query_local_ip_answers_own_mac() {
        let (table, outcome) = table_with_ip(ip(1)).query(ip(1), Instant::now(), || 1);
        assert_eq!(outcome, QueryOutcome::Mac(OWN_MAC));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn query_cache_hit_needs_no_request() {
        let (table, _) = empty_table().input(&reply_from(ip(9), PEER_MAC));
        let (table, outcome) = table.query(ip(9), Instant::now(), || panic!("no waiters needed"));
        assert_eq!(outcome, QueryOutcome::Mac(PEER_MAC));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn concurrent_queries_share_one_request() {
        let now = Instant::now();
        let (table, first) = table_with_ip(ip(1)).query(ip(9), now, || 1);
        let (table, second) = table.query(ip(9), now, || panic!("second query must join"));

        assert_eq!(
            first,
            QueryOutcome::RequestWait(
                Transmit::broadcast(ArpPacket::request(OWN_MAC, ip(1), ip(9))),
                1
            )
        );
        assert_eq!(second, QueryOutcome::Wait(1));
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn request_without_local_ip_uses_unspecified_sender() {
        let (_, outcome) = empty_table().query(ip(9), Instant::now(), || 1);
        match outcome {
            QueryOutcome::RequestWait(request, _) => {
                assert_eq!(request.packet.sender_ip, Ipv4Addr::UNSPECIFIED)
            }
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[test]
    fn tick_retries_then_times_out() {
        let config = ArpConfig::new().max_retries(2);
        let delay = config.retry_delay;
        let start = Instant::now();
        let table = ArpTable::create(OWN_MAC, Some(ip(1)), config).0;
        let (mut table, _) = table.query(ip(50), start, || 50);

        // Not yet due.
        let (next, outcome) = table.tick(start + delay / 2);
        table = next;
        assert!(outcome.retries.is_empty());
        assert!(outcome.timeouts.is_empty());

        for cycle in 1..=2 {
            let (next, outcome) = table.tick(start + delay * cycle);
            table = next;
            assert_eq!(
                outcome.retries,
                vec![Transmit::broadcast(ArpPacket::request(OWN_MAC, ip(1), ip(50)))]
            );
            assert!(outcome.timeouts.is_empty());
        }

        let (table, outcome) = table.tick(start + delay * 3);
        assert!(outcome.retries.is_empty());
        assert_eq!(outcome.timeouts, vec![(ip(50), 50)]);
        assert!(!table.is_pending(ip(50)));

        // The next query starts over with a fresh request.
        let (_, outcome) = table.query(ip(50), start + delay * 3, || 51);
        assert!(matches!(outcome, QueryOutcome::RequestWait(_, 51)));
    }

    #[test]
    fn tick_only_touches_due_queries() {
        let delay = ArpConfig::default().retry_delay;
        let start = Instant::now();
        let (table, _) = empty_table().query(ip(9), start, || 9);
        let (table, _) = table.query(ip(10), start + Duration::from_millis(1000), || 10);

        let (table, outcome) = table.tick(start + delay);
        assert_eq!(outcome.retries.len(), 1);
        assert_eq!(outcome.retries[0].packet.target_ip, ip(9));
        assert_eq!(table.pending_count(), 2);
    }

    #[test]
    fn next_deadline_follows_earliest_query() {
        let delay = ArpConfig::default().retry_delay;
        let start = Instant::now();
        let table = empty_table();
        assert_eq!(table.next_deadline(), None);

        let (table, _) = table.query(ip(9), start + Duration::from_millis(100), || 9);
        assert_eq!(
            table.next_deadline(),
            Some(start + Duration::from_millis(100) + delay)
        );
        let (table, _) = table.query(ip(10), start + Duration::from_millis(700), || 10);
        assert_eq!(
            table.next_deadline(),
            Some(start + Duration::from_millis(100) + delay)
        );

        // Retrying ip(9) pushes its deadline past ip(10)'s.
        let (table, _) = table.tick(start + Duration::from_millis(100) + delay);
        assert_eq!(
            table.next_deadline(),
            Some(start + Duration::from_millis(700) + delay)
        );

        let (table, _) = table.drain_pending();
        assert_eq!(table.next_deadline(), None);
    }

    #[test]
    fn drain_pending_empties_table() {
        let now = Instant::now();
        let (table, _) = empty_table().query(ip(10), now, || 10);
        let (table, _) = table.query(ip(9), now, || 9);
        let (table, drained) = table.drain_pending();
        assert_eq!(drained, vec![(ip(9), 9), (ip(10), 10)]);
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn display_lists_state() {
        let now = Instant::now();
        let table = table_with_ip(ip(1));
        let (table, _) = table.input(&reply_from(ip(9), PEER_MAC));
        let (table, _) = table.query(ip(50), now, || 1);
        assert_eq!(
            table.to_string(),
            "mac 02:00:00:00:00:01\n\
             ips [10.0.0.1]\n\
             cache (1 entries)\n  10.0.0.9 at aa:bb:cc:dd:ee:ff\n\
             pending (1 queries)\n  10.0.0.50 (3 retries left)"
        );
    }
}
