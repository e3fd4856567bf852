use crate::config::ArpConfig;
use crate::error::ArpError;
use crate::table::{ArpTable, QueryOutcome, Transmit, Wake};
use crate::transport::Transport;
use crate::waiter::WaiterGroup;
use arp_packets::{ArpFrame, ArpPacket, EthernetFrame, MacAddr, ARP_ETHER_TYPE, ARP_PACKET_LEN};
use futures::future;
use std::convert::TryFrom;
use std::fmt;
use std::mem;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{watch, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, warn};

/// Handle to a running ARP resolution engine. Clones share the same engine.
///
/// The engine owns a single address table. Every operation locks it, applies one transition,
/// stores the result and releases the lock before transmitting packets or settling waiters,
/// so transitions are applied strictly one after another.
pub struct Arp<T: Transport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Transport> {
    transport: T,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
    rearm: Arc<Notify>,
}

struct State {
    table: ArpTable<WaiterGroup>,
    active: bool,
}

impl State {
    fn apply<R>(
        &mut self,
        transition: impl FnOnce(ArpTable<WaiterGroup>) -> (ArpTable<WaiterGroup>, R),
    ) -> R {
        let placeholder = ArpTable::new(self.table.mac(), *self.table.config());
        let current = mem::replace(&mut self.table, placeholder);
        let (next, output) = transition(current);
        self.table = next;
        output
    }
}

impl<T: Transport> Clone for Arp<T> {
    fn clone(&self) -> Self {
        Arp {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Arp<T> {
    /// Starts an engine with no local address.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, which hosts the retry ticker.
    pub fn connect(transport: T, config: ArpConfig) -> Self {
        Arp::connect_with_ip(transport, None, config)
    }

    /// Starts an engine, optionally claiming `ip` as its primary address right away.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, which hosts the retry ticker.
    pub fn connect_with_ip(transport: T, ip: Option<Ipv4Addr>, config: ArpConfig) -> Self {
        let mac = transport.mac();
        let (table, probe) = ArpTable::create(mac, ip, config);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let rearm = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            transport,
            state: Mutex::new(State {
                table,
                active: true,
            }),
            shutdown,
            rearm: rearm.clone(),
        });

        tokio::spawn(ticker(Arc::downgrade(&inner), shutdown_rx, rearm));
        info!(%mac, "ARP engine connected");

        if let Some(probe) = probe {
            inner.transmit(&probe);
        }
        Arp { inner }
    }

    /// Resolves `ip` to a hardware address.
    ///
    /// Returns without suspending for local addresses and cached bindings. Otherwise joins
    /// (or starts) the outstanding request for `ip` and waits until a reply arrives or the
    /// retry budget is exhausted.
    #[instrument(level = "debug", skip(self))]
    pub async fn query(&self, ip: Ipv4Addr) -> Result<MacAddr, ArpError> {
        let now = Instant::now().into_std();
        let outcome = {
            let mut state = self.inner.lock();
            if !state.active {
                return state.table.lookup(ip).ok_or(ArpError::Disconnected);
            }
            state.apply(|table| table.query(ip, now, WaiterGroup::new))
        };

        match outcome {
            QueryOutcome::Mac(mac) => Ok(mac),
            QueryOutcome::Wait(waiters) => waiters.wait().await,
            QueryOutcome::RequestWait(request, waiters) => {
                debug!(%ip, "sending ARP request");
                self.inner.rearm.notify_one();
                self.inner.transmit(&request);
                waiters.wait().await
            }
        }
    }

    /// Handles an inbound ARP payload (the bytes after the Ethernet header). Malformed
    /// payloads are dropped.
    pub fn input(&self, payload: &[u8]) {
        match ArpPacket::decode(payload) {
            Ok(packet) => self.handle(&packet),
            Err(e) => debug!(error = %e, "dropping malformed ARP packet"),
        }
    }

    /// Handles a whole inbound Ethernet frame. Frames that do not carry ARP are dropped.
    pub fn input_frame(&self, frame: EthernetFrame) {
        match ArpFrame::try_from(frame) {
            Ok(arp_frame) => self.handle(arp_frame.packet()),
            Err(e) => debug!(error = %e, "dropping inbound frame"),
        }
    }

    fn handle(&self, packet: &ArpPacket) {
        let outcome = self.inner.lock().apply(|table| table.input(packet));
        if let Some(reply) = outcome.reply {
            debug!(%packet, "answering ARP request");
            self.inner.transmit(&reply);
        }
        if let Some(wake) = outcome.wake {
            self.inner.wake(wake);
        }
    }

    /// Claims `ip`. The first address is probed; later ones are announced, and a query
    /// waiting on `ip` is answered with our own hardware address.
    pub fn add_ip(&self, ip: Ipv4Addr) {
        let (announce, wake) = self.inner.lock().apply(|table| {
            let (table, announce, wake) = table.add_ip(ip);
            (table, (announce, wake))
        });
        info!(%ip, "claiming local address");
        self.inner.transmit(&announce);
        if let Some(wake) = wake {
            self.inner.wake(wake);
        }
    }

    pub fn remove_ip(&self, ip: Ipv4Addr) {
        self.inner.lock().apply(|table| (table.remove(ip), ()));
        info!(%ip, "released local address");
    }

    /// Replaces the local addresses with `ips`, claiming each in order. Cached bindings and
    /// pending queries are kept.
    pub fn set_ips(&self, ips: &[Ipv4Addr]) {
        let (announcements, wakes) = self.inner.lock().apply(|table| {
            let mut table = table.clear_ips();
            let mut announcements = Vec::with_capacity(ips.len());
            let mut wakes = Vec::new();
            for ip in ips {
                let (next, announce, wake) = table.add_ip(*ip);
                table = next;
                announcements.push(announce);
                wakes.extend(wake);
            }
            (table, (announcements, wakes))
        });
        info!(?ips, "replaced local addresses");
        for announce in &announcements {
            self.inner.transmit(announce);
        }
        for wake in wakes {
            self.inner.wake(wake);
        }
    }

    /// Local addresses, primary first.
    pub fn get_ips(&self) -> Vec<Ipv4Addr> {
        self.inner.lock().table.ips().to_vec()
    }

    pub fn mac(&self) -> MacAddr {
        self.inner.lock().table.mac()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Stops the retry ticker and fails every outstanding query with
    /// `ArpError::Disconnected`. Cached bindings and inbound handling keep working.
    pub fn disconnect(&self) {
        let drained = {
            let mut state = self.inner.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state.apply(|table| table.drain_pending())
        };

        // The ticker may already be gone if the runtime shut down.
        let _ = self.inner.shutdown.send(true);
        for (ip, waiters) in drained {
            debug!(%ip, "abandoning ARP query");
            waiters.resolve(Err(ArpError::Disconnected));
        }
        info!("ARP engine disconnected");
    }
}

impl<T: Transport> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transmit(&self, transmit: &Transmit) {
        let packet = transmit.packet;
        let result = self.transport.send(
            transmit.destination,
            ARP_ETHER_TYPE,
            ARP_PACKET_LEN,
            &mut |buf| packet.encode_into(buf),
        );
        if let Err(e) = result {
            warn!(error = %e, destination = %transmit.destination, %packet, "failed to transmit ARP packet");
        }
    }

    fn wake(&self, wake: Wake<WaiterGroup>) {
        debug!(ip = %wake.ip, mac = %wake.mac, "ARP query resolved");
        wake.waiters.resolve(Ok(wake.mac));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock().table.next_deadline().map(Instant::from_std)
    }

    fn tick(&self, now: std::time::Instant) {
        let outcome = {
            let mut state = self.lock();
            if !state.active {
                return;
            }
            state.apply(|table| table.tick(now))
        };

        for retry in &outcome.retries {
            debug!(ip = %retry.packet.target_ip, "retrying ARP request");
            self.transmit(retry);
        }
        for (ip, waiters) in outcome.timeouts {
            info!(%ip, "ARP query timed out");
            waiters.resolve(Err(ArpError::Timeout(ip)));
        }
    }
}

/// Sleeps until the earliest retry deadline, advances the table, repeats. With nothing
/// pending it waits for `rearm`, which `query` signals whenever it registers a new request.
/// Holds only a weak reference so that dropping every `Arp` handle also ends the loop.
async fn ticker<T: Transport>(
    inner: Weak<Inner<T>>,
    mut shutdown: watch::Receiver<bool>,
    rearm: Arc<Notify>,
) {
    loop {
        let deadline = match inner.upgrade() {
            Some(inner) => inner.next_deadline(),
            None => break,
        };
        let due = async move {
            match deadline {
                Some(deadline) => time::sleep_until(deadline).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            _ = due => {}
            _ = rearm.notified() => continue,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match inner.upgrade() {
            Some(inner) => inner.tick(Instant::now().into_std()),
            None => break,
        }
    }
    debug!("ARP retry ticker stopped");
}

impl<T: Transport> fmt::Display for Arp<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.inner.lock().table)
    }
}

impl<T: Transport> fmt::Debug for Arp<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Arp")
            .field("mac", &state.table.mac())
            .field("ips", &state.table.ips())
            .field("pending", &state.table.pending_count())
            .field("active", &state.active)
            .finish()
    }
}
