use crate::error::TransportError;
use arp_packets::{EthernetFrame, MacAddr};
use crossbeam::channel::{Sender, TrySendError};
use std::sync::Arc;

const MTU: usize = 1500;

/// The link the engine transmits on. Implementations frame the payload for `destination`
/// and must not block: the engine calls `send` from inside caller operations and treats every
/// error as a dropped frame.
pub trait Transport: Send + Sync + 'static {
    /// Hardware address of the interface. Used as the sender of every packet the engine builds.
    fn mac(&self) -> MacAddr;

    /// Sends a `size` byte payload of `ether_type` to `destination`. `fill` writes the payload
    /// into the buffer it is given and returns how many bytes it wrote.
    fn send(
        &self,
        destination: MacAddr,
        ether_type: u16,
        size: usize,
        fill: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> Result<(), TransportError>;
}

impl<T: Transport> Transport for Arc<T> {
    fn mac(&self) -> MacAddr {
        (**self).mac()
    }

    fn send(
        &self,
        destination: MacAddr,
        ether_type: u16,
        size: usize,
        fill: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> Result<(), TransportError> {
        (**self).send(destination, ether_type, size, fill)
    }
}

/// Transport that pushes whole Ethernet II frames into a crossbeam channel. The receiving end
/// stands in for the wire: tests read it back, and the loopback demo forwards it to a peer.
#[derive(Clone)]
pub struct ChannelTransport {
    mac: MacAddr,
    egress: Sender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn new(mac: MacAddr, egress: Sender<Vec<u8>>) -> Self {
        ChannelTransport { mac, egress }
    }
}

impl Transport for ChannelTransport {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn send(
        &self,
        destination: MacAddr,
        ether_type: u16,
        size: usize,
        fill: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> Result<(), TransportError> {
        if size > MTU {
            return Err(TransportError::FrameTooLarge(size));
        }

        let mut frame = EthernetFrame::with_payload_len(destination, self.mac, ether_type, size);
        let written = fill(frame.payload_mut()).min(size);
        frame.data.truncate(frame.payload_offset + written);

        self.egress.try_send(frame.data).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Disconnected(_) => TransportError::Disconnected,
        })
    }
}
