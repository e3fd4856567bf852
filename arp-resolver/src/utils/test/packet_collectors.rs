use arp_packets::{ArpFrame, ArpPacket, EthernetFrame, MacAddr};
use crossbeam::channel::Receiver;
use std::convert::TryFrom;

/// An ARP packet observed on a `ChannelTransport`, with the hardware address it was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub destination: MacAddr,
    pub packet: ArpPacket,
}

/// Drains every frame currently queued on `frames` without blocking. Frames that are not
/// well formed ARP are skipped.
pub fn collect_arp(frames: &Receiver<Vec<u8>>) -> Vec<Observed> {
    frames
        .try_iter()
        .filter_map(|data| EthernetFrame::from_buffer(data, 0).ok())
        .filter_map(|frame| ArpFrame::try_from(frame).ok())
        .map(|arp_frame| {
            let packet = *arp_frame.packet();
            Observed {
                destination: arp_frame.frame().dest_mac(),
                packet,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, Transport};
    use arp_packets::{ARP_ETHER_TYPE, ARP_PACKET_LEN};
    use crossbeam::channel;
    use std::net::Ipv4Addr;

    #[test]
    fn collects_arp_and_skips_garbage() {
        let (s, r) = channel::unbounded();
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let transport = ChannelTransport::new(mac, s.clone());
        let packet = ArpPacket::announce(mac, Ipv4Addr::new(10, 0, 0, 1));

        transport
            .send(MacAddr::BROADCAST, ARP_ETHER_TYPE, ARP_PACKET_LEN, &mut |buf| {
                packet.encode_into(buf)
            })
            .unwrap();
        s.send(vec![1, 2, 3]).unwrap();

        assert_eq!(
            collect_arp(&r),
            vec![Observed {
                destination: MacAddr::BROADCAST,
                packet
            }]
        );
        assert!(collect_arp(&r).is_empty());
    }
}
