use crate::{EthernetFrame, MacAddr, ARP_ETHER_TYPE, IPV4_ETHER_TYPE};
use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Size of an Ethernet/IPv4 ARP payload. There are no variable length fields.
pub const ARP_PACKET_LEN: usize = 28;

const HARDWARE_TYPE_RANGE: (usize, usize) = (0, 2);
const PROTOCOL_TYPE_RANGE: (usize, usize) = (2, 4);
const HARDWARE_ADDR_LEN_OFFSET: usize = 4;
const PROTOCOL_ADDR_LEN_OFFSET: usize = 5;
const OPCODE_RANGE: (usize, usize) = (6, 8);
const SENDER_HARDWARE_ADDR_RANGE: (usize, usize) = (8, 14);
const SENDER_PROTOCOL_ADDR_RANGE: (usize, usize) = (14, 18);
const TARGET_HARDWARE_ADDR_RANGE: (usize, usize) = (18, 24);
const TARGET_PROTOCOL_ADDR_RANGE: (usize, usize) = (24, 28);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOp {
    type Error = DecodeError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ArpOp::Request),
            2 => Ok(ArpOp::Reply),
            other => Err(DecodeError::UnknownOperation(other)),
        }
    }
}

pub enum ArpHardwareType {
    Ethernet = 1,
}

/// Reasons an inbound buffer is not a usable Ethernet/IPv4 ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("ARP packet too short: {0} bytes")]
    TooShort(usize),
    #[error("ARP hardware type or length is not Ethernet")]
    UnusableHardware,
    #[error("ARP protocol type or length is not IPv4")]
    UnusableProtocol,
    #[error("unknown ARP operation {0}")]
    UnknownOperation(u16),
    #[error("frame has ether type {0:#06x}, not ARP")]
    NotArp(u16),
}

///
/// The fixed-layout ARP packet described in RFC 826, specialised to Ethernet hardware
/// addresses and IPv4 protocol addresses.
/// https://tools.ietf.org/html/rfc826
///
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Who-has `target_ip`, asked by `sender_ip`. The target hardware address is left zeroed
    /// since it is the value being determined.
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpPacket {
            operation: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// RFC 5227 probe: a request with an all-zero sender protocol address, so that no other
    /// host's cache is polluted while the address is still being claimed.
    pub fn probe(sender_mac: MacAddr, target_ip: Ipv4Addr) -> Self {
        ArpPacket::request(sender_mac, Ipv4Addr::UNSPECIFIED, target_ip)
    }

    /// RFC 5227 announcement: sender and target protocol address are both the claimed address.
    pub fn announce(sender_mac: MacAddr, ip: Ipv4Addr) -> Self {
        ArpPacket::request(sender_mac, ip, ip)
    }

    /// Answers `request` on behalf of `mac`, swapping sender and target fields.
    pub fn reply_to(request: &ArpPacket, mac: MacAddr) -> Self {
        ArpPacket {
            operation: ArpOp::Reply,
            sender_mac: mac,
            sender_ip: request.target_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        }
    }

    /// Decodes an ARP payload. Bytes past the fixed 28 byte layout (Ethernet padding) are
    /// ignored.
    pub fn decode(buf: &[u8]) -> Result<ArpPacket, DecodeError> {
        if buf.len() < ARP_PACKET_LEN {
            return Err(DecodeError::TooShort(buf.len()));
        }

        if be_u16(buf, HARDWARE_TYPE_RANGE) != ArpHardwareType::Ethernet as u16
            || buf[HARDWARE_ADDR_LEN_OFFSET] != 6
        {
            return Err(DecodeError::UnusableHardware);
        }

        if be_u16(buf, PROTOCOL_TYPE_RANGE) != IPV4_ETHER_TYPE || buf[PROTOCOL_ADDR_LEN_OFFSET] != 4
        {
            return Err(DecodeError::UnusableProtocol);
        }

        let operation = ArpOp::try_from(be_u16(buf, OPCODE_RANGE))?;

        Ok(ArpPacket {
            operation,
            sender_mac: mac_at(buf, SENDER_HARDWARE_ADDR_RANGE),
            sender_ip: ipv4_at(buf, SENDER_PROTOCOL_ADDR_RANGE),
            target_mac: mac_at(buf, TARGET_HARDWARE_ADDR_RANGE),
            target_ip: ipv4_at(buf, TARGET_PROTOCOL_ADDR_RANGE),
        })
    }

    /// Writes the packet into the front of `buf` and returns the number of bytes written.
    ///
    /// Panics if `buf` is shorter than `ARP_PACKET_LEN`.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let buf = &mut buf[..ARP_PACKET_LEN];
        put(buf, HARDWARE_TYPE_RANGE, &(ArpHardwareType::Ethernet as u16).to_be_bytes());
        put(buf, PROTOCOL_TYPE_RANGE, &IPV4_ETHER_TYPE.to_be_bytes());
        buf[HARDWARE_ADDR_LEN_OFFSET] = 6;
        buf[PROTOCOL_ADDR_LEN_OFFSET] = 4;
        put(buf, OPCODE_RANGE, &(self.operation as u16).to_be_bytes());
        put(buf, SENDER_HARDWARE_ADDR_RANGE, &self.sender_mac.bytes);
        put(buf, SENDER_PROTOCOL_ADDR_RANGE, &self.sender_ip.octets());
        put(buf, TARGET_HARDWARE_ADDR_RANGE, &self.target_mac.bytes);
        put(buf, TARGET_PROTOCOL_ADDR_RANGE, &self.target_ip.octets());
        ARP_PACKET_LEN
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0; ARP_PACKET_LEN];
        self.encode_into(&mut buf);
        buf
    }

    /// A request whose sender and target protocol address match. It advertises a binding
    /// rather than asking for one, so it is never answered. Probes carry an unspecified
    /// sender and are not announcements.
    pub fn is_announcement(&self) -> bool {
        self.operation == ArpOp::Request && self.sender_ip == self.target_ip
    }
}

impl fmt::Debug for ArpPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ArpPacket")
            .field("operation", &self.operation)
            .field("sender_mac", &self.sender_mac)
            .field("sender_ip", &self.sender_ip)
            .field("target_mac", &self.target_mac)
            .field("target_ip", &self.target_ip)
            .finish()
    }
}

impl fmt::Display for ArpPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.operation {
            ArpOp::Request => write!(
                f,
                "who-has {} tell {} ({})",
                self.target_ip, self.sender_ip, self.sender_mac
            ),
            ArpOp::Reply => write!(f, "{} is-at {}", self.sender_ip, self.sender_mac),
        }
    }
}

fn be_u16(buf: &[u8], (start, _): (usize, usize)) -> u16 {
    u16::from_be_bytes([buf[start], buf[start + 1]])
}

fn mac_at(buf: &[u8], (start, end): (usize, usize)) -> MacAddr {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&buf[start..end]);
    MacAddr::new(bytes)
}

fn ipv4_at(buf: &[u8], (start, _): (usize, usize)) -> Ipv4Addr {
    Ipv4Addr::new(buf[start], buf[start + 1], buf[start + 2], buf[start + 3])
}

fn put(buf: &mut [u8], (start, end): (usize, usize), bytes: &[u8]) {
    buf[start..end].copy_from_slice(bytes);
}

///
/// EthernetFrame wrapper for frames known to carry an ARP packet.
///
#[derive(Clone, Debug)]
pub struct ArpFrame {
    frame: EthernetFrame,
    packet: ArpPacket,
}

impl ArpFrame {
    pub fn new(packet: ArpPacket, dest: MacAddr) -> Self {
        ArpFrame {
            frame: EthernetFrame::encap_arp(&packet, dest),
            packet,
        }
    }

    pub fn packet(&self) -> &ArpPacket {
        &self.packet
    }

    // Move ownership of the frame back to the caller
    pub fn frame(self) -> EthernetFrame {
        self.frame
    }
}

impl TryFrom<EthernetFrame> for ArpFrame {
    type Error = DecodeError;

    ///
    /// Decorates the given EthernetFrame with the decoded ARP packet.
    /// Validates
    /// - The frame has an ARP ether type
    /// - The payload is a well formed Ethernet/IPv4 ARP packet
    ///
    fn try_from(frame: EthernetFrame) -> Result<Self, Self::Error> {
        if frame.ether_type() != ARP_ETHER_TYPE {
            return Err(DecodeError::NotArp(frame.ether_type()));
        }

        let packet = ArpPacket::decode(&frame.payload())?;
        Ok(ArpFrame { frame, packet })
    }
}
