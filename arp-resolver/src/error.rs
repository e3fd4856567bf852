use std::net::Ipv4Addr;
use thiserror::Error;

pub use arp_packets::DecodeError;

/// Failures surfaced to callers of `Arp::query`. Every waiter sharing a request observes the
/// same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArpError {
    #[error("no ARP reply for {0} before the retry budget ran out")]
    Timeout(Ipv4Addr),
    #[error("ARP engine disconnected")]
    Disconnected,
}

/// A frame could not be handed to the link. The engine logs these and carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport channel disconnected")]
    Disconnected,
    #[error("transport queue is full")]
    QueueFull,
    #[error("payload of {0} bytes exceeds the link MTU")]
    FrameTooLarge(usize),
}
