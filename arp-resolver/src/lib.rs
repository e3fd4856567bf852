/// The address table is the state machine at the heart of the resolver. It holds the IP to MAC
/// cache, the addresses this interface owns, and the queries still waiting for a reply. Its
/// transitions are plain functions from one table to the next, returning the packets to send
/// and the waiters to settle instead of doing either themselves.
pub mod table;

/// The engine wraps a single address table behind a lock, drives the retry ticker, and turns the
/// table's output descriptors into transmissions and settled queries. `Arp` is the handle callers
/// use: `query` an address, feed it inbound packets with `input`, and manage local addresses.
pub mod engine;

/// Transports are how the engine reaches the link. The engine only needs "send this payload to this
/// hardware address"; everything about framing and the actual device lives behind the trait.
pub mod transport;

/// Retry cadence and budget.
pub mod config;

pub mod error;

mod waiter;

/// Utility module
pub mod utils;

pub use self::config::ArpConfig;
pub use self::engine::Arp;
pub use self::error::{ArpError, DecodeError, TransportError};
pub use self::transport::{ChannelTransport, Transport};
pub use self::waiter::{Resolution, WaiterGroup};
