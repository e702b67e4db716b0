#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Networking: the wire-level peer transport, the registry service, the
//! per-participant connection manager, service discovery, and pub/sub
//! matching (spec.md §4).

/// Framed peer-link transport built on `tokio-util`'s `Framed`.
pub mod transport;
/// The standalone registry process (spec.md §4.2/§4.3).
pub mod registry;
/// Per-participant connection manager: receiver tables and dispatch.
pub mod connection;
/// Service discovery diffing (spec.md §4.5).
pub mod discovery;
/// Publisher/subscriber matching (spec.md §4.6).
pub mod pubsub;

pub use connection::{
    ConnectionEvent, ConnectionManager, DispatchedMessage, PeerJoinError, ReceiverKey, CONTROL_MSG_TYPE,
    CONTROL_NETWORK,
};
pub use discovery::ServiceDiscovery;
pub use pubsub::{DataSubscriber, InternalSubscriber, PublisherAnnouncement, SubscriberSpec};
pub use transport::{LinkEvent, PeerLinkHandle, PeerLost, TransportError};
