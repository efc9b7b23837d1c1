//! Collaborator seams: connection handles, the protocol book and the notification contract.

use std::fmt::Debug;
use std::hash::Hash;

use auto_impl::auto_impl;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use thiserror::Error;

/// Opaque reference to one transport connection owned by the transport layer.
///
/// Equality and hashing must identify the physical connection, since handles key
/// the per-peer connection maps. The manager never closes a connection itself; it
/// calls [`request_close`](Self::request_close) and waits for the matching
/// disconnect notification.
pub trait ConnectionHandle: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    fn remote_peer(&self) -> PeerId;

    fn remote_addr(&self) -> &Multiaddr;

    /// Ask the transport to close this connection. Must not block.
    fn request_close(&self);
}

#[derive(Debug, Error)]
pub enum ProtocolBookError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("protocol book unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of which application protocols a peer supports.
#[auto_impl(&, Box, Arc)]
pub trait ProtocolBook: Send + Sync {
    /// Protocols supported by `peer_id`. Quota checks walk them in the returned order.
    fn protocols(&self, peer_id: &PeerId) -> Result<Vec<StreamProtocol>, ProtocolBookError>;
}

/// Notification contract driven by the transport's event source.
///
/// Callbacks may arrive concurrently on arbitrary threads. Only connection
/// events carry meaning for the manager; listener and stream events exist to
/// complete the contract.
pub trait ConnectionNotifiee<C: ConnectionHandle>: Send + Sync {
    fn connected(&self, conn: &C);

    fn disconnected(&self, conn: &C);

    fn listen(&self, addr: &Multiaddr);

    fn listen_close(&self, addr: &Multiaddr);

    fn opened_stream(&self, peer_id: &PeerId, protocol: &StreamProtocol);

    fn closed_stream(&self, peer_id: &PeerId, protocol: &StreamProtocol);
}
