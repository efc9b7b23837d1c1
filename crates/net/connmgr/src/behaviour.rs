//! NetworkBehaviour wiring the connection manager into a libp2p swarm.
//!
//! The behaviour is both the notification source (connection and listener
//! events from the swarm) and the transport collaborator: close requests from
//! trims come back through a channel and leave as
//! [`ToSwarm::CloseConnection`].

use std::{
    collections::HashMap,
    convert::Infallible,
    hash::{Hash, Hasher},
    sync::Arc,
    task::{Context, Poll},
};

use libp2p::{
    Multiaddr, PeerId,
    core::{Endpoint, transport::PortUse},
    swarm::{
        CloseConnection, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandler,
        THandlerInEvent, THandlerOutEvent, ToSwarm, dummy,
    },
};
use tokio::sync::mpsc;
use tracing::trace;

use crate::manager::ConnManager;
use crate::traits::{ConnectionHandle, ConnectionNotifiee};

/// Request to close one swarm connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRequest {
    pub peer_id: PeerId,
    pub connection_id: ConnectionId,
}

/// Handle to a connection established by the swarm.
///
/// Identity is the (peer, connection id) pair.
#[derive(Debug, Clone)]
pub struct SwarmConnection {
    peer_id: PeerId,
    connection_id: ConnectionId,
    remote_addr: Multiaddr,
    closer: mpsc::UnboundedSender<CloseRequest>,
}

impl SwarmConnection {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl PartialEq for SwarmConnection {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id && self.connection_id == other.connection_id
    }
}

impl Eq for SwarmConnection {}

impl Hash for SwarmConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
        self.connection_id.hash(state);
    }
}

impl ConnectionHandle for SwarmConnection {
    fn remote_peer(&self) -> PeerId {
        self.peer_id
    }

    fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    fn request_close(&self) {
        let request = CloseRequest {
            peer_id: self.peer_id,
            connection_id: self.connection_id,
        };
        if self.closer.send(request).is_err() {
            trace!(peer_id = %self.peer_id, "behaviour gone, dropping close request");
        }
    }
}

/// Connection manager type driven by [`ConnManagerBehaviour`].
pub type SwarmConnManager = ConnManager<SwarmConnection>;

/// NetworkBehaviour feeding swarm connection events to a [`SwarmConnManager`].
///
/// Emits no events of its own.
pub struct ConnManagerBehaviour {
    manager: Arc<SwarmConnManager>,
    /// Handles of the connections currently reported to the manager.
    connections: HashMap<ConnectionId, SwarmConnection>,
    close_tx: mpsc::UnboundedSender<CloseRequest>,
    close_rx: mpsc::UnboundedReceiver<CloseRequest>,
}

impl ConnManagerBehaviour {
    pub fn new(manager: Arc<SwarmConnManager>) -> Self {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        Self {
            manager,
            connections: HashMap::new(),
            close_tx,
            close_rx,
        }
    }

    pub fn manager(&self) -> &Arc<SwarmConnManager> {
        &self.manager
    }

    fn on_connection_established(
        &mut self,
        peer_id: PeerId,
        connection_id: ConnectionId,
        remote_addr: Multiaddr,
    ) {
        let conn = SwarmConnection {
            peer_id,
            connection_id,
            remote_addr,
            closer: self.close_tx.clone(),
        };
        self.manager.connected(&conn);
        self.connections.insert(connection_id, conn);
    }

    fn on_connection_closed(&mut self, connection_id: ConnectionId) {
        match self.connections.remove(&connection_id) {
            Some(conn) => self.manager.disconnected(&conn),
            None => trace!(?connection_id, "closed connection was never reported"),
        }
    }
}

impl NetworkBehaviour for ConnManagerBehaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_established_inbound_connection(
        &mut self,
        _: ConnectionId,
        _: PeerId,
        _: &Multiaddr,
        _: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        Ok(dummy::ConnectionHandler)
    }

    fn handle_established_outbound_connection(
        &mut self,
        _: ConnectionId,
        _: PeerId,
        _: &Multiaddr,
        _: Endpoint,
        _: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        Ok(dummy::ConnectionHandler)
    }

    fn on_swarm_event(&mut self, event: FromSwarm) {
        match event {
            FromSwarm::ConnectionEstablished(established) => {
                self.on_connection_established(
                    established.peer_id,
                    established.connection_id,
                    established.endpoint.get_remote_address().clone(),
                );
            }
            FromSwarm::ConnectionClosed(closed) => {
                self.on_connection_closed(closed.connection_id);
            }
            FromSwarm::NewListenAddr(listen) => self.manager.listen(listen.addr),
            FromSwarm::ExpiredListenAddr(expired) => self.manager.listen_close(expired.addr),
            _ => {}
        }
    }

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        if let Poll::Ready(Some(request)) = self.close_rx.poll_recv(cx) {
            return Poll::Ready(ToSwarm::CloseConnection {
                peer_id: request.peer_id,
                connection: CloseConnection::One(request.connection_id),
            });
        }
        Poll::Pending
    }
}
