//! Test doubles for connection handles and protocol books.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use libp2p::{Multiaddr, PeerId, StreamProtocol};

use crate::traits::{ConnectionHandle, ProtocolBook, ProtocolBookError};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection handle that records close requests.
#[derive(Debug, Clone)]
pub(crate) struct TestConn {
    id: u64,
    peer_id: PeerId,
    addr: Multiaddr,
    closed: Arc<AtomicBool>,
}

impl TestConn {
    pub(crate) fn new(peer_id: PeerId) -> Self {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let addr = format!("/ip4/127.0.0.1/tcp/{}", 1024 + id % 60_000)
            .parse()
            .unwrap();
        Self {
            id,
            peer_id,
            addr,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl PartialEq for TestConn {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TestConn {}

impl Hash for TestConn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl ConnectionHandle for TestConn {
    fn remote_peer(&self) -> PeerId {
        self.peer_id
    }

    fn remote_addr(&self) -> &Multiaddr {
        &self.addr
    }

    fn request_close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Protocol book whose lookups always fail.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FailingProtocolBook;

impl ProtocolBook for FailingProtocolBook {
    fn protocols(&self, _peer_id: &PeerId) -> Result<Vec<StreamProtocol>, ProtocolBookError> {
        Err(ProtocolBookError::Unavailable("offline".into()))
    }
}
