//! In-memory protocol book (does not persist across restarts).

use std::collections::HashMap;

use libp2p::{PeerId, StreamProtocol};
use parking_lot::RwLock;

use crate::traits::{ProtocolBook, ProtocolBookError};

/// In-memory [`ProtocolBook`], typically fed from identify results.
///
/// Protocols are reported in the order they were first recorded, without
/// duplicates. Peers that were never recorded report no protocols.
#[derive(Debug, Default)]
pub struct MemoryProtocolBook {
    protocols: RwLock<HashMap<PeerId, Vec<StreamProtocol>>>,
}

impl MemoryProtocolBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the protocols recorded for `peer_id`.
    pub fn set_protocols<I>(&self, peer_id: PeerId, protocols: I)
    where
        I: IntoIterator<Item = StreamProtocol>,
    {
        let mut recorded = Vec::new();
        push_unique(&mut recorded, protocols);
        self.protocols.write().insert(peer_id, recorded);
    }

    pub fn add_protocols<I>(&self, peer_id: PeerId, protocols: I)
    where
        I: IntoIterator<Item = StreamProtocol>,
    {
        push_unique(self.protocols.write().entry(peer_id).or_default(), protocols);
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.protocols.write().remove(peer_id);
    }

    pub fn supports(&self, peer_id: &PeerId, protocol: &StreamProtocol) -> bool {
        self.protocols
            .read()
            .get(peer_id)
            .is_some_and(|recorded| recorded.contains(protocol))
    }

    pub fn len(&self) -> usize {
        self.protocols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProtocolBook for MemoryProtocolBook {
    fn protocols(&self, peer_id: &PeerId) -> Result<Vec<StreamProtocol>, ProtocolBookError> {
        Ok(self
            .protocols
            .read()
            .get(peer_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn push_unique<I>(recorded: &mut Vec<StreamProtocol>, protocols: I)
where
    I: IntoIterator<Item = StreamProtocol>,
{
    for protocol in protocols {
        if !recorded.contains(&protocol) {
            recorded.push(protocol);
        }
    }
}
