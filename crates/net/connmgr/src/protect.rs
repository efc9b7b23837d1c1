//! Reason-tagged protection from trimming.

use std::collections::{HashMap, HashSet};

use libp2p::PeerId;
use parking_lot::{RwLock, RwLockReadGuard};

/// Peers exempt from trimming, each keyed by the reasons protecting it.
///
/// A peer is protected while it has at least one reason.
#[derive(Debug, Default)]
pub(crate) struct ProtectionSet {
    protected: RwLock<HashMap<PeerId, HashSet<String>>>,
}

impl ProtectionSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn protect(&self, peer_id: PeerId, reason: String) {
        self.protected
            .write()
            .entry(peer_id)
            .or_default()
            .insert(reason);
    }

    /// Drop one reason. Returns true only if `reason` was removed and other
    /// reasons still protect the peer; unknown peers and reasons yield false.
    pub(crate) fn unprotect(&self, peer_id: &PeerId, reason: &str) -> bool {
        let mut protected = self.protected.write();

        let Some(reasons) = protected.get_mut(peer_id) else {
            return false;
        };
        if !reasons.remove(reason) {
            return false;
        }
        if reasons.is_empty() {
            protected.remove(peer_id);
            return false;
        }
        true
    }

    pub(crate) fn is_protected(&self, peer_id: &PeerId) -> bool {
        self.protected.read().contains_key(peer_id)
    }

    /// Shared view for checking many peers under a single read lock.
    ///
    /// Callers must release it before taking any registry segment lock.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<PeerId, HashSet<String>>> {
        self.protected.read()
    }

    pub(crate) fn len(&self) -> usize {
        self.protected.read().len()
    }
}
