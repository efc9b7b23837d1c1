//! Sharded peer registry.
//!
//! Peers are spread over [`SEGMENT_COUNT`] segments selected by the last byte of
//! the peer id, each behind its own mutex, so tag writes and connection events
//! for unrelated peers rarely contend. A segment lock is never held across a
//! call into a collaborator.

use std::collections::HashMap;

use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, MutexGuard};
use web_time::Instant;

use crate::traits::ConnectionHandle;

/// Number of registry segments (one per possible selector byte).
pub const SEGMENT_COUNT: usize = 256;

/// Peer map guarded by one segment lock.
pub(crate) type PeerMap<C> = HashMap<PeerId, PeerRecord<C>>;

/// Bookkeeping for one peer. Only reachable through its segment's lock.
#[derive(Debug)]
pub(crate) struct PeerRecord<C> {
    /// Value contributed by each tag.
    pub(crate) tags: HashMap<String, i64>,
    /// Running sum of `tags`, wrapping on overflow.
    pub(crate) value: i64,
    /// Holds early tags only; no connection notification seen yet.
    pub(crate) provisional: bool,
    /// Start time of each live connection.
    pub(crate) conns: HashMap<C, Instant>,
    pub(crate) first_seen: Instant,
}

impl<C: ConnectionHandle> PeerRecord<C> {
    /// Record created by a tag write before any connection notification.
    pub(crate) fn provisional(now: Instant) -> Self {
        Self {
            tags: HashMap::new(),
            value: 0,
            provisional: true,
            conns: HashMap::new(),
            first_seen: now,
        }
    }

    pub(crate) fn connected(now: Instant) -> Self {
        Self {
            provisional: false,
            ..Self::provisional(now)
        }
    }

    /// Turn a provisional record into a real one, restarting its grace window.
    pub(crate) fn promote(&mut self, now: Instant) {
        if self.provisional {
            self.provisional = false;
            self.first_seen = now;
        }
    }

    pub(crate) fn set_tag(&mut self, tag: String, value: i64) {
        let old = self.tags.insert(tag, value).unwrap_or(0);
        self.value = self.value.wrapping_add(value.wrapping_sub(old));
    }

    pub(crate) fn clear_tag(&mut self, tag: &str) {
        if let Some(old) = self.tags.remove(tag) {
            self.value = self.value.wrapping_sub(old);
        }
    }

    pub(crate) fn update_tag<F>(&mut self, tag: String, upsert: F)
    where
        F: FnOnce(i64) -> i64,
    {
        let old = self.tags.get(&tag).copied().unwrap_or(0);
        let new = upsert(old);
        self.value = self.value.wrapping_add(new.wrapping_sub(old));
        self.tags.insert(tag, new);
    }

    pub(crate) fn is_within_grace(&self, now: Instant, grace: std::time::Duration) -> bool {
        self.first_seen + grace > now
    }

    pub(crate) fn tag_info(&self) -> TagInfo {
        TagInfo {
            first_seen: self.first_seen,
            value: self.value,
            tags: self.tags.clone(),
            connections: self
                .conns
                .iter()
                .map(|(conn, established)| ConnectionInfo {
                    remote_addr: conn.remote_addr().clone(),
                    established: *established,
                })
                .collect(),
        }
    }
}

/// Return the record for `peer_id`, creating a provisional one if absent.
///
/// Takes the locked map so it can only be called with the segment lock held.
pub(crate) fn record_for<C: ConnectionHandle>(
    peers: &mut PeerMap<C>,
    peer_id: PeerId,
    now: Instant,
) -> &mut PeerRecord<C> {
    peers
        .entry(peer_id)
        .or_insert_with(|| PeerRecord::provisional(now))
}

/// Fixed set of independently locked peer maps.
pub(crate) struct Segments<C> {
    segments: [Mutex<PeerMap<C>>; SEGMENT_COUNT],
}

impl<C> Default for Segments<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Segments<C> {
    pub(crate) fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    /// Lock the segment owning `peer_id`.
    pub(crate) fn lock(&self, peer_id: &PeerId) -> MutexGuard<'_, PeerMap<C>> {
        self.segments[segment_index(peer_id)].lock()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Mutex<PeerMap<C>>> {
        self.segments.iter()
    }

    /// Count tracked peers, locking each segment in turn. Diagnostics only.
    pub(crate) fn count_peers(&self) -> usize {
        self.segments.iter().map(|segment| segment.lock().len()).sum()
    }
}

/// Segment selector: last byte of the peer id's canonical encoding.
pub(crate) fn segment_index(peer_id: &PeerId) -> usize {
    peer_id.to_bytes().last().copied().unwrap_or_default() as usize
}

/// Copy of a peer's tag bookkeeping, detached from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub first_seen: Instant,
    /// Sum of all tag values.
    pub value: i64,
    pub tags: HashMap<String, i64>,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Multiaddr,
    pub established: Instant,
}
