//! Connection manager façade: tagging, protection, status and the notification sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use libp2p::{Multiaddr, PeerId, StreamProtocol};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::config::{ConfigError, ConnManagerConfig};
use crate::metrics::ConnManagerMetrics;
use crate::protect::ProtectionSet;
use crate::registry::{PeerRecord, Segments, TagInfo, record_for};
use crate::traits::{ConnectionHandle, ConnectionNotifiee, ProtocolBook};

/// Configuration and live status of a [`ConnManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnManagerStatus {
    pub low_watermark: usize,
    pub high_watermark: usize,
    /// Completion time of the last trim that was not skipped.
    pub last_trim: Option<Instant>,
    pub grace_period: Duration,
    pub silence_period: Duration,
    pub connection_count: usize,
    pub protocol_minimums: HashMap<StreamProtocol, usize>,
}

/// Connection manager that trims connections whenever the count exceeds the
/// high watermark.
///
/// Peers are ranked by the sum of their tags. A trim closes the connections of
/// the lowest ranked peers until the low watermark is reached, skipping peers
/// that are protected, still inside their grace period, or needed to keep a
/// protocol's minimum peer count.
///
/// Trims run from the background trimmer (see [`spawn_trimmer`](Self::spawn_trimmer))
/// or on request through [`trim`](Self::trim). Only one trim runs at a time and
/// consecutive trims are spaced by the configured silence period.
///
/// The manager never closes connections itself. It asks the handle to close and
/// stops tracking the connection once the transport reports the disconnect
/// through [`ConnectionNotifiee::disconnected`].
pub struct ConnManager<C: ConnectionHandle> {
    pub(crate) config: ConnManagerConfig,
    pub(crate) segments: Segments<C>,
    pub(crate) protected: ProtectionSet,
    pub(crate) book: Box<dyn ProtocolBook>,
    /// Live connection counter. Signed so a disconnect racing ahead of its
    /// connect never wraps.
    conn_count: AtomicI64,
    pub(crate) trim_running: AtomicBool,
    pub(crate) last_trim: RwLock<Option<Instant>>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) metrics: ConnManagerMetrics,
}

impl<C: ConnectionHandle> std::fmt::Debug for ConnManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnManager")
            .field("low_watermark", &self.config.low_watermark)
            .field("high_watermark", &self.config.high_watermark)
            .field("connections", &self.connection_count())
            .field("protected", &self.protected.len())
            .finish_non_exhaustive()
    }
}

impl<C: ConnectionHandle> ConnManager<C> {
    /// Create a connection manager consulting `book` for peer protocols.
    ///
    /// The background trimmer is not started; see [`spawn_trimmer`](Self::spawn_trimmer).
    pub fn new<B>(config: ConnManagerConfig, book: B) -> Result<Arc<Self>, ConfigError>
    where
        B: ProtocolBook + 'static,
    {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            segments: Segments::new(),
            protected: ProtectionSet::new(),
            book: Box::new(book),
            conn_count: AtomicI64::new(0),
            trim_running: AtomicBool::new(false),
            last_trim: RwLock::new(None),
            shutdown_tx,
            metrics: ConnManagerMetrics::default(),
        }))
    }

    pub fn config(&self) -> &ConnManagerConfig {
        &self.config
    }

    /// Exclude `peer_id` from trimming until every reason is withdrawn.
    pub fn protect(&self, peer_id: PeerId, reason: impl Into<String>) {
        self.protected.protect(peer_id, reason.into());
    }

    /// Withdraw one protection reason.
    ///
    /// Returns true if the reason was removed and the peer is still protected
    /// by another one. Unknown peers and reasons are a no-op returning false.
    pub fn unprotect(&self, peer_id: &PeerId, reason: &str) -> bool {
        self.protected.unprotect(peer_id, reason)
    }

    pub fn is_protected(&self, peer_id: &PeerId) -> bool {
        self.protected.is_protected(peer_id)
    }

    /// Set tag `tag` on `peer_id` to `value`.
    ///
    /// Tags for peers that are not connected yet are buffered in a provisional
    /// record until the first connection arrives.
    pub fn tag_peer(&self, peer_id: PeerId, tag: impl Into<String>, value: i64) {
        let mut peers = self.segments.lock(&peer_id);
        record_for(&mut peers, peer_id, Instant::now()).set_tag(tag.into(), value);
    }

    pub fn untag_peer(&self, peer_id: &PeerId, tag: &str) {
        let mut peers = self.segments.lock(peer_id);
        match peers.get_mut(peer_id) {
            Some(record) => record.clear_tag(tag),
            None => debug!(%peer_id, tag, "tried to remove tag from untracked peer"),
        }
    }

    /// Atomically replace tag `tag` with `upsert(current)`, where a missing tag reads as 0.
    pub fn update_tag<F>(&self, peer_id: PeerId, tag: impl Into<String>, upsert: F)
    where
        F: FnOnce(i64) -> i64,
    {
        let mut peers = self.segments.lock(&peer_id);
        record_for(&mut peers, peer_id, Instant::now()).update_tag(tag.into(), upsert);
    }

    /// Detached copy of the tag bookkeeping for `peer_id`, if tracked.
    pub fn tag_info(&self, peer_id: &PeerId) -> Option<TagInfo> {
        self.segments.lock(peer_id).get(peer_id).map(PeerRecord::tag_info)
    }

    /// Live connection count as maintained by connect/disconnect notifications.
    pub fn connection_count(&self) -> usize {
        self.conn_count.load(Ordering::Acquire).max(0) as usize
    }

    /// Number of tracked peers, including provisional ones. Locks every segment.
    pub fn peer_count(&self) -> usize {
        self.segments.count_peers()
    }

    pub fn status(&self) -> ConnManagerStatus {
        ConnManagerStatus {
            low_watermark: self.config.low_watermark,
            high_watermark: self.config.high_watermark,
            last_trim: *self.last_trim.read(),
            grace_period: self.config.grace_period,
            silence_period: self.config.silence_period,
            connection_count: self.connection_count(),
            protocol_minimums: self.config.protocol_minimums.clone(),
        }
    }

    /// The manager as a notification sink for the transport's event source.
    pub fn notifiee(self: &Arc<Self>) -> Arc<dyn ConnectionNotifiee<C>> {
        Arc::clone(self) as Arc<dyn ConnectionNotifiee<C>>
    }

    fn adjust_conn_count(&self, delta: i64) {
        let count = self.conn_count.fetch_add(delta, Ordering::AcqRel) + delta;
        self.metrics.set_connections(count.max(0) as usize);
    }
}

impl<C: ConnectionHandle> ConnectionNotifiee<C> for ConnManager<C> {
    fn connected(&self, conn: &C) {
        let peer_id = conn.remote_peer();
        let now = Instant::now();

        {
            let mut peers = self.segments.lock(&peer_id);
            let record = peers
                .entry(peer_id)
                .or_insert_with(|| PeerRecord::connected(now));
            // Early tags were buffered before this notification arrived.
            record.promote(now);

            if record.conns.contains_key(conn) {
                warn!(%peer_id, "received connected notification for conn we are already tracking");
                self.metrics.inc_stale_notifications();
                return;
            }
            record.conns.insert(conn.clone(), now);
        }

        self.adjust_conn_count(1);
        trace!(%peer_id, addr = %conn.remote_addr(), "tracking connection");
    }

    fn disconnected(&self, conn: &C) {
        let peer_id = conn.remote_peer();

        {
            let mut peers = self.segments.lock(&peer_id);
            let Some(record) = peers.get_mut(&peer_id) else {
                warn!(%peer_id, "received disconnected notification for peer we are not tracking");
                self.metrics.inc_stale_notifications();
                return;
            };

            if record.conns.remove(conn).is_none() {
                warn!(%peer_id, "received disconnected notification for conn we are not tracking");
                self.metrics.inc_stale_notifications();
                return;
            }
            if record.conns.is_empty() {
                peers.remove(&peer_id);
            }
        }

        self.adjust_conn_count(-1);
        trace!(%peer_id, "stopped tracking connection");
    }

    fn listen(&self, addr: &Multiaddr) {
        trace!(%addr, "listen notification ignored");
    }

    fn listen_close(&self, addr: &Multiaddr) {
        trace!(%addr, "listen close notification ignored");
    }

    fn opened_stream(&self, _peer_id: &PeerId, _protocol: &StreamProtocol) {}

    fn closed_stream(&self, _peer_id: &PeerId, _protocol: &StreamProtocol) {}
}
