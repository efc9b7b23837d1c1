//! Trim engine: picks the least valuable connections and requests their closure.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use libp2p::{PeerId, StreamProtocol};
use tracing::{debug, info, trace, warn};
use web_time::Instant;

use crate::manager::ConnManager;
use crate::traits::ConnectionHandle;

/// Why a trim request did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimSkipReason {
    /// Another trim was running.
    InProgress,
    /// The previous trim finished less than the silence period ago.
    Silenced,
}

impl TrimSkipReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Silenced => "silenced",
        }
    }
}

/// Result of a [`ConnManager::trim`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimOutcome {
    /// The trim did not run and the last-trim time is unchanged.
    Skipped(TrimSkipReason),
    /// A watermark is zero.
    Disabled,
    /// The connection count was already at or below the low watermark.
    BelowLowWatermark,
    Completed {
        /// Close requests issued.
        closed: usize,
        /// Provisional records past their grace period that were dropped.
        pruned: usize,
    },
}

/// Registry entry captured for ranking.
#[derive(Debug)]
struct Candidate {
    peer_id: PeerId,
    provisional: bool,
    value: i64,
    connected: bool,
}

enum Selection<C> {
    Disabled,
    BelowLowWatermark,
    Selected { conns: Vec<C>, pruned: usize },
}

impl<C: ConnectionHandle> ConnManager<C> {
    /// Close the connections of as many peers as needed to bring the connection
    /// count down to the low watermark.
    ///
    /// Provisional peers go first, then peers in ascending order of value.
    /// Protected peers, peers still in their grace period and peers needed to
    /// satisfy a protocol minimum are left alone.
    ///
    /// Returns immediately if another trim is running or the previous one
    /// completed less than the silence period ago.
    pub fn trim(&self) -> TrimOutcome {
        if self
            .trim_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("trim already in progress");
            return self.skip(TrimSkipReason::InProgress);
        }
        let _running = scopeguard::guard(&self.trim_running, |running| {
            running.store(false, Ordering::Release);
        });

        let last_trim = *self.last_trim.read();
        if last_trim.is_some_and(|last| last.elapsed() < self.config.silence_period) {
            trace!("previous trim too recent");
            return self.skip(TrimSkipReason::Silenced);
        }

        self.metrics.inc_trims();
        let outcome = match self.select_conns_to_close() {
            Selection::Disabled => TrimOutcome::Disabled,
            Selection::BelowLowWatermark => TrimOutcome::BelowLowWatermark,
            Selection::Selected { conns, pruned } => {
                // All segment locks are released at this point.
                for conn in &conns {
                    debug!(peer_id = %conn.remote_peer(), addr = %conn.remote_addr(), "closing conn");
                    conn.request_close();
                }
                self.metrics.record_trim(conns.len(), pruned);
                if !conns.is_empty() {
                    info!(closed = conns.len(), pruned, "trimmed connections");
                }
                TrimOutcome::Completed {
                    closed: conns.len(),
                    pruned,
                }
            }
        };

        *self.last_trim.write() = Some(Instant::now());
        outcome
    }

    fn skip(&self, reason: TrimSkipReason) -> TrimOutcome {
        self.metrics.inc_skipped(reason);
        TrimOutcome::Skipped(reason)
    }

    fn select_conns_to_close(&self) -> Selection<C> {
        if !self.config.is_trimming_enabled() {
            return Selection::Disabled;
        }

        let count = self.connection_count();
        let low = self.config.low_watermark;
        if count <= low {
            debug!(count, low, "open connection count below limit");
            return Selection::BelowLowWatermark;
        }
        let now = Instant::now();

        let mut candidates = self.snapshot_candidates();

        {
            let protected = self.protected.read();
            candidates.retain(|candidate| !protected.contains_key(&candidate.peer_id));
        }

        // Quota exemption depends on scan order; fix it by peer id.
        candidates.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        let mut candidates = self.exempt_protocol_minimums(candidates);

        // Provisional first, then lowest value. Stable, so equal values keep id order.
        candidates.sort_by(|a, b| {
            b.provisional
                .cmp(&a.provisional)
                .then(a.value.cmp(&b.value))
        });

        let mut target = count - low;
        let mut conns = Vec::with_capacity(target);
        let mut pruned = 0;

        for candidate in candidates {
            if target == 0 {
                break;
            }

            let mut peers = self.segments.lock(&candidate.peer_id);
            // Fully disconnected since the snapshot.
            let Some(record) = peers.get(&candidate.peer_id) else {
                continue;
            };
            if record.is_within_grace(now, self.config.grace_period) {
                continue;
            }

            if record.provisional && record.conns.is_empty() {
                // Early tags that never saw a connection.
                peers.remove(&candidate.peer_id);
                pruned += 1;
                continue;
            }

            conns.extend(record.conns.keys().cloned());
            target = target.saturating_sub(record.conns.len());
        }

        debug!(
            count,
            low,
            closing = conns.len(),
            pruned,
            "selected connections to close"
        );
        Selection::Selected { conns, pruned }
    }

    /// Capture every tracked peer, locking one segment at a time.
    fn snapshot_candidates(&self) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for segment in self.segments.iter() {
            let peers = segment.lock();
            candidates.extend(peers.iter().map(|(peer_id, record)| Candidate {
                peer_id: *peer_id,
                provisional: record.provisional,
                value: record.value,
                connected: !record.conns.is_empty(),
            }));
        }
        candidates
    }

    /// Drop the candidates needed to keep each protocol's minimum peer count.
    ///
    /// Walks candidates in order and counts, per quota-bearing protocol, the
    /// connected peers seen so far. A peer is exempt as soon as one of its
    /// protocols has not exceeded its minimum; its remaining protocols are not
    /// counted. Peers whose protocols cannot be looked up stay prunable.
    fn exempt_protocol_minimums(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let minimums = &self.config.protocol_minimums;
        if minimums.is_empty() {
            return candidates;
        }

        let mut seen: HashMap<&StreamProtocol, usize> = HashMap::new();
        candidates
            .into_iter()
            .filter(|candidate| {
                // Only connected peers count toward a quota.
                if !candidate.connected {
                    return true;
                }

                let protocols = match self.book.protocols(&candidate.peer_id) {
                    Ok(protocols) => protocols,
                    Err(error) => {
                        warn!(peer_id = %candidate.peer_id, %error, "protocol lookup failed, peer stays prunable");
                        return true;
                    }
                };

                let mut exempt = false;
                for protocol in &protocols {
                    let Some((protocol, &minimum)) = minimums.get_key_value(protocol) else {
                        continue;
                    };
                    if minimum == 0 {
                        continue;
                    }
                    let count = seen.entry(protocol).or_default();
                    *count += 1;
                    if *count <= minimum {
                        exempt = true;
                        break;
                    }
                }

                if exempt {
                    trace!(peer_id = %candidate.peer_id, "kept for protocol minimum");
                }
                !exempt
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::book::MemoryProtocolBook;
    use crate::config::ConnManagerConfig;
    use crate::test_utils::{FailingProtocolBook, TestConn};
    use crate::traits::ConnectionNotifiee;

    fn config(low: usize, high: usize) -> ConnManagerConfig {
        ConnManagerConfig::new(low, high, Duration::ZERO).with_silence_period(Duration::ZERO)
    }

    fn connect_peers(cm: &ConnManager<TestConn>, n: usize) -> Vec<TestConn> {
        (0..n)
            .map(|i| {
                let conn = TestConn::new(PeerId::random());
                cm.connected(&conn);
                cm.tag_peer(conn.remote_peer(), "value", i as i64 + 1);
                conn
            })
            .collect()
    }

    fn closed(conns: &[TestConn]) -> Vec<&TestConn> {
        conns.iter().filter(|c| c.is_closed()).collect()
    }

    #[test]
    fn test_trims_lowest_values() {
        let cm = ConnManager::new(config(10, 20), MemoryProtocolBook::new()).unwrap();
        let conns = connect_peers(&cm, 25);

        assert_matches!(cm.trim(), TrimOutcome::Completed { closed: 15, pruned: 0 });

        // Values 1..=15 closed, 16..=25 kept.
        for (i, conn) in conns.iter().enumerate() {
            assert_eq!(conn.is_closed(), i < 15, "peer with value {}", i + 1);
        }
        assert!(cm.status().last_trim.is_some());
    }

    #[test]
    fn test_disabled() {
        let cm = ConnManager::new(config(0, 20), MemoryProtocolBook::new()).unwrap();
        let conns = connect_peers(&cm, 25);

        assert_eq!(cm.trim(), TrimOutcome::Disabled);
        assert!(closed(&conns).is_empty());
        assert!(cm.status().last_trim.is_some());
    }

    #[test]
    fn test_below_low_watermark() {
        let cm = ConnManager::new(config(10, 20), MemoryProtocolBook::new()).unwrap();
        let conns = connect_peers(&cm, 10);

        assert_eq!(cm.trim(), TrimOutcome::BelowLowWatermark);
        assert!(closed(&conns).is_empty());
    }

    #[test]
    fn test_silence_period() {
        let cm = ConnManager::new(
            config(2, 4).with_silence_period(Duration::from_secs(3600)),
            MemoryProtocolBook::new(),
        )
        .unwrap();
        connect_peers(&cm, 6);

        assert_matches!(cm.trim(), TrimOutcome::Completed { closed: 4, .. });
        let last_trim = cm.status().last_trim;

        assert_eq!(cm.trim(), TrimOutcome::Skipped(TrimSkipReason::Silenced));
        assert_eq!(cm.status().last_trim, last_trim);
    }

    #[test]
    fn test_in_progress() {
        let cm = ConnManager::new(config(2, 4), MemoryProtocolBook::new()).unwrap();
        connect_peers(&cm, 6);

        cm.trim_running.store(true, Ordering::Release);
        assert_eq!(cm.trim(), TrimOutcome::Skipped(TrimSkipReason::InProgress));
        assert!(cm.status().last_trim.is_none());

        cm.trim_running.store(false, Ordering::Release);
        assert_matches!(cm.trim(), TrimOutcome::Completed { .. });
        assert!(!cm.trim_running.load(Ordering::Acquire));
    }

    #[test]
    fn test_grace_period() {
        let cm = ConnManager::new(
            config(2, 4).with_grace_period(Duration::from_secs(3600)),
            MemoryProtocolBook::new(),
        )
        .unwrap();
        let conns = connect_peers(&cm, 6);

        assert_eq!(
            cm.trim(),
            TrimOutcome::Completed {
                closed: 0,
                pruned: 0
            }
        );
        assert!(closed(&conns).is_empty());
    }

    #[test]
    fn test_protected_peer_kept() {
        let cm = ConnManager::new(config(2, 4), MemoryProtocolBook::new()).unwrap();
        let conns = connect_peers(&cm, 6);
        let lowest = conns[0].remote_peer();

        cm.protect(lowest, "bootnode");
        assert_matches!(cm.trim(), TrimOutcome::Completed { closed: 4, .. });

        assert!(!conns[0].is_closed());
        // The next four lowest go instead.
        assert!(conns[1..5].iter().all(TestConn::is_closed));
        assert!(!conns[5].is_closed());
    }

    #[test]
    fn test_multi_connection_peer_counts_all_conns() {
        let cm = ConnManager::new(config(3, 4), MemoryProtocolBook::new()).unwrap();
        let peer = PeerId::random();
        let heavy: Vec<TestConn> = (0..3).map(|_| TestConn::new(peer)).collect();
        for conn in &heavy {
            cm.connected(conn);
        }
        cm.tag_peer(peer, "value", -5);
        let others = connect_peers(&cm, 3);

        // Six connections, target three: the heavy peer alone covers it.
        assert_matches!(cm.trim(), TrimOutcome::Completed { closed: 3, .. });
        assert!(heavy.iter().all(TestConn::is_closed));
        assert!(closed(&others).is_empty());
    }

    #[test]
    fn test_provisional_pruned_and_counted_first() {
        let cm = ConnManager::new(config(2, 4), MemoryProtocolBook::new()).unwrap();
        let early = PeerId::random();
        cm.tag_peer(early, "early", 1000);
        let conns = connect_peers(&cm, 4);

        assert_eq!(
            cm.trim(),
            TrimOutcome::Completed {
                closed: 2,
                pruned: 1
            }
        );
        assert!(cm.tag_info(&early).is_none());
        assert_eq!(closed(&conns).len(), 2);
    }

    #[test]
    fn test_protocol_minimum_kept() {
        let kad = StreamProtocol::new("/ipfs/kad/1.0.0");
        let book = Arc::new(MemoryProtocolBook::new());
        let cm = ConnManager::new(
            config(1, 2).with_protocol_minimum(kad.clone(), 2),
            Arc::clone(&book),
        )
        .unwrap();

        let conns = connect_peers(&cm, 5);
        for conn in &conns {
            book.set_protocols(conn.remote_peer(), [kad.clone()]);
        }

        assert_matches!(cm.trim(), TrimOutcome::Completed { closed: 3, .. });

        let survivors: Vec<_> = conns.iter().filter(|c| !c.is_closed()).collect();
        assert_eq!(survivors.len(), 2);

        // The quota keeps the two lowest peer ids, regardless of value.
        let mut ids: Vec<PeerId> = conns.iter().map(TestConn::remote_peer).collect();
        ids.sort();
        for survivor in survivors {
            assert!(ids[..2].contains(&survivor.remote_peer()));
        }
    }

    #[test]
    fn test_protocol_minimum_exempts_on_first_match() {
        let alpha = StreamProtocol::new("/alpha/1.0.0");
        let beta = StreamProtocol::new("/beta/1.0.0");
        let book = Arc::new(MemoryProtocolBook::new());
        let cm = ConnManager::new(
            config(1, 2)
                .with_protocol_minimum(alpha.clone(), 1)
                .with_protocol_minimum(beta.clone(), 1),
            Arc::clone(&book),
        )
        .unwrap();

        let mut conns = connect_peers(&cm, 3);
        conns.sort_by_key(TestConn::remote_peer);
        book.set_protocols(conns[0].remote_peer(), [alpha, beta.clone()]);
        book.set_protocols(conns[1].remote_peer(), [beta]);

        // The first peer is exempt through alpha and does not use up beta's
        // slot, so the second peer is exempt through beta.
        assert_matches!(cm.trim(), TrimOutcome::Completed { closed: 1, .. });
        assert!(!conns[0].is_closed());
        assert!(!conns[1].is_closed());
        assert!(conns[2].is_closed());
    }

    #[test]
    fn test_provisional_within_grace_is_kept() {
        let cm = ConnManager::new(
            config(2, 4).with_grace_period(Duration::from_millis(300)),
            MemoryProtocolBook::new(),
        )
        .unwrap();
        let conns = connect_peers(&cm, 6);
        std::thread::sleep(Duration::from_millis(400));

        let early = PeerId::random();
        cm.tag_peer(early, "early", -50);

        assert_eq!(
            cm.trim(),
            TrimOutcome::Completed {
                closed: 4,
                pruned: 0
            }
        );
        assert!(cm.tag_info(&early).is_some());
        assert_eq!(closed(&conns).len(), 4);
    }

    #[test]
    fn test_protocol_lookup_failure_is_prunable() {
        let kad = StreamProtocol::new("/ipfs/kad/1.0.0");
        let cm = ConnManager::new(
            config(1, 2).with_protocol_minimum(kad, 5),
            FailingProtocolBook,
        )
        .unwrap();
        let conns = connect_peers(&cm, 4);

        assert_matches!(cm.trim(), TrimOutcome::Completed { closed: 3, .. });
        assert_eq!(closed(&conns).len(), 3);
    }

    #[test]
    fn test_closed_conns_leave_after_disconnect() {
        let cm = ConnManager::new(config(10, 20), MemoryProtocolBook::new()).unwrap();
        let conns = connect_peers(&cm, 25);

        cm.trim();
        assert_eq!(cm.connection_count(), 25);

        for conn in closed(&conns) {
            cm.disconnected(conn);
        }
        assert_eq!(cm.connection_count(), 10);
    }
}
