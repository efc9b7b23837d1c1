#![allow(unknown_lints, missing_docs)]

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use libp2p::{Multiaddr, PeerId};
use rand::Rng;
use tidewater_net_connmgr::{
    ConnManager, ConnManagerConfig, ConnectionHandle, ConnectionNotifiee, MemoryProtocolBook,
};

const PEERS: usize = 5000;
const TAGGERS: usize = 16;

#[derive(Debug, Clone)]
struct BenchConn {
    id: usize,
    peer_id: PeerId,
    addr: Multiaddr,
}

impl PartialEq for BenchConn {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BenchConn {}

impl Hash for BenchConn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl ConnectionHandle for BenchConn {
    fn remote_peer(&self) -> PeerId {
        self.peer_id
    }

    fn remote_addr(&self) -> &Multiaddr {
        &self.addr
    }

    fn request_close(&self) {}
}

fn random_conns() -> Arc<Vec<BenchConn>> {
    let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
    Arc::new(
        (0..PEERS)
            .map(|id| BenchConn {
                id,
                peer_id: PeerId::random(),
                addr: addr.clone(),
            })
            .collect(),
    )
}

/// Connection churn on one thread while other threads keep tagging random peers.
pub fn lock_contention(c: &mut Criterion) {
    let conns = random_conns();
    let cm: Arc<ConnManager<BenchConn>> = ConnManager::new(
        ConnManagerConfig::new(1000, 1000, Duration::ZERO),
        MemoryProtocolBook::new(),
    )
    .unwrap();
    let notifiee = cm.notifiee();

    let stop = Arc::new(AtomicBool::new(false));
    let taggers: Vec<_> = (0..TAGGERS)
        .map(|_| {
            let cm = Arc::clone(&cm);
            let conns = Arc::clone(&conns);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = rand::rng();
                while !stop.load(Ordering::Relaxed) {
                    let conn = &conns[rng.random_range(0..conns.len())];
                    cm.tag_peer(conn.remote_peer(), "another-tag", 1);
                }
            })
        })
        .collect();

    let mut g = c.benchmark_group("connmgr");
    g.bench_function("lock_contention", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            let conn = &conns[rng.random_range(0..conns.len())];
            let peer_id = conn.remote_peer();
            notifiee.connected(conn);
            cm.tag_peer(peer_id, "tag", 100);
            cm.untag_peer(&peer_id, "tag");
            notifiee.disconnected(conn);
            black_box(cm.connection_count());
        })
    });
    g.finish();

    stop.store(true, Ordering::Relaxed);
    for tagger in taggers {
        tagger.join().unwrap();
    }
}

criterion_group!(benches, lock_contention);
criterion_main!(benches);
