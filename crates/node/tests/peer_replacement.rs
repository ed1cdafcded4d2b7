//! Peer-manager behavior under failing dials: dead addresses are dropped
//! from the address book and replaced until the target population holds.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use btcidx_chaindb::{ChainDb, PeerRecord};
use btcidx_node::params::{chain_params, Network};
use btcidx_node::{Config, Indexer};
use btcidx_storage::memory::MemoryStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Binds and immediately drops a listener, yielding an address that
/// refuses connections.
fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr")
}

#[tokio::test]
async fn failed_dials_are_replaced_and_deleted() {
    let params = chain_params(Network::Mainnet);

    let bad1 = refused_addr();
    let bad2 = refused_addr();

    let mut good = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        good.push(listener.local_addr().expect("addr"));
        tokio::spawn(common::serve_mock_peer(listener, params.magic, Vec::new()));
    }

    let store = Arc::new(MemoryStore::new());
    let db = ChainDb::new(Arc::clone(&store)).expect("open");
    // The dead addresses start out in the address book.
    db.peers_insert(&[
        PeerRecord::new(bad1.ip().to_string(), bad1.port()),
        PeerRecord::new(bad2.ip().to_string(), bad2.port()),
    ])
    .expect("insert");

    let config = Config {
        network: Network::Mainnet,
        peers_wanted: 2,
        connect: vec![bad1, bad2, good[0], good[1]],
        status_interval_secs: 3600,
        ..Config::default()
    };
    let indexer = Arc::new(Indexer::new(db, config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = {
        let indexer = Arc::clone(&indexer);
        tokio::spawn(async move { indexer.run(shutdown_rx).await })
    };

    let deadline = Instant::now() + Duration::from_secs(15);
    let mut replaced = false;
    while Instant::now() < deadline {
        if indexer.connected_peers() == 2 {
            replaced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(replaced, "peer population never reached the target");

    // The failed addresses were deleted; the live ones were upserted on
    // handshake with a fresh last_seen.
    let peers = indexer.db().peers_random(100).expect("random");
    assert!(!peers
        .iter()
        .any(|peer| peer.port == bad1.port() || peer.port == bad2.port()));
    for addr in &good {
        let record = peers
            .iter()
            .find(|peer| peer.port == addr.port())
            .expect("good peer recorded");
        assert!(record.last_seen > 0);
    }

    shutdown_tx.send(true).expect("shutdown");
    run.await.expect("join").expect("run");
}
