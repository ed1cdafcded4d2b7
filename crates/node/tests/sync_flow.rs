//! Drives a full sync against an in-process mock peer: handshake, header
//! batches, missing-block scheduling, and block insertion.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use btcidx_chaindb::ChainDb;
use btcidx_node::params::{chain_params, Network};
use btcidx_node::{Config, Indexer};
use btcidx_primitives::hash_from_hex;
use btcidx_storage::memory::MemoryStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::test]
async fn syncs_headers_and_blocks_from_a_peer() {
    let params = chain_params(Network::Testnet3);
    let genesis_hash = hash_from_hex(params.genesis_hash_hex).expect("hash");
    let headers = common::chain_on(genesis_hash, 5);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let peer_addr = listener.local_addr().expect("addr");
    tokio::spawn(common::serve_mock_peer(
        listener,
        params.magic,
        headers.clone(),
    ));

    let store = Arc::new(MemoryStore::new());
    let db = ChainDb::new(Arc::clone(&store)).expect("open");
    let config = Config {
        network: Network::Testnet3,
        peers_wanted: 1,
        max_pending: 8,
        connect: vec![peer_addr],
        status_interval_secs: 3600,
        ..Config::default()
    };
    let indexer = Arc::new(Indexer::new(db, config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = {
        let indexer = Arc::clone(&indexer);
        tokio::spawn(async move { indexer.run(shutdown_rx).await })
    };

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut synced = false;
    while Instant::now() < deadline {
        let best = indexer.db().headers_best().expect("best");
        let missing = indexer.db().missing_count().expect("missing");
        if best.first().map(|tip| tip.height) == Some(5) && missing == 0 {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(synced, "indexer did not sync the mock chain");

    // Every announced body landed in the store.
    for header in &headers {
        assert!(indexer.db().block_by_hash(&header.hash()).is_ok());
    }

    let (header, height) = indexer.header_by_hash(&headers[2].hash()).expect("read");
    assert_eq!(height, 3);
    assert_eq!(header.hash(), headers[2].hash());

    shutdown_tx.send(true).expect("shutdown");
    run.await.expect("join").expect("run");
}
