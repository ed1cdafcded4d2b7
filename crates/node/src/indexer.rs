//! The indexer façade: owns the chain store, the ready-peer map, the
//! pending-block cache, and the rolling stats window, and dispatches
//! decoded messages from every session to the right handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use btcidx_chaindb::records::unix_now_secs;
use btcidx_chaindb::{BlockId, ChainDb, ChainDbError, HeaderRecord, PeerRecord};
use btcidx_primitives::{hash_to_hex, BlockHeader, Hash256, HEADER_SIZE};
use btcidx_storage::KeyValueStore;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::interval;

use crate::genesis::build_genesis_block;
use crate::p2p::{
    build_getdata_payload, build_getheaders_payload, build_ping_payload, InvEntry, Message,
    PeerAddress,
};
use crate::params::{chain_params, ChainParams};
use crate::peer::PeerHandle;
use crate::pending::{PendingBlocks, ScheduleError};
use crate::stats::{human_bytes, StatsSnapshot, StatsWindow};
use crate::{peer_manager, Config, CACHE_TICK_SECS, STATS_WINDOW_SECS};

pub struct Indexer<S> {
    db: ChainDb<S>,
    params: ChainParams,
    config: Config,
    state: Mutex<IndexerState>,
    running: AtomicBool,
    genesis_inserted: Mutex<bool>,
}

struct IndexerState {
    peers: HashMap<SocketAddr, Arc<PeerHandle>>,
    pending: PendingBlocks,
    window: StatsWindow,
}

impl<S: KeyValueStore + 'static> Indexer<S> {
    pub fn new(db: ChainDb<S>, config: Config) -> Self {
        let params = chain_params(config.network);
        let pending = PendingBlocks::new(config.max_pending, config.request_ttl);
        Self {
            db,
            params,
            config,
            state: Mutex::new(IndexerState {
                peers: HashMap::new(),
                pending,
                window: StatsWindow::new(Duration::from_secs(STATS_WINDOW_SECS)),
            }),
            running: AtomicBool::new(false),
            genesis_inserted: Mutex::new(false),
        }
    }

    pub fn db(&self) -> &ChainDb<S> {
        &self.db
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Short critical sections only; never held across store or network
    // I/O, except the expiry sweep which does no blocking calls.
    fn lock_state(&self) -> MutexGuard<'_, IndexerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs the service until shutdown. A second concurrent invocation
    /// fails fast.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), String> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err("indexer already running".to_string());
        }
        let result = Self::run_inner(&self, &mut shutdown).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        this: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        let best = this.best_headers()?;
        if let Some(tip) = best.first() {
            println!(
                "Best header height {} hash {}",
                tip.height,
                hash_to_hex(&tip.hash)
            );
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: JoinSet<Result<(), String>> = JoinSet::new();
        {
            let indexer = Arc::clone(this);
            let stop_rx = stop_rx.clone();
            tasks.spawn(async move { peer_manager::run(indexer, stop_rx).await });
        }
        {
            let indexer = Arc::clone(this);
            let stop_rx = stop_rx.clone();
            tasks.spawn(async move {
                indexer.cache_ticker(stop_rx).await;
                Ok(())
            });
        }
        {
            let indexer = Arc::clone(this);
            let stop_rx = stop_rx.clone();
            tasks.spawn(async move {
                indexer.status_logger(stop_rx).await;
                Ok(())
            });
        }
        drop(stop_rx);

        let mut result = Ok(());
        tokio::select! {
            _ = shutdown.changed() => {}
            joined = tasks.join_next() => {
                result = flatten_join(joined);
            }
        }

        println!("indexer shutting down");
        let _ = stop_tx.send(true);
        this.close_all_peers();
        while let Some(joined) = tasks.join_next().await {
            let task_result = flatten_join(Some(joined));
            if result.is_ok() {
                result = task_result;
            }
        }
        println!("indexer clean shutdown");
        result
    }

    async fn cache_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(CACHE_TICK_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.check_block_cache().await,
            }
        }
    }

    async fn status_logger(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.status_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => match self.stats_snapshot() {
                    Ok(snapshot) => println!(
                        "Status: height {} pending {}/{} peers {} missing {}",
                        snapshot.best_header_height,
                        snapshot.pending_blocks,
                        self.config.max_pending,
                        snapshot.connected_peers,
                        snapshot.missing_blocks
                    ),
                    Err(err) => eprintln!("status: {err}"),
                },
            }
        }
    }

    // ---- peer registry ----

    pub fn register_peer(&self, handle: Arc<PeerHandle>) {
        let mut state = self.lock_state();
        state.peers.insert(handle.address(), handle);
    }

    pub fn unregister_peer(&self, addr: SocketAddr) {
        let mut state = self.lock_state();
        state.peers.remove(&addr);
    }

    pub fn connected_peers(&self) -> usize {
        self.lock_state().peers.len()
    }

    pub fn close_all_peers(&self) {
        let state = self.lock_state();
        for handle in state.peers.values() {
            handle.close();
        }
    }

    /// Writes a ping to every Ready session. The reply is uninteresting;
    /// the write is what surfaces a silently-dead connection.
    pub async fn ping_peers(&self) {
        let handles: Vec<Arc<PeerHandle>> = self.lock_state().peers.values().cloned().collect();
        for handle in handles {
            if let Err(err) = handle
                .write("ping", &build_ping_payload(unix_now_secs()))
                .await
            {
                eprintln!("ping {}: {err}", handle.address());
                handle.close();
            }
        }
    }

    // ---- read API ----

    /// The best tip. A fresh store gets the network's genesis header and
    /// block inserted exactly once, behind the latch, so simultaneously
    /// connecting peers cannot race it in.
    pub fn best_headers(&self) -> Result<Vec<HeaderRecord>, String> {
        let best = self.db.headers_best().map_err(|err| err.to_string())?;
        if !best.is_empty() {
            return Ok(best);
        }
        self.insert_genesis()?;
        self.db.headers_best().map_err(|err| err.to_string())
    }

    pub fn best_height(&self) -> Result<i32, String> {
        let best = self.best_headers()?;
        Ok(best
            .first()
            .map(|tip| tip.height.min(i32::MAX as u64) as i32)
            .unwrap_or(0))
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Result<(BlockHeader, u64), ChainDbError> {
        let record = self.db.header_by_hash(hash)?;
        Ok((record.header, record.height))
    }

    /// The canonical header at `height`, found by walking prev-links back
    /// from the best tip. Empty when the height is past the tip.
    pub fn headers_by_height(&self, height: u64) -> Result<Vec<BlockHeader>, ChainDbError> {
        let best = self.db.headers_best()?;
        let Some(tip) = best.into_iter().next() else {
            return Ok(Vec::new());
        };
        if height > tip.height {
            return Ok(Vec::new());
        }
        let mut record = tip;
        while record.height > height {
            record = self.db.header_by_hash(&record.header.prev_block)?;
        }
        Ok(vec![record.header])
    }

    pub fn peers_stats(&self) -> Result<(usize, usize), ChainDbError> {
        self.db.peers_stats()
    }

    pub fn stats_snapshot(&self) -> Result<StatsSnapshot, String> {
        let best = self.db.headers_best().map_err(|err| err.to_string())?;
        let tip = best.first();
        let missing = self.db.missing_count().map_err(|err| err.to_string())?;
        let (good, bad) = self.db.peers_stats().map_err(|err| err.to_string())?;
        let (pending, connected) = {
            let state = self.lock_state();
            (state.pending.len(), state.peers.len())
        };
        Ok(StatsSnapshot {
            network: self.params.network.as_str().to_string(),
            best_header_height: tip.map(|record| record.height as i64).unwrap_or(-1),
            best_header_hash: tip.map(|record| hash_to_hex(&record.hash)),
            missing_blocks: missing,
            pending_blocks: pending,
            connected_peers: connected,
            good_peers: good,
            bad_peers: bad,
        })
    }

    fn insert_genesis(&self) -> Result<(), String> {
        let mut inserted = self
            .genesis_inserted
            .lock()
            .map_err(|_| "genesis latch poisoned".to_string())?;
        if *inserted {
            return Ok(());
        }

        let (header, body) = build_genesis_block(&self.params)?;
        let record = HeaderRecord::new(0, header);
        println!(
            "Inserting genesis block header {}",
            hash_to_hex(&record.hash)
        );
        match self.db.headers_insert(std::slice::from_ref(&record)) {
            Ok(()) | Err(ChainDbError::Duplicate) => {}
            Err(err) => return Err(format!("genesis header insert: {err}")),
        }
        self.db
            .block_insert(&record.hash, &body)
            .map_err(|err| format!("genesis block insert: {err}"))?;
        *inserted = true;
        println!("Inserted genesis block");
        Ok(())
    }

    // ---- dispatch ----

    pub async fn handle_message(&self, peer: &Arc<PeerHandle>, message: Message) {
        match message {
            Message::Ping(nonce) => {
                if let Err(err) = peer.write("pong", &build_ping_payload(nonce)).await {
                    eprintln!("pong {}: {err}", peer.address());
                    peer.close();
                }
            }
            Message::Headers(headers) => self.handle_headers(peer, headers).await,
            Message::Block(raw) => self.handle_block(raw).await,
            Message::Inv(entries) => self.handle_inv(entries).await,
            Message::Addr(addrs) => self.handle_addr(addrs),
            // Post-handshake chatter with nothing to do.
            Message::Version(_)
            | Message::Verack
            | Message::Pong(_)
            | Message::GetAddr
            | Message::SendHeaders
            | Message::FeeFilter(_)
            | Message::Unknown(_) => {}
        }
    }

    async fn handle_headers(&self, peer: &Arc<PeerHandle>, headers: Vec<BlockHeader>) {
        if headers.is_empty() {
            // This peer's IBD is caught up; reevaluate the download queue.
            self.check_block_cache().await;
            return;
        }

        let parent = match self.db.header_by_hash(&headers[0].prev_block) {
            Ok(parent) => parent,
            Err(ChainDbError::NotFound) => {
                // The peer serves a chain segment we have not reached;
                // another peer will deliver the gap.
                eprintln!(
                    "headers from {} do not connect: unknown parent {}",
                    peer.address(),
                    hash_to_hex(&headers[0].prev_block)
                );
                return;
            }
            Err(err) => {
                eprintln!("header parent lookup: {err}");
                return;
            }
        };

        let records = match connect_headers(&parent, &headers) {
            Ok(records) => records,
            Err(err) => {
                eprintln!("headers from {}: {err}", peer.address());
                return;
            }
        };

        match self.db.headers_insert(&records) {
            Ok(()) => {}
            Err(ChainDbError::Duplicate) => {
                // Lost the insert race against another peer; reconnect
                // resyncs it from the new tip.
                peer.close();
                return;
            }
            Err(err) => {
                eprintln!("header insert: {err}");
                return;
            }
        }

        let Some(tip) = records.last() else {
            return;
        };
        println!(
            "Inserted {} block headers height {}",
            records.len(),
            tip.height
        );

        // Pull the next batch from the same peer.
        let payload = build_getheaders_payload(&[tip.hash]);
        if let Err(err) = peer.write("getheaders", &payload).await {
            eprintln!("getheaders {}: {err}", peer.address());
            peer.close();
        }
    }

    async fn handle_block(&self, raw: Vec<u8>) {
        if raw.len() < HEADER_SIZE {
            eprintln!("short block message: {} bytes", raw.len());
            return;
        }
        let header = match BlockHeader::from_bytes(&raw[..HEADER_SIZE]) {
            Ok(header) => header,
            Err(err) => {
                eprintln!("block header decode: {err}");
                return;
            }
        };
        let hash = header.hash();

        let mut inserted = false;
        match self.db.block_insert(&hash, &raw) {
            Ok(_) => inserted = true,
            Err(ChainDbError::NotFound) => {
                // Raced ahead of its header; a later tick refetches it.
                eprintln!("block {} has no header yet", hash_to_hex(&hash));
            }
            Err(err) => eprintln!("block insert {}: {err}", hash_to_hex(&hash)),
        }

        // Whatever happened, free the pending slot and feed the window.
        let report = {
            let mut state = self.lock_state();
            state.pending.remove(&hash);
            if inserted {
                state.window.record(hash, raw.len(), Instant::now())
            } else {
                None
            }
        };
        if let Some(report) = report {
            let (good, bad) = self.db.peers_stats().unwrap_or((0, 0));
            let (pending, connected) = {
                let state = self.lock_state();
                (state.pending.len(), state.peers.len())
            };
            println!(
                "Inserted {} blocks ({}, {} duplicates) in the last {:?}",
                report.inserted,
                human_bytes(report.bytes),
                report.duplicates,
                report.elapsed
            );
            println!(
                "Pending blocks {}/{} connected peers {} good peers {} bad peers {}",
                pending, self.config.max_pending, connected, good, bad
            );
        }

        self.check_block_cache().await;
    }

    async fn handle_inv(&self, entries: Vec<InvEntry>) {
        let ids: Vec<BlockId> = entries
            .iter()
            .filter(|entry| entry.is_block())
            // Height is unknown until the header lands; the cache keys by
            // hash, so the placeholder never reaches an ordering.
            .map(|entry| BlockId {
                height: 0,
                hash: entry.hash,
            })
            .collect();
        if ids.is_empty() {
            return;
        }
        self.download_blocks(&ids).await;
    }

    fn handle_addr(&self, addrs: Vec<PeerAddress>) {
        if addrs.is_empty() {
            return;
        }
        let peers: Vec<PeerRecord> = addrs
            .iter()
            .map(|addr| PeerRecord::new(addr.ip.to_string(), addr.port))
            .collect();
        if let Err(err) = self.db.peers_insert(&peers) {
            eprintln!("peers insert: {err}");
        }
    }

    // ---- block scheduler ----

    /// Drops requests past their deadline and closes the owning peers;
    /// they are deemed slow.
    pub fn sweep_expired(&self) {
        let mut state = self.lock_state();
        let expired = state.pending.expire(Instant::now());
        for (hash, addr) in expired {
            println!("expired block {} from {}", hash_to_hex(&hash), addr);
            if let Some(handle) = state.peers.get(&addr) {
                handle.close();
            }
        }
    }

    /// Scheduler tick: expire stalled requests, then top the in-flight
    /// cache back up from the missing-blocks queue.
    pub async fn check_block_cache(&self) {
        self.sweep_expired();
        let want = self.lock_state().pending.want();
        if want == 0 {
            return;
        }
        let ids = match self.db.blocks_missing(want) {
            Ok(ids) => ids,
            Err(err) => {
                eprintln!("blocks missing: {err}");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        self.download_blocks(&ids).await;
    }

    /// Assigns each block to a uniformly random connected peer with
    /// in-flight capacity and sends the `getdata`. Stops when the cache
    /// fills or no peer is available.
    pub async fn download_blocks(&self, ids: &[BlockId]) {
        let now = Instant::now();
        let assignments = {
            let mut state = self.lock_state();
            let mut rng = rand::thread_rng();
            let mut out = Vec::new();
            for id in ids {
                if state.pending.contains(&id.hash) {
                    continue;
                }
                if state.pending.want() == 0 {
                    break;
                }
                let candidates: Vec<SocketAddr> = state
                    .peers
                    .iter()
                    .filter(|(addr, handle)| {
                        !handle.is_closed()
                            && state.pending.per_peer(**addr) < self.config.inflight_per_peer
                    })
                    .map(|(addr, _)| *addr)
                    .collect();
                let Some(&addr) = candidates.choose(&mut rng) else {
                    break;
                };
                match self.cache_block(&mut state, id.hash, addr, now) {
                    Ok(handle) => out.push((id.hash, handle)),
                    Err(ScheduleError::AlreadyCached) => continue,
                    Err(_) => break,
                }
            }
            out
        };

        for (hash, handle) in assignments {
            let payload = build_getdata_payload(&[hash]);
            if let Err(err) = handle.write("getdata", &payload).await {
                eprintln!("getdata {}: {err}", handle.address());
                handle.close();
            }
        }
    }

    fn cache_block(
        &self,
        state: &mut IndexerState,
        hash: Hash256,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<Arc<PeerHandle>, ScheduleError> {
        let Some(handle) = state.peers.get(&addr) else {
            return Err(ScheduleError::ExpiredPeer);
        };
        let handle = Arc::clone(handle);
        state.pending.add(hash, addr, now)?;
        Ok(handle)
    }
}

/// Walks a header batch off a known parent, assigning heights and
/// verifying every link. Any break rejects the whole batch.
pub fn connect_headers(
    parent: &HeaderRecord,
    headers: &[BlockHeader],
) -> Result<Vec<HeaderRecord>, String> {
    let mut records = Vec::with_capacity(headers.len());
    let mut prev_hash = parent.hash;
    let mut height = parent.height;
    for header in headers {
        if header.prev_block != prev_hash {
            return Err(format!("cannot connect header at height {}", height + 1));
        }
        height += 1;
        let record = HeaderRecord::new(height, *header);
        prev_hash = record.hash;
        records.push(record);
    }
    Ok(records)
}

fn flatten_join(
    joined: Option<Result<Result<(), String>, tokio::task::JoinError>>,
) -> Result<(), String> {
    match joined {
        None => Ok(()),
        Some(Ok(result)) => result,
        Some(Err(err)) => Err(format!("task failed: {err}")),
    }
}
