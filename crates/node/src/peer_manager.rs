//! Maintains the outbound peer population: seeds addresses from the store
//! and DNS, keeps the target number of sessions dialing, collects exits,
//! and pings every Ready session on a timer.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use btcidx_chaindb::records::unix_now_secs;
use btcidx_chaindb::PeerRecord;
use btcidx_storage::KeyValueStore;
use tokio::net::lookup_host;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, Duration};

use crate::indexer::Indexer;
use crate::p2p::{build_getheaders_payload, decode_message, Message};
use crate::params::ChainParams;
use crate::peer::{Peer, PeerHandle, PeerReader};
use crate::{
    Config, DIAL_TIMEOUT_SECS, DNS_TIMEOUT_SECS, HANDSHAKE_TIMEOUT_SECS, MESSAGE_QUEUE,
    PEER_TICK_SECS, SEED_RETRY_MAX_SECS, SEED_RETRY_MIN_SECS,
};

pub async fn run<S: KeyValueStore + 'static>(
    indexer: Arc<Indexer<S>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let params = *indexer.params();
    let config = indexer.config().clone();
    let peers_wanted = config.peers_wanted.max(1);

    println!("Peer manager connecting to {peers_wanted} peers");

    let (exit_tx, mut exit_rx) = mpsc::channel::<SocketAddr>(peers_wanted);
    let mut seeds: VecDeque<SocketAddr> = VecDeque::new();
    let mut sessions: JoinSet<()> = JoinSet::new();
    let mut active: HashSet<SocketAddr> = HashSet::new();
    // A timer is required here even with exit notifications: a host that
    // sleeps and wakes sees no RSTs for its former peers. The periodic
    // ping forces a write, which surfaces the dead connections.
    let mut ticker = interval(Duration::from_secs(PEER_TICK_SECS));

    loop {
        // One reseed per top-up pass; if the fresh list adds nothing new
        // (every address already active), wait for exits instead of
        // spinning on it.
        let mut reseeded_this_pass = false;
        while active.len() < peers_wanted {
            let addr = match seeds.pop_front() {
                Some(addr) => addr,
                None => {
                    if reseeded_this_pass {
                        break;
                    }
                    let Some(reseeded) =
                        seed_forever(&indexer, &params, &config, &mut shutdown).await
                    else {
                        // Shutdown while seeding.
                        break;
                    };
                    seeds = reseeded.into();
                    reseeded_this_pass = true;
                    continue;
                }
            };
            if active.contains(&addr) {
                continue;
            }
            active.insert(addr);
            let indexer = Arc::clone(&indexer);
            let shutdown = shutdown.clone();
            let exit_tx = exit_tx.clone();
            sessions.spawn(async move {
                run_session(indexer, addr, shutdown, exit_tx).await;
            });
        }

        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            exited = exit_rx.recv() => {
                if let Some(addr) = exited {
                    active.remove(&addr);
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = ticker.tick() => {
                indexer.ping_peers().await;
            }
        }
    }

    indexer.close_all_peers();
    while sessions.join_next().await.is_some() {}
    Ok(())
}

/// Retries seeding with 5..59 s of random jitter until at least one
/// address is available. `None` means shutdown fired first.
async fn seed_forever<S: KeyValueStore + 'static>(
    indexer: &Indexer<S>,
    params: &ChainParams,
    config: &Config,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Vec<SocketAddr>> {
    if !config.connect.is_empty() {
        return Some(config.connect.clone());
    }
    loop {
        let jitter = rand::random::<u64>() % (SEED_RETRY_MAX_SECS - SEED_RETRY_MIN_SECS);
        let hold_off = Duration::from_secs(SEED_RETRY_MIN_SECS + jitter);
        match seed(indexer, params, config.peers_wanted).await {
            Ok(seeds) if !seeds.is_empty() => return Some(seeds),
            Ok(_) => eprintln!("no peers found, retrying in {hold_off:?}"),
            Err(err) => eprintln!("seed error: {err}, retrying in {hold_off:?}"),
        }
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = sleep(hold_off) => {}
        }
    }
}

/// One seeding pass: stored peers first, then the network's DNS seeds
/// under a single deadline for the whole pass.
async fn seed<S: KeyValueStore + 'static>(
    indexer: &Indexer<S>,
    params: &ChainParams,
    peers_wanted: usize,
) -> Result<Vec<SocketAddr>, String> {
    let mut peers: Vec<SocketAddr> = Vec::new();
    for record in indexer
        .db()
        .peers_random(peers_wanted)
        .map_err(|err| err.to_string())?
    {
        if let Ok(ip) = record.host.parse::<IpAddr>() {
            peers.push(SocketAddr::new(ip, record.port));
        }
    }
    if peers.len() >= peers_wanted {
        return Ok(peers);
    }

    let deadline = Instant::now() + Duration::from_secs(DNS_TIMEOUT_SECS);
    let mut errors_seen = 0usize;
    for host in params.dns_seeds {
        println!("DNS seeding {host}");
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, lookup_host((*host, params.default_port))).await {
            Ok(Ok(resolved)) => peers.extend(resolved),
            Ok(Err(err)) => {
                eprintln!("lookup {host}: {err}");
                errors_seen += 1;
            }
            Err(_) => {
                eprintln!("lookup {host}: deadline exceeded");
                errors_seen += 1;
            }
        }
    }
    if errors_seen == params.dns_seeds.len() {
        return Err("could not seed".to_string());
    }
    Ok(peers)
}

async fn run_session<S: KeyValueStore + 'static>(
    indexer: Arc<Indexer<S>>,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
    exit_tx: mpsc::Sender<SocketAddr>,
) {
    if let Err(err) = session_inner(&indexer, addr, shutdown).await {
        eprintln!("peer {addr}: {err}");
    }
    let _ = exit_tx.try_send(addr);
}

async fn session_inner<S: KeyValueStore + 'static>(
    indexer: &Arc<Indexer<S>>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let params = indexer.params();
    let mut peer = match Peer::connect(
        addr,
        params.magic,
        Duration::from_secs(DIAL_TIMEOUT_SECS),
    )
    .await
    {
        Ok(peer) => peer,
        Err(err) => {
            // Drop the dead address from the book. Draining the table
            // during an outage is fine; DNS seeding rebuilds it.
            if let Err(db_err) = indexer.db().peer_delete(&addr.ip().to_string(), addr.port()) {
                eprintln!("peer delete {addr}: {db_err}");
            }
            return Err(format!("connect: {err}"));
        }
    };

    let start_height = indexer.best_height().unwrap_or(0);
    match timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        peer.handshake(start_height),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(format!("handshake: {err}")),
        Err(_) => return Err("handshake timed out".to_string()),
    }
    println!(
        "Peer connected: {addr} version {} ua {}",
        peer.remote_version(),
        peer.remote_user_agent()
    );

    let mut record = PeerRecord::new(addr.ip().to_string(), addr.port());
    record.last_seen = unix_now_secs();
    if let Err(err) = indexer.db().peers_insert(&[record]) {
        eprintln!("peer upsert {addr}: {err}");
    }

    let (mut reader, handle) = peer.split();
    indexer.register_peer(Arc::clone(&handle));
    let result = ready_loop(indexer, &mut reader, &handle, &mut shutdown).await;
    indexer.unregister_peer(addr);
    handle.close();
    // Requests this peer still owed will hit their deadline; sweep now so
    // the next tick can reassign them.
    indexer.sweep_expired();
    result
}

async fn ready_loop<S: KeyValueStore + 'static>(
    indexer: &Arc<Indexer<S>>,
    reader: &mut PeerReader,
    handle: &Arc<PeerHandle>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), String> {
    // Ask for header announcements and peer gossip.
    handle.write("sendheaders", &[]).await?;
    handle.write("getaddr", &[]).await?;

    // Pretend we are always in IBD: request headers from the current best
    // tip. Every peer races; the duplicate insert ends the race.
    let best = indexer.best_headers()?;
    let tip = best
        .first()
        .ok_or_else(|| "no best header".to_string())?;
    handle
        .write("getheaders", &build_getheaders_payload(&[tip.hash]))
        .await?;

    // One bounded queue and one handler task per session: messages from
    // this peer apply in arrival order, and a full queue backpressures
    // the read loop instead of spawning without bound.
    let (message_tx, mut message_rx) = mpsc::channel::<Message>(MESSAGE_QUEUE);
    let handler = {
        let indexer = Arc::clone(indexer);
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            while let Some(message) = message_rx.recv().await {
                indexer.handle_message(&handle, message).await;
            }
        })
    };

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            _ = handle.wait_closed() => break Ok(()),
            read = reader.read_message() => {
                let (command, payload) = match read {
                    Ok(message) => message,
                    Err(err) => break Err(format!("read: {err}")),
                };
                match decode_message(&command, &payload) {
                    Ok(Message::Unknown(_)) => {}
                    Ok(message) => {
                        if message_tx.send(message).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(err) => break Err(format!("decode {command}: {err}")),
                }
            }
        }
    };

    drop(message_tx);
    let _ = handler.await;
    result
}
