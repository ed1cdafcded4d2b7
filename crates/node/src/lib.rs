//! Chain indexer service: maintains a local replica of a Bitcoin chain
//! (headers first, then block bodies) by speaking the P2P wire protocol
//! against a pool of outbound peers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub mod genesis;
pub mod indexer;
pub mod p2p;
pub mod params;
pub mod peer;
pub mod peer_manager;
pub mod pending;
pub mod stats;

pub use indexer::Indexer;
pub use params::Network;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_PEERS_WANTED: usize = 64;
pub const DEFAULT_MAX_PENDING: usize = 128;
pub const DEFAULT_REQUEST_TTL_SECS: u64 = 37;
pub const DEFAULT_INFLIGHT_PER_PEER: usize = 16;
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

pub(crate) const DIAL_TIMEOUT_SECS: u64 = 5;
pub(crate) const HANDSHAKE_TIMEOUT_SECS: u64 = 8;
pub(crate) const PEER_TICK_SECS: u64 = 27;
pub(crate) const CACHE_TICK_SECS: u64 = 10;
pub(crate) const SEED_RETRY_MIN_SECS: u64 = 5;
pub(crate) const SEED_RETRY_MAX_SECS: u64 = 59;
pub(crate) const DNS_TIMEOUT_SECS: u64 = 15;
pub(crate) const STATS_WINDOW_SECS: u64 = 10;
pub(crate) const MESSAGE_QUEUE: usize = 64;

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub data_dir: PathBuf,
    pub peers_wanted: usize,
    pub max_pending: usize,
    pub request_ttl: Duration,
    pub inflight_per_peer: usize,
    pub status_interval_secs: u64,
    /// Fixed peer addresses; non-empty replaces store and DNS seeding.
    pub connect: Vec<SocketAddr>,
    pub stats: bool,
    pub db_cache_mb: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            peers_wanted: DEFAULT_PEERS_WANTED,
            max_pending: DEFAULT_MAX_PENDING,
            request_ttl: Duration::from_secs(DEFAULT_REQUEST_TTL_SECS),
            inflight_per_peer: DEFAULT_INFLIGHT_PER_PEER,
            status_interval_secs: DEFAULT_STATUS_INTERVAL_SECS,
            connect: Vec::new(),
            stats: false,
            db_cache_mb: None,
        }
    }
}

/// Parses the command line. `Ok(None)` means usage was printed.
pub fn parse_args() -> Result<Option<Config>, String> {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                println!("{}", usage());
                return Ok(None);
            }
            "--network" => {
                let value = need_value(&mut args, "--network")?;
                config.network = Network::from_arg(&value)
                    .ok_or_else(|| format!("invalid network: {value}"))?;
            }
            "--data-dir" => {
                config.data_dir = PathBuf::from(need_value(&mut args, "--data-dir")?);
            }
            "--peers" => {
                config.peers_wanted = parse_number(&need_value(&mut args, "--peers")?)?;
            }
            "--max-pending" => {
                config.max_pending = parse_number(&need_value(&mut args, "--max-pending")?)?;
            }
            "--request-ttl-secs" => {
                let secs: u64 = parse_number(&need_value(&mut args, "--request-ttl-secs")?)?;
                config.request_ttl = Duration::from_secs(secs);
            }
            "--inflight-per-peer" => {
                config.inflight_per_peer =
                    parse_number(&need_value(&mut args, "--inflight-per-peer")?)?;
            }
            "--status-interval-secs" => {
                config.status_interval_secs =
                    parse_number(&need_value(&mut args, "--status-interval-secs")?)?;
            }
            "--db-cache-mb" => {
                config.db_cache_mb = Some(parse_number(&need_value(&mut args, "--db-cache-mb")?)?);
            }
            "--connect" => {
                let value = need_value(&mut args, "--connect")?;
                let addr: SocketAddr = value
                    .parse()
                    .map_err(|_| format!("invalid --connect address: {value}"))?;
                config.connect.push(addr);
            }
            "--stats" => config.stats = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(Some(config))
}

fn need_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid number: {value}"))
}

pub fn usage() -> String {
    format!(
        "btcidx - Bitcoin chain indexer

USAGE:
    btcidx [OPTIONS]

OPTIONS:
    --network <mainnet|testnet3>   chain to index (default mainnet)
    --data-dir <PATH>              database home (default {DEFAULT_DATA_DIR})
    --peers <N>                    target peer population (default {DEFAULT_PEERS_WANTED})
    --max-pending <N>              in-flight block request bound (default {DEFAULT_MAX_PENDING})
    --request-ttl-secs <SECS>      block request timeout (default {DEFAULT_REQUEST_TTL_SECS})
    --inflight-per-peer <N>        per-peer request cap (default {DEFAULT_INFLIGHT_PER_PEER})
    --status-interval-secs <SECS>  status line interval (default {DEFAULT_STATUS_INTERVAL_SECS})
    --db-cache-mb <MB>             database block cache size
    --connect <ADDR:PORT>          use a fixed peer instead of seeding (repeatable)
    --stats                        print a store snapshot as JSON and exit
    --help                         print this help"
    )
}

/// Opens the store for the configured network and runs the indexer until
/// interrupted.
#[cfg(feature = "fjall")]
pub async fn run(config: Config) -> Result<(), String> {
    use std::sync::Arc;

    use btcidx_chaindb::ChainDb;
    use btcidx_storage::fjall::{FjallOptions, FjallStore};
    use tokio::sync::watch;

    let network_dir = config.data_dir.join(config.network.as_str());
    std::fs::create_dir_all(&network_dir).map_err(|err| err.to_string())?;

    let options = FjallOptions {
        cache_bytes: config.db_cache_mb.map(|mb| mb * 1024 * 1024),
        ..FjallOptions::default()
    };
    let store = FjallStore::open_with_options(&network_dir, options)
        .map_err(|err| format!("open store: {err}"))?;
    let db = ChainDb::new(Arc::new(store)).map_err(|err| format!("open chain db: {err}"))?;
    let indexer = Arc::new(Indexer::new(db, config.clone()));

    if config.stats {
        let snapshot = indexer.stats_snapshot()?;
        let json = serde_json::to_string_pretty(&snapshot).map_err(|err| err.to_string())?;
        println!("{json}");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    indexer.run(shutdown_rx).await
}
