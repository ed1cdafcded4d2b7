//! Per-network wire and bootstrap constants.

pub const PROTOCOL_VERSION: i32 = 70016;

pub const MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitnodes.io",
    "seed.bitcoin.jonasschnelli.ch",
];

pub const TESTNET3_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "seed.testnet.bitcoin.sprovoost.nl",
    "testnet-seed.bluematt.me",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet3,
}

impl Network {
    pub fn from_arg(value: &str) -> Option<Self> {
        match value {
            "mainnet" => Some(Network::Mainnet),
            "testnet3" => Some(Network::Testnet3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet3 => "testnet3",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    pub genesis_hash_hex: &'static str,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            dns_seeds: MAINNET_SEEDS,
            genesis_hash_hex: "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            genesis_time: 1231006505,
            genesis_bits: 0x1d00ffff,
            genesis_nonce: 2083236893,
        },
        Network::Testnet3 => ChainParams {
            network,
            magic: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18333,
            dns_seeds: TESTNET3_SEEDS,
            genesis_hash_hex: "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
            genesis_time: 1296688602,
            genesis_bits: 0x1d00ffff,
            genesis_nonce: 414098458,
        },
    }
}
