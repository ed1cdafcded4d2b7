//! Canonical genesis block synthesis. The header and coinbase are rebuilt
//! from the era constants and checked against the network's genesis hash,
//! so a typo fails loudly instead of poisoning the store.

use btcidx_primitives::encoding::Encoder;
use btcidx_primitives::{hash_from_hex, hash_to_hex, sha256d, BlockHeader};

use crate::params::ChainParams;

const GENESIS_TIMESTAMP: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_PUBKEY_HEX: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61de\
b649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";
const GENESIS_REWARD_SATS: i64 = 50 * 100_000_000;

const OP_CHECKSIG: u8 = 0xac;
const OP_PUSHDATA1: u8 = 0x4c;

/// Builds the network's genesis header and raw block body.
pub fn build_genesis_block(params: &ChainParams) -> Result<(BlockHeader, Vec<u8>), String> {
    let coinbase = genesis_coinbase()?;
    let txid = sha256d(&coinbase);

    let header = BlockHeader {
        version: 1,
        prev_block: [0u8; 32],
        merkle_root: txid,
        time: params.genesis_time,
        bits: params.genesis_bits,
        nonce: params.genesis_nonce,
    };

    let expected = hash_from_hex(params.genesis_hash_hex)
        .ok_or_else(|| "invalid genesis hash constant".to_string())?;
    let actual = header.hash();
    if actual != expected {
        return Err(format!(
            "genesis hash mismatch (expected {}, got {})",
            params.genesis_hash_hex,
            hash_to_hex(&actual)
        ));
    }

    let mut encoder = Encoder::with_capacity(80 + 1 + coinbase.len());
    header.consensus_encode(&mut encoder);
    encoder.write_varint(1);
    encoder.write_bytes(&coinbase);
    Ok((header, encoder.into_inner()))
}

fn genesis_coinbase() -> Result<Vec<u8>, String> {
    let script_sig = genesis_script_sig();
    let script_pubkey = genesis_script_pubkey()?;

    let mut encoder = Encoder::with_capacity(204);
    encoder.write_i32_le(1);
    // One input spending the null outpoint.
    encoder.write_varint(1);
    encoder.write_hash(&[0u8; 32]);
    encoder.write_u32_le(u32::MAX);
    encoder.write_var_bytes(&script_sig);
    encoder.write_u32_le(u32::MAX);
    // One output paying the block reward to the era pubkey.
    encoder.write_varint(1);
    encoder.write_i64_le(GENESIS_REWARD_SATS);
    encoder.write_var_bytes(&script_pubkey);
    encoder.write_u32_le(0);
    Ok(encoder.into_inner())
}

fn genesis_script_sig() -> Vec<u8> {
    let mut script = Vec::new();
    push_data(&mut script, &script_num_to_vec(486604799));
    push_data(&mut script, &script_num_to_vec(4));
    push_data(&mut script, GENESIS_TIMESTAMP.as_bytes());
    script
}

fn genesis_script_pubkey() -> Result<Vec<u8>, String> {
    let pubkey = decode_hex(GENESIS_PUBKEY_HEX)?;
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script, &pubkey);
    script.push(OP_CHECKSIG);
    Ok(script)
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
    } else {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    }
    script.extend_from_slice(data);
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().is_some_and(|byte| byte & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    if input.len() % 2 != 0 {
        return Err("odd hex length".to_string());
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(input.len() / 2);
    for pair in bytes.chunks(2) {
        let high = (pair[0] as char)
            .to_digit(16)
            .ok_or_else(|| "invalid hex digit".to_string())?;
        let low = (pair[1] as char)
            .to_digit(16)
            .ok_or_else(|| "invalid hex digit".to_string())?;
        out.push((high << 4 | low) as u8);
    }
    Ok(out)
}
