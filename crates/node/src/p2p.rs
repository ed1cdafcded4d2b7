//! Bitcoin P2P wire codec: message framing and the payload subset this
//! node speaks. Pure functions; the session layer owns the socket.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use btcidx_primitives::encoding::{DecodeError, Decoder, Encoder};
use btcidx_primitives::{sha256d, BlockHeader, Hash256};

use crate::params::PROTOCOL_VERSION;

pub const FRAME_HEADER_SIZE: usize = 24;
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_HEADERS_RESULTS: usize = 2000;
pub const MAX_ADDR_RESULTS: usize = 1000;
pub const MAX_INV_RESULTS: usize = 50_000;
const MAX_ADDRV2_BYTES: usize = 512;

pub const INV_BLOCK: u32 = 2;
const INV_TX: u32 = 1;

const USER_AGENT: &str = "/btcidx:0.1.0/";

#[derive(Debug)]
pub enum CodecError {
    BadMagic,
    BadChecksum,
    Oversized(usize),
    CommandTooLong,
    Malformed(&'static str),
    Decode(DecodeError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::BadMagic => write!(f, "invalid network magic"),
            CodecError::BadChecksum => write!(f, "invalid payload checksum"),
            CodecError::Oversized(size) => write!(f, "payload too large: {size}"),
            CodecError::CommandTooLong => write!(f, "command too long"),
            CodecError::Malformed(what) => write!(f, "malformed {what}"),
            CodecError::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<DecodeError> for CodecError {
    fn from(err: DecodeError) -> Self {
        CodecError::Decode(err)
    }
}

/// One decoded inbound message. Commands this node does not consume decode
/// to `Unknown` and are skipped without failing the stream.
#[derive(Clone, Debug)]
pub enum Message {
    Version(VersionInfo),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<PeerAddress>),
    Headers(Vec<BlockHeader>),
    Inv(Vec<InvEntry>),
    Block(Vec<u8>),
    SendHeaders,
    FeeFilter(i64),
    Unknown(String),
}

#[derive(Clone, Debug)]
pub struct VersionInfo {
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvEntry {
    pub inv_type: u32,
    pub hash: Hash256,
}

impl InvEntry {
    pub fn is_block(&self) -> bool {
        self.inv_type == INV_BLOCK
    }
}

#[derive(Clone, Debug)]
pub struct FrameHeader {
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

pub fn build_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cmd = command.as_bytes();
    if cmd.len() > 12 {
        return Err(CodecError::CommandTooLong);
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn parse_frame_header(
    magic: [u8; 4],
    header: &[u8; FRAME_HEADER_SIZE],
) -> Result<FrameHeader, CodecError> {
    if header[..4] != magic {
        return Err(CodecError::BadMagic);
    }
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(CodecError::Oversized(length));
    }
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&header[20..24]);
    Ok(FrameHeader {
        command,
        length,
        checksum,
    })
}

pub fn verify_checksum(checksum: [u8; 4], payload: &[u8]) -> Result<(), CodecError> {
    let calc = sha256d(payload);
    if checksum != calc[..4] {
        return Err(CodecError::BadChecksum);
    }
    Ok(())
}

pub fn decode_message(command: &str, payload: &[u8]) -> Result<Message, CodecError> {
    match command {
        "version" => Ok(Message::Version(parse_version(payload)?)),
        "verack" => Ok(Message::Verack),
        "ping" => Ok(Message::Ping(parse_nonce(payload))),
        "pong" => Ok(Message::Pong(parse_nonce(payload))),
        "getaddr" => Ok(Message::GetAddr),
        "addr" => Ok(Message::Addr(parse_addr(payload)?)),
        "addrv2" => Ok(Message::Addr(parse_addrv2(payload)?)),
        "headers" => Ok(Message::Headers(parse_headers(payload)?)),
        "inv" => Ok(Message::Inv(parse_inv(payload)?)),
        "block" => Ok(Message::Block(payload.to_vec())),
        "sendheaders" => Ok(Message::SendHeaders),
        "feefilter" => {
            let mut decoder = Decoder::new(payload);
            Ok(Message::FeeFilter(decoder.read_i64_le()?))
        }
        _ => Ok(Message::Unknown(command.to_string())),
    }
}

pub fn build_version_payload(start_height: i32, nonce: u64) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    // No services advertised; this node only consumes.
    encoder.write_u64_le(0);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, 0, [0u8; 16], 0);
    write_net_addr(&mut encoder, 0, [0u8; 16], 0);
    encoder.write_u64_le(nonce);
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.write_u8(0);
    encoder.into_inner()
}

pub fn parse_version(payload: &[u8]) -> Result<VersionInfo, CodecError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let _timestamp = decoder.read_i64_le()?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let _nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    Ok(VersionInfo {
        version,
        services,
        user_agent,
        start_height,
    })
}

pub fn build_ping_payload(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

fn parse_nonce(payload: &[u8]) -> u64 {
    let mut decoder = Decoder::new(payload);
    decoder.read_u64_le().unwrap_or(0)
}

pub fn build_getheaders_payload(locator: &[Hash256]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash(hash);
    }
    // Zero stop hash: stream until the peer's tip.
    encoder.write_hash(&[0u8; 32]);
    encoder.into_inner()
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, CodecError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| CodecError::Malformed("header count"))?;
    if count > MAX_HEADERS_RESULTS {
        return Err(CodecError::Malformed("header count"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        // Trailing tx count, always zero on the wire.
        let _tx_count = decoder.read_varint()?;
        headers.push(header);
    }
    Ok(headers)
}

pub fn build_getdata_payload(hashes: &[Hash256]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(hashes.len() as u64);
    for hash in hashes {
        encoder.write_u32_le(INV_BLOCK);
        encoder.write_hash(hash);
    }
    encoder.into_inner()
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InvEntry>, CodecError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| CodecError::Malformed("inv count"))?;
    if count > MAX_INV_RESULTS {
        return Err(CodecError::Malformed("inv count"));
    }
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let inv_type = decoder.read_u32_le()?;
        let hash = decoder.read_hash()?;
        if inv_type == INV_TX {
            // Mempool traffic; nothing to do with it here.
            continue;
        }
        entries.push(InvEntry { inv_type, hash });
    }
    Ok(entries)
}

pub fn parse_addr(payload: &[u8]) -> Result<Vec<PeerAddress>, CodecError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| CodecError::Malformed("addr count"))?;
    if count > MAX_ADDR_RESULTS {
        return Err(CodecError::Malformed("addr count"));
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let _time = decoder.read_u32_le()?;
        let _services = decoder.read_u64_le()?;
        let ip_bytes = decoder.read_fixed::<16>()?;
        let port_bytes = decoder.read_fixed::<2>()?;
        let port = u16::from_be_bytes(port_bytes);
        if let Some(addr) = usable_addr(Ipv6Addr::from(ip_bytes), port) {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

/// BIP155 addrv2. IPv4 and IPv6 entries are kept; other network IDs
/// (Tor, I2P, CJDNS) are consumed and skipped.
pub fn parse_addrv2(payload: &[u8]) -> Result<Vec<PeerAddress>, CodecError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| CodecError::Malformed("addrv2 count"))?;
    if count > MAX_ADDR_RESULTS {
        return Err(CodecError::Malformed("addrv2 count"));
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let _time = decoder.read_u32_le()?;
        let _services = decoder.read_varint()?;
        let network_id = decoder.read_u8()?;
        let addr_bytes = decoder.read_var_bytes(MAX_ADDRV2_BYTES)?;
        let port_bytes = decoder.read_fixed::<2>()?;
        let port = u16::from_be_bytes(port_bytes);
        let ip = match (network_id, addr_bytes.len()) {
            (1, 4) => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(addr_bytes);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            (2, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(addr_bytes);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => continue,
        };
        let ip6 = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        if let Some(addr) = usable_addr(ip6, port) {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

fn usable_addr(ip6: Ipv6Addr, port: u16) -> Option<PeerAddress> {
    if port == 0 {
        return None;
    }
    let ip = if let Some(ip4) = ip6.to_ipv4_mapped() {
        IpAddr::V4(ip4)
    } else {
        IpAddr::V6(ip6)
    };
    if ip.is_unspecified() || ip.is_loopback() {
        return None;
    }
    Some(PeerAddress { ip, port })
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

fn read_net_addr(decoder: &mut Decoder<'_>) -> Result<(), CodecError> {
    let _services = decoder.read_u64_le()?;
    let _ip = decoder.read_fixed::<16>()?;
    let _port = decoder.read_fixed::<2>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

    fn sample_header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0x01; 32],
            merkle_root: [0x02; 32],
            time: 1296688602,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    #[test]
    fn frame_roundtrip() {
        let payload = b"hello".to_vec();
        let frame = build_frame(MAGIC, "ping", &payload).expect("frame");
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + payload.len());

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let parsed = parse_frame_header(MAGIC, &header).expect("parse");
        assert_eq!(parsed.command, "ping");
        assert_eq!(parsed.length, payload.len());
        verify_checksum(parsed.checksum, &payload).expect("checksum");
    }

    #[test]
    fn frame_rejects_wrong_magic() {
        let frame = build_frame(MAGIC, "ping", &[]).expect("frame");
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        assert!(matches!(
            parse_frame_header([0x0b, 0x11, 0x09, 0x07], &header),
            Err(CodecError::BadMagic)
        ));
    }

    #[test]
    fn checksum_mismatch_detected() {
        let frame = build_frame(MAGIC, "ping", b"payload").expect("frame");
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let parsed = parse_frame_header(MAGIC, &header).expect("parse");
        assert!(matches!(
            verify_checksum(parsed.checksum, b"tampered"),
            Err(CodecError::BadChecksum)
        ));
    }

    #[test]
    fn version_roundtrip() {
        let payload = build_version_payload(812345, 42);
        let info = parse_version(&payload).expect("parse");
        assert_eq!(info.version, PROTOCOL_VERSION);
        assert_eq!(info.services, 0);
        assert_eq!(info.user_agent, USER_AGENT);
        assert_eq!(info.start_height, 812345);
    }

    #[test]
    fn headers_payload_discards_tx_count() {
        let mut encoder = Encoder::new();
        encoder.write_varint(2);
        for nonce in 0..2 {
            sample_header(nonce).consensus_encode(&mut encoder);
            encoder.write_varint(0);
        }
        let headers = parse_headers(&encoder.into_inner()).expect("parse");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].nonce, 1);
    }

    #[test]
    fn headers_count_is_capped() {
        let mut encoder = Encoder::new();
        encoder.write_varint(MAX_HEADERS_RESULTS as u64 + 1);
        assert!(parse_headers(&encoder.into_inner()).is_err());
    }

    #[test]
    fn unknown_command_is_skipped_not_fatal() {
        let message = decode_message("cmpctblock", &[0xff; 8]).expect("decode");
        assert!(matches!(message, Message::Unknown(cmd) if cmd == "cmpctblock"));
    }

    #[test]
    fn inv_filters_tx_entries() {
        let mut encoder = Encoder::new();
        encoder.write_varint(2);
        encoder.write_u32_le(INV_TX);
        encoder.write_hash(&[0x0a; 32]);
        encoder.write_u32_le(INV_BLOCK);
        encoder.write_hash(&[0x0b; 32]);
        let entries = parse_inv(&encoder.into_inner()).expect("parse");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_block());
        assert_eq!(entries[0].hash, [0x0b; 32]);
    }

    #[test]
    fn addr_skips_unusable_entries() {
        let mut encoder = Encoder::new();
        encoder.write_varint(3);
        // Routable v4-mapped address.
        encoder.write_u32_le(0);
        encoder.write_u64_le(0);
        encoder.write_bytes(&Ipv4Addr::new(203, 0, 113, 5).to_ipv6_mapped().octets());
        encoder.write_bytes(&8333u16.to_be_bytes());
        // Loopback.
        encoder.write_u32_le(0);
        encoder.write_u64_le(0);
        encoder.write_bytes(&Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped().octets());
        encoder.write_bytes(&8333u16.to_be_bytes());
        // Zero port.
        encoder.write_u32_le(0);
        encoder.write_u64_le(0);
        encoder.write_bytes(&Ipv4Addr::new(203, 0, 113, 6).to_ipv6_mapped().octets());
        encoder.write_bytes(&0u16.to_be_bytes());

        let addrs = parse_addr(&encoder.into_inner()).expect("parse");
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)));
        assert_eq!(addrs[0].port, 8333);
    }

    #[test]
    fn addrv2_keeps_ip_entries_and_skips_tor() {
        let mut encoder = Encoder::new();
        encoder.write_varint(2);
        // IPv4 entry.
        encoder.write_u32_le(0);
        encoder.write_varint(0);
        encoder.write_u8(1);
        encoder.write_var_bytes(&[203, 0, 113, 9]);
        encoder.write_bytes(&18333u16.to_be_bytes());
        // Tor v3 entry, consumed but skipped.
        encoder.write_u32_le(0);
        encoder.write_varint(0);
        encoder.write_u8(4);
        encoder.write_var_bytes(&[0x55; 32]);
        encoder.write_bytes(&18333u16.to_be_bytes());

        let addrs = parse_addrv2(&encoder.into_inner()).expect("parse");
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
    }

    #[test]
    fn getdata_payload_shape() {
        let payload = build_getdata_payload(&[[0x0c; 32]]);
        let entries = parse_inv(&payload).expect("parse");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_block());
    }
}
