//! A minimal remote node for driving the indexer over real sockets:
//! answers the handshake, serves a fixed header chain and its block
//! bodies, and echoes pings.

#![allow(dead_code)]

use std::collections::HashMap;

use btcidx_node::p2p::{
    build_frame, build_version_payload, parse_frame_header, parse_inv, verify_checksum,
    FRAME_HEADER_SIZE,
};
use btcidx_primitives::encoding::Encoder;
use btcidx_primitives::{BlockHeader, Hash256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub async fn read_frame(stream: &mut TcpStream, magic: [u8; 4]) -> Option<(String, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header).await.ok()?;
    let frame = parse_frame_header(magic, &header).ok()?;
    let mut payload = vec![0u8; frame.length];
    stream.read_exact(&mut payload).await.ok()?;
    verify_checksum(frame.checksum, &payload).ok()?;
    Some((frame.command, payload))
}

pub async fn write_frame(
    stream: &mut TcpStream,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> bool {
    let frame = build_frame(magic, command, payload).expect("frame");
    stream.write_all(&frame).await.is_ok()
}

pub fn headers_payload(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        header.consensus_encode(&mut encoder);
        encoder.write_varint(0);
    }
    encoder.into_inner()
}

/// A linear header chain built on `prev`.
pub fn chain_on(prev: Hash256, count: usize) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(count);
    let mut prev_block = prev;
    for i in 0..count {
        let header = BlockHeader {
            version: 1,
            prev_block,
            merkle_root: [i as u8; 32],
            time: 1296688602 + i as u32,
            bits: 0x1d00ffff,
            nonce: i as u32,
        };
        prev_block = header.hash();
        headers.push(header);
    }
    headers
}

/// An empty block body for `header`: just the header and a zero tx count.
pub fn block_body(header: &BlockHeader) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(81);
    header.consensus_encode(&mut encoder);
    encoder.write_varint(0);
    encoder.into_inner()
}

pub async fn serve_mock_peer(listener: TcpListener, magic: [u8; 4], headers: Vec<BlockHeader>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(serve_connection(stream, magic, headers.clone()));
    }
}

async fn serve_connection(mut stream: TcpStream, magic: [u8; 4], headers: Vec<BlockHeader>) {
    // Handshake: answer the client's version, then wait for its verack.
    loop {
        let Some((command, _payload)) = read_frame(&mut stream, magic).await else {
            return;
        };
        match command.as_str() {
            "version" => {
                let version = build_version_payload(headers.len() as i32, 7);
                if !write_frame(&mut stream, magic, "version", &version).await {
                    return;
                }
                if !write_frame(&mut stream, magic, "verack", &[]).await {
                    return;
                }
            }
            "verack" => break,
            _ => {}
        }
    }

    let bodies: HashMap<Hash256, Vec<u8>> = headers
        .iter()
        .map(|header| (header.hash(), block_body(header)))
        .collect();
    let mut sent_headers = false;

    loop {
        let Some((command, payload)) = read_frame(&mut stream, magic).await else {
            return;
        };
        match command.as_str() {
            "ping" => {
                if !write_frame(&mut stream, magic, "pong", &payload).await {
                    return;
                }
            }
            "getheaders" => {
                // Serve the whole chain once, then report caught-up.
                let response = if sent_headers {
                    headers_payload(&[])
                } else {
                    sent_headers = true;
                    headers_payload(&headers)
                };
                if !write_frame(&mut stream, magic, "headers", &response).await {
                    return;
                }
            }
            "getdata" => {
                let Ok(entries) = parse_inv(&payload) else {
                    return;
                };
                for entry in entries {
                    if let Some(body) = bodies.get(&entry.hash) {
                        if !write_frame(&mut stream, magic, "block", body).await {
                            return;
                        }
                    }
                }
            }
            _ => {}
        }
    }
}
