//! One outbound peer session: dial, handshake, then a framed full-duplex
//! connection split into a read half (owned by the session task) and a
//! write half shared through `PeerHandle`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};

use crate::p2p::{
    build_frame, build_version_payload, parse_frame_header, parse_version, verify_checksum,
    FRAME_HEADER_SIZE,
};

pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    addr: SocketAddr,
    remote_version: i32,
    remote_user_agent: String,
    remote_height: i32,
}

impl Peer {
    pub async fn connect(
        addr: SocketAddr,
        magic: [u8; 4],
        dial_timeout: Duration,
    ) -> Result<Self, String> {
        let stream = match timeout(dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(err.to_string()),
            Err(_) => return Err("dial timed out".to_string()),
        };
        Ok(Self {
            stream,
            magic,
            addr,
            remote_version: 0,
            remote_user_agent: String::new(),
            remote_height: -1,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_version(&self) -> i32 {
        self.remote_version
    }

    pub fn remote_user_agent(&self) -> &str {
        &self.remote_user_agent
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height
    }

    async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), String> {
        let frame = build_frame(self.magic, command, payload).map_err(|err| err.to_string())?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|err| err.to_string())
    }

    async fn read_message(&mut self) -> Result<(String, Vec<u8>), String> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| err.to_string())?;
        let frame = parse_frame_header(self.magic, &header).map_err(|err| err.to_string())?;
        let mut payload = vec![0u8; frame.length];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        verify_checksum(frame.checksum, &payload).map_err(|err| err.to_string())?;
        Ok((frame.command, payload))
    }

    /// Version exchange: send ours, collect the remote `version` (answered
    /// with `verack`) and the remote `verack`. Pings are answered; anything
    /// else during the handshake is tolerated and dropped.
    pub async fn handshake(&mut self, start_height: i32) -> Result<(), String> {
        let payload = build_version_payload(start_height, rand::random());
        self.send_message("version", &payload).await?;

        let mut got_verack = false;
        let mut got_version = false;
        while !(got_verack && got_version) {
            let (command, payload) = self.read_message().await?;
            match command.as_str() {
                "version" => {
                    got_version = true;
                    self.send_message("verack", &[]).await?;
                    if let Ok(info) = parse_version(&payload) {
                        self.remote_version = info.version;
                        self.remote_user_agent = info.user_agent;
                        self.remote_height = info.start_height;
                    }
                }
                "verack" => {
                    got_verack = true;
                }
                "ping" => {
                    self.send_message("pong", &payload).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Splits into the session's read half and the shared write handle.
    pub fn split(self) -> (PeerReader, Arc<PeerHandle>) {
        let (read, write) = self.stream.into_split();
        let handle = Arc::new(PeerHandle {
            addr: self.addr,
            magic: self.magic,
            write: Mutex::new(write),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        let reader = PeerReader {
            read,
            magic: self.magic,
        };
        (reader, handle)
    }
}

pub struct PeerReader {
    read: OwnedReadHalf,
    magic: [u8; 4],
}

impl PeerReader {
    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), String> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.read
            .read_exact(&mut header)
            .await
            .map_err(|err| err.to_string())?;
        let frame = parse_frame_header(self.magic, &header).map_err(|err| err.to_string())?;
        let mut payload = vec![0u8; frame.length];
        self.read
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        verify_checksum(frame.checksum, &payload).map_err(|err| err.to_string())?;
        Ok((frame.command, payload))
    }
}

/// The capability the façade holds per Ready session: write a message,
/// request close, report the address. Writes are serialised by the
/// internal mutex so any task may enqueue one.
pub struct PeerHandle {
    addr: SocketAddr,
    magic: [u8; 4],
    write: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl PeerHandle {
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub async fn write(&self, command: &str, payload: &[u8]) -> Result<(), String> {
        if self.is_closed() {
            return Err("peer closed".to_string());
        }
        let frame = build_frame(self.magic, command, payload).map_err(|err| err.to_string())?;
        let mut write = self.write.lock().await;
        write
            .write_all(&frame)
            .await
            .map_err(|err| err.to_string())
    }

    /// Marks the session for close and wakes its read loop. Idempotent,
    /// never blocks.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }
}
