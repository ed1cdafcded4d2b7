//! In-memory cache of outstanding block downloads: which peer owes us
//! which block, and until when.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use btcidx_primitives::Hash256;

/// Scheduler signals. None of these are fatal; callers try again on the
/// next tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleError {
    CacheFull,
    NoPeers,
    AlreadyCached,
    ExpiredPeer,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::CacheFull => write!(f, "cache full"),
            ScheduleError::NoPeers => write!(f, "no peers"),
            ScheduleError::AlreadyCached => write!(f, "already cached"),
            ScheduleError::ExpiredPeer => write!(f, "expired peer"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BlockRequest {
    pub peer: SocketAddr,
    pub expires_at: Instant,
}

pub struct PendingBlocks {
    max: usize,
    ttl: Duration,
    requests: HashMap<Hash256, BlockRequest>,
}

impl PendingBlocks {
    pub fn new(max: usize, ttl: Duration) -> Self {
        Self {
            max,
            ttl,
            requests: HashMap::with_capacity(max),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.requests.contains_key(hash)
    }

    /// Free cache slots.
    pub fn want(&self) -> usize {
        self.max.saturating_sub(self.requests.len())
    }

    /// Requests currently owned by `peer`.
    pub fn per_peer(&self, peer: SocketAddr) -> usize {
        self.requests
            .values()
            .filter(|request| request.peer == peer)
            .count()
    }

    pub fn add(
        &mut self,
        hash: Hash256,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<(), ScheduleError> {
        if self.requests.len() >= self.max {
            return Err(ScheduleError::CacheFull);
        }
        if self.requests.contains_key(&hash) {
            return Err(ScheduleError::AlreadyCached);
        }
        self.requests.insert(
            hash,
            BlockRequest {
                peer,
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<BlockRequest> {
        self.requests.remove(hash)
    }

    /// Drops every request past its deadline and returns them; the owning
    /// peers are deemed slow and get closed by the caller.
    pub fn expire(&mut self, now: Instant) -> Vec<(Hash256, SocketAddr)> {
        let expired: Vec<Hash256> = self
            .requests
            .iter()
            .filter(|(_, request)| now > request.expires_at)
            .map(|(hash, _)| *hash)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for hash in expired {
            if let Some(request) = self.requests.remove(&hash) {
                out.push((hash, request.peer));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("192.0.2.{last}:8333").parse().expect("addr")
    }

    fn hash(byte: u8) -> Hash256 {
        [byte; 32]
    }

    #[test]
    fn cache_is_bounded() {
        let now = Instant::now();
        let mut pending = PendingBlocks::new(2, Duration::from_secs(37));
        pending.add(hash(1), addr(1), now).expect("add");
        pending.add(hash(2), addr(1), now).expect("add");
        assert_eq!(
            pending.add(hash(3), addr(1), now),
            Err(ScheduleError::CacheFull)
        );
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.want(), 0);
    }

    #[test]
    fn duplicate_request_rejected() {
        let now = Instant::now();
        let mut pending = PendingBlocks::new(8, Duration::from_secs(37));
        pending.add(hash(1), addr(1), now).expect("add");
        assert_eq!(
            pending.add(hash(1), addr(2), now),
            Err(ScheduleError::AlreadyCached)
        );
    }

    #[test]
    fn expiry_evicts_and_reports_slow_peer() {
        let now = Instant::now();
        let ttl = Duration::from_millis(100);
        let mut pending = PendingBlocks::new(4, ttl);
        for i in 0..4 {
            pending.add(hash(i), addr(1), now).expect("add");
        }

        // Nothing expires before the deadline.
        assert!(pending.expire(now + Duration::from_millis(50)).is_empty());

        let expired = pending.expire(now + Duration::from_millis(150));
        assert_eq!(expired.len(), 4);
        assert!(expired.iter().all(|(_, peer)| *peer == addr(1)));
        assert!(pending.is_empty());

        // The freed slots can be reassigned to a healthier peer.
        let later = now + Duration::from_millis(150);
        for i in 0..4 {
            pending.add(hash(i), addr(2), later).expect("reassign");
        }
        assert_eq!(pending.per_peer(addr(2)), 4);
        assert_eq!(pending.per_peer(addr(1)), 0);
    }

    #[test]
    fn remove_returns_owner() {
        let now = Instant::now();
        let mut pending = PendingBlocks::new(4, Duration::from_secs(37));
        pending.add(hash(9), addr(3), now).expect("add");
        let request = pending.remove(&hash(9)).expect("present");
        assert_eq!(request.peer, addr(3));
        assert!(pending.remove(&hash(9)).is_none());
    }
}
