use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// Lifecycle event attached to an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Periodic re-announce.
    None,
    /// First contact this session.
    Started,
    /// Graceful shutdown.
    Stopped,
    /// Sent exactly once, when the last piece verifies.
    Completed,
}

impl TrackerEvent {
    /// Query-string form; empty for periodic announces.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    /// BEP-15 numeric event code.
    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// One announce, protocol-independent.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    /// How many peers to ask for; trackers may return fewer.
    pub numwant: u32,
}

/// A successful announce: when to come back, and who to talk to.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next periodic re-announce.
    pub interval: u32,
    /// Hard floor on the re-announce interval, if the tracker sets one.
    pub min_interval: Option<u32>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            min_interval: None,
            seeders: None,
            leechers: None,
            peers: Vec::new(),
        }
    }

    /// The effective wait before the next announce, honoring `min interval`.
    pub fn reannounce_secs(&self) -> u32 {
        self.interval.max(self.min_interval.unwrap_or(0))
    }
}

/// Parses BEP-23 compact form: 6 bytes per peer, IPv4 then port, both
/// big-endian. Trailing partial entries are ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}
