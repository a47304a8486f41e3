use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// A connection id may be reused for this long after the connect exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Retransmission schedule: timeout `15 * 2^n` seconds, abandoning after
/// this many tries.
const MAX_TRANSMITS: u32 = 8;
const BASE_TIMEOUT_SECS: u64 = 15;

/// A UDP tracker client (BEP-15).
///
/// The protocol is two round trips: a connect exchange yielding a 64-bit
/// connection id, then a 98-byte announce. Responses echo the caller's
/// random transaction id.
pub struct UdpTracker {
    socket: UdpSocket,
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    /// Resolves `udp://host:port[/...]` and binds a local socket.
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let authority = url
            .strip_prefix("udp://")
            .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
        let authority = authority.split('/').next().unwrap_or(authority);

        let addr: SocketAddr = tokio::net::lookup_host(authority)
            .await
            .map_err(|_| TrackerError::InvalidUrl(url.to_string()))?
            .next()
            .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        Ok(Self {
            socket,
            connection: None,
        })
    }

    pub async fn announce(
        &mut self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(req.info_hash.as_bytes());
        packet.extend_from_slice(req.peer_id.as_bytes());
        packet.extend_from_slice(&req.downloaded.to_be_bytes());
        packet.extend_from_slice(&req.left.to_be_bytes());
        packet.extend_from_slice(&req.uploaded.to_be_bytes());
        packet.extend_from_slice(&req.event.as_udp_id().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // IP: let the tracker use the source
        packet.extend_from_slice(&key.to_be_bytes());
        packet.extend_from_slice(&(req.numwant as i32).to_be_bytes());
        packet.extend_from_slice(&req.port.to_be_bytes());

        let response = self.exchange(&packet, 20).await?;

        let action = read_u32(&response, 0);
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&response[8..]).to_string();
            return Err(TrackerError::Rejected(message));
        }
        if action != ACTION_ANNOUNCE || read_u32(&response, 4) != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "announce response mismatch".into(),
            ));
        }

        let mut result = AnnounceResponse::new(read_u32(&response, 8));
        result.leechers = Some(read_u32(&response, 12));
        result.seeders = Some(read_u32(&response, 16));
        result.peers = parse_compact_peers(&response[20..]);

        Ok(result)
    }

    /// Returns a live connection id, performing the connect exchange if the
    /// cached one has aged past its 60-second validity.
    async fn connection_id(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, obtained_at)) = self.connection {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self.exchange(&packet, 16).await?;

        if read_u32(&response, 0) != ACTION_CONNECT || read_u32(&response, 4) != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "connect response mismatch".into(),
            ));
        }

        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&response[8..16]);
        let id = u64::from_be_bytes(id_bytes);

        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    /// Sends a request and waits for a response, retransmitting on the
    /// doubling BEP-15 schedule.
    async fn exchange(
        &self,
        request: &[u8],
        min_response_size: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; 4096];

        for attempt in 0..MAX_TRANSMITS {
            self.socket.send(request).await?;

            let window = Duration::from_secs(BASE_TIMEOUT_SECS << attempt);
            match timeout(window, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= min_response_size => return Ok(buf[..n].to_vec()),
                Ok(Ok(_)) => {
                    return Err(TrackerError::InvalidResponse("response too short".into()))
                }
                Ok(Err(e)) => return Err(TrackerError::Io(e)),
                Err(_) => continue,
            }
        }

        Err(TrackerError::Timeout)
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
