use std::net::SocketAddr;
use std::time::Duration;

use reqwest::Client;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};
use crate::bencode::decode;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// An HTTP(S) tracker client (BEP-3).
///
/// Announces are GET requests with the info hash and peer id
/// percent-encoded as raw binary; the response is a bencoded dictionary.
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(TrackerError::Http)?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn announce(&self, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            self.url,
            req.info_hash.url_encode(),
            url_encode(req.peer_id.as_bytes()),
            req.port,
            req.uploaded,
            req.downloaded,
            req.left,
            req.numwant,
        );

        let event = req.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        let response = self.client.get(&url).send().await?;
        let bytes = response.bytes().await?;

        parse_announce_body(&bytes)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn parse_announce_body(bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(bytes)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::InvalidResponse("expected dict".into()))?;

    if let Some(failure) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Rejected(failure.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_integer())
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))? as u32;

    let mut response = AnnounceResponse::new(interval);

    response.min_interval = dict
        .get(b"min interval".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.seeders = dict
        .get(b"complete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.leechers = dict
        .get(b"incomplete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    if let Some(peers) = dict.get(b"peers".as_slice()) {
        if let Some(bytes) = peers.as_bytes() {
            // Compact form: 6 bytes per peer.
            response.peers = parse_compact_peers(bytes);
        } else if let Some(list) = peers.as_list() {
            // Dictionary form: one dict per peer with ip and port.
            for peer in list {
                let ip = peer
                    .get(b"ip")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok());
                let port = peer
                    .get(b"port")
                    .and_then(|v| v.as_integer())
                    .map(|p| p as u16);

                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(SocketAddr::new(ip, port));
                }
            }
        }
    }

    Ok(response)
}

fn url_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(60), |mut s, &b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            s.push(b as char);
        } else {
            use std::fmt::Write;
            let _ = write!(s, "%{:02X}", b);
        }
        s
    })
}
