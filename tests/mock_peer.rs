//! Test doubles for download scenarios: a wire-level mock peer and a
//! canned HTTP tracker.
//!
//! The mock peer speaks raw bytes rather than reusing the crate's message
//! types, so framing bugs cannot cancel out between encoder and decoder.

// Also compiled standalone as its own test target, where nothing is used.
#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A torrent plus the content it describes, for building test swarms.
pub struct Fixture {
    pub torrent_bytes: Vec<u8>,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    /// The bencoded info dictionary, verbatim.
    pub info: Vec<u8>,
    /// Content split per piece.
    pub pieces: Vec<Vec<u8>>,
    /// `(relative path under the torrent name, content)` per file.
    pub files: Vec<(String, Vec<u8>)>,
}

impl Fixture {
    /// Single-file torrent over `content`.
    pub fn single_file(name: &str, content: &[u8], piece_length: u64, announce: &str) -> Self {
        let info = format!(
            "d6:lengthi{}e4:name{}:{}12:piece lengthi{}e6:pieces",
            content.len(),
            name.len(),
            name,
            piece_length,
        );
        Self::build(info, content, &[(name.to_string(), content.len() as u64)], piece_length, announce, name)
    }

    /// Multi-file torrent; file paths are single segments under `name`.
    pub fn multi_file(
        name: &str,
        files: &[(&str, &[u8])],
        piece_length: u64,
        announce: &str,
    ) -> Self {
        let mut info = String::from("d5:filesl");
        for (path, content) in files {
            info.push_str(&format!(
                "d6:lengthi{}e4:pathl{}:{}ee",
                content.len(),
                path.len(),
                path
            ));
        }
        info.push_str(&format!(
            "e4:name{}:{}12:piece lengthi{}e6:pieces",
            name.len(),
            name,
            piece_length
        ));

        let content: Vec<u8> = files.iter().flat_map(|(_, c)| c.iter().copied()).collect();
        let file_list: Vec<(String, u64)> = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.len() as u64))
            .collect();
        Self::build(info, &content, &file_list, piece_length, announce, name)
    }

    fn build(
        info_prefix: String,
        content: &[u8],
        files: &[(String, u64)],
        piece_length: u64,
        announce: &str,
        _name: &str,
    ) -> Self {
        let pieces: Vec<Vec<u8>> = content
            .chunks(piece_length as usize)
            .map(|c| c.to_vec())
            .collect();

        let mut info = info_prefix.into_bytes();
        info.extend_from_slice(format!("{}:", pieces.len() * 20).as_bytes());
        for piece in &pieces {
            info.extend_from_slice(&sha1(piece));
        }
        info.push(b'e');

        let info_hash = sha1(&info);

        let mut torrent_bytes =
            format!("d8:announce{}:{}4:info", announce.len(), announce).into_bytes();
        torrent_bytes.extend_from_slice(&info);
        torrent_bytes.push(b'e');

        Self {
            torrent_bytes,
            info_hash,
            piece_length,
            info,
            pieces,
            files: files
                .iter()
                .scan(0usize, |offset, (path, length)| {
                    let start = *offset;
                    *offset += *length as usize;
                    Some((path.clone(), content[start..*offset].to_vec()))
                })
                .collect(),
        }
    }

    /// Rebuilds the torrent with an `announce-list`; the first URL of the
    /// first tier doubles as the primary `announce`.
    pub fn torrent_with_tiers(&self, tiers: &[Vec<String>]) -> Vec<u8> {
        let primary = &tiers[0][0];

        let mut out = format!("d8:announce{}:{}13:announce-listl", primary.len(), primary)
            .into_bytes();
        for tier in tiers {
            out.push(b'l');
            for url in tier {
                out.extend_from_slice(format!("{}:{}", url.len(), url).as_bytes());
            }
            out.push(b'e');
        }
        out.extend_from_slice(b"e4:info");
        out.extend_from_slice(&self.info);
        out.push(b'e');
        out
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

/// What the mock peer does beyond serving honestly.
#[derive(Clone, Default)]
pub struct MockPeerBehavior {
    /// Serve these pieces corrupted until a full round of their blocks has
    /// been sent once, then serve them correctly.
    pub corrupt_once: HashSet<u32>,
    /// Send `choke` after serving this many blocks, then `unchoke` again
    /// after a short pause.
    pub choke_after_blocks: Option<usize>,
}

/// One observed `request` message.
#[derive(Debug, Clone, Copy)]
pub struct SeenRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
    /// Whether the mock had already choked the requester when this arrived.
    pub while_choked: bool,
}

/// A wire-level BitTorrent peer seeding fixture content from memory.
pub struct MockPeer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<SeenRequest>>>,
}

impl MockPeer {
    /// Starts a seeder with every piece of `fixture`, accepting any number
    /// of connections.
    pub async fn start(fixture: &Fixture, behavior: MockPeerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let info_hash = fixture.info_hash;
        let pieces = Arc::new(fixture.pieces.clone());
        let seen = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let pieces = pieces.clone();
                let seen = seen.clone();
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, info_hash, pieces, behavior, seen).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn requests_while_choked(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.while_choked)
            .count()
    }

    pub fn requested_piece_indices(&self) -> HashSet<u32> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.index)
            .collect()
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    pieces: Arc<Vec<Vec<u8>>>,
    mut behavior: MockPeerBehavior,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
) -> std::io::Result<()> {
    // Handshake: 19, protocol, reserved, info_hash, peer_id.
    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).await?;
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    assert_eq!(&handshake[28..48], &info_hash);

    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(b"-MK0001-abcdefghijkl");
    stream.write_all(&reply).await?;

    // Full bitfield.
    let byte_count = pieces.len().div_ceil(8);
    let mut bits = vec![0xFFu8; byte_count];
    let spare = byte_count * 8 - pieces.len();
    if spare > 0 {
        bits[byte_count - 1] = 0xFFu8 << spare;
    }
    let mut frame = (1 + byte_count as u32).to_be_bytes().to_vec();
    frame.push(5);
    frame.extend_from_slice(&bits);
    stream.write_all(&frame).await?;

    let mut choked_them = true;
    let mut served_blocks = 0usize;
    // Tracks how much of a corrupt round has been sent, per piece.
    let mut corrupt_progress: std::collections::HashMap<u32, usize> =
        std::collections::HashMap::new();
    // (index, begin) pairs requested at least once; a repeat during a choke
    // window is a client that failed to cancel.
    let mut ever_requested: HashSet<(u32, u32)> = HashSet::new();

    loop {
        let payload = read_frame(&mut stream).await?;
        if payload.is_empty() {
            continue; // keep-alive
        }

        match payload[0] {
            // interested: grant transfer permission
            2 => {
                if choked_them {
                    choked_them = false;
                    stream.write_all(&[0, 0, 0, 1, 1]).await?;
                }
            }
            // request
            6 => {
                let index = u32::from_be_bytes(payload[1..5].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[5..9].try_into().unwrap());
                let req_len = u32::from_be_bytes(payload[9..13].try_into().unwrap());

                ever_requested.insert((index, begin));
                seen.lock().unwrap().push(SeenRequest {
                    index,
                    begin,
                    length: req_len,
                    while_choked: false,
                });

                let piece = &pieces[index as usize];
                let mut block = piece[begin as usize..(begin + req_len) as usize].to_vec();

                if behavior.corrupt_once.contains(&index) {
                    block[0] ^= 0xFF;
                    let sent = corrupt_progress.entry(index).or_insert(0);
                    *sent += block.len();
                    if *sent >= piece.len() {
                        // One full bad round done; be honest from now on.
                        behavior.corrupt_once.remove(&index);
                    }
                }

                let mut frame = (9 + block.len() as u32).to_be_bytes().to_vec();
                frame.push(7);
                frame.extend_from_slice(&index.to_be_bytes());
                frame.extend_from_slice(&begin.to_be_bytes());
                frame.extend_from_slice(&block);
                stream.write_all(&frame).await?;

                served_blocks += 1;
                if behavior.choke_after_blocks == Some(served_blocks) {
                    choke_window(&mut stream, &ever_requested, &seen).await?;
                }
            }
            // everything else is irrelevant to the mock
            _ => {}
        }
    }
}

/// Chokes the client, watches what it sends for a while, then unchokes.
///
/// Requests already issued before the choke may still be in flight; only a
/// repeat of an already-seen block counts as a failure to cancel.
async fn choke_window(
    stream: &mut TcpStream,
    ever_requested: &HashSet<(u32, u32)>,
    seen: &Arc<Mutex<Vec<SeenRequest>>>,
) -> std::io::Result<()> {
    stream.write_all(&[0, 0, 0, 1, 0]).await?; // choke

    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    loop {
        let payload = match tokio::time::timeout_at(deadline, read_frame(stream)).await {
            Err(_) => break, // window over
            Ok(result) => result?,
        };

        if payload.first() == Some(&6) {
            let index = u32::from_be_bytes(payload[1..5].try_into().unwrap());
            let begin = u32::from_be_bytes(payload[5..9].try_into().unwrap());
            let req_len = u32::from_be_bytes(payload[9..13].try_into().unwrap());
            seen.lock().unwrap().push(SeenRequest {
                index,
                begin,
                length: req_len,
                while_choked: ever_requested.contains(&(index, begin)),
            });
        }
    }

    stream.write_all(&[0, 0, 0, 1, 1]).await?; // unchoke
    Ok(())
}

/// Reads one length-prefixed frame; empty payload means keep-alive.
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// A canned HTTP tracker recording every announce event it sees.
///
/// Started before the fixture exists (the announce URL goes into the
/// torrent), so the peer list is set afterwards.
pub struct MockTracker {
    pub url: String,
    pub events: Arc<Mutex<Vec<String>>>,
    peers: Arc<Mutex<Vec<SocketAddr>>>,
}

impl MockTracker {
    /// Serves the configured peers (compact form) with a long interval.
    /// When `reject` is set, every announce fails with `failure reason`.
    pub async fn start(reject: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let peers: Arc<Mutex<Vec<SocketAddr>>> = Arc::new(Mutex::new(Vec::new()));

        let seen = events.clone();
        let peer_list = peers.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };

                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();

                let event = request
                    .split_once("GET ")
                    .and_then(|(_, rest)| rest.split_once(' '))
                    .map(|(path, _)| path)
                    .and_then(|path| {
                        path.split('&')
                            .find_map(|kv| kv.strip_prefix("event="))
                            .map(String::from)
                    })
                    .unwrap_or_else(|| "periodic".to_string());
                seen.lock().unwrap().push(event);

                let body = if reject {
                    b"d14:failure reason12:unauthorizede".to_vec()
                } else {
                    let mut compact = Vec::new();
                    for peer in peer_list.lock().unwrap().iter() {
                        if let SocketAddr::V4(v4) = peer {
                            compact.extend_from_slice(&v4.ip().octets());
                            compact.extend_from_slice(&v4.port().to_be_bytes());
                        }
                    }
                    let mut body =
                        format!("d8:intervali1800e5:peers{}:", compact.len()).into_bytes();
                    body.extend_from_slice(&compact);
                    body.push(b'e');
                    body
                };

                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&body).await;
            }
        });

        Self { url, events, peers }
    }

    pub fn set_peers(&self, peers: Vec<SocketAddr>) {
        *self.peers.lock().unwrap() = peers;
    }

    pub fn saw_event(&self, name: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == name)
    }

    pub fn count_event(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == name).count()
    }
}
