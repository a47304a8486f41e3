use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::transport::{FrameReader, FrameWriter, PeerTransport};
use crate::metainfo::Metainfo;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Bound on each peer's command outbox. The scheduler uses `try_send`; a
/// full outbox means the peer has stalled and gets disconnected instead of
/// blocking the scheduler.
pub const OUTBOX_CAPACITY: usize = 16;

/// Why a peer connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerGoneReason {
    /// Socket error or clean close.
    Io,
    /// The peer broke a protocol rule.
    Violation,
    /// Two minutes without any inbound message.
    Idle,
    /// We closed it: strikes, corruption blame, stalled outbox, shutdown.
    Closed,
}

/// Typed messages from a peer task to the scheduler.
///
/// Peers never mutate shared state; every observation flows through this
/// channel and the scheduler applies it.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake finished; `commands` is the scheduler's handle to this peer.
    Connected {
        addr: SocketAddr,
        peer_id: PeerId,
        commands: mpsc::Sender<PeerCommand>,
    },
    /// The peer's opening bitfield.
    Bitfield { addr: SocketAddr, bits: Bitfield },
    /// The peer acquired one piece.
    Have { addr: SocketAddr, piece: u32 },
    /// The peer choked us; all outstanding requests are implicitly dead.
    Choked { addr: SocketAddr },
    /// The peer unchoked us; requests may be issued.
    Unchoked { addr: SocketAddr },
    /// The peer's interest in our data changed.
    Interest { addr: SocketAddr, interested: bool },
    /// A block payload arrived.
    Block {
        addr: SocketAddr,
        index: u32,
        begin: u32,
        data: Bytes,
    },
    /// The peer asked us for a block.
    BlockRequest {
        addr: SocketAddr,
        index: u32,
        begin: u32,
        length: u32,
    },
    /// The connection is gone; outstanding blocks must be rescheduled.
    Gone {
        addr: SocketAddr,
        reason: PeerGoneReason,
    },
}

/// Commands the scheduler sends into a peer's outbox.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    Request { index: u32, begin: u32, length: u32 },
    Cancel { index: u32, begin: u32, length: u32 },
    Have { piece: u32 },
    Interested,
    NotInterested,
    Choke,
    Unchoke,
    Piece { index: u32, begin: u32, data: Bytes },
    Close,
}

/// Everything a connection task needs besides the socket.
#[derive(Clone)]
pub struct PeerSpawnArgs {
    /// Shared torrent descriptor: info hash for the handshake, piece
    /// geometry for validating inbound indices and ranges.
    pub meta: Arc<Metainfo>,
    pub our_id: PeerId,
    /// Snapshot of our completed set at spawn time; sent right after the
    /// handshake when non-empty.
    pub our_bitfield: Bitfield,
    pub events: mpsc::Sender<PeerEvent>,
    /// Tells the swarm supervisor this slot is free again.
    pub closed: mpsc::Sender<SocketAddr>,
    pub shutdown: watch::Receiver<bool>,
}

/// Spawns the task owning one peer connection.
///
/// `stream` is `Some` for inbound connections already accepted by the
/// listener; `None` dials `addr`. The task handles the handshake, then pumps
/// the socket until error, violation, idleness, or a `Close` command.
pub fn spawn_peer(
    addr: SocketAddr,
    stream: Option<TcpStream>,
    args: PeerSpawnArgs,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closed = args.closed.clone();
        run_connection(addr, stream, args).await;
        let _ = closed.send(addr).await;
    })
}

async fn run_connection(addr: SocketAddr, stream: Option<TcpStream>, args: PeerSpawnArgs) {
    let inbound = stream.is_some();

    let (reader, writer, their_id) = match establish(addr, stream, &args).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::debug!(%addr, inbound, error = %e, "handshake failed");
            return;
        }
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(OUTBOX_CAPACITY);
    if args
        .events
        .send(PeerEvent::Connected {
            addr,
            peer_id: their_id,
            commands: cmd_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let reason = pump(addr, reader, writer, cmd_rx, &args).await;
    tracing::debug!(%addr, ?reason, "peer disconnected");
    let _ = args.events.send(PeerEvent::Gone { addr, reason }).await;
}

async fn establish(
    addr: SocketAddr,
    stream: Option<TcpStream>,
    args: &PeerSpawnArgs,
) -> Result<(FrameReader, FrameWriter, PeerId), PeerError> {
    let info_hash = *args.meta.info_hash.as_bytes();
    let ours = Handshake::new(info_hash, *args.our_id.as_bytes());

    let theirs;
    let mut transport;

    match stream {
        // Inbound: the peer speaks first.
        Some(stream) => {
            transport = PeerTransport::new(stream);
            theirs = transport.receive_handshake().await?;
            if theirs.info_hash != info_hash {
                return Err(PeerError::InfoHashMismatch);
            }
            transport.send_handshake(&ours).await?;
        }
        // Outbound: we dial and speak first.
        None => {
            let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| PeerError::Timeout)??;
            transport = PeerTransport::new(stream);
            transport.send_handshake(&ours).await?;
            theirs = transport.receive_handshake().await?;
            if theirs.info_hash != info_hash {
                return Err(PeerError::InfoHashMismatch);
            }
        }
    }

    let (reader, mut writer) = transport.into_split();

    if !args.our_bitfield.is_empty() {
        writer
            .send_message(&Message::Bitfield(args.our_bitfield.to_bytes()))
            .await?;
    }

    Ok((reader, writer, PeerId::from_bytes(theirs.peer_id)))
}

async fn pump(
    addr: SocketAddr,
    mut reader: FrameReader,
    mut writer: FrameWriter,
    mut cmd_rx: mpsc::Receiver<PeerCommand>,
    args: &PeerSpawnArgs,
) -> PeerGoneReason {
    let mut shutdown = args.shutdown.clone();
    let mut saw_first_message = false;
    let mut last_write = Instant::now();
    let mut keepalive = tokio::time::interval(Duration::from_secs(30));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                return PeerGoneReason::Closed;
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    return PeerGoneReason::Closed;
                };
                if matches!(cmd, PeerCommand::Close) {
                    return PeerGoneReason::Closed;
                }
                let message = command_message(cmd);
                if writer.send_message(&message).await.is_err() {
                    return PeerGoneReason::Io;
                }
                last_write = Instant::now();
            }

            result = reader.receive_message() => {
                let message = match result {
                    Ok(message) => message,
                    Err(PeerError::Timeout) => return PeerGoneReason::Idle,
                    Err(PeerError::InvalidMessage(_)) => return PeerGoneReason::Violation,
                    Err(_) => return PeerGoneReason::Io,
                };

                let first = !std::mem::replace(&mut saw_first_message, true);
                match handle_message(addr, message, first, args).await {
                    Ok(()) => {}
                    Err(reason) => return reason,
                }
            }

            _ = keepalive.tick() => {
                if last_write.elapsed() >= KEEPALIVE_INTERVAL {
                    if writer.send_message(&Message::KeepAlive).await.is_err() {
                        return PeerGoneReason::Io;
                    }
                    last_write = Instant::now();
                }
            }
        }
    }
}

/// Validates one inbound message and forwards it as an event.
///
/// Errors here are protocol violations; the connection closes.
async fn handle_message(
    addr: SocketAddr,
    message: Message,
    first: bool,
    args: &PeerSpawnArgs,
) -> Result<(), PeerGoneReason> {
    let piece_count = args.meta.piece_count();

    let event = match message {
        Message::KeepAlive => return Ok(()),
        Message::Choke => PeerEvent::Choked { addr },
        Message::Unchoke => PeerEvent::Unchoked { addr },
        Message::Interested => PeerEvent::Interest {
            addr,
            interested: true,
        },
        Message::NotInterested => PeerEvent::Interest {
            addr,
            interested: false,
        },
        Message::Have { piece } => {
            if piece as usize >= piece_count {
                return Err(PeerGoneReason::Violation);
            }
            PeerEvent::Have { addr, piece }
        }
        Message::Bitfield(bytes) => {
            // Only legal as the very first message after the handshake.
            if !first {
                return Err(PeerGoneReason::Violation);
            }
            let Some(bits) = Bitfield::from_message_bytes(&bytes, piece_count) else {
                return Err(PeerGoneReason::Violation);
            };
            PeerEvent::Bitfield { addr, bits }
        }
        Message::Piece { index, begin, data } => {
            if index as usize >= piece_count {
                return Err(PeerGoneReason::Violation);
            }
            PeerEvent::Block {
                addr,
                index,
                begin,
                data,
            }
        }
        Message::Request {
            index,
            begin,
            length,
        } => {
            // Out-of-range indices and block ranges are violations, same
            // as oversized requests.
            if index as usize >= piece_count
                || length > 128 * 1024
                || begin as u64 + length as u64 > args.meta.piece_len(index)
            {
                return Err(PeerGoneReason::Violation);
            }
            PeerEvent::BlockRequest {
                addr,
                index,
                begin,
                length,
            }
        }
        // We never queue uploads, so there is nothing to withdraw.
        Message::Cancel { .. } => return Ok(()),
    };

    args.events
        .send(event)
        .await
        .map_err(|_| PeerGoneReason::Closed)
}

fn command_message(cmd: PeerCommand) -> Message {
    match cmd {
        PeerCommand::Request {
            index,
            begin,
            length,
        } => Message::Request {
            index,
            begin,
            length,
        },
        PeerCommand::Cancel {
            index,
            begin,
            length,
        } => Message::Cancel {
            index,
            begin,
            length,
        },
        PeerCommand::Have { piece } => Message::Have { piece },
        PeerCommand::Interested => Message::Interested,
        PeerCommand::NotInterested => Message::NotInterested,
        PeerCommand::Choke => Message::Choke,
        PeerCommand::Unchoke => Message::Unchoke,
        PeerCommand::Piece { index, begin, data } => Message::Piece { index, begin, data },
        // Close never reaches here.
        PeerCommand::Close => Message::KeepAlive,
    }
}
