//! Piece selection and request scheduling.
//!
//! One task owns every [`PieceState`], the completed bitmap, the
//! availability vector, and a handle per peer. Peer tasks feed it typed
//! events; it answers with commands into each peer's bounded outbox. All
//! selection logic is synchronous; only disk work leaves the loop, on
//! spawned writer tasks that report back as messages.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;
use tokio::sync::{mpsc, watch};

use crate::metainfo::Metainfo;
use crate::peer::{Bitfield, PeerCommand, PeerEvent};
use crate::piece::{PieceState, PieceStatus, VerifyOutcome, BLOCK_TIMEOUT};
use crate::storage::{FileStore, StorageError};

/// Most requests allowed in flight to a single peer.
pub const MAX_PIPELINE: usize = 5;

/// Block timeouts before a peer is disconnected.
const MAX_STRIKES: u8 = 3;
/// Hash-failure blames before a peer is disconnected.
const MAX_CORRUPTIONS: u8 = 2;
/// Consecutive write failures on one piece before the session aborts.
const MAX_IO_FAILURES: u8 = 3;
/// Below this many completed pieces, selection is random instead of
/// rarest-first to avoid head-of-torrent hotspots.
const RANDOM_PICK_THRESHOLD: usize = 4;

/// Transfer counters shared with the tracker announce loop.
#[derive(Debug, Default)]
pub struct TransferStats {
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    pub left: AtomicU64,
}

impl TransferStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.uploaded.load(Ordering::Relaxed),
            self.downloaded.load(Ordering::Relaxed),
            self.left.load(Ordering::Relaxed),
        )
    }
}

/// Everything the scheduler loop consumes.
#[derive(Debug)]
pub enum SchedulerMsg {
    Peer(PeerEvent),
    /// A spawned writer finished flushing a verified piece.
    WriteDone {
        index: u32,
        result: Result<(), StorageError>,
    },
}

struct PeerHandle {
    commands: mpsc::Sender<PeerCommand>,
    bitfield: Bitfield,
    peer_choking: bool,
    peer_interested: bool,
    am_interested: bool,
    am_choking: bool,
    outstanding: Vec<(u32, u32)>,
    strikes: u8,
    corruptions: u8,
}

impl PeerHandle {
    fn new(commands: mpsc::Sender<PeerCommand>, piece_count: usize) -> Self {
        Self {
            commands,
            bitfield: Bitfield::new(piece_count),
            peer_choking: true,
            peer_interested: false,
            am_interested: false,
            am_choking: true,
            outstanding: Vec::new(),
            strikes: 0,
            corruptions: 0,
        }
    }
}

pub struct Scheduler {
    meta: Arc<Metainfo>,
    store: Arc<FileStore>,
    completed: Bitfield,
    availability: Vec<u32>,
    /// Pieces currently in flight or awaiting their write-through.
    pieces: HashMap<u32, PieceState>,
    peers: HashMap<SocketAddr, PeerHandle>,
    io_failures: HashMap<u32, u8>,
    stats: Arc<TransferStats>,
    msg_rx: mpsc::Receiver<SchedulerMsg>,
    /// Cloned into writer tasks so results come back through the loop.
    msg_tx: mpsc::Sender<SchedulerMsg>,
    /// Snapshot of our completed set for newly-spawned peer tasks.
    bitfield_tx: watch::Sender<Bitfield>,
    /// Flips to `true` exactly once, when the last piece lands on disk.
    done_tx: watch::Sender<bool>,
    fatal_tx: mpsc::Sender<StorageError>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta: Arc<Metainfo>,
        store: Arc<FileStore>,
        resumed: Bitfield,
        stats: Arc<TransferStats>,
        msg_rx: mpsc::Receiver<SchedulerMsg>,
        msg_tx: mpsc::Sender<SchedulerMsg>,
        bitfield_tx: watch::Sender<Bitfield>,
        done_tx: watch::Sender<bool>,
        fatal_tx: mpsc::Sender<StorageError>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let piece_count = meta.piece_count();

        let left: u64 = (0..piece_count as u32)
            .filter(|&i| !resumed.has(i as usize))
            .map(|i| meta.piece_len(i))
            .sum();
        stats.left.store(left, Ordering::Relaxed);

        let _ = bitfield_tx.send(resumed.clone());
        if resumed.is_complete() {
            let _ = done_tx.send(true);
        }

        Self {
            meta,
            store,
            completed: resumed,
            availability: vec![0; piece_count],
            pieces: HashMap::new(),
            peers: HashMap::new(),
            io_failures: HashMap::new(),
            stats,
            msg_rx,
            msg_tx,
            bitfield_tx,
            done_tx,
            fatal_tx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => break,

                msg = self.msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        SchedulerMsg::Peer(event) => self.on_peer_event(event),
                        SchedulerMsg::WriteDone { index, result } => {
                            self.on_write_done(index, result);
                        }
                    }
                }

                _ = tick.tick() => self.on_tick(),
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, peer_id, commands } => {
                tracing::debug!(%addr, ?peer_id, "peer connected");
                self.peers
                    .insert(addr, PeerHandle::new(commands, self.meta.piece_count()));
            }

            PeerEvent::Bitfield { addr, bits } => {
                let Some(handle) = self.peers.get_mut(&addr) else { return };
                for i in 0..bits.len() {
                    if bits.has(i) {
                        self.availability[i] += 1;
                    }
                }
                handle.bitfield = bits;
                self.update_interest(addr);
                self.fill_pipeline(addr);
            }

            PeerEvent::Have { addr, piece } => {
                let Some(handle) = self.peers.get_mut(&addr) else { return };
                if !handle.bitfield.has(piece as usize) {
                    handle.bitfield.set(piece as usize);
                    self.availability[piece as usize] += 1;
                }
                self.update_interest(addr);
                self.fill_pipeline(addr);
            }

            PeerEvent::Choked { addr } => {
                let Some(handle) = self.peers.get_mut(&addr) else { return };
                handle.peer_choking = true;
                // Outstanding requests are implicitly cancelled; their
                // blocks go back to pending for someone else.
                handle.outstanding.clear();
                for piece in self.pieces.values_mut() {
                    piece.release_peer(addr);
                }
            }

            PeerEvent::Unchoked { addr } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.peer_choking = false;
                }
                self.fill_pipeline(addr);
            }

            PeerEvent::Interest { addr, interested } => {
                self.on_peer_interest(addr, interested);
            }

            PeerEvent::Block { addr, index, begin, data } => {
                self.on_block(addr, index, begin, &data);
            }

            PeerEvent::BlockRequest { addr, index, begin, length } => {
                self.on_block_request(addr, index, begin, length);
            }

            PeerEvent::Gone { addr, reason } => {
                tracing::debug!(%addr, ?reason, "peer gone");
                self.drop_peer(addr);
            }
        }
    }

    /// Simple serve policy: unchoke whoever declares interest, choke them
    /// again when they lose it.
    fn on_peer_interest(&mut self, addr: SocketAddr, interested: bool) {
        let Some(handle) = self.peers.get_mut(&addr) else { return };
        handle.peer_interested = interested;

        if interested && handle.am_choking {
            handle.am_choking = false;
            let _ = handle.commands.try_send(PeerCommand::Unchoke);
        } else if !interested && !handle.am_choking {
            handle.am_choking = true;
            let _ = handle.commands.try_send(PeerCommand::Choke);
        }
    }

    fn on_block(&mut self, addr: SocketAddr, index: u32, begin: u32, data: &[u8]) {
        let Some(handle) = self.peers.get_mut(&addr) else { return };
        let had_request = handle
            .outstanding
            .iter()
            .position(|&(i, b)| i == index && b == begin);

        // No matching outstanding request: a cancel race, drop silently.
        let Some(position) = had_request else { return };
        handle.outstanding.swap_remove(position);

        let Some(piece) = self.pieces.get_mut(&index) else { return };
        if !piece.deliver(addr, begin, data) {
            return;
        }

        self.stats
            .downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        match piece.verify(&self.meta.pieces[index as usize]) {
            VerifyOutcome::Incomplete => {}
            VerifyOutcome::Complete(buffer) => {
                let store = self.store.clone();
                let tx = self.msg_tx.clone();
                tokio::spawn(async move {
                    let result = store.write_piece(index, &buffer).await;
                    let _ = tx.send(SchedulerMsg::WriteDone { index, result }).await;
                });
            }
            VerifyOutcome::Corrupt(blamed) => {
                tracing::warn!(piece = index, peers = blamed.len(), "piece failed hash check");
                self.pieces.remove(&index);
                for peer in blamed {
                    if let Some(handle) = self.peers.get_mut(&peer) {
                        handle.corruptions += 1;
                        if handle.corruptions >= MAX_CORRUPTIONS {
                            self.disconnect_peer(peer);
                        }
                    }
                }
            }
        }

        self.fill_pipeline(addr);
    }

    /// Serves a block from a completed piece to an unchoked peer.
    ///
    /// Range validation already happened at the wire (out-of-range requests
    /// close the connection before reaching here).
    fn on_block_request(&mut self, addr: SocketAddr, index: u32, begin: u32, length: u32) {
        let Some(handle) = self.peers.get(&addr) else { return };

        if handle.am_choking || !self.completed.has(index as usize) {
            return;
        }

        let store = self.store.clone();
        let commands = handle.commands.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            if let Ok(data) = store.read_block(index, begin, length).await {
                stats.uploaded.fetch_add(data.len() as u64, Ordering::Relaxed);
                let _ = commands.send(PeerCommand::Piece { index, begin, data }).await;
            }
        });
    }

    fn on_write_done(&mut self, index: u32, result: Result<(), StorageError>) {
        self.pieces.remove(&index);

        match result {
            Ok(()) => {
                self.io_failures.remove(&index);
                self.completed.set(index as usize);
                self.stats
                    .left
                    .fetch_sub(self.meta.piece_len(index), Ordering::Relaxed);
                let _ = self.bitfield_tx.send(self.completed.clone());

                tracing::info!(
                    piece = index,
                    have = self.completed.count_ones(),
                    total = self.meta.piece_count(),
                    "piece complete"
                );

                self.broadcast_have(index);
                for addr in self.peer_addrs() {
                    self.update_interest(addr);
                }

                if self.completed.is_complete() {
                    tracing::info!("download complete");
                    let _ = self.done_tx.send(true);
                }
            }
            Err(e) => {
                tracing::warn!(piece = index, error = %e, "piece write failed");
                let failures = self.io_failures.entry(index).or_insert(0);
                *failures += 1;
                if *failures >= MAX_IO_FAILURES {
                    let _ = self.fatal_tx.try_send(e);
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let mut struck: Vec<SocketAddr> = Vec::new();

        for piece in self.pieces.values_mut() {
            for (offset, peer) in piece.release_timed_out(BLOCK_TIMEOUT, now) {
                if let Some(handle) = self.peers.get_mut(&peer) {
                    handle
                        .outstanding
                        .retain(|&(i, b)| !(i == piece.index() && b == offset));
                    handle.strikes += 1;
                    tracing::debug!(%peer, piece = piece.index(), offset, "block timed out");
                    if handle.strikes >= MAX_STRIKES {
                        struck.push(peer);
                    }
                }
            }
        }

        for peer in struck {
            self.disconnect_peer(peer);
        }

        for addr in self.peer_addrs() {
            self.fill_pipeline(addr);
        }
    }

    /// Tops a peer's pipeline up to [`MAX_PIPELINE`] outstanding requests.
    ///
    /// Blocks come first from in-flight pieces the peer has (finish what is
    /// started, bound buffered memory), then from a fresh piece chosen
    /// rarest-first.
    fn fill_pipeline(&mut self, addr: SocketAddr) {
        let now = Instant::now();

        loop {
            let Some(handle) = self.peers.get(&addr) else { return };
            if handle.peer_choking
                || !handle.am_interested
                || handle.outstanding.len() >= MAX_PIPELINE
            {
                return;
            }

            let block = self.next_block_for(addr, now);
            let Some((index, begin, length)) = block else { return };

            let Some(handle) = self.peers.get_mut(&addr) else { return };
            match handle.commands.try_send(PeerCommand::Request {
                index,
                begin,
                length,
            }) {
                Ok(()) => handle.outstanding.push((index, begin)),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // A stalled outbox means a stalled peer.
                    if let Some(piece) = self.pieces.get_mut(&index) {
                        piece.release_peer(addr);
                    }
                    self.disconnect_peer(addr);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if let Some(piece) = self.pieces.get_mut(&index) {
                        piece.release_peer(addr);
                    }
                    return;
                }
            }
        }
    }

    fn next_block_for(&mut self, addr: SocketAddr, now: Instant) -> Option<(u32, u32, u32)> {
        let Some(handle) = self.peers.get(&addr) else { return None };

        // In-flight pieces this peer can help finish, lowest index first.
        let mut in_flight: Vec<u32> = self
            .pieces
            .values()
            .filter(|p| {
                p.status() != PieceStatus::Complete
                    && p.has_pending()
                    && handle.bitfield.has(p.index() as usize)
            })
            .map(|p| p.index())
            .collect();
        in_flight.sort_unstable();

        if let Some(&index) = in_flight.first() {
            let piece = self.pieces.get_mut(&index)?;
            let (begin, length) = piece.next_block(addr, now)?;
            return Some((index, begin, length));
        }

        // Start a fresh piece.
        let index = self.select_piece(addr)?;
        let piece = self
            .pieces
            .entry(index)
            .or_insert_with(|| PieceState::new(index, self.meta.piece_len(index) as u32));
        let (begin, length) = piece.next_block(addr, now)?;
        Some((index, begin, length))
    }

    /// Rarest-first selection among pieces this peer has and we lack,
    /// ties to the lower index. Random during startup instead, so early
    /// peers don't all hammer the head of the torrent.
    fn select_piece(&self, addr: SocketAddr) -> Option<u32> {
        let handle = self.peers.get(&addr)?;

        let candidates = (0..self.meta.piece_count() as u32).filter(|&i| {
            !self.completed.has(i as usize)
                && !self.pieces.contains_key(&i)
                && handle.bitfield.has(i as usize)
        });

        if self.completed.count_ones() < RANDOM_PICK_THRESHOLD {
            candidates.choose(&mut rand::rng())
        } else {
            candidates.min_by_key(|&i| (self.availability[i as usize], i))
        }
    }

    /// Interested iff the peer has at least one piece we are missing; sent
    /// only on transitions.
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(handle) = self.peers.get_mut(&addr) else { return };

        let want = (0..self.meta.piece_count())
            .any(|i| handle.bitfield.has(i) && !self.completed.has(i));

        if want != handle.am_interested {
            handle.am_interested = want;
            let command = if want {
                PeerCommand::Interested
            } else {
                PeerCommand::NotInterested
            };
            if handle.commands.try_send(command).is_err() {
                handle.am_interested = !want;
            }
        }
    }

    /// Announces a fresh piece to every active peer, including those whose
    /// bitfield already shows it.
    fn broadcast_have(&mut self, index: u32) {
        let mut stalled: Vec<SocketAddr> = Vec::new();

        for (&addr, handle) in self.peers.iter_mut() {
            match handle.commands.try_send(PeerCommand::Have { piece: index }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => stalled.push(addr),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        for addr in stalled {
            self.disconnect_peer(addr);
        }
    }

    /// Removes a peer at our initiative: strikes, corruption, or stall.
    fn disconnect_peer(&mut self, addr: SocketAddr) {
        if let Some(handle) = self.peers.get(&addr) {
            let _ = handle.commands.try_send(PeerCommand::Close);
        }
        self.drop_peer(addr);
    }

    /// Cleans up after a peer: availability, outstanding blocks, handle.
    fn drop_peer(&mut self, addr: SocketAddr) {
        let Some(handle) = self.peers.remove(&addr) else { return };

        for i in 0..handle.bitfield.len() {
            if handle.bitfield.has(i) {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }

        for piece in self.pieces.values_mut() {
            piece.release_peer(addr);
        }
    }

    fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::metainfo::{FileEntry, InfoHash};

    // Two blocks per piece.
    const PIECE_LEN: u64 = 32768;

    struct Harness {
        scheduler: Scheduler,
        _dir: tempfile::TempDir,
    }

    /// A scheduler over an 8-piece torrent with `resumed_count` pieces
    /// already complete.
    fn harness(resumed_count: usize) -> Harness {
        let piece_count = 8usize;
        let meta = Arc::new(Metainfo {
            info_hash: InfoHash([0u8; 20]),
            name: "fixture.bin".to_string(),
            piece_length: PIECE_LEN,
            pieces: vec![[0u8; 20]; piece_count],
            files: vec![FileEntry {
                path: PathBuf::from("fixture.bin"),
                length: PIECE_LEN * piece_count as u64,
                offset: 0,
            }],
            total_length: PIECE_LEN * piece_count as u64,
            announce: None,
            announce_list: Vec::new(),
        });

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().to_path_buf(), meta.clone()).unwrap());

        let mut resumed = Bitfield::new(piece_count);
        for i in 0..resumed_count {
            resumed.set(i);
        }

        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (bitfield_tx, _) = watch::channel(resumed.clone());
        let (done_tx, _) = watch::channel(false);
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            meta,
            store,
            resumed,
            Arc::new(TransferStats::default()),
            msg_rx,
            msg_tx,
            bitfield_tx,
            done_tx,
            fatal_tx,
            shutdown_rx,
        );

        Harness {
            scheduler,
            _dir: dir,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Connects a peer with the given pieces and returns its command
    /// receiver.
    fn connect_peer(
        scheduler: &mut Scheduler,
        peer: SocketAddr,
        pieces: &[usize],
    ) -> mpsc::Receiver<PeerCommand> {
        let (tx, rx) = mpsc::channel(16);
        scheduler.on_peer_event(PeerEvent::Connected {
            addr: peer,
            peer_id: crate::peer::PeerId::generate(),
            commands: tx,
        });

        let mut bits = Bitfield::new(scheduler.meta.piece_count());
        for &i in pieces {
            bits.set(i);
        }
        scheduler.on_peer_event(PeerEvent::Bitfield { addr: peer, bits });
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<PeerCommand>) -> Vec<PeerCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn test_availability_tracks_bitfields_and_haves() {
        let mut h = harness(0);
        let _rx1 = connect_peer(&mut h.scheduler, addr(1), &[4, 5]);
        let _rx2 = connect_peer(&mut h.scheduler, addr(2), &[5]);

        assert_eq!(h.scheduler.availability[4], 1);
        assert_eq!(h.scheduler.availability[5], 2);

        h.scheduler.on_peer_event(PeerEvent::Have {
            addr: addr(2),
            piece: 4,
        });
        assert_eq!(h.scheduler.availability[4], 2);

        h.scheduler
            .on_peer_event(PeerEvent::Gone { addr: addr(1), reason: crate::peer::PeerGoneReason::Io });
        assert_eq!(h.scheduler.availability[4], 1);
        assert_eq!(h.scheduler.availability[5], 1);
    }

    #[test]
    fn test_rarest_first_selection() {
        // 4 pieces complete, so startup randomness is off.
        let mut h = harness(4);
        let _rx1 = connect_peer(&mut h.scheduler, addr(1), &[4, 5, 6]);
        let _rx2 = connect_peer(&mut h.scheduler, addr(2), &[5, 6]);
        let _rx3 = connect_peer(&mut h.scheduler, addr(3), &[6]);

        // Piece 4 is rarest (one holder): peer 1 must start there.
        assert_eq!(h.scheduler.select_piece(addr(1)), Some(4));
        // Peer 2 lacks 4; of 5 and 6, piece 5 is rarer.
        assert_eq!(h.scheduler.select_piece(addr(2)), Some(5));
        // Peer 3 only has the most common piece.
        assert_eq!(h.scheduler.select_piece(addr(3)), Some(6));
    }

    #[test]
    fn test_rarest_first_tie_breaks_to_lower_index() {
        let mut h = harness(4);
        let _rx = connect_peer(&mut h.scheduler, addr(1), &[5, 6, 7]);
        assert_eq!(h.scheduler.select_piece(addr(1)), Some(5));
    }

    #[test]
    fn test_startup_pick_is_among_candidates() {
        let mut h = harness(0);
        let _rx = connect_peer(&mut h.scheduler, addr(1), &[2, 6]);

        for _ in 0..20 {
            let picked = h.scheduler.select_piece(addr(1)).unwrap();
            assert!(picked == 2 || picked == 6);
        }
    }

    #[test]
    fn test_completed_pieces_are_not_selected() {
        let mut h = harness(4);
        let _rx = connect_peer(&mut h.scheduler, addr(1), &[0, 1, 2, 3]);
        assert_eq!(h.scheduler.select_piece(addr(1)), None);
    }

    #[test]
    fn test_pipeline_caps_at_five_requests() {
        let mut h = harness(4);
        let mut rx = connect_peer(&mut h.scheduler, addr(1), &[4, 5, 6, 7]);

        h.scheduler.on_peer_event(PeerEvent::Unchoked { addr: addr(1) });

        let outstanding = &h.scheduler.peers[&addr(1)].outstanding;
        assert_eq!(outstanding.len(), MAX_PIPELINE);

        let commands = drain(&mut rx);
        let requests = commands
            .iter()
            .filter(|c| matches!(c, PeerCommand::Request { .. }))
            .count();
        assert_eq!(requests, MAX_PIPELINE);
        // Interest was declared before any request.
        assert!(matches!(commands[0], PeerCommand::Interested));
    }

    #[test]
    fn test_no_requests_while_choking_or_uninterested() {
        let mut h = harness(4);
        let mut rx = connect_peer(&mut h.scheduler, addr(1), &[4]);

        // Still choked: interest declared, nothing requested.
        let commands = drain(&mut rx);
        assert!(commands
            .iter()
            .all(|c| !matches!(c, PeerCommand::Request { .. })));
    }

    #[test]
    fn test_choke_returns_outstanding_blocks_to_pending() {
        let mut h = harness(4);
        let mut rx = connect_peer(&mut h.scheduler, addr(1), &[4]);

        h.scheduler.on_peer_event(PeerEvent::Unchoked { addr: addr(1) });
        // Both blocks of the only piece this peer has are outstanding.
        assert_eq!(h.scheduler.peers[&addr(1)].outstanding.len(), 2);
        drain(&mut rx);

        h.scheduler.on_peer_event(PeerEvent::Choked { addr: addr(1) });
        assert!(h.scheduler.peers[&addr(1)].outstanding.is_empty());
        // No re-request goes out while the peer is choking us.
        assert!(drain(&mut rx).is_empty());

        // The piece's only block is pending again.
        assert!(h.scheduler.pieces[&4].has_pending());
    }

    #[test]
    fn test_interested_peer_gets_unchoked() {
        let mut h = harness(4);
        let mut rx = connect_peer(&mut h.scheduler, addr(1), &[]);

        h.scheduler.on_peer_event(PeerEvent::Interest {
            addr: addr(1),
            interested: true,
        });
        assert!(drain(&mut rx)
            .iter()
            .any(|c| matches!(c, PeerCommand::Unchoke)));

        h.scheduler.on_peer_event(PeerEvent::Interest {
            addr: addr(1),
            interested: false,
        });
        assert!(drain(&mut rx)
            .iter()
            .any(|c| matches!(c, PeerCommand::Choke)));
    }
}
