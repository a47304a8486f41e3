//! Per-piece block bookkeeping and hash verification.
//!
//! Every [`PieceState`] is owned exclusively by the scheduler; peer tasks
//! deliver blocks as messages and never touch this state. A piece's blocks
//! always partition into three disjoint sets: `pending` (not yet asked
//! for), `requested` (asked of exactly one peer), and `received`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

/// Fixed transfer unit on the wire (16 KiB); the last block of a piece may
/// be shorter.
pub const BLOCK_SIZE: u32 = 16384;

/// A requested block not delivered within this window goes back to
/// `pending` and the holding peer takes a strike.
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Download status of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// No blocks received; nothing buffered.
    Missing,
    /// At least one block requested or received.
    InFlight,
    /// Hash verified and handed to storage.
    Complete,
}

/// Outcome of checking a fully-received piece against its metainfo hash.
#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Hash matched; the buffer is ready for storage.
    Complete(Vec<u8>),
    /// Hash mismatched; blocks reset to pending, these peers contributed.
    Corrupt(Vec<SocketAddr>),
    /// Not all blocks received yet.
    Incomplete,
}

/// Mutable download state of a single piece.
pub struct PieceState {
    index: u32,
    length: u32,
    status: PieceStatus,
    pending: BTreeSet<u32>,
    requested: HashMap<u32, (SocketAddr, Instant)>,
    received: BTreeSet<u32>,
    /// Allocated on the first request, released on write-through or
    /// corruption rollback.
    buffer: Option<Vec<u8>>,
    contributors: HashSet<SocketAddr>,
}

impl PieceState {
    /// Creates the state for piece `index` of `length` bytes, all blocks
    /// pending.
    pub fn new(index: u32, length: u32) -> Self {
        let pending = (0..length).step_by(BLOCK_SIZE as usize).collect();
        Self {
            index,
            length,
            status: PieceStatus::Missing,
            pending,
            requested: HashMap::new(),
            received: BTreeSet::new(),
            buffer: None,
            contributors: HashSet::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn status(&self) -> PieceStatus {
        self.status
    }

    /// Length of the block starting at `offset`; only the final block may
    /// fall short of [`BLOCK_SIZE`].
    pub fn block_len(&self, offset: u32) -> u32 {
        (self.length - offset).min(BLOCK_SIZE)
    }

    pub fn block_count(&self) -> usize {
        self.length.div_ceil(BLOCK_SIZE) as usize
    }

    /// `true` while any block is still pending.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Takes the next pending block for `peer`, moving it to `requested`.
    ///
    /// Allocates the piece buffer on first use. Returns `(offset, length)`.
    pub fn next_block(&mut self, peer: SocketAddr, now: Instant) -> Option<(u32, u32)> {
        let offset = *self.pending.iter().next()?;
        self.pending.remove(&offset);
        self.requested.insert(offset, (peer, now));
        self.status = PieceStatus::InFlight;

        if self.buffer.is_none() {
            self.buffer = Some(vec![0u8; self.length as usize]);
        }

        Some((offset, self.block_len(offset)))
    }

    /// Accepts a delivered block.
    ///
    /// Only blocks currently in `requested` with an exact-length payload are
    /// taken; anything else is ignored (a cancel race or a confused peer)
    /// and reported to the caller with `false`.
    pub fn deliver(&mut self, peer: SocketAddr, offset: u32, data: &[u8]) -> bool {
        match self.requested.get(&offset) {
            Some(_) if data.len() as u32 == self.block_len(offset) => {}
            _ => return false,
        }

        self.requested.remove(&offset);
        self.received.insert(offset);
        self.contributors.insert(peer);

        if let Some(buffer) = self.buffer.as_mut() {
            buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }

        true
    }

    /// Checks the piece once every block is in.
    ///
    /// On a hash match the buffer is moved out for storage and the piece
    /// becomes `Complete`. On a mismatch every block returns to `pending`,
    /// the buffer is freed, and the peers that contributed are returned for
    /// blame.
    pub fn verify(&mut self, expected: &[u8; 20]) -> VerifyOutcome {
        if self.received.len() != self.block_count() {
            return VerifyOutcome::Incomplete;
        }

        let buffer = self.buffer.take().unwrap_or_default();

        let mut hasher = Sha1::new();
        hasher.update(&buffer);
        let got: [u8; 20] = hasher.finalize().into();

        if got == *expected {
            self.status = PieceStatus::Complete;
            self.pending.clear();
            self.received.clear();
            VerifyOutcome::Complete(buffer)
        } else {
            let blamed: Vec<SocketAddr> = self.contributors.drain().collect();
            self.reset();
            VerifyOutcome::Corrupt(blamed)
        }
    }

    /// Returns every block held by `peer` to `pending` (choke or
    /// disconnect).
    pub fn release_peer(&mut self, peer: SocketAddr) {
        let offsets: Vec<u32> = self
            .requested
            .iter()
            .filter(|(_, (holder, _))| *holder == peer)
            .map(|(&offset, _)| offset)
            .collect();

        for offset in offsets {
            self.requested.remove(&offset);
            self.pending.insert(offset);
        }

        if self.requested.is_empty() && self.received.is_empty() {
            self.reset();
        }
    }

    /// Returns blocks requested longer than `timeout` ago to `pending`,
    /// yielding each released `(offset, peer)` pair.
    pub fn release_timed_out(
        &mut self,
        timeout: Duration,
        now: Instant,
    ) -> Vec<(u32, SocketAddr)> {
        let expired: Vec<(u32, SocketAddr)> = self
            .requested
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= timeout)
            .map(|(&offset, (peer, _))| (offset, *peer))
            .collect();

        for (offset, _) in &expired {
            self.requested.remove(offset);
            self.pending.insert(*offset);
        }
        expired
    }

    /// `true` if `peer` currently holds a request on this piece.
    pub fn requested_by(&self, peer: SocketAddr) -> bool {
        self.requested.values().any(|(holder, _)| *holder == peer)
    }

    fn reset(&mut self) {
        self.pending = (0..self.length).step_by(BLOCK_SIZE as usize).collect();
        self.requested.clear();
        self.received.clear();
        self.buffer = None;
        self.contributors.clear();
        self.status = PieceStatus::Missing;
    }

    /// The partition invariant: every block is in exactly one of the three
    /// sets.
    #[cfg(test)]
    fn partition_holds(&self) -> bool {
        let mut seen = BTreeSet::new();
        for &offset in &self.pending {
            seen.insert(offset);
        }
        for &offset in self.requested.keys() {
            if !seen.insert(offset) {
                return false;
            }
        }
        for &offset in &self.received {
            if !seen.insert(offset) {
                return false;
            }
        }
        self.status == PieceStatus::Complete || seen.len() == self.block_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn test_block_partitioning() {
        let piece = PieceState::new(0, BLOCK_SIZE * 2 + 100);
        assert_eq!(piece.block_count(), 3);
        assert_eq!(piece.block_len(0), BLOCK_SIZE);
        assert_eq!(piece.block_len(BLOCK_SIZE * 2), 100);
        assert!(piece.partition_holds());
    }

    #[test]
    fn test_single_block_piece() {
        let mut piece = PieceState::new(0, 5);
        assert_eq!(piece.block_count(), 1);

        let (offset, length) = piece.next_block(addr(1), Instant::now()).unwrap();
        assert_eq!((offset, length), (0, 5));
        assert!(piece.next_block(addr(2), Instant::now()).is_none());

        assert!(piece.deliver(addr(1), 0, b"hello"));
        match piece.verify(&sha1(b"hello")) {
            VerifyOutcome::Complete(data) => assert_eq!(data, b"hello"),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(piece.status(), PieceStatus::Complete);
    }

    #[test]
    fn test_blocks_move_through_sets() {
        let mut piece = PieceState::new(0, BLOCK_SIZE * 2);
        let now = Instant::now();

        let (first, _) = piece.next_block(addr(1), now).unwrap();
        assert!(piece.partition_holds());

        let payload = vec![0xAB; BLOCK_SIZE as usize];
        assert!(piece.deliver(addr(1), first, &payload));
        assert!(piece.partition_holds());

        assert_eq!(piece.verify(&[0u8; 20]), VerifyOutcome::Incomplete);
    }

    #[test]
    fn test_deliver_rejects_unrequested_and_wrong_length() {
        let mut piece = PieceState::new(0, BLOCK_SIZE * 2);
        let now = Instant::now();

        // Nothing requested yet: dropped.
        assert!(!piece.deliver(addr(1), 0, &vec![0; BLOCK_SIZE as usize]));

        let (offset, _) = piece.next_block(addr(1), now).unwrap();
        // Wrong length: dropped, request stays live.
        assert!(!piece.deliver(addr(1), offset, b"short"));
        assert!(piece.requested_by(addr(1)));
        assert!(piece.partition_holds());
    }

    #[test]
    fn test_corrupt_piece_resets_and_blames() {
        let mut piece = PieceState::new(0, 10);
        let now = Instant::now();

        let (offset, _) = piece.next_block(addr(9), now).unwrap();
        assert!(piece.deliver(addr(9), offset, b"0123456789"));

        match piece.verify(&sha1(b"different!")) {
            VerifyOutcome::Corrupt(blamed) => assert_eq!(blamed, vec![addr(9)]),
            other => panic!("expected corruption, got {:?}", other),
        }

        // Rolled all the way back: missing, no buffer, all pending again.
        assert_eq!(piece.status(), PieceStatus::Missing);
        assert!(piece.has_pending());
        assert!(piece.partition_holds());
    }

    #[test]
    fn test_release_peer_requeues_blocks() {
        let mut piece = PieceState::new(0, BLOCK_SIZE * 3);
        let now = Instant::now();

        piece.next_block(addr(1), now).unwrap();
        piece.next_block(addr(1), now).unwrap();
        piece.next_block(addr(2), now).unwrap();

        piece.release_peer(addr(1));
        assert!(!piece.requested_by(addr(1)));
        assert!(piece.requested_by(addr(2)));
        assert_eq!(piece.pending.len(), 2);
        assert!(piece.partition_holds());
    }

    #[test]
    fn test_release_timed_out() {
        let mut piece = PieceState::new(0, BLOCK_SIZE * 2);
        let start = Instant::now();

        piece.next_block(addr(1), start).unwrap();
        let later = start + BLOCK_TIMEOUT + Duration::from_secs(1);
        piece.next_block(addr(2), later).unwrap();

        let slow = piece.release_timed_out(BLOCK_TIMEOUT, later);
        assert_eq!(slow, vec![(0, addr(1))]);
        assert!(piece.requested_by(addr(2)));
        assert!(piece.partition_holds());
    }

    #[test]
    fn test_block_requested_by_one_peer_at_a_time() {
        let mut piece = PieceState::new(0, BLOCK_SIZE * 2);
        let now = Instant::now();

        let (a, _) = piece.next_block(addr(1), now).unwrap();
        let (b, _) = piece.next_block(addr(2), now).unwrap();
        assert_ne!(a, b);
        assert!(piece.next_block(addr(3), now).is_none());
    }
}
