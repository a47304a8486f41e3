//! spate - a BitTorrent client
//!
//! Given a `.torrent` file and a destination directory, spate locates peers
//! via trackers, speaks the peer wire protocol with many peers concurrently,
//! downloads and verifies every piece, and materializes the file tree on
//! disk. Downloads are resumable: on startup the on-disk files are re-hashed
//! and verified pieces are never requested again.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`metainfo`] - Torrent metainfo parsing and validation
//! - [`storage`] - Piece-to-file mapping, disk I/O, resume scanning
//! - [`piece`] - Per-piece block bookkeeping and hash verification
//! - [`peer`] - BEP-3 peer wire protocol and per-connection tasks
//! - [`tracker`] - BEP-3 HTTP and BEP-15 UDP tracker protocols, BEP-12 tiers
//! - [`scheduler`] - Rarest-first piece selection and request pipelining
//! - [`swarm`] - Peer set lifecycle: dial, accept, cap, replace
//! - [`session`] - One torrent download from start to finish

pub mod bencode;
pub mod config;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod tracker;

pub use bencode::{decode, BencodeError, Value};
pub use config::Config;
pub use metainfo::{FileEntry, InfoHash, Metainfo, MetainfoError};
pub use peer::{Bitfield, Handshake, Message, PeerError, PeerId};
pub use piece::{PieceState, PieceStatus, BLOCK_SIZE};
pub use session::{Session, SessionError};
pub use storage::{FileStore, StorageError};
pub use tracker::{AnnounceResponse, TrackerError, TrackerEvent, TrackerSet};
