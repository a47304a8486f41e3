//! Peer wire protocol (BEP-3)
//!
//! Handshake and message framing, plus the per-connection task that pumps a
//! socket: inbound messages become typed events for the scheduler, and the
//! scheduler drives the socket through a bounded command outbox. Peer tasks
//! never touch piece state directly.

mod bitfield;
mod error;
mod message;
mod peer_id;
mod task;
mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use message::{Handshake, Message, HANDSHAKE_LEN, MAX_FRAME_LEN};
pub use peer_id::PeerId;
pub use task::{spawn_peer, PeerCommand, PeerEvent, PeerGoneReason, PeerSpawnArgs};
pub use transport::PeerTransport;
