//! Tracker protocols: HTTP(S) announce (BEP-3) and UDP announce (BEP-15),
//! behind a BEP-12 tiered tracker set.
//!
//! Trackers seed the peer set and nothing else; peer-to-peer transfer never
//! touches them again except for periodic re-announces and the lifecycle
//! events `started`, `completed`, and `stopped`.

mod error;
mod http;
mod response;
mod set;
mod udp;

pub use error::TrackerError;
pub use http::HttpTracker;
pub use response::{parse_compact_peers, AnnounceRequest, AnnounceResponse, TrackerEvent};
pub use set::TrackerSet;
pub use udp::UdpTracker;
