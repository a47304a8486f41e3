//! Session configuration.
//!
//! Built once at startup (normally from CLI flags) and passed into each
//! component's constructor; nothing reads process-wide state.

use std::path::PathBuf;

/// Knobs for one download session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the file tree is materialized.
    pub dest_dir: PathBuf,
    /// Preferred listen port; binding falls through the next eight ports
    /// when taken.
    pub listen_port: u16,
    /// Cap on simultaneous peer connections.
    pub max_peers: usize,
    /// Peers to request per announce.
    pub numwant: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::from("."),
            listen_port: 6881,
            max_peers: 50,
            numwant: 50,
        }
    }
}
