//! Torrent metainfo parsing and validation (BEP-3)
//!
//! A `.torrent` file is a bencoded dictionary. Everything downstream of this
//! module works with strongly-typed fields; schema validation happens here,
//! once, and invalid torrents never construct a [`Metainfo`].

mod error;
mod info_hash;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use torrent::{FileEntry, Metainfo};
