use std::path::PathBuf;

use crate::bencode::{decode, info_slice, Value};

use super::error::MetainfoError;
use super::info_hash::InfoHash;

/// A parsed, validated torrent file.
///
/// Immutable after load; shared read-only by every other component.
///
/// # Examples
///
/// ```no_run
/// use spate::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let meta = Metainfo::load("example.torrent")?;
/// println!("{}: {} bytes in {} pieces", meta.name, meta.total_length, meta.piece_count());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the verbatim bencoded `info` dictionary.
    pub info_hash: InfoHash,
    /// Suggested name for the file (single-file) or root directory.
    pub name: String,
    /// Number of bytes per piece; the last piece may be shorter.
    pub piece_length: u64,
    /// SHA-1 hash of each piece.
    pub pieces: Vec<[u8; 20]>,
    /// Files in torrent order. Single-file torrents hold one entry.
    pub files: Vec<FileEntry>,
    /// Total size of all files combined.
    pub total_length: u64,
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Multi-tier tracker list (BEP-12).
    pub announce_list: Vec<Vec<String>>,
}

/// A file within a torrent.
///
/// Paths are relative; multi-file torrents root them under the torrent
/// name. `offset` is the file's position in the concatenated piece space.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl Metainfo {
    /// Reads and parses a `.torrent` file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, MetainfoError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parses a torrent from raw bytes.
    ///
    /// The info hash is computed over the exact `info` sub-slice of `data`,
    /// never over a re-encoding.
    ///
    /// # Errors
    ///
    /// Rejects torrents with a missing `info` dictionary, a non-positive
    /// piece length, a `pieces` string whose length is not a multiple of 20,
    /// an empty name, any file of non-positive length, a file list whose
    /// total is inconsistent with the piece count, or file paths that are
    /// empty, absolute, or contain `..`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let raw_info = info_slice(data).ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = InfoHash::from_info_bytes(raw_info);

        let info = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;

        let name = info
            .get(b"name")
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();
        if name.is_empty() {
            return Err(MetainfoError::InvalidField("name"));
        }
        validate_segment(&name)?;

        let piece_length = info
            .get(b"piece length")
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("piece length"))?;
        if piece_length <= 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = info
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }

        let pieces: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect();

        let (files, total_length) = parse_files(info, &name)?;

        let piece_count = pieces.len() as u64;
        let expected = total_length.div_ceil(piece_length);
        if piece_count != expected {
            return Err(MetainfoError::InvalidField("pieces"));
        }

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let announce_list = dict
            .get(b"announce-list".as_slice())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect::<Vec<_>>()
                        })
                    })
                    .filter(|tier: &Vec<String>| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            total_length,
            announce,
            announce_list,
        })
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Logical length of piece `index`; the last piece absorbs the
    /// remainder.
    pub fn piece_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length)
    }

    /// Tracker tiers: `announce-list` when present, else a single tier with
    /// the primary `announce` URL.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        match &self.announce {
            Some(url) => vec![vec![url.clone()]],
            None => Vec::new(),
        }
    }

    /// `true` if this torrent carries multiple files.
    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
            || self
                .files
                .first()
                .is_some_and(|f| f.path.components().count() > 1)
    }
}

fn parse_files(info: &Value, name: &str) -> Result<(Vec<FileEntry>, u64), MetainfoError> {
    if let Some(length) = info.get(b"length").and_then(|v| v.as_integer()) {
        if length <= 0 {
            return Err(MetainfoError::InvalidField("length"));
        }
        let length = length as u64;
        let file = FileEntry {
            path: PathBuf::from(name),
            length,
            offset: 0,
        };
        return Ok((vec![file], length));
    }

    let files_list = info
        .get(b"files")
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length or files"))?;
    if files_list.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    let mut files = Vec::with_capacity(files_list.len());
    let mut offset = 0u64;

    for entry in files_list {
        let length = entry
            .get(b"length")
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("file length"))?;
        if length <= 0 {
            return Err(MetainfoError::InvalidField("file length"));
        }

        let segments = entry
            .get(b"path")
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("file path"))?;
        if segments.is_empty() {
            return Err(MetainfoError::InvalidField("file path"));
        }

        let mut path = PathBuf::from(name);
        for segment in segments {
            let segment = segment
                .as_str()
                .ok_or(MetainfoError::InvalidField("file path"))?;
            validate_segment(segment)?;
            path.push(segment);
        }

        files.push(FileEntry {
            path,
            length: length as u64,
            offset,
        });
        offset += length as u64;
    }

    Ok((files, offset))
}

/// Rejects path segments that could escape the destination directory.
fn validate_segment(segment: &str) -> Result<(), MetainfoError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0')
    {
        return Err(MetainfoError::InvalidPath(segment.to_string()));
    }
    Ok(())
}
