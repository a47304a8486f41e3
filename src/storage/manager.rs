use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::error::StorageError;
use super::file::{FileHandleCache, PieceFileSpan};
use crate::metainfo::Metainfo;
use crate::peer::Bitfield;

const DEFAULT_HANDLE_CAPACITY: usize = 64;

/// Maps pieces onto the destination file tree and performs all disk I/O.
///
/// Owns every file handle; other components hand piece buffers to the store
/// and never touch files directly.
pub struct FileStore {
    meta: Arc<Metainfo>,
    handle_cache: FileHandleCache,
}

impl FileStore {
    /// Creates a store rooted at `base_path`.
    ///
    /// File paths are re-validated here even though the metainfo parser
    /// rejects traversal at load time; the store refuses to touch anything
    /// outside `base_path`.
    pub fn new(base_path: PathBuf, meta: Arc<Metainfo>) -> Result<Self, StorageError> {
        for file in &meta.files {
            validate_file_path(&file.path)?;
        }

        let files = Arc::new(meta.files.clone());
        let handle_cache = FileHandleCache::new(base_path, files, DEFAULT_HANDLE_CAPACITY);

        Ok(Self { meta, handle_cache })
    }

    /// Splits the piece-local byte range `[offset, offset + length)` of
    /// piece `piece_index` into per-file spans.
    ///
    /// The range's global position is `piece_index * piece_length + offset`;
    /// the ordered file list is walked with running cumulative offsets. A
    /// range may touch anywhere from one to every file.
    pub fn file_spans(
        &self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Vec<PieceFileSpan>, StorageError> {
        if piece_index as usize >= self.meta.piece_count() {
            return Err(StorageError::InvalidPieceIndex(piece_index));
        }

        let piece_len = self.meta.piece_len(piece_index);
        if offset as u64 + length as u64 > piece_len {
            return Err(StorageError::InvalidBlockRange {
                piece: piece_index,
                offset,
                length,
            });
        }

        let mut current = piece_index as u64 * self.meta.piece_length + offset as u64;
        let mut remaining = length as u64;
        let mut spans = Vec::new();

        for (file_index, file) in self.meta.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }

            let file_end = file.offset + file.length;
            if current >= file.offset && current < file_end {
                let take = remaining.min(file_end - current);
                spans.push(PieceFileSpan {
                    file_index,
                    file_offset: current - file.offset,
                    length: take,
                });
                current += take;
                remaining -= take;
            }
        }

        Ok(spans)
    }

    /// Creates the directory tree and every file at its declared length.
    ///
    /// Uses `set_len`, so unwritten regions stay sparse where the filesystem
    /// supports it. Idempotent: existing files of the right length are left
    /// alone.
    pub async fn preallocate(&self) -> Result<(), StorageError> {
        for (file_index, file) in self.meta.files.iter().enumerate() {
            let path = self.handle_cache.file_path(file_index);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;

            if f.metadata().await?.len() != file.length {
                f.set_len(file.length).await?;
            }
        }

        Ok(())
    }

    /// Reads a whole piece across all spanning files.
    pub async fn read_piece(&self, piece_index: u32) -> Result<Bytes, StorageError> {
        let len = self.meta.piece_len(piece_index) as u32;
        self.read_range(piece_index, 0, len).await
    }

    /// Reads one block of a piece.
    pub async fn read_block(
        &self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        self.read_range(piece_index, offset, length).await
    }

    async fn read_range(
        &self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        let spans = self.file_spans(piece_index, offset, length)?;
        let mut data = Vec::with_capacity(length as usize);

        for span in spans {
            let handle = self.handle_cache.get_or_open_read(span.file_index).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let mut buf = vec![0u8; span.length as usize];
            file.read_exact(&mut buf).await?;
            data.extend_from_slice(&buf);
        }

        Ok(Bytes::from(data))
    }

    /// Writes a complete, verified piece.
    ///
    /// Either every byte reaches the OS before this returns, or an error is
    /// surfaced and nothing is considered written. Durable flushing happens
    /// at completion time via [`FileStore::sync`], not per piece.
    pub async fn write_piece(&self, piece_index: u32, data: &[u8]) -> Result<(), StorageError> {
        let expected = self.meta.piece_len(piece_index);
        if data.len() as u64 != expected {
            return Err(StorageError::PieceLengthMismatch {
                piece: piece_index,
                got: data.len(),
                expected,
            });
        }

        let spans = self.file_spans(piece_index, 0, expected as u32)?;
        let mut data_offset = 0usize;

        for span in spans {
            let handle = self.handle_cache.get_or_open_write(span.file_index).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let chunk = &data[data_offset..data_offset + span.length as usize];
            file.write_all(chunk).await?;
            file.flush().await?;

            data_offset += span.length as usize;
        }

        Ok(())
    }

    /// Hashes every piece on disk and returns the set that verifies.
    ///
    /// Used at startup to resume: verified pieces are never requested again.
    /// On a fresh (preallocated, all-zero) tree nothing verifies and the
    /// result is empty.
    pub async fn scan_resume(&self) -> Result<Bitfield, StorageError> {
        let piece_count = self.meta.piece_count();
        let mut have = Bitfield::new(piece_count);

        for index in 0..piece_count as u32 {
            let data = match self.read_piece(index).await {
                Ok(data) => data,
                // Unreadable regions are simply not ours yet.
                Err(StorageError::Io(_)) => continue,
                Err(e) => return Err(e),
            };

            let expected = self.meta.pieces[index as usize];
            let matches = tokio::task::spawn_blocking(move || {
                let mut hasher = Sha1::new();
                hasher.update(&data);
                let got: [u8; 20] = hasher.finalize().into();
                got == expected
            })
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

            if matches {
                have.set(index as usize);
            }
        }

        Ok(have)
    }

    /// Syncs all cached write handles to durable storage.
    pub async fn sync(&self) {
        self.handle_cache.flush_all().await;
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}
