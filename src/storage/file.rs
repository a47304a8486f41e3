use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex as TokioMutex;

use super::error::StorageError;
use crate::metainfo::FileEntry;

/// One contiguous run of a piece-local byte range within a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceFileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

pub(super) struct PerFileHandle {
    pub file: TokioMutex<File>,
    pub last_used: parking_lot::Mutex<Instant>,
    pub is_write: bool,
}

/// Open file handles, bounded.
///
/// Writes are serialized per file through the handle's mutex; different
/// files proceed in parallel. When the cache is full the least recently
/// used handle is flushed and dropped.
pub(super) struct FileHandleCache {
    handles: DashMap<usize, Arc<PerFileHandle>>,
    base_path: PathBuf,
    files: Arc<Vec<FileEntry>>,
    capacity: usize,
}

impl FileHandleCache {
    pub fn new(base_path: PathBuf, files: Arc<Vec<FileEntry>>, capacity: usize) -> Self {
        Self {
            handles: DashMap::new(),
            base_path,
            files,
            capacity,
        }
    }

    pub fn file_path(&self, file_index: usize) -> PathBuf {
        self.base_path.join(&self.files[file_index].path)
    }

    pub async fn get_or_open_read(
        &self,
        file_index: usize,
    ) -> Result<Arc<PerFileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            *handle.last_used.lock() = Instant::now();
            return Ok(handle.clone());
        }

        self.evict_to_capacity().await;

        let path = self.file_path(file_index);
        let file = File::open(&path).await?;

        let handle = Arc::new(PerFileHandle {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            is_write: false,
        });

        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    pub async fn get_or_open_write(
        &self,
        file_index: usize,
    ) -> Result<Arc<PerFileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            if handle.is_write {
                *handle.last_used.lock() = Instant::now();
                return Ok(handle.clone());
            }
            drop(handle);
            self.handles.remove(&file_index);
        }

        self.evict_to_capacity().await;

        let path = self.file_path(file_index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let handle = Arc::new(PerFileHandle {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            is_write: true,
        });

        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    /// Drops least-recently-used handles until below capacity.
    async fn evict_to_capacity(&self) {
        while self.handles.len() >= self.capacity {
            let oldest = self
                .handles
                .iter()
                .min_by_key(|r| *r.last_used.lock())
                .map(|r| *r.key());

            let Some(key) = oldest else { break };
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.is_write {
                    let file = handle.file.lock().await;
                    let _ = file.sync_data().await;
                }
            }
        }
    }

    /// Syncs and drops every cached write handle.
    pub async fn flush_all(&self) {
        let keys: Vec<usize> = self.handles.iter().map(|r| *r.key()).collect();
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.is_write {
                    let file = handle.file.lock().await;
                    let _ = file.sync_data().await;
                }
            }
        }
    }
}
