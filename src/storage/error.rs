use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block range: piece {piece}, offset {offset}, length {length}")]
    InvalidBlockRange { piece: u32, offset: u32, length: u32 },

    #[error("piece length mismatch: piece {piece}, got {got} bytes, expected {expected}")]
    PieceLengthMismatch { piece: u32, got: usize, expected: u64 },

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
