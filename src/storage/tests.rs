use std::path::PathBuf;
use std::sync::Arc;

use sha1::{Digest, Sha1};

use super::*;
use crate::metainfo::{FileEntry, InfoHash, Metainfo};

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Two 10-byte files at piece length 8: pieces of 8, 8, and 4 bytes, with
/// piece 1 spanning the file boundary.
fn two_file_meta() -> (Arc<Metainfo>, Vec<Vec<u8>>) {
    let a = b"0123456789".to_vec();
    let b = b"abcdefghij".to_vec();

    let piece0 = a[0..8].to_vec();
    let piece1 = [&a[8..10], &b[0..6]].concat();
    let piece2 = b[6..10].to_vec();

    let meta = Metainfo {
        info_hash: InfoHash([0u8; 20]),
        name: "pair".to_string(),
        piece_length: 8,
        pieces: vec![sha1(&piece0), sha1(&piece1), sha1(&piece2)],
        files: vec![
            FileEntry {
                path: PathBuf::from("pair/a"),
                length: 10,
                offset: 0,
            },
            FileEntry {
                path: PathBuf::from("pair/b"),
                length: 10,
                offset: 10,
            },
        ],
        total_length: 20,
        announce: None,
        announce_list: Vec::new(),
    };

    (Arc::new(meta), vec![piece0, piece1, piece2])
}

#[test]
fn test_spanning_piece_maps_to_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, _) = two_file_meta();
    let store = FileStore::new(dir.path().to_path_buf(), meta).unwrap();

    let spans = store.file_spans(1, 0, 8).unwrap();
    assert_eq!(
        spans,
        vec![
            PieceFileSpan {
                file_index: 0,
                file_offset: 8,
                length: 2
            },
            PieceFileSpan {
                file_index: 1,
                file_offset: 0,
                length: 6
            },
        ]
    );
}

#[test]
fn test_span_bounds_checked() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, _) = two_file_meta();
    let store = FileStore::new(dir.path().to_path_buf(), meta).unwrap();

    assert!(matches!(
        store.file_spans(3, 0, 1),
        Err(StorageError::InvalidPieceIndex(3))
    ));
    // Piece 2 is only 4 bytes long.
    assert!(matches!(
        store.file_spans(2, 0, 8),
        Err(StorageError::InvalidBlockRange { piece: 2, .. })
    ));
}

#[tokio::test]
async fn test_preallocate_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, _) = two_file_meta();
    let store = FileStore::new(dir.path().to_path_buf(), meta).unwrap();

    store.preallocate().await.unwrap();
    store.preallocate().await.unwrap();

    let a = tokio::fs::metadata(dir.path().join("pair/a")).await.unwrap();
    let b = tokio::fs::metadata(dir.path().join("pair/b")).await.unwrap();
    assert_eq!(a.len(), 10);
    assert_eq!(b.len(), 10);
}

#[tokio::test]
async fn test_write_read_piece_across_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, pieces) = two_file_meta();
    let store = FileStore::new(dir.path().to_path_buf(), meta).unwrap();
    store.preallocate().await.unwrap();

    store.write_piece(1, &pieces[1]).await.unwrap();

    let back = store.read_piece(1).await.unwrap();
    assert_eq!(back.as_ref(), pieces[1].as_slice());

    // The two bytes landed at the tail of file a, the rest at the head of b.
    let a = tokio::fs::read(dir.path().join("pair/a")).await.unwrap();
    assert_eq!(&a[8..10], b"89");
    let b = tokio::fs::read(dir.path().join("pair/b")).await.unwrap();
    assert_eq!(&b[0..6], b"abcdef");
}

#[tokio::test]
async fn test_write_piece_length_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, _) = two_file_meta();
    let store = FileStore::new(dir.path().to_path_buf(), meta).unwrap();
    store.preallocate().await.unwrap();

    assert!(matches!(
        store.write_piece(2, b"too long for piece 2").await,
        Err(StorageError::PieceLengthMismatch { piece: 2, .. })
    ));
}

#[tokio::test]
async fn test_scan_resume_partial() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, pieces) = two_file_meta();
    let store = FileStore::new(dir.path().to_path_buf(), meta).unwrap();
    store.preallocate().await.unwrap();

    store.write_piece(0, &pieces[0]).await.unwrap();
    store.write_piece(2, &pieces[2]).await.unwrap();

    let have = store.scan_resume().await.unwrap();
    assert!(have.has(0));
    assert!(!have.has(1));
    assert!(have.has(2));
}

#[tokio::test]
async fn test_scan_resume_complete_tree_is_all_ones() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, pieces) = two_file_meta();
    let store = FileStore::new(dir.path().to_path_buf(), meta.clone()).unwrap();
    store.preallocate().await.unwrap();

    for (i, piece) in pieces.iter().enumerate() {
        store.write_piece(i as u32, piece).await.unwrap();
    }

    let have = store.scan_resume().await.unwrap();
    assert!(have.is_complete());

    // Completed pieces re-read to their metainfo hash.
    for i in 0..meta.piece_count() as u32 {
        let data = store.read_piece(i).await.unwrap();
        assert_eq!(sha1(&data), meta.pieces[i as usize]);
    }
}

#[test]
fn test_rejects_traversal_paths() {
    let dir = tempfile::tempdir().unwrap();
    let (meta, _) = two_file_meta();
    let mut meta = (*meta).clone();
    meta.files[0].path = PathBuf::from("../escape");

    assert!(matches!(
        FileStore::new(dir.path().to_path_buf(), Arc::new(meta)),
        Err(StorageError::PathTraversal(_))
    ));
}
