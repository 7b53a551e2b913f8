// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::errors::StorageError;

/// One on-disk file of the torrent and its place in the global byte stream.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub length: u64,
    pub global_offset: u64,
}

/// File layout of a torrent, unifying single-file and multi-file shapes.
#[derive(Debug, Clone)]
pub struct FileMap {
    pub files: Vec<StoredFile>,
    pub total_size: u64,
}

impl FileMap {
    pub fn single(path: PathBuf, length: u64) -> Self {
        Self {
            files: vec![StoredFile {
                path,
                length,
                global_offset: 0,
            }],
            total_size: length,
        }
    }

    pub fn multi(root: &Path, entries: Vec<(PathBuf, u64)>) -> Self {
        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0;
        for (relative, length) in entries {
            files.push(StoredFile {
                path: root.join(relative),
                length,
                global_offset: offset,
            });
            offset += length;
        }
        Self {
            files,
            total_size: offset,
        }
    }

    /// Files overlapping `[offset, offset + len)`, with the in-file offset
    /// and length of each overlap.
    fn spans(&self, offset: u64, len: u64) -> impl Iterator<Item = (&StoredFile, u64, u64)> {
        let end = offset + len;
        self.files.iter().filter_map(move |file| {
            let file_end = file.global_offset + file.length;
            let start = offset.max(file.global_offset);
            let stop = end.min(file_end);
            if start >= stop {
                return None;
            }
            Some((file, start - file.global_offset, stop - start))
        })
    }
}

/// Creates directories and pre-sizes every file of the torrent.
pub async fn allocate(map: &FileMap) -> Result<(), StorageError> {
    for file in &map.files {
        if let Some(parent) = file.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&file.path)
            .await?;
        if handle.metadata().await?.len() < file.length {
            handle.set_len(file.length).await?;
        }
    }
    Ok(())
}

/// Reads `len` bytes starting at the global `offset`, crossing file
/// boundaries as needed.
pub async fn read_span(map: &FileMap, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
    let mut out = vec![0u8; len];
    let mut cursor = 0usize;
    for (file, file_offset, span_len) in map.spans(offset, len as u64) {
        let mut handle = OpenOptions::new().read(true).open(&file.path).await?;
        handle.seek(SeekFrom::Start(file_offset)).await?;
        let span_len = span_len as usize;
        handle
            .read_exact(&mut out[cursor..cursor + span_len])
            .await?;
        cursor += span_len;
    }
    if cursor != len {
        return Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "read past end of torrent data",
        )));
    }
    Ok(out)
}

/// Writes `data` at the global `offset`, crossing file boundaries as needed.
pub async fn write_span(map: &FileMap, offset: u64, data: &[u8]) -> Result<(), StorageError> {
    let mut cursor = 0usize;
    for (file, file_offset, span_len) in map.spans(offset, data.len() as u64) {
        let mut handle = OpenOptions::new().write(true).open(&file.path).await?;
        handle.seek(SeekFrom::Start(file_offset)).await?;
        let span_len = span_len as usize;
        handle.write_all(&data[cursor..cursor + span_len]).await?;
        cursor += span_len;
    }
    if cursor != data.len() {
        return Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write past end of torrent data",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("peerling-storage-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn write_and_read_across_file_boundary() {
        let root = temp_root("boundary");
        let map = FileMap::multi(
            &root,
            vec![(PathBuf::from("a.bin"), 10), (PathBuf::from("b.bin"), 10)],
        );
        allocate(&map).await.unwrap();

        let payload: Vec<u8> = (0..12u8).collect();
        write_span(&map, 4, &payload).await.unwrap();

        let back = read_span(&map, 4, 12).await.unwrap();
        assert_eq!(back, payload);

        // The tail of the second file is untouched zeroes.
        let tail = read_span(&map, 16, 4).await.unwrap();
        assert_eq!(tail, vec![0u8; 4]);

        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn read_past_end_is_an_error() {
        let root = temp_root("pastend");
        let map = FileMap::single(root.join("only.bin"), 8);
        allocate(&map).await.unwrap();
        assert!(read_span(&map, 4, 8).await.is_err());
        std::fs::remove_dir_all(root).unwrap();
    }
}
