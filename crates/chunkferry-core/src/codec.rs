//! Chunk codec: splitting, hashing, ordered reassembly, digest checks.
//!
//! Chunk `i` of a stream of length `L` covers bytes `[i*S, min((i+1)*S, L))`
//! for chunk size `S`. An empty stream is one zero-length chunk so that
//! every transfer has at least index 0.

use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use chunkferry_types::DigestSet;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{DigestMismatch, OrderingError, TransferError};

/// Default upload chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

const HASH_BUFFER: usize = 4 * 1024 * 1024;

/// One index-tagged, contiguous byte range of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub data: Bytes,
}

/// Result of writing a reassembled stream to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub size: u64,
    pub sha256: String,
}

pub fn check_chunk_size(chunk_size: usize) -> Result<(), TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    Ok(())
}

/// Number of chunks a stream of `len` bytes splits into. Never zero.
pub fn chunk_count(len: u64, chunk_size: usize) -> u64 {
    if len == 0 {
        1
    } else {
        len.div_ceil(chunk_size as u64)
    }
}

/// Byte offset and length of chunk `index`.
pub fn chunk_span(index: u64, len: u64, chunk_size: usize) -> (u64, usize) {
    let offset = index.saturating_mul(chunk_size as u64);
    let length = len.saturating_sub(offset).min(chunk_size as u64);
    (offset, length as usize)
}

// ── Deconstruct ──────────────────────────────────────────────────────────

/// Lazy chunk sequence over an in-memory buffer. Cloning restarts it.
#[derive(Debug, Clone)]
pub struct Deconstruct {
    data: Bytes,
    chunk_size: usize,
    next: u64,
    count: u64,
}

impl Deconstruct {
    pub fn chunk_count(&self) -> u64 {
        self.count
    }

    /// Rewinds to chunk 0.
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for Deconstruct {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.count {
            return None;
        }
        let (offset, length) = chunk_span(self.next, self.data.len() as u64, self.chunk_size);
        let start = offset as usize;
        let chunk = Chunk {
            index: self.next,
            data: self.data.slice(start..start + length),
        };
        self.next += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Deconstruct {}

/// Splits `data` into `chunk_size` pieces. The slices share `data`'s buffer.
pub fn deconstruct(data: impl Into<Bytes>, chunk_size: usize) -> Result<Deconstruct, TransferError> {
    check_chunk_size(chunk_size)?;
    let data = data.into();
    let count = chunk_count(data.len() as u64, chunk_size);
    Ok(Deconstruct {
        data,
        chunk_size,
        next: 0,
        count,
    })
}

// ── Digests ──────────────────────────────────────────────────────────────

/// Lowercase hex SHA-256 of `data`.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn normalize(hex_digest: &str) -> String {
    hex_digest.trim().to_ascii_lowercase()
}

/// Compares two hex digests after lowercasing.
pub fn verify_whole(candidate: &str, expected: &str) -> Result<(), DigestMismatch> {
    let (candidate, expected) = (normalize(candidate), normalize(expected));
    if candidate == expected {
        Ok(())
    } else {
        Err(DigestMismatch {
            index: None,
            expected,
            actual: candidate,
        })
    }
}

/// Hashes `data` and compares it with the expected digest of chunk `index`.
pub fn verify_chunk(data: &[u8], expected: &str, index: u64) -> Result<(), DigestMismatch> {
    let actual = digest(data);
    let expected = normalize(expected);
    if actual == expected {
        Ok(())
    } else {
        Err(DigestMismatch {
            index: Some(index),
            expected,
            actual,
        })
    }
}

/// SHA-256 of a whole file, streamed through a 4 MiB buffer.
pub async fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the requested digests of a file in one pass, one chunk in
/// memory at a time.
pub async fn digest_file(
    path: &Path,
    chunk_size: usize,
    whole: bool,
    per_chunk: bool,
) -> Result<DigestSet, TransferError> {
    let mut set = DigestSet::default();
    if !whole && !per_chunk {
        return Ok(set);
    }

    let mut reader = ChunkReader::open(path, chunk_size).await?;
    let mut file_hasher = Sha256::new();
    let mut chunk_digests = Vec::with_capacity(reader.chunk_count() as usize);
    while let Some(chunk) = reader.next_chunk().await? {
        if whole {
            file_hasher.update(&chunk.data);
        }
        if per_chunk {
            chunk_digests.push(digest(&chunk.data));
        }
    }

    if whole {
        set.file_sha256 = Some(hex::encode(file_hasher.finalize()));
    }
    if per_chunk {
        set.chunk_sha256 = Some(chunk_digests);
    }
    Ok(set)
}

// ── Reassembly ───────────────────────────────────────────────────────────

/// Checks that ascending `indices` run 0, 1, 2, ... with no gap or repeat,
/// and, if `expected` is known, that exactly that many are
/// present. Returns the number of chunks.
pub fn check_sequence<I>(indices: I, expected: Option<u64>) -> Result<u64, OrderingError>
where
    I: IntoIterator<Item = u64>,
{
    let mut next = 0u64;
    for index in indices {
        if index < next {
            return Err(OrderingError::Duplicate(index));
        }
        if index > next {
            return Err(OrderingError::Missing(next));
        }
        if expected.is_some_and(|n| index >= n) {
            return Err(OrderingError::Unexpected(index));
        }
        next += 1;
    }
    match expected {
        Some(n) if next < n => Err(OrderingError::Missing(next)),
        None if next == 0 => Err(OrderingError::Missing(0)),
        _ => Ok(next),
    }
}

/// Concatenates chunks by index regardless of the order they arrive in.
pub fn reassemble<I>(chunks: I) -> Result<Bytes, OrderingError>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut ordered = BTreeMap::new();
    for chunk in chunks {
        if ordered.insert(chunk.index, chunk.data).is_some() {
            return Err(OrderingError::Duplicate(chunk.index));
        }
    }
    check_sequence(ordered.keys().copied(), None)?;

    let total = ordered.values().map(Bytes::len).sum();
    let mut out = BytesMut::with_capacity(total);
    for data in ordered.values() {
        out.extend_from_slice(data);
    }
    Ok(out.freeze())
}

// ── ChunkReader ──────────────────────────────────────────────────────────

/// Reads a file in fixed-size chunks. Reopen the file to restart.
pub struct ChunkReader {
    file: fs::File,
    chunk_size: usize,
    len: u64,
    next: u64,
    count: u64,
}

impl ChunkReader {
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        check_chunk_size(chunk_size)?;
        let file = fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file,
            chunk_size,
            len,
            next: 0,
            count: chunk_count(len, chunk_size),
        })
    }

    /// Reads the next chunk. Returns `None` after the last one.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.next >= self.count {
            return Ok(None);
        }
        let (_, length) = chunk_span(self.next, self.len, self.chunk_size);
        let mut buf = vec![0u8; length];
        self.file.read_exact(&mut buf).await?;

        let chunk = Chunk {
            index: self.next,
            data: Bytes::from(buf),
        };
        self.next += 1;
        Ok(Some(chunk))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_count(&self) -> u64 {
        self.count
    }
}

/// Reads chunk `index` of the file at `path` directly.
pub async fn read_chunk_at(
    path: &Path,
    index: u64,
    chunk_size: usize,
) -> Result<Chunk, TransferError> {
    check_chunk_size(chunk_size)?;
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let (offset, length) = chunk_span(index, len, chunk_size);
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf).await?;
    Ok(Chunk {
        index,
        data: Bytes::from(buf),
    })
}

// ── Chunk directories ────────────────────────────────────────────────────

/// File name of chunk `index` inside a chunk directory.
pub fn chunk_file_name(index: u64) -> String {
    format!("chunk-{index}")
}

/// Inverse of [`chunk_file_name`]; rejects non-canonical spellings.
pub fn parse_chunk_file_name(name: &str) -> Option<u64> {
    let index: u64 = name.strip_prefix("chunk-")?.parse().ok()?;
    (chunk_file_name(index) == name).then_some(index)
}

/// Persists one chunk into `dir`. The payload lands under a temporary
/// name first so a crash never leaves a truncated `chunk-N`.
pub async fn write_chunk_file(dir: &Path, chunk: &Chunk) -> std::io::Result<PathBuf> {
    let path = dir.join(chunk_file_name(chunk.index));
    let partial = dir.join(format!(".{}.part", chunk_file_name(chunk.index)));
    let mut file = fs::File::create(&partial).await?;
    file.write_all(&chunk.data).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&partial, &path).await?;
    Ok(path)
}

/// Indices of every chunk file present in `dir`.
pub async fn scan_chunk_dir(dir: &Path) -> std::io::Result<BTreeSet<u64>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut indices = BTreeSet::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(index) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
            indices.insert(index);
        }
    }
    Ok(indices)
}

/// Writes the chunks of `dir` to `out` in ascending index order.
///
/// `inspect` sees every chunk before it is written and may reject it.
/// On any failure the partial output is removed.
pub async fn reassemble_dir<F>(
    dir: &Path,
    indices: &BTreeSet<u64>,
    expected: Option<u64>,
    out: &Path,
    inspect: F,
) -> Result<Assembled, TransferError>
where
    F: FnMut(u64, &[u8]) -> Result<(), TransferError>,
{
    check_sequence(indices.iter().copied(), expected)?;

    let result = write_ordered(dir, indices, out, inspect).await;
    if result.is_err() {
        let _ = fs::remove_file(out).await;
    }
    result
}

async fn write_ordered<F>(
    dir: &Path,
    indices: &BTreeSet<u64>,
    out: &Path,
    mut inspect: F,
) -> Result<Assembled, TransferError>
where
    F: FnMut(u64, &[u8]) -> Result<(), TransferError>,
{
    let mut file = fs::File::create(out).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    for &index in indices {
        let data = fs::read(dir.join(chunk_file_name(index))).await?;
        inspect(index, &data)?;
        hasher.update(&data);
        file.write_all(&data).await?;
        size += data.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(Assembled {
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}
