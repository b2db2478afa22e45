//! Trace domain types
//!
//! A job trace is the raw byte stream of its log. While the job runs the
//! stream is kept in fixed-size chunks; once the job finishes the chunks are
//! concatenated into a trace artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::domain::job::FailureReason;
use crate::domain::status::Status;

/// Size of a single trace chunk in bytes
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Fixed-size segment of a job trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceChunk {
    pub job_id: i64,
    pub chunk_index: i32,
    pub data: Vec<u8>,
    pub data_store: ChunkStore,
}

impl TraceChunk {
    pub fn new(job_id: i64, chunk_index: i32) -> Self {
        Self {
            job_id,
            chunk_index,
            data: Vec::new(),
            data_store: ChunkStore::Live,
        }
    }

    /// Offset of the chunk's first byte within the stream
    pub fn start_offset(&self) -> u64 {
        self.chunk_index as u64 * CHUNK_SIZE as u64
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset() + self.data.len() as u64
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= CHUNK_SIZE
    }

    pub fn remaining_capacity(&self) -> usize {
        CHUNK_SIZE.saturating_sub(self.data.len())
    }
}

/// Where a chunk's bytes currently live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStore {
    /// Still being appended to
    Live,
    /// Flushed and immutable
    Database,
    /// Copied into the trace artifact
    Archived,
}

/// Final state reported by a runner while trace chunks are still in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingState {
    pub job_id: i64,
    pub state: Status,
    pub failure_reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Integrity record kept for each trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetadata {
    pub job_id: i64,
    /// Checksum computed over the stored chunks
    pub checksum: Option<String>,
    /// Checksum reported by the runner
    pub remote_checksum: Option<String>,
    pub archived: bool,
}

impl TraceMetadata {
    pub fn is_valid(&self) -> bool {
        match (&self.checksum, &self.remote_checksum) {
            (Some(local), Some(remote)) => local == remote,
            _ => true,
        }
    }
}

/// Incremental `sha256:<hex>` checksum of a trace stream
#[derive(Clone, Default)]
pub struct TraceChecksum {
    hasher: Sha256,
}

impl TraceChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }

    pub fn of(bytes: &[u8]) -> String {
        let mut checksum = Self::new();
        checksum.update(bytes);
        checksum.finalize()
    }
}

/// Byte range of a trace append, as carried by the `Content-Range` header
///
/// Formatted `start-end` with an inclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
}

impl ContentRange {
    /// Range covering `len` bytes written at `offset`
    pub fn for_append(offset: u64, len: usize) -> Self {
        Self {
            start: offset,
            end: (offset + len as u64).saturating_sub(1),
        }
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for ContentRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("invalid range: {}", s))?;

        let start = start
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid range start: {}", start))?;
        let end = end
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid range end: {}", end))?;

        if end < start {
            return Err(format!("range end {} precedes start {}", end, start));
        }

        Ok(Self { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_offsets() {
        let mut chunk = TraceChunk::new(1, 2);
        chunk.data = vec![0; 10];
        assert_eq!(chunk.start_offset(), 2 * CHUNK_SIZE as u64);
        assert_eq!(chunk.end_offset(), 2 * CHUNK_SIZE as u64 + 10);
        assert_eq!(chunk.remaining_capacity(), CHUNK_SIZE - 10);
        assert!(!chunk.is_full());
    }

    #[test]
    fn test_checksum_is_incremental() {
        let mut checksum = TraceChecksum::new();
        checksum.update(b"hello ");
        checksum.update(b"world");
        assert_eq!(checksum.finalize(), TraceChecksum::of(b"hello world"));
        assert!(TraceChecksum::of(b"").starts_with("sha256:"));
    }

    #[test]
    fn test_parse_content_range() {
        let range: ContentRange = "0-99".parse().unwrap();
        assert_eq!(range, ContentRange { start: 0, end: 99 });
        assert_eq!(range.to_string(), "0-99");
    }

    #[test]
    fn test_parse_content_range_rejects_garbage() {
        assert!("".parse::<ContentRange>().is_err());
        assert!("12".parse::<ContentRange>().is_err());
        assert!("a-b".parse::<ContentRange>().is_err());
        assert!("10-5".parse::<ContentRange>().is_err());
    }

    #[test]
    fn test_range_for_append() {
        assert_eq!(
            ContentRange::for_append(100, 20),
            ContentRange { start: 100, end: 119 }
        );
    }

    #[test]
    fn test_metadata_validity() {
        let mut metadata = TraceMetadata {
            job_id: 1,
            checksum: Some("sha256:aa".to_string()),
            remote_checksum: None,
            archived: false,
        };
        assert!(metadata.is_valid());
        metadata.remote_checksum = Some("sha256:bb".to_string());
        assert!(!metadata.is_valid());
    }
}
