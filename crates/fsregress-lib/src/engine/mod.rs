//! Storage engine contract for fsregress
//!
//! The harness never talks to a concrete engine. Everything it needs from the
//! engine under test is expressed by [`StorageEngine`] (path-based metadata,
//! bulk allocation, capacity) and [`AioQueue`] (asynchronous block I/O with a
//! submit/reap protocol and out-of-order completion).
//!
//! Two engines ship with the crate:
//!
//! - [`MemEngine`]: deterministic in-process engine with fixed inode and block
//!   budgets. Used by the tests and as the default target.
//! - [`HostDirEngine`]: maps the contract onto a scratch directory of the host
//!   filesystem.

pub mod hostfs;
pub mod journal;
pub mod memory;

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub use hostfs::HostDirEngine;
pub use journal::{EngineOp, Journal, JournalEntry};
pub use memory::{AioStats, MemEngine, MemEngineConfig};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("No space left on engine")]
    NoSpace,

    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    #[error("Unaligned request: offset {offset}, length {len}, alignment {alignment}")]
    Unaligned { offset: u64, len: u64, alignment: u64 },

    #[error("Read beyond end of {path}: offset {offset}, size {size}")]
    OutOfRange { path: String, offset: u64, size: u64 },

    #[error("Engine root is not usable: {0}")]
    InvalidRoot(PathBuf),
}

/// Point-in-time measurement of free engine resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub free_inodes: u64,
    pub free_blocks: u64,
    pub block_size: u64,
}

impl CapacitySnapshot {
    /// Free space in bytes (`free_blocks * block_size`, saturating).
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks.saturating_mul(self.block_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Result of an attribute query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: EntryKind,
    pub size: u64,
}

/// Opaque handle returned by [`StorageEngine::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioDirection {
    Read,
    Write,
}

impl fmt::Display for AioDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AioDirection::Read => write!(f, "read"),
            AioDirection::Write => write!(f, "write"),
        }
    }
}

/// How the engine should treat AIO buffers.
///
/// `Direct` bypasses engine-side caching and requires block-aligned offsets
/// and lengths. `Buffered` accepts any offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignMode {
    #[default]
    Direct,
    Buffered,
}

/// One asynchronous block request.
///
/// `tag` is chosen by the submitter and echoed back in the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioRequest {
    pub tag: u64,
    pub offset: u64,
    pub len: u32,
}

/// Completion of a previously submitted request.
///
/// `result` carries the number of bytes transferred.
#[derive(Debug)]
pub struct AioCompletion {
    pub tag: u64,
    pub result: Result<u32, EngineError>,
}

/// Submission/completion queue bound to one target file.
///
/// Completions may be returned in any order. `reap` may return an empty
/// batch when nothing has finished yet; callers poll again.
pub trait AioQueue {
    /// Queue a request. An error here means the request was not accepted.
    fn submit(&mut self, request: AioRequest) -> Result<(), EngineError>;

    /// Collect finished requests.
    fn reap(&mut self) -> Result<Vec<AioCompletion>, EngineError>;

    /// Number of accepted requests not yet reaped.
    fn in_flight(&self) -> usize;
}

/// The storage engine under test.
///
/// All calls are synchronous and block the calling thread until the engine
/// returns. Paths are relative to the engine's namespace root.
pub trait StorageEngine {
    /// Short engine name for banners and logs.
    fn name(&self) -> &str;

    /// Free inode count, free block count and block size.
    fn capacity(&mut self) -> Result<CapacitySnapshot, EngineError>;

    /// Open a file, creating it when `create` is set.
    fn open(&mut self, path: &str, create: bool) -> Result<FileHandle, EngineError>;

    fn close(&mut self, handle: FileHandle) -> Result<(), EngineError>;

    /// Remove a file. Removing a missing file is an error.
    fn unlink(&mut self, path: &str) -> Result<(), EngineError>;

    fn mkdir(&mut self, path: &str) -> Result<(), EngineError>;

    fn rmdir(&mut self, path: &str) -> Result<(), EngineError>;

    /// Existence and size of an entry.
    fn getattr(&mut self, path: &str) -> Result<FileAttr, EngineError>;

    /// Reserve space for `[offset, offset + len)`.
    ///
    /// The engine may round or clip the request; the resulting size is
    /// observable through [`StorageEngine::getattr`].
    fn fallocate(&mut self, path: &str, offset: u64, len: u64) -> Result<(), EngineError>;

    /// Create a new file holding `size` bytes.
    fn mkfile(&mut self, path: &str, size: u64) -> Result<(), EngineError>;

    /// Open an AIO queue against `path`.
    ///
    /// Write queues create the target when missing and extend it as blocks
    /// are written. Read queues require the target to exist and every read
    /// range to lie within it.
    fn open_aio<'a>(
        &'a mut self,
        path: &str,
        direction: AioDirection,
        align: AlignMode,
    ) -> Result<Box<dyn AioQueue + 'a>, EngineError>;
}

/// Which engine the binary drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process engine with fixed budgets
    #[default]
    Memory,
    /// Scratch directory on the host filesystem
    Dir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_bytes_saturates() {
        let snapshot = CapacitySnapshot {
            free_inodes: 1,
            free_blocks: u64::MAX,
            block_size: 4096,
        };
        assert_eq!(snapshot.free_bytes(), u64::MAX);

        let snapshot = CapacitySnapshot {
            free_inodes: 1,
            free_blocks: 10,
            block_size: 4096,
        };
        assert_eq!(snapshot.free_bytes(), 40960);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(AioDirection::Read.to_string(), "read");
        assert_eq!(AioDirection::Write.to_string(), "write");
    }
}
