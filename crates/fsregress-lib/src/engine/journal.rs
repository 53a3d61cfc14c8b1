//! Operation journal for engine calls
//!
//! The in-process engine can record every call it receives as a
//! [`JournalEntry`]. Entries are append-only and carry a monotonic sequence
//! number, so a test can check both which operations reached the engine and
//! in what order.
//!
//! # Example
//!
//! ```
//! use fsregress_lib::engine::{EngineOp, Journal};
//!
//! let mut journal = Journal::enabled();
//! journal.record(EngineOp::Mkdir { path: "dir0".into() });
//!
//! assert_eq!(journal.len(), 1);
//! assert_eq!(journal.entries()[0].seq(), 1);
//! ```

use super::AioDirection;

/// A single recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Monotonic sequence number, starting at 1.
    seq: u64,
    op: EngineOp,
}

impl JournalEntry {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn op(&self) -> &EngineOp {
        &self.op
    }
}

/// The engine call and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Capacity,
    Open { path: String, create: bool },
    Close { handle: u64 },
    Unlink { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Getattr { path: String },
    Fallocate { path: String, offset: u64, len: u64 },
    Mkfile { path: String, size: u64 },
    AioOpen { path: String, direction: AioDirection },
    AioSubmit { offset: u64, len: u32 },
    AioComplete { offset: u64 },
}

impl EngineOp {
    /// Path named by the operation, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            EngineOp::Open { path, .. }
            | EngineOp::Unlink { path }
            | EngineOp::Mkdir { path }
            | EngineOp::Rmdir { path }
            | EngineOp::Getattr { path }
            | EngineOp::Fallocate { path, .. }
            | EngineOp::Mkfile { path, .. }
            | EngineOp::AioOpen { path, .. } => Some(path),
            EngineOp::Capacity
            | EngineOp::Close { .. }
            | EngineOp::AioSubmit { .. }
            | EngineOp::AioComplete { .. } => None,
        }
    }

    /// True for operations that change engine state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            EngineOp::Capacity | EngineOp::Getattr { .. } | EngineOp::Close { .. }
        )
    }
}

/// Append-only list of engine calls.
///
/// A disabled journal drops everything, so large runs pay nothing for it.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    enabled: bool,
    next_seq: u64,
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            next_seq: 1,
            entries: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, op: EngineOp) {
        if !self.enabled {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(JournalEntry { seq, op });
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offsets submitted through AIO queues, split by the direction of the
    /// queue that was open at the time, in submission order.
    pub fn submitted_by_direction(&self) -> (Vec<u64>, Vec<u64>) {
        let mut writes = Vec::new();
        let mut reads = Vec::new();
        let mut current = None;
        for entry in &self.entries {
            match entry.op {
                EngineOp::AioOpen { direction, .. } => current = Some(direction),
                EngineOp::AioSubmit { offset, .. } => match current {
                    Some(AioDirection::Write) => writes.push(offset),
                    Some(AioDirection::Read) => reads.push(offset),
                    None => {}
                },
                _ => {}
            }
        }
        (writes, reads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_journal_records_nothing() {
        let mut journal = Journal::disabled();
        journal.record(EngineOp::Capacity);
        assert!(journal.is_empty());
        assert!(!journal.is_enabled());
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let mut journal = Journal::enabled();
        journal.record(EngineOp::Capacity);
        journal.record(EngineOp::Mkdir {
            path: "dir0".to_string(),
        });
        journal.record(EngineOp::Rmdir {
            path: "dir0".to_string(),
        });

        let seqs: Vec<u64> = journal.entries().iter().map(|e| e.seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_op_path_and_mutation() {
        let op = EngineOp::Unlink {
            path: "file0".to_string(),
        };
        assert_eq!(op.path(), Some("file0"));
        assert!(op.is_mutation());

        assert_eq!(EngineOp::Capacity.path(), None);
        assert!(!EngineOp::Capacity.is_mutation());
        assert!(!EngineOp::Getattr {
            path: "x".to_string()
        }
        .is_mutation());
    }

    #[test]
    fn test_submitted_offsets_follow_open_queue() {
        let mut journal = Journal::enabled();
        journal.record(EngineOp::AioOpen {
            path: "t".to_string(),
            direction: AioDirection::Write,
        });
        journal.record(EngineOp::AioSubmit {
            offset: 4096,
            len: 4096,
        });
        journal.record(EngineOp::AioComplete { offset: 4096 });
        journal.record(EngineOp::AioSubmit { offset: 0, len: 4096 });
        journal.record(EngineOp::AioOpen {
            path: "t".to_string(),
            direction: AioDirection::Read,
        });
        journal.record(EngineOp::AioSubmit { offset: 0, len: 4096 });

        let (writes, reads) = journal.submitted_by_direction();
        assert_eq!(writes, vec![4096, 0]);
        assert_eq!(reads, vec![0]);
    }
}
