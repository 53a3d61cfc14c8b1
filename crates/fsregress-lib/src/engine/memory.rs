//! In-process storage engine
//!
//! `MemEngine` keeps a flat namespace of files and directories in a
//! `HashMap` and accounts for inodes and blocks against fixed budgets. No file
//! data is stored; only sizes and block counts are tracked, which is all the
//! harness observes.
//!
//! Its AIO queue completes a random subset of the pending requests on each
//! `reap`, in random order, so callers cannot depend on completion order.

use std::collections::HashMap;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::journal::{EngineOp, Journal};
use super::{
    AioCompletion, AioDirection, AioQueue, AioRequest, AlignMode, CapacitySnapshot, EngineError,
    EntryKind, FileAttr, FileHandle, StorageEngine,
};

/// Geometry and behaviour of a [`MemEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEngineConfig {
    /// Total inode budget
    pub inodes: u64,
    /// Total block budget
    pub blocks: u64,
    /// Bytes per block
    pub block_size: u64,
    /// Seed for completion reordering
    pub seed: u64,
    /// Record every call in the journal
    pub journal: bool,
}

impl Default for MemEngineConfig {
    fn default() -> Self {
        Self {
            inodes: 1 << 20,
            // 64 GiB with 4 KiB blocks
            blocks: 1 << 24,
            block_size: 4096,
            seed: 0x5eed,
            journal: false,
        }
    }
}

/// Counters for AIO activity since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AioStats {
    pub submitted: u64,
    pub completed: u64,
    /// Highest number of requests pending at once on any queue
    pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
struct Node {
    kind: EntryKind,
    size: u64,
    blocks: u64,
    /// Live entries directly below a directory
    children: u64,
}

impl Node {
    fn file() -> Self {
        Self {
            kind: EntryKind::File,
            size: 0,
            blocks: 0,
            children: 0,
        }
    }

    fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::file()
        }
    }
}

pub struct MemEngine {
    config: MemEngineConfig,
    nodes: HashMap<String, Node>,
    used_inodes: u64,
    used_blocks: u64,
    handles: HashMap<u64, String>,
    next_fh: u64,
    journal: Journal,
    aio_stats: AioStats,
    rng: StdRng,
}

impl MemEngine {
    pub fn new(config: MemEngineConfig) -> Self {
        debug!(
            "MemEngine::new inodes={} blocks={} block_size={}",
            config.inodes, config.blocks, config.block_size
        );
        Self {
            config,
            nodes: HashMap::new(),
            used_inodes: 0,
            used_blocks: 0,
            handles: HashMap::new(),
            next_fh: 1,
            journal: if config.journal {
                Journal::enabled()
            } else {
                Journal::disabled()
            },
            aio_stats: AioStats::default(),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    /// Engine with the given budgets and journaling enabled.
    pub fn with_capacity(inodes: u64, blocks: u64, block_size: u64) -> Self {
        Self::new(MemEngineConfig {
            inodes,
            blocks,
            block_size,
            journal: true,
            ..MemEngineConfig::default()
        })
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn aio_stats(&self) -> AioStats {
        self.aio_stats
    }

    /// Number of live files and directories.
    pub fn entry_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }

    fn free_inodes(&self) -> u64 {
        self.config.inodes.saturating_sub(self.used_inodes)
    }

    fn free_blocks(&self) -> u64 {
        self.config.blocks.saturating_sub(self.used_blocks)
    }

    fn blocks_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.config.block_size)
    }

    fn parent_of(path: &str) -> Option<&str> {
        path.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Insert a new node, charging one inode and linking it to its parent.
    fn insert(&mut self, path: &str, node: Node) -> Result<(), EngineError> {
        if self.nodes.contains_key(path) {
            return Err(EngineError::AlreadyExists(path.to_string()));
        }
        if let Some(parent) = Self::parent_of(path) {
            match self.nodes.get(parent) {
                Some(p) if p.kind == EntryKind::Directory => {}
                Some(_) => return Err(EngineError::NotADirectory(parent.to_string())),
                None => return Err(EngineError::NotFound(parent.to_string())),
            }
        }
        if self.free_inodes() == 0 {
            return Err(EngineError::NoSpace);
        }

        if let Some(parent) = Self::parent_of(path) {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children += 1;
            }
        }
        self.used_inodes += 1;
        self.nodes.insert(path.to_string(), node);
        Ok(())
    }

    /// Remove a node, returning its inode and blocks to the free pool.
    fn remove(&mut self, path: &str) -> Result<(), EngineError> {
        let node = self
            .nodes
            .remove(path)
            .ok_or_else(|| EngineError::NotFound(path.to_string()))?;

        if let Some(parent) = Self::parent_of(path) {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children = p.children.saturating_sub(1);
            }
        }
        self.used_inodes -= 1;
        self.used_blocks -= node.blocks;
        Ok(())
    }

    /// Apply a finished AIO request to the namespace.
    fn complete(
        &mut self,
        path: &str,
        direction: AioDirection,
        request: &AioRequest,
    ) -> Result<u32, EngineError> {
        let end = request.offset + u64::from(request.len);
        let needed = self.blocks_for(end);
        let free = self.free_blocks();

        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| EngineError::NotFound(path.to_string()))?;

        match direction {
            AioDirection::Write => {
                let grow = needed.saturating_sub(node.blocks);
                if grow > free {
                    return Err(EngineError::NoSpace);
                }
                node.blocks += grow;
                node.size = node.size.max(end);
                self.used_blocks += grow;
            }
            AioDirection::Read => {
                if end > node.size {
                    return Err(EngineError::OutOfRange {
                        path: path.to_string(),
                        offset: request.offset,
                        size: node.size,
                    });
                }
            }
        }
        Ok(request.len)
    }
}

impl StorageEngine for MemEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn capacity(&mut self) -> Result<CapacitySnapshot, EngineError> {
        self.journal.record(EngineOp::Capacity);
        Ok(CapacitySnapshot {
            free_inodes: self.free_inodes(),
            free_blocks: self.free_blocks(),
            block_size: self.config.block_size,
        })
    }

    fn open(&mut self, path: &str, create: bool) -> Result<FileHandle, EngineError> {
        self.journal.record(EngineOp::Open {
            path: path.to_string(),
            create,
        });

        match self.nodes.get(path) {
            Some(node) if node.kind == EntryKind::Directory => {
                return Err(EngineError::IsADirectory(path.to_string()));
            }
            Some(_) => {}
            None if create => self.insert(path, Node::file())?,
            None => return Err(EngineError::NotFound(path.to_string())),
        }

        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, path.to_string());
        Ok(FileHandle(fh))
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), EngineError> {
        self.journal.record(EngineOp::Close { handle: handle.0 });
        self.handles
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(EngineError::BadHandle(handle.0))
    }

    fn unlink(&mut self, path: &str) -> Result<(), EngineError> {
        self.journal.record(EngineOp::Unlink {
            path: path.to_string(),
        });
        match self.nodes.get(path) {
            Some(node) if node.kind == EntryKind::Directory => {
                Err(EngineError::IsADirectory(path.to_string()))
            }
            Some(_) => self.remove(path),
            None => Err(EngineError::NotFound(path.to_string())),
        }
    }

    fn mkdir(&mut self, path: &str) -> Result<(), EngineError> {
        self.journal.record(EngineOp::Mkdir {
            path: path.to_string(),
        });
        self.insert(path, Node::directory())
    }

    fn rmdir(&mut self, path: &str) -> Result<(), EngineError> {
        self.journal.record(EngineOp::Rmdir {
            path: path.to_string(),
        });
        match self.nodes.get(path) {
            Some(node) if node.kind != EntryKind::Directory => {
                Err(EngineError::NotADirectory(path.to_string()))
            }
            Some(node) if node.children > 0 => Err(EngineError::NotEmpty(path.to_string())),
            Some(_) => self.remove(path),
            None => Err(EngineError::NotFound(path.to_string())),
        }
    }

    fn getattr(&mut self, path: &str) -> Result<FileAttr, EngineError> {
        self.journal.record(EngineOp::Getattr {
            path: path.to_string(),
        });
        self.nodes
            .get(path)
            .map(|node| FileAttr {
                kind: node.kind,
                size: node.size,
            })
            .ok_or_else(|| EngineError::NotFound(path.to_string()))
    }

    fn fallocate(&mut self, path: &str, offset: u64, len: u64) -> Result<(), EngineError> {
        self.journal.record(EngineOp::Fallocate {
            path: path.to_string(),
            offset,
            len,
        });

        let end = offset.saturating_add(len);
        let block_size = self.config.block_size;
        let needed = self.blocks_for(end);
        let free = self.free_blocks();

        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        if node.kind == EntryKind::Directory {
            return Err(EngineError::IsADirectory(path.to_string()));
        }

        let wanted = needed.saturating_sub(node.blocks);
        if wanted == 0 {
            node.size = node.size.max(end);
            return Ok(());
        }
        if free == 0 {
            return Err(EngineError::NoSpace);
        }

        // Clip to what is left rather than failing outright.
        let granted = wanted.min(free);
        node.blocks += granted;
        node.size = node.size.max(end.min(node.blocks * block_size));
        self.used_blocks += granted;

        if granted < wanted {
            debug!(
                "MemEngine::fallocate clipped {}: wanted {} blocks, granted {}",
                path, wanted, granted
            );
        }
        Ok(())
    }

    fn mkfile(&mut self, path: &str, size: u64) -> Result<(), EngineError> {
        self.journal.record(EngineOp::Mkfile {
            path: path.to_string(),
            size,
        });

        let blocks = self.blocks_for(size);
        if blocks > self.free_blocks() {
            return Err(EngineError::NoSpace);
        }
        self.insert(
            path,
            Node {
                size,
                blocks,
                ..Node::file()
            },
        )?;
        self.used_blocks += blocks;
        Ok(())
    }

    fn open_aio<'a>(
        &'a mut self,
        path: &str,
        direction: AioDirection,
        align: AlignMode,
    ) -> Result<Box<dyn AioQueue + 'a>, EngineError> {
        self.journal.record(EngineOp::AioOpen {
            path: path.to_string(),
            direction,
        });

        match (self.nodes.get(path), direction) {
            (Some(node), _) if node.kind == EntryKind::Directory => {
                return Err(EngineError::IsADirectory(path.to_string()));
            }
            (Some(_), _) => {}
            (None, AioDirection::Write) => self.insert(path, Node::file())?,
            (None, AioDirection::Read) => return Err(EngineError::NotFound(path.to_string())),
        }

        Ok(Box::new(MemAioQueue {
            engine: self,
            path: path.to_string(),
            direction,
            align,
            pending: Vec::new(),
        }))
    }
}

/// AIO queue over a [`MemEngine`] file.
struct MemAioQueue<'a> {
    engine: &'a mut MemEngine,
    path: String,
    direction: AioDirection,
    align: AlignMode,
    pending: Vec<AioRequest>,
}

impl AioQueue for MemAioQueue<'_> {
    fn submit(&mut self, request: AioRequest) -> Result<(), EngineError> {
        let block_size = self.engine.config.block_size;
        if self.align == AlignMode::Direct
            && (request.offset % block_size != 0 || u64::from(request.len) % block_size != 0)
        {
            return Err(EngineError::Unaligned {
                offset: request.offset,
                len: u64::from(request.len),
                alignment: block_size,
            });
        }

        self.engine.journal.record(EngineOp::AioSubmit {
            offset: request.offset,
            len: request.len,
        });
        self.pending.push(request);

        let stats = &mut self.engine.aio_stats;
        stats.submitted += 1;
        stats.max_in_flight = stats.max_in_flight.max(self.pending.len());
        Ok(())
    }

    fn reap(&mut self) -> Result<Vec<AioCompletion>, EngineError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let batch = self.engine.rng.random_range(1..=self.pending.len());
        let mut completions = Vec::with_capacity(batch);
        for _ in 0..batch {
            let idx = self.engine.rng.random_range(0..self.pending.len());
            let request = self.pending.swap_remove(idx);
            let result = self.engine.complete(&self.path, self.direction, &request);

            trace!(
                "MemAioQueue::reap {} tag={} offset={} ok={}",
                self.direction,
                request.tag,
                request.offset,
                result.is_ok()
            );
            self.engine.journal.record(EngineOp::AioComplete {
                offset: request.offset,
            });
            self.engine.aio_stats.completed += 1;
            completions.push(AioCompletion {
                tag: request.tag,
                result,
            });
        }
        Ok(completions)
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MemEngine {
        MemEngine::with_capacity(16, 64, 4096)
    }

    #[test]
    fn test_open_create_consumes_inode() {
        let mut engine = engine();
        let fh = engine.open("file0", true).unwrap();
        engine.close(fh).unwrap();

        let snapshot = engine.capacity().unwrap();
        assert_eq!(snapshot.free_inodes, 15);
        assert_eq!(engine.getattr("file0").unwrap().kind, EntryKind::File);
    }

    #[test]
    fn test_open_without_create_fails_for_missing() {
        let mut engine = engine();
        assert!(matches!(
            engine.open("missing", false),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_double_close_is_bad_handle() {
        let mut engine = engine();
        let fh = engine.open("file0", true).unwrap();
        engine.close(fh).unwrap();
        assert!(matches!(engine.close(fh), Err(EngineError::BadHandle(_))));
    }

    #[test]
    fn test_unlink_is_not_idempotent() {
        let mut engine = engine();
        let fh = engine.open("file0", true).unwrap();
        engine.close(fh).unwrap();

        engine.unlink("file0").unwrap();
        assert!(matches!(
            engine.unlink("file0"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_inode_exhaustion() {
        let mut engine = MemEngine::with_capacity(2, 64, 4096);
        engine.mkdir("dir0").unwrap();
        engine.mkdir("dir1").unwrap();
        assert!(matches!(engine.mkdir("dir2"), Err(EngineError::NoSpace)));
    }

    #[test]
    fn test_rmdir_rules() {
        let mut engine = engine();
        engine.mkdir("dir0").unwrap();
        engine.mkfile("dir0/inner", 10).unwrap();

        assert!(matches!(engine.rmdir("dir0"), Err(EngineError::NotEmpty(_))));
        assert!(matches!(
            engine.rmdir("dir0/inner"),
            Err(EngineError::NotADirectory(_))
        ));

        engine.unlink("dir0/inner").unwrap();
        engine.rmdir("dir0").unwrap();
        assert!(matches!(engine.rmdir("dir0"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_create_under_missing_parent_fails() {
        let mut engine = engine();
        assert!(matches!(
            engine.mkdir("nope/dir"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_fallocate_clips_to_free_blocks() {
        let mut engine = MemEngine::with_capacity(4, 10, 4096);
        let fh = engine.open("big", true).unwrap();
        engine.close(fh).unwrap();

        engine.fallocate("big", 0, 100 * 4096).unwrap();
        let attr = engine.getattr("big").unwrap();
        assert_eq!(attr.size, 10 * 4096);
        assert_eq!(engine.capacity().unwrap().free_blocks, 0);

        // Nothing left to hand out
        let fh = engine.open("other", true).unwrap();
        engine.close(fh).unwrap();
        assert!(matches!(
            engine.fallocate("other", 0, 4096),
            Err(EngineError::NoSpace)
        ));

        engine.unlink("big").unwrap();
        assert_eq!(engine.capacity().unwrap().free_blocks, 10);
    }

    #[test]
    fn test_fallocate_rounds_blocks_but_reports_requested_size() {
        let mut engine = engine();
        let fh = engine.open("f", true).unwrap();
        engine.close(fh).unwrap();

        engine.fallocate("f", 0, 5000).unwrap();
        assert_eq!(engine.getattr("f").unwrap().size, 5000);
        assert_eq!(engine.used_blocks(), 2);
    }

    #[test]
    fn test_mkfile_charges_blocks() {
        let mut engine = engine();
        engine.mkfile("small", 4096).unwrap();
        assert_eq!(engine.getattr("small").unwrap().size, 4096);
        assert_eq!(engine.capacity().unwrap().free_blocks, 63);
        assert!(matches!(
            engine.mkfile("small", 4096),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_aio_write_then_read() {
        let mut engine = engine();
        {
            let mut queue = engine
                .open_aio("target", AioDirection::Write, AlignMode::Direct)
                .unwrap();
            for tag in 0..4 {
                queue
                    .submit(AioRequest {
                        tag,
                        offset: tag * 4096,
                        len: 4096,
                    })
                    .unwrap();
            }
            assert_eq!(queue.in_flight(), 4);

            let mut done = 0;
            while queue.in_flight() > 0 {
                for completion in queue.reap().unwrap() {
                    assert_eq!(completion.result.unwrap(), 4096);
                    done += 1;
                }
            }
            assert_eq!(done, 4);
        }
        assert_eq!(engine.getattr("target").unwrap().size, 4 * 4096);

        let mut queue = engine
            .open_aio("target", AioDirection::Read, AlignMode::Direct)
            .unwrap();
        queue
            .submit(AioRequest {
                tag: 9,
                offset: 4 * 4096,
                len: 4096,
            })
            .unwrap();
        let completions = loop {
            let batch = queue.reap().unwrap();
            if !batch.is_empty() {
                break batch;
            }
        };
        assert!(matches!(
            completions[0].result,
            Err(EngineError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_aio_direct_rejects_unaligned() {
        let mut engine = engine();
        let mut queue = engine
            .open_aio("target", AioDirection::Write, AlignMode::Direct)
            .unwrap();
        let err = queue
            .submit(AioRequest {
                tag: 0,
                offset: 100,
                len: 4096,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Unaligned { .. }));
    }

    #[test]
    fn test_aio_read_requires_target() {
        let mut engine = engine();
        assert!(matches!(
            engine.open_aio("missing", AioDirection::Read, AlignMode::Direct),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_journal_records_calls() {
        let mut engine = engine();
        engine.mkdir("dir0").unwrap();
        engine.getattr("dir0").unwrap();
        engine.rmdir("dir0").unwrap();

        let ops: Vec<&EngineOp> = engine.journal().entries().iter().map(|e| e.op()).collect();
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], EngineOp::Mkdir { .. }));
        assert!(matches!(ops[1], EngineOp::Getattr { .. }));
        assert!(matches!(ops[2], EngineOp::Rmdir { .. }));
    }
}
