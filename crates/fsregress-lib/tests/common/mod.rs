//! Common test utilities for fsregress
//!
//! `Harness` bundles an in-process engine with an output buffer so a test can
//! run a workload and then inspect both the engine journal and what the run
//! printed. `FaultyEngine` wraps a `MemEngine` and fails a chosen call.

#![allow(dead_code)]

use std::io;

use fsregress_lib::engine::{
    AioDirection, AioQueue, AlignMode, CapacitySnapshot, EngineError, EngineOp, FileAttr,
    FileHandle, MemEngine, MemEngineConfig, StorageEngine,
};
use fsregress_lib::sizing::IntensityTier;
use fsregress_lib::workloads::{AioSettings, RunContext};

pub struct Harness {
    pub engine: MemEngine,
    pub out: Vec<u8>,
    pub aio: AioSettings,
}

impl Harness {
    /// Journaled engine with the given budgets and 4 KiB blocks.
    pub fn new(inodes: u64, blocks: u64) -> Self {
        Self {
            engine: MemEngine::with_capacity(inodes, blocks, 4096),
            out: Vec::new(),
            aio: AioSettings::default(),
        }
    }

    /// Engine without a journal, for long runs.
    pub fn unjournaled(inodes: u64, blocks: u64) -> Self {
        Self {
            engine: MemEngine::new(MemEngineConfig {
                inodes,
                blocks,
                ..MemEngineConfig::default()
            }),
            out: Vec::new(),
            aio: AioSettings::default(),
        }
    }

    pub fn run<T>(&mut self, tier: IntensityTier, f: impl FnOnce(&mut RunContext<'_>) -> T) -> T {
        let mut ctx = RunContext::new(&mut self.engine, tier, self.aio, &mut self.out);
        f(&mut ctx)
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.out).into_owned()
    }

    pub fn count_ops(&self, pred: impl Fn(&EngineOp) -> bool) -> usize {
        self.engine
            .journal()
            .entries()
            .iter()
            .filter(|e| pred(e.op()))
            .count()
    }

    /// Offsets submitted per direction, in submission order.
    pub fn submitted_by_direction(&self) -> (Vec<u64>, Vec<u64>) {
        self.engine.journal().submitted_by_direction()
    }
}

/// Which engine call `FaultyEngine` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Capacity,
    Open,
    Unlink,
    Getattr,
    Fallocate,
}

/// Fails every call at `point` from the `after`-th one (0-based) on.
pub struct FaultyEngine {
    pub inner: MemEngine,
    point: FaultPoint,
    after: u64,
    seen: u64,
}

impl FaultyEngine {
    pub fn new(inner: MemEngine, point: FaultPoint, after: u64) -> Self {
        Self {
            inner,
            point,
            after,
            seen: 0,
        }
    }

    fn check(&mut self, point: FaultPoint) -> Result<(), EngineError> {
        if point != self.point {
            return Ok(());
        }
        let n = self.seen;
        self.seen += 1;
        if n >= self.after {
            Err(EngineError::Io(io::Error::other(format!(
                "injected {:?} fault",
                point
            ))))
        } else {
            Ok(())
        }
    }
}

impl StorageEngine for FaultyEngine {
    fn name(&self) -> &str {
        "faulty"
    }

    fn capacity(&mut self) -> Result<CapacitySnapshot, EngineError> {
        self.check(FaultPoint::Capacity)?;
        self.inner.capacity()
    }

    fn open(&mut self, path: &str, create: bool) -> Result<FileHandle, EngineError> {
        self.check(FaultPoint::Open)?;
        self.inner.open(path, create)
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), EngineError> {
        self.inner.close(handle)
    }

    fn unlink(&mut self, path: &str) -> Result<(), EngineError> {
        self.check(FaultPoint::Unlink)?;
        self.inner.unlink(path)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), EngineError> {
        self.inner.mkdir(path)
    }

    fn rmdir(&mut self, path: &str) -> Result<(), EngineError> {
        self.inner.rmdir(path)
    }

    fn getattr(&mut self, path: &str) -> Result<FileAttr, EngineError> {
        self.check(FaultPoint::Getattr)?;
        self.inner.getattr(path)
    }

    fn fallocate(&mut self, path: &str, offset: u64, len: u64) -> Result<(), EngineError> {
        self.check(FaultPoint::Fallocate)?;
        self.inner.fallocate(path, offset, len)
    }

    fn mkfile(&mut self, path: &str, size: u64) -> Result<(), EngineError> {
        self.inner.mkfile(path, size)
    }

    fn open_aio<'a>(
        &'a mut self,
        path: &str,
        direction: AioDirection,
        align: AlignMode,
    ) -> Result<Box<dyn AioQueue + 'a>, EngineError> {
        self.inner.open_aio(path, direction, align)
    }
}
