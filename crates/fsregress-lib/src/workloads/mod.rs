//! Workload generators
//!
//! Each workload sizes itself from a fresh capacity snapshot, drives its
//! phases against the engine in [`RunContext`], and prints progress and
//! throughput to the context's writer. Any engine error aborts the workload
//! with a [`WorkloadError`]; nothing is retried.

pub mod aio;
pub mod allocation;
pub mod metadata;

use std::io::Write;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

use crate::engine::{AioDirection, EngineError, StorageEngine};
use crate::sizing::IntensityTier;

pub use aio::{AccessPattern, AioPipeline, AioReport, AioSettings, BlockOffsets, PhaseOutcome};
pub use allocation::AllocationReport;
pub use metadata::{EntryClass, MetadataReport};

/// Everything a workload needs for one test case.
pub struct RunContext<'a> {
    pub engine: &'a mut dyn StorageEngine,
    pub tier: IntensityTier,
    pub aio: AioSettings,
    pub out: &'a mut dyn Write,
}

impl<'a> RunContext<'a> {
    pub fn new(
        engine: &'a mut dyn StorageEngine,
        tier: IntensityTier,
        aio: AioSettings,
        out: &'a mut dyn Write,
    ) -> Self {
        Self {
            engine,
            tier,
            aio,
            out,
        }
    }

    /// Print one line of user-facing output.
    pub fn say(&mut self, line: impl AsRef<str>) {
        if let Err(e) = writeln!(self.out, "{}", line.as_ref()) {
            debug!("RunContext::say: write failed: {}", e);
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("Capacity query failed: {0}")]
    Capacity(#[source] EngineError),

    #[error("{op} failed for {target}: {source}")]
    Operation {
        op: &'static str,
        target: String,
        #[source]
        source: EngineError,
    },

    #[error("Verification failed for {target}: {reason}")]
    Verification { target: String, reason: String },

    #[error("Allocation of {target} produced no space ({requested} bytes requested)")]
    EmptyAllocation { target: String, requested: u64 },

    #[error("AIO {direction} phase on {path} failed: {fault}")]
    Aio {
        direction: AioDirection,
        path: String,
        #[source]
        fault: AioFault,
    },

    #[error("Cleanup of {path} failed: {source}")]
    Cleanup {
        path: String,
        #[source]
        source: EngineError,
        /// Failure that triggered the cleanup, if any
        after: Option<Box<WorkloadError>>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl WorkloadError {
    /// Distinct nonzero status code per failure class.
    pub fn code(&self) -> i32 {
        match self {
            WorkloadError::Capacity(_) => 2,
            WorkloadError::Operation { .. } => 3,
            WorkloadError::Verification { .. } => 4,
            WorkloadError::EmptyAllocation { .. } => 5,
            WorkloadError::Aio { .. } => 6,
            WorkloadError::Cleanup { .. } => 7,
            WorkloadError::InvalidArgument(_) => 8,
        }
    }

    /// Build a mapper for `Result::map_err` on an engine call.
    pub(crate) fn op<'a>(
        op: &'static str,
        target: &'a str,
    ) -> impl FnOnce(EngineError) -> Self + 'a {
        move |source| WorkloadError::Operation {
            op,
            target: target.to_string(),
            source,
        }
    }
}

/// Why an AIO phase failed.
#[derive(Error, Debug)]
pub enum AioFault {
    #[error("could not open queue: {0}")]
    Open(#[source] EngineError),

    #[error("submit at offset {offset} rejected: {source}")]
    Submit {
        offset: u64,
        #[source]
        source: EngineError,
    },

    #[error("request at offset {offset} failed: {source}")]
    Request {
        offset: u64,
        #[source]
        source: EngineError,
    },

    #[error("short transfer at offset {offset}: {done} of {expected} bytes")]
    Short { offset: u64, done: u32, expected: u32 },

    #[error("reap failed: {0}")]
    Reap(#[source] EngineError),

    #[error("completion for unknown request tag {0}")]
    UnknownTag(u64),
}

/// Amount of work done in one timed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseStats {
    /// Items or bytes, depending on the phase
    pub amount: u64,
    pub elapsed: Duration,
}

impl PhaseStats {
    pub fn new(amount: u64, elapsed: Duration) -> Self {
        Self { amount, elapsed }
    }

    /// Amount per second. Zero work reports zero.
    pub fn per_sec(&self) -> f64 {
        if self.amount == 0 {
            return 0.0;
        }
        // Clamp so a phase faster than the clock still reports a rate
        let secs = self.elapsed.as_secs_f64().max(1e-9);
        self.amount as f64 / secs
    }

    pub fn mb_per_sec(&self) -> f64 {
        self.per_sec() / (1024.0 * 1024.0)
    }
}

/// Run `f` and measure how long it took.
pub(crate) fn timed<T>(
    f: impl FnOnce() -> Result<T, WorkloadError>,
) -> Result<(T, Duration), WorkloadError> {
    let start = Instant::now();
    let value = f()?;
    Ok((value, start.elapsed()))
}
