//! Capacity-aware workload sizing
//!
//! Every workload asks the [`CapacityOracle`] for a fresh [`CapacitySnapshot`]
//! right before it runs and turns it into a [`WorkloadPlan`] according to the
//! run's [`IntensityTier`]. Snapshots are never reused across test cases
//! because every case mutates engine state.
//!
//! Whatever the tier, a plan never exceeds the snapshot it was derived from.

use std::fmt;

use log::debug;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::engine::{CapacitySnapshot, StorageEngine};
use crate::workloads::WorkloadError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Item count used by the quick tier.
pub const QUICK_COUNT: u64 = 100;
/// Byte size used by the quick tier.
pub const QUICK_BYTES: u64 = 100 * MIB;

/// Bounded-large ceiling for metadata and small-file counts.
pub const BOUNDED_COUNT: u64 = 1_000_000;
/// Bounded-large ceiling for the single large-file allocation.
pub const BOUNDED_LARGE_FILE: u64 = TIB;
/// Bounded-large ceiling for the AIO target file.
pub const BOUNDED_AIO_FILE: u64 = 128 * GIB;

/// Payload carried by each file of the small-file workload.
pub const SMALL_FILE_SIZE: u64 = 4 * KIB;

/// Workload scale selected once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntensityTier {
    /// Consume all reported free capacity
    Exhaustive,
    /// Fixed smoke-test sizes
    #[default]
    Quick,
    /// Large fixed ceilings clipped to capacity
    BoundedLarge,
}

impl IntensityTier {
    /// Decode the command-line tier code (1, 2 or 3).
    pub fn from_code(code: i64) -> Result<Self, ConfigError> {
        match code {
            1 => Ok(IntensityTier::Exhaustive),
            2 => Ok(IntensityTier::Quick),
            3 => Ok(IntensityTier::BoundedLarge),
            other => Err(ConfigError::InvalidTier(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            IntensityTier::Exhaustive => 1,
            IntensityTier::Quick => 2,
            IntensityTier::BoundedLarge => 3,
        }
    }

    /// Name printed in the run banner.
    pub fn label(self) -> &'static str {
        match self {
            IntensityTier::Exhaustive => "MAX_TEST",
            IntensityTier::Quick => "QUICK_TEST",
            IntensityTier::BoundedLarge => "MILL_TEST",
        }
    }
}

impl fmt::Display for IntensityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a plan is being derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Empty files or directories, one inode each
    MetadataEntries,
    /// Files carrying a [`SMALL_FILE_SIZE`] payload
    SmallFiles,
    /// One file allocated in bulk
    LargeFile,
    /// The AIO target file
    AioFile,
}

/// Concrete size of one workload invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPlan {
    Count(u64),
    Bytes(u64),
}

impl WorkloadPlan {
    /// Item count or byte size, whichever the plan holds.
    pub fn amount(&self) -> u64 {
        match *self {
            WorkloadPlan::Count(n) | WorkloadPlan::Bytes(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.amount() == 0
    }

    /// Round a byte plan down to a multiple of `block`.
    pub fn align_down(self, block: u64) -> Self {
        match self {
            WorkloadPlan::Bytes(n) if block > 0 => WorkloadPlan::Bytes(n - n % block),
            other => other,
        }
    }
}

/// Derive a plan from a tier and a capacity snapshot.
pub fn plan(tier: IntensityTier, kind: WorkloadKind, snapshot: &CapacitySnapshot) -> WorkloadPlan {
    match kind {
        WorkloadKind::MetadataEntries => {
            let free = snapshot.free_inodes;
            WorkloadPlan::Count(match tier {
                IntensityTier::Exhaustive => free,
                IntensityTier::Quick => QUICK_COUNT.min(free),
                IntensityTier::BoundedLarge => BOUNDED_COUNT.min(free),
            })
        }
        WorkloadKind::SmallFiles => {
            let fit = snapshot.free_bytes() / SMALL_FILE_SIZE;
            let count = match tier {
                IntensityTier::Exhaustive => fit / 2,
                IntensityTier::Quick => QUICK_COUNT.min(fit),
                IntensityTier::BoundedLarge => BOUNDED_COUNT.min(fit / 2),
            };
            WorkloadPlan::Count(count.min(snapshot.free_inodes))
        }
        WorkloadKind::LargeFile => byte_plan(tier, BOUNDED_LARGE_FILE, snapshot),
        WorkloadKind::AioFile => byte_plan(tier, BOUNDED_AIO_FILE, snapshot),
    }
}

fn byte_plan(tier: IntensityTier, ceiling: u64, snapshot: &CapacitySnapshot) -> WorkloadPlan {
    let free = snapshot.free_bytes();
    WorkloadPlan::Bytes(match tier {
        IntensityTier::Exhaustive => free,
        IntensityTier::Quick => QUICK_BYTES.min(free),
        // Leave half the free blocks for engine bookkeeping when the
        // ceiling doesn't fit.
        IntensityTier::BoundedLarge if ceiling > free => {
            (snapshot.free_blocks / 2).saturating_mul(snapshot.block_size)
        }
        IntensityTier::BoundedLarge => ceiling,
    })
}

/// Live capacity queries against the engine under test.
pub struct CapacityOracle;

impl CapacityOracle {
    /// Take a fresh snapshot.
    pub fn snapshot(engine: &mut dyn StorageEngine) -> Result<CapacitySnapshot, WorkloadError> {
        engine.capacity().map_err(WorkloadError::Capacity)
    }

    /// Take a fresh snapshot and derive the plan for `kind` from it.
    pub fn plan(
        engine: &mut dyn StorageEngine,
        tier: IntensityTier,
        kind: WorkloadKind,
    ) -> Result<(CapacitySnapshot, WorkloadPlan), WorkloadError> {
        let snapshot = Self::snapshot(engine)?;
        let plan = plan(tier, kind, &snapshot);
        debug!(
            "CapacityOracle::plan tier={} kind={:?} snapshot={:?} -> {:?}",
            tier, kind, snapshot, plan
        );
        Ok((snapshot, plan))
    }
}
