//! Single-file bulk allocation

use log::{error, info};

use super::{timed, PhaseStats, RunContext, WorkloadError};
use crate::sizing::{CapacityOracle, WorkloadKind, MIB};

/// Name of the file the allocation workload creates.
pub const ALLOCATION_FILE: &str = "file_allocate_test";

/// Outcome of one allocation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationReport {
    pub requested: u64,
    /// Size the engine reported after allocating
    pub allocated: u64,
    pub allocate: PhaseStats,
    pub delete: PhaseStats,
}

/// Create one file, allocate the planned size in one request, then delete it.
///
/// Returns `Ok(None)` when the plan is empty. The engine is free to clip or
/// round the request; any positive allocated size counts as success.
pub fn run_allocation(ctx: &mut RunContext<'_>) -> Result<Option<AllocationReport>, WorkloadError> {
    let (snapshot, plan) = CapacityOracle::plan(&mut *ctx.engine, ctx.tier, WorkloadKind::LargeFile)?;
    let requested = plan.amount();
    ctx.say(format!(
        "  {}: free space {} MB, allocating {} MB",
        ctx.tier,
        snapshot.free_bytes() / MIB,
        requested / MIB
    ));

    if plan.is_empty() {
        info!("run_allocation: no free space, skipping");
        ctx.say("  nothing to allocate, skipped");
        return Ok(None);
    }

    let engine = &mut *ctx.engine;
    let fh = engine
        .open(ALLOCATION_FILE, true)
        .map_err(WorkloadError::op("create", ALLOCATION_FILE))?;
    engine
        .close(fh)
        .map_err(WorkloadError::op("close", ALLOCATION_FILE))?;

    let (allocated, allocate_time) = timed(|| {
        engine
            .fallocate(ALLOCATION_FILE, 0, requested)
            .map_err(WorkloadError::op("fallocate", ALLOCATION_FILE))?;
        let attr = engine
            .getattr(ALLOCATION_FILE)
            .map_err(WorkloadError::op("getattr", ALLOCATION_FILE))?;
        Ok(attr.size)
    })?;

    if allocated == 0 {
        error!("run_allocation: engine reported zero bytes for {}", ALLOCATION_FILE);
        return Err(WorkloadError::EmptyAllocation {
            target: ALLOCATION_FILE.to_string(),
            requested,
        });
    }
    if allocated < requested {
        info!(
            "run_allocation: engine clipped {} to {} of {} bytes",
            ALLOCATION_FILE, allocated, requested
        );
    }

    let (_, delete_time) = timed(|| {
        engine
            .unlink(ALLOCATION_FILE)
            .map_err(WorkloadError::op("unlink", ALLOCATION_FILE))
    })?;

    let report = AllocationReport {
        requested,
        allocated,
        allocate: PhaseStats::new(allocated, allocate_time),
        delete: PhaseStats::new(allocated, delete_time),
    };
    ctx.say(format!(
        "  requested {} bytes, allocated {} bytes",
        requested, allocated
    ));
    ctx.say(format!(
        "  allocation {:.3} s ({:.2} MB/s), deletion {:.3} s ({:.2} MB/s)",
        allocate_time.as_secs_f64(),
        report.allocate.mb_per_sec(),
        delete_time.as_secs_f64(),
        report.delete.mb_per_sec()
    ));
    Ok(Some(report))
}
