//! Queue-depth-bounded asynchronous block I/O
//!
//! One AIO run writes the whole target file block by block and then reads it
//! back, both through an [`AioQueue`]. At most `queue_depth` requests are
//! outstanding at any time. Each completion frees a slot for the next offset,
//! and a phase ends only once every submitted request has completed.
//!
//! Offsets come from [`BlockOffsets`], either in order or as a seeded
//! permutation generated one element at a time. Memory use is constant in the
//! size of the target.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use super::{AioFault, PhaseStats, RunContext, WorkloadError};
use crate::engine::{AioDirection, AioQueue, AioRequest, AlignMode, EngineError, StorageEngine};
use crate::progress::ProgressTracker;
use crate::sizing::{CapacityOracle, WorkloadKind, MIB};

/// Name of the AIO target file.
pub const AIO_FILE: &str = "aio_test_file";

pub const DEFAULT_QUEUE_DEPTH: usize = 128;
pub const DEFAULT_SEED: u64 = 0x5eed_f00d;

/// Order in which block offsets are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPattern {
    Sequential,
    Random,
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPattern::Sequential => write!(f, "sequential"),
            AccessPattern::Random => write!(f, "random"),
        }
    }
}

/// Pipeline settings shared by every AIO case of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioSettings {
    pub queue_depth: usize,
    pub align: AlignMode,
    /// Seed for random offset order
    pub seed: u64,
}

impl Default for AioSettings {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            align: AlignMode::Direct,
            seed: DEFAULT_SEED,
        }
    }
}

/// Block-aligned offsets covering `[0, blocks * block_size)`, each exactly once.
pub struct BlockOffsets {
    block_size: u64,
    blocks: u64,
    emitted: u64,
    order: Order,
}

enum Order {
    Sequential,
    Random(Permutation),
}

/// Full-period LCG over `[0, 2^k)` with cycle walking.
///
/// With modulus `2^k`, an increment that is odd and a multiplier that is
/// `1 mod 4` visit every residue exactly once per period. XOR with a fixed
/// mask below `2^k` keeps that a bijection. Values at or above `blocks` are
/// skipped, which leaves a permutation of `[0, blocks)`. The modulus is the
/// next power of two, so on average less than one value is skipped per block.
struct Permutation {
    state: u64,
    mask: u64,
    multiplier: u64,
    increment: u64,
    scramble: u64,
}

impl Permutation {
    fn new(blocks: u64, seed: u64) -> Self {
        let mask = blocks.max(1).next_power_of_two() - 1;
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            state: rng.random::<u64>() & mask,
            mask,
            multiplier: ((rng.random::<u64>() << 2) | 1) & mask,
            increment: (rng.random::<u64>() | 1) & mask,
            scramble: rng.random::<u64>() & mask,
        }
    }

    fn step(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(self.multiplier)
            .wrapping_add(self.increment)
            & self.mask;
        self.state ^ self.scramble
    }
}

impl BlockOffsets {
    pub fn new(pattern: AccessPattern, blocks: u64, block_size: u64, seed: u64) -> Self {
        let order = match pattern {
            AccessPattern::Sequential => Order::Sequential,
            AccessPattern::Random => Order::Random(Permutation::new(blocks, seed)),
        };
        Self {
            block_size,
            blocks,
            emitted: 0,
            order,
        }
    }

    /// Number of offsets still to come.
    pub fn remaining(&self) -> u64 {
        self.blocks - self.emitted
    }
}

impl Iterator for BlockOffsets {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.emitted == self.blocks {
            return None;
        }
        let blocks = self.blocks;
        let block = match &mut self.order {
            Order::Sequential => self.emitted,
            Order::Random(permutation) => loop {
                let candidate = permutation.step();
                if candidate < blocks {
                    break candidate;
                }
            },
        };
        self.emitted += 1;
        Some(block * self.block_size)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining()).ok();
        (remaining.unwrap_or(usize::MAX), remaining)
    }
}

/// Result of one pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub requests: u64,
    /// Bytes transferred, timed over the whole phase
    pub stats: PhaseStats,
    /// Most requests outstanding at once
    pub max_in_flight: usize,
}

/// Drives one direction of block I/O through an [`AioQueue`] with a bounded
/// window of outstanding requests.
#[derive(Debug, Clone, Copy)]
pub struct AioPipeline {
    queue_depth: usize,
    block_size: u32,
}

impl AioPipeline {
    pub fn new(queue_depth: usize, block_size: u32) -> Result<Self, WorkloadError> {
        if queue_depth == 0 {
            return Err(WorkloadError::InvalidArgument(
                "queue depth must be at least 1".to_string(),
            ));
        }
        if block_size == 0 {
            return Err(WorkloadError::InvalidArgument(
                "block size must be positive".to_string(),
            ));
        }
        Ok(Self {
            queue_depth,
            block_size,
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Issue every offset once and wait for all of them.
    ///
    /// After the first failed request no new requests are submitted; the
    /// requests already in flight are drained before the phase fails.
    pub fn run_phase(
        &self,
        queue: &mut dyn AioQueue,
        mut offsets: BlockOffsets,
        direction: AioDirection,
        path: &str,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<PhaseOutcome, WorkloadError> {
        let total = offsets.remaining();
        let mut pending: HashMap<u64, u64> = HashMap::with_capacity(self.queue_depth);
        let mut next_tag = 0u64;
        let mut completed = 0u64;
        let mut max_in_flight = 0usize;
        let mut failure: Option<AioFault> = None;

        progress.reset();
        let start = Instant::now();

        loop {
            while failure.is_none() && pending.len() < self.queue_depth {
                let Some(offset) = offsets.next() else {
                    break;
                };
                let request = AioRequest {
                    tag: next_tag,
                    offset,
                    len: self.block_size,
                };
                next_tag += 1;
                match queue.submit(request) {
                    Ok(()) => {
                        pending.insert(request.tag, offset);
                        max_in_flight = max_in_flight.max(pending.len());
                    }
                    Err(source) => failure = Some(AioFault::Submit { offset, source }),
                }
            }

            if pending.is_empty() {
                break;
            }

            let batch = match queue.reap() {
                Ok(batch) => batch,
                Err(e) => {
                    // Nothing more can be drained once reaping itself fails
                    warn!(
                        "AioPipeline: reap failed with {} requests in flight",
                        pending.len()
                    );
                    note(&mut failure, AioFault::Reap(e));
                    break;
                }
            };
            if batch.is_empty() {
                std::thread::yield_now();
                continue;
            }

            for completion in batch {
                let Some(offset) = pending.remove(&completion.tag) else {
                    note(&mut failure, AioFault::UnknownTag(completion.tag));
                    continue;
                };
                match completion.result {
                    Ok(done) if done == self.block_size => {
                        progress.report(completed, total);
                        completed += 1;
                    }
                    Ok(done) => note(
                        &mut failure,
                        AioFault::Short {
                            offset,
                            done,
                            expected: self.block_size,
                        },
                    ),
                    Err(source) => note(&mut failure, AioFault::Request { offset, source }),
                }
            }
        }

        let elapsed = start.elapsed();
        if let Some(fault) = failure {
            error!(
                "AioPipeline: {} phase on {} failed after {} of {} requests: {}",
                direction, path, completed, total, fault
            );
            return Err(WorkloadError::Aio {
                direction,
                path: path.to_string(),
                fault,
            });
        }

        debug!(
            "AioPipeline: {} phase done, {} requests, max in flight {}",
            direction, completed, max_in_flight
        );
        Ok(PhaseOutcome {
            requests: completed,
            stats: PhaseStats::new(completed * u64::from(self.block_size), elapsed),
            max_in_flight,
        })
    }
}

/// Keep the first fault; later ones are only logged.
fn note(failure: &mut Option<AioFault>, fault: AioFault) {
    match failure {
        Some(_) => debug!("AioPipeline: further fault while draining: {}", fault),
        None => *failure = Some(fault),
    }
}

/// Outcome of one write-then-read AIO run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioReport {
    pub block_size: u32,
    pub pattern: AccessPattern,
    pub target_size: u64,
    pub write: PhaseOutcome,
    pub read: PhaseOutcome,
}

/// Write the planned target size with `pattern`, read it back the same way,
/// then remove the target.
///
/// Returns `Ok(None)` when the plan holds less than one block. If either
/// phase fails the target is removed before the failure is returned; a
/// failing removal is reported as [`WorkloadError::Cleanup`].
pub fn run_aio(
    ctx: &mut RunContext<'_>,
    block_size: u32,
    pattern: AccessPattern,
) -> Result<Option<AioReport>, WorkloadError> {
    let pipeline = AioPipeline::new(ctx.aio.queue_depth, block_size)?;
    let (_, plan) = CapacityOracle::plan(&mut *ctx.engine, ctx.tier, WorkloadKind::AioFile)?;
    let target_size = plan.align_down(u64::from(block_size)).amount();
    let blocks = target_size / u64::from(block_size);

    ctx.say(format!(
        "  {} {} KB blocks, {} MB target, queue depth {}",
        pattern,
        block_size / 1024,
        target_size / MIB,
        pipeline.queue_depth()
    ));
    if blocks == 0 {
        info!("run_aio: target smaller than one block, skipping");
        ctx.say("  nothing to transfer, skipped");
        return Ok(None);
    }
    if pattern == AccessPattern::Random {
        info!("run_aio: random order seed {:#x}", ctx.aio.seed);
    }

    let write = match run_direction(ctx, &pipeline, AioDirection::Write, pattern, blocks) {
        Ok(outcome) => outcome,
        Err(e) => return Err(remove_after_failure(&mut *ctx.engine, e)),
    };
    let read = match run_direction(ctx, &pipeline, AioDirection::Read, pattern, blocks) {
        Ok(outcome) => outcome,
        Err(e) => return Err(remove_after_failure(&mut *ctx.engine, e)),
    };

    ctx.engine
        .unlink(AIO_FILE)
        .map_err(|source| WorkloadError::Cleanup {
            path: AIO_FILE.to_string(),
            source,
            after: None,
        })?;

    Ok(Some(AioReport {
        block_size,
        pattern,
        target_size,
        write,
        read,
    }))
}

fn run_direction(
    ctx: &mut RunContext<'_>,
    pipeline: &AioPipeline,
    direction: AioDirection,
    pattern: AccessPattern,
    blocks: u64,
) -> Result<PhaseOutcome, WorkloadError> {
    // Distinct orders for the two directions, both derived from the run seed
    let seed = match direction {
        AioDirection::Write => ctx.aio.seed,
        AioDirection::Read => ctx.aio.seed.rotate_left(32) ^ 0x9e37_79b9_7f4a_7c15,
    };
    let offsets = BlockOffsets::new(pattern, blocks, u64::from(pipeline.block_size()), seed);

    let outcome = {
        let mut queue = ctx
            .engine
            .open_aio(AIO_FILE, direction, ctx.aio.align)
            .map_err(|e| WorkloadError::Aio {
                direction,
                path: AIO_FILE.to_string(),
                fault: AioFault::Open(e),
            })?;
        let mut progress = ProgressTracker::new(&mut *ctx.out);
        pipeline.run_phase(queue.as_mut(), offsets, direction, AIO_FILE, &mut progress)?
    };

    ctx.say(format!(
        "  {} {} {} requests in {:.3} s ({:.2} MB/s, max in flight {})",
        direction,
        pattern,
        outcome.requests,
        outcome.stats.elapsed.as_secs_f64(),
        outcome.stats.mb_per_sec(),
        outcome.max_in_flight
    ));
    Ok(outcome)
}

/// Best-effort removal of the target after a failed phase.
fn remove_after_failure(engine: &mut dyn StorageEngine, failure: WorkloadError) -> WorkloadError {
    match engine.unlink(AIO_FILE) {
        Ok(()) | Err(EngineError::NotFound(_)) => failure,
        Err(source) => {
            error!("run_aio: cleanup of {} failed: {}", AIO_FILE, source);
            WorkloadError::Cleanup {
                path: AIO_FILE.to_string(),
                source,
                after: Some(Box::new(failure)),
            }
        }
    }
}
