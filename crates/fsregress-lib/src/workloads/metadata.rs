//! Create, verify and delete cycles over many named entries
//!
//! A run works over `count` entries named `<prefix><i>` in three strictly
//! ordered phases, each timed on its own:
//!
//! 1. create every entry
//! 2. look every entry up
//! 3. delete every entry
//!
//! The first failure aborts the run. Entries created before the failure are
//! left in place.

use log::{error, info};

use super::{timed, PhaseStats, RunContext, WorkloadError};
use crate::engine::{EngineError, EntryKind, StorageEngine};
use crate::progress::ProgressTracker;
use crate::sizing::{CapacityOracle, WorkloadKind, SMALL_FILE_SIZE};

/// What kind of entry a metadata run creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    /// Empty files, created with open and closed right away
    File,
    Directory,
    /// Files holding one small payload each
    SmallFile,
}

impl EntryClass {
    pub fn prefix(self) -> &'static str {
        match self {
            EntryClass::File => "file",
            EntryClass::Directory => "dir",
            EntryClass::SmallFile => "smallfile",
        }
    }

    /// Name of the entry with ordinal `index`.
    pub fn entry_name(self, index: u64) -> String {
        format!("{}{}", self.prefix(), index)
    }

    fn noun(self) -> &'static str {
        match self {
            EntryClass::File => "files",
            EntryClass::Directory => "directories",
            EntryClass::SmallFile => "small files",
        }
    }

    fn sizing_kind(self) -> WorkloadKind {
        match self {
            EntryClass::File | EntryClass::Directory => WorkloadKind::MetadataEntries,
            EntryClass::SmallFile => WorkloadKind::SmallFiles,
        }
    }

    fn create(self, engine: &mut dyn StorageEngine, name: &str) -> Result<(), WorkloadError> {
        match self {
            EntryClass::File => {
                let fh = engine
                    .open(name, true)
                    .map_err(WorkloadError::op("create", name))?;
                engine.close(fh).map_err(WorkloadError::op("close", name))
            }
            EntryClass::Directory => engine.mkdir(name).map_err(WorkloadError::op("mkdir", name)),
            EntryClass::SmallFile => engine
                .mkfile(name, SMALL_FILE_SIZE)
                .map_err(WorkloadError::op("mkfile", name)),
        }
    }

    fn verify(self, engine: &mut dyn StorageEngine, name: &str) -> Result<(), WorkloadError> {
        let attr = engine.getattr(name).map_err(|e| match e {
            EngineError::NotFound(_) => WorkloadError::Verification {
                target: name.to_string(),
                reason: "entry not found".to_string(),
            },
            other => WorkloadError::op("getattr", name)(other),
        })?;

        let expected_kind = match self {
            EntryClass::Directory => EntryKind::Directory,
            EntryClass::File | EntryClass::SmallFile => EntryKind::File,
        };
        if attr.kind != expected_kind {
            return Err(WorkloadError::Verification {
                target: name.to_string(),
                reason: format!("expected {:?}, found {:?}", expected_kind, attr.kind),
            });
        }
        if self == EntryClass::SmallFile && attr.size != SMALL_FILE_SIZE {
            return Err(WorkloadError::Verification {
                target: name.to_string(),
                reason: format!("size {} != {}", attr.size, SMALL_FILE_SIZE),
            });
        }
        Ok(())
    }

    fn delete(self, engine: &mut dyn StorageEngine, name: &str) -> Result<(), WorkloadError> {
        match self {
            EntryClass::Directory => engine.rmdir(name).map_err(WorkloadError::op("rmdir", name)),
            EntryClass::File | EntryClass::SmallFile => {
                engine.unlink(name).map_err(WorkloadError::op("unlink", name))
            }
        }
    }
}

/// Timings of one metadata run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataReport {
    pub count: u64,
    pub create: PhaseStats,
    pub lookup: PhaseStats,
    pub delete: PhaseStats,
}

type Step = fn(EntryClass, &mut dyn StorageEngine, &str) -> Result<(), WorkloadError>;

/// Run the create, lookup and delete phases for `class`.
pub fn run_metadata(
    ctx: &mut RunContext<'_>,
    class: EntryClass,
) -> Result<MetadataReport, WorkloadError> {
    let (snapshot, plan) = CapacityOracle::plan(&mut *ctx.engine, ctx.tier, class.sizing_kind())?;
    let count = plan.amount();
    ctx.say(format!(
        "  {}: free inodes {}, free blocks {}, creating {} {}",
        ctx.tier,
        snapshot.free_inodes,
        snapshot.free_blocks,
        count,
        class.noun()
    ));

    let mut report = MetadataReport {
        count,
        ..Default::default()
    };
    if count == 0 {
        info!("run_metadata: nothing to do for {}", class.noun());
        return Ok(report);
    }

    report.create = run_phase(ctx, class, count, "create", EntryClass::create)?;
    report.lookup = run_phase(ctx, class, count, "lookup", EntryClass::verify)?;
    report.delete = run_phase(ctx, class, count, "delete", EntryClass::delete)?;
    Ok(report)
}

fn run_phase(
    ctx: &mut RunContext<'_>,
    class: EntryClass,
    count: u64,
    label: &str,
    step: Step,
) -> Result<PhaseStats, WorkloadError> {
    info!("run_metadata: {} {} {}", label, count, class.noun());

    let engine = &mut *ctx.engine;
    let mut progress = ProgressTracker::new(&mut *ctx.out);
    let (_, elapsed) = timed(|| {
        for i in 0..count {
            let name = class.entry_name(i);
            if let Err(e) = step(class, &mut *engine, &name) {
                error!("run_metadata: {} aborted at {}: {}", label, name, e);
                return Err(e);
            }
            progress.report(i, count);
        }
        Ok(())
    })?;
    drop(progress);

    let stats = PhaseStats::new(count, elapsed);
    ctx.say(format!(
        "  {} {} {} in {:.3} s ({:.0} ops/s)",
        label,
        count,
        class.noun(),
        elapsed.as_secs_f64(),
        stats.per_sec()
    ));
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOp, MemEngine};
    use crate::sizing::IntensityTier;
    use crate::workloads::AioSettings;

    fn run(engine: &mut MemEngine, class: EntryClass) -> Result<MetadataReport, WorkloadError> {
        let mut out = Vec::new();
        let mut ctx = RunContext::new(engine, IntensityTier::Quick, AioSettings::default(), &mut out);
        run_metadata(&mut ctx, class)
    }

    #[test]
    fn test_entry_names() {
        assert_eq!(EntryClass::File.entry_name(0), "file0");
        assert_eq!(EntryClass::Directory.entry_name(42), "dir42");
        assert_eq!(EntryClass::SmallFile.entry_name(7), "smallfile7");
    }

    #[test]
    fn test_directories_round_trip() {
        let mut engine = MemEngine::with_capacity(1000, 1000, 4096);
        let report = run(&mut engine, EntryClass::Directory).unwrap();
        assert_eq!(report.count, 100);
        assert_eq!(engine.entry_count(), 0);

        let mkdirs = engine
            .journal()
            .entries()
            .iter()
            .filter(|e| matches!(e.op(), EngineOp::Mkdir { .. }))
            .count();
        assert_eq!(mkdirs, 100);
    }

    #[test]
    fn test_small_files_round_trip() {
        let mut engine = MemEngine::with_capacity(1000, 1000, 4096);
        let report = run(&mut engine, EntryClass::SmallFile).unwrap();
        assert_eq!(report.count, 100);
        assert_eq!(engine.used_blocks(), 0);
    }

    #[test]
    fn test_small_files_bounded_by_blocks() {
        let mut engine = MemEngine::with_capacity(1000, 10, 4096);
        let report = run(&mut engine, EntryClass::SmallFile).unwrap();
        assert_eq!(report.count, 10);
    }

    #[test]
    fn test_create_failure_leaves_created_entries() {
        // A directory already holds the name of the last file
        let mut engine = MemEngine::with_capacity(100, 1000, 4096);
        let mut out = Vec::new();
        let mut ctx = RunContext::new(
            &mut engine,
            IntensityTier::Quick,
            AioSettings::default(),
            &mut out,
        );
        ctx.engine.mkdir("file99").unwrap();

        let err = run_phase(&mut ctx, EntryClass::File, 100, "create", EntryClass::create)
            .unwrap_err();
        assert_eq!(err.code(), 3);
        drop(ctx);
        assert_eq!(engine.entry_count(), 100);
    }

    #[test]
    fn test_missing_entry_fails_verification() {
        let mut engine = MemEngine::with_capacity(10, 10, 4096);
        let err = EntryClass::File.verify(&mut engine, "file0").unwrap_err();
        assert_eq!(err.code(), 4);
    }

    #[test]
    fn test_kind_mismatch_fails_verification() {
        let mut engine = MemEngine::with_capacity(10, 10, 4096);
        engine.mkdir("file0").unwrap();
        assert!(matches!(
            EntryClass::File.verify(&mut engine, "file0"),
            Err(WorkloadError::Verification { .. })
        ));
    }

    #[test]
    fn test_zero_capacity_issues_no_operations() {
        let mut engine = MemEngine::with_capacity(0, 0, 4096);
        let report = run(&mut engine, EntryClass::File).unwrap();
        assert_eq!(report.count, 0);
        assert!(engine
            .journal()
            .entries()
            .iter()
            .all(|e| !e.op().is_mutation()));
    }
}
