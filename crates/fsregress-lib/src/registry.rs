//! Test case registry and sequencer
//!
//! A [`Registry`] is an ordered list of [`TestCaseDescriptor`]s fixed before
//! the run starts. The [`Sequencer`] executes them one by one, compares each
//! returned [`Status`] with the case's pass criterion and stops at the first
//! mismatch. Cases marked as ignored run, but their status never stops the
//! run.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{error, info, warn};

use crate::workloads::aio::run_aio;
use crate::workloads::allocation::run_allocation;
use crate::workloads::metadata::run_metadata;
use crate::workloads::{AccessPattern, EntryClass, RunContext, WorkloadError};

/// Exit status of a test case or a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Success,
    Failed(i32),
}

/// Status of a case whose result mismatched a failure criterion by passing.
pub const UNEXPECTED_PASS: i32 = 9;

impl Status {
    pub fn from_result<T>(result: &Result<T, WorkloadError>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(e) => Status::Failed(e.code()),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Failed(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Failed(code) => write!(f, "failed ({})", code),
        }
    }
}

/// Argument handed to a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseArg {
    #[default]
    None,
    Pattern(AccessPattern),
}

/// One runnable test case.
pub trait TestCase {
    fn execute(&self, ctx: &mut RunContext<'_>, arg: &CaseArg) -> Result<(), WorkloadError>;
}

fn expect_no_arg(arg: &CaseArg) -> Result<(), WorkloadError> {
    match arg {
        CaseArg::None => Ok(()),
        other => Err(WorkloadError::InvalidArgument(format!(
            "unexpected argument {:?}",
            other
        ))),
    }
}

/// Create, look up and delete as many entries of one class as the tier allows.
pub struct MetadataCase {
    pub class: EntryClass,
}

impl TestCase for MetadataCase {
    fn execute(&self, ctx: &mut RunContext<'_>, arg: &CaseArg) -> Result<(), WorkloadError> {
        expect_no_arg(arg)?;
        run_metadata(ctx, self.class).map(|_| ())
    }
}

/// Allocate one large file and delete it.
pub struct LargeFileCase;

impl TestCase for LargeFileCase {
    fn execute(&self, ctx: &mut RunContext<'_>, arg: &CaseArg) -> Result<(), WorkloadError> {
        expect_no_arg(arg)?;
        run_allocation(ctx).map(|_| ())
    }
}

/// Write and read back one file with a fixed block size.
pub struct AioCase {
    pub block_size: u32,
}

impl TestCase for AioCase {
    fn execute(&self, ctx: &mut RunContext<'_>, arg: &CaseArg) -> Result<(), WorkloadError> {
        match arg {
            CaseArg::Pattern(pattern) => run_aio(ctx, self.block_size, *pattern).map(|_| ()),
            CaseArg::None => Err(WorkloadError::InvalidArgument(
                "AIO case needs an access pattern".to_string(),
            )),
        }
    }
}

/// Immutable description of one registered case.
pub struct TestCaseDescriptor {
    case: Box<dyn TestCase>,
    name: String,
    arg: CaseArg,
    pass_criterion: Status,
    ignore_result: bool,
}

impl TestCaseDescriptor {
    /// A case expected to succeed.
    pub fn new(name: impl Into<String>, case: impl TestCase + 'static) -> Self {
        Self {
            case: Box::new(case),
            name: name.into(),
            arg: CaseArg::None,
            pass_criterion: Status::Success,
            ignore_result: false,
        }
    }

    pub fn with_arg(mut self, arg: CaseArg) -> Self {
        self.arg = arg;
        self
    }

    /// Status the case must return to pass.
    pub fn expecting(mut self, status: Status) -> Self {
        self.pass_criterion = status;
        self
    }

    /// Run the case without letting its status affect the run.
    pub fn ignored(mut self) -> Self {
        self.ignore_result = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg(&self) -> &CaseArg {
        &self.arg
    }

    pub fn pass_criterion(&self) -> Status {
        self.pass_criterion
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore_result
    }
}

/// Ordered collection of test cases.
#[derive(Default)]
pub struct Registry {
    cases: Vec<TestCaseDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard regression suite.
    pub fn default_suite() -> Self {
        Self::new()
            .register(TestCaseDescriptor::new(
                "Creating Max Number of Files",
                MetadataCase {
                    class: EntryClass::File,
                },
            ))
            .register(TestCaseDescriptor::new(
                "Creating Max Number of Directories",
                MetadataCase {
                    class: EntryClass::Directory,
                },
            ))
            .register(TestCaseDescriptor::new(
                "Creating Maximum Sized Single File",
                LargeFileCase,
            ))
            .register(aio_case(
                "4KB Sequential AIO Read and Write",
                4 * 1024,
                AccessPattern::Sequential,
            ))
            .register(aio_case(
                "4KB Random AIO Read and Write",
                4 * 1024,
                AccessPattern::Random,
            ))
            .register(aio_case(
                "128KB Sequential AIO Read and Write",
                128 * 1024,
                AccessPattern::Sequential,
            ))
            .register(aio_case(
                "128KB Random AIO Read and Write",
                128 * 1024,
                AccessPattern::Random,
            ))
            .register(TestCaseDescriptor::new(
                "Creating 4KB files",
                MetadataCase {
                    class: EntryClass::SmallFile,
                },
            ))
    }

    /// Append a case. Registration happens before the run starts.
    pub fn register(mut self, descriptor: TestCaseDescriptor) -> Self {
        self.cases.push(descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCaseDescriptor> {
        self.cases.iter()
    }
}

fn aio_case(name: &str, block_size: u32, pattern: AccessPattern) -> TestCaseDescriptor {
    TestCaseDescriptor::new(name, AioCase { block_size }).with_arg(CaseArg::Pattern(pattern))
}

/// Outcome of one executed case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseResult {
    /// 1-based position in the registry
    pub index: usize,
    pub name: String,
    pub status: Status,
    pub ignored: bool,
    pub elapsed: Duration,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub started: DateTime<Local>,
    pub results: Vec<CaseResult>,
    /// 1-based index of the first case that failed its criterion
    pub first_failure: Option<usize>,
}

impl RunReport {
    /// Success only if every case met its criterion, otherwise the status of
    /// the first failing case.
    pub fn status(&self) -> Status {
        let Some(index) = self.first_failure else {
            return Status::Success;
        };
        match self.results.iter().find(|r| r.index == index) {
            Some(CaseResult {
                status: Status::Failed(code),
                ..
            }) => Status::Failed(*code),
            _ => Status::Failed(UNEXPECTED_PASS),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status().code()
    }

    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| Some(r.index) != self.first_failure && !r.ignored)
            .count()
    }
}

/// Runs a registry in order with abort-on-first-failure semantics.
pub struct Sequencer<'r> {
    registry: &'r Registry,
}

impl<'r> Sequencer<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    pub fn run(&self, ctx: &mut RunContext<'_>) -> RunReport {
        let mut report = RunReport {
            started: Local::now(),
            results: Vec::with_capacity(self.registry.len()),
            first_failure: None,
        };

        for (i, descriptor) in self.registry.iter().enumerate() {
            let index = i + 1;
            ctx.say(format!(" Regression Test {}: {}", index, descriptor.name()));
            info!("Starting case {} ({})", index, descriptor.name());

            let start = Instant::now();
            let result = descriptor.case.execute(ctx, descriptor.arg());
            let elapsed = start.elapsed();
            let status = Status::from_result(&result);

            if let Err(e) = &result {
                error!("Case {} failed: {}", index, e);
                ctx.say(format!(" {}", e));
                if let WorkloadError::Cleanup {
                    after: Some(cause), ..
                } = e
                {
                    ctx.say(format!(" (cleanup followed: {})", cause));
                }
            }

            report.results.push(CaseResult {
                index,
                name: descriptor.name().to_string(),
                status,
                ignored: descriptor.is_ignored(),
                elapsed,
            });

            if descriptor.is_ignored() {
                warn!("Case {} result ignored: {}", index, status);
                ctx.say(format!(
                    " Regression Test {}: result ignored ({}).",
                    index, status
                ));
                continue;
            }

            if status == descriptor.pass_criterion() {
                ctx.say(format!(" Regression Test {}: passed successfully.", index));
            } else {
                ctx.say(format!(" Failed Regression Test {}.", index));
                report.first_failure = Some(index);
                break;
            }
        }

        report
    }
}
