use clap::Parser;
use std::path::PathBuf;

use crate::engine::EngineKind;

/// Exit status for command-line usage errors (`EX_USAGE` in sysexits.h).
pub const USAGE_EXIT: i32 = 64;

const USAGE_NOTES: &str = "\
Test types:
  -T: test type (e.g., 1: max_test, 2: quick_test, 3: million test)

Only a single core may be selected with --core-mask.";

/// fsregress - Capacity-aware regression harness for storage engines
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None, after_help = USAGE_NOTES)]
pub struct Cli {
    /// Optional log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Test type: 1 = max test, 2 = quick test, 3 = million test
    #[arg(short = 'T', long = "test-type", value_name = "TYPE",
          value_parser = clap::value_parser!(u8).range(1..=3))]
    pub test_type: Option<u8>,

    /// CPU core mask in hex; exactly one bit must be set (default: 0x1)
    #[arg(short = 'c', long, value_name = "HEX")]
    pub core_mask: Option<String>,

    /// Storage engine to drive
    #[arg(long, value_enum)]
    pub engine: Option<EngineKind>,

    /// Root directory for the dir engine
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Configuration file (default: $XDG_CONFIG_HOME/fsregress/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Maximum outstanding AIO requests
    #[arg(long, value_name = "N")]
    pub queue_depth: Option<usize>,

    /// Seed for random AIO order
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Use buffered instead of direct AIO
    #[arg(long)]
    pub buffered: bool,

    /// Keep the dir engine's scratch directory after the run
    #[arg(long)]
    pub keep: bool,

    /// List the registered test cases and exit
    #[arg(long)]
    pub list: bool,
}
