pub mod commands;

pub use commands::{Cli, USAGE_EXIT};
