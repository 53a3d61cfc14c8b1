//! Run configuration
//!
//! Settings come from three layers, later layers winning: built-in defaults,
//! an optional TOML file, and command-line flags. The file lives at
//! `$XDG_CONFIG_HOME/fsregress/config.toml` unless `--config` names another.
//!
//! ```toml
//! tier = "quick"
//! core_mask = "0x1"
//!
//! [engine]
//! kind = "dir"
//! root = "/mnt/scratch"
//!
//! [aio]
//! queue_depth = 64
//! align = "buffered"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::affinity::CoreMask;
use crate::cli::Cli;
use crate::engine::{
    AlignMode, EngineError, EngineKind, HostDirEngine, MemEngine, MemEngineConfig, StorageEngine,
};
use crate::sizing::IntensityTier;
use crate::workloads::aio::{DEFAULT_QUEUE_DEPTH, DEFAULT_SEED};
use crate::workloads::AioSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid test type {0}; expected 1 (max), 2 (quick) or 3 (million)")]
    InvalidTier(i64),

    #[error("Invalid core mask '{0}'")]
    InvalidCoreMask(String),

    #[error("Core mask {mask:#x} selects {count} cores; only a single core is supported")]
    MultiCore { mask: u64, count: u32 },

    #[error("Core mask selects no core")]
    EmptyCoreMask,

    #[error("The dir engine needs a root directory (--root or engine.root)")]
    MissingRoot,

    #[error("Queue depth must be at least 1")]
    InvalidQueueDepth,

    #[error("Block size {0} must be a nonzero power of two")]
    InvalidBlockSize(u64),

    #[error("Failed to set CPU affinity: {0}")]
    Affinity(#[from] nix::Error),

    #[error("Failed to start engine: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub kind: EngineKind,
    pub root: Option<PathBuf>,
    /// Keep the dir engine's scratch directory after the run
    pub keep: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub inodes: u64,
    pub blocks: u64,
    pub block_size: u64,
    pub seed: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        let defaults = MemEngineConfig::default();
        Self {
            inodes: defaults.inodes,
            blocks: defaults.blocks,
            block_size: defaults.block_size,
            seed: defaults.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AioSection {
    pub queue_depth: usize,
    pub align: AlignMode,
    pub seed: u64,
}

impl Default for AioSection {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            align: AlignMode::Direct,
            seed: DEFAULT_SEED,
        }
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub tier: IntensityTier,
    pub core_mask: String,
    pub engine: EngineSection,
    pub memory: MemorySection,
    pub aio: AioSection,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            tier: IntensityTier::default(),
            core_mask: CoreMask::default().to_string(),
            engine: EngineSection::default(),
            memory: MemorySection::default(),
            aio: AioSection::default(),
        }
    }
}

impl HarnessConfig {
    /// Default location of the config file, if a config directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fsregress").join("config.toml"))
    }

    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HarnessConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `explicit` if given, otherwise the default file if it exists,
    /// otherwise the built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Override file values with whatever the command line set.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        if let Some(code) = cli.test_type {
            self.tier = IntensityTier::from_code(i64::from(code))?;
        }
        if let Some(mask) = &cli.core_mask {
            self.core_mask = mask.clone();
        }
        if let Some(kind) = cli.engine {
            self.engine.kind = kind;
        }
        if let Some(root) = &cli.root {
            self.engine.root = Some(root.clone());
        }
        if cli.keep {
            self.engine.keep = true;
        }
        if let Some(depth) = cli.queue_depth {
            self.aio.queue_depth = depth;
        }
        if let Some(seed) = cli.seed {
            self.aio.seed = seed;
        }
        if cli.buffered {
            self.aio.align = AlignMode::Buffered;
        }
        Ok(())
    }

    /// Check everything that can be checked without touching an engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.core_mask()?.single_core()?;
        if self.aio.queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }
        if !self.memory.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidBlockSize(self.memory.block_size));
        }
        if self.engine.kind == EngineKind::Dir && self.engine.root.is_none() {
            return Err(ConfigError::MissingRoot);
        }
        Ok(())
    }

    pub fn core_mask(&self) -> Result<CoreMask, ConfigError> {
        self.core_mask.parse()
    }

    pub fn aio_settings(&self) -> AioSettings {
        AioSettings {
            queue_depth: self.aio.queue_depth,
            align: self.aio.align,
            seed: self.aio.seed,
        }
    }

    pub fn mem_config(&self) -> MemEngineConfig {
        MemEngineConfig {
            inodes: self.memory.inodes,
            blocks: self.memory.blocks,
            block_size: self.memory.block_size,
            seed: self.memory.seed,
            journal: false,
        }
    }

    /// Construct the engine this config selects.
    pub fn build_engine(&self) -> Result<Box<dyn StorageEngine>, ConfigError> {
        match self.engine.kind {
            EngineKind::Memory => Ok(Box::new(MemEngine::new(self.mem_config()))),
            EngineKind::Dir => {
                let root = self.engine.root.as_ref().ok_or(ConfigError::MissingRoot)?;
                let mut engine = HostDirEngine::new(root)?;
                engine.keep_run_dir(self.engine.keep);
                info!("Using scratch directory {}", engine.run_dir().display());
                Ok(Box::new(engine))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        assert_eq!(config.tier, IntensityTier::Quick);
        assert_eq!(config.engine.kind, EngineKind::Memory);
        assert_eq!(config.aio.queue_depth, 128);
        assert_eq!(config.aio.align, AlignMode::Direct);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
tier = "bounded-large"

[engine]
kind = "dir"
root = "/srv/scratch"

[aio]
queue_depth = 32
"#,
        );
        let config = HarnessConfig::load(file.path()).unwrap();
        assert_eq!(config.tier, IntensityTier::BoundedLarge);
        assert_eq!(config.engine.kind, EngineKind::Dir);
        assert_eq!(config.engine.root, Some(PathBuf::from("/srv/scratch")));
        assert_eq!(config.aio.queue_depth, 32);
        assert_eq!(config.aio.seed, DEFAULT_SEED);
        assert_eq!(config.memory, MemorySection::default());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let file = write_config("tyer = \"quick\"\n");
        assert!(matches!(
            HarnessConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            HarnessConfig::load_or_default(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config("tier = \"exhaustive\"\n[aio]\nqueue_depth = 8\n");
        let mut config = HarnessConfig::load(file.path()).unwrap();
        let cli = Cli::try_parse_from([
            "fsregress",
            "-T",
            "2",
            "--queue-depth",
            "16",
            "--buffered",
        ])
        .unwrap();
        config.apply_cli(&cli).unwrap();

        assert_eq!(config.tier, IntensityTier::Quick);
        assert_eq!(config.aio_settings().queue_depth, 16);
        assert_eq!(config.aio_settings().align, AlignMode::Buffered);
    }

    #[test]
    fn test_validate_rejects_multi_core_mask() {
        let config = HarnessConfig {
            core_mask: "0x3".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MultiCore { count: 2, .. })
        ));
    }

    #[test]
    fn test_validate_requires_root_for_dir_engine() {
        let mut config = HarnessConfig::default();
        config.engine.kind = EngineKind::Dir;
        assert!(matches!(config.validate(), Err(ConfigError::MissingRoot)));
    }

    #[test]
    fn test_validate_rejects_zero_queue_depth() {
        let mut config = HarnessConfig::default();
        config.aio.queue_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQueueDepth)
        ));
    }

    #[test]
    fn test_build_engines() {
        let config = HarnessConfig::default();
        assert_eq!(config.build_engine().unwrap().name(), "memory");

        let dir = TempDir::new().unwrap();
        let mut config = HarnessConfig::default();
        config.engine.kind = EngineKind::Dir;
        config.engine.root = Some(dir.path().to_path_buf());
        let engine = config.build_engine().unwrap();
        assert_eq!(engine.name(), "dir");
    }
}
