//! Core mask parsing and single-core pinning

use std::fmt;
use std::str::FromStr;

use log::info;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::config::ConfigError;

/// CPU core mask given in hex, with or without a `0x` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreMask(u64);

impl CoreMask {
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn core_count(&self) -> u32 {
        self.0.count_ones()
    }

    /// The one core the mask selects.
    ///
    /// Masks naming no core or more than one core are refused; the harness
    /// only runs single-threaded on a single core.
    pub fn single_core(&self) -> Result<usize, ConfigError> {
        match self.core_count() {
            0 => Err(ConfigError::EmptyCoreMask),
            1 => Ok(self.0.trailing_zeros() as usize),
            count => Err(ConfigError::MultiCore {
                mask: self.0,
                count,
            }),
        }
    }
}

impl Default for CoreMask {
    fn default() -> Self {
        Self(0x1)
    }
}

impl FromStr for CoreMask {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u64::from_str_radix(digits, 16)
            .map(CoreMask)
            .map_err(|_| ConfigError::InvalidCoreMask(s.to_string()))
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Restrict the calling thread to `core`.
pub fn pin_to_core(core: usize) -> Result<(), ConfigError> {
    let mut set = CpuSet::new();
    set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    info!("Pinned to core {}", core);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sched::sched_getaffinity;
    use serial_test::serial;

    #[test]
    fn test_parse_hex() {
        assert_eq!("0x1".parse::<CoreMask>().unwrap().bits(), 1);
        assert_eq!("0X10".parse::<CoreMask>().unwrap().bits(), 16);
        assert_eq!("ff".parse::<CoreMask>().unwrap().bits(), 255);
        assert!(matches!(
            "0xzz".parse::<CoreMask>(),
            Err(ConfigError::InvalidCoreMask(_))
        ));
        assert!("".parse::<CoreMask>().is_err());
    }

    #[test]
    fn test_single_core() {
        assert_eq!(CoreMask::new(0x1).single_core().unwrap(), 0);
        assert_eq!(CoreMask::new(0x8).single_core().unwrap(), 3);
        assert!(matches!(
            CoreMask::new(0x3).single_core(),
            Err(ConfigError::MultiCore { mask: 3, count: 2 })
        ));
        assert!(matches!(
            CoreMask::new(0).single_core(),
            Err(ConfigError::EmptyCoreMask)
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(CoreMask::default().to_string(), "0x1");
    }

    #[test]
    #[serial]
    fn test_pin_to_allowed_core() {
        let pid = Pid::from_raw(0);
        let original = sched_getaffinity(pid).unwrap();
        let core = (0..CpuSet::count())
            .find(|&c| original.is_set(c).unwrap_or(false))
            .unwrap();

        pin_to_core(core).unwrap();
        let pinned = sched_getaffinity(pid).unwrap();
        assert!(pinned.is_set(core).unwrap());

        sched_setaffinity(pid, &original).unwrap();
    }
}
