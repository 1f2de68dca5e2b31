/*!
 * Configuration
 * Environment-variable knobs controlling merge policy and diagnostics
 */

use crate::core::errors::InitError;
use crate::core::limits::{DEFAULT_MEMORY_THRESHOLD_MB, DEFAULT_MERGE_FREQUENCY, DEFAULT_SEM_KEY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When the merge engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Never merge; pages stay private after first touch
    Disabled,
    /// Merge every `merge_frequency` allocations
    AllocFrequency,
    /// Merge when private + shared pages exceed a self-adjusting threshold
    MemoryThreshold,
    /// Fault handler buffers dirty page addresses; merge drains a full buffer
    DirtyBuffer,
}

impl MergeMode {
    /// Decode the `MERGE_METRIC` environment value
    pub fn from_metric(metric: i64) -> Option<Self> {
        match metric {
            0 => Some(Self::Disabled),
            1 => Some(Self::AllocFrequency),
            2 => Some(Self::MemoryThreshold),
            3 => Some(Self::DirtyBuffer),
            _ => None,
        }
    }
}

/// Layer configuration, normally built from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `MERGE_METRIC`: 0 disabled, 1 alloc-frequency, 2 threshold, 3 buffered
    pub merge_mode: MergeMode,
    /// `MIN_MEM_TH`: minimum node memory in MB before threshold merging starts
    pub memory_threshold_mb: u64,
    /// `MALLOC_MERGE_FREQ`: allocations between passes in frequency mode
    pub merge_frequency: u64,
    /// `ENABLE_BACKTRACE`: capture an allocation call-stack on each region
    pub enable_backtrace: bool,
    /// `NOT_MPI_APP`: allow startup without a parallel-runtime init hook
    pub standalone: bool,
    /// `SEM_KEY`: key from which the semaphore and backing-file names derive
    pub sem_key: u32,
    /// Directory receiving the per-sibling memusage statistics file
    pub stats_dir: PathBuf,
    /// Footprint probe for the external small-object heap; reported as the
    /// local-heap column of the statistics file
    #[serde(skip)]
    pub local_heap_probe: Option<fn() -> usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            merge_mode: MergeMode::AllocFrequency,
            memory_threshold_mb: DEFAULT_MEMORY_THRESHOLD_MB,
            merge_frequency: DEFAULT_MERGE_FREQUENCY,
            enable_backtrace: false,
            standalone: false,
            sem_key: DEFAULT_SEM_KEY,
            stats_dir: PathBuf::from("."),
            local_heap_probe: None,
        }
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64, InitError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<i64>()
            .map_err(|_| InitError::Config(format!("{name}={value} is not an integer"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Build a configuration from the documented environment variables
    pub fn from_env() -> Result<Self, InitError> {
        let metric = env_i64("MERGE_METRIC", 1)?;
        let merge_mode = MergeMode::from_metric(metric)
            .ok_or_else(|| InitError::Config(format!("MERGE_METRIC={metric} out of range")))?;

        let config = Self {
            merge_mode,
            memory_threshold_mb: env_i64("MIN_MEM_TH", DEFAULT_MEMORY_THRESHOLD_MB as i64)? as u64,
            merge_frequency: env_i64("MALLOC_MERGE_FREQ", DEFAULT_MERGE_FREQUENCY as i64)? as u64,
            enable_backtrace: env_i64("ENABLE_BACKTRACE", 0)? != 0,
            standalone: env_i64("NOT_MPI_APP", 0)? != 0,
            sem_key: env_i64("SEM_KEY", DEFAULT_SEM_KEY as i64)? as u32,
            stats_dir: PathBuf::from("."),
            local_heap_probe: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check the knobs before the layer starts
    pub fn validate(&self) -> Result<(), InitError> {
        if self.memory_threshold_mb == 0 || self.memory_threshold_mb >= 100_000 {
            return Err(InitError::Config(format!(
                "MIN_MEM_TH={} MB outside (0, 100000)",
                self.memory_threshold_mb
            )));
        }
        if self.merge_frequency == 0 {
            return Err(InitError::Config(
                "MALLOC_MERGE_FREQ must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Threshold converted from MB to pages, as the policy consumes it
    pub fn threshold_pages(&self, page_size: usize) -> i64 {
        (self.memory_threshold_mb as i64) * (1_000_000 / page_size as i64)
    }

    /// Name of the node-wide backing file for this cohort
    pub fn shm_name(&self) -> String {
        format!("/pagemerge.{}", self.sem_key)
    }

    /// Name of the node-wide semaphore for this cohort
    pub fn sem_name(&self) -> String {
        format!("/pagemerge-sem.{}", self.sem_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    #[test]
    fn test_merge_mode_decoding() {
        assert_eq!(MergeMode::from_metric(0), Some(MergeMode::Disabled));
        assert_eq!(MergeMode::from_metric(1), Some(MergeMode::AllocFrequency));
        assert_eq!(MergeMode::from_metric(2), Some(MergeMode::MemoryThreshold));
        assert_eq!(MergeMode::from_metric(3), Some(MergeMode::DirtyBuffer));
        assert_eq!(MergeMode::from_metric(4), None);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        for name in [
            "MERGE_METRIC",
            "MIN_MEM_TH",
            "MALLOC_MERGE_FREQ",
            "ENABLE_BACKTRACE",
            "NOT_MPI_APP",
            "SEM_KEY",
        ] {
            std::env::remove_var(name);
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.merge_mode, MergeMode::AllocFrequency);
        assert_eq!(config.memory_threshold_mb, 10);
        assert_eq!(config.merge_frequency, 1000);
        assert!(!config.enable_backtrace);
        assert!(!config.standalone);
        assert_eq!(config.sem_key, 1234);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("MERGE_METRIC", "2");
        std::env::set_var("MIN_MEM_TH", "25");
        std::env::set_var("MALLOC_MERGE_FREQ", "50");
        std::env::set_var("SEM_KEY", "777");
        let config = Config::from_env().unwrap();
        assert_eq!(config.merge_mode, MergeMode::MemoryThreshold);
        assert_eq!(config.memory_threshold_mb, 25);
        assert_eq!(config.merge_frequency, 50);
        assert_eq!(config.sem_key, 777);
        assert_eq!(config.shm_name(), "/pagemerge.777");
        assert_eq!(config.sem_name(), "/pagemerge-sem.777");
        for name in ["MERGE_METRIC", "MIN_MEM_TH", "MALLOC_MERGE_FREQ", "SEM_KEY"] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_metric() {
        std::env::set_var("MERGE_METRIC", "9");
        assert!(Config::from_env().is_err());
        std::env::remove_var("MERGE_METRIC");
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let config = Config {
            merge_frequency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_pages_conversion() {
        let config = Config {
            memory_threshold_mb: 10,
            ..Config::default()
        };
        assert_eq!(config.threshold_pages(4096), 10 * (1_000_000 / 4096));
    }

    #[test]
    fn test_config_serializes() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("alloc_frequency"));
    }
}
