/*!
 * Error Types
 * Centralized error handling with thiserror
 */

use super::types::{Address, Size};
use nix::errno::Errno;
use thiserror::Error;

/// Initialization failures. All of these are fatal with a diagnostic; the
/// layer never starts half-joined.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("failed to open backing file {name}: {errno}")]
    BackingFile { name: String, errno: Errno },

    #[error("failed to size backing file to {bytes} bytes: {errno}")]
    Truncate { bytes: Size, errno: Errno },

    #[error("failed to open semaphore {name}: {errno}")]
    Semaphore { name: String, errno: Errno },

    #[error("failed to reserve {bytes} byte heap window: {errno}")]
    Reservation { bytes: Size, errno: Errno },

    #[error("cohort is full: sibling index {rank} exceeds bitmap width {width}")]
    CohortFull { rank: u32, width: u32 },

    #[error("failed to install fault handlers: {errno}")]
    Handlers { errno: Errno },

    #[error("unsupported page size {0}")]
    PageSize(Size),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Kernel mapping-layer failures. During a merge pass these abort the
/// current batch and leave the region correct, just less deduplicated.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("kernel refused mapping of {bytes} bytes at {addr:#x}: {errno}")]
    Map {
        addr: Address,
        bytes: Size,
        errno: Errno,
    },

    #[error("map count {count} is within margin of the kernel limit {limit}")]
    NearLimit { count: i64, limit: i64 },
}

/// API-misuse sentinels. Callers fall through to the small-object allocator
/// on these instead of treating them as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("address {0:#x} is not owned by this layer")]
    NotOwned(Address),

    #[error("heap window exhausted: requested {requested} bytes, {remaining} remaining")]
    WindowExhausted { requested: Size, remaining: Size },
}

/// Unified layer error type
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("init error: {0}")]
    Init(#[from] InitError),

    #[error("mapping error: {0}")]
    Map(#[from] MapError),

    #[error("heap error: {0}")]
    Heap(#[from] HeapError),
}

/// Result type for layer operations
pub type LayerResult<T> = std::result::Result<T, LayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_error_display() {
        let err = HeapError::NotOwned(0x7f00_0000);
        assert_eq!(
            err.to_string(),
            "address 0x7f000000 is not owned by this layer"
        );
    }

    #[test]
    fn test_layer_error_from_init() {
        let err: LayerError = InitError::PageSize(123).into();
        assert!(matches!(err, LayerError::Init(InitError::PageSize(123))));
    }

    #[test]
    fn test_near_limit_display() {
        let err = MapError::NearLimit {
            count: 65_000,
            limit: 65_536,
        };
        assert!(err.to_string().contains("65000"));
    }
}
