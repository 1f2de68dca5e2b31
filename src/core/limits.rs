/*!
 * Layout Constants and Defaults
 * Fixed sizes of the heap window and backing file, plus policy defaults
 */

use super::types::Size;

/// Reserved per-process heap window: 3 GiB on 64-bit hosts
pub const HEAP_WINDOW_BYTES: Size = 0x03 << 30;

/// Holder-bitmap section of the backing file: 3 MiB, enough for
/// 3 GiB / 4 KiB = 786 432 frames at 2 bytes per entry
pub const BITMAP_REGION_BYTES: Size = 0x03 << 20;

/// Counter page at the tail of the backing file
pub const COUNTER_PAGE_BYTES: Size = 0x01 << 12;

/// Total backing file size: frames, then bitmap, then counters
pub const BACKING_FILE_BYTES: Size =
    HEAP_WINDOW_BYTES + BITMAP_REGION_BYTES + COUNTER_PAGE_BYTES;

/// File offset of the holder bitmap
pub const BITMAP_FILE_OFFSET: Size = HEAP_WINDOW_BYTES;

/// File offset of the counter page
pub const COUNTER_FILE_OFFSET: Size = HEAP_WINDOW_BYTES + BITMAP_REGION_BYTES;

/// Scratch mapping used by the merge engine for shared-copy comparison
pub const MERGE_SCRATCH_BYTES: Size = 4 * 1024 * 1024;

/// Capacity of the dirty-page buffer in buffered merge mode
pub const DIRTY_BUFFER_CAPACITY: usize = 10_000;

/// Buffered memory-usage snapshots before a forced flush
pub const STAT_BUFFER_CAPACITY: usize = 10_000;

/// Allocations between passes in frequency mode
pub const DEFAULT_MERGE_FREQUENCY: u64 = 1000;

/// Minimum node memory (MB) before threshold mode starts merging
pub const DEFAULT_MEMORY_THRESHOLD_MB: u64 = 10;

/// Consultations between threshold evaluations (oscillation damping)
pub const THRESHOLD_COUNTDOWN: i64 = 100;

/// Default key from which the semaphore and backing-file names derive
pub const DEFAULT_SEM_KEY: u32 = 1234;

/// Fallback when /proc/sys/vm/max_map_count cannot be read
pub const DEFAULT_MAX_MAP_COUNT: i64 = 65_536;

/// Mappings kept in reserve below the kernel limit
pub const MAP_LIMIT_MARGIN: i64 = 128;

/// Largest cohort any bitmap width supports
pub const MAX_SIBLINGS: u32 = 16;
