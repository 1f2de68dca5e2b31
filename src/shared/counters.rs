/*!
 * Shared Counters
 * Node-wide aggregates on the counter page of the backing file
 */

use std::ptr::NonNull;
use std::sync::atomic::AtomicI64;

const ALIVE: usize = 0;
const SHARED_PAGES: usize = 1;
const PRIVATE_PAGES: usize = 2;
const UNMERGED_PAGES: usize = 3;

/// View over the scalar counters at the tail of the backing file. Values
/// read outside the node mutex are hints only; every mutation that governs
/// a state transition happens inside it.
pub struct SharedCounters {
    base: NonNull<AtomicI64>,
}

unsafe impl Send for SharedCounters {}
unsafe impl Sync for SharedCounters {}

impl SharedCounters {
    /// # Safety
    /// `base` must point to an 8-byte-aligned page that stays mapped for
    /// the life of the view.
    pub unsafe fn from_raw(base: *mut u8) -> Self {
        Self {
            base: NonNull::new_unchecked(base as *mut AtomicI64),
        }
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicI64 {
        unsafe { &*self.base.as_ptr().add(index) }
    }

    /// Number of joined siblings
    pub fn alive(&self) -> &AtomicI64 {
        self.slot(ALIVE)
    }

    /// Frames held by two or more siblings (plus the canonical zero frame)
    pub fn shared_pages(&self) -> &AtomicI64 {
        self.slot(SHARED_PAGES)
    }

    /// Privately-backed pages across all siblings; a frame held by exactly
    /// one sibling counts here, not in `shared_pages`
    pub fn private_pages(&self) -> &AtomicI64 {
        self.slot(PRIVATE_PAGES)
    }

    /// Touched pages as a passthrough allocator would count them
    pub fn unmerged_pages(&self) -> &AtomicI64 {
        self.slot(UNMERGED_PAGES)
    }
}

/// Counter deltas `(shared_pages, private_pages)` when this process
/// privatizes a page it held shared, keyed by how many holders remain after
/// its bit is cleared: a single survivor means the frame stops being truly
/// shared.
pub fn privatize_deltas(remaining_sharers: u32) -> (i64, i64) {
    match remaining_sharers {
        0 => (0, 0),
        1 => (-1, 2),
        _ => (0, 1),
    }
}

/// Counter deltas when this process joins a frame already in the backing
/// store, keyed by the holder count before its bit is set: joining a sole
/// holder is what creates a truly shared frame.
pub fn subscribe_deltas(sharers_before: u32) -> (i64, i64) {
    if sharers_before == 1 {
        (1, -2)
    } else {
        (0, -1)
    }
}

/// Counter deltas when this process frees a page it holds shared, keyed by
/// the holder count before its bit is cleared.
pub fn release_deltas(sharers_before: u32) -> (i64, i64) {
    match sharers_before {
        1 => (0, -1),
        2 => (-1, 1),
        _ => (0, 0),
    }
}
