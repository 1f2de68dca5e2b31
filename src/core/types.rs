/*!
 * Core Types
 * Common types used across the deduplication layer
 */

/// Virtual address within this process
pub type Address = usize;

/// Size in bytes
pub type Size = usize;

/// Stable index of a page frame inside the heap window:
/// (address - window base) / page size
pub type PageIndex = usize;

/// Index of a sibling process within the node cohort (bit position in the
/// holder bitmap)
pub type SiblingId = u8;

/// Round `size` up to the next multiple of `page_size`
#[inline]
pub const fn round_up_to_page(size: Size, page_size: Size) -> Size {
    (size + page_size - 1) / page_size * page_size
}

/// Align `addr` down to the containing page boundary
#[inline]
pub const fn page_align_down(addr: Address, page_size: Size) -> Address {
    addr / page_size * page_size
}
