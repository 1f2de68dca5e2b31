/*!
 * Merge Runs
 * Accumulator for contiguous pages headed to the same target state
 *
 * Batching contiguous pages into one remap amortizes the syscall cost that
 * dominates a merge pass.
 */

use crate::core::types::{Address, Size};

/// Target state of an open run. The three categories are mutually
/// exclusive for any one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// All-zero content: remap onto the canonical zero frame
    Zero,
    /// No sibling holds the frame: publish this content to the backing store
    Moveable,
    /// Content equals the existing shared copy: join it
    Shareable,
}

/// A half-open span `[start, end)` of contiguous pages awaiting one
/// batched transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: Address,
    pub end: Address,
    pub kind: RunKind,
}

impl Run {
    pub fn open(start: Address, page_size: Size, kind: RunKind) -> Self {
        Self {
            start,
            end: start + page_size,
            kind,
        }
    }

    pub fn len(&self) -> Size {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn pages(&self, page_size: Size) -> usize {
        self.len() / page_size
    }
}

/// Fold one page's classification into the open run. A page that extends
/// the run (same kind, contiguous) is absorbed; anything else closes the
/// run and opens a new one for the page (or none, when the page stays
/// put). The returned run, if any, must be flushed now.
pub fn fold(
    open: &mut Option<Run>,
    page: Address,
    page_size: Size,
    kind: Option<RunKind>,
) -> Option<Run> {
    if let (Some(run), Some(kind)) = (open.as_mut(), kind) {
        if run.kind == kind && run.end == page {
            run.end = page + page_size;
            return None;
        }
    }
    let closed = open.take();
    *open = kind.map(|kind| Run::open(page, page_size, kind));
    closed
}
