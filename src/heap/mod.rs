/*!
 * Allocation Path
 * The heap window reservation and the public alloc/realloc/free surface
 *
 * Allocations come out of a reserved 3 GiB window as read-only anonymous
 * mappings. Read-only is essential: the first write to any page traps into
 * the fault handler, which is how the layer learns a page went live.
 */

use crate::core::errors::{HeapError, InitError, LayerError, MapError};
use crate::core::limits::HEAP_WINDOW_BYTES;
use crate::core::types::{round_up_to_page, Address, PageIndex, Size};
use crate::layer::Layer;
use crate::policy::PolicyEvent;
use crate::shared::counters::release_deltas;
use crate::sys;
use log::{debug, warn};
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The reserved per-process heap window. Regions are carved from a bump
/// cursor; freed ranges return to the inaccessible reserved state and
/// their addresses are not recycled.
pub struct HeapWindow {
    base: Address,
    len: Size,
    cursor: AtomicUsize,
    page_size: Size,
}

impl HeapWindow {
    /// Probe the mapping-growth direction with two throwaway pages, then
    /// reserve the 3 GiB window near them
    pub fn reserve(page_size: Size) -> Result<Self, InitError> {
        let probe_a = sys::probe_page(page_size)?;
        let probe_b = sys::probe_page(page_size)?;
        let grows_down = probe_b < probe_a;
        unsafe {
            let _ = sys::unmap(probe_a, page_size);
            let _ = sys::unmap(probe_b, page_size);
        }

        // place the window so it contains both probe addresses
        let hint = if grows_down {
            probe_a
                .checked_add(page_size)
                .and_then(|top| top.checked_sub(HEAP_WINDOW_BYTES))
        } else {
            Some(probe_a.min(probe_b))
        };
        let base = sys::reserve(hint, HEAP_WINDOW_BYTES)?;
        debug!(
            "reserved {HEAP_WINDOW_BYTES} byte heap window at {base:#x} (heap grows {})",
            if grows_down { "down" } else { "up" }
        );

        Ok(Self {
            base,
            len: HEAP_WINDOW_BYTES,
            // frame 0 of the backing file is the canonical zero page;
            // page index 0 is never handed out
            cursor: AtomicUsize::new(page_size),
            page_size,
        })
    }

    pub fn base(&self) -> Address {
        self.base
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    /// Stable page index used to address the shared bitmaps
    #[inline]
    pub fn page_index(&self, addr: Address) -> PageIndex {
        debug_assert!(self.contains(addr));
        (addr - self.base) / self.page_size
    }

    /// Byte offset of `addr` in the window, which is also its offset in
    /// the backing file's frame section
    #[inline]
    pub fn offset(&self, addr: Address) -> Size {
        debug_assert!(self.contains(addr));
        addr - self.base
    }

    /// Carve a page-rounded read-only span out of the reservation
    pub fn carve(&self, size: Size) -> Result<Address, LayerError> {
        let start = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cursor| {
                cursor.checked_add(size).filter(|end| *end <= self.len)
            })
            .map_err(|cursor| HeapError::WindowExhausted {
                requested: size,
                remaining: self.len - cursor,
            })?;
        let addr = self.base + start;
        unsafe { sys::carve_ro(addr, size) }?;
        Ok(addr)
    }

    /// Return a carved span to the reserved state
    pub fn release(&self, addr: Address, size: Size) -> Result<(), MapError> {
        unsafe { sys::release_fixed(addr, size) }
    }
}

impl Layer {
    /// Allocate a read-only, demand-paged region of at least `size` bytes.
    /// Returns None before the runtime hook has fired (unless standalone
    /// operation was declared), after finalization, when the mapping limit
    /// is near, or when the window is exhausted; the caller falls through
    /// to the small-object allocator.
    pub fn alloc(&self, size: Size) -> Option<Address> {
        if size == 0 || !self.is_operational() || self.is_finalized() {
            return None;
        }
        let _errno = sys::ErrnoGuard::new();
        if sys::near_map_limit(1) {
            warn!("close to the kernel map limit, declining allocation");
            return None;
        }

        let rounded = round_up_to_page(size, self.page_size);
        // the policy may run a merge pass before the region exists
        self.consult_policy(PolicyEvent::Alloc);

        let base = match self.window.carve(rounded) {
            Ok(base) => base,
            Err(err) => {
                warn!("allocation of {rounded} bytes failed: {err}");
                return None;
            }
        };
        self.index
            .lock()
            .insert(base, rounded, self.capture_provenance());
        debug!("allocated {rounded} bytes at {base:#x}");
        Some(base)
    }

    /// Grow (or keep) a region. If the existing region already fits, the
    /// address is returned unchanged; otherwise allocate, copy, free.
    /// Returns None for addresses this layer does not own.
    pub fn realloc(&self, addr: Address, size: Size) -> Option<Address> {
        if !self.is_operational() {
            return None;
        }
        let _errno = sys::ErrnoGuard::new();
        let old_size = self.index.lock().find_exact(addr);
        if old_size == 0 {
            return None;
        }
        if old_size >= size {
            return Some(addr);
        }

        let new_addr = self.alloc(size)?;
        // the copy write-faults each destination page; the handler
        // privatizes them one by one
        unsafe {
            std::ptr::copy_nonoverlapping(
                addr as *const u8,
                new_addr as *mut u8,
                old_size.min(size),
            );
        }
        if let Err(err) = self.free(addr) {
            warn!("realloc could not free the old region: {err}");
        }
        Some(new_addr)
    }

    /// Size of the region starting exactly at `addr`, 0 if unknown
    pub fn size_of(&self, addr: Address) -> Size {
        if !self.is_operational() {
            return 0;
        }
        self.index.lock().find_exact(addr)
    }

    /// Free a region previously returned by [`alloc`](Self::alloc).
    /// Unwinds each page's share of the node counters, clears its holder
    /// and per-process bits, and returns the range to the reserved state.
    pub fn free(&self, addr: Address) -> Result<(), HeapError> {
        if !self.is_operational() {
            return Err(HeapError::NotOwned(addr));
        }
        let _errno = sys::ErrnoGuard::new();
        let size = self.index.lock().remove(addr);
        if size == 0 {
            return Err(HeapError::NotOwned(addr));
        }

        {
            let counters = self.arena.counters();
            let bitmap = self.arena.bitmap();
            let rank = self.arena.rank();
            let _guard = self.mutex.lock();

            for offset in (0..size).step_by(self.page_size) {
                let page = self.window.page_index(addr + offset);
                if !self.initialized.clear_and_return(page) {
                    continue;
                }
                counters.unmerged_pages().fetch_sub(1, Ordering::SeqCst);

                if self.zero.clear_and_return(page) {
                    self.zero_count.fetch_sub(1, Ordering::SeqCst);
                } else if bitmap.holds(page, rank) {
                    let (shared_delta, private_delta) = release_deltas(bitmap.sharers(page));
                    counters
                        .shared_pages()
                        .fetch_add(shared_delta, Ordering::SeqCst);
                    counters
                        .private_pages()
                        .fetch_add(private_delta, Ordering::SeqCst);
                    bitmap.clear(page, rank);
                } else {
                    counters.private_pages().fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        if let Err(err) = self.window.release(addr, size) {
            warn!("could not release {size} bytes at {addr:#x}: {err}");
        }
        debug!("freed {size} bytes at {addr:#x}");
        self.consult_policy(PolicyEvent::Free);
        Ok(())
    }

    fn capture_provenance(&self) -> Option<Arc<Backtrace>> {
        if self.config.enable_backtrace {
            Some(Arc::new(Backtrace::force_capture()))
        } else {
            None
        }
    }
}
