/*!
 * Merge Engine
 * Scans the allocation index and collapses eligible pages onto shared or
 * zero-backed frames
 *
 * Pages are classified into batched runs so a whole span transitions under
 * one remap. A bounded scratch mapping of the backing file keeps the
 * shared-copy comparison at one remap per 4 MiB window instead of one per
 * page. The node mutex is held per region, never for the whole scan.
 */

pub mod run;

use crate::core::errors::MapError;
use crate::core::limits::{HEAP_WINDOW_BYTES, MERGE_SCRATCH_BYTES};
use crate::core::types::{Address, Size};
use crate::layer::Layer;
use crate::shared::counters::subscribe_deltas;
use crate::shared::SharedArena;
use crate::sys;
use log::{debug, warn};
use nix::sys::mman::ProtFlags;
use run::{fold, Run, RunKind};
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Rolling read-only view of the backing file's frame section, re-mapped
/// one bounded chunk at a time as the scan advances
struct ScratchWindow<'a> {
    arena: &'a SharedArena,
    base: Address,
    file_offset: Size,
    len: Size,
}

impl<'a> ScratchWindow<'a> {
    fn new(arena: &'a SharedArena) -> Self {
        Self {
            arena,
            base: 0,
            file_offset: 0,
            len: 0,
        }
    }

    /// Pointer to the shared frame contents at `file_offset`
    fn frame(&mut self, file_offset: Size, page_size: Size) -> Result<*const u8, MapError> {
        let miss = self.len == 0
            || file_offset < self.file_offset
            || file_offset + page_size > self.file_offset + self.len;
        if miss {
            self.close();
            let len = MERGE_SCRATCH_BYTES.min(HEAP_WINDOW_BYTES - file_offset);
            self.base = unsafe {
                sys::map_shared(
                    self.arena.fd(),
                    file_offset,
                    None,
                    len,
                    ProtFlags::PROT_READ,
                    false,
                )
            }?;
            self.file_offset = file_offset;
            self.len = len;
        }
        Ok((self.base + (file_offset - self.file_offset)) as *const u8)
    }

    fn close(&mut self) {
        if self.len > 0 {
            unsafe {
                let _ = sys::unmap(self.base, self.len);
            }
            self.len = 0;
        }
    }
}

impl Drop for ScratchWindow<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Byte-wise page comparison
///
/// # Safety
/// Both pointers must be readable for `page_size` bytes.
unsafe fn page_equals(a: *const u8, b: *const u8, page_size: Size) -> bool {
    std::slice::from_raw_parts(a, page_size) == std::slice::from_raw_parts(b, page_size)
}

fn near_limit_error() -> MapError {
    MapError::NearLimit {
        count: sys::map_count(),
        limit: sys::map_limit(),
    }
}

impl Layer {
    /// One merge pass: walk the allocation index in order and merge every
    /// dirty region, clearing its flag. Halts early when the kernel's
    /// mapping limit is being approached; the remaining regions stay
    /// dirty and correct, just less deduplicated.
    pub fn merge_pass(&self) {
        let _errno = sys::ErrnoGuard::new();
        let started = Instant::now();
        self.record_stats();

        let mut merged = 0usize;
        let mut halted = false;
        let mut index = self.index.lock();
        index.traverse(|region| {
            if halted || !region.dirty {
                return;
            }
            match self.merge_region(region.base, region.size) {
                Ok(()) => {
                    region.dirty = false;
                    merged += 1;
                }
                Err(err) => {
                    warn!("merge pass halted: {err}");
                    halted = true;
                }
            }
        });
        drop(index);

        self.record_stats();
        debug!(
            "merge pass processed {merged} dirty regions in {:?}",
            started.elapsed()
        );
    }

    /// Merge the regions named by the buffered dirty pages (buffered
    /// policy mode). Repeat hits on one region are deduplicated.
    pub(crate) fn drain_dirty_buffer(&self) {
        let pages = self.policy.take_buffer();
        if pages.is_empty() {
            return;
        }
        self.record_stats();

        let index = self.index.lock();
        let mut targets: Vec<(Address, Size)> = pages
            .iter()
            .filter_map(|page| index.find_containing(*page))
            .map(|region| (region.base, region.size))
            .collect();
        targets.sort_unstable();
        targets.dedup();

        for (base, size) in targets {
            if let Err(err) = self.merge_region(base, size) {
                warn!("buffered merge halted: {err}");
                break;
            }
        }
        drop(index);
        self.record_stats();
    }

    /// Classify every page of one region and flush batched transitions.
    /// Holds the node mutex for the duration of the region.
    pub(crate) fn merge_region(&self, base: Address, size: Size) -> Result<(), MapError> {
        let page_size = self.page_size;
        let rank = self.arena.rank();
        let bitmap = self.arena.bitmap();
        let zero_frame = self.arena.zero_frame();

        let _guard = self.mutex.lock();
        let mut scratch = ScratchWindow::new(&self.arena);
        let mut open: Option<Run> = None;

        for addr in (base..base + size).step_by(page_size) {
            if sys::near_map_limit(2) {
                if let Some(closed) = open.take() {
                    self.flush_run(&closed)?;
                }
                return Err(near_limit_error());
            }

            let page = self.window.page_index(addr);
            let kind = if !self.initialized.test(page)
                || self.zero.test(page)
                || bitmap.holds(page, rank)
            {
                // never written, or already deduplicated
                None
            } else if unsafe { page_equals(addr as *const u8, zero_frame, page_size) } {
                Some(RunKind::Zero)
            } else if bitmap.sharers(page) == 0 {
                Some(RunKind::Moveable)
            } else {
                let shared = scratch.frame(self.window.offset(addr), page_size)?;
                if unsafe { page_equals(addr as *const u8, shared, page_size) } {
                    Some(RunKind::Shareable)
                } else {
                    // diverged from the shared copy: stays private
                    None
                }
            };

            if let Some(closed) = fold(&mut open, addr, page_size, kind) {
                self.flush_run(&closed)?;
            }
        }

        if let Some(closed) = open.take() {
            self.flush_run(&closed)?;
        }
        Ok(())
    }

    /// Transition every page of a closed run to its target state. Called
    /// with the node mutex held.
    fn flush_run(&self, run: &Run) -> Result<(), MapError> {
        let page_size = self.page_size;
        let counters = self.arena.counters();
        let bitmap = self.arena.bitmap();
        let rank = self.arena.rank();

        match run.kind {
            RunKind::Zero => {
                // every page maps the single zero frame, so this is one
                // syscall per page by necessity
                for addr in (run.start..run.end).step_by(page_size) {
                    if sys::near_map_limit(1) {
                        return Err(near_limit_error());
                    }
                    unsafe {
                        sys::map_shared(
                            self.arena.fd(),
                            0,
                            Some(addr),
                            page_size,
                            ProtFlags::PROT_READ,
                            true,
                        )
                    }?;
                    self.zero.set(self.window.page_index(addr));
                    self.zero_count.fetch_add(1, Ordering::SeqCst);
                    counters.private_pages().fetch_sub(1, Ordering::SeqCst);
                }
            }
            RunKind::Moveable => {
                // publish: copy the private content into the backing
                // store, then swap the shared mapping onto the region
                let len = run.len();
                let staging = unsafe {
                    sys::map_shared(
                        self.arena.fd(),
                        self.window.offset(run.start),
                        None,
                        len,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        false,
                    )
                }?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        run.start as *const u8,
                        staging as *mut u8,
                        len,
                    );
                }
                if let Err(err) = unsafe { sys::remap_fixed(staging, len, run.start) } {
                    let _ = unsafe { sys::unmap(staging, len) };
                    return Err(err);
                }
                for addr in (run.start..run.end).step_by(page_size) {
                    // sole holder: the page stays counted private
                    bitmap.set(self.window.page_index(addr), rank);
                }
                unsafe { sys::protect_ro(run.start, len) }?;
            }
            RunKind::Shareable => {
                // join: map the backing frames over the region in place
                let len = run.len();
                unsafe {
                    sys::map_shared(
                        self.arena.fd(),
                        self.window.offset(run.start),
                        Some(run.start),
                        len,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        true,
                    )
                }?;
                for addr in (run.start..run.end).step_by(page_size) {
                    let page = self.window.page_index(addr);
                    let (shared_delta, private_delta) = subscribe_deltas(bitmap.sharers(page));
                    counters
                        .shared_pages()
                        .fetch_add(shared_delta, Ordering::SeqCst);
                    counters
                        .private_pages()
                        .fetch_add(private_delta, Ordering::SeqCst);
                    bitmap.set(page, rank);
                }
                unsafe { sys::protect_ro(run.start, len) }?;
            }
        }
        debug!(
            "flushed {:?} run of {} pages at {:#x}",
            run.kind,
            run.pages(page_size),
            run.start
        );
        Ok(())
    }
}
