/*!
 * Write-Fault Handler
 * Privatizes read-only pages on first modification
 *
 * The handler runs synchronously on the faulting thread, takes only the
 * node mutex (sem_wait is async-signal-safe), allocates nothing, and
 * restores errno before returning to the faulting instruction, which the
 * kernel then reissues against a now-writable page.
 */

use crate::config::MergeMode;
use crate::core::errors::InitError;
use crate::core::types::{page_align_down, Address};
use crate::layer::{self, Layer};
use crate::shared::counters::privatize_deltas;
use crate::sys;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::Ordering;

/// `SEGV_ACCERR` (fault on access to a mapped but permission-denied page).
/// Not exposed by the `libc` crate for Linux targets; value matches the
/// kernel's `siginfo.h` definition.
const SEGV_ACCERR: libc::c_int = 2;

/// Install the SIGSEGV and SIGBUS dispositions
pub fn install() -> Result<(), InitError> {
    let segv = SigAction::new(
        SigHandler::SigAction(on_segv),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGSEGV, &segv) }
        .map_err(|errno| InitError::Handlers { errno })?;

    let bus = SigAction::new(
        SigHandler::SigAction(on_bus),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGBUS, &bus) }.map_err(|errno| InitError::Handlers { errno })?;
    Ok(())
}

/// Re-raise `signo` with the default disposition so the process dies the
/// way the kernel intended (core dump and all)
fn escalate(signo: libc::c_int, msg: &[u8]) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::signal(signo, libc::SIG_DFL);
        libc::raise(signo);
        libc::abort();
    }
}

extern "C" fn on_segv(signo: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let (fault, code) = unsafe { ((*info).si_addr() as Address, (*info).si_code) };

    let Some(layer) = layer::get() else {
        escalate(signo, b"pagemerge: segfault before layer init\n");
    };
    if code != SEGV_ACCERR {
        // reads of unmapped memory are a programming error, not a
        // deduplication state
        escalate(signo, b"pagemerge: non-write protection fault\n");
    }
    if !layer.window_contains(fault) {
        escalate(signo, b"pagemerge: write fault outside the heap window\n");
    }

    layer.on_write_fault(fault);
    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

extern "C" fn on_bus(signo: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    escalate(signo, b"pagemerge: bus error\n");
}

impl Layer {
    pub(crate) fn window_contains(&self, addr: Address) -> bool {
        self.window.contains(addr)
    }

    /// Transition the faulted page out of its read-only state. Runs in
    /// signal context: no heap allocation, no lock but the node mutex.
    pub(crate) fn on_write_fault(&self, fault: Address) {
        let addr = page_align_down(fault, self.page_size);
        let page = self.window.page_index(addr);
        let counters = self.arena.counters();

        // leave a hint for the merge engine, and catch writes to pages the
        // index does not know (use-after-free, stray pointers)
        match self.policy.mode() {
            MergeMode::DirtyBuffer => self.policy.note_fault(addr),
            mode => {
                // the dirty flag is a hint; skip it rather than block here
                if let Some(mut index) = self.index.try_lock() {
                    match index.find_containing_mut(addr) {
                        Some(region) if mode != MergeMode::Disabled => region.dirty = true,
                        Some(_) => {}
                        None => {
                            drop(index);
                            escalate(
                                libc::SIGSEGV,
                                b"pagemerge: write fault on unallocated page\n",
                            );
                        }
                    }
                }
            }
        }

        if !self.initialized.set_and_return(page) {
            // first touch: the page becomes private and the hypothetical
            // passthrough footprint grows with it
            {
                let _guard = self.mutex.lock();
                counters.private_pages().fetch_add(1, Ordering::SeqCst);
                counters.unmerged_pages().fetch_add(1, Ordering::SeqCst);
            }
            if unsafe { sys::protect_rw(addr, self.page_size) }.is_err() {
                escalate(libc::SIGSEGV, b"pagemerge: cannot upgrade page to read-write\n");
            }
            return;
        }

        let was_zero = self.zero.clear_and_return(page);
        let guard = self.mutex.lock();

        if was_zero {
            counters.private_pages().fetch_add(1, Ordering::SeqCst);
            self.zero_count.fetch_sub(1, Ordering::SeqCst);
            // MAP_FIXED replaces the zero-frame mapping with fresh zeroed
            // pages in one step; no unmapped window exists
            if unsafe { sys::map_anon_rw(Some(addr), self.page_size, true) }.is_err() {
                // release the cohort before dying
                drop(guard);
                escalate(libc::SIGSEGV, b"pagemerge: cannot privatize zero page\n");
            }
        } else if self.arena.bitmap().holds(page, self.arena.rank()) {
            self.arena.bitmap().clear(page, self.arena.rank());
            let remaining = self.arena.bitmap().sharers(page);
            let (shared_delta, private_delta) = privatize_deltas(remaining);
            counters
                .shared_pages()
                .fetch_add(shared_delta, Ordering::SeqCst);
            counters
                .private_pages()
                .fetch_add(private_delta, Ordering::SeqCst);

            // copy the shared contents to a staging page, then swap it
            // onto the fault address in place
            let staging = match unsafe { sys::map_anon_rw(None, self.page_size, false) } {
                Ok(staging) => staging,
                Err(_) => {
                    drop(guard);
                    escalate(libc::SIGSEGV, b"pagemerge: cannot stage private copy\n");
                }
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    addr as *const u8,
                    staging as *mut u8,
                    self.page_size,
                );
                if sys::remap_fixed(staging, self.page_size, addr).is_err() {
                    drop(guard);
                    escalate(libc::SIGSEGV, b"pagemerge: cannot remap private copy\n");
                }
            }
        } else {
            // initialized but neither zero nor shared: the mapping state
            // and the bitmaps disagree
            drop(guard);
            escalate(libc::SIGSEGV, b"pagemerge: page state invariant violated\n");
        }
    }
}
