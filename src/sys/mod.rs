/*!
 * Mapping Primitives
 * Thin wrappers over the kernel's virtual-memory calls
 *
 * Every mapping the layer creates or destroys passes through here so the
 * map-count ledger stays accurate; the merge engine consults it to abort
 * batches before the kernel's vm.max_map_count limit is reached.
 */

use crate::core::errors::{InitError, MapError};
use crate::core::limits::{DEFAULT_MAX_MAP_COUNT, MAP_LIMIT_MARGIN};
use crate::core::types::{Address, Size};
use log::warn;
use nix::errno::Errno;
use nix::sys::mman::{
    mmap, mmap_anonymous, mprotect, mremap, munmap, MRemapFlags, MapFlags, ProtFlags,
};
use nix::unistd::{sysconf, SysconfVar};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};

static MAP_COUNT: AtomicI64 = AtomicI64::new(0);
static MAP_LIMIT: AtomicI64 = AtomicI64::new(DEFAULT_MAX_MAP_COUNT);

/// Detect the system page size. The layer refuses pages larger than 1 MiB;
/// the bitmap layout assumes sane frame granularity.
pub fn page_size() -> Result<Size, InitError> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 && sz <= (1 << 20) => Ok(sz as Size),
        Ok(Some(sz)) => Err(InitError::PageSize(sz as Size)),
        _ => Err(InitError::PageSize(0)),
    }
}

/// Read the kernel's mapping limit once at init
pub fn init_map_limit() {
    let limit = std::fs::read_to_string("/proc/sys/vm/max_map_count")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or_else(|| {
            warn!("could not read /proc/sys/vm/max_map_count, assuming {DEFAULT_MAX_MAP_COUNT}");
            DEFAULT_MAX_MAP_COUNT
        });
    MAP_LIMIT.store(limit, Ordering::SeqCst);
}

/// Current ledger value
pub fn map_count() -> i64 {
    MAP_COUNT.load(Ordering::SeqCst)
}

/// The kernel mapping limit read at init
pub fn map_limit() -> i64 {
    MAP_LIMIT.load(Ordering::SeqCst)
}

/// Would `upcoming` additional mappings bring the ledger within the safety
/// margin of the kernel limit?
pub fn near_map_limit(upcoming: i64) -> bool {
    MAP_COUNT.load(Ordering::SeqCst) + upcoming + MAP_LIMIT_MARGIN
        >= MAP_LIMIT.load(Ordering::SeqCst)
}

/// Saves errno at construction and restores it on drop, so the syscalls
/// behind an allocation-path or merge entry point never leak a spurious
/// errno change to the application
pub struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    pub fn new() -> Self {
        Self(unsafe { *libc::__errno_location() })
    }
}

impl Default for ErrnoGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe {
            *libc::__errno_location() = self.0;
        }
    }
}

/// Last-resort exit usable from signal handlers: a raw write(2) of the
/// message, then abort. Never allocates, never takes a lock.
pub fn raw_fatal(msg: &[u8]) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::abort();
    }
}

fn nonzero(len: Size) -> Result<NonZeroUsize, MapError> {
    NonZeroUsize::new(len).ok_or(MapError::Map {
        addr: 0,
        bytes: 0,
        errno: Errno::EINVAL,
    })
}

fn nonnull(addr: Address) -> Result<NonNull<c_void>, MapError> {
    NonNull::new(addr as *mut c_void).ok_or(MapError::Map {
        addr,
        bytes: 0,
        errno: Errno::EINVAL,
    })
}

fn map_err(addr: Address, bytes: Size) -> impl FnOnce(Errno) -> MapError {
    move |errno| MapError::Map { addr, bytes, errno }
}

/// Reserve address space: PROT_NONE, not backed, optionally near `hint`
pub fn reserve(hint: Option<Address>, len: Size) -> Result<Address, InitError> {
    let length = NonZeroUsize::new(len).ok_or(InitError::Reservation {
        bytes: len,
        errno: Errno::EINVAL,
    })?;
    let addr = unsafe {
        mmap_anonymous(
            hint.and_then(NonZeroUsize::new),
            length,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
        )
    }
    .map_err(|errno| InitError::Reservation { bytes: len, errno })?;
    MAP_COUNT.fetch_add(1, Ordering::SeqCst);
    Ok(addr.as_ptr() as Address)
}

/// One read-only probe page, used to learn heap-growth direction at init
pub fn probe_page(page_size: Size) -> Result<Address, InitError> {
    let length = NonZeroUsize::new(page_size).ok_or(InitError::PageSize(0))?;
    let addr = unsafe {
        mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
        )
    }
    .map_err(|errno| InitError::Reservation {
        bytes: page_size,
        errno,
    })?;
    MAP_COUNT.fetch_add(1, Ordering::SeqCst);
    Ok(addr.as_ptr() as Address)
}

/// Carve a read-only anonymous private mapping at a fixed address inside
/// the reserved window. Read-only is what forces the first-write fault.
///
/// # Safety
/// `addr..addr + len` must lie inside this process's reserved heap window.
pub unsafe fn carve_ro(addr: Address, len: Size) -> Result<Address, MapError> {
    let mapped = mmap_anonymous(
        NonZeroUsize::new(addr),
        nonzero(len)?,
        ProtFlags::PROT_READ,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
    )
    .map_err(map_err(addr, len))?;
    MAP_COUNT.fetch_add(1, Ordering::SeqCst);
    Ok(mapped.as_ptr() as Address)
}

/// Return a carved range to the reserved (inaccessible) state
///
/// # Safety
/// `addr..addr + len` must be a range previously carved from the window.
pub unsafe fn release_fixed(addr: Address, len: Size) -> Result<(), MapError> {
    mmap_anonymous(
        NonZeroUsize::new(addr),
        nonzero(len)?,
        ProtFlags::PROT_NONE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE | MapFlags::MAP_FIXED,
    )
    .map_err(map_err(addr, len))?;
    MAP_COUNT.fetch_sub(1, Ordering::SeqCst);
    Ok(())
}

/// Fresh anonymous read-write pages, either floating or replacing the
/// mapping at a fixed address in one step
///
/// # Safety
/// With `fixed`, `addr` must name a mapping owned by this layer.
pub unsafe fn map_anon_rw(
    addr: Option<Address>,
    len: Size,
    fixed: bool,
) -> Result<Address, MapError> {
    let mut flags = MapFlags::MAP_PRIVATE;
    if fixed {
        flags |= MapFlags::MAP_FIXED;
    }
    let target = addr.unwrap_or(0);
    let mapped = mmap_anonymous(
        addr.and_then(NonZeroUsize::new),
        nonzero(len)?,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        flags,
    )
    .map_err(map_err(target, len))?;
    MAP_COUNT.fetch_add(1, Ordering::SeqCst);
    Ok(mapped.as_ptr() as Address)
}

/// Map a span of the shared backing file
///
/// # Safety
/// With `fixed`, `addr` must name a mapping owned by this layer;
/// `file_offset..file_offset + len` must lie inside the backing file.
pub unsafe fn map_shared(
    fd: BorrowedFd<'_>,
    file_offset: Size,
    addr: Option<Address>,
    len: Size,
    prot: ProtFlags,
    fixed: bool,
) -> Result<Address, MapError> {
    let mut flags = MapFlags::MAP_SHARED;
    if fixed {
        flags |= MapFlags::MAP_FIXED;
    }
    let target = addr.unwrap_or(0);
    let mapped = mmap(
        addr.and_then(NonZeroUsize::new),
        nonzero(len)?,
        prot,
        flags,
        fd,
        file_offset as libc::off_t,
    )
    .map_err(map_err(target, len))?;
    MAP_COUNT.fetch_add(1, Ordering::SeqCst);
    Ok(mapped.as_ptr() as Address)
}

/// Replace the mapping at `new` with the one at `old` in a single step.
/// This is the in-place remap primitive: no window of unmapped address
/// exists at `new` during the move.
///
/// # Safety
/// `old` must be a mapping of `len` bytes owned by this layer and `new`
/// must name an existing mapping of at least `len` bytes.
pub unsafe fn remap_fixed(old: Address, len: Size, new: Address) -> Result<Address, MapError> {
    let mapped = mremap(
        nonnull(old)?,
        len,
        len,
        MRemapFlags::MREMAP_MAYMOVE | MRemapFlags::MREMAP_FIXED,
        Some(nonnull(new)?),
    )
    .map_err(map_err(new, len))?;
    // the source mapping is consumed by the move
    MAP_COUNT.fetch_sub(1, Ordering::SeqCst);
    Ok(mapped.as_ptr() as Address)
}

/// Drop a mapping entirely
///
/// # Safety
/// `addr..addr + len` must be a mapping owned by this layer.
pub unsafe fn unmap(addr: Address, len: Size) -> Result<(), MapError> {
    munmap(nonnull(addr)?, len).map_err(map_err(addr, len))?;
    MAP_COUNT.fetch_sub(1, Ordering::SeqCst);
    Ok(())
}

/// Make a range read-only
///
/// # Safety
/// `addr..addr + len` must be a mapping owned by this layer.
pub unsafe fn protect_ro(addr: Address, len: Size) -> Result<(), MapError> {
    mprotect(nonnull(addr)?, len, ProtFlags::PROT_READ).map_err(map_err(addr, len))
}

/// Make a range read-write
///
/// # Safety
/// `addr..addr + len` must be a mapping owned by this layer.
pub unsafe fn protect_rw(addr: Address, len: Size) -> Result<(), MapError> {
    mprotect(
        nonnull(addr)?,
        len,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    )
    .map_err(map_err(addr, len))
}
