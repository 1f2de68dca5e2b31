/*!
 * Shared Metadata Arena
 * Process-shared backing file: page frames, holder bitmap, counters
 *
 * Layout of the single backing file per node:
 * - `[0, 3 GiB)` the deduplicated page frames; frame *i* at offset
 *   `i * page_size`, frame 0 the canonical zero page
 * - `[3 GiB, 3 GiB + 3 MiB)` the holder bitmap
 * - one page of scalar counters after that
 */

pub mod bitmap;
pub mod counters;
pub mod mutex;

pub use bitmap::{HolderBitmap, HolderWidth, PageFlagSet};
pub use counters::SharedCounters;
pub use mutex::{NodeGuard, NodeMutex};

use crate::core::errors::{InitError, MapError};
use crate::core::limits::{
    BACKING_FILE_BYTES, BITMAP_FILE_OFFSET, BITMAP_REGION_BYTES, COUNTER_FILE_OFFSET,
    COUNTER_PAGE_BYTES, HEAP_WINDOW_BYTES,
};
use crate::core::types::{Address, PageIndex, SiblingId, Size};
use crate::sys;
use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::Ordering;

fn backing_err(name: &str) -> impl Fn(MapError) -> InitError + '_ {
    move |err| {
        let errno = match err {
            MapError::Map { errno, .. } => errno,
            MapError::NearLimit { .. } => Errno::ENOMEM,
        };
        InitError::BackingFile {
            name: name.to_string(),
            errno,
        }
    }
}

/// The node's shared metadata: the backing file plus this sibling's views
/// of the zero frame, the holder bitmap, and the counter page
pub struct SharedArena {
    fd: OwnedFd,
    name: String,
    page_size: Size,
    width: HolderWidth,
    rank: SiblingId,
    zero_view: Address,
    bitmap_view: Address,
    counters_view: Address,
    bitmap: HolderBitmap,
    counters: SharedCounters,
}

impl SharedArena {
    /// Join (or create) the node's shared metadata. Serialized by the node
    /// mutex, so sibling index assignment cannot race. The first joiner
    /// truncates the file to full size, which zero-fills the frames,
    /// bitmap, and counters in one stroke.
    pub fn join(
        name: &str,
        width: HolderWidth,
        page_size: Size,
        mutex: &NodeMutex,
    ) -> Result<Self, InitError> {
        let _guard = mutex.lock();

        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let (fd, first) = match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode)
        {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => {
                let fd = shm_open(name, OFlag::O_RDWR, mode).map_err(|errno| {
                    InitError::BackingFile {
                        name: name.to_string(),
                        errno,
                    }
                })?;
                (fd, false)
            }
            Err(errno) => {
                return Err(InitError::BackingFile {
                    name: name.to_string(),
                    errno,
                })
            }
        };

        if first {
            ftruncate(&fd, BACKING_FILE_BYTES as libc::off_t).map_err(|errno| {
                InitError::Truncate {
                    bytes: BACKING_FILE_BYTES,
                    errno,
                }
            })?;
            debug!("initialized backing file {name} ({BACKING_FILE_BYTES} bytes)");
        }

        // frame 0 is the canonical zero page, read-only from everyone's
        // point of view; truncation already zero-filled it
        let zero_view = unsafe {
            sys::map_shared(
                fd.as_fd(),
                0,
                None,
                page_size,
                ProtFlags::PROT_READ,
                false,
            )
        }
        .map_err(backing_err(name))?;

        let bitmap_view = unsafe {
            sys::map_shared(
                fd.as_fd(),
                BITMAP_FILE_OFFSET,
                None,
                BITMAP_REGION_BYTES,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                false,
            )
        }
        .map_err(backing_err(name))?;

        let counters_view = unsafe {
            sys::map_shared(
                fd.as_fd(),
                COUNTER_FILE_OFFSET,
                None,
                COUNTER_PAGE_BYTES,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                false,
            )
        }
        .map_err(backing_err(name))?;

        let frames = HEAP_WINDOW_BYTES / page_size;
        let bitmap = unsafe { HolderBitmap::from_raw(bitmap_view as *mut u8, width, frames) };
        let counters = unsafe { SharedCounters::from_raw(counters_view as *mut u8) };

        if first {
            counters.alive().store(1, Ordering::SeqCst);
            // the zero frame is shared from the start
            counters.shared_pages().store(1, Ordering::SeqCst);
            counters.private_pages().store(0, Ordering::SeqCst);
            counters.unmerged_pages().store(0, Ordering::SeqCst);
        } else {
            counters.alive().fetch_add(1, Ordering::SeqCst);
        }

        let alive = counters.alive().load(Ordering::SeqCst);
        let rank = (alive - 1) as u32;
        if rank >= width.max_siblings() {
            counters.alive().fetch_sub(1, Ordering::SeqCst);
            return Err(InitError::CohortFull {
                rank,
                width: width.max_siblings(),
            });
        }

        info!(
            "joined cohort {name} as sibling {rank} ({alive} alive, bitmap width {})",
            width.max_siblings()
        );

        Ok(Self {
            fd,
            name: name.to_string(),
            page_size,
            width,
            rank: rank as SiblingId,
            zero_view,
            bitmap_view,
            counters_view,
            bitmap,
            counters,
        })
    }

    pub fn rank(&self) -> SiblingId {
        self.rank
    }

    pub fn width(&self) -> HolderWidth {
        self.width
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn bitmap(&self) -> &HolderBitmap {
        &self.bitmap
    }

    pub fn counters(&self) -> &SharedCounters {
        &self.counters
    }

    /// Read-only view of the canonical zero frame
    pub fn zero_frame(&self) -> *const u8 {
        self.zero_view as *const u8
    }

    /// Backing-file offset of a page frame
    #[inline]
    pub fn frame_offset(&self, frame: PageIndex) -> Size {
        frame * self.page_size
    }

    /// Detach this sibling and return whether it was the last one out, in
    /// which case the node-persistent file was emptied and unlinked.
    /// The arena's views are gone afterwards; callers must not touch the
    /// bitmap or counters again.
    pub fn detach(&self, mutex: &NodeMutex) -> bool {
        let remaining = {
            let _guard = mutex.lock();
            self.counters.alive().fetch_sub(1, Ordering::SeqCst) - 1
        };

        unsafe {
            let _ = sys::unmap(self.counters_view, COUNTER_PAGE_BYTES);
            let _ = sys::unmap(self.bitmap_view, BITMAP_REGION_BYTES);
            let _ = sys::unmap(self.zero_view, self.page_size);
        }

        if remaining == 0 {
            let _ = ftruncate(&self.fd, 0);
            let _ = shm_unlink(self.name.as_str());
            info!("last sibling out, removed backing file {}", self.name);
            true
        } else {
            debug!("detached from {}, {remaining} siblings remain", self.name);
            false
        }
    }
}
