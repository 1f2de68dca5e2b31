/*!
 * Node Mutex
 * Named POSIX semaphore serializing all shared-metadata mutations
 *
 * Siblings discover the semaphore by its conventional name. sem_wait and
 * sem_post are async-signal-safe, which is why the write-fault handler may
 * take this lock and nothing else.
 */

use crate::core::errors::InitError;
use crate::sys;
use log::debug;
use nix::errno::Errno;
use std::ffi::CString;

pub struct NodeMutex {
    sem: *mut libc::sem_t,
}

// The semaphore handle is a process-shared kernel object; the raw pointer
// is valid for the life of the process once opened.
unsafe impl Send for NodeMutex {}
unsafe impl Sync for NodeMutex {}

impl NodeMutex {
    /// Open (or create, initialized to 1) the node-wide semaphore
    pub fn open(name: &str) -> Result<Self, InitError> {
        let cname = CString::new(name).map_err(|_| InitError::Semaphore {
            name: name.into(),
            errno: Errno::EINVAL,
        })?;

        let mut sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED && Errno::last() == Errno::EEXIST {
            // a sibling created it first, just get it
            sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        }
        if sem == libc::SEM_FAILED {
            return Err(InitError::Semaphore {
                name: name.into(),
                errno: Errno::last(),
            });
        }

        debug!("joined node mutex {name}");
        Ok(Self { sem })
    }

    /// Operation P. Blocks until the node mutex is held.
    pub fn lock(&self) -> NodeGuard<'_> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return NodeGuard { mutex: self };
            }
            if Errno::last() != Errno::EINTR {
                sys::raw_fatal(b"pagemerge: semaphore wait failed\n");
            }
        }
    }

    fn unlock(&self) {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            sys::raw_fatal(b"pagemerge: semaphore post failed\n");
        }
    }

    /// Close this process's handle; the semaphore itself persists until
    /// unlinked
    pub fn close(&self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }

    /// Remove the named semaphore from the node (last sibling out)
    pub fn unlink(name: &str) {
        if let Ok(cname) = CString::new(name) {
            unsafe {
                libc::sem_unlink(cname.as_ptr());
            }
        }
    }
}

/// RAII guard for the node mutex; operation V on drop
pub struct NodeGuard<'a> {
    mutex: &'a NodeMutex,
}

impl Drop for NodeGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
