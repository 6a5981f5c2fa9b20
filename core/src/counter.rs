//! The live-endpoint counter: one signed count of monitored endpoints,
//! shared by every process in the group.
//!
//! The count lives in a file-backed `MAP_SHARED` mapping and is serialized
//! with `lockf` record locks on the same backing file, so unrelated
//! processes in the group observe one consistent value without a central
//! coordinator. The backing file is created unlinked; the fd is inherited
//! across fork and, because it is opened without `O_CLOEXEC`, across exec;
//! a re-exec'd image finds the fd number in [`COUNTER_FD_ENV`] and remaps it.
//!
//! When an unregister drains the count to zero the monitored workload has
//! fully exited and the group is terminated with a non-error message.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::ptr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use retguard_protocol::env::COUNTER_FD_ENV;

use crate::group::Terminate;

type Count = i64;

/// Handle to the shared endpoint count.
pub struct LiveCounter {
    fd: libc::c_int,
    cell: *mut Count,
    group: Arc<dyn Terminate>,
}

// SAFETY: the mapping is shared memory by construction and every access to
// the cell happens under the file lock.
unsafe impl Send for LiveCounter {}
unsafe impl Sync for LiveCounter {}

impl LiveCounter {
    /// Create the shared counter. Called once by the monitor, before
    /// anything forks.
    pub fn create(group: Arc<dyn Terminate>) -> io::Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "retguard-rc-{}-{:x}",
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0),
        ));
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // Deliberately no O_CLOEXEC: children must inherit this fd across
        // both fork and exec.
        // SAFETY: c_path is a valid NUL-terminated path.
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // The fd keeps the file alive; the name does not need to.
        // SAFETY: same valid path.
        unsafe { libc::unlink(c_path.as_ptr()) };

        // SAFETY: fd is a fresh regular file we own.
        if unsafe { libc::ftruncate(fd, std::mem::size_of::<Count>() as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: closing the fd we just opened.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let counter = match Self::map(fd, group) {
            Ok(counter) => counter,
            Err(e) => {
                // SAFETY: closing the fd we opened above.
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        // SAFETY: the cell maps a file region we just sized.
        unsafe { ptr::write_volatile(counter.cell, 0) };
        Ok(counter)
    }

    /// Reattach to the counter created by the monitor, in a process that
    /// inherited the fd across exec.
    pub fn from_env(group: Arc<dyn Terminate>) -> io::Result<Self> {
        let value = std::env::var(COUNTER_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, COUNTER_FD_ENV))?;
        let fd: libc::c_int = value.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{COUNTER_FD_ENV} is not a file descriptor: `{value}`"),
            )
        })?;
        Self::from_fd(fd, group)
    }

    /// Reattach to an already-sized counter file by fd. Takes ownership of
    /// the descriptor.
    pub fn from_fd(fd: libc::c_int, group: Arc<dyn Terminate>) -> io::Result<Self> {
        Self::map(fd, group)
    }

    fn map(fd: libc::c_int, group: Arc<dyn Terminate>) -> io::Result<Self> {
        // SAFETY: mapping a file region the creator sized; MAP_SHARED makes
        // every mapping in the group alias the same cell.
        let cell = unsafe {
            libc::mmap(
                ptr::null_mut(),
                std::mem::size_of::<Count>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if cell == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(LiveCounter {
            fd,
            cell: cell as *mut Count,
            group,
        })
    }

    /// The descriptor to advertise in [`COUNTER_FD_ENV`] for spawned targets.
    pub fn raw_fd(&self) -> libc::c_int {
        self.fd
    }

    /// A new monitored endpoint came up.
    pub fn register(&self) {
        let Some(lock) = self.lock() else { return };
        // SAFETY: the cell maps live shared memory; we hold the lock.
        let now = unsafe {
            let v = ptr::read_volatile(self.cell) + 1;
            ptr::write_volatile(self.cell, v);
            v
        };
        debug!("endpoint registered, {now} live");
        drop(lock);
    }

    /// A monitored endpoint went away. Draining the count to zero terminates
    /// the group: the workload has fully exited.
    pub fn unregister(&self) {
        let Some(lock) = self.lock() else { return };
        // SAFETY: as in register.
        let now = unsafe {
            let v = ptr::read_volatile(self.cell) - 1;
            ptr::write_volatile(self.cell, v);
            v
        };
        debug!("endpoint unregistered, {now} live");
        if now <= 0 {
            drop(lock);
            self.group
                .terminate("monitored workload has exited; live endpoint count reached zero", false);
        }
    }

    /// Current count, for diagnostics and the child-exit watcher.
    pub fn value(&self) -> Count {
        let Some(_lock) = self.lock() else { return 0 };
        // SAFETY: the cell maps live shared memory; we hold the lock.
        unsafe { ptr::read_volatile(self.cell) }
    }

    /// Take the cross-process lock. On syscall failure the group is
    /// terminated; `None` is only ever seen under a test double.
    fn lock(&self) -> Option<CounterLock<'_>> {
        // SAFETY: locking a regular-file fd we own; offset stays at zero, so
        // length 0 covers the whole file.
        if unsafe { libc::lockf(self.fd, libc::F_LOCK, 0) } != 0 {
            let err = io::Error::last_os_error();
            self.group
                .terminate(&format!("endpoint counter lock failed: {err}"), true);
            return None;
        }
        Some(CounterLock { counter: self })
    }
}

impl Drop for LiveCounter {
    fn drop(&mut self) {
        // SAFETY: unmapping and closing resources this value owns.
        unsafe {
            libc::munmap(self.cell as *mut libc::c_void, std::mem::size_of::<Count>());
            libc::close(self.fd);
        }
    }
}

/// Holds the `lockf` region lock; released on drop.
struct CounterLock<'a> {
    counter: &'a LiveCounter,
}

impl Drop for CounterLock<'_> {
    fn drop(&mut self) {
        // SAFETY: releasing the lock taken in LiveCounter::lock.
        unsafe { libc::lockf(self.counter.fd, libc::F_ULOCK, 0) };
    }
}
