//! System-V shared memory carrying the AFL coverage bitmap.
//!
//! One region is allocated per target run. The numeric id is handed to the
//! child through the `__AFL_SHM_ID` environment variable; the instrumented
//! runtime attaches the segment and records edge hits into it. After the
//! child exits the region is read back exactly once and then removed.

use std::{fs, io, path::Path, ptr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shmget failed")]
    Allocate(#[source] io::Error),
    #[error("shmat failed")]
    Attach(#[source] io::Error),
    #[error("writing shared memory dump")]
    Dump(#[source] io::Error),
}

/// An owned `IPC_PRIVATE` shared-memory segment.
///
/// The attach pointer is never retained across calls: every read is a fresh
/// attach/copy/detach. Dropping the region issues `IPC_RMID`; the kernel
/// reclaims the segment once the last attached process detaches, so removal
/// is safe even while a child is still running.
#[derive(Debug)]
pub struct ShmRegion {
    id: i32,
    size: usize,
}

impl ShmRegion {
    /// Allocates a new private segment with owner-only permissions.
    pub fn new(size: usize) -> Result<Self, ShmError> {
        // SAFETY: shmget has no pointer arguments; a negative return is the
        // only failure signal.
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(ShmError::Allocate(io::Error::last_os_error()));
        }
        Ok(Self { id, size })
    }

    /// The numeric id to export as `__AFL_SHM_ID` (decimal ASCII).
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Attaches the segment, copies its contents, and detaches.
    pub fn read_to_vec(&self) -> Result<Vec<u8>, ShmError> {
        // SAFETY: a null address lets the kernel pick the mapping location.
        let addr = unsafe { libc::shmat(self.id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(ShmError::Attach(io::Error::last_os_error()));
        }
        let mut buffer = vec![0u8; self.size];
        // SAFETY: the segment is at least `size` bytes by construction and
        // `addr` is a valid mapping until the shmdt below.
        unsafe {
            ptr::copy_nonoverlapping(addr as *const u8, buffer.as_mut_ptr(), self.size);
            libc::shmdt(addr);
        }
        Ok(buffer)
    }

    /// Dumps the segment contents to `path` for the coverage parser.
    pub fn dump_to_file(&self, path: &Path) -> Result<(), ShmError> {
        let contents = self.read_to_vec()?;
        fs::write(path, contents).map_err(ShmError::Dump)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: IPC_RMID takes no buffer; errors on an already-removed
        // segment are ignorable.
        unsafe {
            libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
        }
    }
}
