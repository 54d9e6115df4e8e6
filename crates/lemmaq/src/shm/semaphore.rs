//! Process-shared binary semaphore used as a non-blocking mutex.
//!
//! `nix` does not wrap POSIX named semaphores, so this goes through `libc`.
//!
//! ## Safety contracts
//!
//! - `sem` is a valid pointer returned by `sem_open` for the whole lifetime of
//!   a `NamedSemaphore` and is closed exactly once in `Drop`.
//! - POSIX semaphores are safe to use concurrently from any thread, which is
//!   what the `Send`/`Sync` impls rely on.

use std::ffi::CString;
use std::io;

use super::ShmError;

const MODE: libc::c_uint = 0o600;

pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// SAFETY: sem_t operations are thread-safe; the pointer is only closed in Drop.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .finish()
    }
}

impl NamedSemaphore {
    /// Create a fresh semaphore with count 0, replacing any stale one left by
    /// a crashed launcher. Call [`release`](Self::release) once the protected
    /// resource is initialized.
    pub fn create(name: &str) -> Result<Self, ShmError> {
        let c_name = c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            tracing::warn!(name, "Removed stale semaphore");
        }

        // SAFETY: variadic arguments match sem_open(3) with O_CREAT: mode, value.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                MODE,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::semaphore(
                name,
                "sem_open(O_CREAT)",
                io::Error::last_os_error(),
            ));
        }

        tracing::debug!(name, "Created semaphore");
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }

    /// Open an existing semaphore by name.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let c_name = c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; no O_CREAT so no
        // variadic arguments are read.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::semaphore(
                name,
                "sem_open",
                io::Error::last_os_error(),
            ));
        }

        tracing::trace!(name, "Opened semaphore");
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }

    /// Remove the name. Processes holding the semaphore open keep using it.
    /// A missing name is not an error.
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::semaphore(name, "sem_unlink", err));
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the semaphore without blocking.
    ///
    /// Returns `None` when another process or thread holds it. Unexpected
    /// errors are logged and reported the same way so callers simply retry.
    pub fn try_acquire(&self) -> Option<SemaphoreGuard<'_>> {
        loop {
            // SAFETY: self.sem is valid for the lifetime of self.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Some(SemaphoreGuard { sem: self });
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return None,
                _ => {
                    tracing::warn!(name = %self.name, error = %err, "sem_trywait failed");
                    return None;
                }
            }
        }
    }

    /// Increment the count. Used once by the creator after initialization and
    /// by [`SemaphoreGuard`] on drop.
    pub fn release(&self) {
        // SAFETY: self.sem is valid for the lifetime of self.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            let err = io::Error::last_os_error();
            tracing::error!(name = %self.name, error = %err, "sem_post failed");
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem came from sem_open and is closed only here.
        if unsafe { libc::sem_close(self.sem) } != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(name = %self.name, error = %err, "sem_close failed");
        }
    }
}

/// Held while one table scan is in progress; releases on drop.
#[must_use = "the semaphore is released as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

fn c_name(name: &str) -> Result<CString, ShmError> {
    if !name.starts_with('/') || name[1..].contains('/') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    CString::new(name).map_err(|_| ShmError::InvalidName {
        name: name.to_string(),
    })
}
