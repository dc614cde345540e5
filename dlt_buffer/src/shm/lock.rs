//! Locks guarding the three control words of a shared buffer.
//!
//! Acquisition is always bounded by a timeout. Only the System V semaphore is
//! released by the kernel when its holder dies; the in-segment mutex stays
//! locked in that case and the segment has to be recreated by the server.

use std::thread;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use tracing::{trace, warn};

use crate::errors::{lock_error, BufferError, Result};

/// Bytes reserved at the start of every segment for an in-segment lock.
pub const LOCK_AREA_SIZE: usize = 64;

pub trait SegmentLock {
    /// Takes the lock, giving up with `LockTimeout` after `timeout`.
    fn acquire(&self, timeout: Duration) -> Result<()>;
    fn release(&self) -> Result<()>;
    /// Removes the OS object behind the lock. Only the creator calls this.
    fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

pub struct ControlGuard<'a> {
    lock: &'a dyn SegmentLock,
}

impl<'a> ControlGuard<'a> {
    pub fn acquire(lock: &'a dyn SegmentLock, timeout: Duration) -> Result<ControlGuard<'a>> {
        lock.acquire(timeout)?;
        Ok(ControlGuard { lock })
    }
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!(error = %e, "failed to release control word lock");
        }
    }
}

/// Process-shared mutex living in the segment's lock area.
pub struct SegmentMutex {
    inner: Box<dyn LockImpl>,
}

impl SegmentMutex {
    /// # Safety
    /// `area` must point to `LOCK_AREA_SIZE` writable bytes of the mapping
    /// and `data` into the same mapping, both valid while the mutex is used.
    pub unsafe fn create(area: *mut u8, data: *mut u8) -> Result<SegmentMutex> {
        SegmentMutex::check_fits(area)?;
        let (inner, _) = Mutex::new(area, data).map_err(lock_error)?;
        Ok(SegmentMutex { inner })
    }

    /// # Safety
    /// Same as `create`; the area must have been initialised by `create`.
    pub unsafe fn open(area: *mut u8, data: *mut u8) -> Result<SegmentMutex> {
        SegmentMutex::check_fits(area)?;
        let (inner, _) = Mutex::from_existing(area, data).map_err(lock_error)?;
        Ok(SegmentMutex { inner })
    }

    fn check_fits(area: *mut u8) -> Result<()> {
        let needed = Mutex::size_of(Some(area));
        if needed > LOCK_AREA_SIZE {
            return Err(BufferError::InitFailure(format!(
                "mutex needs {} bytes, lock area has {}",
                needed, LOCK_AREA_SIZE
            )));
        }
        Ok(())
    }
}

impl SegmentLock for SegmentMutex {
    fn acquire(&self, timeout: Duration) -> Result<()> {
        match self.inner.try_lock(Timeout::Val(timeout)) {
            Ok(guard) => {
                // Released explicitly through `release`.
                std::mem::forget(guard);
                Ok(())
            }
            Err(e) => {
                trace!(error = %e, "segment mutex not acquired");
                Err(BufferError::LockTimeout)
            }
        }
    }

    fn release(&self) -> Result<()> {
        self.inner.release().map_err(lock_error)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use sysv::SysVSemaphore;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sysv {
    use std::io;
    use std::time::{Duration, Instant};

    use libc::{c_int, c_short};
    use tracing::debug;

    use super::{poll_until, SegmentLock};
    use crate::errors::{BufferError, Result};

    /// Binary System V semaphore. Every operation carries SEM_UNDO so the
    /// kernel reverts a dead holder's acquisition.
    pub struct SysVSemaphore {
        id: c_int,
        key: i32,
    }

    impl SysVSemaphore {
        pub fn create(key: i32) -> Result<SysVSemaphore> {
            let id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | 0o666) };
            if id == -1 {
                return Err(init_failure("semget", key));
            }
            if unsafe { libc::semctl(id, 0, libc::SETVAL, 1 as c_int) } == -1 {
                return Err(init_failure("semctl(SETVAL)", key));
            }
            debug!(key, id, "semaphore created");
            Ok(SysVSemaphore { id, key })
        }

        pub fn open(key: i32) -> Result<SysVSemaphore> {
            let id = unsafe { libc::semget(key, 0, 0) };
            if id == -1 {
                return Err(init_failure("semget", key));
            }
            Ok(SysVSemaphore { id, key })
        }

        fn op(&self, delta: c_short, flags: c_int) -> io::Result<()> {
            let mut op = libc::sembuf {
                sem_num: 0,
                sem_op: delta,
                sem_flg: (libc::SEM_UNDO | flags) as c_short,
            };
            if unsafe { libc::semop(self.id, &mut op, 1) } == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    fn init_failure(call: &str, key: i32) -> BufferError {
        BufferError::InitFailure(format!(
            "{} for key {}: {}",
            call,
            key,
            io::Error::last_os_error()
        ))
    }

    impl SegmentLock for SysVSemaphore {
        fn acquire(&self, timeout: Duration) -> Result<()> {
            let deadline = Instant::now() + timeout;
            poll_until(deadline, || match self.op(-1, libc::IPC_NOWAIT) {
                Ok(()) => Ok(true),
                Err(e) => match e.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
                    _ => Err(BufferError::Lock(format!("semop on key {}: {}", self.key, e))),
                },
            })
        }

        fn release(&self) -> Result<()> {
            self.op(1, 0)
                .map_err(|e| BufferError::Lock(format!("semop on key {}: {}", self.key, e)))
        }

        fn destroy(&self) -> Result<()> {
            if unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) } == -1 {
                return Err(BufferError::Lock(format!(
                    "semctl(IPC_RMID) on key {}: {}",
                    self.key,
                    io::Error::last_os_error()
                )));
            }
            debug!(key = self.key, "semaphore removed");
            Ok(())
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Calls `attempt` until it reports success or `deadline` passes.
fn poll_until<F>(deadline: Instant, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    loop {
        if attempt()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(BufferError::LockTimeout);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_gives_up_at_deadline() {
        let mut calls = 0;
        let res = poll_until(Instant::now() + Duration::from_millis(2), || {
            calls += 1;
            Ok(false)
        });
        assert!(matches!(res, Err(BufferError::LockTimeout)));
        assert!(calls >= 1);
    }

    #[test]
    fn poll_stops_on_success() {
        let mut calls = 0;
        poll_until(Instant::now() + Duration::from_secs(1), || {
            calls += 1;
            Ok(calls == 3)
        })
        .unwrap();
        assert_eq!(calls, 3);
    }

    #[test]
    fn segment_mutex_excludes_second_holder() {
        #[repr(align(64))]
        struct Area([u8; LOCK_AREA_SIZE + 16]);
        let mut area = Area([0u8; LOCK_AREA_SIZE + 16]);
        let base = area.0.as_mut_ptr();
        let data = unsafe { base.add(LOCK_AREA_SIZE) };

        let first = unsafe { SegmentMutex::create(base, data) }.unwrap();
        let second = unsafe { SegmentMutex::open(base, data) }.unwrap();
        {
            let _guard = ControlGuard::acquire(&first, Duration::from_millis(10)).unwrap();
            assert!(matches!(
                second.acquire(Duration::from_millis(5)),
                Err(BufferError::LockTimeout)
            ));
        }
        let _guard = ControlGuard::acquire(&second, Duration::from_millis(10)).unwrap();
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn semaphore_excludes_second_holder() {
        let key = 0x7d1c_0000 | (std::process::id() as i32 & 0xffff);
        let server = SysVSemaphore::create(key).unwrap();
        let client = SysVSemaphore::open(key).unwrap();
        {
            let _guard = ControlGuard::acquire(&server, Duration::from_millis(10)).unwrap();
            assert!(matches!(
                client.acquire(Duration::from_millis(5)),
                Err(BufferError::LockTimeout)
            ));
        }
        let guard = ControlGuard::acquire(&client, Duration::from_millis(10)).unwrap();
        drop(guard);
        server.destroy().unwrap();
        assert!(matches!(
            SysVSemaphore::open(key),
            Err(BufferError::InitFailure(_))
        ));
    }
}
