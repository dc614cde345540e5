use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::errors::{BufferError, Result};

/// Bounds-checked view of a byte range inside a mapped segment.
///
/// Other processes may write the same bytes concurrently, so the region never
/// hands out references into the mapping; every access copies.
#[derive(Debug)]
pub(crate) struct Region {
    base: *mut u8,
    len: usize,
}

impl Region {
    /// # Safety
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// the region is used.
    pub(crate) unsafe fn new(base: *mut u8, len: usize) -> Region {
        Region { base, len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BufferError::Corrupt(format!(
                "access of {} bytes at {} outside region of {} bytes",
                len, offset, self.len
            ))),
        }
    }

    pub(crate) fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
        Ok(())
    }

    pub(crate) fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check(offset, len)?;
        unsafe {
            ptr::write_bytes(self.base.add(offset), byte, len);
        }
        Ok(())
    }

    pub(crate) fn read_i32(&self, offset: usize) -> Result<i32> {
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes)?;
        Ok(i32::from_ne_bytes(bytes))
    }

    pub(crate) fn write_i32(&self, offset: usize, value: i32) -> Result<()> {
        self.write(offset, &value.to_ne_bytes())
    }

    /// Stores a single byte with release ordering, so every earlier write is
    /// visible to whoever observes it.
    pub(crate) fn publish(&self, offset: usize, byte: u8) -> Result<()> {
        self.atomic(offset)?.store(byte, Ordering::Release);
        Ok(())
    }

    /// Loads a byte written with `publish`; later reads see what was written
    /// before it.
    pub(crate) fn observe(&self, offset: usize) -> Result<u8> {
        Ok(self.atomic(offset)?.load(Ordering::Acquire))
    }

    fn atomic(&self, offset: usize) -> Result<&AtomicU8> {
        self.check(offset, 1)?;
        // AtomicU8 has the size and alignment of u8.
        Ok(unsafe { &*(self.base.add(offset) as *const AtomicU8) })
    }

    /// First offset in `[from, to)` where `pattern` starts and fits entirely
    /// before `to`.
    pub(crate) fn find(&self, from: usize, to: usize, pattern: &[u8]) -> Result<Option<usize>> {
        if from >= to || to - from < pattern.len() {
            return Ok(None);
        }
        let mut window = vec![0u8; to - from];
        self.read(from, &mut window)?;
        Ok(window
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map(|p| from + p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_region<F: FnOnce(&Region)>(len: usize, f: F) {
        let mut backing = vec![0u8; len];
        let region = unsafe { Region::new(backing.as_mut_ptr(), backing.len()) };
        f(&region);
    }

    #[test]
    fn read_write_in_bounds() {
        with_region(16, |r| {
            r.write(4, b"abcd").unwrap();
            let mut out = [0u8; 4];
            r.read(4, &mut out).unwrap();
            assert_eq!(&out, b"abcd");
            r.write_i32(12, -3).unwrap();
            assert_eq!(r.read_i32(12).unwrap(), -3);
        });
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        with_region(8, |r| {
            assert!(r.write(6, b"abc").is_err());
            assert!(r.read_i32(5).is_err());
            assert!(r.fill(usize::MAX, 2, 0).is_err());
            assert!(r.write(8, b"").is_ok());
        });
    }

    #[test]
    fn find_pattern() {
        with_region(16, |r| {
            r.write(9, b"SHM").unwrap();
            assert_eq!(r.find(0, 16, b"SHM").unwrap(), Some(9));
            assert_eq!(r.find(10, 16, b"SHM").unwrap(), None);
            assert_eq!(r.find(0, 11, b"SHM").unwrap(), None);
            assert_eq!(r.find(0, 12, b"SHM").unwrap(), Some(9));
        });
    }

    #[test]
    fn published_byte_is_observed() {
        with_region(8, |r| {
            r.publish(3, 2).unwrap();
            assert_eq!(r.observe(3).unwrap(), 2);
            let mut out = [0u8; 1];
            r.read(3, &mut out).unwrap();
            assert_eq!(out[0], 2);
            assert!(r.publish(8, 1).is_err());
            assert!(r.observe(8).is_err());
        });
    }

    #[test]
    fn published_payload_is_seen_by_observer() {
        let mut backing = vec![0u8; 64];
        let base = backing.as_mut_ptr() as usize;
        let writer = std::thread::spawn(move || {
            let r = unsafe { Region::new(base as *mut u8, 64) };
            r.write(1, &[7u8; 63]).unwrap();
            r.publish(0, 1).unwrap();
        });
        let r = unsafe { Region::new(base as *mut u8, 64) };
        while r.observe(0).unwrap() != 1 {
            std::hint::spin_loop();
        }
        let mut out = [0u8; 63];
        r.read(1, &mut out).unwrap();
        assert_eq!(out, [7u8; 63]);
        writer.join().unwrap();
        drop(backing);
    }
}
