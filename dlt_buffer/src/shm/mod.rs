//! Fixed-size circular queue of framed records inside a shared-memory segment.
//!
//! Segment layout:
//!
//! ```text
//! [lock area: 64][write: i32][read: i32][count: i32][data: capacity bytes]
//! ```
//!
//! Frames in the data region are `[status:1][length:4][magic:4][payload]`,
//! with `length` covering magic and payload. The lock only guards the control
//! words. A producer reserves its frame under the lock with status `Writing`,
//! copies the payload after releasing it and flips the status to `Complete`
//! last. Consumers treat `Writing` as not ready.
//!
//! One consumer per segment. Any number of producers.

use std::time::{Duration, Instant};

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, error, info, warn};

use crate::core::{
    place, tail_too_short, Cursors, FrameHeader, FrameStatus, LockKind, Placement, ShmConfig,
    FRAME_HEADER_SIZE, MAGIC,
};
use crate::errors::{BufferError, Result};

mod lock;
mod region;

pub use lock::{ControlGuard, SegmentLock, SegmentMutex, LOCK_AREA_SIZE};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use lock::SysVSemaphore;

use region::Region;

/// Size of the three control words.
pub const CONTROL_SIZE: usize = 12;

const WRITE_OFFSET: usize = 0;
const READ_OFFSET: usize = 4;
const COUNT_OFFSET: usize = 8;

const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + MAGIC.len();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Created the segment and its lock, and destroys both.
    Server,
    Client,
}

/// Raw control words as stored in the segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ControlWords {
    write: i32,
    read: i32,
    count: i32,
}

impl ControlWords {
    fn in_range(&self, capacity: usize) -> bool {
        let cap = capacity as i64;
        (0..=cap).contains(&(self.write as i64))
            && (0..=cap).contains(&(self.read as i64))
            && self.count >= 0
    }

    fn cursors(&self) -> Cursors {
        Cursors {
            write: self.write as usize,
            read: self.read as usize,
            count: self.count as usize,
        }
    }
}

/// A validated frame at the reader's position.
#[derive(Copy, Clone, Debug)]
struct Located {
    start: usize,
    payload_len: usize,
}

impl Located {
    fn payload_offset(&self) -> usize {
        self.start + FRAME_OVERHEAD
    }

    fn end(&self) -> usize {
        self.payload_offset() + self.payload_len
    }
}

/// Tracks how long the reader has been held up by the same unfinished frame.
/// See `SharedCircularBuffer::recover_if_stalled`.
#[derive(Debug)]
pub struct StallWatch {
    limit: Duration,
    stalled_at: Option<(i32, Instant)>,
}

impl StallWatch {
    pub fn new(limit: Duration) -> StallWatch {
        StallWatch {
            limit,
            stalled_at: None,
        }
    }
}

pub fn segment_id(key: i32) -> String {
    format!("/dlt-shm-{}", key)
}

pub struct SharedCircularBuffer {
    // Declared before `shmem` so it is dropped while the mapping still exists.
    lock: Box<dyn SegmentLock>,
    shmem: Shmem,
    control: Region,
    data: Region,
    key: i32,
    role: Role,
    lock_timeout: Duration,
    freed: bool,
}

impl SharedCircularBuffer {
    /// Creates, or takes over, the segment for `key` and clears it.
    pub fn init_server(key: i32, size: usize) -> Result<SharedCircularBuffer> {
        let cfg = ShmConfig::builder().key(key).size(size).build()?;
        SharedCircularBuffer::server(&cfg)
    }

    /// Attaches to the existing segment for `key`.
    pub fn init_client(key: i32) -> Result<SharedCircularBuffer> {
        let cfg = ShmConfig::builder().key(key).build()?;
        SharedCircularBuffer::client(&cfg)
    }

    pub fn server(cfg: &ShmConfig) -> Result<SharedCircularBuffer> {
        if cfg.size <= CONTROL_SIZE + FRAME_OVERHEAD {
            return Err(BufferError::WrongParameter(format!(
                "shared memory size {} leaves no room for data",
                cfg.size
            )));
        }
        let os_id = segment_id(cfg.key);
        let total = LOCK_AREA_SIZE + cfg.size;
        let shmem = match ShmemConf::new().size(total).os_id(&os_id).create() {
            Ok(m) => m,
            Err(ShmemError::MappingIdExists) => {
                warn!(key = cfg.key, "shared memory segment exists, taking it over");
                let mut m = ShmemConf::new().os_id(&os_id).open()?;
                m.set_owner(true);
                if m.len() != total {
                    return Err(BufferError::InitFailure(format!(
                        "existing segment {} has {} bytes, expected {}",
                        os_id,
                        m.len(),
                        total
                    )));
                }
                m
            }
            Err(e) => {
                error!(key = cfg.key, error = %e, "cannot create shared memory segment");
                return Err(e.into());
            }
        };

        let base = shmem.as_ptr();
        let lock: Box<dyn SegmentLock> = match cfg.lock {
            LockKind::Mutex => Box::new(unsafe {
                SegmentMutex::create(base, base.add(LOCK_AREA_SIZE))?
            }),
            LockKind::Semaphore => semaphore(cfg.key, Role::Server)?,
        };
        let buf = SharedCircularBuffer::assemble(shmem, lock, cfg, Role::Server)?;

        buf.write_control(ControlWords { write: 0, read: 0, count: 0 })?;
        buf.data.fill(0, buf.data.len(), 0)?;
        info!(key = cfg.key, capacity = buf.capacity(), "shared memory buffer created");
        Ok(buf)
    }

    pub fn client(cfg: &ShmConfig) -> Result<SharedCircularBuffer> {
        let os_id = segment_id(cfg.key);
        let mut shmem = match ShmemConf::new().os_id(&os_id).open() {
            Ok(m) => m,
            Err(e) => {
                error!(key = cfg.key, error = %e, "cannot attach shared memory segment");
                return Err(e.into());
            }
        };
        shmem.set_owner(false);
        if shmem.len() <= LOCK_AREA_SIZE + CONTROL_SIZE + FRAME_OVERHEAD {
            return Err(BufferError::InitFailure(format!(
                "segment {} is too small ({} bytes)",
                os_id,
                shmem.len()
            )));
        }

        let base = shmem.as_ptr();
        let lock: Box<dyn SegmentLock> = match cfg.lock {
            LockKind::Mutex => Box::new(unsafe {
                SegmentMutex::open(base, base.add(LOCK_AREA_SIZE))?
            }),
            LockKind::Semaphore => semaphore(cfg.key, Role::Client)?,
        };
        let buf = SharedCircularBuffer::assemble(shmem, lock, cfg, Role::Client)?;
        debug!(key = cfg.key, capacity = buf.capacity(), "shared memory buffer attached");
        Ok(buf)
    }

    fn assemble(
        shmem: Shmem,
        lock: Box<dyn SegmentLock>,
        cfg: &ShmConfig,
        role: Role,
    ) -> Result<SharedCircularBuffer> {
        let base = shmem.as_ptr();
        let capacity = shmem.len() - LOCK_AREA_SIZE - CONTROL_SIZE;
        if capacity > i32::MAX as usize {
            return Err(BufferError::InitFailure(format!(
                "data region of {} bytes does not fit the control words",
                capacity
            )));
        }
        // The mapping lives as long as `shmem`, which the buffer owns.
        let (control, data) = unsafe {
            (
                Region::new(base.add(LOCK_AREA_SIZE), CONTROL_SIZE),
                Region::new(base.add(LOCK_AREA_SIZE + CONTROL_SIZE), capacity),
            )
        };
        Ok(SharedCircularBuffer {
            lock,
            shmem,
            control,
            data,
            key: cfg.key,
            role,
            lock_timeout: Duration::from_millis(cfg.lock_timeout_ms),
            freed: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn push(&self, data: &[u8]) -> Result<()> {
        self.push3(data, &[], &[])
    }

    /// Appends one frame whose payload is `d1 ++ d2 ++ d3`.
    pub fn push3(&self, d1: &[u8], d2: &[u8], d3: &[u8]) -> Result<()> {
        let payload_len = d1.len() + d2.len() + d3.len();
        let frame_len = FRAME_OVERHEAD + payload_len;
        let capacity = self.capacity();

        let start = {
            let _guard = self.lock()?;
            let mut cw = self.read_control()?;
            if !cw.in_range(capacity) {
                warn!(write = cw.write, read = cw.read, count = cw.count, "control words out of range");
                self.write_control(ControlWords { write: 0, read: 0, count: 0 })?;
                return Err(BufferError::Corrupt("control words out of range".to_string()));
            }
            if cw.count == 0 {
                cw.write = 0;
                cw.read = 0;
            }
            let cursors = cw.cursors();
            let start = match place(&cursors, capacity, frame_len) {
                Placement::Full => {
                    return Err(BufferError::Full {
                        needed: frame_len,
                        free: capacity - cursors.used(capacity),
                    });
                }
                Placement::At(at) => at,
                Placement::Wrap { .. } => {
                    // Zeroing the whole tail writes the sentinel (when there is
                    // room for one) and wipes stale markers that recovery could
                    // otherwise latch onto.
                    if cursors.write < capacity {
                        self.data.fill(cursors.write, capacity - cursors.write, 0)?;
                    }
                    0
                }
            };
            self.data.write(
                start,
                &FrameHeader::new(FrameStatus::Writing, MAGIC.len() + payload_len).encode(),
            )?;
            cw.write = (start + frame_len) as i32;
            cw.count += 1;
            self.write_control(cw)?;
            start
        };

        let mut at = start + FRAME_HEADER_SIZE;
        self.data.write(at, &MAGIC)?;
        at += MAGIC.len();
        for part in [d1, d2, d3].iter() {
            self.data.write(at, part)?;
            at += part.len();
        }
        self.data.publish(start, FrameStatus::Complete as u8)
    }

    /// Copies the oldest record into `out` and removes it.
    pub fn pull(&self, out: &mut [u8]) -> Result<usize> {
        let frame = self.locate()?;
        let len = self.copy_out(&frame, out)?;
        self.commit(&frame)?;
        Ok(len)
    }

    /// Copies the oldest record into `out` and leaves it queued.
    pub fn copy(&self, out: &mut [u8]) -> Result<usize> {
        let frame = self.locate()?;
        self.copy_out(&frame, out)
    }

    /// Discards the oldest record.
    pub fn remove(&self) -> Result<usize> {
        let frame = self.locate()?;
        self.commit(&frame)?;
        Ok(frame.payload_len)
    }

    /// Daemon-side drain: each record is removed only once `forward` accepts
    /// it. Stops at the first refusal, when empty, or at a frame still being
    /// written. Returns the number of records forwarded.
    ///
    /// A producer that died mid-frame blocks the drain at that frame; pair
    /// this with `recover_if_stalled` to get past it.
    pub fn forward_with<F>(&self, mut forward: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let mut scratch = vec![0u8; self.capacity()];
        let mut sent = 0;
        loop {
            let frame = match self.locate() {
                Ok(frame) => frame,
                Err(BufferError::Empty) | Err(BufferError::NotReady) => break,
                Err(BufferError::Corrupt(reason)) => {
                    debug!(%reason, "skipping damaged frame while forwarding");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let len = self.copy_out(&frame, &mut scratch)?;
            if !forward(&scratch[..len]) {
                break;
            }
            self.commit(&frame)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Zeroes the control words, dropping everything queued.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.write_control(ControlWords { write: 0, read: 0, count: 0 })?;
        warn!(key = self.key, "shared memory buffer reset");
        Ok(())
    }

    /// Skips the frame at the read position and resynchronises on the next
    /// well-formed frame before the write position. Resets the buffer when
    /// there is none.
    ///
    /// Only meant for frames whose producer died: whatever a live producer
    /// still copies into a skipped frame is lost.
    pub fn recover(&self) -> Result<()> {
        let cw = self.snapshot()?;
        if cw.count <= 0 || !cw.in_range(self.capacity()) {
            return self.reset();
        }
        let start = self.reader_position(cw.read as usize)?;
        self.recover_from(start, cw)
    }

    /// Runs `recover` once the frame at the read position has stayed in
    /// `Writing` for longer than the watch's limit. Consumers call this after
    /// a `NotReady`; returns whether the frame was skipped.
    pub fn recover_if_stalled(&self, watch: &mut StallWatch) -> Result<bool> {
        let cw = self.snapshot()?;
        if cw.count <= 0 || !cw.in_range(self.capacity()) {
            watch.stalled_at = None;
            return Ok(false);
        }
        let start = self.reader_position(cw.read as usize)?;
        if self.header_at(start)?.status() != Some(FrameStatus::Writing) {
            watch.stalled_at = None;
            return Ok(false);
        }
        match watch.stalled_at {
            Some((read, since)) if read == cw.read && since.elapsed() >= watch.limit => {
                warn!(key = self.key, start, stalled_for = ?since.elapsed(), "producer stalled mid-frame");
                watch.stalled_at = None;
                self.recover_from(start, cw)?;
                Ok(true)
            }
            Some((read, _)) if read == cw.read => Ok(false),
            _ => {
                watch.stalled_at = Some((cw.read, Instant::now()));
                Ok(false)
            }
        }
    }

    pub fn get_message_count(&self) -> Result<usize> {
        Ok(self.snapshot()?.count.max(0) as usize)
    }

    pub fn get_total_size(&self) -> usize {
        self.capacity()
    }

    pub fn get_used_size(&self) -> Result<usize> {
        let cw = self.snapshot()?;
        if !cw.in_range(self.capacity()) {
            return Ok(0);
        }
        Ok(cw.cursors().used(self.capacity()))
    }

    pub fn get_free_size(&self) -> Result<usize> {
        Ok(self.capacity() - self.get_used_size()?)
    }

    pub fn status(&self) -> Result<()> {
        let cw = self.snapshot()?;
        debug!(
            key = self.key,
            write = cw.write,
            read = cw.read,
            count = cw.count,
            "shared memory buffer status"
        );
        Ok(())
    }

    pub fn info(&self) {
        debug!(
            key = self.key,
            os_id = self.shmem.get_os_id(),
            segment_size = self.shmem.len(),
            capacity = self.capacity(),
            base = ?self.shmem.as_ptr(),
            role = ?self.role,
            "shared memory buffer info"
        );
    }

    /// Detaches and destroys the segment and its lock.
    pub fn free_server(mut self) -> Result<()> {
        if self.role != Role::Server {
            return Err(BufferError::WrongParameter(
                "only the server may destroy the shared memory buffer".to_string(),
            ));
        }
        self.freed = true;
        self.lock.destroy()?;
        info!(key = self.key, "shared memory buffer destroyed");
        Ok(())
    }

    /// Detaches from the segment, leaving it and its lock in place.
    pub fn free_client(mut self) -> Result<()> {
        if self.role != Role::Client {
            return Err(BufferError::WrongParameter(
                "the server must be released with free_server".to_string(),
            ));
        }
        self.freed = true;
        debug!(key = self.key, "shared memory buffer detached");
        Ok(())
    }

    fn lock(&self) -> Result<ControlGuard<'_>> {
        ControlGuard::acquire(self.lock.as_ref(), self.lock_timeout)
    }

    fn read_control(&self) -> Result<ControlWords> {
        Ok(ControlWords {
            write: self.control.read_i32(WRITE_OFFSET)?,
            read: self.control.read_i32(READ_OFFSET)?,
            count: self.control.read_i32(COUNT_OFFSET)?,
        })
    }

    fn write_control(&self, cw: ControlWords) -> Result<()> {
        self.control.write_i32(WRITE_OFFSET, cw.write)?;
        self.control.write_i32(READ_OFFSET, cw.read)?;
        self.control.write_i32(COUNT_OFFSET, cw.count)
    }

    fn snapshot(&self) -> Result<ControlWords> {
        let _guard = self.lock()?;
        self.read_control()
    }

    fn header_at(&self, offset: usize) -> Result<FrameHeader> {
        let mut bytes = [0u8; FRAME_HEADER_SIZE];
        bytes[0] = self.data.observe(offset)?;
        self.data.read(offset + 1, &mut bytes[1..])?;
        FrameHeader::decode(&bytes)
    }

    /// Where the frame the reader reaches from `read` starts: `read` itself,
    /// or 0 after a sentinel or a tail too short for a header.
    fn reader_position(&self, read: usize) -> Result<usize> {
        let capacity = self.capacity();
        if tail_too_short(read, capacity) || self.header_at(read)?.is_sentinel() {
            Ok(0)
        } else {
            Ok(read)
        }
    }

    fn locate(&self) -> Result<Located> {
        let capacity = self.capacity();
        let cw = self.snapshot()?;

        if cw.count <= 0 {
            if cw.count < 0 || cw.write != cw.read {
                warn!(write = cw.write, read = cw.read, count = cw.count, "buffer should be empty but is not");
                self.reset()?;
            }
            return Err(BufferError::Empty);
        }
        if !cw.in_range(capacity) {
            warn!(write = cw.write, read = cw.read, count = cw.count, "control words out of range");
            self.reset()?;
            return Err(BufferError::Corrupt("control words out of range".to_string()));
        }

        let start = self.reader_position(cw.read as usize)?;
        let header = self.header_at(start)?;
        let problem = match header.status() {
            Some(FrameStatus::Complete) => self.check_frame(start, &header)?,
            Some(FrameStatus::Writing) => return Err(BufferError::NotReady),
            _ => Some(format!("invalid frame status {} at {}", header.status, start)),
        };
        if let Some(reason) = problem {
            warn!(start, %reason, "damaged frame, recovering");
            self.recover_from(start, cw)?;
            return Err(BufferError::Corrupt(reason));
        }
        Ok(Located {
            start,
            payload_len: header.length as usize - MAGIC.len(),
        })
    }

    /// Describes what is wrong with a complete frame, if anything.
    fn check_frame(&self, start: usize, header: &FrameHeader) -> Result<Option<String>> {
        let length = header.length as usize;
        if length < MAGIC.len() || start + FRAME_HEADER_SIZE + length > self.capacity() {
            return Ok(Some(format!(
                "frame length {} at {} does not fit buffer of {}",
                length,
                start,
                self.capacity()
            )));
        }
        let mut magic = [0u8; 4];
        self.data.read(start + FRAME_HEADER_SIZE, &mut magic)?;
        if magic != MAGIC {
            return Ok(Some(format!("bad magic {:02x?} at {}", magic, start)));
        }
        Ok(None)
    }

    fn copy_out(&self, frame: &Located, out: &mut [u8]) -> Result<usize> {
        if frame.payload_len > out.len() {
            return Err(BufferError::WrongParameter(format!(
                "record of {} bytes does not fit into {} byte buffer",
                frame.payload_len,
                out.len()
            )));
        }
        self.data
            .read(frame.payload_offset(), &mut out[..frame.payload_len])?;
        Ok(frame.payload_len)
    }

    fn commit(&self, frame: &Located) -> Result<()> {
        let _guard = self.lock()?;
        let mut cw = self.read_control()?;
        cw.read = frame.end() as i32;
        cw.count -= 1;
        self.write_control(cw)
    }

    /// Moves the reader past the frame at `start`. A plausible length is
    /// trusted, since producers write it under the lock; otherwise the next
    /// magic marker is searched. The new position must lead through
    /// well-formed frames up to `write`, and `count` is recomputed from that
    /// walk. Resets the buffer when no such position exists.
    fn recover_from(&self, start: usize, cw: ControlWords) -> Result<()> {
        let write = cw.write as usize;

        let mut resync = None;
        if let Some(len) = self.plausible_length(start, &self.header_at(start)?) {
            let next = start + FRAME_HEADER_SIZE + len;
            if let Some(frames) = self.walk(next, write)? {
                resync = Some((next, frames));
            }
        }
        if resync.is_none() {
            resync = self.scan_for_frames(start, write)?;
        }

        match resync {
            Some((read, frames)) => {
                let _guard = self.lock()?;
                let mut now = self.read_control()?;
                // Frames pushed after the snapshot sit behind the old `write`.
                let added = (now.count - cw.count).max(0);
                now.read = read as i32;
                now.count = frames as i32 + added;
                self.write_control(now)?;
                warn!(key = self.key, skipped_from = start, read, frames, "read position resynchronised");
                Ok(())
            }
            None => {
                warn!(key = self.key, start, "no frame boundary found, resetting");
                self.reset()
            }
        }
    }

    /// Payload-plus-marker length of a `Writing` or `Complete` header that
    /// stays inside the data region.
    fn plausible_length(&self, start: usize, header: &FrameHeader) -> Option<usize> {
        match header.status() {
            Some(FrameStatus::Writing) | Some(FrameStatus::Complete) => {}
            _ => return None,
        }
        let len = header.length as usize;
        if len < MAGIC.len() || start + FRAME_HEADER_SIZE + len > self.capacity() {
            return None;
        }
        Some(len)
    }

    /// Counts the frames between `from` and `write`. `None` when the chain
    /// hits a malformed header or steps over `write`.
    fn walk(&self, from: usize, write: usize) -> Result<Option<usize>> {
        let capacity = self.capacity();
        let mut pos = from;
        let mut frames = 0;
        loop {
            if pos == write {
                return Ok(Some(frames));
            }
            // Past `write` the chain runs up to the physical end, then wraps.
            if pos > write && (tail_too_short(pos, capacity) || self.header_at(pos)?.is_sentinel()) {
                pos = 0;
                continue;
            }
            if frames > capacity / FRAME_OVERHEAD || tail_too_short(pos, capacity) {
                return Ok(None);
            }
            let header = self.header_at(pos)?;
            let len = match self.plausible_length(pos, &header) {
                Some(len) => len,
                None => return Ok(None),
            };
            if header.status() == Some(FrameStatus::Complete) && self.check_frame(pos, &header)?.is_some() {
                return Ok(None);
            }
            let end = pos + FRAME_HEADER_SIZE + len;
            if pos < write && end > write {
                return Ok(None);
            }
            frames += 1;
            pos = end;
        }
    }

    /// First magic marker after `start`, in logical order, from which a
    /// well-formed chain of frames reaches `write`.
    fn scan_for_frames(&self, start: usize, write: usize) -> Result<Option<(usize, usize)>> {
        // Begin past this frame's own marker so it cannot be found again.
        let from = start + FRAME_HEADER_SIZE + 1;
        let ranges = if start < write {
            vec![(from, write)]
        } else {
            vec![(from, self.capacity()), (FRAME_HEADER_SIZE, write)]
        };
        for (mut lo, hi) in ranges {
            while let Some(p) = self.data.find(lo, hi, &MAGIC)? {
                let candidate = p - FRAME_HEADER_SIZE;
                if let Some(frames) = self.walk(candidate, write)? {
                    return Ok(Some((candidate, frames)));
                }
                lo = p + 1;
            }
        }
        Ok(None)
    }
}

impl Drop for SharedCircularBuffer {
    fn drop(&mut self) {
        if self.role == Role::Server && !self.freed {
            if let Err(e) = self.lock.destroy() {
                warn!(key = self.key, error = %e, "failed to destroy buffer lock");
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn semaphore(key: i32, role: Role) -> Result<Box<dyn SegmentLock>> {
    let sem = match role {
        Role::Server => SysVSemaphore::create(key)?,
        Role::Client => SysVSemaphore::open(key)?,
    };
    Ok(Box::new(sem))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn semaphore(_key: i32, _role: Role) -> Result<Box<dyn SegmentLock>> {
    Err(BufferError::WrongParameter(
        "semaphore locks are only available on Linux".to_string(),
    ))
}
