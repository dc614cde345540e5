//! Growable ring of framed records, owned by a single logging client.
//!
//! Frames are `[status][length][payload]` and are always stored contiguously.
//! A frame that does not fit in front of the physical end is placed at offset
//! 0 and the abandoned tail is marked with a sentinel header (or is too short
//! to hold one). Capacity moves between `min_size` and `max_size` in
//! `step_size` increments; resizing compacts the live frames to offset 0.
//!
//! Not synchronised: callers sharing a buffer between threads must serialise
//! access themselves.

use tracing::{debug, warn};

use crate::core::{
    place, tail_too_short, Cursors, FrameHeader, FrameStatus, Placement, RingConfig,
    FRAME_HEADER_SIZE,
};
use crate::errors::{BufferError, Result};

#[derive(Clone, Debug)]
pub struct DynamicRingBuffer {
    mem: Vec<u8>,
    cursors: Cursors,
    // Bytes held by live frames, headers included. Abandoned tails are not
    // counted.
    live: usize,
    min_size: usize,
    max_size: usize,
    step_size: usize,
}

impl DynamicRingBuffer {
    pub fn init(min_size: usize, max_size: usize, step_size: usize) -> Result<DynamicRingBuffer> {
        DynamicRingBuffer::from_config(&RingConfig {
            min_size,
            max_size,
            step_size,
        })
    }

    pub fn from_config(cfg: &RingConfig) -> Result<DynamicRingBuffer> {
        cfg.validate()?;
        Ok(DynamicRingBuffer {
            mem: vec![0u8; cfg.min_size],
            cursors: Cursors::default(),
            live: 0,
            min_size: cfg.min_size,
            max_size: cfg.max_size,
            step_size: cfg.step_size,
        })
    }

    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        self.push3(data, &[], &[])
    }

    /// Appends one frame whose payload is `d1 ++ d2 ++ d3`. Grows the buffer
    /// if needed; on `Full` nothing has been written.
    pub fn push3(&mut self, d1: &[u8], d2: &[u8], d3: &[u8]) -> Result<()> {
        let payload_len = d1.len() + d2.len() + d3.len();
        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if payload_len > u32::MAX as usize {
            return Err(BufferError::WrongParameter(format!(
                "record of {} bytes exceeds the length field",
                payload_len
            )));
        }

        if self.cursors.count == 0 {
            self.cursors = Cursors::default();
        }

        let start = match place(&self.cursors, self.mem.len(), frame_len) {
            Placement::Full => {
                self.make_room(frame_len)?;
                self.cursors.write
            }
            Placement::At(at) => at,
            Placement::Wrap { sentinel } => {
                if let Some(at) = sentinel {
                    self.mem[at..at + FRAME_HEADER_SIZE]
                        .copy_from_slice(&FrameHeader::sentinel().encode());
                }
                0
            }
        };

        let mut at = start;
        self.mem[at..at + FRAME_HEADER_SIZE]
            .copy_from_slice(&FrameHeader::new(FrameStatus::Complete, payload_len).encode());
        at += FRAME_HEADER_SIZE;
        for part in [d1, d2, d3].iter() {
            self.mem[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }

        self.cursors.write = at;
        self.cursors.count += 1;
        self.live += frame_len;
        Ok(())
    }

    /// Copies the oldest record into `out` and removes it.
    pub fn pull(&mut self, out: &mut [u8]) -> Result<usize> {
        self.get(out, true)
    }

    /// Copies the oldest record into `out` without removing it.
    pub fn copy(&mut self, out: &mut [u8]) -> Result<usize> {
        self.get(out, false)
    }

    /// Copies the oldest record into `out`, removing it when `delete` is set.
    /// If `out` is too small the record stays queued.
    pub fn get(&mut self, out: &mut [u8], delete: bool) -> Result<usize> {
        let (start, len) = self.oldest()?;
        if len > out.len() {
            return Err(BufferError::WrongParameter(format!(
                "record of {} bytes does not fit into {} byte buffer",
                len,
                out.len()
            )));
        }
        let payload = start + FRAME_HEADER_SIZE;
        out[..len].copy_from_slice(&self.mem[payload..payload + len]);
        if delete {
            self.advance(start, len);
        }
        Ok(len)
    }

    /// Copies the record at logical position `index` (0 = oldest) into `out`.
    pub fn get_at(&self, index: usize, out: &mut [u8]) -> Result<usize> {
        let record = self.iter().nth(index).ok_or(BufferError::Empty)?;
        if record.len() > out.len() {
            return Err(BufferError::WrongParameter(format!(
                "record of {} bytes does not fit into {} byte buffer",
                record.len(),
                out.len()
            )));
        }
        out[..record.len()].copy_from_slice(record);
        Ok(record.len())
    }

    /// Discards the oldest record.
    pub fn remove(&mut self) -> Result<usize> {
        let (start, len) = self.oldest()?;
        self.advance(start, len);
        Ok(len)
    }

    /// Records in FIFO order.
    pub fn iter(&self) -> Records<'_> {
        Records {
            buffer: self,
            read: self.cursors.read,
            remaining: self.cursors.count,
        }
    }

    /// Hands queued records to `forward` oldest first. A record is removed
    /// only when `forward` returns true; the first refusal stops the loop.
    /// Returns the number of records forwarded.
    pub fn resend_with<F>(&mut self, mut forward: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let mut sent = 0;
        while self.cursors.count > 0 {
            let (start, len) = self.oldest()?;
            let payload = start + FRAME_HEADER_SIZE;
            if !forward(&self.mem[payload..payload + len]) {
                break;
            }
            self.advance(start, len);
            sent += 1;
        }
        Ok(sent)
    }

    /// Grows capacity by one step.
    pub fn increase_size(&mut self) -> Result<()> {
        let new_size = self.mem.len() + self.step_size;
        if new_size > self.max_size {
            return Err(BufferError::Full {
                needed: self.step_size,
                free: self.max_size - self.mem.len(),
            });
        }
        self.relocate(new_size)?;
        debug!(size = new_size, "ring buffer size increased");
        Ok(())
    }

    /// Shrinks capacity to the smallest `min + k * step` that still holds the
    /// queued records.
    pub fn minimize_size(&mut self) -> Result<()> {
        let target = if self.live <= self.min_size {
            self.min_size
        } else {
            let steps = (self.live - self.min_size + self.step_size - 1) / self.step_size;
            self.min_size + steps * self.step_size
        };
        if target >= self.mem.len() {
            return Ok(());
        }
        self.relocate(target)?;
        debug!(size = target, "ring buffer size minimized");
        Ok(())
    }

    pub fn reset(&mut self) {
        for b in self.mem.iter_mut() {
            *b = 0;
        }
        self.cursors = Cursors::default();
        self.live = 0;
        debug!("ring buffer reset");
    }

    pub fn get_message_count(&self) -> usize {
        self.cursors.count
    }

    pub fn get_total_size(&self) -> usize {
        self.mem.len()
    }

    pub fn get_used_size(&self) -> usize {
        self.live
    }

    pub fn get_free_size(&self) -> usize {
        self.mem.len() - self.live
    }

    pub fn status(&self) {
        debug!(
            write = self.cursors.write,
            read = self.cursors.read,
            count = self.cursors.count,
            used = self.live,
            "ring buffer status"
        );
    }

    pub fn info(&self) {
        debug!(
            size = self.mem.len(),
            min = self.min_size,
            max = self.max_size,
            step = self.step_size,
            "ring buffer info"
        );
    }

    /// Start offset and payload length of the oldest record. Inconsistent
    /// state resets the buffer.
    fn oldest(&mut self) -> Result<(usize, usize)> {
        let Cursors { write, read, count } = self.cursors;
        let capacity = self.mem.len();

        if count == 0 {
            if write != read {
                warn!(write, read, "ring buffer should be empty but is not");
                self.reset();
            }
            return Err(BufferError::Empty);
        }
        if read > capacity || write > capacity {
            warn!(write, read, capacity, "ring buffer pointer out of range");
            self.reset();
            return Err(BufferError::Corrupt("pointer out of range".to_string()));
        }

        match self.frame_at(read) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!(read, error = %e, "ring buffer frame check failed");
                self.reset();
                Err(e)
            }
        }
    }

    /// Locates and validates the frame the reader reaches from `read`.
    fn frame_at(&self, read: usize) -> Result<(usize, usize)> {
        let capacity = self.mem.len();
        let mut start = read;
        if tail_too_short(start, capacity) || self.mem[start] == FrameStatus::Unused as u8 {
            start = 0;
        }
        let header = FrameHeader::decode(&self.mem[start..])?;
        if header.status() != Some(FrameStatus::Complete) {
            return Err(BufferError::Corrupt(format!(
                "unexpected frame status {} at {}",
                header.status, start
            )));
        }
        let len = header.length as usize;
        if start + FRAME_HEADER_SIZE + len > capacity {
            return Err(BufferError::Corrupt(format!(
                "frame of {} bytes at {} overruns buffer of {}",
                len, start, capacity
            )));
        }
        Ok((start, len))
    }

    fn advance(&mut self, start: usize, len: usize) {
        self.cursors.read = start + FRAME_HEADER_SIZE + len;
        self.cursors.count -= 1;
        self.live -= FRAME_HEADER_SIZE + len;
        if self.cursors.count == 0 {
            self.cursors = Cursors::default();
        }
    }

    /// Grows (or just compacts) until `frame_len` more bytes fit behind the
    /// live frames.
    fn make_room(&mut self, frame_len: usize) -> Result<()> {
        let needed = self.live + frame_len;
        let capacity = self.mem.len();
        if needed > self.max_size {
            return Err(BufferError::Full {
                needed: frame_len,
                free: self.get_free_size(),
            });
        }
        let steps = if needed > capacity {
            (needed - capacity + self.step_size - 1) / self.step_size
        } else {
            0
        };
        let new_size = capacity + steps * self.step_size;
        if new_size > self.max_size {
            return Err(BufferError::Full {
                needed: frame_len,
                free: self.get_free_size(),
            });
        }
        self.relocate(new_size)?;
        if steps > 0 {
            debug!(size = new_size, steps, "ring buffer size increased");
        }
        Ok(())
    }

    /// Moves all live frames to the front of a fresh backing array.
    fn relocate(&mut self, new_size: usize) -> Result<()> {
        let mut mem = vec![0u8; new_size];
        let mut read = self.cursors.read;
        let mut write = 0;
        for _ in 0..self.cursors.count {
            let (start, len) = match self.frame_at(read) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(read, error = %e, "ring buffer frame check failed while resizing");
                    self.reset();
                    return Err(e);
                }
            };
            let frame_len = FRAME_HEADER_SIZE + len;
            mem[write..write + frame_len].copy_from_slice(&self.mem[start..start + frame_len]);
            write += frame_len;
            read = start + frame_len;
        }
        self.mem = mem;
        self.cursors.read = 0;
        self.cursors.write = write;
        self.live = write;
        Ok(())
    }
}

pub struct Records<'a> {
    buffer: &'a DynamicRingBuffer,
    read: usize,
    remaining: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining == 0 {
            return None;
        }
        let buffer = self.buffer;
        let (start, len) = buffer.frame_at(self.read).ok()?;
        self.read = start + FRAME_HEADER_SIZE + len;
        self.remaining -= 1;
        let payload = start + FRAME_HEADER_SIZE;
        Some(&buffer.mem[payload..payload + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn pull_vec(buf: &mut DynamicRingBuffer) -> Result<Vec<u8>> {
        let mut out = vec![0u8; buf.get_total_size()];
        let len = buf.pull(&mut out)?;
        out.truncate(len);
        Ok(out)
    }

    #[test]
    fn init_rejects_min_above_max() {
        assert!(matches!(
            DynamicRingBuffer::init(200, 100, 10),
            Err(BufferError::WrongParameter(_))
        ));
        assert!(matches!(
            DynamicRingBuffer::init(100, 200, 0),
            Err(BufferError::WrongParameter(_))
        ));
    }

    #[test]
    fn fifo_order() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(256, 256, 64)?;
        let records: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; i as usize + 1]).collect();
        for r in records.iter() {
            buf.push(r)?;
        }
        assert_eq!(buf.get_message_count(), 10);
        for r in records.iter() {
            assert_eq!(&pull_vec(&mut buf)?, r);
        }
        assert_eq!(buf.get_message_count(), 0);
        assert_eq!(buf.get_used_size(), 0);
        assert!(matches!(pull_vec(&mut buf), Err(BufferError::Empty)));
        Ok(())
    }

    #[test]
    fn push3_concatenates_parts() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(64, 64, 64)?;
        buf.push3(b"head", b"", b"tail")?;
        buf.push3(b"", b"", b"")?;
        assert_eq!(pull_vec(&mut buf)?, b"headtail".to_vec());
        assert_eq!(pull_vec(&mut buf)?, Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn grows_in_steps_until_max() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(50_000, 150_000, 50_000)?;
        let record = vec![0x5au8; 4096];
        let mut sizes = vec![buf.get_total_size()];
        let mut pushed = 0;
        loop {
            match buf.push(&record) {
                Ok(()) => pushed += 1,
                Err(BufferError::Full { .. }) => break,
                Err(e) => return Err(e.into()),
            }
            assert!(buf.get_used_size() <= 150_000);
            if *sizes.last().unwrap() != buf.get_total_size() {
                sizes.push(buf.get_total_size());
            }
        }
        assert_eq!(sizes, vec![50_000, 100_000, 150_000]);
        assert_eq!(pushed, 150_000 / (4096 + FRAME_HEADER_SIZE));

        let count = buf.get_message_count();
        let used = buf.get_used_size();
        assert!(matches!(buf.push(&record), Err(BufferError::Full { .. })));
        assert_eq!(buf.get_message_count(), count);
        assert_eq!(buf.get_used_size(), used);
        assert_eq!(buf.get_total_size(), 150_000);
        Ok(())
    }

    #[test]
    fn oversized_record_is_rejected_without_growth() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(100, 300, 100)?;
        buf.push(b"keep")?;
        assert!(matches!(buf.push(&[1u8; 400]), Err(BufferError::Full { .. })));
        assert_eq!(buf.get_total_size(), 100);
        assert_eq!(buf.get_message_count(), 1);
        assert_eq!(pull_vec(&mut buf)?, b"keep".to_vec());
        Ok(())
    }

    #[test]
    fn pull_into_small_buffer_keeps_record() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(64, 64, 64)?;
        buf.push(b"0123456789")?;
        let mut small = [0u8; 4];
        assert!(matches!(buf.pull(&mut small), Err(BufferError::WrongParameter(_))));
        assert_eq!(buf.get_message_count(), 1);
        assert_eq!(pull_vec(&mut buf)?, b"0123456789".to_vec());
        Ok(())
    }

    #[test]
    fn copy_and_get_do_not_remove() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(128, 128, 64)?;
        buf.push(b"first")?;
        buf.push(b"second")?;
        let mut out = [0u8; 16];
        assert_eq!(buf.copy(&mut out)?, 5);
        assert_eq!(buf.get(&mut out, false)?, 5);
        assert_eq!(&out[..5], b"first");
        assert_eq!(buf.get_at(1, &mut out)?, 6);
        assert_eq!(&out[..6], b"second");
        assert!(matches!(buf.get_at(2, &mut out), Err(BufferError::Empty)));
        assert_eq!(buf.get_message_count(), 2);
        assert_eq!(buf.get(&mut out, true)?, 5);
        assert_eq!(buf.get_message_count(), 1);
        Ok(())
    }

    #[test]
    fn remove_discards_oldest() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(128, 128, 64)?;
        buf.push(b"drop")?;
        buf.push(b"keep")?;
        assert_eq!(buf.remove()?, 4);
        assert_eq!(pull_vec(&mut buf)?, b"keep".to_vec());
        assert!(matches!(buf.remove(), Err(BufferError::Empty)));
        Ok(())
    }

    #[test]
    fn wraps_at_physical_end() -> std::result::Result<(), Box<dyn Error>> {
        // 3 frames of 25 bytes in a 100 byte ring, then free the first two so
        // the next frame cannot fit at the tail.
        let mut buf = DynamicRingBuffer::init(100, 100, 100)?;
        for i in 0..3u8 {
            buf.push(&[i; 20])?;
        }
        buf.remove()?;
        buf.remove()?;
        buf.push(&[7u8; 40])?;
        assert_eq!(buf.get_total_size(), 100);
        assert_eq!(buf.cursors.write, 45);
        assert_eq!(buf.mem[75], FrameStatus::Unused as u8);
        assert_eq!(pull_vec(&mut buf)?, vec![2u8; 20]);
        assert_eq!(pull_vec(&mut buf)?, vec![7u8; 40]);
        Ok(())
    }

    #[test]
    fn fragmented_ring_is_compacted_before_growing() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(100, 200, 100)?;
        for i in 0..3u8 {
            buf.push(&[i; 20])?;
        }
        buf.remove()?;
        // 50 live bytes, read at 25: a 45 byte frame fits neither at the tail
        // nor before read, but fits after compaction.
        buf.push(&[9u8; 40])?;
        assert_eq!(buf.get_total_size(), 100);
        assert_eq!(buf.iter().collect::<Vec<_>>(), vec![&[1u8; 20][..], &[2u8; 20][..], &[9u8; 40][..]]);
        Ok(())
    }

    #[test]
    fn explicit_resize() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(100, 300, 100)?;
        buf.increase_size()?;
        buf.increase_size()?;
        assert_eq!(buf.get_total_size(), 300);
        assert!(matches!(buf.increase_size(), Err(BufferError::Full { .. })));

        buf.push(&[3u8; 120])?;
        buf.minimize_size()?;
        assert_eq!(buf.get_total_size(), 200);
        assert_eq!(pull_vec(&mut buf)?, vec![3u8; 120]);
        buf.minimize_size()?;
        assert_eq!(buf.get_total_size(), 100);
        Ok(())
    }

    #[test]
    fn reset_drops_everything() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(64, 64, 64)?;
        buf.push(b"abc")?;
        buf.reset();
        assert_eq!(buf.get_message_count(), 0);
        assert_eq!(buf.get_used_size(), 0);
        assert!(matches!(buf.remove(), Err(BufferError::Empty)));
        Ok(())
    }

    #[test]
    fn corrupt_frame_resets_buffer() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(64, 64, 64)?;
        buf.push(b"abc")?;
        buf.mem[0] = 0x7f;
        let mut out = [0u8; 8];
        assert!(matches!(buf.pull(&mut out), Err(BufferError::Corrupt(_))));
        assert_eq!(buf.get_message_count(), 0);
        buf.push(b"xyz")?;
        assert_eq!(pull_vec(&mut buf)?, b"xyz".to_vec());
        Ok(())
    }

    #[test]
    fn resend_stops_at_first_refusal() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(128, 128, 64)?;
        for r in [&b"a"[..], &b"bb"[..], &b"ccc"[..]].iter() {
            buf.push(r)?;
        }
        let mut seen = Vec::new();
        let sent = buf.resend_with(|r| {
            seen.push(r.to_vec());
            r.len() < 2
        })?;
        assert_eq!(sent, 1);
        assert_eq!(seen, vec![b"a".to_vec(), b"bb".to_vec()]);
        assert_eq!(buf.get_message_count(), 2);
        assert_eq!(buf.resend_with(|_| true)?, 2);
        assert_eq!(buf.get_message_count(), 0);
        Ok(())
    }
}
