//! Framing and placement rules shared by both buffers, plus their
//! configuration types.

use crate::errors::{BufferError, Result};

mod config;

pub use config::{LockKind, RingConfig, ShmConfig, ShmConfigBuilder};

pub const STATUS_SIZE: usize = 1;
pub const LENGTH_SIZE: usize = 4;
/// Fixed part of every frame: status byte followed by the length field.
pub const FRAME_HEADER_SIZE: usize = STATUS_SIZE + LENGTH_SIZE;

/// Marker placed after the header of shared-memory frames. The last byte is
/// the layout version.
pub const MAGIC: [u8; 4] = [b'S', b'H', b'M', 0x01];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameStatus {
    Unused = 0,
    Writing = 1,
    Complete = 2,
}

impl FrameStatus {
    pub fn from_byte(b: u8) -> Option<FrameStatus> {
        match b {
            0 => Some(FrameStatus::Unused),
            1 => Some(FrameStatus::Writing),
            2 => Some(FrameStatus::Complete),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub status: u8,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(status: FrameStatus, length: usize) -> FrameHeader {
        FrameHeader {
            status: status as u8,
            length: length as u32,
        }
    }

    /// Zero status and zero length: tells a reader to continue at offset 0.
    pub fn sentinel() -> FrameHeader {
        FrameHeader::new(FrameStatus::Unused, 0)
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0] = self.status;
        out[STATUS_SIZE..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<FrameHeader> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(BufferError::WrongParameter(format!(
                "frame header needs {} bytes, got {}",
                FRAME_HEADER_SIZE,
                bytes.len()
            )));
        }
        let length = bytes[STATUS_SIZE..FRAME_HEADER_SIZE]
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| BufferError::Corrupt("unreadable length field".to_string()))?;
        Ok(FrameHeader {
            status: bytes[0],
            length,
        })
    }

    pub fn status(&self) -> Option<FrameStatus> {
        FrameStatus::from_byte(self.status)
    }

    pub fn is_sentinel(&self) -> bool {
        self.status == FrameStatus::Unused as u8
    }
}

/// Write offset, read offset and record count of a cyclic buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Cursors {
    pub write: usize,
    pub read: usize,
    pub count: usize,
}

impl Cursors {
    pub fn is_full(&self) -> bool {
        self.count > 0 && self.read == self.write
    }

    /// Bytes between read and write, including any abandoned tail.
    pub fn used(&self, capacity: usize) -> usize {
        if self.count == 0 {
            0
        } else if self.write > self.read {
            self.write - self.read
        } else {
            capacity - self.read + self.write
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// The frame fits contiguously at this offset.
    At(usize),
    /// The frame goes to offset 0. `sentinel` is where the abandoned tail
    /// starts, if there is room there for a sentinel header.
    Wrap { sentinel: Option<usize> },
    Full,
}

/// Decides where a frame of `frame_len` bytes goes. Frames are never split
/// across the physical end of the backing array.
pub fn place(cursors: &Cursors, capacity: usize, frame_len: usize) -> Placement {
    let Cursors { write, read, .. } = *cursors;

    if frame_len > capacity || cursors.is_full() {
        Placement::Full
    } else if write >= capacity {
        if frame_len > read {
            Placement::Full
        } else {
            Placement::Wrap { sentinel: None }
        }
    } else if read > write {
        if write + frame_len > read {
            Placement::Full
        } else {
            Placement::At(write)
        }
    } else if write + frame_len <= capacity {
        Placement::At(write)
    } else if frame_len > read {
        Placement::Full
    } else {
        let sentinel = if write + FRAME_HEADER_SIZE <= capacity {
            Some(write)
        } else {
            None
        };
        Placement::Wrap { sentinel }
    }
}

/// True when no frame header can start at `read`, so the reader has to
/// continue at offset 0.
#[inline]
pub fn tail_too_short(read: usize, capacity: usize) -> bool {
    read + FRAME_HEADER_SIZE > capacity
}
