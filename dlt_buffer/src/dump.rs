//! Writes the queued records of a ring buffer to a file, e.g. when the daemon
//! is asked to persist what it could not deliver yet.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{error, info};

use crate::errors::Result;
use crate::ring::DynamicRingBuffer;

/// Writes every queued record, oldest first, each preceded by `prefix`.
/// The buffer is left untouched. Returns the number of records written.
pub fn dump_to<W: Write>(buffer: &DynamicRingBuffer, prefix: &[u8], writer: &mut W) -> Result<usize> {
    let mut written = 0;
    for record in buffer.iter() {
        writer.write_all(prefix)?;
        writer.write_all(record)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

pub fn dump<P: AsRef<Path>>(buffer: &DynamicRingBuffer, prefix: &[u8], path: P) -> Result<usize> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "could not open dump file");
        e
    })?;
    let mut writer = BufWriter::new(file);
    let written = dump_to(buffer, prefix, &mut writer)?;
    info!(path = %path.display(), records = written, "ring buffer dumped");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn dump_writes_prefixed_records() -> std::result::Result<(), Box<dyn Error>> {
        let mut buf = DynamicRingBuffer::init(256, 256, 64)?;
        buf.push(b"first")?;
        buf.push3(b"sec", b"", b"ond")?;

        let dir = tempdir()?;
        let path = dir.path().join("ring.dlt");
        assert_eq!(dump(&buf, b"DLT\x01", &path)?, 2);
        assert_eq!(fs::read(&path)?, b"DLT\x01firstDLT\x01second".to_vec());
        assert_eq!(buf.get_message_count(), 2);
        Ok(())
    }

    #[test]
    fn dump_of_empty_buffer_creates_empty_file() -> std::result::Result<(), Box<dyn Error>> {
        let buf = DynamicRingBuffer::init(64, 64, 64)?;
        let mut out = Vec::new();
        assert_eq!(dump_to(&buf, b"hdr", &mut out)?, 0);
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn dump_to_missing_directory_fails() -> std::result::Result<(), Box<dyn Error>> {
        let buf = DynamicRingBuffer::init(64, 64, 64)?;
        let dir = tempdir()?;
        let res = dump(&buf, b"", dir.path().join("missing").join("ring.dlt"));
        assert!(matches!(res, Err(crate::BufferError::Io(_))));
        Ok(())
    }
}
