use std::{fmt, io};

pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Debug)]
pub enum BufferError {
    WrongParameter(String),
    Full { needed: usize, free: usize },
    Empty,
    // The oldest frame is still being written by its producer.
    NotReady,
    // The buffer has already been reset or resynchronised when this is returned.
    Corrupt(String),
    LockTimeout,
    InitFailure(String),
    SharedMemory(shared_memory::ShmemError),
    Lock(String),
    Io(io::Error),
}

impl BufferError {
    /// Whether the same call may succeed later without any intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BufferError::Full { .. }
                | BufferError::Empty
                | BufferError::NotReady
                | BufferError::LockTimeout
        )
    }
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::WrongParameter(s) => write!(f, "Wrong parameter: {}", s),
            BufferError::Full { needed, free } => {
                write!(f, "Buffer full: {} bytes needed, {} bytes free", needed, free)
            }
            BufferError::Empty => write!(f, "Buffer empty"),
            BufferError::NotReady => write!(f, "Frame not completely written yet"),
            BufferError::Corrupt(s) => write!(f, "Buffer corrupt: {}", s),
            BufferError::LockTimeout => write!(f, "Timed out waiting for buffer lock"),
            BufferError::InitFailure(s) => write!(f, "Initialisation failed: {}", s),
            BufferError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            BufferError::Lock(s) => write!(f, "Lock error: {}", s),
            BufferError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for BufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BufferError::SharedMemory(e) => Some(e),
            BufferError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<shared_memory::ShmemError> for BufferError {
    fn from(err: shared_memory::ShmemError) -> Self {
        BufferError::SharedMemory(err)
    }
}

impl From<io::Error> for BufferError {
    fn from(err: io::Error) -> Self {
        BufferError::Io(err)
    }
}

// raw_sync reports failures as Box<dyn Error> without Send + Sync, so only the
// message is kept.
pub(crate) fn lock_error(err: Box<dyn std::error::Error>) -> BufferError {
    BufferError::Lock(err.to_string())
}
