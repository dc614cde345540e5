pub mod core;
pub mod dump;
mod errors;
pub mod ring;
pub mod shm;

#[cfg(test)]
mod tests;

pub use crate::core::{LockKind, RingConfig, ShmConfig};
pub use errors::{BufferError, Result};
pub use ring::DynamicRingBuffer;
pub use shm::{SharedCircularBuffer, StallWatch};
