use serde_derive::{Deserialize, Serialize};

use crate::errors::{BufferError, Result};

pub const DEFAULT_RING_MIN_SIZE: usize = 50_000;
pub const DEFAULT_RING_MAX_SIZE: usize = 500_000;
pub const DEFAULT_RING_STEP_SIZE: usize = 50_000;

pub const DEFAULT_SHM_KEY: i32 = 11771;
pub const DEFAULT_SHM_SIZE: usize = 1024 * 4000;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 100;

/// Sizing of a `DynamicRingBuffer`, in bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub step_size: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            min_size: DEFAULT_RING_MIN_SIZE,
            max_size: DEFAULT_RING_MAX_SIZE,
            step_size: DEFAULT_RING_STEP_SIZE,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.max_size == 0 || self.step_size == 0 {
            return Err(BufferError::WrongParameter(
                "min, max and step size must be non-zero".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(BufferError::WrongParameter(format!(
                "min size {} exceeds max size {}",
                self.min_size, self.max_size
            )));
        }
        if self.step_size > self.max_size {
            return Err(BufferError::WrongParameter(format!(
                "step size {} exceeds max size {}",
                self.step_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// How the control words of a shared buffer are protected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// System V semaphore taken with SEM_UNDO; released by the kernel if the
    /// holder dies. Linux and Android only.
    Semaphore,
    /// Process-shared mutex stored inside the segment. Stays locked if the
    /// holder dies.
    Mutex,
}

impl Default for LockKind {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn default() -> Self {
        LockKind::Semaphore
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn default() -> Self {
        LockKind::Mutex
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmConfig {
    pub key: i32,
    /// Requested size; the data region is this minus the control words.
    pub size: usize,
    #[serde(default)]
    pub lock: LockKind,
    pub lock_timeout_ms: u64,
}

impl Default for ShmConfig {
    fn default() -> Self {
        ShmConfig {
            key: DEFAULT_SHM_KEY,
            size: DEFAULT_SHM_SIZE,
            lock: LockKind::default(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl ShmConfig {
    pub fn builder() -> ShmConfigBuilder {
        ShmConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ShmConfigBuilder {
    key: Option<i32>,
    size: Option<usize>,
    lock: Option<LockKind>,
    lock_timeout_ms: Option<u64>,
}

impl ShmConfigBuilder {
    pub fn key(mut self, key: i32) -> Self {
        self.key = Some(key);
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn lock(mut self, lock: LockKind) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn lock_timeout_ms(mut self, lock_timeout_ms: u64) -> Self {
        self.lock_timeout_ms = Some(lock_timeout_ms);
        self
    }

    pub fn build(self) -> Result<ShmConfig> {
        let defaults = ShmConfig::default();
        let cfg = ShmConfig {
            key: self.key.unwrap_or(defaults.key),
            size: self.size.unwrap_or(defaults.size),
            lock: self.lock.unwrap_or(defaults.lock),
            lock_timeout_ms: self.lock_timeout_ms.unwrap_or(defaults.lock_timeout_ms),
        };
        if cfg.size > i32::MAX as usize {
            return Err(BufferError::WrongParameter(format!(
                "shared memory size {} does not fit the control words",
                cfg.size
            )));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_defaults_are_valid() {
        assert!(RingConfig::default().validate().is_ok());
    }

    #[test]
    fn ring_rejects_bad_limits() {
        let cases = [
            RingConfig { min_size: 0, max_size: 10, step_size: 1 },
            RingConfig { min_size: 20, max_size: 10, step_size: 1 },
            RingConfig { min_size: 10, max_size: 10, step_size: 0 },
            RingConfig { min_size: 10, max_size: 10, step_size: 11 },
        ];
        for cfg in cases.iter() {
            assert!(
                matches!(cfg.validate(), Err(BufferError::WrongParameter(_))),
                "{:?} should be rejected",
                cfg
            );
        }
    }

    #[test]
    fn builder_fills_defaults() {
        let cfg = ShmConfig::builder().key(4242).build().unwrap();
        assert_eq!(cfg.key, 4242);
        assert_eq!(cfg.size, DEFAULT_SHM_SIZE);
        assert_eq!(cfg.lock, LockKind::default());
        assert_eq!(cfg.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
    }

    #[test]
    fn builder_rejects_oversized_segment() {
        let res = ShmConfig::builder().size(i32::MAX as usize + 1).build();
        assert!(matches!(res, Err(BufferError::WrongParameter(_))));
    }
}
