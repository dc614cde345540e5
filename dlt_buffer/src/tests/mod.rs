use std::sync::atomic::{AtomicI32, Ordering};


static NEXT_KEY: AtomicI32 = AtomicI32::new(0);

/// Shared-memory key unique to this test process.
pub(crate) fn unique_key() -> i32 {
    let pid = std::process::id() as i32 & 0x3fff;
    0x2000_0000 | (pid << 12) | (NEXT_KEY.fetch_add(1, Ordering::SeqCst) & 0xfff)
}
