use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dlt_buffer::{
    BufferError, DynamicRingBuffer, RingConfig, SharedCircularBuffer, ShmConfig, StallWatch,
};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "dlt-shm-bench.toml")]
    config: String,
    /// Overrides `messages` from the config file.
    #[clap(short = 'n', long = "messages")]
    messages: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    shm: ShmConfig,
    /// Producer-side buffer for records the segment refuses.
    ring: RingConfig,
    messages: u64,
    record_size: usize,
    /// How long an unfinished frame may block the consumer before it is skipped.
    stall_timeout_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            shm: ShmConfig::default(),
            ring: RingConfig::default(),
            messages: 1_000_000,
            record_size: 256,
            stall_timeout_ms: 1000,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: BenchConfig = confy::load_path(&opts.config)?;
    if let Some(messages) = opts.messages {
        cfg.messages = messages;
    }

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    let server = SharedCircularBuffer::server(&cfg.shm)?;
    server.info();

    let producer = {
        let cfg = cfg.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let res = produce(&cfg, &stop).map_err(|e| e.to_string());
            if res.is_err() {
                stop.store(true, Ordering::Relaxed);
            }
            res
        })
    };

    let received = consume(&server, &cfg, &stop);
    stop.store(true, Ordering::Relaxed);

    let produced = match producer.join() {
        Ok(res) => res?,
        Err(_) => return Err("producer thread panicked".into()),
    };
    let received = received?;
    server.status()?;
    server.free_server()?;

    info!(produced, received, "benchmark finished");
    Ok(())
}

fn record(seq: u64, size: usize) -> Vec<u8> {
    let mut buf = vec![(seq % 251) as u8; size.max(8)];
    buf[..8].copy_from_slice(&seq.to_le_bytes());
    buf
}

/// Pushes `cfg.messages` records through a client handle, parking the ones
/// the segment refuses in a local ring buffer until there is room again.
fn produce(cfg: &BenchConfig, stop: &AtomicBool) -> Result<u64, BufferError> {
    let client = SharedCircularBuffer::client(&cfg.shm)?;
    let mut pending = DynamicRingBuffer::from_config(&cfg.ring)?;
    let start = Instant::now();
    let mut seq = 0u64;
    let mut parked = 0u64;

    while !stop.load(Ordering::Relaxed) && (seq < cfg.messages || pending.get_message_count() > 0) {
        if pending.get_message_count() > 0 {
            pending.resend_with(|r| client.push(r).is_ok())?;
        }
        if seq >= cfg.messages {
            thread::sleep(Duration::from_micros(50));
            continue;
        }
        let msg = record(seq, cfg.record_size);
        let delivered = pending.get_message_count() == 0
            && match client.push(&msg) {
                Ok(()) => true,
                Err(e) if e.is_transient() => false,
                Err(e) => return Err(e),
            };
        if !delivered {
            match pending.push(&msg) {
                Ok(()) => parked += 1,
                Err(BufferError::Full { .. }) => {
                    thread::sleep(Duration::from_micros(50));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        seq += 1;
        if seq % 100_000 == 0 {
            debug!(seq, pending = pending.get_message_count(), "producer progress");
        }
    }

    let duration = start.elapsed();
    info!(
        messages = seq,
        parked,
        ops_per_sec = (seq as f64 / duration.as_secs_f64()) as u64,
        ?duration,
        "producer done"
    );
    pending.info();
    client.free_client()?;
    Ok(seq)
}

fn consume(server: &SharedCircularBuffer, cfg: &BenchConfig, stop: &AtomicBool) -> Result<u64, BufferError> {
    let expected = cfg.messages;
    let mut watch = StallWatch::new(Duration::from_millis(cfg.stall_timeout_ms));
    let start = Instant::now();
    let mut out = vec![0u8; server.capacity()];
    let mut received = 0u64;

    while received < expected && !stop.load(Ordering::Relaxed) {
        match server.pull(&mut out) {
            Ok(len) => {
                if len >= 8 {
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&out[..8]);
                    let seq = u64::from_le_bytes(seq);
                    if seq != received {
                        warn!(seq, expected = received, "record out of order");
                    }
                }
                received += 1;
            }
            Err(BufferError::NotReady) => {
                if server.recover_if_stalled(&mut watch)? {
                    warn!("skipped a frame its producer never finished");
                }
                thread::sleep(Duration::from_micros(20));
            }
            Err(e) if e.is_transient() => thread::sleep(Duration::from_micros(20)),
            Err(BufferError::Corrupt(reason)) => warn!(%reason, "skipped damaged record"),
            Err(e) => return Err(e),
        }
    }

    let duration = start.elapsed();
    info!(
        messages = received,
        ops_per_sec = (received as f64 / duration.as_secs_f64()) as u64,
        ?duration,
        "consumer done"
    );
    Ok(received)
}
