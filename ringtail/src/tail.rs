use bpf_ringbuf::{MemfdRing, Reader, Record, RingBufError, WakeupStrategy};
use eyre::{Result, WrapErr};
use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter};
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub records: u64,
    pub bytes: u64,
    pub timeouts: u64,
}

/// Reads records into `sink` until `max_records` is reached or the reader
/// is closed. Expired deadlines are counted and reading continues.
pub fn drain<F>(reader: &Reader, config: &Config, mut sink: F) -> Result<Summary>
where
    F: FnMut(u64, &Record) -> Result<()>,
{
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut record = Record::new();
    let mut summary = Summary::default();

    loop {
        if config.max_records.is_some_and(|max| summary.records >= max) {
            break;
        }

        reader.set_deadline(Some(Instant::now() + timeout));
        match reader.read_into(&mut record) {
            Ok(()) => {
                sink(summary.records, &record)?;
                summary.records += 1;
                summary.bytes += record.len() as u64;
            }
            Err(RingBufError::DeadlineExceeded) => {
                summary.timeouts += 1;
                debug!(
                    timeout_ms = config.timeout_ms,
                    records = summary.records,
                    "no records before deadline"
                );
            }
            Err(RingBufError::Closed) => {
                debug!("reader closed");
                break;
            }
            Err(e) => return Err(e).wrap_err("failed to read ring buffer"),
        }
    }

    Ok(summary)
}

/// One line per record: index, length, bytes still queued, hex payload.
pub fn format_record(index: u64, record: &Record) -> String {
    let mut line = format!(
        "#{} len={} remaining={} ",
        index,
        record.len(),
        record.remaining()
    );
    for byte in record.as_slice() {
        let _ = write!(line, "{:02x}", byte);
    }
    line
}

/// Feeds `ring` with numbered text records, one per `interval`, until `stop`
/// is set. Every seventh reservation is discarded, which the reader skips.
pub fn spawn_demo_producer(
    ring: &MemfdRing,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<u64>> {
    let quota = Quota::with_period(interval)
        .ok_or_else(|| eyre::eyre!("demo producer interval must be non-zero"))?;
    let limiter = RateLimiter::direct(quota);
    let producer = ring
        .producer(WakeupStrategy::Forced)
        .wrap_err("failed to map demo producer")?;

    Ok(thread::spawn(move || {
        let clock = DefaultClock::default();
        let mut sequence = 0u64;
        while !stop.load(Ordering::Relaxed) {
            if let Err(not_until) = limiter.check() {
                thread::sleep(not_until.wait_time_from(clock.now()));
                continue;
            }
            let payload = format!("demo record {}", sequence);
            match producer.reserve(payload.len()) {
                Ok(reserved) if sequence % 7 == 6 => reserved.discard(),
                Ok(mut reserved) => reserved.copy_from_slice(payload.as_bytes()),
                Err(e) => warn!(error = %e, sequence, "demo producer reserve failed"),
            }
            sequence += 1;
        }
        sequence
    }))
}
