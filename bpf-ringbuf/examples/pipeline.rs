use bpf_ringbuf::{MemfdRing, Reader, Record, RingBufError, WakeupStrategy};
use clap::Parser;
use eyre::{Result, WrapErr};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use hdrhistogram::Histogram;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[clap(name = "pipeline")]
#[clap(about = "Producer thread feeding a ring buffer reader", long_about = None)]
struct Args {
    #[clap(short, long, default_value_t = 1024)]
    capacity_kb: usize,

    #[clap(short, long, default_value_t = 100_000)]
    rate: u32,

    #[clap(short, long, default_value_t = 64)]
    message_size: usize,

    #[clap(short, long, default_value_t = 10)]
    duration_secs: u64,

    #[clap(short, long, default_value_t = 100)]
    timeout_ms: u64,

    #[clap(short, long, default_value = "forced", value_parser = parse_wakeup_strategy)]
    wakeup_strategy: WakeupStrategy,
}

fn parse_wakeup_strategy(strategy: &str) -> Result<WakeupStrategy, String> {
    match strategy.to_lowercase().as_str() {
        "forced" => Ok(WakeupStrategy::Forced),
        "no-wakeup" | "nowakeup" => Ok(WakeupStrategy::NoWakeup),
        _ => Err(format!(
            "Invalid wakeup strategy: {}. Valid options: forced, no-wakeup",
            strategy
        )),
    }
}

const HEADER_LEN: usize = 16;

fn wait_for_permit(limiter: &DefaultDirectRateLimiter, clock: &DefaultClock) {
    while let Err(not_until) = limiter.check() {
        thread::sleep(not_until.wait_time_from(clock.now()));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    debug!(?args, "pipeline configuration");

    let ring = MemfdRing::new(args.capacity_kb * 1024).wrap_err("failed to create ring")?;
    let producer = ring
        .producer(args.wakeup_strategy)
        .wrap_err("failed to map producer")?;
    let reader = Reader::new(&ring).wrap_err("failed to create reader")?;
    let start_time = Instant::now();
    let stop = Arc::new(AtomicBool::new(false));

    info!(
        capacity = ring.capacity(),
        rate = args.rate,
        message_size = args.message_size,
        wakeup_strategy = ?args.wakeup_strategy,
        "starting pipeline"
    );

    let rate = NonZeroU32::new(args.rate).ok_or_else(|| eyre::eyre!("rate must be non-zero"))?;
    let limiter = RateLimiter::direct(Quota::per_second(rate));

    let producer_thread = {
        let stop = stop.clone();
        let message_size = args.message_size.max(HEADER_LEN);
        thread::spawn(move || {
            let clock = DefaultClock::default();
            let mut sequence = 0u64;
            let mut dropped = 0u64;
            while !stop.load(Ordering::Relaxed) {
                wait_for_permit(&limiter, &clock);
                match producer.reserve(message_size) {
                    Ok(mut reserved) => {
                        let timestamp = start_time.elapsed().as_nanos() as u64;
                        reserved[..8].copy_from_slice(&timestamp.to_le_bytes());
                        reserved[8..16].copy_from_slice(&sequence.to_le_bytes());
                        sequence += 1;
                    }
                    Err(RingBufError::InsufficientSpace { .. }) => dropped += 1,
                    Err(e) => {
                        warn!(error = %e, "producer failed");
                        break;
                    }
                }
            }
            (sequence, dropped)
        })
    };

    let mut histogram = Histogram::<u64>::new(3)?;
    let mut record = Record::with_capacity(args.message_size.max(HEADER_LEN));
    let mut last_sequence = None;
    let mut gaps = 0u64;
    let end = start_time + Duration::from_secs(args.duration_secs);

    while Instant::now() < end {
        reader.set_deadline(Some(Instant::now() + Duration::from_millis(args.timeout_ms)));
        match reader.read_into(&mut record) {
            Ok(()) => {}
            Err(RingBufError::DeadlineExceeded) => {
                debug!("no records before deadline");
                continue;
            }
            Err(e) => return Err(e).wrap_err("read failed"),
        }

        let data = record.as_slice();
        let send_time = u64::from_le_bytes(data[0..8].try_into()?);
        let sequence = u64::from_le_bytes(data[8..16].try_into()?);
        let receive_time = start_time.elapsed().as_nanos() as u64;
        let latency_us = receive_time.saturating_sub(send_time) / 1000;
        histogram.record(latency_us)?;

        if let Some(last) = last_sequence {
            if sequence != last + 1 {
                gaps += 1;
            }
        }
        last_sequence = Some(sequence);
    }

    stop.store(true, Ordering::Relaxed);
    let (sent, dropped) = producer_thread
        .join()
        .map_err(|_| eyre::eyre!("producer thread panicked"))?;
    reader.close()?;

    info!(
        sent,
        dropped,
        received = histogram.len(),
        gaps,
        elapsed_secs = start_time.elapsed().as_secs(),
        "pipeline finished"
    );
    if !histogram.is_empty() {
        info!(
            p50_us = histogram.value_at_quantile(0.50),
            p90_us = histogram.value_at_quantile(0.90),
            p99_us = histogram.value_at_quantile(0.99),
            max_us = histogram.max(),
            "latency percentiles"
        );
    }

    Ok(())
}
