use bpf_ringbuf::{MapFd, MemfdRing, Reader, RingSource};
use clap::Parser;
use eyre::{Result, WrapErr};
use ringtail::{drain, format_record, spawn_demo_producer, Config};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "ringtail")]
#[command(about = "Drain records from a BPF ring buffer map", long_about = None)]
struct Args {
    #[arg(short, long, help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Pinned ring buffer map, e.g. /sys/fs/bpf/events")]
    pin: Option<PathBuf>,

    #[arg(short = 'n', long, help = "Stop after this many records")]
    max_records: Option<u64>,

    #[arg(short, long, help = "Per-read deadline in milliseconds")]
    timeout_ms: Option<u64>,

    #[arg(long, help = "Capacity of the demo ring when no map is pinned")]
    capacity: Option<usize>,

    #[arg(long, help = "Log filter, overridden by RUST_LOG")]
    log_filter: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(pin) = self.pin {
            config.pin_path = Some(pin);
        }
        if let Some(max_records) = self.max_records {
            config.max_records = Some(max_records);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(log_filter) = self.log_filter {
            config.log_filter = log_filter;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
    debug!(?config, "ringtail configuration");

    match config.pin_path.clone() {
        Some(pin) => {
            let map = MapFd::from_pinned(&pin)
                .wrap_err_with(|| format!("failed to open pinned map {}", pin.display()))?;
            info!(
                path = %pin.display(),
                id = map.id(),
                name = map.name(),
                capacity = map.max_entries(),
                "tailing pinned map"
            );
            tail(&map, &config)
        }
        None => {
            let ring = MemfdRing::new(config.capacity).wrap_err("failed to create demo ring")?;
            let stop = Arc::new(AtomicBool::new(false));
            let producer = spawn_demo_producer(
                &ring,
                Duration::from_millis(config.demo_interval_ms),
                stop.clone(),
            )?;
            info!(capacity = ring.capacity(), "tailing demo ring");

            let result = tail(&ring, &config);
            stop.store(true, Ordering::Relaxed);
            let produced = producer
                .join()
                .map_err(|_| eyre::eyre!("demo producer panicked"))?;
            debug!(produced, "demo producer stopped");
            result
        }
    }
}

fn tail<S: RingSource + ?Sized>(source: &S, config: &Config) -> Result<()> {
    let reader = Reader::new(source).wrap_err("failed to create reader")?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let summary = drain(&reader, config, |index, record| {
        writeln!(out, "{}", format_record(index, record))?;
        Ok(())
    })?;
    reader.close()?;

    info!(
        records = summary.records,
        bytes = summary.bytes,
        timeouts = summary.timeouts,
        "done"
    );
    Ok(())
}
