use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use hyperq::{HyperQueue, QueueConfig};

#[derive(Parser)]
#[command(about = "Feed messages into a shared-memory queue")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "hyperq-producer.toml")]
    config: String,
    #[arg(short = 'n', long = "messages", default_value_t = 10_000)]
    messages: u64,
    #[arg(long = "payload-size", default_value_t = 100)]
    payload_size: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ProducerConfig {
    queue: QueueConfig,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let opts = Opts::parse();
    let cfg: ProducerConfig = confy::load_path(&opts.config)?;
    let queue = HyperQueue::open(&cfg.queue)?;
    println!(
        "queue '{}' ready, capacity {} bytes",
        queue.name(),
        queue.capacity()
    );

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    {
        let closing = Arc::clone(&closing);
        thread::spawn(move || {
            if signals.forever().next().is_some() {
                closing.store(true, Ordering::SeqCst);
            }
        });
    }

    run(&queue, &opts, closing.as_ref())
}

fn run(queue: &HyperQueue, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let payload = vec![0x5Au8; opts.payload_size];
    let start = Instant::now();
    let mut sent = 0u64;
    while sent < opts.messages {
        if closing.load(Ordering::Relaxed) {
            println!("interrupted after {} messages", sent);
            break;
        }
        queue.put(&payload)?;
        sent += 1;
    }
    let duration = start.elapsed();
    let rate = sent as f64 / duration.as_secs_f64();
    println!(
        "sent {} messages of {} bytes in {:?} ({:.0}K msg/s)",
        sent,
        opts.payload_size,
        duration,
        rate / 1000.0
    );
    Ok(())
}
