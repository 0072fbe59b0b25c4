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
#[command(about = "Drain messages from a shared-memory queue")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "hyperq-consumer.toml")]
    config: String,
    #[arg(short = 'n', long = "messages", default_value_t = 10_000)]
    messages: u64,
    /// Print every payload length while draining.
    #[arg(long)]
    verbose: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ConsumerConfig {
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
    let cfg: ConsumerConfig = confy::load_path(&opts.config)?;
    let queue = HyperQueue::open(&cfg.queue)?;
    println!(
        "queue '{}' attached, capacity {} bytes, {} bytes pending",
        queue.name(),
        queue.capacity(),
        queue.size()?
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
    let start = Instant::now();
    let mut received = 0u64;
    let mut payload_bytes = 0u64;
    while received < opts.messages {
        if closing.load(Ordering::Relaxed) {
            println!("interrupted after {} messages", received);
            break;
        }
        let message = queue.get()?;
        payload_bytes += message.len() as u64;
        received += 1;
        if opts.verbose {
            println!("message {}: {} bytes", received, message.len());
        }
    }
    let duration = start.elapsed();
    let rate = received as f64 / duration.as_secs_f64();
    println!(
        "received {} messages, {} payload bytes in {:?} ({:.0}K msg/s)",
        received,
        payload_bytes,
        duration,
        rate / 1000.0
    );
    Ok(())
}
