
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{HyperQueue, QueueConfig};

static TEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Every test gets its own kernel name so parallel test threads never
/// collide on a segment.
pub(crate) fn unique_name(tag: &str) -> String {
    format!(
        "hq{}-{}-{}",
        tag,
        process::id(),
        TEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

pub(crate) fn open_queue(tag: &str, capacity: u64) -> HyperQueue {
    let config = QueueConfig::builder()
        .name(unique_name(tag))
        .capacity(capacity)
        .build()
        .expect("test config must validate");
    HyperQueue::open(&config).expect("test queue must open")
}
