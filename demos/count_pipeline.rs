//! Counting pipeline
//!
//! Checks the buffer and a three-stage chain on one thread, then runs the chain
//! on three threads while a producer publishes 1..=COUNT. Every stage asserts it
//! sees each value exactly once and in order.
//!
//! Usage: cargo run --example count_pipeline --release -- 1000000
//!        (RUST_LOG=debug shows stage start/stop)

use ring_pipeline::{PipelineBuilder, RingBuffer, Stage, WaitStrategy};
use std::env;
use std::thread;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CAPACITY: usize = 1 << 15;
const DEFAULT_COUNT: u64 = 1_000_000;

fn check_buffer() -> ring_pipeline::Result<()> {
    let mut buffer = RingBuffer::<u64>::new(CAPACITY)?;
    assert!(buffer.is_empty());

    *buffer.begin_push() = 1;
    // Nothing is visible until the push is published.
    assert!(buffer.is_empty());
    buffer.end_push();
    assert_eq!(buffer.len(), 1);
    assert_eq!(*buffer.at(0), 1);

    assert_eq!(*buffer.begin_pop(), 1);
    buffer.end_pop();
    assert!(buffer.is_empty());

    for i in 0..buffer.capacity() {
        buffer.push(i as u64)?;
        assert_eq!(buffer.len(), i + 1);
    }
    assert!(buffer.is_full());
    Ok(())
}

fn check_chain() -> ring_pipeline::Result<()> {
    let (mut producer, mut stages) = three_stage_chain(WaitStrategy::BusySpin)?;

    producer.push(1);
    for stage in stages.iter_mut() {
        assert_eq!(*stage.begin(), 1);
        stage.end();
    }
    assert!(producer.is_empty());

    for i in 0..5 {
        producer.push(i);
    }
    assert_eq!(producer.len(), 5);
    for i in 0..5 {
        for stage in stages.iter_mut() {
            assert_eq!(*stage.begin(), i);
            stage.end();
        }
        assert_eq!(producer.len() as u64, 4 - i);
    }
    assert!(producer.is_empty());
    Ok(())
}

fn three_stage_chain(
    strategy: WaitStrategy,
) -> ring_pipeline::Result<(ring_pipeline::Producer<u64>, Vec<Stage<u64>>)> {
    let mut builder = PipelineBuilder::<u64>::new(CAPACITY).with_wait_strategy(strategy);
    let one = builder.attach("one", None)?;
    let two = builder.attach("two", Some(one))?;
    builder.attach("three", Some(two))?;
    Ok(builder.build()?.split())
}

fn run_reader(mut stage: Stage<u64>, count: u64) {
    let mut last = 0;
    while last < count {
        let value = *stage.begin();
        assert_eq!(value, last + 1, "stage '{}' out of order", stage.name());
        last = value;
        stage.end();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_names(true)
        .init();

    let count = match env::args().nth(1) {
        Some(arg) => arg.parse::<u64>()?,
        None => DEFAULT_COUNT,
    };

    check_buffer()?;
    check_chain()?;
    info!("single-thread checks passed");

    let (mut producer, stages) = three_stage_chain(WaitStrategy::Yielding)?;
    let start = Instant::now();

    let readers: Vec<_> = stages
        .into_iter()
        .rev()
        .map(|stage| {
            thread::Builder::new()
                .name(format!("reader-{}", stage.name()))
                .spawn(move || run_reader(stage, count))
        })
        .collect::<Result<_, _>>()?;

    let writer = thread::Builder::new()
        .name("writer".into())
        .spawn(move || {
            for i in 1..=count {
                *producer.begin_push_wait() = i;
                producer.end_push();
            }
        })?;

    writer.join().map_err(|_| "writer panicked")?;
    for reader in readers {
        reader.join().map_err(|_| "reader panicked")?;
    }

    let elapsed = start.elapsed();
    info!(
        count,
        elapsed_ms = elapsed.as_millis() as u64,
        events_per_sec = count as f64 / elapsed.as_secs_f64(),
        "threaded three-stage run passed"
    );
    println!("{count} values through 3 stages in {:.3}s", elapsed.as_secs_f64());
    Ok(())
}
