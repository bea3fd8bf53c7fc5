use crate::error::{violation, PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::pipeline::{Shared, StageId};
use crate::sequence::Sequence;
use crate::wait::{SpinWait, WaitStrategy};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// One consumer in a linear chain of stages.
///
/// A stage sees every published item exactly once and in order, but only after
/// its predecessor (or the producer, for the first stage) has finished with it.
/// The terminal stage's `end` frees the slot back to the producer.
pub struct Stage<T> {
    shared: Arc<Shared<T>>,
    id: StageId,
    predecessor: Option<StageId>,
    terminal: bool,
    /// Local copy of this stage's cursor.
    cursor: u64,
    /// Last gate value observed with `Acquire`; every sequence below it is ready.
    available: u64,
    claimed: bool,
    strategy: WaitStrategy,
    waits: u64,
}

// SAFETY: a stage only touches the slot it has claimed, through `&mut self`.
unsafe impl<T: Send> Send for Stage<T> {}

impl<T> Stage<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, id: StageId, strategy: WaitStrategy) -> Self {
        let slot = &shared.stages[id.index()];
        let predecessor = slot.predecessor;
        let terminal = slot.terminal;
        let cursor = slot.cursor.relaxed();
        Self {
            shared,
            id,
            predecessor,
            terminal,
            cursor,
            available: cursor,
            claimed: false,
            strategy,
            waits: 0,
        }
    }

    /// The counter this stage trails: its predecessor's cursor, or `head`.
    fn gate(&self) -> &Sequence {
        match self.predecessor {
            Some(p) => &self.shared.stages[p.index()].cursor,
            None => self.shared.ring.head(),
        }
    }

    fn has_ready(&mut self) -> bool {
        if self.available > self.cursor {
            return true;
        }
        self.available = self.gate().acquire();
        self.available > self.cursor
    }

    fn wait_ready<K>(&mut self, keep_going: K) -> bool
    where
        K: FnMut() -> bool,
    {
        if self.has_ready() {
            return true;
        }

        let gate = self.gate();
        let cursor = self.cursor;
        let mut available = self.available;
        let mut wait = SpinWait::new(self.strategy);
        let ready = wait.until(
            || {
                available = gate.acquire();
                available > cursor
            },
            keep_going,
        );

        self.available = available;
        self.waits += u64::from(wait.iterations());
        ready
    }

    fn claim(&mut self) -> &mut T {
        self.claimed = true;
        // SAFETY: the predecessor released `cursor` (observed with Acquire), the
        // successor waits for this stage's cursor, and the producer cannot reuse
        // the slot until the terminal stage frees it. This stage is the only
        // accessor until `end`.
        unsafe { &mut *self.shared.ring.slot_ptr(self.cursor) }
    }

    /// Next item, spinning until the predecessor has finished with it.
    pub fn begin(&mut self) -> &mut T {
        self.wait_ready(|| true);
        self.claim()
    }

    /// Next item if it is ready now.
    pub fn try_begin(&mut self) -> Option<&mut T> {
        if self.has_ready() {
            Some(self.claim())
        } else {
            None
        }
    }

    /// Like `begin`, but gives up with `None` once `keep_going` returns false.
    /// `keep_going` is checked once per wait iteration.
    pub fn begin_until<K>(&mut self, keep_going: K) -> Option<&mut T>
    where
        K: FnMut() -> bool,
    {
        if self.wait_ready(keep_going) {
            Some(self.claim())
        } else {
            None
        }
    }

    /// Hand the current item to the next stage, or free it if this stage is
    /// terminal.
    ///
    /// # Panics
    /// Panics if there is no outstanding `begin*`.
    #[track_caller]
    pub fn end(&mut self) {
        if !self.claimed {
            violation(PipelineError::EndWithoutBegin { operation: "end" });
        }
        self.claimed = false;
        self.cursor += 1;
        self.shared.stages[self.id.index()].cursor.increment();
        if self.terminal {
            self.shared.ring.tail().increment();
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.shared.stages[self.id.index()].name
    }

    pub fn predecessor(&self) -> Option<StageId> {
        self.predecessor
    }

    /// Whether this stage frees slots.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Number of items this stage has finished.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Live items in the whole buffer (snapshot).
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Total wait iterations spent blocked on the predecessor.
    pub fn total_waits(&self) -> u64 {
        self.waits
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("terminal", &self.terminal)
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// Processing logic for one stage
pub trait StageHandler<T>: Send + 'static {
    /// Process an event in place. `sequence` is its publish order, from 0.
    fn on_event(&mut self, event: &mut T, sequence: u64) -> Result<()>;

    /// Called before the stage starts processing
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the stage is shutting down
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this handler
    fn name(&self) -> &str {
        "stage"
    }
}

/// Drives one [`Stage`] with a handler until shutdown is signaled
pub struct StageRunner<T> {
    stage: Stage<T>,
    metrics: StageMetrics,
    shutdown: Arc<AtomicBool>,
}

impl<T: 'static> StageRunner<T> {
    /// Create a new stage runner
    pub fn new(stage: Stage<T>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            stage,
            metrics: StageMetrics::new(),
            shutdown,
        }
    }

    /// Record into `metrics` instead of a private collector
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get a reference to the metrics
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Get the shutdown signal
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the stage with the provided handler.
    ///
    /// Blocks until shutdown is signaled and nothing is left ready for this
    /// stage. A handler error is logged and counted; the item is still passed
    /// on so the chain keeps moving.
    pub fn run(&mut self, mut handler: Box<dyn StageHandler<T>>) -> Result<()> {
        handler.on_start()?;
        debug!(
            stage = self.stage.name(),
            handler = handler.name(),
            terminal = self.stage.is_terminal(),
            "stage runner started"
        );

        let shutdown = &self.shutdown;
        loop {
            let sequence = self.stage.cursor();
            let waits_before = self.stage.total_waits();
            let Some(event) = self
                .stage
                .begin_until(|| !shutdown.load(Ordering::Acquire))
            else {
                break;
            };

            let start = Instant::now();
            let outcome = handler.on_event(event, sequence);
            let latency = start.elapsed();
            self.stage.end();

            self.metrics
                .record_waits(self.stage.total_waits() - waits_before);
            self.metrics.record_event(latency, outcome.is_ok());
            if let Err(e) = outcome {
                error!(
                    stage = self.stage.name(),
                    handler = handler.name(),
                    sequence,
                    error = %e,
                    "stage handler failed"
                );
            }
        }

        debug!(
            stage = self.stage.name(),
            processed = self.stage.cursor(),
            "stage runner stopped"
        );
        handler.on_shutdown()
    }

    /// Signal the stage to shut down
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// A handler that leaves events untouched
#[derive(Debug)]
pub struct PassthroughStage;

impl<T> StageHandler<T> for PassthroughStage {
    fn on_event(&mut self, _event: &mut T, _sequence: u64) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// A handler that transforms each event in place
#[derive(Debug)]
pub struct MapStage<F> {
    name: String,
    mapper: F,
}

impl<F> MapStage<F> {
    /// Create a new map stage
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<T, F> StageHandler<T> for MapStage<F>
where
    F: FnMut(&mut T) -> Result<()> + Send + 'static,
{
    fn on_event(&mut self, event: &mut T, _sequence: u64) -> Result<()> {
        (self.mapper)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A handler that observes each event without changing it
#[derive(Debug)]
pub struct InspectStage<F> {
    name: String,
    inspector: F,
}

impl<F> InspectStage<F> {
    pub fn new(name: impl Into<String>, inspector: F) -> Self {
        Self {
            name: name.into(),
            inspector,
        }
    }
}

impl<T, F> StageHandler<T> for InspectStage<F>
where
    F: FnMut(&T, u64) -> Result<()> + Send + 'static,
{
    fn on_event(&mut self, event: &mut T, sequence: u64) -> Result<()> {
        (self.inspector)(event, sequence)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBuilder;

    #[test]
    fn test_map_stage() {
        let mut stage = MapStage::new("double", |v: &mut u32| {
            *v *= 2;
            Ok(())
        });
        let mut value = 5;
        stage.on_event(&mut value, 0).unwrap();
        assert_eq!(value, 10);
        assert_eq!(StageHandler::<u32>::name(&stage), "double");
    }

    #[test]
    fn test_inspect_stage_error() {
        let mut stage = InspectStage::new("odd_only", |v: &u32, _seq: u64| {
            if v % 2 == 1 {
                Ok(())
            } else {
                Err(PipelineError::StageError(format!("even value {v}")))
            }
        });
        assert!(stage.on_event(&mut 3, 0).is_ok());
        assert!(matches!(
            stage.on_event(&mut 4, 1),
            Err(PipelineError::StageError(_))
        ));
    }

    #[test]
    fn test_try_begin_respects_predecessor() {
        let (mut producer, mut stages) = PipelineBuilder::<u32>::new(8)
            .add_stage("first")
            .add_stage("second")
            .build()
            .unwrap()
            .split();
        let mut second = stages.pop().unwrap();
        let mut first = stages.pop().unwrap();

        assert!(first.try_begin().is_none());
        producer.push(7);
        assert!(second.try_begin().is_none());

        assert_eq!(*first.try_begin().unwrap(), 7);
        assert!(second.try_begin().is_none());
        first.end();
        assert_eq!(*second.try_begin().unwrap(), 7);
        second.end();
        assert!(producer.is_empty());
    }

    #[test]
    fn test_in_place_mutation_is_seen_downstream() {
        let (mut producer, mut stages) = PipelineBuilder::<u32>::new(4)
            .add_stage("scale")
            .add_stage("check")
            .build()
            .unwrap()
            .split();
        producer.push(3);

        *stages[0].begin() *= 10;
        stages[0].end();
        assert_eq!(*stages[1].begin(), 30);
        stages[1].end();
    }

    #[test]
    #[should_panic(expected = "end called without a matching begin")]
    fn test_end_without_begin_panics() {
        let (_producer, mut stages) = PipelineBuilder::<u32>::new(4)
            .add_stage("only")
            .build()
            .unwrap()
            .split();
        stages[0].end();
    }

    #[test]
    fn test_runner_stops_on_shutdown() {
        let (mut producer, mut stages) = PipelineBuilder::<u32>::new(4)
            .add_stage("only")
            .build()
            .unwrap()
            .split();
        producer.push(1);
        producer.push(2);

        let shutdown = Arc::new(AtomicBool::new(true));
        let mut runner = StageRunner::new(stages.remove(0), shutdown);
        runner.run(Box::new(PassthroughStage)).unwrap();

        // Items already ready are drained before the runner honors shutdown.
        assert_eq!(runner.metrics().total_processed(), 2);
        assert!(producer.is_empty());
    }

    #[test]
    fn test_runner_counts_failures() {
        let (mut producer, mut stages) = PipelineBuilder::<u32>::new(4)
            .add_stage("only")
            .build()
            .unwrap()
            .split();
        for v in 1..=4 {
            producer.push(v);
        }

        let shutdown = Arc::new(AtomicBool::new(true));
        let mut runner = StageRunner::new(stages.remove(0), shutdown);
        runner
            .run(Box::new(InspectStage::new("odd_only", |v: &u32, _seq: u64| {
                if v % 2 == 1 {
                    Ok(())
                } else {
                    Err(PipelineError::StageError("even".into()))
                }
            })))
            .unwrap();

        assert_eq!(runner.metrics().total_processed(), 2);
        assert_eq!(runner.metrics().total_failed(), 2);
        assert!(producer.is_empty());
    }

    fn drain_with_runner<T: 'static>(stage: Stage<T>) -> u64 {
        let mut runner = StageRunner::new(stage, Arc::new(AtomicBool::new(true)));
        runner.run(Box::new(PassthroughStage)).unwrap();
        runner.metrics().total_processed()
    }

    fn run_started<T: Send + Default + 'static>(values: Vec<T>) -> u64 {
        let mut running = PipelineBuilder::<T>::new(8)
            .add_stage("only")
            .build()
            .unwrap()
            .start(|_| Box::new(PassthroughStage))
            .unwrap();
        for value in values {
            running.publish(value).unwrap();
        }
        let metrics = running.stage_metrics(0).unwrap().clone();
        running.shutdown().unwrap();
        metrics.total_processed()
    }

    #[test]
    fn test_runner_is_generic_over_slot_type() {
        let (mut producer, mut stages) = PipelineBuilder::<String>::new(4)
            .add_stage("only")
            .build()
            .unwrap()
            .split();
        producer.push("a".into());
        producer.push("b".into());
        assert_eq!(drain_with_runner(stages.remove(0)), 2);

        assert_eq!(run_started(vec![7u8; 20]), 20);
        assert_eq!(run_started(vec![vec![1u32], vec![2, 3]]), 2);
    }
}
