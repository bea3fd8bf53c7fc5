use crate::buffer::RingBuffer;
use crate::error::{PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::producer::Producer;
use crate::sequence::Sequence;
use crate::stage::{Stage, StageHandler, StageRunner};
use crate::wait::{SpinWait, WaitStrategy};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Handle to a stage in a pipeline's stage arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(usize);

impl StageId {
    /// Position of the stage in the chain, from 0
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-stage state shared between the stage's thread and its dependent.
#[derive(Debug)]
pub(crate) struct StageSlot {
    pub(crate) name: String,
    pub(crate) predecessor: Option<StageId>,
    pub(crate) terminal: bool,
    /// Items this stage has finished. Written only by the stage's thread.
    pub(crate) cursor: Sequence,
}

/// Storage every handle of one pipeline points into.
#[derive(Debug)]
pub(crate) struct Shared<T> {
    pub(crate) ring: RingBuffer<T>,
    pub(crate) stages: Box<[StageSlot]>,
}

impl<T> Shared<T> {
    pub(crate) fn new(ring: RingBuffer<T>, stages: Vec<StageSlot>) -> Self {
        Self {
            ring,
            stages: stages.into_boxed_slice(),
        }
    }
}

/// A stage configuration in the pipeline builder
#[derive(Debug)]
struct StageDecl {
    name: String,
    predecessor: Option<StageId>,
    terminal: bool,
}

/// Builder for a ring buffer with a chain of stages
#[derive(Debug)]
pub struct PipelineBuilder<T> {
    capacity: usize,
    stages: Vec<StageDecl>,
    wait_strategy: WaitStrategy,
    _slot: std::marker::PhantomData<fn() -> T>,
}

impl<T> PipelineBuilder<T> {
    /// Create a builder for a buffer of `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stages: Vec::new(),
            wait_strategy: WaitStrategy::default(),
            _slot: std::marker::PhantomData,
        }
    }

    /// Attach a stage that trails `predecessor`, or the producer when `None`.
    ///
    /// The chain is linear: `predecessor` must be the current terminal stage,
    /// and `None` is only accepted for the first stage. The predecessor stops
    /// being terminal.
    pub fn attach(
        &mut self,
        name: impl Into<String>,
        predecessor: Option<StageId>,
    ) -> Result<StageId> {
        match predecessor {
            Some(p) => {
                let decl = self
                    .stages
                    .get_mut(p.0)
                    .ok_or(PipelineError::UnknownStage(p.0))?;
                if !decl.terminal {
                    return Err(PipelineError::NotTerminal { predecessor: p.0 });
                }
                decl.terminal = false;
            }
            None => {
                if let Some(terminal) = self.terminal() {
                    return Err(PipelineError::AlreadyRooted {
                        terminal: terminal.0,
                    });
                }
            }
        }

        let id = StageId(self.stages.len());
        self.stages.push(StageDecl {
            name: name.into(),
            predecessor,
            terminal: true,
        });
        Ok(id)
    }

    /// Append a stage after the current terminal stage
    pub fn add_stage(mut self, name: impl Into<String>) -> Self {
        let predecessor = self.terminal();
        let decl = StageDecl {
            name: name.into(),
            predecessor,
            terminal: true,
        };
        if let Some(p) = predecessor {
            self.stages[p.0].terminal = false;
        }
        self.stages.push(decl);
        self
    }

    /// Set how blocked handles wait
    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    /// The stage that currently frees slots, if any
    pub fn terminal(&self) -> Option<StageId> {
        self.stages
            .iter()
            .position(|s| s.terminal)
            .map(StageId)
    }

    /// Number of stages attached so far
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Build the pipeline with default-initialised slots
    pub fn build(self) -> Result<Pipeline<T>>
    where
        T: Default,
    {
        self.build_with_factory(T::default)
    }

    /// Build the pipeline with slots pre-filled by `factory`
    pub fn build_with_factory<F>(self, factory: F) -> Result<Pipeline<T>>
    where
        F: FnMut() -> T,
    {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }

        let ring = RingBuffer::with_factory(self.capacity, factory)?;
        let stages: Vec<StageSlot> = self
            .stages
            .into_iter()
            .map(|decl| StageSlot {
                name: decl.name,
                predecessor: decl.predecessor,
                terminal: decl.terminal,
                cursor: Sequence::new(0),
            })
            .collect();

        debug!(
            capacity = self.capacity,
            stages = stages.len(),
            wait_strategy = ?self.wait_strategy,
            "pipeline built"
        );

        Ok(Pipeline {
            shared: Arc::new(Shared::new(ring, stages)),
            wait_strategy: self.wait_strategy,
        })
    }
}

/// A ring buffer with its stage chain, before any handle is handed out
#[derive(Debug)]
pub struct Pipeline<T> {
    shared: Arc<Shared<T>>,
    wait_strategy: WaitStrategy,
}

impl<T> Pipeline<T> {
    /// Number of slots in the buffer
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Number of stages in the chain
    pub fn stage_count(&self) -> usize {
        self.shared.stages.len()
    }

    /// Stage names in chain order
    pub fn stage_names(&self) -> Vec<String> {
        self.shared.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Hand out the producer and one handle per stage, in chain order
    pub fn split(self) -> (Producer<T>, Vec<Stage<T>>) {
        let stages: Vec<Stage<T>> = (0..self.shared.stages.len())
            .map(|i| Stage::new(Arc::clone(&self.shared), StageId(i), self.wait_strategy))
            .collect();
        let producer = Producer::new(self.shared).with_wait_strategy(self.wait_strategy);
        (producer, stages)
    }
}

// SAFETY: a `Pipeline` hands out no references into its slots.
unsafe impl<T: Send> Send for Pipeline<T> {}

impl<T: Send + 'static> Pipeline<T> {
    /// Spawn one thread per stage, each running the handler `stage_factory`
    /// returns for its index
    pub fn start<F>(self, mut stage_factory: F) -> Result<RunningPipeline<T>>
    where
        F: FnMut(usize) -> Box<dyn StageHandler<T>>,
    {
        let stage_names = self.stage_names();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (producer, stages) = self.split();

        let mut handles = Vec::with_capacity(stages.len());
        let mut metrics = Vec::with_capacity(stages.len());

        for (stage_idx, stage) in stages.into_iter().enumerate() {
            let handler = stage_factory(stage_idx);
            let stage_metrics = StageMetrics::new();
            metrics.push(stage_metrics.clone());

            let mut runner =
                StageRunner::new(stage, Arc::clone(&shutdown)).with_metrics(stage_metrics);

            let spawned = thread::Builder::new()
                .name(format!("stage-{}", stage_names[stage_idx]))
                .spawn(move || runner.run(handler));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Already running stages exit once they see nothing ready.
                    shutdown.store(true, Ordering::Release);
                    return Err(PipelineError::ThreadError(e.to_string()));
                }
            }
        }

        Ok(RunningPipeline {
            producer,
            stage_names,
            metrics,
            handles,
            shutdown,
        })
    }
}

/// A pipeline whose stages run on their own threads
pub struct RunningPipeline<T> {
    producer: Producer<T>,
    stage_names: Vec<String>,
    metrics: Vec<StageMetrics>,
    handles: Vec<JoinHandle<Result<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl<T> RunningPipeline<T> {
    /// The producer feeding the first stage
    pub fn producer(&mut self) -> &mut Producer<T> {
        &mut self.producer
    }

    /// Publish `value`, waiting for the terminal stage to free a slot if needed.
    ///
    /// # Errors
    /// `ThreadError` if the buffer is full and a stage thread has exited, since
    /// no slot will ever be freed.
    pub fn publish(&mut self, value: T) -> Result<()> {
        let handles = &self.handles;
        let Some(slot) = self
            .producer
            .begin_push_until(|| !handles.iter().any(|h| h.is_finished()))
        else {
            let exited = self
                .stage_names
                .iter()
                .zip(handles)
                .find(|(_, h)| h.is_finished())
                .map_or("unknown", |(name, _)| name.as_str());
            return Err(PipelineError::ThreadError(format!(
                "stage '{exited}' exited with the buffer full"
            )));
        };
        *slot = value;
        self.producer.end_push();
        Ok(())
    }

    /// Get metrics for a stage
    pub fn stage_metrics(&self, index: usize) -> Option<&StageMetrics> {
        self.metrics.get(index)
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        self.stage_names
            .iter()
            .zip(&self.metrics)
            .map(|(name, metrics)| format!("{name}: {}\n", metrics.snapshot()))
            .collect()
    }

    /// Wait for the stages to finish everything published, then stop them
    pub fn shutdown(mut self) -> Result<()> {
        self.drain(None);
        self.finish()
    }

    /// Like `shutdown`, but stop anyway once `timeout` has elapsed
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<()> {
        if !self.drain(Some(Instant::now() + timeout)) {
            warn!(
                pending = self.producer.len(),
                "pipeline did not drain before timeout"
            );
        }
        self.finish()
    }

    /// Stop now; stages finish only what is already ready for them
    pub fn stop(mut self) -> Result<()> {
        self.finish()
    }

    /// Spin until the terminal stage has freed every published slot.
    /// Gives up early if a stage thread has exited or the deadline passes.
    fn drain(&self, deadline: Option<Instant>) -> bool {
        let mut wait = SpinWait::new(WaitStrategy::Sleeping { max_micros: 1_000 });
        wait.until(
            || self.producer.is_empty(),
            || {
                !self.handles.iter().any(|h| h.is_finished())
                    && deadline.map_or(true, |d| Instant::now() < d)
            },
        )
    }

    fn finish(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let mut first_err = None;
        for (name, handle) in self.stage_names.iter().zip(self.handles.drain(..)) {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(PipelineError::ThreadError(format!(
                    "stage '{name}' panicked"
                ))),
            };
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }

        info!(
            published = self.producer.sequence(),
            pending = self.producer.len(),
            "pipeline stopped"
        );
        first_err.map_or(Ok(()), Err)
    }
}

impl<T> Drop for RunningPipeline<T> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl<T> fmt::Debug for RunningPipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("stages", &self.stage_names)
            .field("producer", &self.producer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::PassthroughStage;

    #[test]
    fn test_pipeline_builder() {
        let result = PipelineBuilder::<u64>::new(16)
            .add_stage("stage1")
            .add_stage("stage2")
            .build();
        assert!(result.is_ok());
        assert_eq!(result.unwrap().stage_names(), vec!["stage1", "stage2"]);
    }

    #[test]
    fn test_no_stages_error() {
        let result = PipelineBuilder::<u64>::new(16).build();
        assert!(matches!(result, Err(PipelineError::NoStages)));
    }

    #[test]
    fn test_invalid_capacity_error() {
        let result = PipelineBuilder::<u64>::new(5).add_stage("only").build();
        assert!(matches!(
            result,
            Err(PipelineError::InvalidCapacity { capacity: 5 })
        ));
    }

    #[test]
    fn test_attach_flips_terminal() {
        let mut builder = PipelineBuilder::<u64>::new(8);
        let a = builder.attach("a", None).unwrap();
        assert_eq!(builder.terminal(), Some(a));
        let b = builder.attach("b", Some(a)).unwrap();
        assert_eq!(builder.terminal(), Some(b));

        let (_producer, stages) = builder.build().unwrap().split();
        assert!(!stages[0].is_terminal());
        assert!(stages[1].is_terminal());
        assert_eq!(stages[1].predecessor(), Some(a));
        assert_eq!(stages[0].predecessor(), None);
    }

    #[test]
    fn test_attach_rejects_branching() {
        let mut builder = PipelineBuilder::<u64>::new(8);
        let a = builder.attach("a", None).unwrap();
        builder.attach("b", Some(a)).unwrap();

        assert!(matches!(
            builder.attach("c", Some(a)),
            Err(PipelineError::NotTerminal { predecessor: 0 })
        ));
        assert!(matches!(
            builder.attach("d", None),
            Err(PipelineError::AlreadyRooted { terminal: 1 })
        ));
        assert!(matches!(
            builder.attach("e", Some(StageId(7))),
            Err(PipelineError::UnknownStage(7))
        ));
        assert_eq!(builder.stage_count(), 2);
    }

    #[test]
    fn test_build_with_factory() {
        let pipeline = PipelineBuilder::<String>::new(4)
            .add_stage("only")
            .build_with_factory(|| String::with_capacity(32))
            .unwrap();
        assert_eq!(pipeline.capacity(), 4);
        assert_eq!(pipeline.stage_count(), 1);
    }

    #[test]
    fn test_start_and_shutdown() {
        let pipeline = PipelineBuilder::<u64>::new(8)
            .add_stage("a")
            .add_stage("b")
            .with_wait_strategy(WaitStrategy::Yielding)
            .build()
            .unwrap();

        let mut running = pipeline.start(|_| Box::new(PassthroughStage)).unwrap();
        for i in 0..100 {
            running.publish(i).unwrap();
        }
        let metrics = running.stage_metrics(1).unwrap().clone();
        running.shutdown().unwrap();
        assert_eq!(metrics.total_processed(), 100);
    }
}
