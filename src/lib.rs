//! A lock-free, fixed-capacity ring buffer with a linear chain of dependent
//! pipeline stages.
//!
//! One producer publishes items into pre-allocated slots. Each stage sees every
//! item exactly once, in publish order, after the stage before it has finished
//! with it, and may mutate the item in place. Only the last (terminal) stage
//! returns slots to the producer, so no slot is reused while any stage still
//! needs it.
//!
//! # Features
//!
//! - Monotonic 64-bit sequences on cache-padded atomics, release/acquire hand-off
//! - Zero-copy, zero-allocation hot path after construction
//! - `try_*` variants returning [`PipelineError`]; plain variants panic on misuse
//! - Pluggable wait strategies for blocked producers and stages
//! - Threaded stage runner with per-stage metrics and graceful drain
//! - TOML configuration
//!
//! # Example
//!
//! ```
//! use ring_pipeline::PipelineBuilder;
//!
//! let (mut producer, mut stages) = PipelineBuilder::<u64>::new(8)
//!     .add_stage("double")
//!     .add_stage("sink")
//!     .build()?
//!     .split();
//!
//! producer.push(21);
//!
//! *stages[0].begin() *= 2;
//! stages[0].end();
//!
//! assert_eq!(*stages[1].begin(), 42);
//! stages[1].end();
//! assert!(producer.is_empty());
//! # Ok::<(), ring_pipeline::PipelineError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod stage;
pub mod wait;

mod sequence;

// Re-exports for convenience
pub use buffer::{PaddedRingBuffer, RingBuffer};
pub use config::PipelineConfig;
pub use crossbeam::utils::CachePadded;
pub use error::{ErrorKind, PipelineError, Result};
pub use metrics::{LatencySummary, MetricsSnapshot, StageMetrics};
pub use pipeline::{Pipeline, PipelineBuilder, RunningPipeline, StageId};
pub use producer::{Consumer, Producer};
pub use stage::{InspectStage, MapStage, PassthroughStage, Stage, StageHandler, StageRunner};
pub use wait::{SpinWait, WaitStrategy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
