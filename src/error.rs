use thiserror::Error;

/// Result type for ring pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Broad classification of a [`PipelineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid construction-time configuration; rebuild with valid settings
    Configuration,
    /// A caller broke the buffer or stage protocol
    PreconditionViolation,
    /// Failure while running stage threads
    Runtime,
}

/// Errors raised by the ring buffer, its handles and the stage runner
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Capacity is zero or not a power of two
    #[error("capacity must be a non-zero power of two, got {capacity}")]
    InvalidCapacity { capacity: usize },

    /// No stages in pipeline
    #[error("cannot build a pipeline with no stages")]
    NoStages,

    /// Stage id does not belong to this builder
    #[error("unknown stage id {0}")]
    UnknownStage(usize),

    /// A new stage must follow the current terminal stage
    #[error("stage {predecessor} is not the terminal stage; the chain cannot branch")]
    NotTerminal { predecessor: usize },

    /// Only the first stage may trail the producer directly
    #[error("the chain already has a first stage; attach after stage {terminal}")]
    AlreadyRooted { terminal: usize },

    /// `begin_push` while every slot is live
    #[error("push while the buffer is full")]
    BufferFull,

    /// `begin_pop` while nothing is published
    #[error("pop while the buffer is empty")]
    BufferEmpty,

    /// `at` past the live range
    #[error("offset {offset} out of bounds for {len} live items")]
    OffsetOutOfBounds { offset: u64, len: u64 },

    /// `get_by_sequence` outside `[tail, head)`
    #[error("sequence {sequence} outside live range [{tail}, {head})")]
    SequenceOutOfRange { sequence: u64, tail: u64, head: u64 },

    /// An `end` call with no matching `begin`
    #[error("{operation} called without a matching begin")]
    EndWithoutBegin { operation: &'static str },

    /// Stage execution error
    #[error("stage execution failed: {0}")]
    StageError(String),

    /// Thread join error
    #[error("thread join error: {0}")]
    ThreadError(String),

    /// Configuration file could not be read
    #[error("failed to read '{path}'")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("failed to parse config")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidCapacity { .. }
            | PipelineError::NoStages
            | PipelineError::UnknownStage(_)
            | PipelineError::NotTerminal { .. }
            | PipelineError::AlreadyRooted { .. }
            | PipelineError::ConfigRead { .. }
            | PipelineError::ConfigParse(_)
            | PipelineError::ConfigError(_) => ErrorKind::Configuration,
            PipelineError::BufferFull
            | PipelineError::BufferEmpty
            | PipelineError::OffsetOutOfBounds { .. }
            | PipelineError::SequenceOutOfRange { .. }
            | PipelineError::EndWithoutBegin { .. } => ErrorKind::PreconditionViolation,
            PipelineError::StageError(_) | PipelineError::ThreadError(_) => ErrorKind::Runtime,
        }
    }
}

/// Abort the calling thread on a protocol violation.
#[cold]
#[track_caller]
pub(crate) fn violation(err: PipelineError) -> ! {
    panic!("ring pipeline contract violated: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PipelineError::InvalidCapacity { capacity: 5 }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(PipelineError::BufferFull.kind(), ErrorKind::PreconditionViolation);
        assert_eq!(
            PipelineError::ThreadError("join".into()).kind(),
            ErrorKind::Runtime
        );
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::SequenceOutOfRange {
            sequence: 4,
            tail: 0,
            head: 4,
        };
        assert_eq!(err.to_string(), "sequence 4 outside live range [0, 4)");
    }

    #[test]
    #[should_panic(expected = "push while the buffer is full")]
    fn test_violation_panics_with_message() {
        violation(PipelineError::BufferFull);
    }
}
