//! Resumability contract between the batch runner and its checkpoint store.
//!
//! The tracker owns every piece of cross-restart state: which tokens are
//! done, which failed at which stage, and the progress counters. The runner
//! mutates it after every batch and finalises it exactly once per run. The
//! on-disk format (if any) is private to the implementation; the runner
//! never touches storage directly.

use std::collections::HashSet;
use std::error::Error;

use thiserror::Error as ThisError;

use crate::record::{FailureRecord, ProgressSnapshot, SceneToken};

/// Error raised when the tracker cannot persist or recover its state.
///
/// Persistence failures are fatal to a run: once a checkpoint write fails
/// the recorded state can no longer be trusted for resumption.
#[derive(Debug, ThisError)]
#[error("failure tracker could not {operation}")]
pub struct TrackerError {
    operation: &'static str,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl TrackerError {
    /// Wrap an underlying error with the operation that failed.
    #[must_use]
    pub fn new(
        operation: &'static str,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            operation,
            source: Some(Box::new(source)),
        }
    }

    /// Build an error with no underlying source.
    #[must_use]
    pub const fn message(operation: &'static str) -> Self {
        Self {
            operation,
            source: None,
        }
    }

    /// The operation that failed, for logs and assertions.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }
}

/// Checkpointed success/failure bookkeeping for a pipeline run.
///
/// Implementations are not required to be thread-safe; the tracker is the
/// single mutable shared resource of a run and concurrent runners must not
/// share one instance without external locking. `overlap-data` provides a
/// file-backed implementation; [`crate::test_support::MemoryTracker`] is the
/// in-memory one for tests.
pub trait FailureTracker {
    /// Tokens recorded as failed by previous sessions, first-seen order.
    ///
    /// Retry-only runs use exactly this set and nothing else.
    fn load_failed_tokens(&self) -> Result<Vec<SceneToken>, TrackerError>;

    /// Filter out tokens that already succeeded, preserving order.
    fn get_remaining_tokens(
        &self,
        all_tokens: &[SceneToken],
    ) -> Result<Vec<SceneToken>, TrackerError>;

    /// Tokens already present in the destination store.
    ///
    /// Implementations without destination visibility return an empty set.
    fn check_tokens_exist(
        &self,
        tokens: &[SceneToken],
    ) -> Result<HashSet<SceneToken>, TrackerError>;

    /// Record one per-token failure with its stage and batch number.
    fn save_failed_record(&mut self, record: FailureRecord) -> Result<(), TrackerError>;

    /// Mark the tokens of a completed batch as succeeded.
    fn save_successful_batch(
        &mut self,
        tokens: &[SceneToken],
        batch_number: usize,
    ) -> Result<(), TrackerError>;

    /// Checkpoint the run's progress counters after a batch.
    fn save_progress(&mut self, snapshot: ProgressSnapshot) -> Result<(), TrackerError>;

    /// Seal the run's state. Called exactly once per run, on every path.
    fn finalize(&mut self) -> Result<(), TrackerError>;
}
