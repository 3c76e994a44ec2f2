//! Run configuration for the batch pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Immutable configuration for one overlap-analysis run.
///
/// All knobs are explicit fields; the core never reads ambient or
/// environment state.
///
/// # Examples
/// ```
/// use overlap_core::OverlapAnalysisConfig;
///
/// # fn main() -> Result<(), overlap_core::OverlapConfigError> {
/// let config = OverlapAnalysisConfig::new(100, 500, "/tmp/overlap-work", false)?;
/// assert_eq!(config.batch_size, 100);
/// assert!(!config.retry_failed);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapAnalysisConfig {
    /// Scene tokens per processing chunk.
    pub batch_size: usize,
    /// Chunk-size hint passed through to the batch writer.
    pub insert_batch_size: usize,
    /// Checkpoint location owned by the failure tracker; opaque to the core.
    pub work_dir: PathBuf,
    /// Process only previously failed tokens instead of the manifest.
    pub retry_failed: bool,
}

/// Errors returned by [`OverlapAnalysisConfig::new`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverlapConfigError {
    /// The processing batch size was zero.
    #[error("batch size must be at least one token")]
    ZeroBatchSize,
    /// The writer chunk-size hint was zero.
    #[error("insert batch size must be at least one row")]
    ZeroInsertBatchSize,
}

impl OverlapAnalysisConfig {
    /// Validate and construct a run configuration.
    pub fn new(
        batch_size: usize,
        insert_batch_size: usize,
        work_dir: impl Into<PathBuf>,
        retry_failed: bool,
    ) -> Result<Self, OverlapConfigError> {
        if batch_size == 0 {
            return Err(OverlapConfigError::ZeroBatchSize);
        }
        if insert_batch_size == 0 {
            return Err(OverlapConfigError::ZeroInsertBatchSize);
        }
        Ok(Self {
            batch_size,
            insert_batch_size,
            work_dir: work_dir.into(),
            retry_failed,
        })
    }
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn accepts_positive_batch_sizes() {
        let config =
            OverlapAnalysisConfig::new(2, 10, "work", true).expect("valid configuration");
        assert_eq!(config.insert_batch_size, 10);
        assert!(config.retry_failed);
    }

    #[rstest]
    #[case(0, 10, OverlapConfigError::ZeroBatchSize)]
    #[case(2, 0, OverlapConfigError::ZeroInsertBatchSize)]
    fn rejects_zero_batch_sizes(
        #[case] batch_size: usize,
        #[case] insert_batch_size: usize,
        #[case] expected: OverlapConfigError,
    ) {
        let error = OverlapAnalysisConfig::new(batch_size, insert_batch_size, "work", false)
            .expect_err("zero sizes should be rejected");
        assert_eq!(error, expected);
    }
}
