//! Storage adapters for the overlap-engine batch pipeline.
//!
//! Responsibilities:
//! - Implement [`overlap_core::ManifestRepository`] over a SQLite scene
//!   store and a JSON manifest file.
//! - Implement [`overlap_core::BatchWriter`] as chunked, replay-idempotent
//!   SQLite inserts.
//! - Implement [`overlap_core::FailureTracker`] with JSON checkpoint files
//!   under the run's work directory.
//!
//! Boundaries:
//! - No orchestration; the runner in `overlap-core` drives everything here
//!   through the collaborator traits.

#![forbid(unsafe_code)]

mod sqlite;
mod tracker;
mod writer;

pub use sqlite::{SqliteSceneStore, SqliteStoreError};
pub use tracker::FileFailureTracker;
pub use writer::SqliteBatchWriter;
