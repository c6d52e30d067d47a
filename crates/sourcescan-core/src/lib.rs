//! Shared data model for the source-manager core: chunks, units, the error
//! taxonomy, the resume cursor, and the json-bundle wire format.
//!
//! This crate has no concurrency or scheduling logic of its own — that
//! lives in `sourcescan-engine`, which depends on it the same way
//! `bbr-client-engine` depends on `bbr-client-core`.

pub mod aggregator;
pub mod chunk;
pub mod cursor;
pub mod error;
pub mod json_bundle;
pub mod metrics;
pub mod unit;

pub use aggregator::ScanErrorAggregator;
pub use chunk::{Chunk, SourceMetadata};
pub use cursor::ResumeCursor;
pub use error::{JoinedError, ScanError};
pub use metrics::{MetricsSnapshot, ScanMetrics};
pub use unit::{JobId, SourceHandle, SourceUnit};
