use std::fmt;

use crate::unit::SourceUnit;

/// The four error kinds a scan can produce, distinguished by wrapping
/// rather than by a type hierarchy (spec §3, §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    /// Terminates the job. First fatal wins for `FatalError()`.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Attributed to a specific unit; appended to job errors and the unit's metric.
    #[error("chunk error on {unit}: {message}")]
    Chunk { unit: SourceUnit, message: String },

    /// Non-chunk error outside of unit processing (enumeration / `Chunks`).
    #[error("enumeration error: {0}")]
    Enumeration(String),

    /// Produced when the job's cancellation handle fires. Presented as a
    /// fatal wrapping a cancellation token.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ScanError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        ScanError::Fatal(msg.into())
    }

    pub fn chunk(unit: SourceUnit, msg: impl Into<String>) -> Self {
        ScanError::Chunk {
            unit,
            message: msg.into(),
        }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        ScanError::Cancelled(msg.into())
    }

    /// A cancellation is presented as fatal to `FatalError()` callers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::Fatal(_) | ScanError::Cancelled(_))
    }

    pub fn is_chunk_scoped(&self) -> bool {
        matches!(self, ScanError::Chunk { .. })
    }

    pub fn chunk_unit(&self) -> Option<&SourceUnit> {
        match self {
            ScanError::Chunk { unit, .. } => Some(unit),
            _ => None,
        }
    }
}

/// A joined view over a collection of `ScanError`s, as returned by
/// `FatalErrors()`, `ChunkError()`, `EnumerationError()`.
#[derive(Debug, Clone)]
pub struct JoinedError {
    messages: Vec<String>,
}

impl JoinedError {
    pub fn from_errors<'a>(errors: impl IntoIterator<Item = &'a ScanError>) -> Option<Self> {
        let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
        if messages.is_empty() {
            None
        } else {
            Some(Self { messages })
        }
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages.join("; "))
    }
}

impl std::error::Error for JoinedError {}
