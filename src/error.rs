//! Error taxonomy for the capture pipeline.
//!
//! Errors fall in three classes: fatal (the run must stop), source-scoped
//! (skip the current capture, continue with the others) and per-event
//! (logged where they happen and never surfaced as a value).

use std::path::PathBuf;

use thiserror::Error;

use crate::defrag::DefragError;

#[derive(Error, Debug)]
pub enum PipelineError {
    // Configuration errors
    #[error("invalid flush-after duration {value:?}: {reason}")]
    InvalidFlushDuration { value: String, reason: String },

    #[error("invalid storage endpoint {value:?}: {reason}")]
    InvalidStorageEndpoint { value: String, reason: String },

    // Source errors
    #[error("capture source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("invalid filter expression {expr:?}: {reason}")]
    FilterSyntax { expr: String, reason: String },

    #[error("cannot watch {path}: {reason}")]
    WatchDirectory { path: PathBuf, reason: String },

    // Reassembly errors
    #[error("IPv4 defragmentation failed in {source_id}: {error}")]
    Defrag {
        source_id: String,
        #[source]
        error: DefragError,
    },

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    // Collaborator errors
    #[error("flow sink failure: {0}")]
    Sink(#[source] anyhow::Error),
}

impl PipelineError {
    /// True when the error must terminate the whole run rather than only the
    /// capture source it originated from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::SourceUnavailable { .. } | PipelineError::FilterSyntax { .. }
        )
    }

    pub(crate) fn unavailable(source_id: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::SourceUnavailable {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
