//! Crate-wide error taxonomy, plus two ambient wrapping variants (`Io`, `Serde`) used only for
//! plumbing — never surfaced in place of a taxonomy variant where a taxonomy variant applies.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WaxError>;

#[derive(Debug, Error)]
pub enum WaxError {
    #[error("invalid footer: {0}")]
    InvalidFooter(String),

    #[error("invalid toc: {0}")]
    InvalidToc(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("wal corruption at offset {offset}: {reason}")]
    WalCorruption { offset: u64, reason: String },

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("capacity exceeded: limit {limit}, requested {requested}")]
    CapacityExceeded { limit: u64, requested: u64 },

    #[error("frame not found: {0}")]
    FrameNotFound(u64),

    #[error("io error: {0}")]
    IoTaxonomy(String),

    #[error("writer busy")]
    WriterBusy,

    #[error("writer timeout")]
    WriterTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serde error: {0}")]
    Serde(String),
}

impl WaxError {
    #[must_use]
    pub fn encoding(reason: impl Into<String>) -> Self {
        Self::EncodingError(reason.into())
    }

    #[must_use]
    pub fn decoding(reason: impl Into<String>) -> Self {
        Self::DecodingError(reason.into())
    }
}

/// A structured record of one "fallback taken instead of failing" event: `context` names the
/// operation, `fallback` names what ran instead, `source_error` carries the originating
/// error's message when there was one. Every such path in the crate calls [`Diagnostics::emit`]
/// rather than swallowing the condition, so it always shows up in both test-observable dev logs
/// and operational logs.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub context: String,
    pub fallback: String,
    pub source_error: Option<String>,
}

impl Diagnostics {
    #[must_use]
    pub fn new(context: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self { context: context.into(), fallback: fallback.into(), source_error: None }
    }

    #[must_use]
    pub fn with_source(mut self, source_error: impl std::fmt::Display) -> Self {
        self.source_error = Some(source_error.to_string());
        self
    }

    /// Emits this fallback via `dev6!` (captured by tests through the thread-local sink) and
    /// `log::warn!` (routed through `log4rs` in production).
    pub fn emit(&self) {
        match &self.source_error {
            Some(err) => {
                crate::dev6!("{}: falling back to {} ({err})", self.context, self.fallback);
                log::warn!("{}: falling back to {} ({err})", self.context, self.fallback);
            }
            None => {
                crate::dev6!("{}: falling back to {}", self.context, self.fallback);
                log::warn!("{}: falling back to {}", self.context, self.fallback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_records_context_and_fallback_in_dev_sink() {
        let _guard = crate::utils::devlog::enable_thread_sink();
        Diagnostics::new("header recovery", "slot 1 (slot 0 corrupt)").with_source("checksum mismatch").emit();
        let snap = crate::utils::devlog::snapshot();
        assert!(snap.iter().any(|s| s.contains("header recovery") && s.contains("slot 1") && s.contains("checksum mismatch")));
    }
}
