use crate::types::Event;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out after {timeout:?} waiting for {description}")]
    Timeout {
        description: String,
        timeout: Duration,
    },

    #[error("Dead letter error: {0}")]
    DeadLetter(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// True for connectivity failures that are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            TesseraError::Connection(_) => true,
            TesseraError::Io(e) => is_transient_io(e),
            TesseraError::Other(e) => e.chain().any(is_transient_error),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}

/// Failure attributable to one specific event while applying a batch.
///
/// Projection sinks return this (usually inside an `anyhow::Error`) when they
/// know which event broke; it is the only error shape that can resolve to
/// `Continuation::SkipEvent`.
#[derive(Debug)]
pub struct ApplyEventError {
    pub event: Event,
    pub source: anyhow::Error,
}

impl fmt::Display for ApplyEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to apply event {} ({}): {}",
            self.event.sequence, self.event.event_type, self.source
        )
    }
}

// anyhow::Error is not itself a std Error, so the source is exposed by hand
impl StdError for ApplyEventError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(AsRef::<dyn StdError>::as_ref(&self.source))
    }
}

impl ApplyEventError {
    pub fn new(event: Event, source: impl Into<anyhow::Error>) -> Self {
        Self {
            event,
            source: source.into(),
        }
    }
}

/// Walks `err` and its source chain looking for an [`ApplyEventError`].
pub fn find_apply_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a ApplyEventError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(apply) = e.downcast_ref::<ApplyEventError>() {
            return Some(apply);
        }
        current = e.source();
    }
    None
}

/// Recognises connectivity errors anywhere in a source chain.
pub fn is_transient_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            if is_transient_io(io) {
                return true;
            }
        }
        if let Some(TesseraError::Connection(_)) = e.downcast_ref::<TesseraError>() {
            return true;
        }
        current = e.source();
    }
    false
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> Event {
        Event::new(seq, "Tick", Vec::new())
    }

    #[test]
    fn test_connection_refused_is_transient() {
        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert!(is_transient_error(err.as_ref()));
    }

    #[test]
    fn test_not_found_io_is_not_transient() {
        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!is_transient_error(err.as_ref()));
    }

    #[test]
    fn test_transient_inside_apply_error() {
        let inner = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err = anyhow::Error::new(ApplyEventError::new(event(3), inner));
        assert!(is_transient_error(err.as_ref()));
    }

    #[test]
    fn test_find_apply_error_through_context() {
        let err = anyhow::Error::new(ApplyEventError::new(event(7), anyhow::anyhow!("bad")))
            .context("while applying batch");
        let found = find_apply_error(err.as_ref()).expect("apply error in chain");
        assert_eq!(found.event.sequence, 7);
    }

    #[test]
    fn test_tessera_connection_error_is_transient() {
        assert!(TesseraError::Connection("db down".into()).is_transient());
        assert!(!TesseraError::Config("bad".into()).is_transient());
    }
}
