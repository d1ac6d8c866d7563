//! Typed errors for the qoda engine.
//!
//! Only failures a caller can meaningfully react to get their own variant.
//! Everything the engine is contracted to swallow — an undetectable
//! document language, a retrain with too few examples — is either folded
//! into a fallback value or reported through an outcome enum instead of an
//! error (see [`crate::trainer::RetrainOutcome`]).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The boolean code rule could not be parsed. Surfaced to the caller
    /// unchanged; never retried.
    #[error("malformed code rule: {0}")]
    QuerySyntax(String),

    /// A persistence call failed. Logged at the operation boundary; the
    /// operation aborts with best-effort ordering, no partial-state
    /// guarantee beyond what the store's transactions provide.
    #[error("store access failed: {0}")]
    Store(anyhow::Error),

    /// The document language could not be resolved. Callers fall back to
    /// the configured default language rather than propagating this.
    #[error("document language could not be resolved")]
    LanguageResolution,
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Store(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
