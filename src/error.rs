//! Error types surfaced by loaders and cache tiers.

use thiserror::Error;

/// The reason a single key's handle failed.
///
/// Per-key failures and whole-batch rejections both carry the batch
/// function's own error, unwrapped, in `Load`. A batch function that returns
/// the wrong number of results is an integration bug rather than a data
/// error, and is reported separately as `ResultSizeMismatch`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    #[error("{0}")]
    Load(E),

    #[error("batch function returned {actual} values for {expected} keys")]
    ResultSizeMismatch { expected: usize, actual: usize },
}

impl<E> LoadError<E> {
    /// The batch function's error, if this is not a contract violation.
    pub fn cause(&self) -> Option<&E> {
        match self {
            LoadError::Load(err) => Some(err),
            LoadError::ResultSizeMismatch { .. } => None,
        }
    }

    pub fn into_cause(self) -> Option<E> {
        match self {
            LoadError::Load(err) => Some(err),
            LoadError::ResultSizeMismatch { .. } => None,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, LoadError::ResultSizeMismatch { .. })
    }
}

impl<E> From<E> for LoadError<E> {
    fn from(err: E) -> Self {
        LoadError::Load(err)
    }
}

/// Outcomes of a value-tier operation. A loader treats every variant as a
/// cache miss; none of them ever reaches a caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueCacheError {
    #[error("no cached value for key")]
    Miss,

    #[error("value caching is not supported by this store")]
    NotSupported,

    #[error("value cache backend failed: {0}")]
    Backend(String),
}
