use std::time::Duration;

use thiserror::Error;

/// Failure reported by an external tier store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store `{store}` unavailable: {message}")]
    Unavailable { store: &'static str, message: String },
    #[error("store `{store}` rejected entry: {message}")]
    Rejected { store: &'static str, message: String },
}

impl StoreError {
    pub fn unavailable(store: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            store,
            message: message.into(),
        }
    }

    pub fn rejected(store: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            store,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("timed out after {waited:?} waiting for the compute lock on `{key}`")]
    LockTimeout { key: String, waited: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by [`TieredOutputCache::get_or_compute`](super::TieredOutputCache::get_or_compute).
#[derive(Debug, Error)]
pub enum ComputeError<E> {
    #[error("value loader failed: {0}")]
    Loader(#[source] E),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl<E> ComputeError<E> {
    /// The loader error, if the failure came from the loader.
    pub fn into_loader(self) -> Option<E> {
        match self {
            Self::Loader(err) => Some(err),
            Self::Cache(_) => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("path `{path}` is not below `{root}`")]
    OutsideRoot { path: String, root: String },
    #[error("path `{path}` does not name an entry below `{root}`")]
    MissingChild { path: String, root: String },
}
