use thiserror::Error;

/// Errors produced by the cache side of the filesystem.
///
/// Failures on the target side never travel through this type; the facade
/// maps those straight to an errno. `CacheError` only covers the shadow
/// files and the metadata store, both of which are expendable.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested byte range is not fully covered by known blocks.
    #[error("byte range not present in cache")]
    Miss,

    /// A lookup-only open found no node bound to the path.
    #[error("no cache node bound to path")]
    NotCached,

    /// Shadow file I/O failed.
    #[error("shadow file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata store failed.
    #[error("metadata store: {0}")]
    Meta(#[from] rusqlite::Error),

    /// The caller handed the cache an argument it cannot represent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
