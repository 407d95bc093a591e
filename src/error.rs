//! Error taxonomy shared across the daemon.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The seven error kinds from the propagation policy. Everything except
/// [`Error::Fatal`] is logged and converted to a drop at the component
/// boundary that produced it; `Fatal` is the only variant that should ever
/// reach `main`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocation failure, socket transient error. Non-fatal, event dropped.
    #[error("transient resource error: {0}")]
    Transient(String),

    /// Malformed or attribute-missing kernel message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Event whose (major, minor) is not in the partition map.
    #[error("unknown device {major}:{minor}")]
    UnknownDevice { major: u32, minor: u32 },

    /// Event outside every configured indexing path. Normal case, not logged
    /// above debug level.
    #[error("path outside indexing scope: {0}")]
    ScopeViolation(PathBuf),

    /// Detected on index open; triggers wipe-and-rebuild of the volatile index.
    #[error("index corrupted at {0}: {1}")]
    IndexCorruption(PathBuf, String),

    /// Two indexing paths whose event paths overlap.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// Cannot open the kernel transport, create the runtime directory, or
    /// bind the search API. The daemon terminates.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("tantivy query parse error: {0}")]
    QueryParse(#[from] tantivy::query::QueryParserError),
}
