use thiserror::Error;

/// Failure kinds callers branch on. Everything else travels as plain
/// `anyhow` context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PkgError {
    #[error("package '{0}' not found")]
    NotFound(String),

    #[error("package '{0}' is not installed")]
    NotInstalled(String),

    #[error("upstream responded {status} for {url}")]
    Upstream { status: u16, url: String },

    #[error("invalid installed path: '{0}'")]
    PathEscape(String),

    #[error("unsupported archive type for '{0}'; supported: zip, tar.gz")]
    UnsupportedArchive(String),

    #[error("unix socket path is too long ({len} bytes): {path}")]
    SocketPathTooLong { path: String, len: usize },
}
