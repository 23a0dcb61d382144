//!
//! blobsync error model
//! --------------------
//! One error enum shared by the storage engine, the HTTP layer and the sync
//! engine, along with the HTTP status mapping used in both directions: the
//! server derives a response status from the error kind, and the client
//! reconstructs the same kind from a remote status + envelope message, so the
//! reconciler never cares whether an endpoint is local or remote.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file '{0}' not found")]
    NotFound(String),

    #[error("file '{0}' already exists")]
    Conflict(String),

    #[error("file name '{0}' invalid")]
    InvalidName(String),

    #[error("blob format: {0}")]
    FormatIntegrity(String),

    #[error("unsatisfiable range '{spec}' for size {size}")]
    UnsatisfiableRange { spec: String, size: u64 },

    #[error("network: {0}")]
    Network(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("sync aborted on '{name}': {source}")]
    Aborted {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map to the HTTP status code the storage protocol reports for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::InvalidName(_) => 400,
            Error::UnsatisfiableRange { .. } => 416,
            _ => 500,
        }
    }

    /// Rebuild the taxonomy from a remote status code and envelope message.
    /// The name-bearing variants keep the remote message verbatim since the
    /// original name is already embedded in it.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            404 => Error::NotFound(message),
            409 => Error::Conflict(message),
            400 => Error::InvalidName(message),
            416 => Error::UnsatisfiableRange { spec: message, size: 0 },
            _ => Error::Network(message),
        }
    }

    pub fn format<S: Into<String>>(detail: S) -> Self {
        Error::FormatIntegrity(detail.into())
    }

    pub fn network<S: Into<String>>(detail: S) -> Self {
        Error::Network(detail.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Helper to wrap io errors with path context.
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(Error::NotFound("/a".into()).http_status(), 404);
        assert_eq!(Error::Conflict("/a".into()).http_status(), 409);
        assert_eq!(Error::InvalidName("/".into()).http_status(), 400);
        assert_eq!(
            Error::UnsatisfiableRange { spec: "bytes=9-1".into(), size: 5 }.http_status(),
            416
        );
        assert_eq!(Error::format("missing data section").http_status(), 500);
        assert_eq!(Error::Cancelled.http_status(), 500);
    }

    #[test]
    fn status_roundtrip() {
        let from = Error::from_status(404, "file '/a' not found".into());
        assert!(matches!(from, Error::NotFound(_)));
        assert!(matches!(Error::from_status(409, "x".into()), Error::Conflict(_)));
        assert!(matches!(Error::from_status(400, "x".into()), Error::InvalidName(_)));
        assert!(matches!(
            Error::from_status(416, "x".into()),
            Error::UnsatisfiableRange { .. }
        ));
        assert!(matches!(Error::from_status(500, "x".into()), Error::Network(_)));
    }
}
