//! Failure taxonomy shared by every pipeline.
//!
//! Pipelines translate engine and filesystem failures into [`ServiceError`];
//! the HTTP layer only has to map a variant to a status code.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The engine could not resolve the URL to metadata (private, deleted,
    /// region-blocked, malformed, network failure).
    #[error("could not extract metadata: {0}")]
    Extraction(String),

    /// The engine failed while retrieving media.
    #[error("download error: {0}")]
    Download(String),

    /// The archive was not on disk after assembly.
    #[error("failed to create archive at {}", path.display())]
    ArchiveCreation { path: PathBuf },

    /// The integrity scan found a damaged entry.
    #[error("archive {} is corrupted: {detail}", path.display())]
    ArchiveCorrupt { path: PathBuf, detail: String },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ServiceError {
    /// HTTP status class this failure is surfaced as.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Extraction(_) | Self::Download(_) => 400,
            Self::ArchiveCreation { .. } | Self::ArchiveCorrupt { .. } | Self::Unexpected(_) => 500,
        }
    }

    /// Short machine-readable label for response bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "extraction_error",
            Self::Download(_) => "download_error",
            Self::ArchiveCreation { .. } => "archive_creation_error",
            Self::ArchiveCorrupt { .. } => "archive_corrupt_error",
            Self::Unexpected(_) => "unexpected_error",
        }
    }

    /// Engine failure during a metadata-only call.
    pub fn from_extraction(err: EngineError) -> Self {
        match err {
            EngineError::Failed { .. } => Self::Extraction(err.to_string()),
            other => Self::Unexpected(other.to_string()),
        }
    }

    /// Engine failure while downloading media.
    pub fn from_download(err: EngineError) -> Self {
        match err {
            EngineError::Failed { .. } => Self::Download(err.to_string()),
            other => Self::Unexpected(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_failure() -> EngineError {
        EngineError::Failed {
            status: "exit status: 1".into(),
            stderr_tail: "ERROR: Private video".into(),
        }
    }

    #[test]
    fn client_errors_map_to_400() {
        assert_eq!(ServiceError::from_extraction(engine_failure()).status_code(), 400);
        assert_eq!(ServiceError::from_download(engine_failure()).status_code(), 400);
    }

    #[test]
    fn launch_failures_are_unexpected() {
        let err = ServiceError::from_download(EngineError::Spawn {
            program: "yt-dlp".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        });
        assert_eq!(err.kind(), "unexpected_error");
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn archive_errors_map_to_500() {
        let missing = ServiceError::ArchiveCreation {
            path: PathBuf::from("/tmp/x.zip"),
        };
        let corrupt = ServiceError::ArchiveCorrupt {
            path: PathBuf::from("/tmp/x.zip"),
            detail: "bad crc".into(),
        };
        assert_eq!(missing.status_code(), 500);
        assert_eq!(corrupt.status_code(), 500);
        assert!(corrupt.to_string().contains("bad crc"));
    }

    #[test]
    fn extraction_message_carries_stderr() {
        let err = ServiceError::from_extraction(engine_failure());
        assert!(err.to_string().contains("Private video"));
    }
}
