//! Error types for Kino Adaptive

use crate::types::MediaType;
use thiserror::Error;

/// Result type alias for streaming operations
pub type Result<T> = std::result::Result<T, Error>;

/// Streaming engine error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Segment request errors
    #[error("Segment request failed with HTTP status {status}: {url}")]
    SegmentHttp { url: String, status: u16 },

    #[error("Segment request timed out: {url}")]
    SegmentTimeout { url: String },

    #[error("Segment request failed while offline: {url}")]
    SegmentOffline { url: String },

    #[error("Segment integrity check failed: {url}")]
    SegmentIntegrity { url: String },

    #[error("Segment request failed: {url}: {message}")]
    SegmentRequest { url: String, message: String },

    #[error("Giving up on segment after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to parse segment: {0}")]
    SegmentParse(String),

    // Buffer errors
    #[error("{media_type} buffer rejected append: {message}")]
    BufferAppend {
        media_type: MediaType,
        message: String,
    },

    #[error("{media_type} buffer rejected removal of [{start}, {end}): {message}")]
    BufferRemove {
        media_type: MediaType,
        start: f64,
        end: f64,
        message: String,
    },

    #[error("{media_type} buffer sink has been disposed")]
    BufferDisposed { media_type: MediaType },

    // Timeline errors
    #[error("The wanted position {position}s is not found in the manifest")]
    MediaTimeNotFound { position: f64 },

    #[error("The current position {position}s is behind the earliest manifest time {minimum}s")]
    MediaTimeBeforeManifest { position: f64, minimum: f64 },

    #[error("The current position {position}s is after the latest manifest time {maximum}s")]
    MediaTimeAfterManifest { position: f64, maximum: f64 },

    // Selection errors
    #[error("No playable quality for {0}")]
    NoPlayableQuality(MediaType),

    // Control flow
    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if a retry may succeed where the last attempt failed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SegmentTimeout { .. }
                | Error::SegmentOffline { .. }
                | Error::SegmentIntegrity { .. }
                | Error::SegmentRequest { .. }
        ) || matches!(self, Error::SegmentHttp { status, .. } if is_retryable_status(*status))
    }

    /// Returns true if the error leaves a media pipeline in an inconsistent
    /// state and must stop it
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
            && !matches!(
                self,
                Error::Cancelled
                    | Error::MediaTimeBeforeManifest { .. }
                    | Error::MediaTimeAfterManifest { .. }
            )
    }

    /// Returns true for request failures caused by the lack of connectivity
    pub fn is_offline(&self) -> bool {
        matches!(self, Error::SegmentOffline { .. })
    }

    /// Returns the error code for telemetry
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::SegmentHttp { .. } => "SEGMENT_HTTP",
            Error::SegmentTimeout { .. } => "SEGMENT_TIMEOUT",
            Error::SegmentOffline { .. } => "SEGMENT_OFFLINE",
            Error::SegmentIntegrity { .. } => "INTEGRITY_ERROR",
            Error::SegmentRequest { .. } => "SEGMENT_REQUEST",
            Error::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Error::SegmentParse(_) => "SEGMENT_PARSE",
            Error::BufferAppend { .. } => "BUFFER_APPEND",
            Error::BufferRemove { .. } => "BUFFER_REMOVE",
            Error::BufferDisposed { .. } => "BUFFER_DISPOSED",
            Error::MediaTimeNotFound { .. } => "MEDIA_TIME_NOT_FOUND",
            Error::MediaTimeBeforeManifest { .. } => "MEDIA_TIME_BEFORE_MANIFEST",
            Error::MediaTimeAfterManifest { .. } => "MEDIA_TIME_AFTER_MANIFEST",
            Error::NoPlayableQuality(_) => "NO_PLAYABLE_QUALITY",
            Error::Cancelled => "CANCELLED",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

/// HTTP statuses worth retrying: server errors plus the few client errors a
/// CDN is known to return transiently.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 404 || status == 412 || status == 415
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        let not_found = Error::SegmentHttp {
            url: "https://cdn.example.com/seg1.m4s".into(),
            status: 404,
        };
        let forbidden = Error::SegmentHttp {
            url: "https://cdn.example.com/seg1.m4s".into(),
            status: 403,
        };
        assert!(not_found.is_recoverable());
        assert!(!forbidden.is_recoverable());
        assert!(forbidden.is_fatal());
    }

    #[test]
    fn test_warnings_are_not_fatal() {
        let early = Error::MediaTimeBeforeManifest {
            position: 1.0,
            minimum: 10.0,
        };
        assert!(!early.is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(Error::SegmentParse("truncated moof".into()).is_fatal());
    }

    #[test]
    fn test_exhausted_keeps_cause() {
        let err = Error::RetriesExhausted {
            attempts: 5,
            source: Box::new(Error::SegmentTimeout {
                url: "https://cdn.example.com/seg9.m4s".into(),
            }),
        };
        assert!(err.is_fatal());
        assert_eq!(err.error_code(), "RETRIES_EXHAUSTED");
        assert!(err.to_string().contains("5 attempts"));
    }
}
