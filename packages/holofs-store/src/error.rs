//! Error types for holofs-store

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Path or version absent
    NotFound,
    /// Source id already mounted
    AlreadyMounted,
    /// Source id not mounted
    NotMounted,
    /// Path failed normalization
    InvalidPath,
    /// Mounted content rejected by validation
    UntrustedContent,
    /// Mounted source could not be read
    SourceUnavailable,
    /// Serialization/deserialization errors
    Serialization,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyMounted => "already_mounted",
            ErrorKind::NotMounted => "not_mounted",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::UntrustedContent => "untrusted_content",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::Serialization => "serialization",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, format!("Not found: {}", what.into()))
    }

    pub fn version_not_found(path: impl fmt::Display, sequence: u64) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("Version {} not found for {}", sequence, path),
        )
    }

    pub fn already_mounted(source_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::AlreadyMounted,
            format!("Source already mounted: {}", source_id.into()),
        )
    }

    pub fn not_mounted(source_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::NotMounted,
            format!("Source not mounted: {}", source_id.into()),
        )
    }

    pub fn invalid_path(path: impl Into<String>, reason: &str) -> Self {
        Self::new(
            ErrorKind::InvalidPath,
            format!("Invalid path '{}': {}", path.into(), reason),
        )
    }

    pub fn untrusted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UntrustedContent, message)
    }

    pub fn source_unavailable(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::SourceUnavailable,
            format!("Source {} unavailable: {}", source_id.into(), message),
        )
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("I/O error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("/artifacts/a.txt");
        let msg = format!("{}", err);
        assert!(msg.contains("not_found"));
        assert!(msg.contains("/artifacts/a.txt"));
    }

    #[test]
    fn test_mount_errors() {
        let err = StorageError::already_mounted("archive");
        assert_eq!(err.kind, ErrorKind::AlreadyMounted);
        assert_eq!(format!("{}", err), "[already_mounted] Source already mounted: archive");

        let err = StorageError::not_mounted("archive");
        assert_eq!(err.kind, ErrorKind::NotMounted);
        assert!(err.message.contains("archive"));
    }

    #[test]
    fn test_version_not_found() {
        let err = StorageError::version_not_found("/a", 7);
        assert!(err.is_not_found());
        assert_eq!(err.message, "Version 7 not found for /a");
    }

    #[test]
    fn test_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::source_unavailable("disk", "read failed").with_source(io_err);

        assert_eq!(err.kind, ErrorKind::SourceUnavailable);
        let source = err.source().unwrap();
        assert!(source.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io_err.into();
        assert_eq!(err.kind, ErrorKind::IO);
        assert!(err.source.is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
    }

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(ErrorKind::AlreadyMounted.as_str(), "already_mounted");
        assert_eq!(ErrorKind::NotMounted.as_str(), "not_mounted");
        assert_eq!(ErrorKind::InvalidPath.as_str(), "invalid_path");
        assert_eq!(ErrorKind::UntrustedContent.as_str(), "untrusted_content");
        assert_eq!(ErrorKind::SourceUnavailable.as_str(), "source_unavailable");
        assert_eq!(ErrorKind::Serialization.as_str(), "serialization");
        assert_eq!(ErrorKind::IO.as_str(), "io");
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(StorageError::not_found("x"))
        }

        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }

        let err = outer().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
